// src/monitor/callbacks.rs

//! User callback slots and the panic-safe dispatch path.
//!
//! Slots are swapped under a short `RwLock`; dispatch clones the `Arc` out,
//! drops the slot lock, then runs the callback under the dispatch lock.  A
//! setter therefore never waits on a slow callback, and a callback may
//! replace any slot (including its own) without deadlocking.

use parking_lot::{ReentrantMutex, RwLock};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::comms::events::{EventKind, EventRecord};
use crate::error::Fault;

pub type ProcessCallback = Arc<dyn Fn(&str, u32) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Fault) + Send + Sync>;

#[derive(Default)]
pub struct Callbacks {
    created:   RwLock<Option<ProcessCallback>>,
    destroyed: RwLock<Option<ProcessCallback>>,
    error:     RwLock<Option<ErrorCallback>>,
    /// Serialises every trigger.  Re-entrant so a callback that ends up
    /// dispatching again on the same thread does not self-deadlock.
    dispatch:  ReentrantMutex<()>,
}

impl Callbacks {
    pub fn set_created(&self, cb: Option<ProcessCallback>) {
        *self.created.write() = cb;
    }

    pub fn set_destroyed(&self, cb: Option<ProcessCallback>) {
        *self.destroyed.write() = cb;
    }

    pub fn set_error(&self, cb: Option<ErrorCallback>) {
        *self.error.write() = cb;
    }

    /// Whether the calling thread is inside a trigger right now.  Covers
    /// backends that deliver on their own threads instead of the listener's.
    pub fn in_dispatch(&self) -> bool {
        self.dispatch.is_owned_by_current_thread()
    }

    /// Hand one record to the matching callback, or log it when none is set.
    pub fn dispatch_event(&self, target: &str, record: &EventRecord) {
        let slot = match record.kind {
            EventKind::Created => &self.created,
            EventKind::Destroyed => &self.destroyed,
        };
        let cb = slot.read().clone();

        let _guard = self.dispatch.lock();
        match cb {
            Some(cb) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    cb(record.process_name.as_str(), record.pid)
                }));
                if let Err(payload) = outcome {
                    procwatch_log!(
                        log::Level::Error,
                        target,
                        "{} callback for '{}' (pid {}) panicked: {}",
                        record.kind,
                        record.process_name,
                        record.pid,
                        panic_message(&*payload)
                    );
                }
            }
            None => procwatch_log!(
                log::Level::Info,
                target,
                "process {}: {} (pid {})",
                record.kind,
                record.process_name,
                record.pid
            ),
        }
    }

    /// Hand a fault to the error callback; `false` when no callback is set.
    pub fn dispatch_error(&self, target: &str, fault: &Fault) -> bool {
        let Some(cb) = self.error.read().clone() else {
            return false;
        };

        let _guard = self.dispatch.lock();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb(fault))) {
            procwatch_log!(
                log::Level::Error,
                target,
                "error callback panicked while handling [{}]: {}",
                fault,
                panic_message(&*payload)
            );
        }
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
