// src/monitor/sink.rs

//! Event sink adapter.
//!
//! The channel hands every raw delivery and status update to an
//! [`EventSink`].  The sink parses defensively, reports per-object problems
//! as delivery faults and always answers `S_OK` so the service keeps
//! delivering.  It holds only a weak reference to the monitor state and is
//! detached during shutdown; late deliveries after that are dropped.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use crate::comms::{
    events::{EventKind, EventRecord},
    object::{EventObject, Property},
    StatusFlags,
};
use crate::constants::{PROP_CLASS, PROP_NAME, PROP_PROCESS_ID, PROP_TARGET_INSTANCE};
use crate::error::{ErrorCode, Fault, FaultKind};
use crate::monitor::Shared;

pub struct EventSink {
    monitor:  Weak<Shared>,
    target:   Arc<str>,
    attached: AtomicBool,
}

impl EventSink {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            monitor:  Arc::downgrade(shared),
            target:   Arc::clone(&shared.target),
            attached: AtomicBool::new(true),
        }
    }

    /// Cut the back-reference.  Called on the listener thread before the
    /// channel releases the sink.
    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    fn monitor(&self) -> Option<Arc<Shared>> {
        if !self.attached.load(Ordering::SeqCst) {
            return None;
        }
        self.monitor.upgrade()
    }

    // ───── entry point 1: deliveries ─────────────────────────────────────

    /// Parse and dispatch a batch.  Malformed objects are reported and
    /// skipped; the rest of the batch still goes through.
    pub fn deliver(&self, objects: &[&dyn EventObject]) -> ErrorCode {
        let Some(monitor) = self.monitor() else {
            procwatch_log!(
                log::Level::Debug,
                &self.target,
                "dropping {} object(s) delivered after detach",
                objects.len()
            );
            return ErrorCode::S_OK;
        };

        for (idx, object) in objects.iter().enumerate() {
            match parse(*object) {
                Ok((record, pid_fault)) => {
                    if let Some(code) = pid_fault {
                        monitor.report(Fault::new(
                            FaultKind::Delivery,
                            code,
                            format!(
                                "object {idx}: ProcessId unreadable for '{}', delivering pid 0",
                                record.process_name
                            ),
                        ));
                    }
                    monitor.trigger(&record);
                }
                Err((code, why)) => {
                    monitor.report(Fault::new(FaultKind::Delivery, code, format!("object {idx}: {why}")));
                }
            }
        }
        ErrorCode::S_OK
    }

    // ───── entry point 2: status updates ─────────────────────────────────

    /// Only a final failed status is actionable; cancellation is expected
    /// during teardown and swallowed.
    pub fn status_update(&self, flags: StatusFlags, code: ErrorCode, description: Option<&str>) -> ErrorCode {
        let description = description.unwrap_or("no description");
        if flags != StatusFlags::Complete {
            procwatch_log!(log::Level::Debug, &self.target, "status {:?} {}: {}", flags, code, description);
            return ErrorCode::S_OK;
        }
        if !code.is_failure() {
            procwatch_log!(log::Level::Debug, &self.target, "query completed: {}", description);
            return ErrorCode::S_OK;
        }
        if code.is_cancellation() {
            procwatch_log!(log::Level::Debug, &self.target, "query cancelled: {}", description);
            return ErrorCode::S_OK;
        }

        let Some(monitor) = self.monitor() else {
            return ErrorCode::S_OK;
        };
        let kind = if code.is_critical() || code.is_disconnect() {
            FaultKind::Channel
        } else {
            FaultKind::Subscription
        };
        monitor.report(Fault::new(kind, code, format!("query failed: {description}")));
        ErrorCode::S_OK
    }
}

/// Successful parse yields the record plus the code of a degraded pid read.
type Parsed = (EventRecord, Option<ErrorCode>);

fn parse(object: &dyn EventObject) -> Result<Parsed, (ErrorCode, String)> {
    // 1 ─ event class → direction
    let class = match object.get(PROP_CLASS) {
        Ok(Property::Str(class)) => class,
        Ok(other) => {
            return Err((ErrorCode::WBEM_E_TYPE_MISMATCH, format!("__CLASS is {}", other.type_name())));
        }
        Err(code) => return Err((code, "__CLASS unreadable".into())),
    };
    let kind = EventKind::from_event_class(&class)
        .ok_or_else(|| (ErrorCode::WBEM_E_INVALID_CLASS, format!("unexpected event class '{class}'")))?;

    // 2 ─ nested process instance
    let target = match object.get(PROP_TARGET_INSTANCE) {
        Ok(Property::Object(target)) => target,
        Ok(other) => {
            return Err((
                ErrorCode::WBEM_E_TYPE_MISMATCH,
                format!("TargetInstance is {}", other.type_name()),
            ));
        }
        Err(code) => return Err((code, "TargetInstance unreadable".into())),
    };

    // 3 ─ name (required)
    let name = match target.get(PROP_NAME) {
        Ok(Property::Str(name)) => name,
        Ok(other) => return Err((ErrorCode::WBEM_E_TYPE_MISMATCH, format!("Name is {}", other.type_name()))),
        Err(code) => return Err((code, "Name unreadable".into())),
    };

    // 4 ─ pid (degrades to 0)
    let (pid, pid_fault) = match target.get(PROP_PROCESS_ID) {
        Ok(Property::U32(pid)) => (pid, None),
        Ok(Property::I32(pid)) => (pid as u32, None),
        Ok(_) => (0, Some(ErrorCode::WBEM_E_TYPE_MISMATCH)),
        Err(code) => (0, Some(code)),
    };

    Ok((EventRecord::new(kind, name, pid), pid_fault))
}
