// src/monitor/mod.rs

//! Process lifecycle monitor.
//!
//! ```text
//!  Idle ──start──▶ Starting ──init ok──▶ Listening ──stop + join──▶ Idle
//!                     │                      │
//!                     └──init fail──▶ Idle   └──channel fault──▶ Stopping ──▶ Idle
//! ```
//!
//! The controller side (`start_listening` / `stop_listening`) owns the
//! listener thread handle and the lifecycle lock.  The listener thread owns
//! the channel, the subscriptions and the sink, and is the only writer of
//! the `Listening → Stopping → Idle` transitions.  Callback dispatch has its
//! own lock (see [`callbacks`]) so a slow callback never blocks bookkeeping.

pub mod callbacks;
pub mod sink;
mod worker;

use crossbeam::channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use crate::comms::{
    events::{EventRecord, Subscription},
    ChannelProvider, StopSignal,
};
use crate::constants::{DEFAULT_LOG_TARGET, DEFAULT_POLL_INTERVAL, DEFAULT_START_TIMEOUT, LISTENER_THREAD_NAME};
use crate::error::{ErrorCode, Fault, MonitorError};
use crate::util::is_valid_process_name;

use self::callbacks::Callbacks;
use self::worker::StartReport;

// ============================================================================
// 0 ▸ Options + state
// ============================================================================

/// Tunables for one monitor instance.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// How long `start_listening` waits for the listener to confirm.
    pub start_timeout: Duration,
    /// Liveness poll of the listener's wait loop.
    pub poll_interval: Duration,
    /// `log` target for every record this monitor and its sink emit.
    pub log_target:    String,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            start_timeout: DEFAULT_START_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            log_target:    DEFAULT_LOG_TARGET.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Starting,
    Listening,
    Stopping,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// 1 ▸ State shared with the listener thread and the sink
// ============================================================================

pub(crate) struct Shared {
    state:          Mutex<MonitorState>,
    stop:           StopSignal,
    stop_requested: AtomicBool,
    callbacks:      Callbacks,
    target:         Arc<str>,
    worker_thread:  Mutex<Option<ThreadId>>,
}

impl Shared {
    fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    fn set_state(&self, next: MonitorState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev != next {
            procwatch_log!(log::Level::Debug, &self.target, "state {} → {}", prev, next);
        }
    }

    /// True on the listener thread and on any thread currently running one
    /// of our callbacks (WMI delivers on RPC threads, not the listener).
    fn on_listener_side(&self) -> bool {
        *self.worker_thread.lock() == Some(thread::current().id()) || self.callbacks.in_dispatch()
    }

    /// Route a parsed record to the user callback.
    pub(crate) fn trigger(&self, record: &EventRecord) {
        procwatch_log!(
            log::Level::Debug,
            &self.target,
            "{} event: {} (pid {})",
            record.kind,
            record.process_name,
            record.pid
        );
        self.callbacks.dispatch_event(&self.target, record);
    }

    /// Error trigger.  Disconnects during a requested stop are expected and
    /// only logged as warnings; critical codes also signal the stop handle.
    pub(crate) fn report(&self, fault: Fault) {
        let expected = fault.code.is_disconnect() && self.stop_requested.load(Ordering::SeqCst);
        if expected {
            procwatch_log!(log::Level::Warn, &self.target, "disconnect during shutdown: {}", fault);
        } else {
            procwatch_log!(log::Level::Error, &self.target, "{}", fault);
        }

        self.callbacks.dispatch_error(&self.target, &fault);

        if fault.code.is_critical() {
            procwatch_log!(
                log::Level::Warn,
                &self.target,
                "critical channel fault, stopping listener"
            );
            self.stop.set();
        }
    }
}

// ============================================================================
// 2 ▸ Monitor
// ============================================================================

struct Worker {
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    worker: Option<Worker>,
}

/// Watches named processes for creation and termination.
///
/// All lifecycle methods are meant for controller threads.  Calling
/// `start_listening` or `stop_listening` from the listener thread or from
/// inside a callback, whichever thread the backend delivers on, returns
/// [`MonitorError::CalledFromWorker`] instead of deadlocking.
pub struct ProcessMonitor<P: ChannelProvider> {
    provider:  Arc<P>,
    shared:    Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    // Separate from `lifecycle` so callbacks can read it during a join.
    watched:   Mutex<Vec<String>>,
    options:   MonitorOptions,
}

impl<P: ChannelProvider> ProcessMonitor<P> {
    pub fn new(provider: P) -> Self {
        Self::with_options(provider, MonitorOptions::default())
    }

    pub fn with_options(provider: P, options: MonitorOptions) -> Self {
        let shared = Arc::new(Shared {
            state:          Mutex::new(MonitorState::Idle),
            stop:           StopSignal::new(),
            stop_requested: AtomicBool::new(false),
            callbacks:      Callbacks::default(),
            target:         Arc::from(options.log_target.as_str()),
            worker_thread:  Mutex::new(None),
        });
        Self {
            provider: Arc::new(provider),
            shared,
            lifecycle: Mutex::new(Lifecycle::default()),
            watched: Mutex::new(Vec::new()),
            options,
        }
    }

    // ───── callbacks ─────────────────────────────────────────────────────

    /// Takes effect for subsequent deliveries.
    pub fn set_on_created<F>(&self, cb: F)
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        self.shared.callbacks.set_created(Some(Arc::new(cb)));
    }

    pub fn set_on_destroyed<F>(&self, cb: F)
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        self.shared.callbacks.set_destroyed(Some(Arc::new(cb)));
    }

    pub fn set_on_error<F>(&self, cb: F)
    where
        F: Fn(&Fault) + Send + Sync + 'static,
    {
        self.shared.callbacks.set_error(Some(Arc::new(cb)));
    }

    /// Revert all three slots to the log-only defaults.
    pub fn clear_callbacks(&self) {
        self.shared.callbacks.set_created(None);
        self.shared.callbacks.set_destroyed(None);
        self.shared.callbacks.set_error(None);
    }

    // ───── queries ───────────────────────────────────────────────────────

    pub fn is_listening(&self) -> bool {
        self.shared.state() == MonitorState::Listening
    }

    pub fn state(&self) -> MonitorState {
        self.shared.state()
    }

    /// Names of the current (or most recent) session.
    pub fn watched(&self) -> Vec<String> {
        self.watched.lock().clone()
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    // ───── start ─────────────────────────────────────────────────────────

    /// Spawn the listener, subscribe creation + deletion for every name and
    /// block until it confirms or `start_timeout` elapses.
    ///
    /// A [`MonitorError::PartialSubscription`] leaves the monitor listening
    /// for the names that did register.
    pub fn start_listening<S: AsRef<str>>(&self, names: &[S]) -> Result<(), MonitorError> {
        let target = &*self.shared.target;

        // 1 ─ guards that need no lock
        if self.shared.on_listener_side() {
            return Err(MonitorError::CalledFromWorker);
        }
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_owned()).collect();
        if let Some(bad) = names.iter().find(|n| !is_valid_process_name(n)) {
            return Err(MonitorError::InvalidProcessName(bad.clone()));
        }

        // 2 ─ state gate
        let mut lifecycle = self.lifecycle.lock();
        match self.shared.state() {
            MonitorState::Listening => return Err(MonitorError::AlreadyListening),
            MonitorState::Starting | MonitorState::Stopping => return Err(MonitorError::StillShuttingDown),
            MonitorState::Idle => {}
        }
        if let Some(previous) = lifecycle.worker.take() {
            // Idle means the previous listener already ran its shutdown path.
            if previous.handle.join().is_err() {
                procwatch_log!(log::Level::Warn, target, "previous listener had panicked");
            }
        }

        // 3 ─ fresh session
        self.shared.stop.reset();
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.set_state(MonitorState::Starting);
        *self.watched.lock() = names.clone();

        let (ready_tx, ready_rx) = bounded::<StartReport>(1);
        let provider = Arc::clone(&self.provider);
        let shared = Arc::clone(&self.shared);
        let poll = self.options.poll_interval;
        let spawned = thread::Builder::new()
            .name(LISTENER_THREAD_NAME.into())
            .spawn(move || worker::run(provider, shared, names, poll, ready_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.set_state(MonitorState::Idle);
                return Err(MonitorError::Spawn(e));
            }
        };

        // 4 ─ rendezvous
        match ready_rx.recv_timeout(self.options.start_timeout) {
            Ok(Ok(failed)) if failed.is_empty() => {
                lifecycle.worker = Some(Worker { handle });
                procwatch_log!(log::Level::Info, target, "listening for {:?}", self.watched());
                Ok(())
            }
            Ok(Ok(failed)) => {
                lifecycle.worker = Some(Worker { handle });
                procwatch_log!(
                    log::Level::Warn,
                    target,
                    "listening with {} failed subscription(s)",
                    failed.len()
                );
                Err(MonitorError::PartialSubscription { failed })
            }
            Ok(Err(code)) => {
                // The listener unwinds on its own; reap it now.
                let _ = handle.join();
                Err(MonitorError::Initialization(code))
            }
            Err(RecvTimeoutError::Timeout) => {
                procwatch_log!(
                    log::Level::Error,
                    target,
                    "listener did not confirm within {:?}; asking it to stop",
                    self.options.start_timeout
                );
                self.shared.stop_requested.store(true, Ordering::SeqCst);
                self.shared.stop.set();
                lifecycle.worker = Some(Worker { handle });
                Err(MonitorError::StartTimeout(self.options.start_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let panicked = handle.join().is_err();
                self.shared.set_state(MonitorState::Idle);
                if panicked {
                    Err(MonitorError::WorkerPanicked)
                } else {
                    Err(MonitorError::Initialization(ErrorCode::E_FAIL))
                }
            }
        }
    }

    // ───── stop ──────────────────────────────────────────────────────────

    /// Signal the listener and join it.  A no-op when nothing is running.
    /// The listener itself performs the transition back to `Idle`.
    pub fn stop_listening(&self) -> Result<(), MonitorError> {
        if self.shared.on_listener_side() {
            return Err(MonitorError::CalledFromWorker);
        }

        let mut lifecycle = self.lifecycle.lock();
        let Some(worker) = lifecycle.worker.take() else {
            return Ok(());
        };

        procwatch_log!(log::Level::Info, &self.shared.target, "stopping listener");
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.stop.set();

        if worker.handle.join().is_err() {
            self.shared.set_state(MonitorState::Idle);
            return Err(MonitorError::WorkerPanicked);
        }
        procwatch_log!(log::Level::Info, &self.shared.target, "listener stopped");
        Ok(())
    }
}

impl<P: ChannelProvider> Drop for ProcessMonitor<P> {
    fn drop(&mut self) {
        if self.shared.on_listener_side() {
            // Last handle released from a callback: joining here would wait
            // on ourselves, so signal and let the listener unwind detached.
            procwatch_log!(
                log::Level::Warn,
                &self.shared.target,
                "monitor dropped from a callback; listener will stop detached"
            );
            self.shared.stop_requested.store(true, Ordering::SeqCst);
            self.shared.stop.set();
            return;
        }
        if let Err(e) = self.stop_listening() {
            procwatch_log!(log::Level::Warn, &self.shared.target, "stop on drop: {}", e);
        }
    }
}

impl<P: ChannelProvider> fmt::Debug for ProcessMonitor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("state", &self.state())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Subscriptions a session registers for `names`, in registration order.
pub fn subscriptions_for<S: AsRef<str>>(names: &[S]) -> Vec<Subscription> {
    names
        .iter()
        .flat_map(|name| {
            crate::comms::events::EventKind::ALL
                .into_iter()
                .map(move |kind| Subscription::new(kind, name.as_ref()))
        })
        .collect()
}
