// src/monitor/worker.rs

//! Listener thread body: open → bind → subscribe → confirm → wait loop →
//! shutdown.  The channel never leaves this function, so every backend call
//! (including teardown on drop) happens on this one thread.

use crossbeam::channel::Sender;
use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use crate::comms::{
    events::Subscription,
    ChannelProvider, NotificationChannel, WaitOutcome,
};
use crate::error::{ErrorCode, Fault, FaultKind};
use crate::monitor::{sink::EventSink, subscriptions_for, MonitorState, Shared};

/// `Ok(failed subscriptions)` once listening, `Err(code)` if setup aborted.
pub(super) type StartReport = Result<Vec<Subscription>, ErrorCode>;

pub(super) fn run<P: ChannelProvider>(
    provider: Arc<P>,
    shared:   Arc<Shared>,
    names:    Vec<String>,
    poll:     Duration,
    ready:    Sender<StartReport>,
) {
    *shared.worker_thread.lock() = Some(thread::current().id());
    let target = Arc::clone(&shared.target);

    // 1 ─ channel + namespace
    let mut channel = match provider.open() {
        Ok(channel) => channel,
        Err(code) => {
            abort_start(&shared, &ready, code, "opening notification channel");
            return;
        }
    };

    // 2 ─ sink
    let sink = Arc::new(EventSink::new(&shared));
    if let Err(code) = channel.bind_sink(Arc::clone(&sink)) {
        drop(channel);
        abort_start(&shared, &ready, code, "binding event sink");
        return;
    }

    // 3 ─ one creation + one deletion query per name
    let mut failed = Vec::new();
    let mut fatal = None;
    for subscription in subscriptions_for(&names) {
        match channel.subscribe(&subscription) {
            Ok(()) => procwatch_log!(log::Level::Debug, &target, "subscribed to {}", subscription),
            Err(code) => {
                shared.report(Fault::subscription(code, &subscription));
                failed.push(subscription);
                if code.is_critical() {
                    // `report` already signalled stop; the channel is gone.
                    fatal = Some(code);
                    break;
                }
            }
        }
    }

    // 4 ─ confirm, unless setup hit a critical fault or the controller gave up
    if let Some(code) = fatal {
        procwatch_log!(log::Level::Error, &target, "setup aborted by critical fault {}", code);
        let _ = ready.send(Err(code));
    } else if shared.stop.is_set() {
        procwatch_log!(log::Level::Warn, &target, "stop requested before listening was confirmed");
    } else {
        shared.set_state(MonitorState::Listening);
        // The controller may have timed out and dropped the receiver.
        let _ = ready.send(Ok(failed));

        // 5 ─ wait loop
        loop {
            match channel.wait(&shared.stop, poll) {
                WaitOutcome::Stopped => break,
                WaitOutcome::TimedOut | WaitOutcome::Dispatched => {
                    if shared.stop.is_set() {
                        break;
                    }
                }
                WaitOutcome::Disconnected => {
                    shared.report(Fault::new(
                        FaultKind::Channel,
                        ErrorCode::RPC_E_DISCONNECTED,
                        "notification service disconnected",
                    ));
                    break;
                }
                WaitOutcome::Failed(code) => {
                    shared.report(Fault::new(FaultKind::Channel, code, "waiting for notifications"));
                    break;
                }
            }
        }
    }

    // 6 ─ shutdown, exactly once
    shared.set_state(MonitorState::Stopping);
    match channel.cancel_all() {
        Ok(()) => procwatch_log!(log::Level::Debug, &target, "outstanding queries cancelled"),
        Err(code) if code == ErrorCode::WBEM_E_INVALID_OPERATION => {
            procwatch_log!(log::Level::Debug, &target, "no outstanding queries to cancel");
        }
        // `report` downgrades a disconnect during a requested stop to a warning.
        Err(code) => shared.report(Fault::new(FaultKind::Channel, code, "cancelling outstanding queries")),
    }
    sink.detach();
    channel.release_sink();
    drop(sink);
    drop(channel);

    if !shared.stop_requested.load(Ordering::SeqCst) {
        procwatch_log!(log::Level::Info, &target, "listener exited on its own");
    }
    shared.set_state(MonitorState::Idle);
}

fn abort_start(shared: &Shared, ready: &Sender<StartReport>, code: ErrorCode, step: &str) {
    shared.report(Fault::new(FaultKind::Initialization, code, step));
    shared.set_state(MonitorState::Idle);
    let _ = ready.send(Err(code));
}
