//! # Monitor Lifecycle Tests
//!
//! Drives `ProcessMonitor` against the simulated notification service and
//! checks the start/stop state machine, callback routing and fault policy.
//!
//! ## Covered Scenarios:
//!
//! - start / is_listening agreement, idempotent stop, stop without start
//! - creation and deletion routing, unwatched names, malformed pids
//! - partial subscription failure (`b.exe` creation rejected)
//! - channel faults returning the monitor to `Idle`, followed by a restart
//! - initialisation failures, start timeouts and "still shutting down"
//! - lifecycle calls from inside callbacks, panicking callbacks, drop
//!   (including the last handle released from inside a callback)
//! - wait failures, critical setup faults, disconnects during a requested stop
//! - `cheat.exe` creation followed by delayed remediation

use crossbeam::channel::{after, tick, unbounded, Receiver};
use parking_lot::Mutex;
use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use procwatch::comms::simulated::{Call, SimulatedService};
use procwatch::comms::{ClassObject, StatusFlags};
use procwatch::remediation::{self, DirectRemediator, ProcessControl, ProcessTarget, Remediator};
use procwatch::{ErrorCode, EventKind, Fault, FaultKind, MonitorError, MonitorOptions, MonitorState, ProcessMonitor, Subscription};

const RECV: Duration = Duration::from_secs(5);

fn options() -> MonitorOptions {
    MonitorOptions {
        start_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        log_target:    "procwatch::test".into(),
    }
}

struct Harness {
    service:   SimulatedService,
    monitor:   ProcessMonitor<SimulatedService>,
    created:   Receiver<(String, u32)>,
    destroyed: Receiver<(String, u32)>,
    errors:    Receiver<Fault>,
}

fn harness_with(opts: MonitorOptions) -> Harness {
    let service = SimulatedService::new();
    let monitor = ProcessMonitor::with_options(service.clone(), opts);

    let (created_tx, created) = unbounded();
    let (destroyed_tx, destroyed) = unbounded();
    let (errors_tx, errors) = unbounded();
    monitor.set_on_created(move |name, pid| {
        let _ = created_tx.send((name.to_owned(), pid));
    });
    monitor.set_on_destroyed(move |name, pid| {
        let _ = destroyed_tx.send((name.to_owned(), pid));
    });
    monitor.set_on_error(move |fault| {
        let _ = errors_tx.send(fault.clone());
    });

    Harness { service, monitor, created, destroyed, errors }
}

fn harness() -> Harness {
    harness_with(options())
}

/// Re-checks `cond` on a ticker until it holds or `within` elapses.
fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let ticks = tick(Duration::from_millis(5));
    let deadline = after(within);
    loop {
        if cond() {
            return true;
        }
        crossbeam::select! {
            recv(ticks) -> _ => {}
            recv(deadline) -> _ => return cond(),
        }
    }
}

fn wait_for_state<P: procwatch::comms::ChannelProvider>(
    monitor: &ProcessMonitor<P>,
    state: MonitorState,
    within: Duration,
) -> bool {
    eventually(within, || monitor.state() == state)
}

const TEARDOWN: [Call; 3] = [Call::CancelAll, Call::ReleaseSink, Call::Close];

// ───── start / stop ─────────────────────────────────────────────────────────

#[test]
fn start_result_matches_is_listening() {
    let h = harness();
    let result = h.monitor.start_listening(&["a.exe", "b.exe"]);
    assert_eq!(result.is_ok(), h.monitor.is_listening());
    assert!(result.is_ok());
    assert_eq!(h.monitor.watched(), vec!["a.exe".to_string(), "b.exe".to_string()]);

    h.monitor.stop_listening().unwrap();
    assert_eq!(h.monitor.state(), MonitorState::Idle);
}

#[test]
fn empty_name_list_listens_to_nothing() {
    let h = harness();
    h.monitor.start_listening::<&str>(&[]).unwrap();
    assert!(h.monitor.is_listening());
    assert!(!h.service.calls().iter().any(|c| matches!(c, Call::Subscribe(_))));
    h.monitor.stop_listening().unwrap();
}

#[test]
fn stop_is_idempotent() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(h.monitor.stop_listening().is_ok());

    let t0 = Instant::now();
    assert!(h.monitor.stop_listening().is_ok());
    assert!(t0.elapsed() < Duration::from_secs(1));
}

#[test]
fn stop_without_start_makes_no_backend_calls() {
    let h = harness();
    assert!(h.monitor.stop_listening().is_ok());
    assert!(h.service.calls().is_empty());
}

#[test]
fn second_start_is_rejected_while_listening() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(matches!(h.monitor.start_listening(&["a.exe"]), Err(MonitorError::AlreadyListening)));
    assert!(h.monitor.is_listening());
    h.monitor.stop_listening().unwrap();
}

#[test]
fn invalid_names_are_rejected_before_any_backend_call() {
    let h = harness();
    let err = h.monitor.start_listening(&["ok.exe", r"C:\bad.exe"]).unwrap_err();
    assert!(matches!(err, MonitorError::InvalidProcessName(name) if name == r"C:\bad.exe"));
    assert!(h.service.calls().is_empty());
    assert_eq!(h.monitor.state(), MonitorState::Idle);
}

#[test]
fn backend_calls_follow_setup_and_teardown_order() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.monitor.stop_listening().unwrap();

    assert_eq!(
        h.service.calls(),
        vec![
            Call::Open,
            Call::BindSink,
            Call::Subscribe(Subscription::new(EventKind::Created, "a.exe")),
            Call::Subscribe(Subscription::new(EventKind::Destroyed, "a.exe")),
            Call::CancelAll,
            Call::ReleaseSink,
            Call::Close,
        ]
    );
    assert!(h.errors.try_recv().is_err(), "clean stop must not report faults");
}

#[test]
fn deliveries_after_stop_are_not_accepted() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.monitor.stop_listening().unwrap();
    assert!(!h.service.emit_created("a.exe", 1));
    assert!(h.created.try_recv().is_err());
}

#[test]
fn restart_after_stop_succeeds() {
    let h = harness();
    for _ in 0..3 {
        h.monitor.start_listening(&["a.exe"]).unwrap();
        assert!(h.service.emit_created("a.exe", 5));
        assert_eq!(h.created.recv_timeout(RECV).unwrap(), ("a.exe".to_string(), 5));
        h.monitor.stop_listening().unwrap();
    }
}

#[test]
fn drop_stops_the_listener() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    let Harness { service, monitor, .. } = h;
    drop(monitor);
    assert!(!service.is_connected());
    assert_eq!(service.calls().last(), Some(&Call::Close));
}

#[test]
fn dropping_the_last_handle_inside_a_callback_still_tears_down() {
    let Harness { service, monitor, .. } = harness();
    let monitor = Arc::new(monitor);
    let weak = Arc::downgrade(&monitor);
    let (holding_tx, holding) = unbounded();
    let (release_tx, release) = unbounded::<()>();
    monitor.set_on_created(move |_, _| {
        let strong = weak.upgrade();
        let _ = holding_tx.send(strong.is_some());
        let _ = release.recv_timeout(RECV);
        // last strong reference goes away on the listener thread
        drop(strong);
    });

    monitor.start_listening(&["a.exe"]).unwrap();
    assert!(service.emit_created("a.exe", 1));
    assert!(holding.recv_timeout(RECV).unwrap());
    drop(monitor);
    release_tx.send(()).unwrap();

    assert!(eventually(RECV, || service.calls().last() == Some(&Call::Close)));
    assert!(service.calls().ends_with(&TEARDOWN));
    assert!(!service.is_connected());
}

// ───── delivery ─────────────────────────────────────────────────────────────

#[test]
fn created_event_invokes_on_created_once() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(h.service.emit_created("a.exe", 77));

    assert_eq!(h.created.recv_timeout(RECV).unwrap(), ("a.exe".to_string(), 77));
    h.monitor.stop_listening().unwrap();

    assert!(h.created.try_recv().is_err());
    assert!(h.destroyed.try_recv().is_err());
}

#[test]
fn destroyed_event_invokes_on_destroyed() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(h.service.emit_destroyed("A.EXE", 78));

    assert_eq!(h.destroyed.recv_timeout(RECV).unwrap(), ("A.EXE".to_string(), 78));
    h.monitor.stop_listening().unwrap();
    assert!(h.created.try_recv().is_err());
}

#[test]
fn unwatched_names_are_not_delivered() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.service.emit_created("other.exe", 1);
    h.service.emit_created("a.exe", 2);

    assert_eq!(h.created.recv_timeout(RECV).unwrap(), ("a.exe".to_string(), 2));
    h.monitor.stop_listening().unwrap();
    assert!(h.created.try_recv().is_err());
}

#[test]
fn missing_pid_is_delivered_as_zero() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    let malformed = ClassObject::new("__InstanceCreationEvent")
        .with("TargetInstance", ClassObject::new("Win32_Process").with("Name", "a.exe"));
    assert!(h.service.inject_batch(vec![malformed]));

    assert_eq!(h.created.recv_timeout(RECV).unwrap(), ("a.exe".to_string(), 0));
    let fault = h.errors.recv_timeout(RECV).unwrap();
    assert_eq!(fault.kind, FaultKind::Delivery);
    assert!(h.monitor.is_listening());
    h.monitor.stop_listening().unwrap();
}

#[test]
fn callbacks_can_be_replaced_while_listening() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();

    let (tx, rx) = unbounded();
    h.monitor.set_on_created(move |_, pid| {
        let _ = tx.send(pid);
    });
    h.service.emit_created("a.exe", 9);
    assert_eq!(rx.recv_timeout(RECV).unwrap(), 9);
    h.monitor.stop_listening().unwrap();
    assert!(h.created.try_recv().is_err());
}

#[test]
fn panicking_callback_does_not_stop_listening() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.monitor.set_on_created(|_, _| panic!("callback failure"));
    h.service.emit_created("a.exe", 1);

    let (tx, rx) = unbounded();
    h.monitor.set_on_created(move |_, pid| {
        let _ = tx.send(pid);
    });
    h.service.emit_created("a.exe", 2);
    assert_eq!(rx.recv_timeout(RECV).unwrap(), 2);
    assert!(h.monitor.is_listening());
    h.monitor.stop_listening().unwrap();
}

#[test]
fn lifecycle_calls_from_a_callback_are_rejected() {
    let h = harness();
    let monitor = Arc::new(h.monitor);
    let weak = Arc::downgrade(&monitor);
    let (tx, rx) = unbounded();
    monitor.set_on_created(move |_, _| {
        if let Some(m) = weak.upgrade() {
            let stop = m.stop_listening();
            let start = m.start_listening(&["x.exe"]);
            let _ = tx.send((stop, start));
        }
    });

    monitor.start_listening(&["a.exe"]).unwrap();
    h.service.emit_created("a.exe", 1);
    let (stop, start) = rx.recv_timeout(RECV).unwrap();
    assert!(matches!(stop, Err(MonitorError::CalledFromWorker)));
    assert!(matches!(start, Err(MonitorError::CalledFromWorker)));
    assert!(monitor.is_listening());

    monitor.stop_listening().unwrap();
    monitor.clear_callbacks();
}

// ───── failures ─────────────────────────────────────────────────────────────

#[test]
fn partial_subscription_failure_keeps_remaining_names() {
    let h = harness();
    h.service
        .fail_subscription(EventKind::Created, "b.exe", ErrorCode::WBEM_E_INVALID_QUERY);

    let err = h.monitor.start_listening(&["a.exe", "b.exe"]).unwrap_err();
    let MonitorError::PartialSubscription { failed } = err else {
        panic!("expected partial subscription, got {err:?}");
    };
    assert_eq!(failed, vec![Subscription::new(EventKind::Created, "b.exe")]);

    // a.exe still delivers
    assert!(h.service.emit_created("a.exe", 10));
    assert_eq!(h.created.recv_timeout(RECV).unwrap(), ("a.exe".to_string(), 10));

    // exactly one error, naming b.exe and the direction
    let fault = h.errors.recv_timeout(RECV).unwrap();
    assert_eq!(fault.kind, FaultKind::Subscription);
    assert_eq!(fault.code, ErrorCode::WBEM_E_INVALID_QUERY);
    assert!(fault.context.contains("b.exe") && fault.context.contains("creation"));

    h.monitor.stop_listening().unwrap();
    assert!(h.errors.try_recv().is_err());
}

#[test]
fn critical_status_returns_monitor_to_idle_then_restarts() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(h.service.inject_status(
        StatusFlags::Complete,
        ErrorCode::WBEM_E_TRANSPORT_FAILURE,
        Some("transport lost")
    ));

    assert!(wait_for_state(&h.monitor, MonitorState::Idle, Duration::from_secs(1)));
    let fault = h.errors.recv_timeout(RECV).unwrap();
    assert_eq!(fault.kind, FaultKind::Channel);
    assert_eq!(fault.code, ErrorCode::WBEM_E_TRANSPORT_FAILURE);

    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(h.monitor.is_listening());
    h.monitor.stop_listening().unwrap();
}

#[test]
fn disconnect_returns_monitor_to_idle() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(h.service.inject_disconnect());

    assert!(wait_for_state(&h.monitor, MonitorState::Idle, Duration::from_secs(1)));
    let fault = h.errors.recv_timeout(RECV).unwrap();
    assert_eq!(fault.kind, FaultKind::Channel);
    assert_eq!(fault.code, ErrorCode::RPC_E_DISCONNECTED);

    // stop after an autonomous exit just reaps the thread
    assert!(h.monitor.stop_listening().is_ok());
}

#[test]
fn cancelled_status_is_swallowed() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.service
        .inject_status(StatusFlags::Complete, ErrorCode::WBEM_E_CALL_CANCELLED, None);
    h.service.emit_created("a.exe", 3);
    assert_eq!(h.created.recv_timeout(RECV).unwrap(), ("a.exe".to_string(), 3));
    assert!(h.errors.try_recv().is_err());
    assert!(h.monitor.is_listening());
    h.monitor.stop_listening().unwrap();
}

#[test]
fn critical_error_status_stops_listener_without_explicit_stop() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(h.service.inject_status(StatusFlags::Complete, ErrorCode::WBEM_E_CRITICAL_ERROR, None));

    let fault = h.errors.recv_timeout(RECV).unwrap();
    assert_eq!(fault.kind, FaultKind::Channel);
    assert_eq!(fault.code, ErrorCode::WBEM_E_CRITICAL_ERROR);
    assert!(wait_for_state(&h.monitor, MonitorState::Idle, Duration::from_secs(1)));
    assert!(h.service.calls().ends_with(&TEARDOWN));

    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.monitor.stop_listening().unwrap();
}

#[test]
fn wait_failure_is_a_channel_fault_and_returns_to_idle() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    assert!(h.service.inject_wait_failure(ErrorCode::E_FAIL));

    let fault = h.errors.recv_timeout(RECV).unwrap();
    assert_eq!(fault.kind, FaultKind::Channel);
    assert_eq!(fault.code, ErrorCode::E_FAIL);
    assert!(wait_for_state(&h.monitor, MonitorState::Idle, Duration::from_secs(1)));
    assert!(!h.service.is_connected());

    assert!(h.monitor.stop_listening().is_ok());
    assert!(h.errors.try_recv().is_err());
}

#[test]
fn disconnect_during_requested_stop_still_reaches_error_callback() {
    let h = harness();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.service.fail_cancel(ErrorCode::RPC_E_DISCONNECTED);

    h.monitor.stop_listening().unwrap();
    assert_eq!(h.monitor.state(), MonitorState::Idle);

    let fault = h.errors.recv_timeout(RECV).unwrap();
    assert_eq!(fault.kind, FaultKind::Channel);
    assert_eq!(fault.code, ErrorCode::RPC_E_DISCONNECTED);
    assert!(h.errors.try_recv().is_err());
}

#[test]
fn critical_subscription_failure_is_an_initialization_error() {
    let h = harness();
    h.service
        .fail_subscription(EventKind::Created, "b.exe", ErrorCode::WBEM_E_TRANSPORT_FAILURE);

    let err = h.monitor.start_listening(&["a.exe", "b.exe"]).unwrap_err();
    assert!(
        matches!(err, MonitorError::Initialization(code) if code == ErrorCode::WBEM_E_TRANSPORT_FAILURE)
    );
    assert_eq!(h.monitor.state(), MonitorState::Idle);
    assert!(!h.service.is_connected());
    assert!(h.service.calls().ends_with(&TEARDOWN));
    // b.exe's deletion query is never attempted once the transport is gone
    assert!(!h.service.calls().contains(&Call::Subscribe(Subscription::new(EventKind::Destroyed, "b.exe"))));

    let fault = h.errors.recv_timeout(RECV).unwrap();
    assert_eq!(fault.kind, FaultKind::Subscription);
    assert_eq!(fault.code, ErrorCode::WBEM_E_TRANSPORT_FAILURE);
    assert!(h.errors.try_recv().is_err());

    h.service.clear_failures();
    h.monitor.start_listening(&["a.exe", "b.exe"]).unwrap();
    h.monitor.stop_listening().unwrap();
}

#[test]
fn open_failure_is_an_initialization_error() {
    let h = harness();
    h.service.fail_open(ErrorCode::E_ACCESSDENIED);

    let err = h.monitor.start_listening(&["a.exe"]).unwrap_err();
    assert!(matches!(err, MonitorError::Initialization(code) if code == ErrorCode::E_ACCESSDENIED));
    assert_eq!(h.monitor.state(), MonitorState::Idle);
    assert_eq!(h.service.calls(), vec![Call::Open]);
    assert_eq!(h.errors.recv_timeout(RECV).unwrap().kind, FaultKind::Initialization);

    h.service.clear_failures();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.monitor.stop_listening().unwrap();
}

#[test]
fn bind_failure_releases_the_channel() {
    let h = harness();
    h.service.fail_bind(ErrorCode::E_FAIL);

    let err = h.monitor.start_listening(&["a.exe"]).unwrap_err();
    assert!(matches!(err, MonitorError::Initialization(_)));
    assert_eq!(h.service.calls(), vec![Call::Open, Call::BindSink, Call::Close]);
    assert!(!h.service.is_connected());
}

#[test]
fn start_timeout_then_still_shutting_down_then_recovery() {
    let h = harness_with(MonitorOptions { start_timeout: Duration::from_millis(50), ..options() });
    h.service.delay_open(Duration::from_millis(500));

    let err = h.monitor.start_listening(&["a.exe"]).unwrap_err();
    assert!(matches!(err, MonitorError::StartTimeout(_)));
    assert!(!h.monitor.is_listening());
    assert!(matches!(h.monitor.start_listening(&["a.exe"]), Err(MonitorError::StillShuttingDown)));

    assert!(wait_for_state(&h.monitor, MonitorState::Idle, Duration::from_secs(5)));
    h.service.clear_failures();
    h.monitor.start_listening(&["a.exe"]).unwrap();
    h.monitor.stop_listening().unwrap();
}

// ───── remediation scenario ─────────────────────────────────────────────────

/// Records what was applied; clones share the log.
#[derive(Clone, Default)]
struct FakeControl {
    applied: Arc<Mutex<Vec<(u32, &'static str, usize)>>>,
}

impl ProcessControl for FakeControl {
    type Handle = u32;

    fn open(&self, pid: u32) -> io::Result<u32> {
        Ok(pid)
    }
    fn lower_priority(&self, pid: &u32) -> io::Result<()> {
        self.applied.lock().push((*pid, "priority", 0));
        Ok(())
    }
    fn set_affinity(&self, pid: &u32, mask: usize) -> io::Result<()> {
        self.applied.lock().push((*pid, "affinity", mask));
        Ok(())
    }
    fn logical_cpus(&self) -> usize {
        8
    }
}

#[test]
fn cheat_exe_is_restricted_after_grace_delay() {
    let h = harness();
    let control = FakeControl::default();
    let remediator: Arc<dyn Remediator> = Arc::new(DirectRemediator::new(control.clone()));
    let grace = Duration::from_millis(100);

    let (outcome_tx, outcome_rx) = unbounded();
    h.monitor.set_on_created(move |name, pid| {
        let rx = remediation::spawn_delayed(Arc::clone(&remediator), ProcessTarget::new(name, pid), grace)
            .expect("spawn remediation");
        let _ = outcome_tx.send((name.to_owned(), pid, Instant::now(), rx));
    });

    h.monitor.start_listening(&["cheat.exe"]).unwrap();
    assert!(h.service.emit_created("cheat.exe", 4242));

    let (name, pid, fired_at, rx) = outcome_rx.recv_timeout(RECV).unwrap();
    assert_eq!((name.as_str(), pid), ("cheat.exe", 4242));

    let report = rx.recv_timeout(RECV).unwrap().expect("remediation succeeds");
    assert!(fired_at.elapsed() >= grace);
    assert_eq!(report.affinity_mask, 0x80);
    assert_eq!(report.target, ProcessTarget::new("cheat.exe", 4242));
    assert_eq!(
        *control.applied.lock(),
        vec![(4242, "priority", 0), (4242, "affinity", 0x80)]
    );

    // Remediation threads are detached; stop does not wait for them.
    h.monitor.stop_listening().unwrap();
}
