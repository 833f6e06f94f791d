// src/comms/simulated.rs

//! In-process notification service.
//!
//! Behaves like the WMI backend from the monitor's point of view (per-thread
//! session, standing subscriptions, asynchronous deliveries, status updates,
//! disconnects) but is driven by the test or the agent through a cloneable
//! [`SimulatedService`] handle.  Every backend call is recorded so callers can
//! assert on what the monitor actually did.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::comms::{
    events::{EventKind, Subscription},
    object::{ClassObject, EventObject},
    ChannelProvider, NotificationChannel, StatusFlags, StopSignal, WaitOutcome,
};
use crate::constants::{PROCESS_CLASS, PROP_NAME, PROP_PROCESS_ID, PROP_TARGET_INSTANCE};
use crate::error::ErrorCode;
use crate::monitor::sink::EventSink;

/// One backend call, in the order the monitor made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    BindSink,
    Subscribe(Subscription),
    CancelAll,
    ReleaseSink,
    Close,
}

enum Delivery {
    /// A well-formed lifecycle notification, filtered by subscriptions.
    Event { kind: EventKind, name: String, object: ClassObject },
    /// Arbitrary objects delivered in one batch, unfiltered.
    Raw(Vec<ClassObject>),
    Status { flags: StatusFlags, code: ErrorCode, description: Option<String> },
    Disconnect,
    WaitFailure(ErrorCode),
}

#[derive(Default)]
struct Script {
    fail_open:      Option<ErrorCode>,
    fail_bind:      Option<ErrorCode>,
    fail_subscribe: HashMap<(EventKind, String), ErrorCode>,
    fail_cancel:    Option<ErrorCode>,
    open_delay:     Duration,
}

#[derive(Default)]
struct Inner {
    script:   Mutex<Script>,
    calls:    Mutex<Vec<Call>>,
    feed:     Mutex<Option<(u64, Sender<Delivery>)>>,
    sessions: AtomicU64,
}

/// Cloneable handle to the simulated service; also the channel provider.
#[derive(Clone, Default)]
pub struct SimulatedService {
    inner: Arc<Inner>,
}

impl SimulatedService {
    pub fn new() -> Self {
        Self::default()
    }

    // ───── scripting ─────────────────────────────────────────────────────

    /// Make the next `open` calls fail with `code`.
    pub fn fail_open(&self, code: ErrorCode) {
        self.inner.script.lock().fail_open = Some(code);
    }

    pub fn fail_bind(&self, code: ErrorCode) {
        self.inner.script.lock().fail_bind = Some(code);
    }

    /// Reject one `(kind, name)` registration with `code`.
    pub fn fail_subscription(&self, kind: EventKind, name: &str, code: ErrorCode) {
        self.inner
            .script
            .lock()
            .fail_subscribe
            .insert((kind, name.to_ascii_lowercase()), code);
    }

    /// Make the bulk cancel at shutdown fail with `code`.
    pub fn fail_cancel(&self, code: ErrorCode) {
        self.inner.script.lock().fail_cancel = Some(code);
    }

    /// Stall `open` on the listener thread, e.g. to exceed a start timeout.
    pub fn delay_open(&self, delay: Duration) {
        self.inner.script.lock().open_delay = delay;
    }

    pub fn clear_failures(&self) {
        *self.inner.script.lock() = Script::default();
    }

    // ───── injection ─────────────────────────────────────────────────────
    //
    // Each returns whether a session was connected to receive the delivery.

    pub fn emit_created(&self, name: &str, pid: u32) -> bool {
        self.emit(EventKind::Created, name, pid)
    }

    pub fn emit_destroyed(&self, name: &str, pid: u32) -> bool {
        self.emit(EventKind::Destroyed, name, pid)
    }

    fn emit(&self, kind: EventKind, name: &str, pid: u32) -> bool {
        let object = ClassObject::new(kind.event_class()).with(
            PROP_TARGET_INSTANCE,
            ClassObject::new(PROCESS_CLASS)
                .with(PROP_NAME, name)
                .with(PROP_PROCESS_ID, pid),
        );
        self.push(Delivery::Event { kind, name: name.to_owned(), object })
    }

    /// Deliver `objects` in one batch, bypassing subscription filtering.
    pub fn inject_batch(&self, objects: Vec<ClassObject>) -> bool {
        self.push(Delivery::Raw(objects))
    }

    pub fn inject_status(&self, flags: StatusFlags, code: ErrorCode, description: Option<&str>) -> bool {
        self.push(Delivery::Status { flags, code, description: description.map(str::to_owned) })
    }

    /// Simulate the service process going away.
    pub fn inject_disconnect(&self) -> bool {
        self.push(Delivery::Disconnect)
    }

    /// Make the next wait fail outright with `code`.
    pub fn inject_wait_failure(&self, code: ErrorCode) -> bool {
        self.push(Delivery::WaitFailure(code))
    }

    fn push(&self, delivery: Delivery) -> bool {
        match self.inner.feed.lock().as_ref() {
            Some((_, tx)) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    // ───── inspection ────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.feed.lock().is_some()
    }

    fn record(&self, call: Call) {
        self.inner.calls.lock().push(call);
    }
}

impl ChannelProvider for SimulatedService {
    type Channel = SimulatedChannel;

    fn open(&self) -> Result<SimulatedChannel, ErrorCode> {
        self.record(Call::Open);
        let (delay, failure) = {
            let script = self.inner.script.lock();
            (script.open_delay, script.fail_open)
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(code) = failure {
            return Err(code);
        }

        let session = self.inner.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = unbounded();
        *self.inner.feed.lock() = Some((session, tx));

        Ok(SimulatedChannel {
            service:       self.clone(),
            session,
            feed:          rx,
            sink:          None,
            subscriptions: Vec::new(),
            _thread_bound: PhantomData,
        })
    }
}

/// One simulated session.  Bound to the thread that opened it.
pub struct SimulatedChannel {
    service:       SimulatedService,
    session:       u64,
    feed:          Receiver<Delivery>,
    sink:          Option<Arc<EventSink>>,
    subscriptions: Vec<Subscription>,
    _thread_bound: PhantomData<*const ()>,
}

impl SimulatedChannel {
    fn dispatch(&mut self, delivery: Delivery) -> WaitOutcome {
        match delivery {
            Delivery::Event { kind, name, object } => {
                let wanted = self.subscriptions.iter().any(|s| s.matches(kind, &name));
                if let (true, Some(sink)) = (wanted, self.sink.as_ref()) {
                    sink.deliver(&[&object as &dyn EventObject]);
                }
                WaitOutcome::Dispatched
            }
            Delivery::Raw(objects) => {
                if let Some(sink) = self.sink.as_ref() {
                    let batch: Vec<&dyn EventObject> =
                        objects.iter().map(|o| o as &dyn EventObject).collect();
                    sink.deliver(&batch);
                }
                WaitOutcome::Dispatched
            }
            Delivery::Status { flags, code, description } => {
                if let Some(sink) = self.sink.as_ref() {
                    sink.status_update(flags, code, description.as_deref());
                }
                WaitOutcome::Dispatched
            }
            Delivery::Disconnect => WaitOutcome::Disconnected,
            Delivery::WaitFailure(code) => WaitOutcome::Failed(code),
        }
    }
}

impl NotificationChannel for SimulatedChannel {
    fn bind_sink(&mut self, sink: Arc<EventSink>) -> Result<(), ErrorCode> {
        self.service.record(Call::BindSink);
        if let Some(code) = self.service.inner.script.lock().fail_bind {
            return Err(code);
        }
        self.sink = Some(sink);
        Ok(())
    }

    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), ErrorCode> {
        self.service.record(Call::Subscribe(subscription.clone()));
        let key = (subscription.kind, subscription.process_name.to_ascii_lowercase());
        if let Some(code) = self.service.inner.script.lock().fail_subscribe.get(&key) {
            return Err(*code);
        }
        if self.sink.is_none() {
            return Err(ErrorCode::WBEM_E_INVALID_OPERATION);
        }
        self.subscriptions.push(subscription.clone());
        Ok(())
    }

    fn wait(&mut self, stop: &StopSignal, timeout: Duration) -> WaitOutcome {
        if stop.is_set() {
            return WaitOutcome::Stopped;
        }
        let feed = self.feed.clone();
        let received = crossbeam::select! {
            recv(stop.waker()) -> _ => {
                return if stop.is_set() { WaitOutcome::Stopped } else { WaitOutcome::TimedOut };
            }
            recv(feed) -> msg => msg,
            default(timeout) => return WaitOutcome::TimedOut,
        };
        match received {
            Ok(delivery) => self.dispatch(delivery),
            // Another session replaced ours.
            Err(_) => WaitOutcome::Disconnected,
        }
    }

    fn cancel_all(&mut self) -> Result<(), ErrorCode> {
        self.service.record(Call::CancelAll);
        if let Some(code) = self.service.inner.script.lock().fail_cancel {
            return Err(code);
        }
        if self.subscriptions.is_empty() {
            return Err(ErrorCode::WBEM_E_INVALID_OPERATION);
        }
        self.subscriptions.clear();
        Ok(())
    }

    fn release_sink(&mut self) {
        self.service.record(Call::ReleaseSink);
        self.sink = None;
    }
}

impl Drop for SimulatedChannel {
    fn drop(&mut self) {
        self.sink = None;
        let mut feed = self.service.inner.feed.lock();
        if matches!(feed.as_ref(), Some((session, _)) if *session == self.session) {
            *feed = None;
        }
        drop(feed);
        self.service.record(Call::Close);
    }
}
