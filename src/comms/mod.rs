//! Notification channel abstraction + backends (WMI, simulated).
//! -----------------------------------------------------------------------------
//! A **provider** is the shareable factory the monitor owns; a **channel** is
//! one connected session, opened on the listener thread and torn down there.
//! Channels are deliberately not `Send`: COM apartments are per-thread, so the
//! session never leaves the thread that initialised it.
//!
//! Teardown order lives in each channel's `Drop`: stub, apartment, sink,
//! service, locator, then the per-thread runtime.

pub mod events;
pub mod object;
pub mod signal;
pub mod simulated;
#[cfg(windows)]
pub mod wmi;

use std::{sync::Arc, time::Duration};

use crate::comms::events::Subscription;
use crate::error::ErrorCode;
use crate::monitor::sink::EventSink;

pub use object::{ClassObject, EventObject, Property, Value};
pub use signal::StopSignal;

// ============================================================================
// 0 ▸ Wait outcomes + status flags
// ============================================================================

/// Result of one bounded wait on the listener thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The stop signal fired.
    Stopped,
    /// Nothing happened within the poll interval.
    TimedOut,
    /// Pending deliveries were dispatched to the sink.
    Dispatched,
    /// The service side of the connection went away.
    Disconnected,
    /// The wait primitive itself failed.
    Failed(ErrorCode),
}

/// Flags accompanying a status update from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlags {
    /// The asynchronous call has finished; the code carries its result.
    Complete,
    Progress,
    Requirements,
}

// ============================================================================
// 1 ▸ Provider / channel traits
// ============================================================================

/// Shareable factory for channels.  `open` runs on the listener thread and
/// performs per-thread runtime initialisation plus the service connection.
pub trait ChannelProvider: Send + Sync + 'static {
    type Channel: NotificationChannel;

    fn open(&self) -> Result<Self::Channel, ErrorCode>;
}

/// One connected session.  Every method is called from the thread that
/// opened it.
pub trait NotificationChannel {
    /// Register the adapter that receives deliveries and status updates.
    fn bind_sink(&mut self, sink: Arc<EventSink>) -> Result<(), ErrorCode>;

    /// Register one standing notification request.
    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), ErrorCode>;

    /// Block until the stop signal fires, deliveries were dispatched, the
    /// connection dropped or `timeout` elapsed.
    fn wait(&mut self, stop: &StopSignal, timeout: Duration) -> WaitOutcome;

    /// Cancel every outstanding asynchronous request bound to the sink.
    /// Fails with `WBEM_E_INVALID_OPERATION` when nothing was outstanding.
    fn cancel_all(&mut self) -> Result<(), ErrorCode>;

    /// Drop the channel's reference(s) to the sink.  No delivery reaches the
    /// sink afterwards.
    fn release_sink(&mut self);
}
