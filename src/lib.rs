// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

#[macro_use]
pub mod macros;

pub mod comms;
pub mod config;
pub mod constants;
pub mod error;
pub mod monitor;
pub mod remediation;
pub mod util;

pub use comms::events::{EventKind, EventRecord, Subscription};
pub use error::{ErrorCode, Fault, FaultKind, MonitorError};
pub use monitor::{MonitorOptions, MonitorState, ProcessMonitor};
