// src/constants.rs
//! Names and timings shared by the notification backends and the monitor.

use std::time::Duration;

/// WMI namespace that exposes `Win32_Process`.
pub const WMI_NAMESPACE: &str = r"ROOT\CIMV2";
/// Query language accepted by `ExecNotificationQueryAsync`.
pub const QUERY_LANGUAGE: &str = "WQL";

pub const CREATION_EVENT_CLASS: &str = "__InstanceCreationEvent";
pub const DELETION_EVENT_CLASS: &str = "__InstanceDeletionEvent";
pub const PROCESS_CLASS: &str = "Win32_Process";

/// Event object properties read by the sink.
pub const PROP_CLASS: &str = "__CLASS";
pub const PROP_TARGET_INSTANCE: &str = "TargetInstance";
pub const PROP_NAME: &str = "Name";
pub const PROP_PROCESS_ID: &str = "ProcessId";

/// `WITHIN` clause of the notification queries, in seconds.
pub const QUERY_POLL_SECS: u32 = 1;

/// Longest accepted process name (Win32 `MAX_PATH`).
pub const MAX_PROCESS_NAME_LEN: usize = 260;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_LOG_TARGET: &str = "procwatch::monitor";

/// Name given to the listener thread.
pub const LISTENER_THREAD_NAME: &str = "procwatch-listener";
