//! Event model shared by the sink, the monitor and the callbacks.
//!
//! A **subscription** is a standing `(kind, process name)` request handed to
//! the notification service; an **event record** is what one delivered
//! notification turns into after the sink has parsed it.  Records are
//! ephemeral: produced per notification, consumed by one callback, dropped.
//!
//! Both types serialise with `serde` so the agent can log them as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{CREATION_EVENT_CLASS, DELETION_EVENT_CLASS, PROCESS_CLASS, QUERY_POLL_SECS};
use crate::util::wql_escape;

/// Lifecycle direction of a process notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Destroyed,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Created, EventKind::Destroyed];

    /// Intrinsic WMI event class carrying this direction.
    pub fn event_class(self) -> &'static str {
        match self {
            EventKind::Created => CREATION_EVENT_CLASS,
            EventKind::Destroyed => DELETION_EVENT_CLASS,
        }
    }

    /// Case-insensitive inverse of [`EventKind::event_class`].
    pub fn from_event_class(class: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.event_class().eq_ignore_ascii_case(class))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => f.write_str("creation"),
            EventKind::Destroyed => f.write_str("deletion"),
        }
    }
}

/// One standing notification request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub kind:         EventKind,
    pub process_name: String,
}

impl Subscription {
    pub fn new(kind: EventKind, process_name: impl Into<String>) -> Self {
        Self { kind, process_name: process_name.into() }
    }

    /// WQL text registered with the service for this subscription.
    pub fn query(&self) -> String {
        format!(
            "SELECT * FROM {} WITHIN {} WHERE TargetInstance ISA '{}' AND TargetInstance.Name='{}'",
            self.kind.event_class(),
            QUERY_POLL_SECS,
            PROCESS_CLASS,
            wql_escape(&self.process_name),
        )
    }

    /// Whether a notification for `(kind, name)` falls under this request.
    /// Process names compare case-insensitively, as WQL string equality does.
    pub fn matches(&self, kind: EventKind, name: &str) -> bool {
        self.kind == kind && self.process_name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of '{}'", self.kind, self.process_name)
    }
}

/// A parsed notification, handed to exactly one callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts:           DateTime<Utc>,
    pub kind:         EventKind,
    pub process_name: String,
    pub pid:          u32,
}

impl EventRecord {
    pub fn new(kind: EventKind, process_name: impl Into<String>, pid: u32) -> Self {
        Self { ts: Utc::now(), kind, process_name: process_name.into(), pid }
    }
}
