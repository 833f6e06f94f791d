// src/error.rs

//! Error taxonomy shared by the monitor, the sink and the backends.
//!
//! * `ErrorCode`: raw HRESULT-style status as reported by the notification
//!   service (or synthesised by the simulated one).
//! * `Fault`: what the user error callback receives: a code plus the
//!   taxonomy bucket and enough context to tell *which* subscription or
//!   object failed.
//! * `MonitorError`: returned by the lifecycle calls.

use std::{fmt, io, time::Duration};
use thiserror::Error;

use crate::comms::events::Subscription;

/// HRESULT-style status code.  Negative values are failures.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ErrorCode(pub i32);

const fn hr(code: u32) -> ErrorCode {
    ErrorCode(code as i32)
}

impl ErrorCode {
    pub const S_OK: Self = hr(0);

    pub const E_FAIL: Self = hr(0x8000_4005);
    pub const E_INVALIDARG: Self = hr(0x8007_0057);
    pub const E_ACCESSDENIED: Self = hr(0x8007_0005);
    pub const RPC_E_DISCONNECTED: Self = hr(0x8001_0108);

    pub const WBEM_E_FAILED: Self = hr(0x8004_1001);
    pub const WBEM_E_NOT_FOUND: Self = hr(0x8004_1002);
    pub const WBEM_E_TYPE_MISMATCH: Self = hr(0x8004_1005);
    pub const WBEM_E_CRITICAL_ERROR: Self = hr(0x8004_100A);
    pub const WBEM_E_INVALID_CLASS: Self = hr(0x8004_1010);
    pub const WBEM_E_TRANSPORT_FAILURE: Self = hr(0x8004_1015);
    pub const WBEM_E_INVALID_OPERATION: Self = hr(0x8004_1016);
    pub const WBEM_E_INVALID_QUERY: Self = hr(0x8004_1017);
    pub const WBEM_E_CALL_CANCELLED: Self = hr(0x8004_1032);

    pub const fn is_failure(self) -> bool {
        self.0 < 0
    }

    /// Faults after which the channel cannot be trusted to deliver again.
    pub fn is_critical(self) -> bool {
        self == Self::WBEM_E_TRANSPORT_FAILURE || self == Self::WBEM_E_CRITICAL_ERROR
    }

    pub fn is_disconnect(self) -> bool {
        self == Self::RPC_E_DISCONNECTED
    }

    pub fn is_cancellation(self) -> bool {
        self == Self::WBEM_E_CALL_CANCELLED
    }

    /// Symbolic name for the codes this crate knows about.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::S_OK => "S_OK",
            Self::E_FAIL => "E_FAIL",
            Self::E_INVALIDARG => "E_INVALIDARG",
            Self::E_ACCESSDENIED => "E_ACCESSDENIED",
            Self::RPC_E_DISCONNECTED => "RPC_E_DISCONNECTED",
            Self::WBEM_E_FAILED => "WBEM_E_FAILED",
            Self::WBEM_E_NOT_FOUND => "WBEM_E_NOT_FOUND",
            Self::WBEM_E_TYPE_MISMATCH => "WBEM_E_TYPE_MISMATCH",
            Self::WBEM_E_CRITICAL_ERROR => "WBEM_E_CRITICAL_ERROR",
            Self::WBEM_E_INVALID_CLASS => "WBEM_E_INVALID_CLASS",
            Self::WBEM_E_TRANSPORT_FAILURE => "WBEM_E_TRANSPORT_FAILURE",
            Self::WBEM_E_INVALID_OPERATION => "WBEM_E_INVALID_OPERATION",
            Self::WBEM_E_INVALID_QUERY => "WBEM_E_INVALID_QUERY",
            Self::WBEM_E_CALL_CANCELLED => "WBEM_E_CALL_CANCELLED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "0x{:08X} ({})", self.0 as u32, name),
            None => write!(f, "0x{:08X}", self.0 as u32),
        }
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({})", self)
    }
}

/// Failure buckets surfaced through the error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Channel, connection or sink setup failed; no events will arrive.
    Initialization,
    /// One watched name/direction failed to register.
    Subscription,
    /// A single delivered object could not be parsed completely.
    Delivery,
    /// Transport-level disconnect or critical fault.
    Channel,
    /// Priority/affinity adjustment incomplete.
    Remediation,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Initialization => "initialization",
            FaultKind::Subscription => "subscription",
            FaultKind::Delivery => "delivery",
            FaultKind::Channel => "channel",
            FaultKind::Remediation => "remediation",
        };
        f.write_str(s)
    }
}

/// Payload of the error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind:    FaultKind,
    pub code:    ErrorCode,
    pub context: String,
}

impl Fault {
    pub fn new(kind: FaultKind, code: ErrorCode, context: impl Into<String>) -> Self {
        Self { kind, code, context: context.into() }
    }

    pub fn subscription(code: ErrorCode, subscription: &Subscription) -> Self {
        Self::new(FaultKind::Subscription, code, format!("subscribing to {}", subscription))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault {}: {}", self.kind, self.code, self.context)
    }
}

/// All the ways a lifecycle call can fail.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor is already listening")]
    AlreadyListening,

    #[error("previous listener session is still shutting down")]
    StillShuttingDown,

    #[error("invalid process name '{0}'")]
    InvalidProcessName(String),

    #[error("listener initialisation failed: {0}")]
    Initialization(ErrorCode),

    #[error("{} subscription(s) failed; remaining subscriptions are active", .failed.len())]
    PartialSubscription { failed: Vec<Subscription> },

    #[error("listener did not confirm start within {0:?}")]
    StartTimeout(Duration),

    #[error("failed to spawn listener thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("lifecycle call made from the listener thread")]
    CalledFromWorker,

    #[error("listener thread panicked")]
    WorkerPanicked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_bit_follows_sign() {
        assert!(!ErrorCode::S_OK.is_failure());
        assert!(ErrorCode::WBEM_E_FAILED.is_failure());
        assert!(ErrorCode::RPC_E_DISCONNECTED.is_failure());
    }

    #[test]
    fn only_transport_and_critical_are_critical() {
        assert!(ErrorCode::WBEM_E_TRANSPORT_FAILURE.is_critical());
        assert!(ErrorCode::WBEM_E_CRITICAL_ERROR.is_critical());
        assert!(!ErrorCode::RPC_E_DISCONNECTED.is_critical());
        assert!(!ErrorCode::WBEM_E_CALL_CANCELLED.is_critical());
    }

    #[test]
    fn display_is_hex_with_name() {
        assert_eq!(
            ErrorCode::WBEM_E_TRANSPORT_FAILURE.to_string(),
            "0x80041015 (WBEM_E_TRANSPORT_FAILURE)"
        );
        assert_eq!(ErrorCode(0x1234).to_string(), "0x00001234");
    }
}
