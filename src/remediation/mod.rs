// src/remediation/mod.rs

//! Priority / affinity restriction of a watched process.
//!
//! Two interchangeable strategies implement [`Remediator`]:
//!   • [`DirectRemediator`] opens the process by id and adjusts it through a
//!     [`ProcessControl`] backend.
//!   • [`ShellRemediator`] runs an external helper that does the same by
//!     process name.
//!
//! Both attempt every sub-step, succeed only if all of them succeeded and
//! never roll back what was already applied.  [`spawn_delayed`] runs a
//! strategy after a grace delay on a detached thread.

pub mod direct;
pub mod shell;

use crossbeam::channel::{bounded, Receiver};
use serde::Serialize;
use std::{fmt, io, sync::Arc, thread, time::Duration};
use thiserror::Error;

use crate::error::{ErrorCode, Fault, FaultKind};

pub use direct::{DirectRemediator, ProcessControl, SystemProcessControl};
pub use shell::ShellRemediator;

const LOG_TARGET: &str = "procwatch::remediation";

/// The process a remediation acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessTarget {
    pub name: String,
    pub pid:  u32,
}

impl ProcessTarget {
    pub fn new(name: impl Into<String>, pid: u32) -> Self {
        Self { name: name.into(), pid }
    }
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.name, self.pid)
    }
}

/// What a successful remediation applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationReport {
    pub strategy:      &'static str,
    pub target:        ProcessTarget,
    pub affinity_mask: usize,
}

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("process id 0 is not a valid target")]
    InvalidPid,

    #[error("cannot open process {pid}: {source}")]
    Open { pid: u32, #[source] source: io::Error },

    #[error("no logical processors reported")]
    NoProcessors,

    #[error("remediation incomplete (priority lowered: {priority_lowered}, affinity set: {affinity_set})")]
    Incomplete { priority_lowered: bool, affinity_set: bool },

    #[error("helper '{program}' failed ({status}): {output}")]
    Helper { program: String, status: String, output: String },

    #[error("cannot run helper '{program}': {source}")]
    Spawn { program: String, #[source] source: io::Error },
}

impl RemediationError {
    /// HRESULT-style code used when the failure is reported as a [`Fault`].
    pub fn code(&self) -> ErrorCode {
        match self {
            RemediationError::InvalidPid => ErrorCode::E_INVALIDARG,
            RemediationError::Open { source, .. } => match source.raw_os_error() {
                // HRESULT_FROM_WIN32 on Windows; plain errno elsewhere.
                Some(os) if cfg!(windows) && os > 0 => ErrorCode((0x8007_0000u32 | (os as u32 & 0xFFFF)) as i32),
                _ if source.kind() == io::ErrorKind::PermissionDenied => ErrorCode::E_ACCESSDENIED,
                _ => ErrorCode::E_FAIL,
            },
            _ => ErrorCode::E_FAIL,
        }
    }

    pub fn to_fault(&self, target: &ProcessTarget) -> Fault {
        Fault::new(FaultKind::Remediation, self.code(), format!("restricting {target}: {self}"))
    }
}

/// One remediation strategy.
pub trait Remediator: Send + Sync {
    fn name(&self) -> &'static str;

    fn restrict(&self, target: &ProcessTarget) -> Result<RemediationReport, RemediationError>;
}

/// Selectable strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemediationStrategy {
    #[default]
    Direct,
    Shell,
}

impl fmt::Display for RemediationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationStrategy::Direct => f.write_str("direct"),
            RemediationStrategy::Shell => f.write_str("shell"),
        }
    }
}

/// OS-backed remediator for `strategy`.
pub fn build(strategy: RemediationStrategy) -> Arc<dyn Remediator> {
    match strategy {
        RemediationStrategy::Direct => Arc::new(DirectRemediator::new(SystemProcessControl)),
        RemediationStrategy::Shell => Arc::new(ShellRemediator::default()),
    }
}

/// Affinity mask selecting only the last logical processor.
pub fn last_core_mask(cpus: usize) -> Result<usize, RemediationError> {
    match cpus {
        0 => Err(RemediationError::NoProcessors),
        n => Ok(1usize << (n.min(usize::BITS as usize) - 1)),
    }
}

/// Run `remediator` on `target` after `delay`, on a detached thread.
///
/// The outcome is logged and also sent on the returned receiver, which the
/// caller is free to drop.
pub fn spawn_delayed(
    remediator: Arc<dyn Remediator>,
    target: ProcessTarget,
    delay: Duration,
) -> io::Result<Receiver<Result<RemediationReport, RemediationError>>> {
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("procwatch-remediate".into())
        .spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let outcome = remediator.restrict(&target);
            match &outcome {
                Ok(report) => procwatch_log!(
                    log::Level::Info,
                    LOG_TARGET,
                    "{} remediation of {} applied (affinity mask {:#x})",
                    report.strategy,
                    report.target,
                    report.affinity_mask
                ),
                Err(e) => procwatch_log!(log::Level::Error, LOG_TARGET, "{}", e.to_fault(&target)),
            }
            let _ = tx.send(outcome);
        })?;
    Ok(rx)
}
