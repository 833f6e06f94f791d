// src/remediation/shell.rs

//! Shell strategy: an external helper restricts the process by name and
//! prints `True` on success.

use std::{fmt, process::Command, sync::Arc};

use super::{last_core_mask, ProcessTarget, RemediationError, RemediationReport, Remediator};
use crate::util::strip_extension;

/// Builds the helper's argument vector for a target and affinity mask.
pub type ArgsBuilder = Arc<dyn Fn(&ProcessTarget, usize) -> Vec<String> + Send + Sync>;

pub struct ShellRemediator {
    program: String,
    args:    ArgsBuilder,
    cpus:    usize,
}

impl ShellRemediator {
    /// Custom helper.  Mostly useful to substitute a harmless command in
    /// tests.
    pub fn with_command(program: impl Into<String>, args: ArgsBuilder) -> Self {
        Self { program: program.into(), args, cpus: num_cpus::get() }
    }

    /// Override the processor count used to compute the mask.
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }
}

impl Default for ShellRemediator {
    #[cfg(windows)]
    fn default() -> Self {
        Self::with_command("powershell.exe", Arc::new(powershell_args))
    }

    #[cfg(not(windows))]
    fn default() -> Self {
        Self::with_command("sh", Arc::new(posix_args))
    }
}

impl fmt::Debug for ShellRemediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellRemediator")
            .field("program", &self.program)
            .field("cpus", &self.cpus)
            .finish_non_exhaustive()
    }
}

impl Remediator for ShellRemediator {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn restrict(&self, target: &ProcessTarget) -> Result<RemediationReport, RemediationError> {
        if target.pid == 0 {
            return Err(RemediationError::InvalidPid);
        }
        let mask = last_core_mask(self.cpus)?;

        let output = Command::new(&self.program)
            .args((self.args)(target, mask))
            .output()
            .map_err(|source| RemediationError::Spawn { program: self.program.clone(), source })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let confirmed = stdout.lines().any(|line| line.trim() == "True");
        if output.status.success() && confirmed {
            return Ok(RemediationReport { strategy: self.name(), target: target.clone(), affinity_mask: mask });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(RemediationError::Helper {
            program: self.program.clone(),
            status:  output.status.to_string(),
            output:  format!("{}{}", stdout.trim(), stderr.trim()),
        })
    }
}

/// `Get-Process` by stem, idle priority, single-core affinity.
pub fn powershell_args(target: &ProcessTarget, mask: usize) -> Vec<String> {
    let stem = strip_extension(&target.name).replace('\'', "''");
    let script = format!(
        "$ErrorActionPreference = 'Stop'; \
         try {{ \
           foreach ($p in Get-Process -Name '{stem}') {{ \
             $p.PriorityClass = 'Idle'; $p.ProcessorAffinity = {mask} \
           }}; 'True' \
         }} catch {{ 'False' }}"
    );
    ["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"]
        .into_iter()
        .map(String::from)
        .chain(std::iter::once(script))
        .collect()
}

/// `pgrep -x` by name, `renice 19`, `taskset` to the masked core.
pub fn posix_args(target: &ProcessTarget, mask: usize) -> Vec<String> {
    let name = target.name.replace('\'', r"'\''");
    let script = format!(
        "pids=$(pgrep -x -- '{name}') || {{ echo False; exit 1; }}; ok=True; \
         for p in $pids; do \
           renice -n 19 -p \"$p\" >/dev/null 2>&1 || ok=False; \
           taskset -p {mask:x} \"$p\" >/dev/null 2>&1 || ok=False; \
         done; echo $ok"
    );
    vec!["-c".into(), script]
}
