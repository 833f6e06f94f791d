// src/remediation/direct.rs

//! Direct strategy: open by pid, lowest priority, last core only.

use std::io;

use super::{last_core_mask, ProcessTarget, RemediationError, RemediationReport, Remediator};

const LOG_TARGET: &str = "procwatch::remediation";

/// OS operations the direct strategy needs.  `Handle` closes itself on drop.
pub trait ProcessControl: Send + Sync + 'static {
    type Handle;

    fn open(&self, pid: u32) -> io::Result<Self::Handle>;
    fn lower_priority(&self, handle: &Self::Handle) -> io::Result<()>;
    fn set_affinity(&self, handle: &Self::Handle, mask: usize) -> io::Result<()>;
    fn logical_cpus(&self) -> usize;
}

pub struct DirectRemediator<C: ProcessControl> {
    control: C,
}

impl<C: ProcessControl> DirectRemediator<C> {
    pub fn new(control: C) -> Self {
        Self { control }
    }

    pub fn control(&self) -> &C {
        &self.control
    }
}

impl<C: ProcessControl> Remediator for DirectRemediator<C> {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn restrict(&self, target: &ProcessTarget) -> Result<RemediationReport, RemediationError> {
        if target.pid == 0 {
            return Err(RemediationError::InvalidPid);
        }
        let mask = last_core_mask(self.control.logical_cpus())?;
        let handle = self
            .control
            .open(target.pid)
            .map_err(|source| RemediationError::Open { pid: target.pid, source })?;

        // Both steps always run; nothing is rolled back.
        let priority = self.control.lower_priority(&handle);
        let affinity = self.control.set_affinity(&handle, mask);

        if let Err(e) = &priority {
            procwatch_log!(log::Level::Warn, LOG_TARGET, "{}: lowering priority failed: {}", target, e);
        }
        if let Err(e) = &affinity {
            procwatch_log!(log::Level::Warn, LOG_TARGET, "{}: setting affinity {:#x} failed: {}", target, mask, e);
        }

        match (priority.is_ok(), affinity.is_ok()) {
            (true, true) => Ok(RemediationReport { strategy: self.name(), target: target.clone(), affinity_mask: mask }),
            (priority_lowered, affinity_set) => Err(RemediationError::Incomplete { priority_lowered, affinity_set }),
        }
    }
}

// ============================================================================
// OS backends
// ============================================================================

/// Process control through the host OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

#[cfg(windows)]
mod os {
    use std::io;
    use windows_sys::Win32::{
        Foundation::{CloseHandle, HANDLE},
        System::{
            SystemInformation::{GetSystemInfo, SYSTEM_INFO},
            Threading::{
                OpenProcess, SetPriorityClass, SetProcessAffinityMask, IDLE_PRIORITY_CLASS,
                PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_INFORMATION,
            },
        },
    };

    use super::{ProcessControl, SystemProcessControl};

    /// Process handle closed on drop.
    pub struct OwnedProcess(HANDLE);

    impl Drop for OwnedProcess {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.0) };
        }
    }

    impl ProcessControl for SystemProcessControl {
        type Handle = OwnedProcess;

        fn open(&self, pid: u32) -> io::Result<OwnedProcess> {
            let handle =
                unsafe { OpenProcess(PROCESS_SET_INFORMATION | PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            Ok(OwnedProcess(handle))
        }

        fn lower_priority(&self, handle: &OwnedProcess) -> io::Result<()> {
            if unsafe { SetPriorityClass(handle.0, IDLE_PRIORITY_CLASS) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn set_affinity(&self, handle: &OwnedProcess, mask: usize) -> io::Result<()> {
            if unsafe { SetProcessAffinityMask(handle.0, mask) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn logical_cpus(&self) -> usize {
            let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
            unsafe { GetSystemInfo(&mut info) };
            info.dwNumberOfProcessors as usize
        }
    }
}

#[cfg(unix)]
mod os {
    use std::io;

    use super::{ProcessControl, SystemProcessControl};

    /// Lowest scheduling priority (`nice` 19).
    const LOWEST_NICE: libc::c_int = 19;

    impl ProcessControl for SystemProcessControl {
        type Handle = libc::pid_t;

        fn open(&self, pid: u32) -> io::Result<libc::pid_t> {
            let pid = libc::pid_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
            if unsafe { libc::kill(pid, 0) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(pid)
        }

        fn lower_priority(&self, pid: &libc::pid_t) -> io::Result<()> {
            if unsafe { libc::setpriority(libc::PRIO_PROCESS, *pid as libc::id_t, LOWEST_NICE) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        #[cfg(target_os = "linux")]
        fn set_affinity(&self, pid: &libc::pid_t, mask: usize) -> io::Result<()> {
            let cpu = mask.trailing_zeros() as usize;
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                libc::CPU_SET(cpu, &mut set);
                if libc::sched_setaffinity(*pid, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        fn set_affinity(&self, _pid: &libc::pid_t, _mask: usize) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "process affinity is not settable on this platform"))
        }

        fn logical_cpus(&self) -> usize {
            num_cpus::get()
        }
    }
}
