// src/comms/signal.rs

//! Manual-reset stop signal shared between the controller and the listener
//! thread.
//!
//! Portable waits go through a one-slot crossbeam channel used as a waker;
//! on Windows the signal also owns a kernel event so the COM wait can block
//! on the real handle alongside its own message pump.

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

#[cfg(windows)]
use windows_sys::Win32::{
    Foundation::{CloseHandle, HANDLE},
    System::Threading::{CreateEventW, ResetEvent, SetEvent},
};

pub struct StopSignal {
    set:      AtomicBool,
    wake_tx:  Sender<()>,
    wake_rx:  Receiver<()>,
    #[cfg(windows)]
    event:    HANDLE, // manual-reset, initially non-signalled
}

// The raw event handle is only used through thread-safe Win32 calls.
#[cfg(windows)]
unsafe impl Send for StopSignal {}
#[cfg(windows)]
unsafe impl Sync for StopSignal {}

impl StopSignal {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            set: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            #[cfg(windows)]
            // A null handle only disables the native wait path; the portable
            // flag still works.
            event: unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) },
        }
    }

    /// Signal.  Idempotent; wakes a waiter blocked in [`wait_timeout`] or
    /// selecting on [`waker`].
    ///
    /// [`wait_timeout`]: StopSignal::wait_timeout
    /// [`waker`]: StopSignal::waker
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(()); // full → already pending
        #[cfg(windows)]
        if !self.event.is_null() {
            unsafe { SetEvent(self.event) };
        }
    }

    /// Back to non-signalled; drains any pending wake-up.
    pub fn reset(&self) {
        self.set.store(false, Ordering::SeqCst);
        loop {
            match self.wake_rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        #[cfg(windows)]
        if !self.event.is_null() {
            unsafe { ResetEvent(self.event) };
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Block up to `timeout`; `true` when the signal is (or becomes) set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let _ = self.wake_rx.recv_timeout(timeout);
        self.is_set()
    }

    /// Receiver that becomes ready when the signal is set, for use inside
    /// `crossbeam::select!`.  Receiving consumes the wake-up but not the flag.
    pub fn waker(&self) -> &Receiver<()> {
        &self.wake_rx
    }

    /// Native manual-reset event mirroring the flag (may be null).
    #[cfg(windows)]
    pub fn raw_event(&self) -> HANDLE {
        self.event
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal").field("set", &self.is_set()).finish()
    }
}

#[cfg(windows)]
impl Drop for StopSignal {
    fn drop(&mut self) {
        if !self.event.is_null() {
            unsafe { CloseHandle(self.event) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Instant};

    #[test]
    fn set_is_sticky_until_reset() {
        let stop = StopSignal::new();
        assert!(!stop.is_set());
        stop.set();
        stop.set();
        assert!(stop.wait_timeout(Duration::from_millis(1)));
        assert!(stop.wait_timeout(Duration::from_millis(1)));
        stop.reset();
        assert!(!stop.is_set());
        assert!(!stop.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn set_wakes_blocked_waiter() {
        let stop = Arc::new(StopSignal::new());
        let waiter = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let t0 = Instant::now();
                let woke = stop.wait_timeout(Duration::from_secs(10));
                (woke, t0.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        stop.set();
        let (woke, waited) = waiter.join().unwrap();
        assert!(woke);
        assert!(waited < Duration::from_secs(5));
    }
}
