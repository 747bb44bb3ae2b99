//! Cross-thread cancellation of a supervised process.
//!
//! A [`CancellationController`] pairs a write-once [`CancellationSignal`] with
//! the [`Watchdog`] that owns the running child. Any thread (a scheduler, the
//! tracking session, the shutdown hook) may call [`CancellationController::kill`]
//! or [`CancellationController::abort`] while the foreground thread is blocked
//! in [`Watchdog::wait`].
//!
//! Ordering: the signal is stored before the child is destroyed, and the
//! foreground thread only reads it after the child has exited, so the
//! classification always observes a cancellation that caused the exit.

use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::types::CancellationSignal;

/// Interval between exit checks while a process runs.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the running child and destroys it on request.
///
/// There is no timeout: the child runs until it exits or is destroyed.
#[derive(Debug, Default)]
pub struct Watchdog {
    child: Mutex<Option<Child>>,
    destroy_requested: AtomicBool,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start watching `child`. A destroy requested earlier kills it right away.
    pub fn watch(&self, mut child: Child) {
        let mut slot = self.slot();
        if self.destroy_requested.load(Ordering::SeqCst) {
            debug!(pid = child.id(), "destroy requested before start, killing");
            if let Err(err) = child.kill() {
                debug!(err = %err, "kill after start failed");
            }
        }
        *slot = Some(child);
    }

    /// Block until the watched child exits, returning its status.
    ///
    /// The lock is only held for a non-blocking check, so
    /// [`Watchdog::destroy_process`] can reach the child from another thread.
    pub fn wait(&self, poll: Duration) -> Result<ExitStatus> {
        loop {
            {
                let mut slot = self.slot();
                let child = slot
                    .as_mut()
                    .context("watchdog has no process to wait for")?;
                if let Some(status) = child.try_wait().context("wait for process")? {
                    *slot = None;
                    return Ok(status);
                }
            }
            thread::sleep(poll);
        }
    }

    /// Forcibly destroy the watched process.
    ///
    /// Safe to call at any time; a process that already exited (or was never
    /// started) is not an error.
    pub fn destroy_process(&self) {
        self.destroy_requested.store(true, Ordering::SeqCst);
        let mut slot = self.slot();
        match slot.as_mut() {
            Some(child) => {
                let pid = child.id();
                match child.kill() {
                    Ok(()) => info!(pid, "destroyed process"),
                    // Lost the race against a natural exit.
                    Err(err) => debug!(pid, err = %err, "process already gone"),
                }
            }
            None => debug!("no running process to destroy"),
        }
    }

    pub fn destroy_requested(&self) -> bool {
        self.destroy_requested.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let slot = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = slot.as_mut() {
            warn!(pid = child.id(), "watchdog dropped with a live process, killing");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A recorded cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub signal: CancellationSignal,
    pub reason: String,
}

#[derive(Debug, Default)]
struct Shared {
    recorded: OnceLock<Cancellation>,
    watchdog: Watchdog,
}

/// Cloneable handle to one run's cancellation state.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    shared: Arc<Shared>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.shared.watchdog
    }

    /// Record `Kill` and destroy the process. Returns false if a signal was already recorded.
    pub fn kill(&self, reason: impl Into<String>) -> bool {
        self.raise(CancellationSignal::Kill, reason.into())
    }

    /// Record `Abort` and destroy the process. Returns false if a signal was already recorded.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.raise(CancellationSignal::Abort, reason.into())
    }

    fn raise(&self, signal: CancellationSignal, reason: String) -> bool {
        let mut first = false;
        self.shared.recorded.get_or_init(|| {
            first = true;
            Cancellation {
                signal,
                reason: reason.clone(),
            }
        });
        if !first {
            debug!(?signal, reason = %reason, "cancellation already recorded, ignoring");
            return false;
        }
        info!(?signal, reason = %reason, "killing running process");
        self.shared.watchdog.destroy_process();
        true
    }

    pub fn signal(&self) -> CancellationSignal {
        self.shared
            .recorded
            .get()
            .map(|c| c.signal)
            .unwrap_or_default()
    }

    pub fn cancellation(&self) -> Option<Cancellation> {
        self.shared.recorded.get().cloned()
    }
}
