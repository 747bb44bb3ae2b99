//! Teardown hook for Ctrl-C / SIGTERM while a session is active.
//!
//! The hook aborts a session that is still running, then waits a bounded
//! grace period for the foreground flow to finish its abort reporting before
//! the process exits.

use std::process;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::exit_codes;
use crate::io::tracking::SessionTracker;

/// Time the foreground flow gets to wind down after an abort.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(4);

/// Released by the foreground flow once it has finished its teardown.
#[derive(Debug, Default)]
pub struct TeardownLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl TeardownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn release(&self) {
        *self.state() = true;
        self.cond.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *self.state()
    }

    /// Block until released or `timeout` elapses. Returns true when released.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.state();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = self
                .cond
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// The foreground flow finished inside the grace period.
    Finished,
    GraceExpired,
}

/// Abort the session if it is still active, then wait for the foreground flow.
pub fn handle_shutdown(
    tracker: &dyn SessionTracker,
    latch: &TeardownLatch,
    grace: Duration,
) -> ShutdownAction {
    if !tracker.is_session_stopped() {
        info!("shutdown requested, aborting active session");
        if let Err(err) = tracker.abort_session() {
            warn!(err = %format!("{err:#}"), "failed to abort session during shutdown");
        }
    }
    if latch.wait(grace) {
        ShutdownAction::Finished
    } else {
        warn!(grace_secs = grace.as_secs(), "run did not finish within the shutdown grace period");
        ShutdownAction::GraceExpired
    }
}

type ActiveSession = (Arc<dyn SessionTracker>, Arc<TeardownLatch>);

fn active() -> &'static Mutex<Option<ActiveSession>> {
    static ACTIVE: OnceLock<Mutex<Option<ActiveSession>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(None))
}

fn active_slot() -> MutexGuard<'static, Option<ActiveSession>> {
    active().lock().unwrap_or_else(PoisonError::into_inner)
}

fn install_handler_once() -> Result<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            let session = active_slot().clone();
            match session {
                Some((tracker, latch)) => {
                    if handle_shutdown(tracker.as_ref(), &latch, SHUTDOWN_GRACE)
                        == ShutdownAction::GraceExpired
                    {
                        process::exit(exit_codes::CANCELLED);
                    }
                }
                None => process::exit(exit_codes::CANCELLED),
            }
        })
        .map_err(|e| e.to_string())
    });
    result
        .clone()
        .map_err(|msg| anyhow!("install shutdown handler: {msg}"))
}

/// Registration of one session with the process-wide handler.
///
/// Dropping it releases the latch and unregisters the session.
#[derive(Debug)]
pub struct ShutdownHook {
    latch: Arc<TeardownLatch>,
}

impl ShutdownHook {
    pub fn install(tracker: Arc<dyn SessionTracker>) -> Result<Self> {
        install_handler_once()?;
        let latch = Arc::new(TeardownLatch::new());
        *active_slot() = Some((tracker, Arc::clone(&latch)));
        Ok(Self { latch })
    }
}

impl Drop for ShutdownHook {
    fn drop(&mut self) {
        self.latch.release();
        let mut slot = active_slot();
        if slot
            .as_ref()
            .is_some_and(|(_, latch)| Arc::ptr_eq(latch, &self.latch))
        {
            *slot = None;
        }
    }
}
