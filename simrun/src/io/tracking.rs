//! Lifecycle reporting to the tracking service.
//!
//! A session posts `keep-alive` when it starts and then on a background timer,
//! posts `end` when it is stopped or aborted, and finally fetches the verdict
//! for the test run. All calls go through the retrying [`ReportingClient`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SimrunError;
use crate::io::cancel::CancellationController;
use crate::io::http::{NULL_BODY, ReportingClient};
use crate::io::shutdown::TeardownLatch;

/// How long `stop` waits for an in-flight keep-alive call before detaching it.
pub const KEEP_ALIVE_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    KeepAlive,
    End,
}

impl LifecycleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleAction::KeepAlive => "keep-alive",
            LifecycleAction::End => "end",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the test run, sent with every lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunInfo {
    pub test_run_id: String,
    pub dashboard_name: String,
    pub product_name: String,
    pub product_release: String,
    pub build_results_url: String,
    /// Seconds.
    pub ramp_up_period: u64,
}

/// Verdict document returned by `GET /benchmarks/..`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(rename = "meetsRequirement", default)]
    pub meets_requirement: Option<bool>,
    #[serde(rename = "benchmarkResultPreviousOK", default)]
    pub benchmark_result_previous_ok: Option<bool>,
    #[serde(rename = "benchmarkResultFixedOK", default)]
    pub benchmark_result_fixed_ok: Option<bool>,
}

impl Verdict {
    /// Requirements met, and no benchmark comparison explicitly failed.
    pub fn passed(&self) -> bool {
        self.meets_requirement == Some(true)
            && self.benchmark_result_previous_ok != Some(false)
            && self.benchmark_result_fixed_ok != Some(false)
    }

    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.meets_requirement != Some(true) {
            failures.push(format!("meetsRequirement={}", show(self.meets_requirement)));
        }
        if self.benchmark_result_previous_ok == Some(false) {
            failures.push("benchmarkResultPreviousOK=false".to_string());
        }
        if self.benchmark_result_fixed_ok == Some(false) {
            failures.push("benchmarkResultFixedOK=false".to_string());
        }
        failures
    }
}

fn show(value: Option<bool>) -> String {
    value.map_or_else(|| "missing".to_string(), |v| v.to_string())
}

/// Parse a verdict body. The literal [`NULL_BODY`] means there is no verdict.
pub fn parse_verdict(body: &str) -> Result<Option<Verdict>> {
    if body.trim() == NULL_BODY {
        return Ok(None);
    }
    let verdict = serde_json::from_str(body).context("parse verdict json")?;
    Ok(Some(verdict))
}

/// Tracking-service endpoints for one test run.
#[derive(Debug, Clone)]
pub struct TrackingClient {
    base_url: String,
    info: TestRunInfo,
    transport: ReportingClient,
}

impl TrackingClient {
    pub fn new(base_url: &str, info: TestRunInfo, transport: ReportingClient) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            info,
            transport,
        }
    }

    pub fn info(&self) -> &TestRunInfo {
        &self.info
    }

    pub fn lifecycle_url(&self, action: LifecycleAction) -> String {
        format!("{}/running-test/{action}", self.base_url)
    }

    pub fn verdict_url(&self) -> String {
        [
            self.base_url.as_str(),
            "benchmarks",
            &self.info.product_name,
            &self.info.dashboard_name,
            &self.info.test_run_id,
        ]
        .join("/")
    }

    pub fn post_lifecycle(&self, action: LifecycleAction) -> Result<String> {
        let body = serde_json::to_string(&self.info).context("serialize test run info")?;
        let reply = self
            .transport
            .post_event(&self.lifecycle_url(action), &body)
            .with_context(|| format!("post {action} event"))?;
        debug!(%action, reply = %reply, "lifecycle event posted");
        Ok(reply)
    }

    /// Post `keep-alive`, abandoning retries once `stop` is released.
    pub fn post_keep_alive_until(&self, stop: &TeardownLatch) -> Result<String> {
        let body = serde_json::to_string(&self.info).context("serialize test run info")?;
        self.transport
            .post_event_until(&self.lifecycle_url(LifecycleAction::KeepAlive), &body, stop)
            .context("post keep-alive event")
    }

    pub fn fetch_verdict(&self) -> Result<Option<Verdict>> {
        let body = self
            .transport
            .get_verdict(&self.verdict_url())
            .context("fetch verdict")?;
        parse_verdict(&body)
    }
}

/// Background thread posting `keep-alive` at a fixed interval.
///
/// Stopping interrupts both the interval wait and any retry delay, so no
/// keep-alive attempt starts after [`KeepAliveTimer::stop`].
#[derive(Debug)]
pub struct KeepAliveTimer {
    stop: Arc<TeardownLatch>,
    handle: JoinHandle<()>,
}

impl KeepAliveTimer {
    pub fn start(client: Arc<TrackingClient>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(TeardownLatch::new());
        let stopped = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("simrun-keep-alive".to_string())
            .spawn(move || {
                while !stopped.wait(interval) {
                    if let Err(err) = client.post_keep_alive_until(&stopped) {
                        if stopped.is_released() {
                            debug!(err = %format!("{err:#}"), "keep-alive abandoned, timer stopping");
                        } else {
                            warn!(err = %format!("{err:#}"), "keep-alive call failed");
                        }
                    }
                }
                debug!("keep-alive timer stopped");
            })
            .context("spawn keep-alive thread")?;
        Ok(Self { stop, handle })
    }

    /// Signal the thread and wait up to `grace` for it to finish.
    ///
    /// Only a single HTTP exchange can still be in flight; if it outlives
    /// `grace` the thread is detached.
    pub fn stop(self, grace: Duration) {
        self.stop.release();
        let deadline = Instant::now() + grace;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("keep-alive call still in flight, detaching timer thread");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = self.handle.join();
    }
}

/// Slot holding the cancellation handle of the run currently in flight.
#[derive(Debug, Default)]
pub struct KillSwitch {
    current: Mutex<Option<CancellationController>>,
}

impl KillSwitch {
    fn slot(&self) -> MutexGuard<'_, Option<CancellationController>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, controller: CancellationController) {
        *self.slot() = Some(controller);
    }

    pub fn clear(&self) {
        *self.slot() = None;
    }

    /// Kill the registered run. Returns false when nothing was registered or
    /// the run already had a signal.
    pub fn kill(&self, reason: &str) -> bool {
        self.slot().as_ref().is_some_and(|c| c.kill(reason))
    }

    pub fn abort(&self, reason: &str) -> bool {
        self.slot().as_ref().is_some_and(|c| c.abort(reason))
    }
}

/// Seam between the execute flow and the tracking service.
pub trait SessionTracker: Send + Sync {
    fn start_session(&self) -> Result<()>;

    /// Route remote kill/abort requests to the given run.
    fn register_kill_switch(&self, controller: CancellationController);

    fn stop_session(&self) -> Result<()>;

    /// Abort the running process (if any) and end the session. Idempotent.
    fn abort_session(&self) -> Result<()>;

    fn is_session_stopped(&self) -> bool;

    /// Wait up to `grace` for the `end` notification of a stopped session,
    /// which may be in flight on another thread. Returns false on timeout.
    fn await_session_end(&self, _grace: Duration) -> bool {
        true
    }

    /// `Ok(None)` when there is nothing to check. A failing or missing verdict
    /// is a [`SimrunError::CheckFailure`].
    fn check_results(&self) -> Result<Option<Verdict>>;
}

/// [`SessionTracker`] backed by the HTTP tracking service.
#[derive(Debug)]
pub struct TrackingSession {
    client: Arc<TrackingClient>,
    keep_alive_interval: Duration,
    timer: Mutex<Option<KeepAliveTimer>>,
    stopped: AtomicBool,
    /// Released once the `end` call of stop or abort has returned.
    ended: TeardownLatch,
    kill_switch: KillSwitch,
}

impl TrackingSession {
    pub fn new(client: TrackingClient, keep_alive_interval: Duration) -> Self {
        Self {
            client: Arc::new(client),
            keep_alive_interval,
            timer: Mutex::new(None),
            stopped: AtomicBool::new(false),
            ended: TeardownLatch::new(),
            kill_switch: KillSwitch::default(),
        }
    }

    /// Handle for an external actor that decides to stop the run in flight.
    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    fn stop_timer(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.stop(KEEP_ALIVE_STOP_GRACE);
        }
    }

    fn post_end(&self) -> Result<()> {
        let result = self.client.post_lifecycle(LifecycleAction::End).map(|_| ());
        self.ended.release();
        result
    }
}

impl SessionTracker for TrackingSession {
    fn start_session(&self) -> Result<()> {
        let info = self.client.info();
        info!(
            test_run_id = %info.test_run_id,
            dashboard = %info.dashboard_name,
            product = %info.product_name,
            "starting tracking session"
        );
        let timer = KeepAliveTimer::start(Arc::clone(&self.client), self.keep_alive_interval)?;
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        self.client
            .post_lifecycle(LifecycleAction::KeepAlive)
            .map(|_| ())
    }

    fn register_kill_switch(&self, controller: CancellationController) {
        self.kill_switch.register(controller);
    }

    fn stop_session(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping tracking session");
        self.stop_timer();
        self.kill_switch.clear();
        self.post_end()
    }

    fn abort_session(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("aborting tracking session");
        self.kill_switch.abort("tracking session aborted");
        self.stop_timer();
        self.post_end()
    }

    fn is_session_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn await_session_end(&self, grace: Duration) -> bool {
        if !self.is_session_stopped() || self.ended.wait(grace) {
            return true;
        }
        warn!(
            grace_secs = grace.as_secs(),
            "session end notification still in flight, giving up"
        );
        false
    }

    fn check_results(&self) -> Result<Option<Verdict>> {
        let verdict = self.client.fetch_verdict()?;
        let Some(verdict) = verdict else {
            return Err(SimrunError::CheckFailure(format!(
                "no verdict available for test run {}",
                self.client.info().test_run_id
            ))
            .into());
        };
        if !verdict.passed() {
            return Err(SimrunError::CheckFailure(verdict.failures().join(", ")).into());
        }
        info!("verdict passed");
        Ok(Some(verdict))
    }
}

/// [`SessionTracker`] used when tracking is disabled. Only the kill switch is live.
#[derive(Debug, Default)]
pub struct NoopTracker {
    stopped: AtomicBool,
    kill_switch: KillSwitch,
}

impl NoopTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionTracker for NoopTracker {
    fn start_session(&self) -> Result<()> {
        warn!("tracking is disabled, no lifecycle events or verdict for this run");
        Ok(())
    }

    fn register_kill_switch(&self, controller: CancellationController) {
        self.kill_switch.register(controller);
    }

    fn stop_session(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.kill_switch.clear();
        Ok(())
    }

    fn abort_session(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.kill_switch.abort("session aborted");
        }
        Ok(())
    }

    fn is_session_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_results(&self) -> Result<Option<Verdict>> {
        Ok(None)
    }
}
