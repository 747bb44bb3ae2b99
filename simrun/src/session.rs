//! The `simrun run` flow around one scenario sequence.
//!
//! Order of work: results directory and snapshot, tracking session start,
//! shutdown hook, the scenario sequence, the `lastRun.txt` marker, then
//! session stop, verdict check and the optional remote-system call.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::core::types::{AggregateResult, ContinuationPolicy};
use crate::error::{SimrunError, find_simrun_error};
use crate::io::config::SimrunConfig;
use crate::io::http::ReportingClient;
use crate::io::last_run::{run_directories, write_last_run};
use crate::io::remote_system::{RemoteSystemClient, RemoteSystemUrl, TestRunClock};
use crate::io::shutdown::{SHUTDOWN_GRACE, ShutdownHook};
use crate::io::toolchain::resolve_from_env;
use crate::io::tracking::{NoopTracker, SessionTracker, TrackingClient, TrackingSession, Verdict};
use crate::orchestrator::{
    ForkedScenarioRunner, RunOrchestrator, ScenarioRunner, unicode_environment,
};

/// What a finished `simrun run` produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub aggregate: Option<AggregateResult>,
    /// Run directories created by this invocation, as listed in `lastRun.txt`.
    pub new_run_directories: Vec<String>,
    pub verdict: Option<Verdict>,
    pub remote_system_reply: Option<String>,
    /// Failures that were downgraded instead of surfaced.
    pub warnings: Vec<String>,
}

/// One execution of the configured scenarios against a tracker.
pub struct Session<'a> {
    config: &'a SimrunConfig,
    tracker: Arc<dyn SessionTracker>,
    remote_system: Option<RemoteSystemClient>,
    shutdown_hook: bool,
}

impl<'a> Session<'a> {
    pub fn new(config: &'a SimrunConfig, tracker: Arc<dyn SessionTracker>) -> Self {
        Self {
            config,
            tracker,
            remote_system: None,
            shutdown_hook: false,
        }
    }

    pub fn with_remote_system(mut self, client: Option<RemoteSystemClient>) -> Self {
        self.remote_system = client;
        self
    }

    /// Register the process-wide Ctrl-C / SIGTERM hook while running.
    pub fn with_shutdown_hook(mut self, enabled: bool) -> Self {
        self.shutdown_hook = enabled;
        self
    }

    /// Run the sequence and report it.
    ///
    /// Does not return before the session's `end` notification has been
    /// delivered (or given up on), even when another thread, such as the
    /// shutdown hook, aborted the session.
    #[instrument(skip_all, fields(results_dir = %self.config.results_dir.display()))]
    pub fn run<R: ScenarioRunner>(&self, runner: &R) -> Result<ExecutionReport> {
        let result = self.run_and_report(runner);
        self.tracker.await_session_end(SHUTDOWN_GRACE);
        result
    }

    fn run_and_report<R: ScenarioRunner>(&self, runner: &R) -> Result<ExecutionReport> {
        let config = self.config;
        let results_dir = &config.results_dir;
        fs::create_dir_all(results_dir)
            .with_context(|| format!("create results directory {}", results_dir.display()))?;
        let existing = run_directories(results_dir)?;
        let scenarios = config.scenario_list()?;

        let mut report = ExecutionReport::default();
        let mut clock = TestRunClock::started_now();
        if let Err(err) = self.tracker.start_session() {
            warn!(err = %format!("{err:#}"), "failed to report session start");
        }
        let _hook = if self.shutdown_hook {
            Some(ShutdownHook::install(Arc::clone(&self.tracker))?)
        } else {
            None
        };

        let policy = ContinuationPolicy {
            continue_on_assertion_failure: config.continue_on_assertion_failure,
        };
        let sequence = RunOrchestrator::new(runner, policy).run_sequence(
            &scenarios,
            self.tracker.as_ref(),
            |_| {},
        );
        clock.stop_now();

        let failure = match sequence {
            Ok(aggregate) => {
                let failure = aggregate.error().map(anyhow::Error::from);
                report.aggregate = Some(aggregate);
                failure
            }
            Err(err) => Some(err),
        };
        let typed = failure.as_ref().and_then(find_simrun_error).cloned();
        let killed = matches!(typed, Some(SimrunError::Killed { .. }));
        let aborted = matches!(typed, Some(SimrunError::Aborted { .. }));

        let marker_error = failure.as_ref().filter(|_| !killed);
        match write_last_run(results_dir, &existing, marker_error) {
            Ok(created) => report.new_run_directories = created,
            Err(err) if failure.is_some() => {
                error!(err = %format!("{err:#}"), "failed to record simulation results");
            }
            Err(err) => {
                self.stop_session();
                return Err(err);
            }
        }

        if let Some(err) = failure {
            if killed {
                warn!(err = %err, "kill switch stopped the run, checking results anyway");
                report.warnings.push(format!("{err:#}"));
            } else {
                if aborted || config.fail_on_error {
                    self.abort_session();
                }
                if config.fail_on_error {
                    return Err(err);
                }
                warn!(
                    err = %format!("{err:#}"),
                    "there were errors while running the scenarios, but fail_on_error is false"
                );
                report.warnings.push(format!("{err:#}"));
            }
        }

        if !self.tracker.is_session_stopped() {
            self.stop_session();
            match self.tracker.check_results() {
                Ok(verdict) => report.verdict = verdict,
                Err(err) => {
                    let check_failure =
                        matches!(find_simrun_error(&err), Some(SimrunError::CheckFailure(_)));
                    if !(check_failure && config.continue_on_check_failure) {
                        return Err(err);
                    }
                    warn!(
                        err = %format!("{err:#}"),
                        "result check failed, but continue_on_check_failure is set"
                    );
                    report.warnings.push(format!("{err:#}"));
                }
            }
        }

        if !aborted {
            report.remote_system_reply = self.call_remote_system(&clock, &mut report.warnings)?;
        }
        info!(
            new_runs = report.new_run_directories.len(),
            warnings = report.warnings.len(),
            "run finished"
        );
        Ok(report)
    }

    fn stop_session(&self) {
        if let Err(err) = self.tracker.stop_session() {
            warn!(err = %format!("{err:#}"), "failed to report session end");
        }
    }

    fn abort_session(&self) {
        if let Err(err) = self.tracker.abort_session() {
            warn!(err = %format!("{err:#}"), "failed to report session abort");
        }
    }

    fn call_remote_system(
        &self,
        clock: &TestRunClock,
        warnings: &mut Vec<String>,
    ) -> Result<Option<String>> {
        let (Some(client), Some(template)) = (&self.remote_system, &self.config.remote_system.url)
        else {
            return Ok(None);
        };
        let url = RemoteSystemUrl::new(template, clock)?;
        match client.call(&url) {
            Ok(reply) => Ok(Some(reply)),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "remote system call failed");
                warnings.push(format!("{err:#}"));
                Ok(None)
            }
        }
    }
}

/// Tracker for `config`: HTTP when tracking is enabled, otherwise a no-op.
pub fn build_tracker(config: &SimrunConfig) -> Result<Arc<dyn SessionTracker>> {
    let tracking = &config.tracking;
    if !tracking.enabled {
        return Ok(Arc::new(NoopTracker::new()));
    }
    let transport = ReportingClient::new(&tracking.headers, config.retry.policy())?;
    let client = TrackingClient::new(&tracking.base_url, tracking.test_run_info(), transport);
    Ok(Arc::new(TrackingSession::new(
        client,
        tracking.keep_alive_interval(),
    )))
}

pub fn build_remote_system(config: &SimrunConfig) -> Result<Option<RemoteSystemClient>> {
    if config.remote_system.url.is_none() {
        return Ok(None);
    }
    let transport = ReportingClient::new(&config.tracking.headers, config.retry.policy())?;
    Ok(Some(RemoteSystemClient::new(transport)))
}

/// Resolve the runtime, fork it per scenario, and report to the tracking service.
pub fn execute(config: &SimrunConfig) -> Result<ExecutionReport> {
    config.validate()?;
    let executable = resolve_from_env(config.executable.as_deref())?;
    let runner = ForkedScenarioRunner::new(
        config,
        executable,
        unicode_environment(std::env::vars_os()),
    );
    let tracker = build_tracker(config)?;
    let remote_system = build_remote_system(config)?;
    Session::new(config, tracker)
        .with_remote_system(remote_system)
        .with_shutdown_hook(true)
        .run(&runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunClassification;
    use crate::io::last_run::{LAST_RUN_ERROR_PREFIX, LAST_RUN_FILE};
    use crate::test_support::{RecordingTracker, ScriptedRunner, TrackerEvent};

    fn config(dir: &std::path::Path, scenarios: usize) -> SimrunConfig {
        let mut cfg = SimrunConfig::default();
        cfg.results_dir = dir.join("results");
        cfg.scenarios = (1..=scenarios).map(|i| format!("com.example.S{i}")).collect();
        cfg.run_multiple_scenarios = true;
        cfg
    }

    fn marker(cfg: &SimrunConfig) -> String {
        fs::read_to_string(cfg.results_dir.join(LAST_RUN_FILE)).expect("marker")
    }

    #[test]
    fn success_stops_session_and_checks_verdict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path(), 2);
        let runner = ScriptedRunner::new(vec![RunClassification::Success; 2]).creating_run_dirs(&cfg.results_dir);
        let tracker = Arc::new(RecordingTracker::new());

        let report = Session::new(&cfg, tracker.clone()).run(&runner).expect("run");

        assert_eq!(report.new_run_directories.len(), 2);
        assert!(report.warnings.is_empty());
        assert_eq!(
            tracker.events(),
            vec![TrackerEvent::Start, TrackerEvent::Stop, TrackerEvent::CheckResults]
        );
        assert!(!marker(&cfg).contains(LAST_RUN_ERROR_PREFIX));
    }

    #[test]
    fn execution_failure_aborts_session_and_surfaces() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path(), 3);
        let runner = ScriptedRunner::new(vec![RunClassification::ExecutionFailure]);
        let tracker = Arc::new(RecordingTracker::new());

        let err = Session::new(&cfg, tracker.clone()).run(&runner).expect_err("failure");

        assert_eq!(find_simrun_error(&err).map(SimrunError::kind), Some("ExecutionFailure"));
        assert_eq!(runner.scenarios().len(), 1);
        assert_eq!(tracker.events(), vec![TrackerEvent::Start, TrackerEvent::Abort]);
        let marker = marker(&cfg);
        let last = marker.lines().last().expect("error line");
        assert!(last.starts_with("Error: ExecutionFailure: scenario com.example.S1"));
    }

    #[test]
    fn aborted_run_never_checks_verdict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(temp.path(), 2);
        cfg.fail_on_error = false;
        let runner = ScriptedRunner::new(vec![RunClassification::Aborted]);
        let tracker = Arc::new(RecordingTracker::new());

        let report = Session::new(&cfg, tracker.clone()).run(&runner).expect("downgraded");

        assert_eq!(report.verdict, None);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(tracker.events(), vec![TrackerEvent::Start, TrackerEvent::Abort]);
        assert!(marker(&cfg).contains("Error: AbortSignal"));
    }

    #[test]
    fn killed_run_still_checks_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path(), 2);
        let runner = ScriptedRunner::new(vec![RunClassification::Killed]);
        let tracker = Arc::new(RecordingTracker::new());

        let report = Session::new(&cfg, tracker.clone()).run(&runner).expect("kill is benign");

        assert_eq!(runner.scenarios().len(), 1);
        assert_eq!(
            tracker.events(),
            vec![TrackerEvent::Start, TrackerEvent::Stop, TrackerEvent::CheckResults]
        );
        assert_eq!(report.warnings.len(), 1);
        assert!(!marker(&cfg).contains(LAST_RUN_ERROR_PREFIX));
    }

    #[test]
    fn assertion_failure_is_warning_without_fail_on_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(temp.path(), 1);
        cfg.fail_on_error = false;
        let runner = ScriptedRunner::new(vec![RunClassification::AssertionFailure]);
        let tracker = Arc::new(RecordingTracker::new());

        let report = Session::new(&cfg, tracker.clone()).run(&runner).expect("downgraded");

        assert_eq!(report.warnings.len(), 1);
        assert!(tracker.events().contains(&TrackerEvent::CheckResults));
        assert!(marker(&cfg).contains("Error: AssertionFailure"));
    }

    #[test]
    fn check_failure_follows_its_own_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(temp.path(), 1);
        let runner = ScriptedRunner::new(vec![RunClassification::Success]);

        let tracker = Arc::new(RecordingTracker::failing_check("meetsRequirement=false"));
        let err = Session::new(&cfg, tracker).run(&runner).expect_err("check failure");
        assert_eq!(find_simrun_error(&err).map(SimrunError::kind), Some("CheckFailure"));

        cfg.continue_on_check_failure = true;
        let tracker = Arc::new(RecordingTracker::failing_check("meetsRequirement=false"));
        let report = Session::new(&cfg, tracker).run(&runner).expect("downgraded");
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn marker_failure_still_ends_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path(), 1);
        // A directory where the marker file belongs makes the final rename fail.
        fs::create_dir_all(cfg.results_dir.join(LAST_RUN_FILE)).expect("mkdir");
        let runner = ScriptedRunner::new(vec![RunClassification::Success]);
        let tracker = Arc::new(RecordingTracker::new());

        let err = Session::new(&cfg, tracker.clone()).run(&runner).expect_err("marker");

        assert!(format!("{err:#}").contains("record simulation results"));
        assert_eq!(tracker.events(), vec![TrackerEvent::Start, TrackerEvent::Stop]);
    }

    #[test]
    fn no_scenarios_is_configuration_error_before_any_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path(), 0);
        let runner = ScriptedRunner::new(vec![]);
        let tracker = Arc::new(RecordingTracker::new());

        let err = Session::new(&cfg, tracker.clone()).run(&runner).expect_err("config");
        assert_eq!(find_simrun_error(&err).map(SimrunError::kind), Some("ConfigurationError"));
        assert!(tracker.events().is_empty());
    }

    #[test]
    fn disabled_tracking_uses_noop_tracker() {
        let tracker = build_tracker(&SimrunConfig::default()).expect("tracker");
        assert!(!tracker.is_session_stopped());
        assert_eq!(tracker.check_results().expect("check"), None);
    }
}
