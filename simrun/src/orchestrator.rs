//! Scenario sequencing for `simrun run`.
//!
//! Runs each scenario in order with a fresh [`CancellationController`],
//! registers that controller as the tracker's kill switch for the duration of
//! the run, and folds outcomes through the continuation policy.

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::aggregate::{Aggregator, Step};
use crate::core::path::{same_directory, to_windows_short_name};
use crate::core::types::{AggregateResult, ContinuationPolicy, RunOutcome, SimulationRun};
use crate::error::SimrunError;
use crate::io::cancel::CancellationController;
use crate::io::config::SimrunConfig;
use crate::io::process::{ProcessRunner, ProcessSpec};
use crate::io::tracking::SessionTracker;

/// Runs one scenario to completion. Seam for tests.
pub trait ScenarioRunner {
    fn run_scenario(&self, scenario: &str, cancellation: &CancellationController) -> RunOutcome;
}

/// Keep the variables that are valid Unicode. The rest are dropped with a warning.
pub fn unicode_environment<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            (name, _) => {
                let name = name.unwrap_or_else(|raw| raw.to_string_lossy().into_owned());
                warn!(name = %name, "variable is not valid unicode, can't be propagated");
                None
            }
        })
        .collect()
}

/// Forks the configured runtime once per scenario.
#[derive(Debug, Clone)]
pub struct ForkedScenarioRunner {
    runner: ProcessRunner,
    executable: PathBuf,
    config: SimrunConfig,
    environment: Vec<(String, String)>,
}

impl ForkedScenarioRunner {
    /// `environment` is forwarded only when `propagate_environment` is set.
    pub fn new(
        config: &SimrunConfig,
        executable: PathBuf,
        environment: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let environment = if config.propagate_environment {
            environment.into_iter().collect()
        } else {
            Vec::new()
        };
        let executable = PathBuf::from(to_windows_short_name(
            &executable.display().to_string(),
            cfg!(windows),
            same_directory,
        ));
        Self {
            runner: ProcessRunner::new(config.assertion_failure_code),
            executable,
            config: config.clone(),
            environment,
        }
    }

    pub fn spec(&self, scenario: &str) -> ProcessSpec {
        ProcessSpec::builder(&self.executable, self.config.main_entry.clone())
            .runtime_options(self.config.effective_runtime_options())
            .propagate_environment(self.environment.iter().cloned(), cfg!(windows))
            .args(self.config.scenario_args(scenario))
            .working_directory(self.config.working_directory.clone())
            .build()
    }
}

impl ScenarioRunner for ForkedScenarioRunner {
    fn run_scenario(&self, scenario: &str, cancellation: &CancellationController) -> RunOutcome {
        self.runner.run(&self.spec(scenario), cancellation)
    }
}

/// Drives a scenario sequence under a [`ContinuationPolicy`].
#[derive(Debug)]
pub struct RunOrchestrator<'a, R: ScenarioRunner> {
    runner: &'a R,
    policy: ContinuationPolicy,
}

impl<'a, R: ScenarioRunner> RunOrchestrator<'a, R> {
    pub fn new(runner: &'a R, policy: ContinuationPolicy) -> Self {
        Self { runner, policy }
    }

    /// Run `scenarios` in order and return the aggregate.
    ///
    /// Run failures are carried in the returned [`AggregateResult`]; only an
    /// empty scenario list is an error. `on_run` sees every finished run.
    #[instrument(skip_all, fields(scenarios = scenarios.len()))]
    pub fn run_sequence<F: FnMut(&SimulationRun)>(
        &self,
        scenarios: &[String],
        tracker: &dyn SessionTracker,
        mut on_run: F,
    ) -> Result<AggregateResult> {
        if scenarios.is_empty() {
            return Err(SimrunError::Configuration("no scenarios to run".to_string()).into());
        }
        let total = scenarios.len();
        let mut aggregator = Aggregator::new(total, self.policy);

        for (index, scenario) in scenarios.iter().enumerate() {
            info!(scenario = %scenario, run = index + 1, total, "running scenario");
            aggregator.begin(index);

            let cancellation = CancellationController::new();
            tracker.register_kill_switch(cancellation.clone());
            let outcome = self.runner.run_scenario(scenario, &cancellation);
            info!(
                scenario = %scenario,
                classification = ?outcome.classification,
                exit_code = ?outcome.exit_code,
                "scenario finished"
            );

            let run = SimulationRun {
                index,
                total,
                scenario: scenario.clone(),
                outcome,
            };
            on_run(&run);
            if aggregator.record(run) == Step::Stop {
                break;
            }
        }

        let result = aggregator.finish();
        if result.continued_past_failures {
            warn!(
                "some scenarios failed their assertions, but continue_on_assertion_failure \
                 was set, so the remaining scenarios still ran"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunClassification;
    use crate::io::config::CLASSPATH_URL_CHECK_OPTION;
    use crate::io::tracking::NoopTracker;
    use crate::test_support::ScriptedRunner;

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("com.example.Scenario{i}")).collect()
    }

    #[test]
    fn empty_sequence_is_configuration_error() {
        let runner = ScriptedRunner::new(vec![]);
        let orchestrator = RunOrchestrator::new(&runner, ContinuationPolicy::default());
        let err = orchestrator
            .run_sequence(&[], &NoopTracker::new(), |_| {})
            .expect_err("empty");
        let typed = crate::error::find_simrun_error(&err).expect("typed");
        assert_eq!(typed.kind(), "ConfigurationError");
    }

    #[test]
    fn stop_on_first_assertion_failure_without_policy() {
        let runner = ScriptedRunner::new(vec![
            RunClassification::Success,
            RunClassification::AssertionFailure,
        ]);
        let orchestrator = RunOrchestrator::new(&runner, ContinuationPolicy::default());
        let mut seen = Vec::new();
        let result = orchestrator
            .run_sequence(&names(5), &NoopTracker::new(), |run| seen.push(run.index))
            .expect("sequence");

        assert_eq!(seen, vec![0, 1]);
        assert_eq!(runner.scenarios(), names(2));
        assert_eq!(result.executed, 2);
        assert_eq!(result.failure.expect("failure").scenario, "com.example.Scenario2");
    }

    #[test]
    fn each_run_gets_its_own_kill_switch() {
        let runner = ScriptedRunner::new(vec![RunClassification::Success; 3]);
        let orchestrator = RunOrchestrator::new(&runner, ContinuationPolicy::default());
        let tracker = crate::test_support::RecordingTracker::new();
        orchestrator
            .run_sequence(&names(3), &tracker, |_| {})
            .expect("sequence");
        assert_eq!(tracker.kill_switch_registrations(), 3);
    }

    #[test]
    fn forked_spec_uses_config() {
        let mut cfg = SimrunConfig::default();
        cfg.propagate_environment = false;
        cfg.results_dir = PathBuf::from("/results");
        let runner = ForkedScenarioRunner::new(
            &cfg,
            PathBuf::from("/jdk/bin/java"),
            vec![("gatling.users".to_string(), "3".to_string())],
        );
        let spec = runner.spec("com.Foo");
        assert_eq!(spec.executable(), PathBuf::from("/jdk/bin/java").as_path());
        assert!(spec.forwarded_options().is_empty());
        assert_eq!(spec.args(), ["-rf", "/results", "-s", "com.Foo"]);
        let words = spec.command_line(std::path::Path::new("/tmp/a.args"));
        assert!(words.contains(&CLASSPATH_URL_CHECK_OPTION.to_string()));
        assert_eq!(words[words.len() - 2], crate::io::config::DEFAULT_MAIN_ENTRY);
    }

    #[cfg(unix)]
    #[test]
    fn non_unicode_variables_are_dropped() {
        use std::os::unix::ffi::OsStringExt;

        let vars = vec![
            (OsString::from("gatling.users"), OsString::from("3")),
            (OsString::from("BROKEN"), OsString::from_vec(vec![0xff, 0xfe])),
            (OsString::from_vec(vec![0xc3, 0x28]), OsString::from("x")),
        ];
        assert_eq!(
            unicode_environment(vars),
            vec![("gatling.users".to_string(), "3".to_string())]
        );
    }

    #[test]
    fn forked_spec_forwards_environment_when_enabled() {
        let mut cfg = SimrunConfig::default();
        cfg.propagate_environment = true;
        let runner = ForkedScenarioRunner::new(
            &cfg,
            PathBuf::from("/jdk/bin/java"),
            vec![
                ("gatling.users".to_string(), "3".to_string()),
                ("java.home".to_string(), "/jdk".to_string()),
            ],
        );
        assert_eq!(runner.spec("a").forwarded_options(), ["-Dgatling.users=3"]);
    }
}
