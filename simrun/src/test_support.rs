//! Test-only fakes for the scenario runner and the session tracker.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::core::types::{RunClassification, RunOutcome};
use crate::error::SimrunError;
use crate::io::cancel::CancellationController;
use crate::io::tracking::{KillSwitch, SessionTracker, Verdict};
use crate::orchestrator::ScenarioRunner;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted outcome for a classification, with the exit code the child would report.
pub fn outcome(classification: RunClassification) -> RunOutcome {
    let code = match classification {
        RunClassification::Success => Some(0),
        RunClassification::AssertionFailure => Some(2),
        RunClassification::ExecutionFailure => Some(1),
        RunClassification::Killed | RunClassification::Aborted => None,
    };
    RunOutcome::new(code, classification, "scripted")
}

/// [`ScenarioRunner`] that replays queued classifications.
///
/// Once the queue is empty every further run succeeds.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<RunClassification>>,
    scenarios: Mutex<Vec<String>>,
    run_dirs_in: Option<PathBuf>,
}

impl ScriptedRunner {
    pub fn new(classifications: Vec<RunClassification>) -> Self {
        Self {
            queue: Mutex::new(classifications.into()),
            ..Self::default()
        }
    }

    /// Create one run directory under `results_dir` per scenario, like the real child.
    pub fn creating_run_dirs(mut self, results_dir: &Path) -> Self {
        self.run_dirs_in = Some(results_dir.to_path_buf());
        self
    }

    /// Scenarios run so far, in order.
    pub fn scenarios(&self) -> Vec<String> {
        lock(&self.scenarios).clone()
    }
}

impl ScenarioRunner for ScriptedRunner {
    fn run_scenario(&self, scenario: &str, cancellation: &CancellationController) -> RunOutcome {
        let run = {
            let mut scenarios = lock(&self.scenarios);
            scenarios.push(scenario.to_string());
            scenarios.len()
        };
        if let Some(dir) = &self.run_dirs_in {
            let _ = fs::create_dir_all(dir.join(format!("{}-{run}", scenario.to_lowercase())));
        }
        let classification = lock(&self.queue)
            .pop_front()
            .unwrap_or(RunClassification::Success);
        match classification {
            RunClassification::Killed => {
                cancellation.kill("scripted kill");
            }
            RunClassification::Aborted => {
                cancellation.abort("scripted abort");
            }
            _ => {}
        }
        outcome(classification)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Start,
    Stop,
    Abort,
    CheckResults,
}

/// [`SessionTracker`] that records calls instead of talking HTTP.
#[derive(Debug, Default)]
pub struct RecordingTracker {
    events: Mutex<Vec<TrackerEvent>>,
    stopped: AtomicBool,
    registrations: AtomicUsize,
    check_failure: Option<String>,
    kill_switch: KillSwitch,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker whose verdict check fails with `reason`.
    pub fn failing_check(reason: &str) -> Self {
        Self {
            check_failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<TrackerEvent> {
        lock(&self.events).clone()
    }

    pub fn kill_switch_registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    fn push(&self, event: TrackerEvent) {
        lock(&self.events).push(event);
    }
}

impl SessionTracker for RecordingTracker {
    fn start_session(&self) -> Result<()> {
        self.push(TrackerEvent::Start);
        Ok(())
    }

    fn register_kill_switch(&self, controller: CancellationController) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.kill_switch.register(controller);
    }

    fn stop_session(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.push(TrackerEvent::Stop);
        }
        Ok(())
    }

    fn abort_session(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.kill_switch.abort("recording tracker aborted");
            self.push(TrackerEvent::Abort);
        }
        Ok(())
    }

    fn is_session_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_results(&self) -> Result<Option<Verdict>> {
        self.push(TrackerEvent::CheckResults);
        match &self.check_failure {
            Some(reason) => Err(SimrunError::CheckFailure(reason.clone()).into()),
            None => Ok(Some(Verdict {
                meets_requirement: Some(true),
                benchmark_result_previous_ok: Some(true),
                benchmark_result_fixed_ok: Some(true),
            })),
        }
    }
}
