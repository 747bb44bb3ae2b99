//! Shared deterministic types for simrun core logic.
//!
//! These types define stable contracts between the process runner, the
//! orchestrator and the session layer. They hold no I/O handles.

use serde::{Deserialize, Serialize};

use crate::error::SimrunError;

/// Cancellation request recorded for one run session.
///
/// Starts at `None` and moves to `Kill` or `Abort` at most once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancellationSignal {
    #[default]
    None,
    Kill,
    Abort,
}

/// Classification of a single run. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunClassification {
    Success,
    /// The child completed but exited with the designated assertion code.
    AssertionFailure,
    /// Any other non-zero exit, a signal death, or a launch error.
    ExecutionFailure,
    Killed,
    Aborted,
}

/// Result of one supervised process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Raw exit code; `None` when the process never started or died from a signal.
    pub exit_code: Option<i32>,
    pub classification: RunClassification,
    /// Human-readable cause (cancellation reason, launch error, exit status).
    pub detail: String,
}

impl RunOutcome {
    pub fn new(
        exit_code: Option<i32>,
        classification: RunClassification,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            exit_code,
            classification,
            detail: detail.into(),
        }
    }

    /// Outcome for a process that could not be launched at all.
    pub fn launch_failure(detail: impl Into<String>) -> Self {
        Self::new(None, RunClassification::ExecutionFailure, detail)
    }

    pub fn is_success(&self) -> bool {
        self.classification == RunClassification::Success
    }
}

/// One iteration of the scenario sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationRun {
    /// Zero-based position in the sequence.
    pub index: usize,
    pub total: usize,
    pub scenario: String,
    pub outcome: RunOutcome,
}

impl SimulationRun {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }

    /// Convert a failed run into the error carried to the caller.
    ///
    /// Returns `None` for successful runs.
    pub fn to_error(&self) -> Option<SimrunError> {
        let scenario = self.scenario.clone();
        let detail = self.outcome.detail.clone();
        match self.outcome.classification {
            RunClassification::Success => None,
            RunClassification::AssertionFailure => Some(SimrunError::AssertionFailure {
                scenario,
                exit_code: self.outcome.exit_code.unwrap_or_default(),
            }),
            RunClassification::ExecutionFailure => {
                Some(SimrunError::ExecutionFailure { scenario, detail })
            }
            RunClassification::Killed => Some(SimrunError::Killed {
                scenario,
                reason: detail,
            }),
            RunClassification::Aborted => Some(SimrunError::Aborted {
                scenario,
                reason: detail,
            }),
        }
    }
}

/// Policy flags that decide whether a failed run ends the sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuationPolicy {
    /// Keep running later scenarios after an assertion failure.
    pub continue_on_assertion_failure: bool,
}

/// The single outcome surfaced for a whole scenario sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    /// Number of scenarios that were actually started.
    pub executed: usize,
    pub total: usize,
    /// The run whose failure is surfaced, if any.
    pub failure: Option<SimulationRun>,
    /// At least one assertion failure was folded and later scenarios still ran.
    pub continued_past_failures: bool,
}

impl AggregateResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// The carried failure as a typed error.
    pub fn error(&self) -> Option<SimrunError> {
        self.failure.as_ref().and_then(SimulationRun::to_error)
    }
}
