//! Continuation policy for a scenario sequence.
//!
//! The [`Aggregator`] is fed one [`SimulationRun`] at a time and answers
//! whether the sequence continues. Rules:
//!
//! - `Success` continues.
//! - `ExecutionFailure`, `Killed` and `Aborted` always stop the sequence and
//!   are surfaced as-is; the continuation policy never applies to them.
//! - `AssertionFailure` stops the sequence unless
//!   `continue_on_assertion_failure` is set. With the policy set, only the
//!   first assertion failure is kept and surfaced after the last scenario.
//! - An assertion failure in the last scenario with no earlier failure kept is
//!   surfaced immediately, whatever the policy says.

use crate::core::types::{
    AggregateResult, ContinuationPolicy, RunClassification, SimulationRun,
};

/// Decision returned after each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// Sequence state, as seen from outside the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Pending,
    Running(usize),
    Continuing,
    Terminated,
}

#[derive(Debug)]
pub struct Aggregator {
    total: usize,
    policy: ContinuationPolicy,
    state: SequenceState,
    executed: usize,
    /// First assertion failure folded under the continuation policy.
    recorded: Option<SimulationRun>,
    /// Failure that ended the sequence early.
    terminal: Option<SimulationRun>,
}

impl Aggregator {
    pub fn new(total: usize, policy: ContinuationPolicy) -> Self {
        Self {
            total,
            policy,
            state: SequenceState::Pending,
            executed: 0,
            recorded: None,
            terminal: None,
        }
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Mark scenario `index` as started.
    pub fn begin(&mut self, index: usize) {
        self.executed += 1;
        self.state = SequenceState::Running(index);
    }

    /// Fold a finished run into the aggregate.
    pub fn record(&mut self, run: SimulationRun) -> Step {
        let step = match run.outcome.classification {
            RunClassification::Success => Step::Continue,
            RunClassification::AssertionFailure => self.record_assertion_failure(run),
            RunClassification::ExecutionFailure
            | RunClassification::Killed
            | RunClassification::Aborted => {
                self.terminal = Some(run);
                Step::Stop
            }
        };
        self.state = match step {
            Step::Continue => SequenceState::Continuing,
            Step::Stop => SequenceState::Terminated,
        };
        step
    }

    fn record_assertion_failure(&mut self, run: SimulationRun) -> Step {
        if self.recorded.is_none() && run.is_last() {
            self.terminal = Some(run);
            return Step::Stop;
        }
        if !self.policy.continue_on_assertion_failure {
            self.terminal = Some(run);
            return Step::Stop;
        }
        if self.recorded.is_none() {
            self.recorded = Some(run);
        }
        Step::Continue
    }

    pub fn finish(mut self) -> AggregateResult {
        self.state = SequenceState::Terminated;
        let continued_past_failures = self.recorded.is_some() && self.terminal.is_none();
        AggregateResult {
            executed: self.executed,
            total: self.total,
            failure: self.terminal.or(self.recorded),
            continued_past_failures,
        }
    }
}
