//! Error taxonomy shared by the orchestration layers.
//!
//! Library functions return `anyhow::Result`; these variants travel inside the
//! `anyhow::Error` so the top level can recover them with `downcast_ref` and
//! decide between failing the build and downgrading to a warning.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimrunError {
    /// Raised before any work starts (toolchain, URLs, config values).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The child process could not be launched or exited with an unexpected status.
    #[error("scenario {scenario} failed: {detail}")]
    ExecutionFailure { scenario: String, detail: String },

    /// The child ran to completion but reported failed assertions.
    #[error("scenario {scenario} reported assertion failures (exit code {exit_code})")]
    AssertionFailure { scenario: String, exit_code: i32 },

    #[error("scenario {scenario} was killed: {reason}")]
    Killed { scenario: String, reason: String },

    #[error("scenario {scenario} was aborted: {reason}")]
    Aborted { scenario: String, reason: String },

    /// A reporting call never succeeded within the retry budget.
    #[error("max retries reached: unable to retrieve url [{url}] after {attempts} attempts")]
    RetryExhausted { url: String, attempts: u32 },

    /// The tracking service judged the test run as failing.
    #[error("result check failed: {0}")]
    CheckFailure(String),
}

impl SimrunError {
    /// Short stable name used in the last-run marker file.
    pub fn kind(&self) -> &'static str {
        match self {
            SimrunError::Configuration(_) => "ConfigurationError",
            SimrunError::ExecutionFailure { .. } => "ExecutionFailure",
            SimrunError::AssertionFailure { .. } => "AssertionFailure",
            SimrunError::Killed { .. } => "KillSignal",
            SimrunError::Aborted { .. } => "AbortSignal",
            SimrunError::RetryExhausted { .. } => "RetryExhausted",
            SimrunError::CheckFailure(_) => "CheckFailure",
        }
    }

    /// True when an operator or scheduler intervened, as opposed to a test failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SimrunError::Killed { .. } | SimrunError::Aborted { .. })
    }
}

/// Find the first [`SimrunError`] in an error chain.
pub fn find_simrun_error(err: &anyhow::Error) -> Option<&SimrunError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SimrunError>())
}
