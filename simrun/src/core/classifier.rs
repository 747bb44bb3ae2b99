//! Deterministic classification of process exits.

use crate::core::types::{CancellationSignal, RunClassification};

/// Exit code the test-execution process uses for failed assertions.
pub const DEFAULT_ASSERTION_FAILURE_CODE: i32 = 2;

/// Classify a finished process.
///
/// - A recorded `Kill`/`Abort` wins over the raw exit status: a forced
///   termination yields a platform-specific code that is not an execution failure.
/// - `0` is `Success`, `assertion_failure_code` is `AssertionFailure`.
/// - Any other code, or no code at all (signal death, launch error), is
///   `ExecutionFailure`.
pub fn classify_exit(
    exit_code: Option<i32>,
    signal: CancellationSignal,
    assertion_failure_code: i32,
) -> RunClassification {
    match signal {
        CancellationSignal::Kill => return RunClassification::Killed,
        CancellationSignal::Abort => return RunClassification::Aborted,
        CancellationSignal::None => {}
    }
    match exit_code {
        Some(0) => RunClassification::Success,
        Some(code) if code == assertion_failure_code => RunClassification::AssertionFailure,
        Some(_) | None => RunClassification::ExecutionFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: i32 = DEFAULT_ASSERTION_FAILURE_CODE;

    #[test]
    fn zero_without_cancellation_is_success() {
        assert_eq!(
            classify_exit(Some(0), CancellationSignal::None, CODE),
            RunClassification::Success
        );
    }

    #[test]
    fn assertion_code_is_assertion_failure() {
        assert_eq!(
            classify_exit(Some(2), CancellationSignal::None, CODE),
            RunClassification::AssertionFailure
        );
    }

    #[test]
    fn other_codes_are_execution_failures() {
        for code in [Some(1), Some(3), Some(143), Some(-1), None] {
            assert_eq!(
                classify_exit(code, CancellationSignal::None, CODE),
                RunClassification::ExecutionFailure,
                "code {code:?}"
            );
        }
    }

    #[test]
    fn cancellation_overrides_exit_status() {
        for code in [Some(0), Some(2), Some(143), None] {
            assert_eq!(
                classify_exit(code, CancellationSignal::Kill, CODE),
                RunClassification::Killed
            );
            assert_eq!(
                classify_exit(code, CancellationSignal::Abort, CODE),
                RunClassification::Aborted
            );
        }
    }

    #[test]
    fn custom_assertion_code_is_honored() {
        assert_eq!(
            classify_exit(Some(7), CancellationSignal::None, 7),
            RunClassification::AssertionFailure
        );
        assert_eq!(
            classify_exit(Some(2), CancellationSignal::None, 7),
            RunClassification::ExecutionFailure
        );
    }
}
