//! Stable exit codes for simrun CLI commands.

/// Every scenario ran and the verdict (if any) passed.
pub const OK: i32 = 0;
/// Invalid configuration, execution failure, or another runner error.
pub const FAILED: i32 = 1;
/// A scenario reported assertion failures or the verdict check failed.
pub const ASSERTION_FAILED: i32 = 2;
/// The run was aborted or killed by an operator or the tracking service.
pub const CANCELLED: i32 = 3;
