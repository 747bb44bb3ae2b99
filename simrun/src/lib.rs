//! Supervised simulation runs with remote lifecycle tracking.
//!
//! This crate forks an external test-execution process once per scenario,
//! lets other threads cancel the running process, folds the per-run outcomes
//! into one result under a continuation policy, and reports the session
//! lifecycle and verdict to a tracking service over HTTP. The layout keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (outcome classification, the
//!   continuation policy, platform path and environment rules). No I/O.
//! - **[`io`]**: Side-effecting adapters (process supervision, cancellation,
//!   HTTP reporting, configuration, result markers, shutdown handling).
//!
//! Orchestration modules ([`orchestrator`], [`session`]) coordinate core logic
//! with I/O to implement the `simrun run` command.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
