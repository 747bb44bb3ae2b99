//! I/O layer: processes, HTTP, files and signals.

pub mod cancel;
pub mod config;
pub mod http;
pub mod last_run;
pub mod process;
pub mod remote_system;
pub mod shutdown;
pub mod toolchain;
pub mod tracking;

/// Line terminator used for files the child process or operators read.
#[cfg(windows)]
pub(crate) const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub(crate) const LINE_ENDING: &str = "\n";
