//! Locating the runtime executable for the child process.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SimrunError;

pub const RUNTIME_HOME_VAR: &str = "JAVA_HOME";

#[cfg(windows)]
const RUNTIME_BINARY: &str = "java.exe";
#[cfg(not(windows))]
const RUNTIME_BINARY: &str = "java";

/// Pick the executable: an explicit path, else `<runtime_home>/bin/java`.
///
/// Fails before any process is spawned when neither is available.
pub fn resolve_executable(
    explicit: Option<&Path>,
    runtime_home: Option<OsString>,
) -> Result<PathBuf, SimrunError> {
    if let Some(path) = explicit {
        debug!(executable = %path.display(), "using configured executable");
        return Ok(path.to_path_buf());
    }
    match runtime_home.filter(|home| !home.is_empty()) {
        Some(home) => {
            let executable = PathBuf::from(home).join("bin").join(RUNTIME_BINARY);
            debug!(executable = %executable.display(), "using executable from {RUNTIME_HOME_VAR}");
            Ok(executable)
        }
        None => Err(SimrunError::Configuration(format!(
            "couldn't locate runtime executable, try setting {RUNTIME_HOME_VAR}"
        ))),
    }
}

/// [`resolve_executable`] against the current process environment.
pub fn resolve_from_env(explicit: Option<&Path>) -> Result<PathBuf, SimrunError> {
    resolve_executable(explicit, std::env::var_os(RUNTIME_HOME_VAR))
}
