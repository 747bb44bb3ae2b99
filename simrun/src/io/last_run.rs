//! The `lastRun.txt` marker written to the results directory after every run.
//!
//! One line per run directory created during this invocation, then, when the
//! run failed, a single `Error: ` line with the chain of causes.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::error::SimrunError;
use crate::io::LINE_ENDING;
use crate::io::config::write_atomic;

pub const LAST_RUN_FILE: &str = "lastRun.txt";
pub const LAST_RUN_ERROR_PREFIX: &str = "Error: ";

const CAUSE_SEPARATOR: &str = " | ";

/// Names of the sub-directories currently in `results_dir`.
///
/// A missing directory has no sub-directories.
pub fn run_directories(results_dir: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    if !results_dir.exists() {
        return Ok(names);
    }
    let entries = fs::read_dir(results_dir)
        .with_context(|| format!("read directory {}", results_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", results_dir.display()))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Each cause in the chain joined with ` | `. Typed causes are `Kind: message`.
pub fn error_chain_line(err: &anyhow::Error) -> String {
    err.chain()
        .map(|cause| {
            let message = cause.to_string();
            match cause.downcast_ref::<SimrunError>() {
                Some(typed) => format!("{}: {message}", typed.kind()),
                None => message,
            }
        })
        .collect::<Vec<_>>()
        .join(CAUSE_SEPARATOR)
}

/// Write the marker and return the run directories created since `before`.
pub fn write_last_run(
    results_dir: &Path,
    before: &BTreeSet<String>,
    error: Option<&anyhow::Error>,
) -> Result<Vec<String>> {
    let created: Vec<String> = run_directories(results_dir)?
        .difference(before)
        .cloned()
        .collect();

    let mut contents = String::new();
    for name in &created {
        contents.push_str(name);
        contents.push_str(LINE_ENDING);
    }
    if let Some(err) = error {
        contents.push_str(LAST_RUN_ERROR_PREFIX);
        contents.push_str(&error_chain_line(err));
        contents.push_str(LINE_ENDING);
    }

    let path = results_dir.join(LAST_RUN_FILE);
    write_atomic(&path, &contents).context("record simulation results")?;
    info!(path = %path.display(), new_runs = created.len(), "wrote last run marker");
    Ok(created)
}
