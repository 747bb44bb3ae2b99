//! Launching and supervising the external test-execution process.
//!
//! The child is started as
//! `<executable> <runtime options...> <forwarded env options...> <main entry> <arg file>`
//! with its standard streams inherited, so its output streams through live.
//! The scenario arguments go into a temporary argument file (one per line)
//! to stay clear of platform command-line length limits.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, instrument, warn};

use crate::core::classifier::{DEFAULT_ASSERTION_FAILURE_CODE, classify_exit};
use crate::core::env::{EnvDecision, decide};
use crate::core::path::{same_directory, to_windows_short_name};
use crate::core::types::{CancellationSignal, RunClassification, RunOutcome};
use crate::io::LINE_ENDING;
use crate::io::cancel::{CancellationController, DEFAULT_POLL_INTERVAL};

const ARG_FILE_PREFIX: &str = "simrun-";
const ARG_FILE_SUFFIX: &str = ".args";

/// Everything needed to launch one process. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    executable: PathBuf,
    runtime_options: Vec<String>,
    forwarded_options: Vec<String>,
    main_entry: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn builder(executable: impl Into<PathBuf>, main_entry: impl Into<String>) -> ProcessSpecBuilder {
        ProcessSpecBuilder {
            spec: ProcessSpec {
                executable: executable.into(),
                runtime_options: Vec::new(),
                forwarded_options: Vec::new(),
                main_entry: main_entry.into(),
                args: Vec::new(),
                working_directory: None,
            },
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn forwarded_options(&self) -> &[String] {
        &self.forwarded_options
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    /// Command-line words after the executable, ending with `arg_file`.
    pub fn command_line(&self, arg_file: &Path) -> Vec<String> {
        let mut words =
            Vec::with_capacity(self.runtime_options.len() + self.forwarded_options.len() + 2);
        words.extend(self.runtime_options.iter().cloned());
        words.extend(self.forwarded_options.iter().cloned());
        words.push(self.main_entry.clone());
        words.push(arg_file.display().to_string());
        words
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSpecBuilder {
    spec: ProcessSpec,
}

impl ProcessSpecBuilder {
    pub fn runtime_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.runtime_options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_directory(mut self, dir: Option<PathBuf>) -> Self {
        self.spec.working_directory = dir;
        self
    }

    /// Forward ambient variables as start-up options, applying the deny-list.
    ///
    /// Variables that cannot be propagated safely are dropped with a warning.
    pub fn propagate_environment<I>(mut self, vars: I, is_windows: bool) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars: Vec<(String, String)> = vars.into_iter().collect();
        vars.sort();
        for (name, value) in vars {
            let value = to_windows_short_name(&value, is_windows, same_directory);
            match decide(&name, &value, is_windows) {
                EnvDecision::Forward(option) => self.spec.forwarded_options.push(option),
                EnvDecision::Denied => debug!(name = %name, "not propagating variable"),
                EnvDecision::Dropped(reason) => {
                    warn!(name = %name, reason, "variable can't be propagated");
                }
            }
        }
        self
    }

    pub fn build(self) -> ProcessSpec {
        self.spec
    }
}

/// Temporary file holding one argument per line.
///
/// The file is removed when this value is dropped, after the child exited.
#[derive(Debug)]
pub struct ArgFile {
    file: NamedTempFile,
}

impl ArgFile {
    pub fn create(args: &[String]) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(ARG_FILE_PREFIX)
            .suffix(ARG_FILE_SUFFIX)
            .tempfile()
            .context("create argument file")?;
        {
            let mut out = BufWriter::new(file.as_file());
            for arg in args {
                out.write_all(arg.as_bytes())
                    .and_then(|()| out.write_all(LINE_ENDING.as_bytes()))
                    .with_context(|| format!("write argument file {}", file.path().display()))?;
            }
            out.flush().context("flush argument file")?;
        }
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Runs one [`ProcessSpec`] to completion under a [`CancellationController`].
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    assertion_failure_code: i32,
    poll_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            assertion_failure_code: DEFAULT_ASSERTION_FAILURE_CODE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ProcessRunner {
    pub fn new(assertion_failure_code: i32) -> Self {
        Self {
            assertion_failure_code,
            ..Self::default()
        }
    }

    /// Launch the process and block until it exits or is destroyed.
    ///
    /// Never returns an error: launch problems are classified as
    /// `ExecutionFailure`, and a recorded cancellation overrides the exit status.
    #[instrument(skip_all, fields(executable = %spec.executable().display(), args = spec.args().len()))]
    pub fn run(&self, spec: &ProcessSpec, cancellation: &CancellationController) -> RunOutcome {
        if let Some(outcome) = self.cancelled_before_start(cancellation) {
            return outcome;
        }

        let arg_file = match ArgFile::create(spec.args()) {
            Ok(file) => file,
            Err(err) => {
                error!(err = %err, "failed to write argument file");
                return RunOutcome::launch_failure(format!("{err:#}"));
            }
        };

        let mut cmd = Command::new(spec.executable());
        cmd.args(spec.command_line(arg_file.path()))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = spec.working_directory() {
            cmd.current_dir(dir);
        }
        debug!(command = ?cmd, "spawning child process");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(err = %err, "failed to spawn process");
                return RunOutcome::launch_failure(format!(
                    "failed to launch {}: {err}",
                    spec.executable().display()
                ));
            }
        };
        info!(pid = child.id(), "process started");

        let watchdog = cancellation.watchdog();
        watchdog.watch(child);
        let status = match watchdog.wait(self.poll_interval) {
            Ok(status) => status,
            Err(err) => {
                error!(err = %err, "failed to wait for process");
                return self.classified(None, cancellation, format!("{err:#}"));
            }
        };
        drop(arg_file);

        debug!(exit_code = ?status.code(), "process finished");
        self.classified(status.code(), cancellation, format!("command line returned {status}"))
    }

    fn cancelled_before_start(&self, cancellation: &CancellationController) -> Option<RunOutcome> {
        let recorded = cancellation.cancellation()?;
        warn!(signal = ?recorded.signal, "cancelled before launch, not starting process");
        Some(self.classified(None, cancellation, String::new()))
    }

    fn classified(
        &self,
        exit_code: Option<i32>,
        cancellation: &CancellationController,
        detail: String,
    ) -> RunOutcome {
        let recorded = cancellation.cancellation();
        let signal = recorded
            .as_ref()
            .map(|c| c.signal)
            .unwrap_or(CancellationSignal::None);
        let classification = classify_exit(exit_code, signal, self.assertion_failure_code);
        let detail = match (&classification, recorded) {
            (RunClassification::Killed, Some(c)) => {
                format!("kill switch stopped the process: {}", c.reason)
            }
            (RunClassification::Aborted, Some(c)) => {
                format!("abort stopped the process: {}", c.reason)
            }
            _ => detail,
        };
        RunOutcome::new(exit_code, classification, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn arg_file_lines_round_trip() {
        let args: Vec<String> = ["-sf", "/a/b", "-s", "com.Foo"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let file = ArgFile::create(&args).expect("arg file");
        let contents = fs::read_to_string(file.path()).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["-sf", "/a/b", "-s", "com.Foo"]);
        assert!(contents.ends_with(LINE_ENDING));
    }

    #[test]
    fn arg_file_is_removed_on_drop() {
        let file = ArgFile::create(&["x".to_string()]).expect("arg file");
        let path = file.path().to_path_buf();
        let name = path.file_name().expect("name").to_string_lossy().to_string();
        assert!(name.starts_with(ARG_FILE_PREFIX));
        assert!(name.ends_with(ARG_FILE_SUFFIX));
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn command_line_ends_with_main_entry_and_arg_file() {
        let spec = ProcessSpec::builder("/usr/bin/java", "io.gatling.app.Gatling")
            .runtime_options(["-Xmx1G"])
            .propagate_environment(
                vec![
                    ("gatling.users".to_string(), "5".to_string()),
                    ("user.home".to_string(), "/home/me".to_string()),
                ],
                false,
            )
            .args(["-s", "com.Foo"])
            .build();
        let words = spec.command_line(Path::new("/tmp/simrun-1.args"));
        assert_eq!(
            words,
            vec![
                "-Xmx1G",
                "-Dgatling.users=5",
                "io.gatling.app.Gatling",
                "/tmp/simrun-1.args",
            ]
        );
    }

    #[test]
    fn missing_executable_is_execution_failure() {
        let spec = ProcessSpec::builder("/definitely/not/here/simrun-java", "Main").build();
        let outcome = ProcessRunner::default().run(&spec, &CancellationController::new());
        assert_eq!(outcome.classification, RunClassification::ExecutionFailure);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.detail.contains("failed to launch"));
    }

    #[test]
    fn cancelled_before_launch_is_not_started() {
        let controller = CancellationController::new();
        controller.abort("session aborted");
        let spec = ProcessSpec::builder("/definitely/not/here/simrun-java", "Main").build();
        let outcome = ProcessRunner::default().run(&spec, &controller);
        assert_eq!(outcome.classification, RunClassification::Aborted);
        assert!(outcome.detail.contains("session aborted"));
    }
}
