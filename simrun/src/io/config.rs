//! Run configuration stored in `simrun.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::classifier::DEFAULT_ASSERTION_FAILURE_CODE;
use crate::error::SimrunError;
use crate::io::http::{DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::io::remote_system::validate_template;
use crate::io::tracking::TestRunInfo;

pub const DEFAULT_CONFIG_FILE: &str = "simrun.toml";
pub const DEFAULT_MAIN_ENTRY: &str = "io.gatling.app.Gatling";

/// Always appended after the runtime options.
pub const CLASSPATH_URL_CHECK_OPTION: &str = "-Djdk.net.URLClassPath.disableClassPathURLCheck=true";

const DEFAULT_RUNTIME_OPTIONS: [&str; 4] = [
    "-server",
    "-Xmx1G",
    "-XX:+HeapDumpOnOutOfMemoryError",
    "-XX:+UseG1GC",
];

/// Run configuration (TOML).
///
/// Edited by humans and by CI templates. Missing fields take the defaults
/// below, so an absent file describes a valid (if tracking-less) run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimrunConfig {
    /// Runtime executable. When unset it is looked up under `JAVA_HOME`.
    pub executable: Option<PathBuf>,

    /// Entry point handed to the runtime before the argument file.
    pub main_entry: String,

    /// Custom runtime options. Empty means the built-in defaults.
    pub runtime_options: Vec<String>,

    /// Keep the built-in defaults after the custom options instead of replacing them.
    pub override_runtime_options: bool,

    pub working_directory: Option<PathBuf>,

    /// Where the child writes one sub-directory per run, and where `lastRun.txt` goes.
    pub results_dir: PathBuf,

    pub scenarios: Vec<String>,

    /// More than one scenario is refused unless this is set.
    pub run_multiple_scenarios: bool,

    /// Forward the ambient environment as `-D` options (deny-list applies).
    pub propagate_environment: bool,

    /// Surface run errors. When false they are logged as warnings.
    pub fail_on_error: bool,

    pub continue_on_assertion_failure: bool,

    /// Downgrade a failing verdict to a warning.
    pub continue_on_check_failure: bool,

    /// Exit code the child uses for failed assertions.
    pub assertion_failure_code: i32,

    pub scenario_args: ScenarioArgsConfig,
    pub tracking: TrackingConfig,
    pub retry: RetryConfig,
    pub remote_system: RemoteSystemConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScenarioArgsConfig {
    pub simulations_folder: Option<PathBuf>,
    pub resources_folder: Option<PathBuf>,
    pub run_description: Option<String>,
    pub no_reports: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackingConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Sent with every request, e.g. an auth token.
    pub headers: BTreeMap<String, String>,
    pub test_run_id: String,
    pub dashboard_name: String,
    pub product_name: String,
    pub product_release: String,
    pub build_results_url: String,
    pub ramp_up_period_secs: u64,
    pub keep_alive_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            headers: BTreeMap::new(),
            test_run_id: "ANONYMOUS_TEST_ID".to_string(),
            dashboard_name: "ANONYMOUS_DASHBOARD".to_string(),
            product_name: "ANONYMOUS_PRODUCT".to_string(),
            product_release: "1.0.0-SNAPSHOT".to_string(),
            build_results_url: String::new(),
            ramp_up_period_secs: 30,
            keep_alive_interval_secs: 30,
        }
    }
}

impl TrackingConfig {
    pub fn test_run_info(&self) -> TestRunInfo {
        TestRunInfo {
            test_run_id: self.test_run_id.clone(),
            dashboard_name: self.dashboard_name.clone(),
            product_name: self.product_name.clone(),
            product_release: self.product_release.clone(),
            build_results_url: self.build_results_url.clone(),
            ramp_up_period: self.ramp_up_period_secs,
        }
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteSystemConfig {
    /// Template with `{{testStartTime}}` and `{{testEndTime}}` placeholders.
    pub url: Option<String>,
}

impl Default for SimrunConfig {
    fn default() -> Self {
        Self {
            executable: None,
            main_entry: DEFAULT_MAIN_ENTRY.to_string(),
            runtime_options: Vec::new(),
            override_runtime_options: false,
            working_directory: None,
            results_dir: PathBuf::from("target/gatling"),
            scenarios: Vec::new(),
            run_multiple_scenarios: false,
            propagate_environment: false,
            fail_on_error: true,
            continue_on_assertion_failure: false,
            continue_on_check_failure: false,
            assertion_failure_code: DEFAULT_ASSERTION_FAILURE_CODE,
            scenario_args: ScenarioArgsConfig::default(),
            tracking: TrackingConfig::default(),
            retry: RetryConfig::default(),
            remote_system: RemoteSystemConfig::default(),
        }
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    SimrunError::Configuration(message.into()).into()
}

impl SimrunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.main_entry.trim().is_empty() {
            return Err(invalid("main_entry must not be empty"));
        }
        if self.assertion_failure_code == 0 {
            return Err(invalid("assertion_failure_code must be non-zero"));
        }
        if self.results_dir.as_os_str().is_empty() {
            return Err(invalid("results_dir must not be empty"));
        }
        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries must be > 0"));
        }
        if self.tracking.enabled {
            let base = self.tracking.base_url.trim();
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                return Err(invalid(
                    "tracking.base_url must be an http(s) url when tracking is enabled",
                ));
            }
            if self.tracking.keep_alive_interval_secs == 0 {
                return Err(invalid("tracking.keep_alive_interval_secs must be > 0"));
            }
        }
        if let Some(url) = &self.remote_system.url {
            validate_template(url)?;
        }
        Ok(())
    }

    /// Scenarios to run, in order.
    pub fn scenario_list(&self) -> Result<Vec<String>, SimrunError> {
        match self.scenarios.len() {
            0 => Err(SimrunError::Configuration("no scenarios to run".to_string())),
            1 => Ok(self.scenarios.clone()),
            _ if self.run_multiple_scenarios => Ok(self.scenarios.clone()),
            _ => Err(SimrunError::Configuration(
                "more than 1 scenario to run, name one or enable run_multiple_scenarios"
                    .to_string(),
            )),
        }
    }

    /// Custom options, defaults, or both; then the fixed classpath option.
    pub fn effective_runtime_options(&self) -> Vec<String> {
        let defaults = DEFAULT_RUNTIME_OPTIONS.iter().map(|s| s.to_string());
        let mut options: Vec<String> = if self.runtime_options.is_empty() {
            defaults.collect()
        } else if self.override_runtime_options {
            self.runtime_options.iter().cloned().chain(defaults).collect()
        } else {
            self.runtime_options.clone()
        };
        options.push(CLASSPATH_URL_CHECK_OPTION.to_string());
        options
    }

    /// `-rf <results> [-sf <dir>] [-rsf <dir>] [-rd <desc>] [-nr] -s <scenario>`
    pub fn scenario_args(&self, scenario: &str) -> Vec<String> {
        let extra = &self.scenario_args;
        let mut args = vec!["-rf".to_string(), self.results_dir.display().to_string()];
        if let Some(dir) = &extra.simulations_folder {
            args.extend(["-sf".to_string(), dir.display().to_string()]);
        }
        if let Some(dir) = &extra.resources_folder {
            args.extend(["-rsf".to_string(), dir.display().to_string()]);
        }
        if let Some(description) = &extra.run_description {
            args.extend(["-rd".to_string(), description.clone()]);
        }
        if extra.no_reports {
            args.push("-nr".to_string());
        }
        args.extend(["-s".to_string(), scenario.to_string()]);
        args
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SimrunConfig::default()`.
pub fn load_config(path: &Path) -> Result<SimrunConfig> {
    if !path.exists() {
        let cfg = SimrunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SimrunConfig = toml::from_str(&contents)
        .map_err(|err| invalid(format!("parse {}: {err}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Write `contents` next to `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
