//! Supervised simulation runner.
//!
//! Forks the configured runtime once per scenario, reports the session to
//! the tracking service, and records the outcome in `lastRun.txt`.

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use simrun::core::types::AggregateResult;
use simrun::error::{SimrunError, find_simrun_error};
use simrun::exit_codes;
use simrun::io::config::{DEFAULT_CONFIG_FILE, SimrunConfig, load_config};
use simrun::io::http::parse_headers;
use simrun::io::toolchain::resolve_from_env;
use simrun::logging;
use simrun::session::{ExecutionReport, execute};

#[derive(Parser)]
#[command(
    name = "simrun",
    version,
    about = "Run simulation scenarios in a supervised child process"
)]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured scenarios and check the verdict.
    Run {
        /// Scenario to run; repeat to run several. Replaces `scenarios` from the config.
        #[arg(long = "scenario", value_name = "NAME")]
        scenarios: Vec<String>,

        /// Log run errors as warnings instead of failing.
        #[arg(long)]
        no_fail_on_error: bool,

        #[arg(long)]
        continue_on_assertion_failure: bool,

        /// Extra tracking headers as `name:value,name:value`.
        #[arg(long, value_name = "PAIRS")]
        tracking_headers: Option<String>,
    },
    /// Load and validate the configuration without running anything.
    CheckConfig,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_code_for(&err));
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(&cli.config)?;
    match cli.command {
        Command::Run {
            scenarios,
            no_fail_on_error,
            continue_on_assertion_failure,
            tracking_headers,
        } => {
            apply_overrides(
                &mut config,
                scenarios,
                no_fail_on_error,
                continue_on_assertion_failure,
                tracking_headers.as_deref(),
            )?;
            let report = execute(&config)?;
            print_report(&report);
            Ok(exit_code_for_report(&report))
        }
        Command::CheckConfig => {
            let scenarios = config.scenario_list()?;
            let executable = resolve_from_env(config.executable.as_deref())?;
            println!("executable: {}", executable.display());
            println!("scenarios: {}", scenarios.join(", "));
            println!("results_dir: {}", config.results_dir.display());
            println!(
                "tracking: {}",
                if config.tracking.enabled {
                    config.tracking.base_url.as_str()
                } else {
                    "disabled"
                }
            );
            Ok(exit_codes::OK)
        }
    }
}

fn apply_overrides(
    config: &mut SimrunConfig,
    scenarios: Vec<String>,
    no_fail_on_error: bool,
    continue_on_assertion_failure: bool,
    tracking_headers: Option<&str>,
) -> Result<()> {
    if !scenarios.is_empty() {
        config.run_multiple_scenarios |= scenarios.len() > 1;
        config.scenarios = scenarios;
    }
    if no_fail_on_error {
        config.fail_on_error = false;
    }
    if continue_on_assertion_failure {
        config.continue_on_assertion_failure = true;
    }
    if let Some(raw) = tracking_headers {
        config.tracking.headers.extend(parse_headers(raw)?);
    }
    config.validate()
}

fn print_report(report: &ExecutionReport) {
    for dir in &report.new_run_directories {
        println!("{dir}");
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
}

/// A kill that fell through to the verdict check, or an abort downgraded by
/// `--no-fail-on-error`, still exits as cancelled.
fn exit_code_for_report(report: &ExecutionReport) -> i32 {
    let cancelled = report
        .aggregate
        .as_ref()
        .and_then(AggregateResult::error)
        .is_some_and(|err| err.is_cancellation());
    if cancelled {
        exit_codes::CANCELLED
    } else {
        exit_codes::OK
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match find_simrun_error(err) {
        Some(SimrunError::AssertionFailure { .. } | SimrunError::CheckFailure(_)) => {
            exit_codes::ASSERTION_FAILED
        }
        Some(err) if err.is_cancellation() => exit_codes::CANCELLED,
        _ => exit_codes::FAILED,
    }
}
