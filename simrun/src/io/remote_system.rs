//! Post-run call to an arbitrary remote system with the test-run time window.
//!
//! The URL template carries `{{testStartTime}}` and `{{testEndTime}}`
//! placeholders that are replaced with epoch-millisecond timestamps.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::{Captures, Regex};
use tracing::info;

use crate::error::SimrunError;
use crate::io::http::ReportingClient;

pub const TEST_START_TIME: &str = "testStartTime";
pub const TEST_END_TIME: &str = "testEndTime";

/// Timestamp value used while a time is not known yet.
pub const TIMESTAMP_NOT_SET: i64 = -1;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap());

/// Start and end of the test run in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestRunClock {
    start: i64,
    end: i64,
}

impl TestRunClock {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            end: TIMESTAMP_NOT_SET,
        }
    }

    pub fn started_now() -> Self {
        Self::new(Utc::now().timestamp_millis())
    }

    pub fn stop_now(&mut self) {
        self.end = Utc::now().timestamp_millis();
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }
}

/// A remote-system URL with the clock's timestamps substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSystemUrl(String);

impl RemoteSystemUrl {
    pub fn new(template: &str, clock: &TestRunClock) -> Result<Self, SimrunError> {
        validate_template(template)?;
        let url = PLACEHOLDER_RE.replace_all(template, |caps: &Captures<'_>| {
            match &caps[1] {
                TEST_START_TIME => clock.start().to_string(),
                TEST_END_TIME => clock.end().to_string(),
                _ => caps[0].to_string(),
            }
        });
        Ok(Self(url.into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Check that a template names both time placeholders and nothing else.
pub fn validate_template(template: &str) -> Result<(), SimrunError> {
    let names: Vec<&str> = PLACEHOLDER_RE
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if let Some(unknown) = names
        .iter()
        .find(|name| **name != TEST_START_TIME && **name != TEST_END_TIME)
    {
        return Err(SimrunError::Configuration(format!(
            "unknown placeholder {{{{{unknown}}}}} in remote system url [{template}]"
        )));
    }
    for required in [TEST_START_TIME, TEST_END_TIME] {
        if !names.contains(&required) {
            return Err(SimrunError::Configuration(format!(
                "placeholder {{{{{required}}}}} is missing in remote system url [{template}]"
            )));
        }
    }
    Ok(())
}

/// Calls the remote system through the retrying transport.
#[derive(Debug, Clone)]
pub struct RemoteSystemClient {
    transport: ReportingClient,
}

impl RemoteSystemClient {
    pub fn new(transport: ReportingClient) -> Self {
        Self { transport }
    }

    pub fn call(&self, url: &RemoteSystemUrl) -> Result<String> {
        let reply = self
            .transport
            .get_verdict(url.as_str())
            .with_context(|| format!("call remote system {}", url.as_str()))?;
        info!(url = %url.as_str(), reply = %reply, "remote system replied");
        Ok(reply)
    }
}
