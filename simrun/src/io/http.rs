//! Retrying HTTP transport shared by the tracking and remote-system clients.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, instrument, warn};

use crate::error::SimrunError;
use crate::io::shutdown::TeardownLatch;

/// Returned in place of an absent or empty response body.
pub const NULL_BODY: &str = "null";

pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn is_success(status: u16) -> bool {
        (200..300).contains(&status)
    }
}

/// HTTP client that attaches fixed headers to every request and retries
/// until a 2xx answer or the retry budget runs out.
#[derive(Debug, Clone)]
pub struct ReportingClient {
    client: Client,
    policy: RetryPolicy,
}

impl ReportingClient {
    pub fn new(headers: &BTreeMap<String, String>, policy: RetryPolicy) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|err| SimrunError::Configuration(format!("invalid header name {name:?}: {err}")))?;
            let header_value = HeaderValue::from_str(value.trim())
                .map_err(|err| SimrunError::Configuration(format!("invalid value for header {name:?}: {err}")))?;
            default_headers.insert(header_name, header_value);
        }
        let client = Client::builder()
            .default_headers(default_headers)
            .build()
            .context("build http client")?;
        Ok(Self { client, policy })
    }

    /// POST a JSON document. Returns the response body or [`NULL_BODY`].
    #[instrument(skip_all, fields(url = %url))]
    pub fn post_event(&self, url: &str, json_body: &str) -> Result<String> {
        debug!(body = %json_body, "posting event");
        self.with_retries(url, None, || self.json_post(url, json_body))
    }

    /// Like [`ReportingClient::post_event`], but gives up as soon as `stop` is
    /// released: no attempt starts and no retry delay continues after that.
    #[instrument(skip_all, fields(url = %url))]
    pub fn post_event_until(&self, url: &str, json_body: &str, stop: &TeardownLatch) -> Result<String> {
        self.with_retries(url, Some(stop), || self.json_post(url, json_body))
    }

    fn json_post(&self, url: &str, json_body: &str) -> RequestBuilder {
        self.client
            .post(url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(json_body.to_string())
    }

    /// GET a verdict or any other document. Returns the body or [`NULL_BODY`].
    #[instrument(skip_all, fields(url = %url))]
    pub fn get_verdict(&self, url: &str) -> Result<String> {
        self.with_retries(url, None, || self.client.get(url))
    }

    fn with_retries<F>(&self, url: &str, stop: Option<&TeardownLatch>, request: F) -> Result<String>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.policy.max_retries.max(1);
        for attempt in 1..=attempts {
            if stop.is_some_and(TeardownLatch::is_released) {
                return Err(anyhow!("request to {url} stopped after {} attempts", attempt - 1));
            }
            match request().send() {
                Ok(response) => {
                    let status = response.status().as_u16();
                    match response.text() {
                        Ok(body) if RetryPolicy::is_success(status) => {
                            debug!(status, attempt, "request succeeded");
                            return Ok(if body.is_empty() {
                                NULL_BODY.to_string()
                            } else {
                                body
                            });
                        }
                        Ok(body) => warn!(
                            url = %url,
                            status,
                            attempt,
                            max_retries = attempts,
                            body = %body,
                            "request failed"
                        ),
                        // A truncated body is no data, whatever the status said.
                        Err(err) => warn!(
                            url = %url,
                            status,
                            err = %err,
                            attempt,
                            max_retries = attempts,
                            "failed to read response body"
                        ),
                    }
                }
                Err(err) => {
                    warn!(
                        url = %url,
                        err = %err,
                        attempt,
                        max_retries = attempts,
                        "request failed"
                    );
                }
            }
            if attempt < attempts {
                match stop {
                    Some(stop) => {
                        if stop.wait(self.policy.delay) {
                            return Err(anyhow!("request to {url} stopped after {attempt} attempts"));
                        }
                    }
                    None => thread::sleep(self.policy.delay),
                }
            }
        }
        Err(SimrunError::RetryExhausted {
            url: url.to_string(),
            attempts,
        }
        .into())
    }
}

/// Parse `name:value` pairs separated by commas.
///
/// Blank input yields an empty map. A pair without `:` is a configuration error.
pub fn parse_headers(raw: &str) -> Result<BTreeMap<String, String>, SimrunError> {
    let mut headers = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((name, value)) = pair.split_once(':') else {
            return Err(SimrunError::Configuration(format!(
                "header {pair:?} is not of the form name:value"
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(SimrunError::Configuration(format!(
                "header {pair:?} has an empty name"
            )));
        }
        headers.insert(name.to_string(), value.trim().to_string());
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_2xx_only() {
        assert!(RetryPolicy::is_success(200));
        assert!(RetryPolicy::is_success(204));
        assert!(RetryPolicy::is_success(299));
        assert!(!RetryPolicy::is_success(199));
        assert!(!RetryPolicy::is_success(300));
        assert!(!RetryPolicy::is_success(503));
    }

    #[test]
    fn default_policy_matches_tracking_service_expectations() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.delay, Duration::from_secs(30));
    }

    #[test]
    fn parses_two_headers() {
        let headers = parse_headers("Authorization:Bearer abc, X-Team:perf").expect("headers");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["Authorization"], "Bearer abc");
        assert_eq!(headers["X-Team"], "perf");
    }

    #[test]
    fn blank_headers_are_empty() {
        assert!(parse_headers("").expect("headers").is_empty());
        assert!(parse_headers(" , ").expect("headers").is_empty());
    }

    #[test]
    fn header_without_colon_is_rejected() {
        let err = parse_headers("a:1,broken").expect_err("should fail");
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn invalid_header_name_is_configuration_error() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = ReportingClient::new(&headers, RetryPolicy::default()).expect_err("invalid");
        let typed = crate::error::find_simrun_error(&err).expect("typed");
        assert_eq!(typed.kind(), "ConfigurationError");
    }
}
