//! Rules for forwarding the ambient environment to the child process.
//!
//! Forwarding is opt-in. Each forwarded variable becomes a `-D<name>=<value>`
//! start-up option. Names that belong to the parent runtime or build tool are
//! never forwarded.

use crate::core::path::{escape_value, quote_if_spaced};

/// Name prefixes owned by the parent runtime, OS, user or build tool.
pub const DENIED_PREFIXES: [&str; 11] = [
    "java.", "sun.", "maven.", "file.", "awt.", "os.", "user.", "idea.", "guice.", "hudson.",
    "SIMRUN_",
];

/// Exact names that are meaningless or harmful in the child.
pub const DENIED_NAMES: [&str; 5] = [
    "line.separator",
    "path.separator",
    "classworlds.conf",
    "org.slf4j.simpleLogger.defaultLogLevel",
    "RUST_LOG",
];

/// Decision for one ambient variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvDecision {
    /// Forward as the given start-up option.
    Forward(String),
    /// On the deny-list; skipped silently.
    Denied,
    /// Cannot be propagated safely; the caller logs a warning with this reason.
    Dropped(&'static str),
}

pub fn is_propagatable(name: &str) -> bool {
    !DENIED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
        && !DENIED_NAMES.contains(&name)
}

/// Decide how `name=value` is forwarded.
///
/// `value` is expected to have been through the platform path transform already.
pub fn decide(name: &str, value: &str, is_windows: bool) -> EnvDecision {
    if !is_propagatable(name) {
        return EnvDecision::Denied;
    }
    if name.chars().any(char::is_whitespace) {
        return EnvDecision::Dropped("name contains whitespace");
    }
    if is_windows && value.chars().any(char::is_whitespace) {
        return EnvDecision::Dropped("value contains whitespace and can't be quoted on Windows");
    }
    EnvDecision::Forward(format!("-D{name}={}", quote_if_spaced(&escape_value(value))))
}
