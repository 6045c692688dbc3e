//! Process configuration applied to the service at container start.
//!
//! The runtime image carries these as environment defaults. Anything set by
//! the deployment environment at launch takes precedence.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::Error;

/// Environment variable carrying the logging verbosity.
pub const LOG_LEVEL_VAR: &str = "RUST_LOG";

/// Environment variable enabling backtrace capture.
pub const BACKTRACE_VAR: &str = "RUST_BACKTRACE";

/// Logging verbosity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[display("trace")]
    Trace,
    #[display("debug")]
    Debug,
    #[default]
    #[display("info")]
    Info,
    #[display("warn")]
    Warn,
    #[display("error")]
    Error,
    #[display("off")]
    Off,
}

impl FromStr for LogLevel {
    type Err = Error;

    /// Parses a single level. Filters with per-target directives such as
    /// `info,hyper=warn` cannot be carried by a level and are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let directive = s.trim();
        if directive.contains(',') || directive.contains('=') {
            return Err(Error::InvalidInput(format!(
                "log filter '{}' is not a single level; per-target directives are not supported",
                s
            )));
        }

        match directive.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" => Ok(LogLevel::Off),
            _ => Err(Error::InvalidInput(format!("unknown log level: {}", s))),
        }
    }
}

/// Environment defaults for the service process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub log_level: LogLevel,
    /// Capture backtraces on panic.
    pub backtrace: bool,
    /// Additional variables, rendered after the typed ones.
    pub extra: BTreeMap<String, String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            backtrace: true,
            extra: BTreeMap::new(),
        }
    }
}

impl ProcessConfig {
    /// Render as environment variables, typed fields first.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (LOG_LEVEL_VAR.to_string(), self.log_level.to_string()),
            (
                BACKTRACE_VAR.to_string(),
                if self.backtrace { "1" } else { "0" }.to_string(),
            ),
        ];
        env.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// The configuration a process observes when `lookup` describes its
    /// environment. Variables present in `lookup` override `self`.
    pub fn resolve<F>(&self, lookup: F) -> crate::Result<ProcessConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = match lookup(LOG_LEVEL_VAR) {
            Some(value) => value.parse()?,
            None => self.log_level,
        };
        let backtrace = match lookup(BACKTRACE_VAR) {
            Some(value) => parse_backtrace(&value),
            None => self.backtrace,
        };
        let extra = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), lookup(k).unwrap_or_else(|| v.clone())))
            .collect();

        Ok(ProcessConfig {
            log_level,
            backtrace,
            extra,
        })
    }

    /// Resolve against `KEY=value` lines, as printed by `env`.
    pub fn from_env_lines(&self, output: &str) -> crate::Result<ProcessConfig> {
        let vars: BTreeMap<&str, &str> = output
            .lines()
            .filter_map(|line| line.split_once('='))
            .collect();
        self.resolve(|key| vars.get(key).map(|v| v.to_string()))
    }
}

/// `0` and the empty string disable capture, anything else enables it.
fn parse_backtrace(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0")
}
