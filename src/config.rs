//! Configuration management for seamless.
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use crate::{
    constants::{DEFAULT_ENV_MARKER, DRAIN_TIMEOUT, HANDOFF_TIMEOUT},
    error::ConfigError,
};

/// Restart protocol settings.
///
/// Usually built in code with [`Config::new`], or embedded in a daemon's own
/// YAML file and loaded with [`load_config`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rendezvous PID file. `None` or an empty path disables seamless restart.
    pub pid_file: Option<PathBuf>,
    /// Deadline the launcher gives its child to acknowledge a drain request.
    #[serde(deserialize_with = "deserialize_duration")]
    pub handoff_timeout: Duration,
    /// Deadline an outgoing generation waits for its replacement's TERM.
    #[serde(deserialize_with = "deserialize_duration")]
    pub drain_timeout: Duration,
    /// Environment variable carrying the launcher PID into the daemon body.
    pub env_marker: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pid_file: None,
            handoff_timeout: HANDOFF_TIMEOUT,
            drain_timeout: DRAIN_TIMEOUT,
            env_marker: DEFAULT_ENV_MARKER.to_string(),
        }
    }
}

impl Config {
    /// Creates a configuration using `pid_file` as the rendezvous point.
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: Some(pid_file.into()),
            ..Self::default()
        }
    }

    /// Creates a configuration with seamless restart turned off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Overrides the launcher handoff deadline.
    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    /// Overrides the drain deadline.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Overrides the environment marker name.
    pub fn with_env_marker(mut self, marker: impl Into<String>) -> Self {
        self.env_marker = marker.into();
        self
    }

    /// Returns the rendezvous path, or `None` when coordination is disabled.
    pub fn rendezvous_path(&self) -> Option<&Path> {
        self.pid_file
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

/// Parses a duration string in the format `<number>[ms|s|m|h]`.
///
/// A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    let invalid = || ConfigError::InvalidDuration(raw.to_string());

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("static pattern is valid")
    })
}

/// Expands `$VAR` and `${VAR}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let result = env_var_pattern().replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingVariable(name)),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses a YAML configuration file, expanding environment variables.
pub fn load_config(config_path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(config_path.as_ref())?;
    let expanded = expand_env_vars(&content)?;
    let config: Config = serde_yaml::from_str(&expanded)?;
    Ok(config)
}
