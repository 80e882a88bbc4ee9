//! Relay agent configuration
//!
//! Resolution order: defaults, then an optional TOML file, then
//! `CRD_RELAY_*` environment variables, then CLI flags (applied by the
//! binary).

use crate::error::AgentError;
use crd_model::{relay_topic, DEFAULT_TOPIC_PREFIX, SERVER_TOPIC};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "CRD_RELAY_";

/// Relay agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host this agent serves; selects its topic
    pub hostname: String,
    /// Prefix of relay topics
    pub topic_prefix: String,
    /// Topic resync requests are sent to
    pub server_topic: String,
    /// Seconds between polling passes
    pub polling_interval_secs: u64,
    /// Seconds between reconnection attempts
    pub reconnect_interval_secs: u64,
    /// Seconds one `apply_config` call may take
    pub apply_timeout_secs: u64,
    /// Report the watermark on reconnect and accept an incremental tail
    pub incremental_catchup: bool,
}

impl RelayConfig {
    /// Create default configuration for `hostname`
    #[inline]
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// With polling interval
    #[inline]
    #[must_use]
    pub fn with_polling_interval(mut self, secs: u64) -> Self {
        self.polling_interval_secs = secs;
        self
    }

    /// With reconnect interval
    #[inline]
    #[must_use]
    pub fn with_reconnect_interval(mut self, secs: u64) -> Self {
        self.reconnect_interval_secs = secs;
        self
    }

    /// With apply timeout
    #[inline]
    #[must_use]
    pub fn with_apply_timeout(mut self, secs: u64) -> Self {
        self.apply_timeout_secs = secs;
        self
    }

    /// With incremental catch-up
    #[inline]
    #[must_use]
    pub fn with_incremental_catchup(mut self, enabled: bool) -> Self {
        self.incremental_catchup = enabled;
        self
    }

    /// Polling interval
    #[inline]
    #[must_use]
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    /// Reconnect interval
    #[inline]
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Apply timeout
    #[inline]
    #[must_use]
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    /// Topic this agent subscribes to
    #[inline]
    #[must_use]
    pub fn topic(&self) -> String {
        relay_topic(&self.topic_prefix, &self.hostname)
    }

    /// Parse from TOML, missing keys keep their defaults
    ///
    /// # Errors
    /// Returns `AgentError::Toml` for malformed input
    pub fn from_toml_str(input: &str) -> Result<Self, AgentError> {
        Ok(toml::from_str(input)?)
    }

    /// Resolve defaults, optional file and process environment, then validate
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an environment
    /// override is malformed, or the result fails validation
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        let mut config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CRD_RELAY_*` overrides from `vars`
    ///
    /// # Errors
    /// Returns `AgentError::Config` for values that do not parse
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), AgentError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "HOSTNAME" => self.hostname = value,
                "TOPIC_PREFIX" => self.topic_prefix = value,
                "SERVER_TOPIC" => self.server_topic = value,
                "POLLING_INTERVAL" => self.polling_interval_secs = parse_env(&key, &value)?,
                "RECONNECT_INTERVAL" => self.reconnect_interval_secs = parse_env(&key, &value)?,
                "APPLY_TIMEOUT" => self.apply_timeout_secs = parse_env(&key, &value)?,
                "INCREMENTAL_CATCHUP" => self.incremental_catchup = parse_env(&key, &value)?,
                _ => tracing::debug!(%key, "ignoring unknown relay override"),
            }
        }
        Ok(())
    }

    /// Reject configurations the agent cannot run with
    ///
    /// # Errors
    /// Returns `AgentError::Config` naming the offending field
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.hostname.trim().is_empty() {
            return Err(AgentError::Config("hostname must not be empty".to_string()));
        }
        if self.topic_prefix.is_empty() {
            return Err(AgentError::Config("topic_prefix must not be empty".to_string()));
        }
        for (field, value) in [
            ("polling_interval_secs", self.polling_interval_secs),
            ("reconnect_interval_secs", self.reconnect_interval_secs),
            ("apply_timeout_secs", self.apply_timeout_secs),
        ] {
            if value == 0 {
                return Err(AgentError::Config(format!("{field} must be positive")));
            }
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            server_topic: SERVER_TOPIC.to_string(),
            polling_interval_secs: 2,
            reconnect_interval_secs: 2,
            apply_timeout_secs: 30,
            incremental_catchup: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AgentError> {
    value
        .trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{key}: cannot parse {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_deployed_values() {
        let config = RelayConfig::default();
        assert_eq!(config.polling_interval(), Duration::from_secs(2));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(2));
        assert!(!config.incremental_catchup);
        assert_eq!(config.topic(), "crd_relay_agent.localhost");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            hostname = "compute-4"
            polling_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.hostname, "compute-4");
        assert_eq!(config.polling_interval_secs, 5);
        assert_eq!(config.reconnect_interval_secs, 2);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = RelayConfig::new("compute-1");
        config
            .apply_env(vars(&[
                ("CRD_RELAY_RECONNECT_INTERVAL", "7"),
                ("CRD_RELAY_INCREMENTAL_CATCHUP", "true"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        assert_eq!(config.reconnect_interval_secs, 7);
        assert!(config.incremental_catchup);
    }

    #[test]
    fn malformed_env_is_config_error() {
        let mut config = RelayConfig::default();
        let err = config
            .apply_env(vars(&[("CRD_RELAY_POLLING_INTERVAL", "soon")]))
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn validation_rejects_zero_intervals_and_blank_host() {
        assert!(RelayConfig::default().validate().is_ok());
        assert!(RelayConfig::default()
            .with_polling_interval(0)
            .validate()
            .is_err());
        assert!(RelayConfig::new("  ").validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hostname = \"compute-9\"\napply_timeout_secs = 10").unwrap();

        let config = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.apply_timeout_secs, 10);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = RelayConfig::load(Some(Path::new("/nonexistent/relay.toml"))).unwrap_err();
        assert!(matches!(err, AgentError::Io(_)));
    }
}
