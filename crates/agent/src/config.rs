//! Agent configuration read from environment variables.
//!
//! `main` loads a `.env` file via `dotenvy` first, so every variable can
//! also come from there. Parsing goes through [`AgentConfig::from_lookup`]
//! so tests can supply values without touching the process environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default AWS IoT MQTT-over-TLS port.
pub const DEFAULT_PORT: u16 = 8883;

/// Default interval between start-next probes.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Default timeout for a single MQTT publish.
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 5;

/// Default upper bound on one Ansible run.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3600;

/// Default Ansible entrypoint.
pub const DEFAULT_ANSIBLE_PLAYBOOK: &str = "ansible-playbook";

/// Runtime configuration for the `autonom` daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// AWS IoT thing whose job queue is polled.
    pub thing_name: String,
    /// Broker endpoint, e.g. `abc123-ats.iot.eu-west-1.amazonaws.com`.
    pub host_name: String,
    pub port: u16,
    pub ca_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    /// MQTT client id, also sent as `clientToken` on every request.
    pub client_id: String,
    pub interval: Duration,
    pub publish_timeout: Duration,
    pub ansible_playbook: PathBuf,
    pub task_timeout: Duration,
}

impl AgentConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which returns the value of
    /// a variable or `None` when it is unset.
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let interval_secs = parse_or(&get, "AUTONOM_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?;
        if interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "AUTONOM_INTERVAL_SECS",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            thing_name: require("AUTONOM_THING_NAME")?,
            host_name: require("AUTONOM_HOST_NAME")?,
            port: parse_or(&get, "AUTONOM_PORT", DEFAULT_PORT)?,
            ca_path: require("AUTONOM_CA_PATH")?.into(),
            key_path: require("AUTONOM_KEY_PATH")?.into(),
            cert_path: require("AUTONOM_CERT_PATH")?.into(),
            client_id: get("AUTONOM_CLIENT_ID")
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            interval: Duration::from_secs(interval_secs),
            publish_timeout: Duration::from_secs(parse_or(
                &get,
                "AUTONOM_PUBLISH_TIMEOUT_SECS",
                DEFAULT_PUBLISH_TIMEOUT_SECS,
            )?),
            ansible_playbook: get("AUTONOM_ANSIBLE_PLAYBOOK")
                .unwrap_or_else(|| DEFAULT_ANSIBLE_PLAYBOOK.to_string())
                .into(),
            task_timeout: Duration::from_secs(parse_or(
                &get,
                "AUTONOM_TASK_TIMEOUT_SECS",
                DEFAULT_TASK_TIMEOUT_SECS,
            )?),
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Errors produced while reading [`AgentConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn required() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("AUTONOM_THING_NAME", "pi-01"),
            ("AUTONOM_HOST_NAME", "example-ats.iot.eu-west-1.amazonaws.com"),
            ("AUTONOM_CA_PATH", "/etc/autonom/root-ca.pem"),
            ("AUTONOM_KEY_PATH", "/etc/autonom/private.key"),
            ("AUTONOM_CERT_PATH", "/etc/autonom/cert.pem"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<AgentConfig, ConfigError> {
        AgentConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_applied() {
        let config = load(&required()).unwrap();
        assert_eq!(config.thing_name, "pi-01");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.publish_timeout, Duration::from_secs(5));
        assert_eq!(config.task_timeout, Duration::from_secs(3600));
        assert_eq!(config.ansible_playbook, PathBuf::from("ansible-playbook"));
        assert!(uuid::Uuid::parse_str(&config.client_id).is_ok());
    }

    #[test]
    fn overrides_applied() {
        let mut vars = required();
        vars.insert("AUTONOM_PORT", "443");
        vars.insert("AUTONOM_CLIENT_ID", "pi-01-agent");
        vars.insert("AUTONOM_INTERVAL_SECS", " 15 ");
        vars.insert("AUTONOM_ANSIBLE_PLAYBOOK", "/opt/ansible/bin/ansible-playbook");
        let config = load(&vars).unwrap();
        assert_eq!(config.port, 443);
        assert_eq!(config.client_id, "pi-01-agent");
        assert_eq!(config.interval, Duration::from_secs(15));
        assert_eq!(
            config.ansible_playbook,
            PathBuf::from("/opt/ansible/bin/ansible-playbook")
        );
    }

    #[test]
    fn missing_required_variable() {
        let mut vars = required();
        vars.remove("AUTONOM_CERT_PATH");
        assert_matches!(load(&vars), Err(ConfigError::Missing("AUTONOM_CERT_PATH")));
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let mut vars = required();
        vars.insert("AUTONOM_THING_NAME", "  ");
        assert_matches!(load(&vars), Err(ConfigError::Missing("AUTONOM_THING_NAME")));
    }

    #[test]
    fn invalid_numbers_rejected() {
        let mut vars = required();
        vars.insert("AUTONOM_PORT", "eighty");
        assert_matches!(
            load(&vars),
            Err(ConfigError::Invalid { key: "AUTONOM_PORT", .. })
        );

        let mut vars = required();
        vars.insert("AUTONOM_INTERVAL_SECS", "0");
        assert_matches!(
            load(&vars),
            Err(ConfigError::Invalid { key: "AUTONOM_INTERVAL_SECS", .. })
        );
    }
}
