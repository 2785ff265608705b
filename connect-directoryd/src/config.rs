use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountConfig {
    /// Canonical login id of the account, reported as the active user of
    /// devices only known through the Web API
    #[serde(default)]
    pub login_id: String,
    /// Device used when a request names no device (or "*")
    #[serde(default)]
    pub default_device_id: Option<String>,
    /// OAuth client id used for the refresh-token grant
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Grace period after the listeners start; 0 disables discovery entirely
    #[serde(default = "default_initial_discovery_timeout")]
    pub initial_discovery_timeout_secs: f64,
    #[serde(default = "default_self_description_timeout")]
    pub self_description_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivationConfig {
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: i64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_initial_discovery_timeout() -> f64 {
    3.0
}

fn default_self_description_timeout() -> u64 {
    4
}

fn default_activation_timeout() -> i64 {
    15
}

fn default_transfer_timeout() -> i64 {
    10
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_discovery_timeout_secs: default_initial_discovery_timeout(),
            self_description_timeout_secs: default_self_description_timeout(),
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            activation_timeout_secs: default_activation_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl DiscoveryConfig {
    pub fn is_enabled(&self) -> bool {
        self.initial_discovery_timeout_secs > 0.0
    }

    pub fn initial_discovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.initial_discovery_timeout_secs.max(0.0))
    }

    pub fn self_description_timeout(&self) -> Duration {
        Duration::from_secs(self.self_description_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[account]
login_id = "31l77y2al5lnn7mxfrmd4bpfhqke"
default_device_id = "30fbc80e35598f3c242f2120413c943dfd9715fe"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.account.login_id, "31l77y2al5lnn7mxfrmd4bpfhqke");
        assert_eq!(config.discovery.initial_discovery_timeout_secs, 3.0);
        assert_eq!(config.discovery.self_description_timeout(), Duration::from_secs(4));
        assert_eq!(config.activation.activation_timeout_secs, 15);
        assert_eq!(config.activation.transfer_timeout_secs, 10);
        assert_eq!(config.api.listen, "127.0.0.1:8054");
        assert!(config.discovery.is_enabled());
    }

    #[test]
    fn test_zero_grace_period_disables_discovery() {
        let config: Config = toml::from_str(
            r#"
[discovery]
initial_discovery_timeout_secs = 0.0
"#,
        )
        .unwrap();
        assert!(!config.discovery.is_enabled());
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = Config::load("/nonexistent/connect-directoryd.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/connect-directoryd.toml"));
    }
}
