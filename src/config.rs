//! # Connector Configuration
//!
//! Strongly typed options for the connector, loaded from a TOML file. Every
//! field has a default so a partial (or missing) file still yields a usable
//! configuration.
//!
//! ```text
//! [topic]       control prefix, account, client id, lifecycle suffixes
//! [device]      inventory reported in the birth certificate
//! [lifecycle]   birth policy, lifecycle QoS/retain/priority, republish flags
//! [payload]     wire encoding and compression
//! [broker]      rumqttc connection settings
//! [dispatcher]  request worker pool
//! ```

use crate::error::ConfigError;
use crate::payload::PayloadEncoding;
use crate::transport::Qos;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "cloudlink";
const CONFIG_FILE: &str = "cloudlink.toml";

/// Root of the connector configuration
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CloudOptions {
    pub topic: TopicOptions,
    pub device: DeviceOptions,
    pub lifecycle: LifecycleOptions,
    pub payload: PayloadOptions,
    pub broker: BrokerOptions,
    pub dispatcher: DispatcherOptions,
    /// Install `<prefix>/<account>/<client>/#` on every connect
    pub enable_default_subscriptions: bool,
}

/// Wire topic namespace
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicOptions {
    pub control_prefix: String,
    pub account_name: String,
    /// Device identifier used in every topic this gateway publishes
    pub client_id: String,
    pub separator: String,
    pub wildcard: String,
    pub birth_suffix: String,
    pub disconnect_suffix: String,
    pub apps_suffix: String,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            control_prefix: "$EDC".to_string(),
            account_name: "account-name".to_string(),
            client_id: "gateway".to_string(),
            separator: "/".to_string(),
            wildcard: "#".to_string(),
            birth_suffix: "MQTT/BIRTH".to_string(),
            disconnect_suffix: "MQTT/DC".to_string(),
            apps_suffix: "MQTT/APPS".to_string(),
        }
    }
}

/// Static inventory values reported in the birth certificate
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DeviceOptions {
    pub display_name: String,
    pub model_name: Option<String>,
    pub model_id: Option<String>,
    pub part_number: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub bios_version: Option<String>,
    pub connection_interface: Option<String>,
    pub connection_ip: Option<String>,
}

/// When the birth certificate is (re)published
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BirthCertPolicy {
    /// No lifecycle certificates at all
    Disable,
    /// Birth on the first connection only
    BirthConnect,
    /// Birth on every connection
    #[default]
    BirthConnectReconnect,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LifecycleOptions {
    pub birth_cert_policy: BirthCertPolicy,
    pub qos: Qos,
    pub retain: bool,
    pub priority: u8,
    pub republish_on_position_lock: bool,
    pub republish_on_modem_detect: bool,
    /// Upper bound of the best-effort acknowledgment wait
    pub ack_timeout_ms: u64,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            birth_cert_policy: BirthCertPolicy::default(),
            qos: Qos::AtMostOnce,
            retain: false,
            priority: 0,
            republish_on_position_lock: false,
            republish_on_modem_detect: false,
            ack_timeout_ms: 1000,
        }
    }
}

impl LifecycleOptions {
    pub fn certificates_disabled(&self) -> bool {
        self.birth_cert_policy == BirthCertPolicy::Disable
    }

    pub fn republish_on_reconnect(&self) -> bool {
        self.birth_cert_policy == BirthCertPolicy::BirthConnectReconnect
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct PayloadOptions {
    pub encoding: PayloadEncoding,
    pub compress: bool,
}

/// Connection settings for the rumqttc transport adapter
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub channel_capacity: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 30,
            username: None,
            password: None,
            clean_session: true,
            channel_capacity: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DispatcherOptions {
    pub workers: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

impl CloudOptions {
    /// `~/.config/cloudlink/cloudlink.toml` (platform config dir)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut dir| {
            dir.push(CONFIG_DIR);
            dir.push(CONFIG_FILE);
            dir
        })
    }

    /// Loads options from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let options = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        info!("Loaded connector options from {}", path.display());
        Ok(options)
    }

    /// Loads from `path` if it exists, else falls back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                warn!(
                    "Config file {} does not exist, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                debug!("No config path available, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.separator.is_empty() {
            return Err(ConfigError::Invalid("topic separator is empty".to_string()));
        }
        if self.topic.client_id.is_empty() {
            return Err(ConfigError::Invalid("topic client id is empty".to_string()));
        }
        if self.topic.client_id.contains(&self.topic.separator) {
            return Err(ConfigError::Invalid(format!(
                "client id '{}' contains the topic separator",
                self.topic.client_id
            )));
        }
        if self.dispatcher.workers == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher needs at least one worker".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lifecycle_ack_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lifecycle.ack_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_wire_conventions() {
        let options = CloudOptions::default();
        assert_eq!(options.topic.control_prefix, "$EDC");
        assert_eq!(options.topic.separator, "/");
        assert_eq!(options.topic.birth_suffix, "MQTT/BIRTH");
        assert_eq!(options.dispatcher.workers, 2);
        assert_eq!(options.lifecycle.ack_timeout_ms, 1000);
        assert_eq!(
            options.lifecycle.birth_cert_policy,
            BirthCertPolicy::BirthConnectReconnect
        );
        assert_eq!(options.payload.encoding, PayloadEncoding::Protobuf);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let options = CloudOptions::from_toml(
            r#"
            enable_default_subscriptions = true

            [topic]
            account_name = "ACC"
            client_id = "D1"

            [lifecycle]
            birth_cert_policy = "birth-connect"
            qos = 1

            [payload]
            encoding = "simple-json"
            compress = true
            "#,
        )
        .expect("valid toml");

        assert!(options.enable_default_subscriptions);
        assert_eq!(options.topic.account_name, "ACC");
        assert_eq!(options.topic.control_prefix, "$EDC");
        assert_eq!(options.lifecycle.qos, Qos::AtLeastOnce);
        assert!(!options.lifecycle.republish_on_reconnect());
        assert_eq!(options.payload.encoding, PayloadEncoding::SimpleJson);
        assert!(options.payload.compress);
        assert_eq!(options.broker.port, 1883);
    }

    #[test]
    fn rejects_client_id_with_separator() {
        let err = CloudOptions::from_toml("[topic]\nclient_id = \"a/b\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_qos() {
        let err = CloudOptions::from_toml("[lifecycle]\nqos = 7\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[topic]\naccount_name = \"FILE\"").expect("write");

        let options = CloudOptions::load(file.path()).expect("load");
        assert_eq!(options.topic.account_name, "FILE");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("absent.toml");

        let options = CloudOptions::load_or_default(Some(&path)).expect("defaults");
        assert_eq!(options, CloudOptions::default());
    }
}
