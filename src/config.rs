//! Process configuration.
//!
//! Values come from the environment, optionally layered over a TOML file whose keys are
//! the lowercase environment names. Everything is validated once into an immutable
//! [`BridgeConfig`] before any connection is attempted.

use crate::appliance::easy_server::{EasyServerConfig, DEFAULT_REQUEST_TIMEOUT};
use crate::mqtt::config::MqttConfig;
use crate::topics::Topics;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_POLL_DELAY_MS: u64 = 300_000;
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_DISCOVERY_NAME: &str = "livingroom";
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:3000";

const CONFIG_PATH_VAR: &str = "NEFIT_MQTT_CONFIG";
const CONFIG_DIR: &str = "nefit-mqtt-bridge";
const CONFIG_FILE: &str = "config.toml";

const KEY_SERIAL: &str = "NEFIT_SERIAL_NUMBER";
const KEY_ACCESS_KEY: &str = "NEFIT_ACCESS_KEY";
const KEY_PASSWORD: &str = "NEFIT_PASSWORD";
const KEY_BRIDGE_URL: &str = "NEFIT_BRIDGE_URL";
const KEY_MQTT_URL: &str = "MQTT_URL";
const KEY_MQTT_USERNAME: &str = "MQTT_USERNAME";
const KEY_MQTT_PASSWORD: &str = "MQTT_PASSWORD";
const KEY_MQTT_CLIENT_ID: &str = "MQTT_CLIENT_ID";
const KEY_TOPIC_PREFIX: &str = "TOPIC_PREFIX";
const KEY_POLL_DELAY: &str = "POLL_DELAY";
const KEY_SEPARATE_TOPICS: &str = "PUBLISH_TO_SEPERATE_TOPICS";
const KEY_SEPARATE_TOPICS_ALIAS: &str = "PUBLISH_TO_SEPARATE_TOPICS";
const KEY_DISCOVERY_PREFIX: &str = "DISCOVERY_PREFIX";
const KEY_DISCOVERY_NAME: &str = "DISCOVERY_NAME";

const KNOWN_KEYS: &[&str] = &[
    KEY_SERIAL,
    KEY_ACCESS_KEY,
    KEY_PASSWORD,
    KEY_BRIDGE_URL,
    KEY_MQTT_URL,
    KEY_MQTT_USERNAME,
    KEY_MQTT_PASSWORD,
    KEY_MQTT_CLIENT_ID,
    KEY_TOPIC_PREFIX,
    KEY_POLL_DELAY,
    KEY_SEPARATE_TOPICS,
    KEY_SEPARATE_TOPICS_ALIAS,
    KEY_DISCOVERY_PREFIX,
    KEY_DISCOVERY_NAME,
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// How status is laid out on the broker. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// One JSON object on the prefix topic
    Aggregate,
    /// One message per field on `<prefix>/<field>`
    PerField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub prefix: String,
    pub device_name: String,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub serial_number: String,
    pub appliance: EasyServerConfig,
    pub mqtt: MqttConfig,
    pub topics: Topics,
    pub poll_delay: Duration,
    pub publish_mode: PublishMode,
    pub discovery: DiscoveryConfig,
}

/// Flat key/value view over one configuration layer
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    values: HashMap<String, String>,
}

impl ConfigSource {
    pub fn from_env() -> Self {
        let values = KNOWN_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        Self { values }
    }

    /// Keys are matched case-insensitively; scalars of any TOML type are accepted.
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let values = table
            .into_iter()
            .filter_map(|(key, value)| {
                let rendered = match value {
                    toml::Value::String(s) => s,
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    _ => return None,
                };
                Some((key.to_ascii_uppercase(), rendered))
            })
            .collect();
        Ok(Self { values })
    }

    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&content, path)
    }

    /// Values in `overrides` replace values in `self`.
    pub fn merge(mut self, overrides: ConfigSource) -> Self {
        self.values.extend(overrides.values);
        self
    }

    /// Empty strings count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigSource {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl BridgeConfig {
    /// Reads the optional config file and the environment.
    pub async fn load() -> Result<Self, ConfigError> {
        let env = ConfigSource::from_env();
        let source = match config_file_path() {
            Some(path) => {
                info!("Loading configuration file {}", path.display());
                ConfigSource::from_file(&path).await?.merge(env)
            }
            None => env,
        };
        Self::from_source(&source)
    }

    pub fn from_source(source: &ConfigSource) -> Result<Self, ConfigError> {
        let serial_number = source.require(KEY_SERIAL)?.to_string();
        let access_key = source.require(KEY_ACCESS_KEY)?.to_string();
        let password = source.require(KEY_PASSWORD)?.to_string();
        let mqtt_url = source.require(KEY_MQTT_URL)?;

        let prefix = source
            .get(KEY_TOPIC_PREFIX)
            .map(str::to_string)
            .unwrap_or_else(|| Topics::default_prefix(&serial_number));
        let topics = Topics::new(&prefix);
        if topics.status().is_empty() {
            return Err(ConfigError::Invalid {
                key: KEY_TOPIC_PREFIX,
                reason: "prefix is empty after stripping trailing slashes".to_string(),
            });
        }

        let bridge_url = source.get(KEY_BRIDGE_URL).unwrap_or(DEFAULT_BRIDGE_URL);
        url::Url::parse(bridge_url).map_err(|e| ConfigError::Invalid {
            key: KEY_BRIDGE_URL,
            reason: e.to_string(),
        })?;

        let client_id = source
            .get(KEY_MQTT_CLIENT_ID)
            .map(str::to_string)
            .unwrap_or_else(|| format!("nefit-{}", serial_number));
        let mqtt = MqttConfig::from_url(mqtt_url, client_id, topics.available())?
            .with_credentials(
                source.get(KEY_MQTT_USERNAME).map(str::to_string),
                source.get(KEY_MQTT_PASSWORD).map(str::to_string),
            );

        let poll_delay = match source.get(KEY_POLL_DELAY) {
            Some(raw) => parse_poll_delay(raw)?,
            None => Duration::from_millis(DEFAULT_POLL_DELAY_MS),
        };

        let separate = source
            .get(KEY_SEPARATE_TOPICS)
            .or_else(|| source.get(KEY_SEPARATE_TOPICS_ALIAS));
        let publish_mode = if separate.map(parse_flag).unwrap_or(false) {
            PublishMode::PerField
        } else {
            PublishMode::Aggregate
        };

        let discovery = DiscoveryConfig {
            prefix: source
                .get(KEY_DISCOVERY_PREFIX)
                .unwrap_or(DEFAULT_DISCOVERY_PREFIX)
                .trim_end_matches('/')
                .to_string(),
            device_name: source
                .get(KEY_DISCOVERY_NAME)
                .unwrap_or(DEFAULT_DISCOVERY_NAME)
                .to_string(),
        };

        let config = BridgeConfig {
            appliance: EasyServerConfig {
                base_url: bridge_url.trim_end_matches('/').to_string(),
                serial_number: serial_number.clone(),
                access_key,
                password,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            },
            serial_number,
            mqtt,
            topics,
            poll_delay,
            publish_mode,
            discovery,
        };
        debug!("Configuration: {:?}", config);
        Ok(config)
    }
}

fn parse_poll_delay(raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key: KEY_POLL_DELAY,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(ConfigError::Invalid {
            key: KEY_POLL_DELAY,
            reason: e.to_string(),
        }),
    }
}

/// Any non-empty value switches the flag on, except the usual spellings of "off".
fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let mut path = dirs::config_dir()?;
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            (KEY_SERIAL, "12345"),
            (KEY_ACCESS_KEY, "access"),
            (KEY_PASSWORD, "secret"),
            (KEY_MQTT_URL, "mqtt://broker.lan"),
        ]
    }

    fn source(extra: &[(&'static str, &'static str)]) -> ConfigSource {
        required().into_iter().chain(extra.iter().copied()).collect()
    }

    #[test]
    fn defaults_apply() {
        let config = BridgeConfig::from_source(&source(&[])).unwrap();
        assert_eq!(config.topics.status(), "/nefit/12345");
        assert_eq!(config.poll_delay, Duration::from_millis(300_000));
        assert_eq!(config.publish_mode, PublishMode::Aggregate);
        assert_eq!(config.discovery.prefix, "homeassistant");
        assert_eq!(config.discovery.device_name, "livingroom");
        assert_eq!(config.mqtt.client_id, "nefit-12345");
        assert_eq!(config.mqtt.availability_topic, "/nefit/12345/available");
        assert_eq!(config.appliance.base_url, DEFAULT_BRIDGE_URL);
    }

    #[test]
    fn missing_broker_url_is_reported() {
        let source: ConfigSource = required()
            .into_iter()
            .filter(|(k, _)| *k != KEY_MQTT_URL)
            .collect();
        assert!(matches!(
            BridgeConfig::from_source(&source),
            Err(ConfigError::Missing("MQTT_URL"))
        ));
    }

    #[test]
    fn required_keys_are_checked_in_order() {
        let empty = ConfigSource::default();
        assert!(matches!(
            BridgeConfig::from_source(&empty),
            Err(ConfigError::Missing("NEFIT_SERIAL_NUMBER"))
        ));
        let blank: ConfigSource = [(KEY_SERIAL, "1"), (KEY_ACCESS_KEY, "")].into_iter().collect();
        assert!(matches!(
            BridgeConfig::from_source(&blank),
            Err(ConfigError::Missing("NEFIT_ACCESS_KEY"))
        ));
    }

    #[test]
    fn overrides_are_honoured() {
        let config = BridgeConfig::from_source(&source(&[
            (KEY_TOPIC_PREFIX, "home/boiler/"),
            (KEY_POLL_DELAY, "1000"),
            (KEY_SEPARATE_TOPICS, "true"),
            (KEY_DISCOVERY_PREFIX, "ha/"),
            (KEY_DISCOVERY_NAME, "attic"),
            (KEY_MQTT_USERNAME, "bridge"),
        ]))
        .unwrap();
        assert_eq!(config.topics.status(), "home/boiler");
        assert_eq!(config.poll_delay, Duration::from_millis(1000));
        assert_eq!(config.publish_mode, PublishMode::PerField);
        assert_eq!(config.discovery.prefix, "ha");
        assert_eq!(config.discovery.device_name, "attic");
        assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
    }

    #[test]
    fn separate_topics_flag_spellings() {
        for (raw, expected) in [
            ("1", PublishMode::PerField),
            ("yes", PublishMode::PerField),
            ("false", PublishMode::Aggregate),
            ("OFF", PublishMode::Aggregate),
        ] {
            let config =
                BridgeConfig::from_source(&source(&[(KEY_SEPARATE_TOPICS_ALIAS, raw)])).unwrap();
            assert_eq!(config.publish_mode, expected, "flag value {}", raw);
        }
    }

    #[test]
    fn invalid_poll_delay_is_rejected() {
        for raw in ["0", "soon", "-5"] {
            assert!(matches!(
                BridgeConfig::from_source(&source(&[(KEY_POLL_DELAY, raw)])),
                Err(ConfigError::Invalid { key: "POLL_DELAY", .. })
            ));
        }
    }

    #[test]
    fn file_layer_is_overridden_by_environment() {
        let file = ConfigSource::from_toml_str(
            r#"
            nefit_serial_number = "999"
            poll_delay = 2000
            publish_to_seperate_topics = true
            "#,
            Path::new("config.toml"),
        )
        .unwrap();
        let merged = file.merge(source(&[]));
        let config = BridgeConfig::from_source(&merged).unwrap();
        assert_eq!(config.serial_number, "12345");
        assert_eq!(config.poll_delay, Duration::from_millis(2000));
        assert_eq!(config.publish_mode, PublishMode::PerField);
    }

    #[test]
    fn broken_file_reports_parse_error() {
        assert!(matches!(
            ConfigSource::from_toml_str("poll_delay = ", Path::new("bad.toml")),
            Err(ConfigError::Parse { .. })
        ));
    }
}
