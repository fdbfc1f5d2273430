use crate::config::ConfigError;
use std::fmt;
use std::time::Duration;
use url::Url;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttTransport {
    Tcp,
    Tls,
}

#[derive(Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub transport: MqttTransport,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Topic carrying the retained `offline` last will
    pub availability_topic: String,
}

impl MqttConfig {
    /// Accepts `mqtt://`, `tcp://`, `mqtts://` and `ssl://` URLs. Credentials embedded in
    /// the URL are used unless explicit ones are supplied later.
    pub fn from_url(
        raw_url: &str,
        client_id: String,
        availability_topic: String,
    ) -> Result<Self, ConfigError> {
        let url = Url::parse(raw_url).map_err(|e| ConfigError::Invalid {
            key: "MQTT_URL",
            reason: e.to_string(),
        })?;

        let (transport, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (MqttTransport::Tcp, 1883),
            "mqtts" | "ssl" | "tls" => (MqttTransport::Tls, 8883),
            other => {
                return Err(ConfigError::Invalid {
                    key: "MQTT_URL",
                    reason: format!("unsupported scheme '{}'", other),
                })
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::Invalid {
                key: "MQTT_URL",
                reason: "missing host".to_string(),
            })?
            .to_string();

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = url.password().map(str::to_string);

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            transport,
            username,
            password,
            client_id,
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            availability_topic,
        })
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        if username.is_some() {
            self.username = username;
            self.password = password;
        } else if password.is_some() {
            self.password = password;
        }
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .field("username", &self.username)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("availability_topic", &self.availability_topic)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(url: &str) -> Result<MqttConfig, ConfigError> {
        MqttConfig::from_url(url, "nefit-1".into(), "/nefit/1/available".into())
    }

    #[test]
    fn plain_url_defaults_port() {
        let config = parse("mqtt://broker.lan").unwrap();
        assert_eq!(config.host, "broker.lan");
        assert_eq!(config.port, 1883);
        assert_eq!(config.transport, MqttTransport::Tcp);
        assert!(config.username.is_none());
    }

    #[test]
    fn tls_url_with_embedded_credentials() {
        let config = parse("mqtts://user:pw@broker.lan:8884").unwrap();
        assert_eq!(config.transport, MqttTransport::Tls);
        assert_eq!(config.port, 8884);
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert!(!format!("{:?}", config).contains("pw\""));
    }

    #[test]
    fn explicit_credentials_win() {
        let config = parse("mqtt://user:pw@broker.lan")
            .unwrap()
            .with_credentials(Some("other".into()), None);
        assert_eq!(config.username.as_deref(), Some("other"));
        assert!(config.password.is_none());
    }

    #[test]
    fn rejects_unsupported_urls() {
        assert!(matches!(
            parse("ws://broker.lan"),
            Err(ConfigError::Invalid { key: "MQTT_URL", .. })
        ));
        assert!(parse("not a url").is_err());
    }
}
