//! # Appliance collaborator
//!
//! The bridge never speaks the heating appliance's encrypted remote protocol itself.
//! Everything it needs from the appliance goes through the [`Appliance`] trait:
//!
//! ```text
//! appliance/
//! ├── mod.rs          - trait, status/reading types, errors
//! └── easy_server.rs  - HTTP bridge client (the shipped implementation)
//! ```
//!
//! Handles are shared as `Arc<dyn Appliance>`. Only the lifecycle code calls
//! [`Appliance::connect`] and [`Appliance::end`]; the poll loop and the command worker
//! use the query and setter methods.

pub mod easy_server;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors surfaced by an appliance session
#[derive(Debug, Error)]
pub enum ApplianceError {
    /// The request never produced a response (DNS, TCP, timeout, TLS)
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The bridge answered with a non-success HTTP status
    #[error("{endpoint} answered with HTTP {status}")]
    Rejected { endpoint: String, status: u16 },

    /// The response body did not have the expected shape
    #[error("unexpected response from {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },

    #[error("appliance unavailable: {0}")]
    Unavailable(String),
}

/// One value of the raw status record
#[derive(Debug, Clone, PartialEq)]
pub enum StatusValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Null,
    /// Objects and arrays. Never published.
    Nested(serde_json::Value),
}

impl From<serde_json::Value> for StatusValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StatusValue::Null,
            serde_json::Value::Bool(b) => StatusValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => StatusValue::Number(f),
                None => StatusValue::Nested(serde_json::Value::Number(n)),
            },
            serde_json::Value::String(s) => StatusValue::Text(s),
            nested @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                StatusValue::Nested(nested)
            }
        }
    }
}

/// Status record as reported by the appliance, ordered by field name.
///
/// Replaced on every poll cycle; nothing keeps a history of it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "serde_json::Map<String, serde_json::Value>")]
pub struct ApplianceStatus {
    fields: Vec<(String, StatusValue)>,
}

impl ApplianceStatus {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StatusValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&StatusValue> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for ApplianceStatus {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        map.into_iter().map(|(k, v)| (k, StatusValue::from(v))).collect()
    }
}

impl<K: Into<String>> FromIterator<(K, StatusValue)> for ApplianceStatus {
    fn from_iter<I: IntoIterator<Item = (K, StatusValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// System water pressure
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PressureReading {
    pub pressure: f64,
}

/// Actual supply (flow) temperature of the heating circuit
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SupplyTemperature {
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMode {
    Manual,
    Clock,
}

impl UserMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserMode::Manual => "manual",
            UserMode::Clock => "clock",
        }
    }
}

impl FromStr for UserMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(UserMode::Manual),
            "clock" => Ok(UserMode::Clock),
            _ => Err(()),
        }
    }
}

impl fmt::Display for UserMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotWaterSupply {
    On,
    Off,
}

impl HotWaterSupply {
    pub fn as_str(&self) -> &'static str {
        match self {
            HotWaterSupply::On => "on",
            HotWaterSupply::Off => "off",
        }
    }
}

impl FromStr for HotWaterSupply {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(HotWaterSupply::On),
            "off" => Ok(HotWaterSupply::Off),
            _ => Err(()),
        }
    }
}

impl fmt::Display for HotWaterSupply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote session with the heating appliance
///
/// All calls are independent requests; implementations must tolerate being called
/// concurrently (the poll loop fans out three queries at once).
#[async_trait]
pub trait Appliance: Send + Sync {
    /// Opens the session. Called once by the lifecycle manager.
    async fn connect(&self) -> Result<(), ApplianceError>;

    /// Closes the session. Called once by the lifecycle manager.
    async fn end(&self) -> Result<(), ApplianceError>;

    async fn status(&self) -> Result<ApplianceStatus, ApplianceError>;

    async fn pressure(&self) -> Result<PressureReading, ApplianceError>;

    async fn supply_temperature(&self) -> Result<SupplyTemperature, ApplianceError>;

    /// The raw payload is passed through; the appliance side parses it.
    async fn set_temperature(&self, value: &str) -> Result<(), ApplianceError>;

    async fn set_user_mode(&self, mode: UserMode) -> Result<(), ApplianceError>;

    async fn set_hot_water_supply(&self, state: HotWaterSupply) -> Result<(), ApplianceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_deserializes_into_tagged_values() {
        let status: ApplianceStatus = serde_json::from_value(json!({
            "user mode": "clock",
            "in house temp": 20.5,
            "hot water active": false,
            "outdoor source": null,
            "current switchpoint": {"time": 420},
        }))
        .unwrap();

        assert_eq!(status.len(), 5);
        assert_eq!(
            status.get("user mode"),
            Some(&StatusValue::Text("clock".to_string()))
        );
        assert_eq!(status.get("in house temp"), Some(&StatusValue::Number(20.5)));
        assert_eq!(status.get("hot water active"), Some(&StatusValue::Bool(false)));
        assert_eq!(status.get("outdoor source"), Some(&StatusValue::Null));
        assert!(matches!(
            status.get("current switchpoint"),
            Some(StatusValue::Nested(_))
        ));
    }

    #[test]
    fn readings_ignore_extra_fields() {
        let pressure: PressureReading =
            serde_json::from_value(json!({"pressure": 1.8, "unit": "bar", "id": "x"})).unwrap();
        assert_eq!(pressure.pressure, 1.8);

        let supply: SupplyTemperature =
            serde_json::from_value(json!({"temperature": 45.2})).unwrap();
        assert_eq!(supply.temperature, 45.2);
    }

    #[test]
    fn modes_parse_exactly() {
        assert_eq!("manual".parse::<UserMode>(), Ok(UserMode::Manual));
        assert_eq!("clock".parse::<UserMode>(), Ok(UserMode::Clock));
        assert!("Manual".parse::<UserMode>().is_err());
        assert!("eco".parse::<UserMode>().is_err());
        assert_eq!("off".parse::<HotWaterSupply>(), Ok(HotWaterSupply::Off));
        assert!(" on".parse::<HotWaterSupply>().is_err());
    }
}
