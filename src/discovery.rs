//! Home Assistant MQTT discovery descriptors.
//!
//! One climate entity, a handful of sensors and two binary sensors, all attached to a
//! single device derived from the appliance serial. Descriptors are plain serde structs,
//! so building them twice from the same configuration gives byte-identical payloads.

use crate::config::{BridgeConfig, PublishMode};
use crate::mqtt::Broker;
use crate::topics::{Topics, CMD_SET_MODE, CMD_SET_TEMPERATURE, SUFFIX_PRESSURE, SUFFIX_SUPPLY_TEMPERATURE};
use rumqttc::QoS;
use serde::Serialize;
use tracing::{debug, error, info, warn};

const MANUFACTURER: &str = "Nefit";
const MODEL: &str = "Easy";

const FIELD_IN_HOUSE_TEMP: &str = "in_house_temp";
const FIELD_TEMP_SETPOINT: &str = "temp_setpoint";
const FIELD_USER_MODE: &str = "user_mode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Climate,
    Sensor,
    BinarySensor,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Climate => "climate",
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateConfig {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub modes: Vec<&'static str>,
    pub mode_state_topic: String,
    pub mode_state_template: String,
    pub mode_command_topic: String,
    pub mode_command_template: String,
    pub current_temperature_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_temperature_template: Option<String>,
    pub temperature_state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_state_template: Option<String>,
    pub temperature_command_topic: String,
    pub min_temp: f64,
    pub max_temp: f64,
    pub temp_step: f64,
    pub precision: f64,
    pub temperature_unit: &'static str,
    pub availability_topic: String,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorConfig {
    pub name: &'static str,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<&'static str>,
    pub availability_topic: String,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinarySensorConfig {
    pub name: &'static str,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    pub payload_on: &'static str,
    pub payload_off: &'static str,
    pub device_class: &'static str,
    pub availability_topic: String,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityConfig {
    Climate(ClimateConfig),
    Sensor(SensorConfig),
    BinarySensor(BinarySensorConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDescriptor {
    pub component: Component,
    pub entity_id: String,
    pub config: EntityConfig,
}

impl DiscoveryDescriptor {
    pub fn topic(&self, discovery_prefix: &str) -> String {
        format!(
            "{}/{}/{}/config",
            discovery_prefix,
            self.component.as_str(),
            self.entity_id
        )
    }

    pub fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.config)
    }
}

struct SensorDef {
    field: &'static str,
    name: &'static str,
    device_class: Option<&'static str>,
    unit: Option<&'static str>,
    icon: Option<&'static str>,
}

const SENSORS: &[SensorDef] = &[
    SensorDef {
        field: FIELD_IN_HOUSE_TEMP,
        name: "Indoor temperature",
        device_class: Some("temperature"),
        unit: Some("°C"),
        icon: None,
    },
    SensorDef {
        field: "outdoor_temp",
        name: "Outdoor temperature",
        device_class: Some("temperature"),
        unit: Some("°C"),
        icon: None,
    },
    SensorDef {
        field: FIELD_TEMP_SETPOINT,
        name: "Temperature setpoint",
        device_class: Some("temperature"),
        unit: Some("°C"),
        icon: None,
    },
    SensorDef {
        field: SUFFIX_SUPPLY_TEMPERATURE,
        name: "Supply temperature",
        device_class: Some("temperature"),
        unit: Some("°C"),
        icon: None,
    },
    SensorDef {
        field: SUFFIX_PRESSURE,
        name: "System pressure",
        device_class: Some("pressure"),
        unit: Some("bar"),
        icon: None,
    },
    SensorDef {
        field: FIELD_USER_MODE,
        name: "User mode",
        device_class: None,
        unit: None,
        icon: Some("mdi:calendar-clock"),
    },
    SensorDef {
        field: "boiler_indicator",
        name: "Boiler indicator",
        device_class: None,
        unit: None,
        icon: Some("mdi:fire"),
    },
];

// (field, name, device class)
const BINARY_SENSORS: &[(&str, &str, &str)] = &[
    ("hot_water_active", "Hot water active", "heat"),
    ("boiler_maintenance", "Boiler maintenance", "problem"),
];

/// Where one status field can be read from, given the publish mode.
struct StateBinding<'a> {
    topics: &'a Topics,
    mode: PublishMode,
}

impl StateBinding<'_> {
    fn topic(&self, field: &str) -> String {
        match self.mode {
            PublishMode::Aggregate => self.topics.status().to_string(),
            PublishMode::PerField => self.topics.field(field),
        }
    }

    fn template(&self, field: &str) -> Option<String> {
        match self.mode {
            PublishMode::Aggregate => Some(format!("{{{{ value_json.{} }}}}", field)),
            PublishMode::PerField => None,
        }
    }

    /// Jinja expression evaluating to the raw field value.
    fn expression(&self, field: &str) -> String {
        match self.mode {
            PublishMode::Aggregate => format!("value_json.{}", field),
            PublishMode::PerField => "value".to_string(),
        }
    }
}

/// Builds the full descriptor set: climate first, then sensors, then binary sensors.
pub fn build_descriptors(config: &BridgeConfig) -> Vec<DiscoveryDescriptor> {
    let serial = &config.serial_number;
    let topics = &config.topics;
    let binding = StateBinding {
        topics,
        mode: config.publish_mode,
    };
    let device = DeviceInfo {
        identifiers: vec![format!("nefit_{}", serial)],
        manufacturer: MANUFACTURER,
        model: MODEL,
        name: config.discovery.device_name.clone(),
    };
    let availability_topic = topics.available();
    let entity_id = |suffix: &str| format!("nefit_{}_{}", serial, suffix);

    let mut descriptors = Vec::with_capacity(1 + SENSORS.len() + BINARY_SENSORS.len());

    let climate_id = entity_id("thermostat");
    descriptors.push(DiscoveryDescriptor {
        component: Component::Climate,
        entity_id: climate_id.clone(),
        config: EntityConfig::Climate(ClimateConfig {
            name: config.discovery.device_name.clone(),
            unique_id: climate_id.clone(),
            object_id: climate_id,
            modes: vec!["heat", "auto"],
            mode_state_topic: binding.topic(FIELD_USER_MODE),
            mode_state_template: format!(
                "{{{{ 'auto' if {} == 'clock' else 'heat' }}}}",
                binding.expression(FIELD_USER_MODE)
            ),
            mode_command_topic: topics.command(CMD_SET_MODE),
            mode_command_template: "{{ 'clock' if value == 'auto' else 'manual' }}".to_string(),
            current_temperature_topic: binding.topic(FIELD_IN_HOUSE_TEMP),
            current_temperature_template: binding.template(FIELD_IN_HOUSE_TEMP),
            temperature_state_topic: binding.topic(FIELD_TEMP_SETPOINT),
            temperature_state_template: binding.template(FIELD_TEMP_SETPOINT),
            temperature_command_topic: topics.command(CMD_SET_TEMPERATURE),
            min_temp: 5.0,
            max_temp: 30.0,
            temp_step: 0.5,
            precision: 0.1,
            temperature_unit: "C",
            availability_topic: availability_topic.clone(),
            device: device.clone(),
        }),
    });

    for sensor in SENSORS {
        let id = entity_id(sensor.field);
        descriptors.push(DiscoveryDescriptor {
            component: Component::Sensor,
            entity_id: id.clone(),
            config: EntityConfig::Sensor(SensorConfig {
                name: sensor.name,
                unique_id: id.clone(),
                object_id: id,
                state_topic: binding.topic(sensor.field),
                value_template: binding.template(sensor.field),
                device_class: sensor.device_class,
                state_class: sensor.unit.map(|_| "measurement"),
                unit_of_measurement: sensor.unit,
                icon: sensor.icon,
                availability_topic: availability_topic.clone(),
                device: device.clone(),
            }),
        });
    }

    for &(field, name, device_class) in BINARY_SENSORS {
        let id = entity_id(field);
        descriptors.push(DiscoveryDescriptor {
            component: Component::BinarySensor,
            entity_id: id.clone(),
            config: EntityConfig::BinarySensor(BinarySensorConfig {
                name,
                unique_id: id.clone(),
                object_id: id,
                state_topic: binding.topic(field),
                value_template: binding.template(field),
                payload_on: "1",
                payload_off: "0",
                device_class,
                availability_topic: availability_topic.clone(),
                device: device.clone(),
            }),
        });
    }

    descriptors
}

/// Publishes every descriptor retained at QoS 1. Failures are logged and skipped.
///
/// Returns the number of descriptors the broker accepted.
pub async fn publish_discovery(broker: &dyn Broker, config: &BridgeConfig) -> usize {
    let descriptors = build_descriptors(config);
    let total = descriptors.len();
    let mut published = 0;

    for descriptor in descriptors {
        let topic = descriptor.topic(&config.discovery.prefix);
        let payload = match descriptor.payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode discovery descriptor {}: {}", topic, e);
                continue;
            }
        };
        match broker.publish(&topic, payload, QoS::AtLeastOnce, true).await {
            Ok(()) => {
                debug!("Published discovery descriptor {}", topic);
                published += 1;
            }
            Err(e) => warn!("Failed to publish discovery descriptor {}: {}", topic, e),
        }
    }

    info!("Published {}/{} discovery descriptors", published, total);
    published
}

/// Tells the appliance, through the bridge's own command topic, that heating mode is
/// driven from MQTT rather than the built-in clock program.
pub async fn assert_manual_mode(broker: &dyn Broker, topics: &Topics) {
    let topic = topics.command(CMD_SET_MODE);
    match broker
        .publish(&topic, "manual".to_string(), QoS::AtMostOnce, false)
        .await
    {
        Ok(()) => info!("Requested manual mode on {}", topic),
        Err(e) => warn!("Failed to request manual mode on {}: {}", topic, e),
    }
}
