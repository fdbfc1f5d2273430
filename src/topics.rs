//! MQTT topic layout, rooted at the configured prefix.

pub const SUFFIX_AVAILABLE: &str = "available";
pub const SUFFIX_SERIAL: &str = "serial";
pub const SUFFIX_PRESSURE: &str = "pressure";
pub const SUFFIX_SUPPLY_TEMPERATURE: &str = "supply_temperature";

const SEGMENT_COMMAND: &str = "command";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

pub const CMD_SET_TEMPERATURE: &str = "settemperature";
pub const CMD_SET_MODE: &str = "setmode";
pub const CMD_SET_HOT_WATER_SUPPLY: &str = "sethotwatersupply";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    /// Trailing slashes on the prefix are stripped.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn default_prefix(serial: &str) -> String {
        format!("/nefit/{}", serial)
    }

    /// Aggregate status topic.
    pub fn status(&self) -> &str {
        &self.prefix
    }

    pub fn field(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    pub fn available(&self) -> String {
        self.field(SUFFIX_AVAILABLE)
    }

    pub fn command(&self, suffix: &str) -> String {
        format!("{}/{}/{}", self.prefix, SEGMENT_COMMAND, suffix)
    }

    pub fn command_wildcard(&self) -> String {
        self.command("+")
    }
}

/// Field names that would land on the availability flag or the command subtree.
pub fn is_reserved_field(key: &str) -> bool {
    key == SUFFIX_AVAILABLE || key == SEGMENT_COMMAND
}

/// Last `/`-separated segment of an inbound topic.
pub fn command_suffix(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}
