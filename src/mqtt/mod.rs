//! # MQTT Integration Module
//!
//! Broker side of the bridge: the connection to the MQTT broker, inbound message
//! representation, and the [`Broker`] seam the rest of the crate publishes through.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker URL parsing, credentials, last will topic
//! ├── message_manager.rs  - Inbound message representation
//! └── mqtt_handler.rs     - rumqttc client, event loop task, reconnect handling
//! ```
//!
//! ## Ownership
//!
//! The lifecycle manager owns the one [`mqtt_handler::MqttHandler`] and hands it out as
//! `Arc<dyn Broker>`. The poll loop, the command worker and the discovery publisher only
//! publish; [`Broker::disconnect`] is reserved for the shutdown path.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

use async_trait::async_trait;
use rumqttc::QoS;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    /// The client's request queue is gone, usually because the event loop stopped
    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Outbound side of a broker connection
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: String,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError>;

    async fn subscribe(&self, pattern: &str) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}
