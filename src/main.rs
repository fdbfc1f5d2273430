pub mod appliance;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod lifecycle;
pub mod mqtt;
pub mod normalizer;
pub mod poller;
pub mod topics;

#[cfg(test)]
mod testing;

use crate::appliance::easy_server::EasyServerClient;
use crate::appliance::Appliance;
use crate::config::BridgeConfig;
use crate::lifecycle::{termination_signal, LifecycleManager};
use crate::mqtt::mqtt_handler::MqttHandler;
use crate::mqtt::{Broker, BrokerError};
use color_eyre::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = match BridgeConfig::load().await {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Bridging appliance {} to {} under {}",
        config.serial_number,
        config.mqtt.address(),
        config.topics.status()
    );

    let appliance: Arc<dyn Appliance> =
        Arc::new(EasyServerClient::new(config.appliance.clone())?);

    let mqtt_config = config.mqtt.clone();
    let connect_broker = async move {
        let (handler, inbound) = MqttHandler::connect(mqtt_config).await?;
        let broker: Arc<dyn Broker> = Arc::new(handler);
        Ok::<_, BrokerError>((broker, inbound))
    };

    let manager = LifecycleManager::new(config, appliance);
    if let Err(e) = manager.run(connect_broker, termination_signal()).await {
        error!("Bridge terminated: {}", e);
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
