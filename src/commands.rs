//! Inbound command handling.
//!
//! Messages arrive on `<prefix>/command/<suffix>`. Recognized commands are forwarded to
//! the appliance and followed by a one-shot poll so the new state shows up right away.

use crate::appliance::{Appliance, ApplianceError, HotWaterSupply, UserMode};
use crate::mqtt::message_manager::InboundMessage;
use crate::poller::RefreshTrigger;
use crate::topics::{command_suffix, CMD_SET_HOT_WATER_SUPPLY, CMD_SET_MODE, CMD_SET_TEMPERATURE};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unsupported message on topic {topic}: {payload}")]
    Unsupported { topic: String, payload: String },

    #[error("failed to {command}: {source}")]
    Forward {
        command: Command,
        #[source]
        source: ApplianceError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Passed through untouched, the appliance validates the value
    SetTemperature(String),
    SetUserMode(UserMode),
    SetHotWaterSupply(HotWaterSupply),
}

impl Command {
    pub fn parse(topic: &str, payload: &str) -> Result<Self, CommandError> {
        let command = match command_suffix(topic) {
            CMD_SET_TEMPERATURE => Some(Command::SetTemperature(payload.to_string())),
            CMD_SET_MODE => payload.parse().ok().map(Command::SetUserMode),
            CMD_SET_HOT_WATER_SUPPLY => payload.parse().ok().map(Command::SetHotWaterSupply),
            _ => None,
        };
        command.ok_or_else(|| CommandError::Unsupported {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::SetTemperature(value) => write!(f, "set temperature to {}", value),
            Command::SetUserMode(mode) => write!(f, "set user mode to {}", mode),
            Command::SetHotWaterSupply(state) => write!(f, "set hot water supply {}", state),
        }
    }
}

pub struct CommandHandler {
    appliance: Arc<dyn Appliance>,
    refresh: RefreshTrigger,
}

impl CommandHandler {
    pub fn new(appliance: Arc<dyn Appliance>, refresh: RefreshTrigger) -> Self {
        Self { appliance, refresh }
    }

    /// Handles one message. A refresh is requested only when the appliance accepted it.
    pub async fn handle(&self, message: &InboundMessage) -> Result<Command, CommandError> {
        let payload = message.payload_str();
        let command = Command::parse(&message.topic, &payload)?;

        let forwarded = match &command {
            Command::SetTemperature(value) => self.appliance.set_temperature(value).await,
            Command::SetUserMode(mode) => self.appliance.set_user_mode(*mode).await,
            Command::SetHotWaterSupply(state) => {
                self.appliance.set_hot_water_supply(*state).await
            }
        };
        if let Err(source) = forwarded {
            return Err(CommandError::Forward { command, source });
        }

        info!("Appliance accepted command: {}", command);
        self.refresh.request();
        Ok(command)
    }

    /// Processes inbound messages one at a time until cancelled or the sender goes away.
    pub fn spawn(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Command worker started");
            let mut handled = 0usize;
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => message,
                        None => {
                            warn!("Inbound message channel closed");
                            break;
                        }
                    },
                };

                debug!("Handling {}", message);
                match self.handle(&message).await {
                    Ok(_) => handled += 1,
                    Err(e @ CommandError::Unsupported { .. }) => warn!("{}", e),
                    Err(e) => error!("{}", e),
                }
            }
            info!("Command worker stopped after {} commands", handled);
        })
    }
}
