//! Startup and shutdown sequencing.
//!
//! Both connections come up together. Once they are up the bridge announces itself,
//! publishes discovery, subscribes to its command topics, asks for manual mode over its
//! own command topic and starts the two workers. The shutdown signal is watched from the
//! first connect attempt on.
//! Whatever ends the run (a signal or a worker dying) goes through the same teardown:
//! workers stop, `offline` is published, then both connections close.

use crate::appliance::{Appliance, ApplianceError};
use crate::commands::CommandHandler;
use crate::config::BridgeConfig;
use crate::discovery::{assert_manual_mode, publish_discovery};
use crate::mqtt::message_manager::InboundMessage;
use crate::mqtt::{Broker, BrokerError};
use crate::poller::{spawn_poll_loop, PollLoop, PollSettings};
use crate::topics::{PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use rumqttc::QoS;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to open appliance session: {0}")]
    ApplianceConnect(#[from] ApplianceError),

    #[error("failed to connect to MQTT broker: {0}")]
    BrokerConnect(#[from] BrokerError),

    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("{0} stopped unexpectedly")]
    WorkerStopped(&'static str),
}

pub struct LifecycleManager {
    config: Arc<BridgeConfig>,
    appliance: Arc<dyn Appliance>,
}

impl LifecycleManager {
    pub fn new(config: Arc<BridgeConfig>, appliance: Arc<dyn Appliance>) -> Self {
        Self { config, appliance }
    }

    /// Runs the bridge until `shutdown_signal` resolves or a worker stops.
    ///
    /// `connect_broker` is awaited alongside the appliance connect; the receiver it yields
    /// carries every message published on the bridge's subscriptions.
    pub async fn run<C, S>(self, connect_broker: C, shutdown_signal: S) -> Result<(), BridgeError>
    where
        C: Future<Output = Result<(Arc<dyn Broker>, mpsc::Receiver<InboundMessage>), BrokerError>>,
        S: Future<Output = ()>,
    {
        info!(
            "Starting bridge for appliance {} (broker {})",
            self.config.serial_number,
            self.config.mqtt.address()
        );

        // Polling the signal here installs its handlers before any connect attempt.
        tokio::pin!(shutdown_signal);
        let connected = tokio::select! {
            _ = &mut shutdown_signal => None,
            results = async { tokio::join!(self.appliance.connect(), connect_broker) } => {
                Some(results)
            }
        };
        let Some((appliance_result, broker_result)) = connected else {
            info!("Termination requested while connecting");
            self.teardown(None, true).await;
            return Ok(());
        };

        let (broker, inbound) = match (appliance_result, broker_result) {
            (Ok(()), Ok(connected)) => connected,
            (Err(appliance_error), Ok((broker, _inbound))) => {
                error!("Appliance connection failed: {}", appliance_error);
                self.teardown(Some(broker.as_ref()), false).await;
                return Err(appliance_error.into());
            }
            (Ok(()), Err(broker_error)) => {
                error!("Broker connection failed: {}", broker_error);
                self.teardown(None, true).await;
                return Err(broker_error.into());
            }
            (Err(appliance_error), Err(broker_error)) => {
                error!(
                    "Both connections failed: appliance: {}, broker: {}",
                    appliance_error, broker_error
                );
                return Err(appliance_error.into());
            }
        };
        info!("Appliance session and broker connection established");

        let outcome = self
            .serve(broker.clone(), inbound, shutdown_signal.as_mut())
            .await;
        if let Err(e) = &outcome {
            error!("Bridge stopping: {}", e);
        }
        self.teardown(Some(broker.as_ref()), true).await;
        outcome
    }

    async fn serve<S>(
        &self,
        broker: Arc<dyn Broker>,
        inbound: mpsc::Receiver<InboundMessage>,
        shutdown_signal: Pin<&mut S>,
    ) -> Result<(), BridgeError>
    where
        S: Future<Output = ()>,
    {
        let topics = &self.config.topics;

        if let Err(e) = broker
            .publish(
                &topics.available(),
                PAYLOAD_ONLINE.to_string(),
                QoS::AtLeastOnce,
                true,
            )
            .await
        {
            warn!("Failed to announce availability: {}", e);
        }

        publish_discovery(broker.as_ref(), &self.config).await;

        let command_topic = topics.command_wildcard();
        broker
            .subscribe(&command_topic)
            .await
            .map_err(|source| BridgeError::Subscribe {
                topic: command_topic.clone(),
                source,
            })?;
        // Only reaches the appliance once the subscription above is in place. The command
        // worker picks it up from the inbound queue when it starts.
        assert_manual_mode(broker.as_ref(), topics).await;

        let workers = CancellationToken::new();
        let poll_loop = PollLoop::create(
            self.appliance.clone(),
            broker.clone(),
            PollSettings::from_config(&self.config),
        );
        let (refresh, mut poll_task) = spawn_poll_loop(poll_loop, workers.child_token());
        let mut command_task = CommandHandler::new(self.appliance.clone(), refresh)
            .spawn(inbound, workers.child_token());
        info!("Bridge running, listening on {}", command_topic);

        let mut poll_done = false;
        let mut command_done = false;
        let outcome = tokio::select! {
            _ = shutdown_signal => {
                info!("Termination requested");
                Ok(())
            }
            result = &mut poll_task => {
                poll_done = true;
                log_join("poll loop", result);
                Err(BridgeError::WorkerStopped("poll loop"))
            }
            result = &mut command_task => {
                command_done = true;
                log_join("command worker", result);
                Err(BridgeError::WorkerStopped("command worker"))
            }
        };

        workers.cancel();
        if !poll_done {
            log_join("poll loop", poll_task.await);
        }
        if !command_done {
            log_join("command worker", command_task.await);
        }
        debug!("Workers stopped");

        outcome
    }

    /// Publishes `offline` when the broker is up, then closes whatever is open.
    async fn teardown(&self, broker: Option<&dyn Broker>, appliance_open: bool) {
        info!("Shutting down bridge");

        if let Some(broker) = broker {
            if let Err(e) = broker
                .publish(
                    &self.config.topics.available(),
                    PAYLOAD_OFFLINE.to_string(),
                    QoS::AtLeastOnce,
                    true,
                )
                .await
            {
                warn!("Failed to publish offline availability: {}", e);
            }
        }

        let close_appliance = async {
            if appliance_open {
                if let Err(e) = self.appliance.end().await {
                    warn!("Failed to close appliance session: {}", e);
                }
            }
        };
        let close_broker = async {
            if let Some(broker) = broker {
                if let Err(e) = broker.disconnect().await {
                    warn!("Failed to disconnect from broker: {}", e);
                }
            }
        };
        tokio::join!(close_appliance, close_broker);

        info!("Bridge stopped");
    }
}

fn log_join(name: &str, result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("{} task failed: {}", name, e);
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received"),
        Err(e) => {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
