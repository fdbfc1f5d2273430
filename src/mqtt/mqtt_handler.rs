use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{MqttConfig, MqttTransport};
use super::message_manager::InboundMessage;
use super::{Broker, BrokerError};
use crate::topics::{PAYLOAD_OFFLINE, PAYLOAD_ONLINE};

const REQUEST_CAPACITY: usize = 100;
const INBOUND_CAPACITY: usize = 100;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub reconnects: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// Broker connection backed by a `rumqttc` client and its event loop task
///
/// The event loop task forwards inbound publishes to the receiver handed out by
/// [`MqttHandler::connect`]. After an automatic reconnect it restores the
/// subscriptions and, if the bridge had announced itself, the `online` flag.
pub struct MqttHandler {
    client: AsyncClient,
    config: MqttConfig,
    status: Arc<Mutex<MqttStatus>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    online_announced: Arc<AtomicBool>,
    shutdown: CancellationToken,
    event_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttHandler {
    /// Connects and waits for the broker's CONNACK.
    pub async fn connect(
        config: MqttConfig,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), BrokerError> {
        info!(
            "Connecting to MQTT broker {} as {}",
            config.address(),
            config.client_id
        );

        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options
            .set_keep_alive(config.keep_alive)
            .set_last_will(LastWill::new(
                &config.availability_topic,
                PAYLOAD_OFFLINE,
                QoS::AtLeastOnce,
                true,
            ));
        if let Some(user) = &config.username {
            mqtt_options.set_credentials(user, config.password.clone().unwrap_or_default());
        }
        if config.transport == MqttTransport::Tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let status = Arc::new(Mutex::new(MqttStatus {
            connection_state: ConnectionState::Connecting,
            ..MqttStatus::default()
        }));

        match tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BrokerError::Connect {
                    address: config.address(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(BrokerError::ConnectTimeout(config.address())),
        }
        update_status(&status, |s| s.connection_state = ConnectionState::Connected);
        info!("Connected to MQTT broker {}", config.address());

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let online_announced = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let context = EventLoopContext {
            client: client.clone(),
            inbound_tx,
            availability_topic: config.availability_topic.clone(),
            status: status.clone(),
            subscriptions: subscriptions.clone(),
            online_announced: online_announced.clone(),
            shutdown: shutdown.clone(),
        };
        let event_task = tokio::spawn(run_event_loop(eventloop, context));

        Ok((
            MqttHandler {
                client,
                config,
                status,
                subscriptions,
                online_announced,
                shutdown,
                event_task: tokio::sync::Mutex::new(Some(event_task)),
            },
            inbound_rx,
        ))
    }

    pub fn status(&self) -> MqttStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MqttHandler {
    async fn publish(
        &self,
        topic: &str,
        payload: String,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        if topic == self.config.availability_topic {
            self.online_announced
                .store(payload == PAYLOAD_ONLINE, Ordering::Release);
        }
        debug!("Publishing to {} ({} bytes)", topic, payload.len());
        self.client.publish(topic, qos, retain, payload).await?;
        update_status(&self.status, |s| {
            s.messages_sent += 1;
            s.last_activity = Some(chrono::Local::now());
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        info!("Subscribing to {}", pattern);
        self.client.subscribe(pattern, QoS::AtLeastOnce).await?;
        if let Ok(mut subs) = self.subscriptions.lock() {
            if !subs.iter().any(|s| s == pattern) {
                subs.push(pattern.to_string());
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        info!("Disconnecting from MQTT broker {}", self.config.address());
        let result = self.client.disconnect().await.map_err(BrokerError::from);

        // Let the event loop flush queued publishes and the DISCONNECT packet.
        if let Some(handle) = self.event_task.lock().await.take() {
            self.shutdown_after_grace(handle).await;
        }
        update_status(&self.status, |s| s.connection_state = ConnectionState::Disconnected);

        let stats = self.status();
        info!(
            "MQTT session closed: {} sent, {} received, {} reconnects",
            stats.messages_sent, stats.messages_received, stats.reconnects
        );
        result
    }
}

impl MqttHandler {
    async fn shutdown_after_grace(&self, mut handle: JoinHandle<()>) {
        if tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
            .await
            .is_err()
        {
            warn!("MQTT event loop did not stop within {:?}", DISCONNECT_GRACE);
            self.shutdown.cancel();
            let _ = handle.await;
        }
        self.shutdown.cancel();
    }
}

// Stops the event loop when the handle is dropped without `disconnect`.
impl Drop for MqttHandler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                debug!("CONNACK received: {:?}", ack.code);
                return Ok(());
            }
            other => debug!("Event before CONNACK: {:?}", other),
        }
    }
}

struct EventLoopContext {
    client: AsyncClient,
    inbound_tx: mpsc::Sender<InboundMessage>,
    availability_topic: String,
    status: Arc<Mutex<MqttStatus>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    online_announced: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

async fn run_event_loop(mut eventloop: EventLoop, ctx: EventLoopContext) {
    debug!("MQTT event loop started");
    loop {
        let event = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = InboundMessage::from_topic(publish.topic.clone(), publish.payload.to_vec());
                debug!("Received {}", msg);
                update_status(&ctx.status, |s| {
                    s.messages_received += 1;
                    s.last_activity = Some(msg.received_at);
                });
                match ctx.inbound_tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(msg)) => {
                        warn!("Inbound queue full, dropping message on {}", msg.topic)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Inbound receiver gone, ignoring message")
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Reconnected to MQTT broker");
                update_status(&ctx.status, |s| {
                    s.connection_state = ConnectionState::Connected;
                    s.reconnects += 1;
                });
                if !ack.session_present {
                    restore_session(&ctx);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                update_status(&ctx.status, |s| {
                    s.connection_state = ConnectionState::Reconnecting
                });
                error!("MQTT connection error: {}", e);
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
            }
        }
    }
    info!("MQTT event loop stopped");
}

// Runs inside the event loop task, so only non-blocking client calls are allowed here.
fn restore_session(ctx: &EventLoopContext) {
    let topics = ctx
        .subscriptions
        .lock()
        .map(|s| s.clone())
        .unwrap_or_default();
    for topic in topics {
        if let Err(e) = ctx.client.try_subscribe(&topic, QoS::AtLeastOnce) {
            warn!("Failed to restore subscription {}: {}", topic, e);
        }
    }

    if ctx.online_announced.load(Ordering::Acquire) {
        if let Err(e) = ctx.client.try_publish(
            &ctx.availability_topic,
            QoS::AtLeastOnce,
            true,
            PAYLOAD_ONLINE,
        ) {
            warn!("Failed to re-announce availability: {}", e);
        }
    }
}

fn update_status(status: &Mutex<MqttStatus>, f: impl FnOnce(&mut MqttStatus)) {
    match status.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(e) => warn!("MQTT status lock poisoned: {}", e),
    }
}
