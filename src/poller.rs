//! Periodic status polling.
//!
//! A [`PollLoop`] is either `Idle` or `Polling`; one task owns it and moves it between
//! the two, so cycles can never overlap. The task wakes on the poll deadline, on a
//! one-shot [`RefreshTrigger`] request, or on cancellation.

use crate::appliance::{Appliance, ApplianceError};
use crate::config::{BridgeConfig, PublishMode};
use crate::mqtt::{Broker, BrokerError};
use crate::normalizer::{format_number, normalize_status, NormalizedStatus};
use crate::topics::{
    is_reserved_field, Topics, SUFFIX_PRESSURE, SUFFIX_SERIAL, SUFFIX_SUPPLY_TEMPERATURE,
};
use chrono::Local;
use rumqttc::QoS;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to fetch appliance state: {0}")]
    Fetch(#[from] ApplianceError),

    #[error("failed to encode status payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{failed} of {total} status publishes failed, first on {topic}: {source}")]
    Publish {
        topic: String,
        failed: usize,
        total: usize,
        #[source]
        source: BrokerError,
    },
}

/// Why a cycle started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTrigger {
    Scheduled,
    OneShot,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub serial_number: String,
    pub topics: Topics,
    pub mode: PublishMode,
    pub delay: Duration,
}

impl PollSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            serial_number: config.serial_number.clone(),
            topics: config.topics.clone(),
            mode: config.publish_mode,
            delay: config.poll_delay,
        }
    }
}

/// Outcome of one successful cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub trigger: PollTrigger,
    pub fields: usize,
    pub published: usize,
    pub elapsed: chrono::Duration,
}

/// What one cycle puts on the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishEnvelope {
    /// One JSON object on the prefix topic
    Aggregate {
        topic: String,
        payload: serde_json::Value,
    },
    /// `(topic, payload)` per field. Fields named like the availability or command
    /// topics are left out.
    PerField(Vec<(String, String)>),
}

impl PublishEnvelope {
    pub fn build(
        settings: &PollSettings,
        status: NormalizedStatus,
        pressure: f64,
        supply_temperature: f64,
    ) -> Self {
        match settings.mode {
            PublishMode::Aggregate => {
                let mut object: serde_json::Map<String, serde_json::Value> = status
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                object.insert(
                    SUFFIX_SERIAL.to_string(),
                    settings.serial_number.clone().into(),
                );
                object.insert(SUFFIX_PRESSURE.to_string(), pressure.into());
                object.insert(
                    SUFFIX_SUPPLY_TEMPERATURE.to_string(),
                    supply_temperature.into(),
                );
                PublishEnvelope::Aggregate {
                    topic: settings.topics.status().to_string(),
                    payload: serde_json::Value::Object(object),
                }
            }
            PublishMode::PerField => {
                let topics = &settings.topics;
                let mut messages: Vec<(String, String)> = status
                    .into_iter()
                    .filter(|(k, _)| {
                        let reserved = is_reserved_field(k);
                        if reserved {
                            warn!("Status field '{}' collides with a bridge topic, skipping", k);
                        }
                        !reserved
                    })
                    .map(|(k, v)| (topics.field(&k), v))
                    .collect();
                messages.push((topics.field(SUFFIX_SERIAL), settings.serial_number.clone()));
                messages.push((topics.field(SUFFIX_PRESSURE), format_number(pressure)));
                messages.push((
                    topics.field(SUFFIX_SUPPLY_TEMPERATURE),
                    format_number(supply_temperature),
                ));
                PublishEnvelope::PerField(messages)
            }
        }
    }

    pub fn into_messages(self) -> Result<Vec<(String, String)>, PollError> {
        match self {
            PublishEnvelope::Aggregate { topic, payload } => {
                Ok(vec![(topic, serde_json::to_string(&payload)?)])
            }
            PublishEnvelope::PerField(messages) => Ok(messages),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum PollState {
    Idle,
    Polling(PollTrigger),
}

#[machine]
pub struct PollLoop<S: PollState> {
    appliance: Arc<dyn Appliance>,
    broker: Arc<dyn Broker>,
    settings: PollSettings,
    cycles: u64,
}

impl<S: PollState> PollLoop<S> {
    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl PollLoop<Idle> {
    pub fn create(
        appliance: Arc<dyn Appliance>,
        broker: Arc<dyn Broker>,
        settings: PollSettings,
    ) -> Self {
        info!(
            "Creating poll loop: every {} ms, {:?} publishing under {}",
            settings.delay.as_millis(),
            settings.mode,
            settings.topics.status()
        );
        Self::new(appliance, broker, settings, 0)
    }

    pub fn begin(self, trigger: PollTrigger) -> PollLoop<Polling> {
        debug!("Starting {:?} poll cycle", trigger);
        self.transition_with(trigger)
    }
}

impl PollLoop<Polling> {
    /// Runs one fetch and publish pass and returns to `Idle` whatever the outcome.
    pub async fn run_cycle(mut self) -> (PollLoop<Idle>, Result<CycleReport, PollError>) {
        let trigger = self
            .get_state_data()
            .copied()
            .unwrap_or(PollTrigger::Scheduled);
        let started = Local::now();

        let result = self.fetch_and_publish().await.map(|(fields, published)| CycleReport {
            trigger,
            fields,
            published,
            elapsed: Local::now() - started,
        });

        self.cycles += 1;
        (self.transition(), result)
    }

    async fn fetch_and_publish(&self) -> Result<(usize, usize), PollError> {
        let (status, pressure, supply) = tokio::try_join!(
            self.appliance.status(),
            self.appliance.pressure(),
            self.appliance.supply_temperature(),
        )?;

        if status.is_empty() {
            warn!("Appliance reported an empty status record");
        }
        let normalized = normalize_status(&status);
        let fields = normalized.len();
        debug!(
            "Normalized {} of {} status fields, pressure {} supply {}",
            fields,
            status.len(),
            pressure.pressure,
            supply.temperature
        );

        let messages = PublishEnvelope::build(
            &self.settings,
            normalized,
            pressure.pressure,
            supply.temperature,
        )
        .into_messages()?;

        let total = messages.len();
        let mut first_failure = None;
        let mut failed = 0;
        for (topic, payload) in messages {
            if let Err(e) = self
                .broker
                .publish(&topic, payload, QoS::AtMostOnce, false)
                .await
            {
                failed += 1;
                if first_failure.is_none() {
                    first_failure = Some((topic, e));
                }
            }
        }

        match first_failure {
            None => Ok((fields, total)),
            Some((topic, source)) => Err(PollError::Publish {
                topic,
                failed,
                total,
                source,
            }),
        }
    }
}

/// Requests an immediate cycle from the running poll task.
///
/// Requests made while one is already queued collapse into it.
#[derive(Debug, Clone)]
pub struct RefreshTrigger {
    tx: mpsc::Sender<()>,
}

impl RefreshTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn request(&self) {
        match self.tx.try_send(()) {
            Ok(()) => debug!("One-shot refresh requested"),
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("Refresh already pending, coalescing")
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("Poll loop is not running, refresh request dropped")
            }
        }
    }
}

/// Spawns the poll task. The first cycle runs immediately.
pub fn spawn_poll_loop(
    poll_loop: PollLoop<Idle>,
    shutdown: CancellationToken,
) -> (RefreshTrigger, JoinHandle<()>) {
    let (trigger, refresh_rx) = RefreshTrigger::channel();
    let handle = tokio::spawn(async move {
        info!("Poll task started");
        run_poll_loop(poll_loop, refresh_rx, shutdown).await;
        info!("Poll task finished");
    });
    (trigger, handle)
}

async fn run_poll_loop(
    mut poll_loop: PollLoop<Idle>,
    mut refresh_rx: mpsc::Receiver<()>,
    shutdown: CancellationToken,
) {
    let delay = poll_loop.settings().delay;
    let mut next_scheduled = Instant::now();
    let mut refresh_open = true;

    loop {
        let trigger = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(next_scheduled) => PollTrigger::Scheduled,
            request = refresh_rx.recv(), if refresh_open => match request {
                Some(()) => PollTrigger::OneShot,
                None => {
                    debug!("Refresh channel closed, continuing on schedule only");
                    refresh_open = false;
                    continue;
                }
            },
        };

        let polling = poll_loop.begin(trigger);
        let (idle, result) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown during {:?} poll cycle, abandoning it", trigger);
                break;
            }
            outcome = polling.run_cycle() => outcome,
        };
        poll_loop = idle;

        match result {
            Ok(report) => info!(
                "{:?} poll cycle {}: {} fields, {} messages in {} ms",
                report.trigger,
                poll_loop.cycles(),
                report.fields,
                report.published,
                report.elapsed.num_milliseconds()
            ),
            Err(e) => error!("Poll cycle {} failed: {}", poll_loop.cycles(), e),
        }

        if trigger == PollTrigger::Scheduled {
            next_scheduled = Instant::now() + delay;
            debug!("Next scheduled poll in {} ms", delay.as_millis());
        }
    }

    info!("Poll loop stopped");
}
