//! In-memory collaborators for the test suites.

use crate::appliance::{
    Appliance, ApplianceError, ApplianceStatus, HotWaterSupply, PressureReading,
    SupplyTemperature, UserMode,
};
use crate::mqtt::message_manager::InboundMessage;
use crate::mqtt::{Broker, BrokerError};
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum ApplianceCall {
    Connect,
    End,
    Status,
    Pressure,
    SupplyTemperature,
    SetTemperature(String),
    SetUserMode(UserMode),
    SetHotWaterSupply(HotWaterSupply),
}

pub struct MockAppliance {
    status: Mutex<ApplianceStatus>,
    pressure: f64,
    supply_temperature: f64,
    status_delay: Duration,
    fail_connect: AtomicBool,
    fail_status: AtomicBool,
    fail_setters: AtomicBool,
    calls: Mutex<Vec<ApplianceCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockAppliance {
    pub fn new(status: serde_json::Value, pressure: f64, supply_temperature: f64) -> Self {
        Self {
            status: Mutex::new(serde_json::from_value(status).expect("status must be an object")),
            pressure,
            supply_temperature,
            status_delay: Duration::ZERO,
            fail_connect: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
            fail_setters: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn fail_setters(&self, fail: bool) {
        self.fail_setters.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ApplianceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &ApplianceCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn max_concurrent_status(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: ApplianceCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn setter_result(&self) -> Result<(), ApplianceError> {
        if self.fail_setters.load(Ordering::SeqCst) {
            Err(ApplianceError::Unavailable("setter failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Appliance for MockAppliance {
    async fn connect(&self) -> Result<(), ApplianceError> {
        self.record(ApplianceCall::Connect);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ApplianceError::Unavailable("connect failure".to_string()));
        }
        Ok(())
    }

    async fn end(&self) -> Result<(), ApplianceError> {
        self.record(ApplianceCall::End);
        Ok(())
    }

    async fn status(&self) -> Result<ApplianceStatus, ApplianceError> {
        self.record(ApplianceCall::Status);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_status.load(Ordering::SeqCst) {
            return Err(ApplianceError::Unavailable("status failure".to_string()));
        }
        Ok(self.status.lock().unwrap().clone())
    }

    async fn pressure(&self) -> Result<PressureReading, ApplianceError> {
        self.record(ApplianceCall::Pressure);
        Ok(PressureReading {
            pressure: self.pressure,
        })
    }

    async fn supply_temperature(&self) -> Result<SupplyTemperature, ApplianceError> {
        self.record(ApplianceCall::SupplyTemperature);
        Ok(SupplyTemperature {
            temperature: self.supply_temperature,
        })
    }

    async fn set_temperature(&self, value: &str) -> Result<(), ApplianceError> {
        self.record(ApplianceCall::SetTemperature(value.to_string()));
        self.setter_result()
    }

    async fn set_user_mode(&self, mode: UserMode) -> Result<(), ApplianceError> {
        self.record(ApplianceCall::SetUserMode(mode));
        self.setter_result()
    }

    async fn set_hot_water_supply(&self, state: HotWaterSupply) -> Result<(), ApplianceError> {
        self.record(ApplianceCall::SetHotWaterSupply(state));
        self.setter_result()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

pub struct RecordingBroker {
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
    failing_prefixes: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
    loopback: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    events_tx: mpsc::UnboundedSender<Published>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Published>>,
}

impl Default for RecordingBroker {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            failing_prefixes: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            loopback: Mutex::new(None),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }
}

impl RecordingBroker {
    /// Publishes to topics starting with `prefix` fail.
    pub fn fail_topics_starting_with(&self, prefix: &str) {
        self.failing_prefixes.lock().unwrap().push(prefix.to_string());
    }

    /// Delivers successful publishes to `inbound` when they match a subscription that
    /// exists at publish time, like a real broker would.
    pub fn deliver_to(&self, inbound: mpsc::Sender<InboundMessage>) {
        *self.loopback.lock().unwrap() = Some(inbound);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Waits for the next successful publish.
    pub async fn next_publish(&self, within: Duration) -> Option<Published> {
        let mut rx = self.events_rx.lock().await;
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    /// Waits until a successful publish matches `pred`, skipping others.
    pub async fn wait_for(
        &self,
        within: Duration,
        pred: impl Fn(&Published) -> bool,
    ) -> Option<Published> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let published = self.next_publish(left).await?;
            if pred(&published) {
                return Some(published);
            }
        }
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: String,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        let failing = self
            .failing_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|p| topic.starts_with(p.as_str()));
        if failing {
            return Err(BrokerError::Connect {
                address: "recording-broker".to_string(),
                reason: format!("publish to {} refused", topic),
            });
        }

        let published = Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        };
        let subscribed = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| topic_matches(pattern, topic));
        if subscribed {
            if let Some(inbound) = self.loopback.lock().unwrap().as_ref() {
                let _ = inbound.try_send(InboundMessage::from_topic(
                    topic,
                    published.payload.clone(),
                ));
            }
        }
        self.published.lock().unwrap().push(published.clone());
        let _ = self.events_tx.send(published);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        self.subscriptions.lock().unwrap().push(pattern.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// MQTT filter matching with `+` and `#` wildcards.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for filter in pattern.split('/') {
        match (filter, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (f, Some(level)) if f == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_match_like_a_broker() {
        assert!(topic_matches("/nefit/1/command/+", "/nefit/1/command/setmode"));
        assert!(!topic_matches("/nefit/1/command/+", "/nefit/1/command"));
        assert!(!topic_matches("/nefit/1/command/+", "/nefit/1/command/a/b"));
        assert!(topic_matches("/nefit/#", "/nefit/1/available"));
        assert!(!topic_matches("/nefit/1/command/+", "/nefit/1"));
    }
}
