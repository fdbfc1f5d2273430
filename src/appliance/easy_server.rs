//! HTTP client for an easy-server style appliance bridge.
//!
//! The bridge keeps the encrypted session with the appliance backend open and exposes
//! plain JSON endpoints. This client maps the [`Appliance`] operations onto them.

use super::{
    Appliance, ApplianceError, ApplianceStatus, HotWaterSupply, PressureReading,
    SupplyTemperature, UserMode,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

const STATUS_PATH: &str = "api/status";
const PRESSURE_PATH: &str = "api/pressure";
const SUPPLY_TEMPERATURE_PATH: &str = "api/supply-temperature";
const TEMPERATURE_PATH: &str = "api/temperature";
const USER_MODE_PATH: &str = "api/user-mode";
const HOT_WATER_SUPPLY_PATH: &str = "api/hot-water-supply";

const SERIAL_HEADER: &str = "X-Nefit-Serial";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the HTTP bridge
#[derive(Clone)]
pub struct EasyServerConfig {
    /// Base URL without trailing slash, e.g. `http://127.0.0.1:3000`
    pub base_url: String,
    pub serial_number: String,
    pub access_key: String,
    pub password: String,
    pub request_timeout: Duration,
}

// Credentials stay out of logs.
impl std::fmt::Debug for EasyServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EasyServerConfig")
            .field("base_url", &self.base_url)
            .field("serial_number", &self.serial_number)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

pub struct EasyServerClient {
    http: reqwest::Client,
    config: EasyServerConfig,
    open: AtomicBool,
}

impl EasyServerClient {
    pub fn new(config: EasyServerConfig) -> Result<Self, ApplianceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| ApplianceError::Transport {
                endpoint: config.base_url.clone(),
                source,
            })?;

        Ok(Self {
            http,
            config,
            open: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn ensure_open(&self) -> Result<(), ApplianceError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ApplianceError::Unavailable("session is not open".to_string()))
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .basic_auth(&self.config.access_key, Some(&self.config.password))
            .header(SERIAL_HEADER, &self.config.serial_number)
    }

    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ApplianceError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|source| ApplianceError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApplianceError::Rejected {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApplianceError> {
        let endpoint = self.endpoint(path);
        debug!("GET {}", endpoint);
        let response = self.send(&endpoint, self.http.get(&endpoint)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApplianceError::Protocol {
                endpoint,
                reason: e.to_string(),
            })
    }

    async fn put_value(&self, path: &str, value: &str) -> Result<(), ApplianceError> {
        self.ensure_open()?;
        let endpoint = self.endpoint(path);
        debug!("PUT {} value={}", endpoint, value);
        let request = self.http.put(&endpoint).json(&json!({ "value": value }));
        self.send(&endpoint, request).await?;
        Ok(())
    }
}

#[async_trait]
impl Appliance for EasyServerClient {
    async fn connect(&self) -> Result<(), ApplianceError> {
        info!(
            "Opening appliance session for {} via {}",
            self.config.serial_number, self.config.base_url
        );
        // The bridge has no explicit login; a status request proves reachability and credentials.
        let _: serde_json::Value = self.get_json(STATUS_PATH).await?;
        self.open.store(true, Ordering::Release);
        info!("Appliance session open");
        Ok(())
    }

    async fn end(&self) -> Result<(), ApplianceError> {
        if self.open.swap(false, Ordering::AcqRel) {
            info!("Appliance session closed");
        } else {
            debug!("Appliance session already closed");
        }
        Ok(())
    }

    async fn status(&self) -> Result<ApplianceStatus, ApplianceError> {
        self.ensure_open()?;
        self.get_json(STATUS_PATH).await
    }

    async fn pressure(&self) -> Result<PressureReading, ApplianceError> {
        self.ensure_open()?;
        self.get_json(PRESSURE_PATH).await
    }

    async fn supply_temperature(&self) -> Result<SupplyTemperature, ApplianceError> {
        self.ensure_open()?;
        self.get_json(SUPPLY_TEMPERATURE_PATH).await
    }

    async fn set_temperature(&self, value: &str) -> Result<(), ApplianceError> {
        self.put_value(TEMPERATURE_PATH, value).await
    }

    async fn set_user_mode(&self, mode: UserMode) -> Result<(), ApplianceError> {
        self.put_value(USER_MODE_PATH, mode.as_str()).await
    }

    async fn set_hot_water_supply(&self, state: HotWaterSupply) -> Result<(), ApplianceError> {
        self.put_value(HOT_WATER_SUPPLY_PATH, state.as_str()).await
    }
}
