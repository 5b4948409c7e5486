//! Device registry client.
//!
//! The registry answers `GET {url}` with either a bare JSON array of devices
//! or an object carrying a `devices` array. Entries without a device id are
//! skipped; everything else is normalized into [`DeviceDescriptor`]s.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Registry returned error: {status} - {body}")]
    ServerError { status: u16, body: String },

    #[error("Malformed registry response: {0}")]
    Malformed(String),
}

/// Transport a device declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Mqtt,
    Other(String),
}

impl Protocol {
    fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("mqtt") {
            Protocol::Mqtt
        } else {
            Protocol::Other(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Active,
    Inactive,
    Other(String),
}

impl DeviceStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "active" => DeviceStatus::Active,
            "inactive" => DeviceStatus::Inactive,
            other => DeviceStatus::Other(other.to_string()),
        }
    }
}

/// A device as listed by the registry for one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub protocol: Protocol,
    pub status: DeviceStatus,
    /// Lower-cased sensor kinds: `metadata.sensors` when present, otherwise
    /// the device's own `type`.
    pub sensor_kinds: Vec<String>,
}

impl DeviceDescriptor {
    /// Whether this device should be simulated at all.
    pub fn is_simulated(&self) -> bool {
        self.protocol == Protocol::Mqtt && self.status == DeviceStatus::Active
    }

    /// Parses one registry entry. Returns `None` when the entry has no
    /// usable device id.
    pub fn from_json(entry: &Value) -> Option<Self> {
        let device_id = ["device_id", "deviceId"]
            .iter()
            .filter_map(|field| entry.get(*field).and_then(Value::as_str))
            .find(|id| !id.is_empty())?
            .to_string();

        let protocol = Protocol::parse(entry.get("protocol").and_then(Value::as_str).unwrap_or(""));
        let status = DeviceStatus::parse(
            entry
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("active"),
        );

        let declared_sensors = entry
            .get("metadata")
            .and_then(|metadata| metadata.get("sensors"))
            .and_then(Value::as_array);

        let sensor_kinds = match declared_sensors {
            Some(sensors) => sensors
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_lowercase)
                .collect(),
            None => entry
                .get("type")
                .and_then(Value::as_str)
                .map(|kind| vec![kind.to_lowercase()])
                .unwrap_or_default(),
        };

        Some(Self {
            device_id,
            protocol,
            status,
            sensor_kinds,
        })
    }
}

/// Normalizes a registry response body into device descriptors.
pub fn parse_devices(body: &Value) -> Result<Vec<DeviceDescriptor>, RegistryError> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(object) => match object.get("devices") {
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(RegistryError::Malformed(
                    "`devices` is not an array".to_string(),
                ))
            }
            None => return Ok(Vec::new()),
        },
        _ => {
            return Err(RegistryError::Malformed(
                "expected an array or an object with `devices`".to_string(),
            ))
        }
    };

    let mut devices = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match DeviceDescriptor::from_json(entry) {
            Some(device) => devices.push(device),
            None => warn!("Skipping registry entry {} without a device id", index),
        }
    }
    Ok(devices)
}

/// Source of device snapshots for the orchestrator.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn fetch_devices(&self) -> Result<Vec<DeviceDescriptor>, RegistryError>;
}

/// Registry reached over HTTP.
#[derive(Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistry {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DeviceRegistry for HttpRegistry {
    async fn fetch_devices(&self) -> Result<Vec<DeviceDescriptor>, RegistryError> {
        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::ServerError { status, body });
        }

        let body: Value = response.json().await?;
        let devices = parse_devices(&body)?;
        debug!("Registry listed {} devices", devices.len());
        Ok(devices)
    }
}
