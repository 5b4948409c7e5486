//! Registry-driven MQTT sensor simulator for campus IoT deployments.
//!
//! The simulator polls a device registry and keeps one publishing worker
//! running per active MQTT device and sensor kind. Workers publish synthetic
//! readings that follow a time-of-day profile to
//! `campus/{device_id}/{sensor}`.
//!
//! # Sensor kinds
//! - `temperature`: celsius, with battery and signal metadata
//! - `occupancy`: persons, zero outside class hours
//! - `light` / `illumination`: lux
//! - `humidity`: relative humidity in %
//! - `energy` / `power`: kW, with voltage and frequency metadata
//!
//! # Usage
//! ```bash
//! # Run the orchestrator against the local registry and broker
//! campus-sensor-simulator run
//!
//! # Check broker connectivity
//! campus-sensor-simulator probe --broker-host mqtt.local
//!
//! # Backfill a day of temperature history over HTTP
//! campus-sensor-simulator inject --device lab-01 --sensor temperature --count 288
//!
//! # Stream live readings over HTTP until Ctrl+C
//! campus-sensor-simulator inject --device lab-01 --sensor occupancy --follow --every 30
//! ```

pub mod broker;
pub mod config;
pub mod inject;
pub mod orchestrator;
pub mod registry;
pub mod sensor;
pub mod worker;

pub use broker::{BrokerConnector, BrokerError, BrokerSession, MqttConnector};
pub use config::{Config, ConfigError};
pub use orchestrator::{desired_keys, CycleReport, Orchestrator, OrchestratorSettings};
pub use registry::{DeviceDescriptor, DeviceRegistry, HttpRegistry, RegistryError};
pub use sensor::{generate, Reading, SensorKind};
pub use worker::{ConnectionStatus, PublishingWorker, WorkerHandle, WorkerKey};
