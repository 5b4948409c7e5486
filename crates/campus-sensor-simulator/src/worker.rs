//! Publishing workers.
//!
//! A worker owns one simulated (device, sensor) pair and its broker session.
//! Each iteration reconnects if needed, generates a reading, publishes it at
//! QoS 1 and sleeps for the sensor's interval. Errors never leave the worker:
//! a failed connect or publish drops the session and the next iteration
//! tries again.

use crate::broker::{BrokerConnector, BrokerSession};
use crate::sensor::{self, SensorKind};
use chrono::Local;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum WorkerJoinError {
    #[error("Worker did not stop within {0:?}")]
    TimedOut(Duration),

    #[error("Worker task failed: {0}")]
    Task(#[from] JoinError),
}

/// Identity of a worker: one per device and sensor kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub device_id: String,
    pub kind: SensorKind,
}

impl WorkerKey {
    pub fn new(device_id: impl Into<String>, kind: SensorKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }

    /// Topic this worker publishes to, e.g. `campus/lab-01/temperature`.
    pub fn topic(&self, prefix: &str) -> String {
        format!("{}/{}/{}", prefix, self.device_id, self.kind.topic_suffix())
    }

    /// Broker client id. Distinct from the device id so a real device with
    /// the same id is never kicked off the broker, and distinct per sensor so
    /// sibling workers don't evict each other.
    pub fn client_id(&self, prefix: &str) -> String {
        format!("{}{}_{}", prefix, self.device_id, self.kind.topic_suffix())
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.device_id, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Counters returned when a worker stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub published: u64,
    pub failed: u64,
    pub connects: u64,
}

pub struct PublishingWorker {
    key: WorkerKey,
    topic: String,
    client_id: String,
    interval: Duration,
    connector: Arc<dyn BrokerConnector>,
    session: Option<Box<dyn BrokerSession>>,
    status: watch::Sender<ConnectionStatus>,
    rng: StdRng,
    summary: WorkerSummary,
}

impl PublishingWorker {
    pub fn new(
        key: WorkerKey,
        topic: String,
        client_id: String,
        interval: Duration,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        Self {
            key,
            topic,
            client_id,
            interval,
            connector,
            session: None,
            status,
            rng: StdRng::from_entropy(),
            summary: WorkerSummary::default(),
        }
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn summary(&self) -> &WorkerSummary {
        &self.summary
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    async fn connect(&mut self) {
        self.set_status(ConnectionStatus::Connecting);

        match self.connector.connect(&self.client_id).await {
            Ok(session) => {
                self.session = Some(session);
                self.summary.connects += 1;
                self.set_status(ConnectionStatus::Connected);
                info!("[{}] Connected as {}", self.key, self.client_id);
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Disconnected);
                warn!("[{}] Connection failed: {}", self.key, e);
            }
        }
    }

    /// Runs one loop iteration: reconnect if needed, then publish one reading.
    pub async fn tick(&mut self) {
        if self.session.is_none() {
            self.connect().await;
        }
        if self.session.is_none() {
            return;
        }

        let reading = sensor::generate(self.key.kind, &Local::now(), &mut self.rng);
        let payload = match reading.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("[{}] Failed to serialize reading: {}", self.key, e);
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let result = session.publish(&self.topic, payload).await;
        match result {
            Ok(()) => {
                self.summary.published += 1;
                debug!(
                    "[{}] Published {} {} to {}",
                    self.key, reading.value, reading.unit, self.topic
                );
            }
            Err(e) => {
                self.summary.failed += 1;
                self.session = None;
                self.set_status(ConnectionStatus::Disconnected);
                warn!("[{}] Publish to {} failed: {}", self.key, self.topic, e);
            }
        }
    }

    /// Runs until `cancel` fires, then disconnects and returns the counters.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerSummary {
        info!(
            "[{}] Worker started, publishing to {} every {:?}",
            self.key, self.topic, self.interval
        );

        while !cancel.is_cancelled() {
            self.tick().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
        }
        self.set_status(ConnectionStatus::Disconnected);
        info!(
            "[{}] Worker stopped ({} published, {} failed)",
            self.key, self.summary.published, self.summary.failed
        );

        self.summary
    }

    /// Spawns the worker onto the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> WorkerHandle {
        let key = self.key.clone();
        let status = self.status.subscribe();
        let join = tokio::spawn(self.run(cancel.clone()));

        WorkerHandle {
            key,
            cancel,
            status,
            join,
        }
    }
}

/// The orchestrator's view of a running worker.
pub struct WorkerHandle {
    key: WorkerKey,
    cancel: CancellationToken,
    status: watch::Receiver<ConnectionStatus>,
    join: JoinHandle<WorkerSummary>,
}

impl WorkerHandle {
    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Signals the worker to stop. Observed at the next loop boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits up to `timeout` for the worker to finish. On timeout the task is
    /// left to finish in the background.
    pub async fn join(self, timeout: Duration) -> Result<WorkerSummary, WorkerJoinError> {
        match tokio::time::timeout(timeout, self.join).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WorkerJoinError::TimedOut(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_and_client_id() {
        let key = WorkerKey::new("lab-01", SensorKind::Light);

        assert_eq!(key.topic("campus"), "campus/lab-01/illumination");
        assert_eq!(key.client_id("sim_"), "sim_lab-01_illumination");
        assert_eq!(key.to_string(), "lab-01::light");
    }

    #[test]
    fn test_keys_order_by_device_then_kind() {
        let mut keys = vec![
            WorkerKey::new("b", SensorKind::Temperature),
            WorkerKey::new("a", SensorKind::Humidity),
            WorkerKey::new("a", SensorKind::Temperature),
        ];
        keys.sort();

        assert_eq!(keys[0], WorkerKey::new("a", SensorKind::Temperature));
        assert_eq!(keys[1], WorkerKey::new("a", SensorKind::Humidity));
        assert_eq!(keys[2], WorkerKey::new("b", SensorKind::Temperature));
    }
}
