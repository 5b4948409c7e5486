//! Registry-driven worker orchestration.
//!
//! Each cycle fetches the registry, derives the desired set of
//! [`WorkerKey`]s and converges the running set onto it: superfluous workers
//! are stopped and awaited first, then missing workers are started with a
//! small stagger between them. A failed fetch leaves the running set alone.
//!
//! The running map is owned by the orchestrator and only touched from
//! `&mut self`; workers are reached solely through their stop signal.

use crate::broker::BrokerConnector;
use crate::config::{Config, PublishConfig};
use crate::registry::{DeviceDescriptor, DeviceRegistry, RegistryError};
use crate::sensor::SensorKind;
use crate::worker::{ConnectionStatus, PublishingWorker, WorkerHandle, WorkerKey};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Registry type that groups several sensors on one device. Never a kind.
const MULTI_SENSOR_TYPE: &str = "multi-sensor";

/// Settings the orchestrator needs, extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub stagger: Duration,
    pub stop_timeout: Duration,
    pub topic_prefix: String,
    pub client_id_prefix: String,
    pub publish: PublishConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.orchestrator.poll_interval(),
            stagger: config.orchestrator.stagger(),
            stop_timeout: config.orchestrator.stop_timeout(),
            topic_prefix: config.orchestrator.topic_prefix.clone(),
            client_id_prefix: config.broker.client_id_prefix.clone(),
            publish: config.publish.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What one reconciliation cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub started: Vec<WorkerKey>,
    pub stopped: Vec<WorkerKey>,
    /// Workers running after the cycle
    pub running: usize,
}

impl CycleReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Derives the worker keys a registry snapshot asks for.
///
/// Only active MQTT devices qualify. Unknown sensor kinds are logged and
/// skipped.
pub fn desired_keys(devices: &[DeviceDescriptor]) -> BTreeSet<WorkerKey> {
    let mut keys = BTreeSet::new();

    for device in devices.iter().filter(|d| d.is_simulated()) {
        for raw_kind in &device.sensor_kinds {
            match raw_kind.parse::<SensorKind>() {
                Ok(kind) => {
                    keys.insert(WorkerKey::new(device.device_id.clone(), kind));
                }
                Err(_) if raw_kind == MULTI_SENSOR_TYPE => {}
                Err(e) => warn!("{} on device {}", e, device.device_id),
            }
        }
    }

    keys
}

pub struct Orchestrator {
    registry: Arc<dyn DeviceRegistry>,
    connector: Arc<dyn BrokerConnector>,
    settings: OrchestratorSettings,
    workers: HashMap<WorkerKey, WorkerHandle>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        connector: Arc<dyn BrokerConnector>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            connector,
            settings,
            workers: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`Orchestrator::run`] and every worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn running_keys(&self) -> BTreeSet<WorkerKey> {
        self.workers.keys().cloned().collect()
    }

    pub fn worker(&self, key: &WorkerKey) -> Option<&WorkerHandle> {
        self.workers.get(key)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn connected_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status() == ConnectionStatus::Connected)
            .count()
    }

    /// Runs one cycle against a fresh registry snapshot.
    ///
    /// A fetch error is returned without touching any worker.
    pub async fn reconcile(&mut self) -> Result<CycleReport, RegistryError> {
        let devices = self.registry.fetch_devices().await?;
        let desired = desired_keys(&devices);
        Ok(self.apply(&desired).await)
    }

    /// Converges the running set onto `desired`.
    pub async fn apply(&mut self, desired: &BTreeSet<WorkerKey>) -> CycleReport {
        self.reap_finished();

        let mut stale: Vec<WorkerKey> = self
            .workers
            .keys()
            .filter(|key| !desired.contains(*key))
            .cloned()
            .collect();
        stale.sort();
        self.stop_workers(&stale).await;

        let mut started = Vec::new();
        for key in desired {
            if self.workers.contains_key(key) {
                continue;
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            if !started.is_empty() && !self.settings.stagger.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.stagger) => {}
                }
            }

            self.start_worker(key.clone());
            started.push(key.clone());
        }

        CycleReport {
            started,
            stopped: stale,
            running: self.workers.len(),
        }
    }

    fn start_worker(&mut self, key: WorkerKey) {
        let topic = key.topic(&self.settings.topic_prefix);
        let client_id = key.client_id(&self.settings.client_id_prefix);
        let interval = self.settings.publish.interval_for(key.kind);
        info!("Starting {} simulator for {} on {}", key.kind, key.device_id, topic);

        let worker = PublishingWorker::new(
            key.clone(),
            topic,
            client_id,
            interval,
            Arc::clone(&self.connector),
        );
        let handle = worker.spawn(self.shutdown.child_token());
        self.workers.insert(key, handle);
    }

    /// Signals every listed worker, then waits for each to finish.
    async fn stop_workers(&mut self, keys: &[WorkerKey]) {
        let handles: Vec<WorkerHandle> = keys
            .iter()
            .filter_map(|key| self.workers.remove(key))
            .collect();

        for handle in &handles {
            info!("Stopping simulator {}", handle.key());
            handle.stop();
        }

        for handle in handles {
            let key = handle.key().clone();
            match handle.join(self.settings.stop_timeout).await {
                Ok(summary) => debug!(
                    "Simulator {} finished after {} publishes",
                    key, summary.published
                ),
                Err(e) => warn!("Simulator {}: {}", key, e),
            }
        }
    }

    /// Drops handles of workers whose task ended on its own, so the next
    /// apply restarts them.
    fn reap_finished(&mut self) {
        let finished: Vec<WorkerKey> = self
            .workers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();

        for key in finished {
            error!("Simulator {} exited unexpectedly, will restart", key);
            self.workers.remove(&key);
        }
    }

    /// Stops every worker and waits for them.
    pub async fn shutdown(&mut self) {
        let mut keys: Vec<WorkerKey> = self.workers.keys().cloned().collect();
        keys.sort();
        self.stop_workers(&keys).await;
    }

    /// Polls the registry until the shutdown token fires, then stops all
    /// workers.
    pub async fn run(mut self) {
        info!(
            "Orchestrator started, polling every {:?}",
            self.settings.poll_interval
        );

        while !self.shutdown.is_cancelled() {
            match self.reconcile().await {
                Ok(report) if report.is_noop() => debug!(
                    "No registry changes, {} simulators running ({} connected)",
                    report.running,
                    self.connected_count()
                ),
                Ok(report) => info!(
                    "Cycle complete: {} started, {} stopped, {} running ({} connected)",
                    report.started.len(),
                    report.stopped.len(),
                    report.running,
                    self.connected_count()
                ),
                Err(e) => warn!(
                    "Registry fetch failed, keeping {} simulators: {}",
                    self.workers.len(),
                    e
                ),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("Orchestrator stopping {} simulators", self.workers.len());
        self.shutdown().await;
        info!("All simulators stopped");
    }
}
