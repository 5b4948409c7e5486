#![allow(dead_code)]

use async_trait::async_trait;
use campus_sensor_simulator::{
    BrokerConnector, BrokerError, BrokerSession, DeviceDescriptor, DeviceRegistry, RegistryError,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Parses a registry entry the way the HTTP client would.
pub fn device(entry: Value) -> DeviceDescriptor {
    DeviceDescriptor::from_json(&entry).unwrap()
}

/// In-memory registry whose snapshot tests can swap between cycles.
#[derive(Default)]
pub struct FakeRegistry {
    devices: Mutex<Vec<DeviceDescriptor>>,
    failing: AtomicBool,
    pub fetches: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            ..Default::default()
        })
    }

    pub fn set(&self, devices: Vec<DeviceDescriptor>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceRegistry for FakeRegistry {
    async fn fetch_devices(&self) -> Result<Vec<DeviceDescriptor>, RegistryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RegistryError::ServerError {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(self.devices.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone)]
pub struct Published {
    pub client_id: String,
    pub topic: String,
    pub payload: Value,
}

/// Broker stand-in that records traffic and can be told to fail.
#[derive(Default)]
pub struct FakeBroker {
    published: Mutex<Vec<Published>>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_publishes: AtomicUsize,
    crash_publishes: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` publishes panic, killing the calling task.
    pub fn crash_next_publishes(&self, n: usize) {
        self.crash_publishes.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Connector handing out sessions on a shared [`FakeBroker`].
#[derive(Clone)]
pub struct FakeConnector(pub Arc<FakeBroker>);

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn BrokerSession>, BrokerError> {
        if take_one(&self.0.fail_connects) {
            return Err(BrokerError::ConnectTimeout(Duration::from_millis(1)));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            client_id: client_id.to_string(),
            broker: Arc::clone(&self.0),
        }))
    }
}

struct FakeSession {
    client_id: String,
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if take_one(&self.broker.crash_publishes) {
            panic!("session for {} crashed", self.client_id);
        }
        if take_one(&self.broker.fail_publishes) {
            return Err(BrokerError::AckTimeout(Duration::from_millis(1)));
        }
        let payload = serde_json::from_slice(&payload).unwrap();
        self.broker.published.lock().unwrap().push(Published {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.broker.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
