//! MQTT broker sessions.
//!
//! Workers talk to the broker only through [`BrokerConnector`] and
//! [`BrokerSession`]. The production implementation drives a `rumqttc` event
//! loop inline: connecting polls until CONNACK, publishing polls until the
//! matching PUBACK. There is no background task per session, so a worker
//! that drops its session leaves nothing running.

use crate::config::BrokerConfig;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Capacity of the request channel between client handle and event loop.
const REQUEST_CAPACITY: usize = 10;

/// How long a clean disconnect may take before the session is just dropped.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("MQTT client error: {0}")]
    ClientError(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    ConnectionError(#[from] rumqttc::ConnectionError),

    #[error("Broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("Timed out after {0:?} waiting for CONNACK")]
    ConnectTimeout(Duration),

    #[error("Timed out after {0:?} waiting for PUBACK")]
    AckTimeout(Duration),
}

/// Opens broker sessions under a given client identity.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

/// An established broker connection.
#[async_trait]
pub trait BrokerSession: Send {
    /// Publishes at-least-once and waits for the broker's acknowledgment.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn disconnect(&mut self);
}

/// Connector backed by `rumqttc`.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: BrokerConfig,
}

impl MqttConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(true);
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        options
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(client_id), REQUEST_CAPACITY);
        let timeout = self.config.connect_timeout();

        let handshake = async {
            loop {
                if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok::<(), BrokerError>(()),
                        code => Err(BrokerError::Refused(code)),
                    };
                }
            }
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {
                debug!("{} connected to {}:{}", client_id, self.config.host, self.config.port);
                Ok(Box::new(MqttSession {
                    client,
                    eventloop,
                    ack_timeout: self.config.ack_timeout(),
                }))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BrokerError::ConnectTimeout(timeout)),
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    ack_timeout: Duration,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;

        let eventloop = &mut self.eventloop;
        let acked = async {
            loop {
                if let Event::Incoming(Packet::PubAck(_)) = eventloop.poll().await? {
                    return Ok::<(), BrokerError>(());
                }
            }
        };

        match tokio::time::timeout(self.ack_timeout, acked).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::AckTimeout(self.ack_timeout)),
        }
    }

    async fn disconnect(&mut self) {
        if self.client.disconnect().await.is_err() {
            return;
        }

        // The DISCONNECT packet is only written once the event loop sees it.
        let eventloop = &mut self.eventloop;
        let flushed = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = tokio::time::timeout(DISCONNECT_GRACE, flushed).await;
    }
}
