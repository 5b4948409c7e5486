//! Telemetry injection over the backend's REST API.
//!
//! Bypasses the broker and posts generated readings straight to the
//! telemetry endpoint: either a backfill of history for a freshly registered
//! device, or a live stream of current readings until stopped.

use crate::config::InjectConfig;
use crate::sensor::{self, format_timestamp, serialize_number, SensorKind};
use chrono::{DateTime, Local, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Server returned error: {status} - {body}")]
    ServerError { status: u16, body: String },

    #[error("Max retries exceeded")]
    MaxRetriesExceeded,

    #[error("Backfill of {count} readings spaced {step:?} apart reaches past the supported date range")]
    ScheduleOutOfRange { count: usize, step: Duration },
}

/// Body of a telemetry post.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub device_id: String,
    pub metric: &'static str,
    #[serde(serialize_with = "serialize_number")]
    pub value: f64,
    pub unit: &'static str,
    pub timestamp: String,
}

impl TelemetryRecord {
    /// Generates a record for `kind` at `at`, sampling the profile in local
    /// time.
    pub fn generate<R: Rng + ?Sized>(
        device_id: &str,
        kind: SensorKind,
        at: DateTime<Utc>,
        rng: &mut R,
    ) -> Self {
        let reading = sensor::generate(kind, &at.with_timezone(&Local), rng);

        Self {
            device_id: device_id.to_string(),
            metric: kind.topic_suffix(),
            value: reading.value,
            unit: reading.unit,
            timestamp: format_timestamp(&at),
        }
    }
}

/// Statistics for injection runs.
#[derive(Debug, Default)]
pub struct InjectStats {
    pub records_posted: AtomicU64,
    pub errors: AtomicU64,
    pub retries: AtomicU64,
}

impl InjectStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.records_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Posts telemetry records to the backend.
#[derive(Clone)]
pub struct TelemetryInjector {
    client: reqwest::Client,
    config: InjectConfig,
    stats: Arc<InjectStats>,
}

impl TelemetryInjector {
    pub fn new(config: InjectConfig, stats: Arc<InjectStats>) -> Result<Self, InjectError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            config,
            stats,
        })
    }

    pub fn stats(&self) -> &InjectStats {
        &self.stats
    }

    /// Posts one record with retry logic.
    pub async fn post(&self, record: &TelemetryRecord) -> Result<(), InjectError> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.stats.record_retry();
                let delay = self.config.retry_delay() * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }

            match self
                .client
                .post(&self.config.telemetry_url)
                .json(record)
                .send()
                .await
            {
                Ok(response) => {
                    if response.status().is_success() {
                        self.stats.record_success();
                        return Ok(());
                    }
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    last_error = Some(InjectError::ServerError { status, body });
                }
                Err(e) => {
                    last_error = Some(InjectError::HttpError(e));
                }
            }
        }

        self.stats.record_error();
        Err(last_error.unwrap_or(InjectError::MaxRetriesExceeded))
    }

    /// Posts `count` readings spaced `step` apart, the last one at `end`.
    /// Failures are logged and counted; the run continues. Fails up front if
    /// the earliest reading would fall outside the representable date range.
    pub async fn backfill<R: Rng + Send>(
        &self,
        device_id: &str,
        kind: SensorKind,
        count: usize,
        step: Duration,
        end: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<u64, InjectError> {
        let times = backfill_schedule(count, step, end)?;
        info!(
            "Injecting {} {} readings for {} into {}",
            count, kind, device_id, self.config.telemetry_url
        );

        let mut posted = 0;
        for (i, at) in times.enumerate() {
            let record = TelemetryRecord::generate(device_id, kind, at, rng);

            match self.post(&record).await {
                Ok(()) => {
                    posted += 1;
                    debug!(
                        "{}/{}: {} {} at {}",
                        i + 1,
                        count,
                        record.value,
                        record.unit,
                        record.timestamp
                    );
                }
                Err(e) => warn!("Failed to inject {} reading for {}: {}", kind, device_id, e),
            }

            if i + 1 < count && !self.config.pacing().is_zero() {
                tokio::time::sleep(self.config.pacing()).await;
            }
        }

        info!("Injected {}/{} {} readings for {}", posted, count, kind, device_id);
        Ok(posted)
    }

    /// Posts one current reading every `every` until `cancel` fires.
    /// Returns the number of accepted posts.
    pub async fn follow<R: Rng + Send>(
        &self,
        device_id: &str,
        kind: SensorKind,
        every: Duration,
        rng: &mut R,
        cancel: CancellationToken,
    ) -> u64 {
        info!(
            "Streaming {} readings for {} into {} every {:?}",
            kind, device_id, self.config.telemetry_url, every
        );

        let mut posted = 0;
        while !cancel.is_cancelled() {
            let record = TelemetryRecord::generate(device_id, kind, Utc::now(), rng);
            match self.post(&record).await {
                Ok(()) => {
                    posted += 1;
                    info!(
                        "[{}] {} {} {} at {}",
                        posted, device_id, record.value, record.unit, record.timestamp
                    );
                }
                Err(e) => warn!("Failed to post {} reading for {}: {}", kind, device_id, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(every) => {}
            }
        }

        info!("Stopped streaming after {} readings for {}", posted, device_id);
        posted
    }
}

/// Timestamps of a backfill run, oldest first, the last one at `end`.
fn backfill_schedule(
    count: usize,
    step: Duration,
    end: DateTime<Utc>,
) -> Result<impl Iterator<Item = DateTime<Utc>>, InjectError> {
    let out_of_range = || InjectError::ScheduleOutOfRange { count, step };
    let step = chrono::Duration::from_std(step).map_err(|_| out_of_range())?;

    let at = move |back: usize| {
        i32::try_from(back)
            .ok()
            .and_then(|back| step.checked_mul(back))
            .and_then(|offset| end.checked_sub_signed(offset))
    };
    // The oldest reading bounds all the others.
    if count > 0 && at(count - 1).is_none() {
        return Err(out_of_range());
    }

    Ok((0..count).rev().filter_map(at))
}
