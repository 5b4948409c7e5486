//! Sensor kinds and their time-of-day telemetry profiles.
//!
//! Every kind owns a [`Profile`]: an ordered list of hour buckets covering the
//! whole day, each mapped to a value range. [`generate`] picks the bucket for
//! the current hour and samples it, producing the [`Reading`] that workers
//! publish.

use chrono::{DateTime, TimeZone, Timelike, Utc};
use rand::Rng;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Hours in a day; profiles must cover `0..HOURS_PER_DAY`.
pub const HOURS_PER_DAY: u32 = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("Unknown sensor kind: {0}")]
    UnknownKind(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Hour {hour} is not covered by any bucket")]
    Gap { hour: u32 },

    #[error("Hour {hour} is covered by more than one bucket")]
    Overlap { hour: u32 },

    #[error("Bucket {start}..{end} is empty")]
    EmptyBucket { start: u32, end: u32 },

    #[error("Bucket ends at hour {end}, past the end of the day")]
    OutOfRange { end: u32 },
}

/// Kinds of simulated sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorKind {
    Temperature,
    Occupancy,
    Light,
    Humidity,
    Energy,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Occupancy => "occupancy",
            SensorKind::Light => "light",
            SensorKind::Humidity => "humidity",
            SensorKind::Energy => "energy",
        }
    }

    /// Last topic segment this kind publishes under.
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Occupancy => "occupancy",
            SensorKind::Light => "illumination",
            SensorKind::Humidity => "humidity",
            SensorKind::Energy => "power",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "celsius",
            SensorKind::Occupancy => "persons",
            SensorKind::Light => "lux",
            SensorKind::Humidity => "%",
            SensorKind::Energy => "kW",
        }
    }

    /// Publish interval used when the configuration has no override.
    pub fn default_interval(&self) -> Duration {
        match self {
            SensorKind::Occupancy => Duration::from_secs(10),
            _ => Duration::from_secs(5),
        }
    }

    /// Returns all sensor kinds.
    pub fn all() -> &'static [SensorKind] {
        &[
            SensorKind::Temperature,
            SensorKind::Occupancy,
            SensorKind::Light,
            SensorKind::Humidity,
            SensorKind::Energy,
        ]
    }

    pub fn profile(&self) -> &'static Profile {
        match self {
            SensorKind::Temperature => &TEMPERATURE_PROFILE,
            SensorKind::Occupancy => &OCCUPANCY_PROFILE,
            SensorKind::Light => &LIGHT_PROFILE,
            SensorKind::Humidity => &HUMIDITY_PROFILE,
            SensorKind::Energy => &ENERGY_PROFILE,
        }
    }

    /// Auxiliary fields attached to every reading of this kind.
    pub fn metadata_fields(&self) -> &'static [MetadataField] {
        match self {
            SensorKind::Temperature => &[BATTERY, SIGNAL],
            SensorKind::Occupancy => &[],
            SensorKind::Light | SensorKind::Humidity => &[BATTERY],
            SensorKind::Energy => &[VOLTAGE, FREQUENCY],
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = SensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "temperature" => Ok(SensorKind::Temperature),
            "occupancy" => Ok(SensorKind::Occupancy),
            "light" | "illumination" => Ok(SensorKind::Light),
            "humidity" => Ok(SensorKind::Humidity),
            "energy" | "power" => Ok(SensorKind::Energy),
            _ => Err(SensorError::UnknownKind(s.to_string())),
        }
    }
}

/// How a bucket or metadata field produces its value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRange {
    /// Uniform float in `min..=max`, rounded to `decimals` places.
    Uniform { min: f64, max: f64, decimals: i32 },
    /// Uniform integer in `min..=max`.
    Integer { min: i64, max: i64 },
    Fixed(f64),
}

impl ValueRange {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            ValueRange::Uniform { min, max, decimals } => {
                round_to(rng.gen_range(min..=max), decimals)
            }
            ValueRange::Integer { min, max } => rng.gen_range(min..=max) as f64,
            ValueRange::Fixed(value) => value,
        }
    }

    /// Returns whether `value` could have been produced by this range.
    pub fn contains(&self, value: f64) -> bool {
        match *self {
            ValueRange::Uniform { min, max, .. } => value >= min && value <= max,
            ValueRange::Integer { min, max } => {
                value.fract() == 0.0 && value >= min as f64 && value <= max as f64
            }
            ValueRange::Fixed(fixed) => value == fixed,
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// A half-open hour range `[start, end)` mapped to a value range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    pub start: u32,
    pub end: u32,
    pub value: ValueRange,
}

impl Bucket {
    pub const fn new(start: u32, end: u32, value: ValueRange) -> Self {
        Self { start, end, value }
    }

    pub fn contains(&self, hour: u32) -> bool {
        self.start <= hour && hour < self.end
    }
}

/// Time-of-day profile for one sensor kind.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub buckets: &'static [Bucket],
}

impl Profile {
    /// Returns the bucket containing `hour`, if any.
    pub fn bucket_for(&self, hour: u32) -> Option<&Bucket> {
        self.buckets.iter().find(|b| b.contains(hour))
    }

    /// Checks that the buckets are ordered, non-overlapping, and cover every
    /// hour of the day.
    pub fn validate(&self) -> Result<(), ProfileError> {
        let mut next = 0;
        for bucket in self.buckets {
            if bucket.start >= bucket.end {
                return Err(ProfileError::EmptyBucket {
                    start: bucket.start,
                    end: bucket.end,
                });
            }
            if bucket.start > next {
                return Err(ProfileError::Gap { hour: next });
            }
            if bucket.start < next {
                return Err(ProfileError::Overlap { hour: bucket.start });
            }
            next = bucket.end;
        }

        if next < HOURS_PER_DAY {
            return Err(ProfileError::Gap { hour: next });
        }
        if next > HOURS_PER_DAY {
            return Err(ProfileError::OutOfRange { end: next });
        }
        Ok(())
    }
}

/// A named metadata value attached to readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetadataField {
    pub name: &'static str,
    pub value: ValueRange,
}

const BATTERY: MetadataField = MetadataField {
    name: "battery",
    value: ValueRange::Integer { min: 70, max: 100 },
};

const SIGNAL: MetadataField = MetadataField {
    name: "signal",
    value: ValueRange::Integer { min: -60, max: -30 },
};

const VOLTAGE: MetadataField = MetadataField {
    name: "voltage",
    value: ValueRange::Uniform { min: 220.0, max: 230.0, decimals: 1 },
};

const FREQUENCY: MetadataField = MetadataField {
    name: "frequency",
    value: ValueRange::Uniform { min: 59.8, max: 60.2, decimals: 1 },
};

const fn uniform(min: f64, max: f64, decimals: i32) -> ValueRange {
    ValueRange::Uniform { min, max, decimals }
}

const fn integer(min: i64, max: i64) -> ValueRange {
    ValueRange::Integer { min, max }
}

static TEMPERATURE_PROFILE: Profile = Profile {
    buckets: &[Bucket::new(0, 24, uniform(20.0, 35.0, 2))],
};

static OCCUPANCY_PROFILE: Profile = Profile {
    buckets: &[
        Bucket::new(0, 7, ValueRange::Fixed(0.0)),
        Bucket::new(7, 12, integer(20, 45)),
        Bucket::new(12, 14, integer(5, 15)),
        Bucket::new(14, 18, integer(25, 40)),
        Bucket::new(18, 22, integer(10, 25)),
        Bucket::new(22, 24, ValueRange::Fixed(0.0)),
    ],
};

static LIGHT_PROFILE: Profile = Profile {
    buckets: &[
        Bucket::new(0, 6, integer(0, 50)),
        Bucket::new(6, 8, integer(100, 300)),
        Bucket::new(8, 12, integer(400, 800)),
        Bucket::new(12, 14, integer(600, 1000)),
        Bucket::new(14, 18, integer(400, 700)),
        Bucket::new(18, 20, integer(200, 400)),
        Bucket::new(20, 22, integer(100, 300)),
        Bucket::new(22, 24, integer(0, 50)),
    ],
};

static HUMIDITY_PROFILE: Profile = Profile {
    buckets: &[
        Bucket::new(0, 6, uniform(55.0, 70.0, 1)),
        Bucket::new(6, 9, uniform(55.0, 65.0, 1)),
        Bucket::new(9, 12, uniform(45.0, 55.0, 1)),
        Bucket::new(12, 15, uniform(40.0, 50.0, 1)),
        Bucket::new(15, 18, uniform(45.0, 55.0, 1)),
        Bucket::new(18, 22, uniform(50.0, 60.0, 1)),
        Bucket::new(22, 24, uniform(55.0, 70.0, 1)),
    ],
};

static ENERGY_PROFILE: Profile = Profile {
    buckets: &[
        Bucket::new(0, 7, uniform(0.5, 1.5, 2)),
        Bucket::new(7, 9, uniform(2.5, 4.0, 2)),
        Bucket::new(9, 12, uniform(4.0, 6.5, 2)),
        Bucket::new(12, 14, uniform(3.0, 4.5, 2)),
        Bucket::new(14, 18, uniform(4.5, 7.0, 2)),
        Bucket::new(18, 22, uniform(2.0, 3.5, 2)),
        Bucket::new(22, 24, uniform(0.5, 1.5, 2)),
    ],
};

/// A single telemetry reading, serialized as the MQTT payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    #[serde(serialize_with = "serialize_number")]
    pub value: f64,
    pub unit: &'static str,
    /// RFC 3339 UTC timestamp with second precision
    pub timestamp: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_metadata"
    )]
    pub metadata: Option<BTreeMap<&'static str, f64>>,
}

impl Reading {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Generates a reading for `kind` at `now`.
///
/// The profile bucket is chosen from `now`'s hour in its own time zone; the
/// timestamp is always rendered in UTC.
pub fn generate<Tz, R>(kind: SensorKind, now: &DateTime<Tz>, rng: &mut R) -> Reading
where
    Tz: TimeZone,
    R: Rng + ?Sized,
{
    let value = kind
        .profile()
        .bucket_for(now.hour())
        .map_or(0.0, |bucket| bucket.value.sample(rng));

    let fields = kind.metadata_fields();
    let metadata = if fields.is_empty() {
        None
    } else {
        Some(
            fields
                .iter()
                .map(|field| (field.name, field.value.sample(rng)))
                .collect(),
        )
    };

    Reading {
        value,
        unit: kind.unit(),
        timestamp: format_timestamp(&now.with_timezone(&Utc)),
        metadata,
    }
}

pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Writes integral values as JSON integers, everything else as floats.
pub(crate) fn serialize_number<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

struct Number(f64);

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_number(&self.0, serializer)
    }
}

fn serialize_metadata<S: Serializer>(
    metadata: &Option<BTreeMap<&'static str, f64>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match metadata {
        Some(fields) => {
            let mut map = serializer.serialize_map(Some(fields.len()))?;
            for (name, value) in fields {
                map.serialize_entry(name, &Number(*value))?;
            }
            map.end()
        }
        None => serializer.serialize_none(),
    }
}
