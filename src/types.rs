// src/types.rs
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Instant;

static CLOCK_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since the first call in this process.
///
/// Both in-crate sources stamp with this clock, which is what lets two
/// streams share one time base without drift correction.
pub fn local_clock() -> f64 {
    CLOCK_ORIGIN.elapsed().as_secs_f64()
}

/// Anything a stream buffer can hold.
pub trait Timestamped: Clone + Send + Sync + 'static {
    fn timestamp(&self) -> f64;
    /// Number of values carried; must match the owning buffer's channel count.
    fn width(&self) -> usize;
}

/// One time-stamped vector of channel readings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub values: Vec<f64>,
}

impl Sample {
    pub fn new(timestamp: f64, values: Vec<f64>) -> Self {
        Self { timestamp, values }
    }
}

impl Timestamped for Sample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
    fn width(&self) -> usize {
        self.values.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MarkerLabel {
    Code(i32),
    Text(String),
}

impl MarkerLabel {
    pub fn code(&self) -> Option<i32> {
        match self {
            MarkerLabel::Code(c) => Some(*c),
            MarkerLabel::Text(t) => t.trim().parse().ok(),
        }
    }
}

/// A time-stamped discrete label from the marker stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerEvent {
    pub timestamp: f64,
    pub label: MarkerLabel,
}

impl MarkerEvent {
    pub fn code(timestamp: f64, code: i32) -> Self {
        Self {
            timestamp,
            label: MarkerLabel::Code(code),
        }
    }

    pub fn text(timestamp: f64, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            label: MarkerLabel::Text(text.into()),
        }
    }
}

impl Timestamped for MarkerEvent {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
    fn width(&self) -> usize {
        1
    }
}

/// Half-open interval `[start, end)` in the shared time base.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t < self.end
    }
}

/// Measurement unit reported by the channel stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Volts,
    Millivolts,
    Microvolts,
    Nanovolts,
    #[default]
    Unknown,
}

impl Unit {
    /// Factor that converts a value in this unit to volts.
    pub fn volts_scale(self) -> f64 {
        match self {
            Unit::Volts | Unit::Unknown => 1.0,
            Unit::Millivolts => 1e-3,
            Unit::Microvolts => 1e-6,
            Unit::Nanovolts => 1e-9,
        }
    }
}

/// Metadata of the channel stream a session is bound to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub channel_labels: Vec<String>,
    pub nominal_rate_hz: f64,
    #[serde(default)]
    pub unit: Unit,
}

impl StreamInfo {
    pub fn new(name: impl Into<String>, channel_labels: Vec<String>, nominal_rate_hz: f64) -> Self {
        Self {
            name: name.into(),
            channel_labels,
            nominal_rate_hz,
            unit: Unit::Unknown,
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channel_labels.len()
    }

    /// `ch1..chN` labels for sources that do not describe their channels.
    pub fn default_labels(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("ch{i}")).collect()
    }
}
