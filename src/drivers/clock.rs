use serde::Serialize;

use crate::drivers::buffer::{MarkerBuffer, SignalBuffer};
use crate::drivers::window::Window;
use crate::drivers::StreamResult;
use crate::types::{Sample, TimeRange};

/// Ranges to slice from each buffer for one paired read.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlignedRanges {
    pub primary: TimeRange,
    pub secondary: Option<TimeRange>,
}

/// A marker-aligned range plus the primary sample closest to the marker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochRange {
    pub range: TimeRange,
    pub event_time: f64,
    pub anchor_index: Option<usize>,
}

/// One row of an event table: `(sample index, duration, code)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub sample_index: usize,
    pub duration: u32,
    pub code: i32,
}

/// Maps reads expressed on the primary stream's timeline onto both buffers.
///
/// No drift correction: both streams must already be stamped in a common
/// monotonic time base (see [`crate::types::local_clock`]). Upstream
/// transports are responsible for that before data reaches a buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClockAligner;

impl ClockAligner {
    /// The last `duration` seconds of the primary stream, ending at its newest
    /// timestamp, applied to both buffers.
    pub fn resolve_window(
        &self,
        primary: &SignalBuffer,
        secondary: Option<&MarkerBuffer>,
        duration: f64,
    ) -> StreamResult<AlignedRanges> {
        let end = primary.latest_timestamp()?;
        let range = TimeRange::new(end - duration, end);
        Ok(AlignedRanges {
            primary: range,
            secondary: secondary.map(|_| range),
        })
    }

    /// `[event_time - pre, event_time + post)`, anchored to the nearest
    /// retained primary sample.
    pub fn resolve_epoch(
        &self,
        primary: &SignalBuffer,
        event_time: f64,
        pre: f64,
        post: f64,
    ) -> EpochRange {
        let range = TimeRange::new(event_time - pre, event_time + post);
        let anchor_index = Self::nearest_index(&primary.slice_range(range), event_time);
        EpochRange {
            range,
            event_time,
            anchor_index,
        }
    }

    /// Index of the sample whose timestamp is closest to `t`; ties go to the
    /// earlier sample.
    pub fn nearest_index(samples: &[Sample], t: f64) -> Option<usize> {
        if samples.is_empty() {
            return None;
        }
        let upper = samples.partition_point(|s| s.timestamp < t);
        if upper == 0 {
            return Some(0);
        }
        if upper == samples.len() {
            return Some(samples.len() - 1);
        }
        let before = t - samples[upper - 1].timestamp;
        let after = samples[upper].timestamp - t;
        Some(if after < before { upper } else { upper - 1 })
    }

    /// Event table for a paired window: one row per marker that falls inside
    /// the sample span, pointing at the closest sample. A window without
    /// markers yields a single `(0, 0, 0)` row so the whole window can still
    /// be treated as one epoch.
    pub fn make_events(window: &Window, event_duration: u32) -> Vec<EventRow> {
        let (Some(first), Some(last)) = (window.samples.first(), window.samples.last()) else {
            return vec![EventRow::default()];
        };
        let rows: Vec<EventRow> = window
            .markers
            .iter()
            .flatten()
            .filter(|m| m.timestamp >= first.timestamp && m.timestamp <= last.timestamp)
            .filter_map(|m| {
                let code = m.label.code()?;
                let sample_index = Self::nearest_index(&window.samples, m.timestamp)?;
                Some(EventRow {
                    sample_index,
                    duration: event_duration,
                    code,
                })
            })
            .collect();
        if rows.is_empty() {
            log::debug!("no markers inside window; emitting a single empty event");
            return vec![EventRow::default()];
        }
        rows
    }
}
