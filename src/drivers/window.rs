use ndarray::Array2;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::drivers::buffer::{MarkerBuffer, SignalBuffer};
use crate::drivers::clock::ClockAligner;
use crate::drivers::transform::TransformState;
use crate::drivers::{StreamError, StreamResult};
use crate::types::{MarkerEvent, MarkerLabel, Sample, TimeRange, Unit};

/// Immutable snapshot of `[start_time, end_time)` handed to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct Window {
    pub start_time: f64,
    pub end_time: f64,
    pub channel_count: usize,
    pub channel_labels: Vec<String>,
    pub samples: Vec<Sample>,
    /// Present only when the window was cut from a paired read.
    pub markers: Option<Vec<MarkerEvent>>,
}

impl Window {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.timestamp).collect()
    }

    /// Channel x time matrix.
    pub fn to_matrix(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.channel_count, self.samples.len()), |(c, t)| {
            self.samples[t].values[c]
        })
    }

    /// Copy with every value multiplied by `scale`; timestamps untouched.
    pub fn scaled(&self, scale: f64) -> Window {
        let samples = self
            .samples
            .iter()
            .map(|s| Sample::new(s.timestamp, s.values.iter().map(|v| v * scale).collect()))
            .collect();
        Window {
            samples,
            ..self.clone()
        }
    }

    pub fn scaled_to_volts(&self, unit: Unit) -> Window {
        self.scaled(unit.volts_scale())
    }

    pub fn export(&self) -> WindowExport {
        let values = (0..self.channel_count)
            .map(|c| self.samples.iter().map(|s| s.values[c]).collect())
            .collect();
        let events = self
            .markers
            .iter()
            .flatten()
            .map(|m| ExportedEvent {
                label: m.label.clone(),
                offset: m.timestamp - self.start_time,
            })
            .collect();
        WindowExport {
            channel_count: self.channel_count,
            sample_count: self.samples.len(),
            channel_labels: self.channel_labels.clone(),
            start_time: self.start_time,
            timestamps: self.timestamps(),
            values,
            events,
        }
    }
}

/// Flat form of a [`Window`] for export collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct WindowExport {
    pub channel_count: usize,
    pub sample_count: usize,
    pub channel_labels: Vec<String>,
    pub start_time: f64,
    pub timestamps: Vec<f64>,
    /// values[channel][sample]
    pub values: Vec<Vec<f64>>,
    pub events: Vec<ExportedEvent>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExportedEvent {
    pub label: MarkerLabel,
    /// Seconds from the window start.
    pub offset: f64,
}

/// Cuts windows out of a signal buffer and, when present, its marker buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowExtractor {
    aligner: ClockAligner,
}

impl WindowExtractor {
    pub fn new(aligner: ClockAligner) -> Self {
        Self { aligner }
    }

    pub fn aligner(&self) -> &ClockAligner {
        &self.aligner
    }

    pub fn extract(
        &self,
        buffer: &SignalBuffer,
        labels: &[String],
        range: TimeRange,
        transform: Option<&TransformState>,
    ) -> StreamResult<Window> {
        self.extract_paired(buffer, labels, None, range, None, transform)
    }

    /// Slices each buffer independently; the marker slice may run slightly
    /// ahead of the signal slice if ingest is racing this call.
    pub fn extract_paired(
        &self,
        buffer: &SignalBuffer,
        labels: &[String],
        markers: Option<&MarkerBuffer>,
        range: TimeRange,
        marker_range: Option<TimeRange>,
        transform: Option<&TransformState>,
    ) -> StreamResult<Window> {
        if let Some(t) = transform {
            t.check_width(buffer.channel_count())?;
        }
        let samples = buffer.slice_range(range);
        if samples.is_empty() && !range.is_empty() {
            return Err(StreamError::InsufficientData {
                start: range.start,
                end: range.end,
            });
        }
        let marker_events = markers.map(|m| m.slice_range(marker_range.unwrap_or(range)));

        let (samples, channel_count, channel_labels) = match transform {
            Some(t) => (
                t.apply_samples(&samples)?,
                t.output_width(),
                t.project_labels(labels),
            ),
            None => (samples, buffer.channel_count(), labels.to_vec()),
        };
        log::debug!(
            "extracted {} samples x {} channels in [{:.3}, {:.3})",
            samples.len(),
            channel_count,
            range.start,
            range.end
        );
        Ok(Window {
            start_time: range.start,
            end_time: range.end,
            channel_count,
            channel_labels,
            samples,
            markers: marker_events,
        })
    }

    /// One window per marker currently in `markers`, each spanning
    /// `[marker - pre, marker + post)`. Nothing is read until iteration.
    pub fn extract_epoched<'a>(
        &self,
        buffer: &'a SignalBuffer,
        labels: &'a [String],
        markers: &'a MarkerBuffer,
        pre: f64,
        post: f64,
        transform: Option<Arc<TransformState>>,
    ) -> Epochs<'a> {
        Epochs {
            extractor: *self,
            buffer,
            labels,
            markers,
            pre,
            post,
            transform,
            width_sink: None,
        }
    }
}

/// Lazy, restartable sequence of marker-aligned windows. Every call to
/// [`iter`](Epochs::iter) re-reads both buffers, so two passes can differ if
/// ingest has advanced in between.
pub struct Epochs<'a> {
    extractor: WindowExtractor,
    buffer: &'a SignalBuffer,
    labels: &'a [String],
    markers: &'a MarkerBuffer,
    pre: f64,
    post: f64,
    transform: Option<Arc<TransformState>>,
    width_sink: Option<&'a AtomicUsize>,
}

impl<'a> Epochs<'a> {
    /// Every transformed window this sequence yields stores its channel
    /// count in `sink`.
    pub fn record_width_into(mut self, sink: &'a AtomicUsize) -> Self {
        self.width_sink = Some(sink);
        self
    }

    pub fn iter(&self) -> EpochIter<'a> {
        let events = match self.buffer.bounds() {
            Ok((earliest, latest)) => self.markers.slice_through(earliest, latest),
            Err(_) => Vec::new(),
        };
        EpochIter {
            extractor: self.extractor,
            buffer: self.buffer,
            labels: self.labels,
            pre: self.pre,
            post: self.post,
            transform: self.transform.clone(),
            width_sink: self.width_sink,
            events: events.into_iter(),
        }
    }
}

impl<'a> IntoIterator for &Epochs<'a> {
    type Item = StreamResult<Window>;
    type IntoIter = EpochIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct EpochIter<'a> {
    extractor: WindowExtractor,
    buffer: &'a SignalBuffer,
    labels: &'a [String],
    pre: f64,
    post: f64,
    transform: Option<Arc<TransformState>>,
    width_sink: Option<&'a AtomicUsize>,
    events: std::vec::IntoIter<MarkerEvent>,
}

impl Iterator for EpochIter<'_> {
    type Item = StreamResult<Window>;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.events.next()?;
        let epoch = self
            .extractor
            .aligner
            .resolve_epoch(self.buffer, event.timestamp, self.pre, self.post);
        let window = self
            .extractor
            .extract(self.buffer, self.labels, epoch.range, self.transform.as_deref())
            .map(|mut w| {
                w.markers = Some(vec![event]);
                w
            });
        if let (Ok(w), Some(sink), Some(_)) = (&window, self.width_sink, &self.transform) {
            sink.store(w.channel_count, Ordering::Relaxed);
        }
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.events.size_hint()
    }
}
