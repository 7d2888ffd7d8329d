use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::drivers::buffer::{MarkerBuffer, SignalBuffer};
use crate::drivers::clock::{ClockAligner, EventRow};
use crate::drivers::ingest::{IngestHandle, IngestState, IngestStats, IngestTiming};
use crate::drivers::source::SampleChunkSource;
use crate::drivers::transform::{FittedModelRecord, TransformProvider, TransformSlot, TransformState};
use crate::drivers::window::{Epochs, Window, WindowExtractor};
use crate::drivers::{StreamError, StreamResult};
use crate::types::{local_clock, MarkerEvent, Sample, StreamInfo, TimeRange};

struct MarkerStream {
    buffer: Arc<MarkerBuffer>,
    ingest: IngestHandle,
}

/// A connected signal stream, optionally paired with a marker stream.
///
/// Owns one buffer and one ingest unit per source plus the current
/// transform. Reads never wait on ingest; they see whatever has been
/// appended when they run.
pub struct StreamSession {
    info: StreamInfo,
    config: SessionConfig,
    signal: Arc<SignalBuffer>,
    signal_ingest: IngestHandle,
    markers: Option<MarkerStream>,
    transform: TransformSlot,
    extractor: WindowExtractor,
    // 0 until a transformed window has been produced.
    last_transformed_width: AtomicUsize,
}

impl StreamSession {
    pub fn connect<S>(info: StreamInfo, config: &SessionConfig, source: S) -> StreamResult<Self>
    where
        S: SampleChunkSource<Entry = Sample>,
    {
        config.validate()?;
        let signal = Arc::new(SignalBuffer::new(info.channel_count(), config.signal_retention)?);
        log::info!(
            "connecting to '{}' ({} channels @ {} Hz)",
            info.name,
            info.channel_count(),
            info.nominal_rate_hz
        );
        let signal_ingest = IngestHandle::start(source, Arc::clone(&signal), timing(config))?;
        Ok(Self {
            info,
            config: config.clone(),
            signal,
            signal_ingest,
            markers: None,
            transform: TransformSlot::default(),
            extractor: WindowExtractor::default(),
            last_transformed_width: AtomicUsize::new(0),
        })
    }

    /// Connects a marker stream. On failure the signal stream keeps running
    /// and any previously attached marker stream is left in place.
    pub fn attach_markers<S>(&mut self, source: S) -> StreamResult<()>
    where
        S: SampleChunkSource<Entry = MarkerEvent>,
    {
        let buffer = Arc::new(MarkerBuffer::new(1, self.config.marker_retention)?);
        let ingest = IngestHandle::start(source, Arc::clone(&buffer), timing(&self.config))?;
        if let Some(old) = self.markers.replace(MarkerStream { buffer, ingest }) {
            old.ingest.stop();
        }
        Ok(())
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn signal_buffer(&self) -> &Arc<SignalBuffer> {
        &self.signal
    }

    pub fn marker_buffer(&self) -> Option<&Arc<MarkerBuffer>> {
        self.markers.as_ref().map(|m| &m.buffer)
    }

    pub fn signal_state(&self) -> IngestState {
        self.signal_ingest.state()
    }

    pub fn marker_state(&self) -> Option<IngestState> {
        self.markers.as_ref().map(|m| m.ingest.state())
    }

    pub fn signal_stats(&self) -> &IngestStats {
        self.signal_ingest.stats()
    }

    pub fn marker_stats(&self) -> Option<&IngestStats> {
        self.markers.as_ref().map(|m| m.ingest.stats())
    }

    /// The most recent `duration` seconds, ending at the newest signal
    /// sample, with markers from the same range when a marker stream is
    /// attached.
    pub fn window(&self, duration: f64) -> StreamResult<Window> {
        let markers = self.marker_buffer().map(Arc::as_ref);
        let ranges = self
            .extractor
            .aligner()
            .resolve_window(&self.signal, markers, duration)?;
        let transform = self.transform.current();
        let window = self.extractor.extract_paired(
            &self.signal,
            &self.info.channel_labels,
            markers,
            ranges.primary,
            ranges.secondary,
            transform.as_deref(),
        )?;
        self.note_width(&window, transform.is_some());
        Ok(window)
    }

    /// Signal-only window over an explicit range.
    pub fn window_between(&self, range: TimeRange) -> StreamResult<Window> {
        let transform = self.transform.current();
        let window = self.extractor.extract(
            &self.signal,
            &self.info.channel_labels,
            range,
            transform.as_deref(),
        )?;
        self.note_width(&window, transform.is_some());
        Ok(window)
    }

    /// Marker-aligned epochs over the retained data. Fails when no marker
    /// stream is attached or the transform does not fit the signal.
    pub fn epochs(&self, pre: f64, post: f64) -> StreamResult<Epochs<'_>> {
        let markers = self.marker_buffer().ok_or_else(|| {
            StreamError::InvalidConfig("epoching needs an attached marker stream".into())
        })?;
        let transform = self.transform.current();
        if let Some(t) = &transform {
            t.check_width(self.signal.channel_count())?;
        }
        Ok(self
            .extractor
            .extract_epoched(
                &self.signal,
                &self.info.channel_labels,
                markers,
                pre,
                post,
                transform,
            )
            .record_width_into(&self.last_transformed_width))
    }

    pub fn events(&self, window: &Window, event_duration: u32) -> Vec<EventRow> {
        ClockAligner::make_events(window, event_duration)
    }

    pub fn last_n(&self, n: usize) -> Vec<Sample> {
        self.signal.last_n(n)
    }

    /// Seconds between now and the newest signal sample.
    pub fn latency(&self) -> StreamResult<f64> {
        Ok(local_clock() - self.signal.latest_timestamp()?)
    }

    /// Retained signal length in seconds at the nominal rate.
    pub fn recording_duration(&self) -> f64 {
        if self.info.nominal_rate_hz > 0.0 {
            self.signal.len() as f64 / self.info.nominal_rate_hz
        } else {
            0.0
        }
    }

    pub fn set_transform(&self, provider: &dyn TransformProvider) -> StreamResult<()> {
        let state = provider.provide()?;
        state.check_width(self.signal.channel_count())?;
        log::info!(
            "transform replaced: {} -> {} channels (excluded {:?})",
            state.input_width(),
            state.output_width(),
            state.excluded()
        );
        self.transform.replace(state);
        Ok(())
    }

    pub fn clear_transform(&self) {
        if self.transform.clear().is_some() {
            log::info!("transform cleared");
        }
    }

    pub fn transform(&self) -> Option<Arc<TransformState>> {
        self.transform.current()
    }

    /// Describes a model trained on this session's transformed windows.
    /// `n_features` is the channel count of the last transformed window.
    pub fn model_record(
        &self,
        paradigm: impl Into<String>,
        processing: impl Into<String>,
        n_samples_for_training: usize,
        model: serde_json::Value,
    ) -> StreamResult<FittedModelRecord> {
        let n_features = self.last_transformed_width.load(Ordering::Relaxed);
        if n_features == 0 {
            return Err(StreamError::NoTransformedWindow);
        }
        Ok(FittedModelRecord {
            paradigm: paradigm.into(),
            processing: processing.into(),
            n_samples_for_training,
            n_features,
            model,
        })
    }

    /// Stops both ingest units. Buffers stay readable afterwards.
    pub fn disconnect(&self) {
        if let Some(markers) = &self.markers {
            markers.ingest.stop();
        }
        self.signal_ingest.stop();
        log::info!("session '{}' disconnected", self.info.name);
    }

    fn note_width(&self, window: &Window, transformed: bool) {
        if transformed {
            self.last_transformed_width
                .store(window.channel_count, Ordering::Relaxed);
        }
    }
}

fn timing(config: &SessionConfig) -> IngestTiming {
    IngestTiming {
        connect_timeout: config.connect_timeout(),
        poll_timeout: config.poll_timeout(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Retention;
    use crate::drivers::source::{ChannelSource, ManualSource};
    use crate::drivers::transform::TransformSpec;
    use std::thread;
    use std::time::{Duration, Instant};

    fn info(channels: usize) -> StreamInfo {
        StreamInfo::new("eeg", StreamInfo::default_labels(channels), 128.0)
    }

    fn ramp(channels: usize, n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let t = i as f64 / 128.0;
                Sample::new(t, (0..channels).map(|c| c as f64 * 10.0 + t).collect())
            })
            .collect()
    }

    fn wait_for_stop(session: &StreamSession) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.signal_state() != IngestState::Stopped {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn loaded(channels: usize, n: usize) -> StreamSession {
        let source = ManualSource::new("eeg", ramp(channels, n).chunks(7).map(<[Sample]>::to_vec));
        let session = StreamSession::connect(info(channels), &SessionConfig::default(), source).unwrap();
        wait_for_stop(&session);
        session
    }

    #[test]
    fn window_covers_requested_duration() {
        let session = loaded(3, 256);
        let window = session.window(0.5).unwrap();
        assert_eq!(window.channel_count, 3);
        assert!((window.duration() - 0.5).abs() < 1e-9);
        assert_eq!(window.sample_count(), 64);
        assert!(window.markers.is_none());
        assert!((session.recording_duration() - 2.0).abs() < 1e-9);
        assert_eq!(session.last_n(4).len(), 4);
    }

    #[test]
    fn empty_session_reads_are_retryable() {
        let (_tx, source) = ChannelSource::unbounded("idle");
        let session = StreamSession::connect(info(2), &SessionConfig::default(), source).unwrap();
        let err = session.window(1.0).unwrap_err();
        assert!(err.is_retryable());
        assert!(session.latency().is_err());
        session.disconnect();
        assert_eq!(session.signal_state(), IngestState::Stopped);
    }

    #[test]
    fn marker_connect_failure_leaves_signal_alone() {
        let mut session = loaded(2, 50);
        let err = session
            .attach_markers(ManualSource::<MarkerEvent>::unavailable("markers"))
            .unwrap_err();
        assert!(matches!(err, StreamError::Connect { .. }));
        assert!(session.marker_buffer().is_none());
        assert_eq!(session.window(0.2).unwrap().channel_count, 2);
    }

    #[test]
    fn transform_and_model_record_agree() {
        let mut session = loaded(4, 300);
        let markers = ManualSource::new(
            "markers",
            vec![vec![MarkerEvent::code(1.0, 1), MarkerEvent::code(2.0, 2)]],
        );
        session.attach_markers(markers).unwrap();
        let marker_buffer = Arc::clone(session.marker_buffer().unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        while marker_buffer.len() < 2 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        assert!(matches!(
            session.model_record("p300", "raw", 10, serde_json::Value::Null),
            Err(StreamError::NoTransformedWindow)
        ));
        assert!(session.set_transform(&TransformSpec::identity(3, vec![])).is_err());
        session.set_transform(&TransformSpec::identity(4, vec![0])).unwrap();

        let window = session.window(2.5).unwrap();
        assert_eq!(window.channel_count, 3);
        assert_eq!(window.markers.as_ref().map(Vec::len), Some(2));
        let events = session.events(&window, 0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].code, 2);

        let record = session
            .model_record("p300", "ica", 12, serde_json::json!({ "kind": "lda" }))
            .unwrap();
        assert_eq!(record.n_features, 3);
        record.check_against(&window).unwrap();

        let epochs = session.epochs(0.2, 0.3).unwrap();
        let windows: Vec<Window> = epochs.iter().collect::<StreamResult<_>>().unwrap();
        assert_eq!(windows.len(), 2);
        assert!(windows.iter().all(|w| w.channel_count == 3));

        session.clear_transform();
        assert_eq!(session.window(0.5).unwrap().channel_count, 4);
    }

    #[test]
    fn model_width_comes_only_from_produced_epochs() {
        let mut session = loaded(2, 256);
        let markers = ManualSource::new("markers", vec![vec![MarkerEvent::code(40.0, 1)]]);
        session.attach_markers(markers).unwrap();
        let marker_buffer = Arc::clone(session.marker_buffer().unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        while marker_buffer.is_empty() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        session.set_transform(&TransformSpec::identity(2, vec![1])).unwrap();

        // The only marker lies past the signal, so no epoch is produced.
        let epochs = session.epochs(0.1, 0.1).unwrap();
        assert_eq!(epochs.iter().count(), 0);
        assert!(matches!(
            session.model_record("p300", "ica", 0, serde_json::Value::Null),
            Err(StreamError::NoTransformedWindow)
        ));

        session
            .attach_markers(ManualSource::new("markers", vec![vec![MarkerEvent::code(1.0, 2)]]))
            .unwrap();
        let marker_buffer = Arc::clone(session.marker_buffer().unwrap());
        while marker_buffer.is_empty() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        let epochs = session.epochs(0.1, 0.1).unwrap();
        assert_eq!(epochs.iter().filter(Result::is_ok).count(), 1);
        let record = session
            .model_record("p300", "ica", 1, serde_json::Value::Null)
            .unwrap();
        assert_eq!(record.n_features, 1);
    }

    #[test]
    fn epochs_need_a_marker_stream() {
        let session = loaded(1, 10);
        assert!(matches!(session.epochs(0.1, 0.1), Err(StreamError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_invalid_config() {
        let config = SessionConfig {
            signal_retention: Retention::Seconds(-1.0),
            ..SessionConfig::default()
        };
        let source = ManualSource::<Sample>::new("eeg", Vec::new());
        assert!(StreamSession::connect(info(2), &config, source).is_err());
    }
}
