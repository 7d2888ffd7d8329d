use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::thread;
use std::time::Duration;

use crate::drivers::{StreamError, StreamResult};
use crate::types::{local_clock, MarkerEvent, Sample, Timestamped};

/// What a source hands back from one poll.
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk<E> {
    /// Zero or more entries, individually in non-decreasing timestamp order.
    /// Empty means the poll timed out with nothing new.
    Entries(Vec<E>),
    /// The source has ended and will not produce more data.
    Closed,
}

/// Transport-side producer of entries for one stream.
///
/// Implementations only promise ordering within a chunk; the ingest loop
/// copes with chunks that overlap or go backwards.
pub trait SampleChunkSource: Send + 'static {
    type Entry: Timestamped;

    fn name(&self) -> &str;

    /// Blocks until the source is available, for at most `timeout`.
    fn connect(&mut self, _timeout: Duration) -> StreamResult<()> {
        Ok(())
    }

    /// Blocks for at most `timeout` waiting for the next chunk.
    fn next_chunk(&mut self, timeout: Duration) -> StreamResult<Chunk<Self::Entry>>;

    /// Releases the transport handle. Called once, after the last poll.
    fn close(&mut self) {}
}

/// In-memory source for tests and deterministic playback. Closes once the
/// queued chunks are drained.
pub struct ManualSource<E> {
    name: String,
    queue: VecDeque<Vec<E>>,
    available: bool,
}

impl<E: Timestamped> ManualSource<E> {
    pub fn new(name: impl Into<String>, chunks: impl IntoIterator<Item = Vec<E>>) -> Self {
        Self {
            name: name.into(),
            queue: chunks.into_iter().collect(),
            available: true,
        }
    }

    /// A source whose connect always fails.
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: VecDeque::new(),
            available: false,
        }
    }
}

impl<E: Timestamped> SampleChunkSource for ManualSource<E> {
    type Entry = E;

    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self, timeout: Duration) -> StreamResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(StreamError::Connect {
                source_name: self.name.clone(),
                timeout_ms: timeout.as_millis(),
            })
        }
    }

    fn next_chunk(&mut self, _timeout: Duration) -> StreamResult<Chunk<E>> {
        Ok(self.queue.pop_front().map_or(Chunk::Closed, Chunk::Entries))
    }
}

/// Push side of a [`ChannelSource`]. Dropping every sender closes the source.
#[derive(Clone)]
pub struct ChunkSender<E> {
    tx: Sender<Vec<E>>,
}

impl<E> ChunkSender<E> {
    /// Returns the chunk back if the receiving source is gone.
    pub fn send(&self, chunk: Vec<E>) -> Result<(), Vec<E>> {
        self.tx.send(chunk).map_err(|e| e.into_inner())
    }
}

/// Source fed by another thread through a crossbeam channel.
pub struct ChannelSource<E> {
    name: String,
    rx: Receiver<Vec<E>>,
}

impl<E: Timestamped> ChannelSource<E> {
    pub fn bounded(name: impl Into<String>, capacity: usize) -> (ChunkSender<E>, Self) {
        let (tx, rx) = channel::bounded(capacity);
        (
            ChunkSender { tx },
            Self {
                name: name.into(),
                rx,
            },
        )
    }

    pub fn unbounded(name: impl Into<String>) -> (ChunkSender<E>, Self) {
        let (tx, rx) = channel::unbounded();
        (
            ChunkSender { tx },
            Self {
                name: name.into(),
                rx,
            },
        )
    }
}

impl<E: Timestamped> SampleChunkSource for ChannelSource<E> {
    type Entry = E;

    fn name(&self) -> &str {
        &self.name
    }

    fn next_chunk(&mut self, timeout: Duration) -> StreamResult<Chunk<E>> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Ok(Chunk::Entries(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(Chunk::Entries(Vec::new())),
            Err(RecvTimeoutError::Disconnected) => Ok(Chunk::Closed),
        }
    }
}

/// Multi-channel sine-plus-noise generator paced in real time and stamped
/// with [`local_clock`].
pub struct SyntheticSignal {
    name: String,
    channels: usize,
    rate_hz: f64,
    max_chunk: usize,
    amplitude: f64,
    noise: f64,
    rng: StdRng,
    origin: Option<f64>,
    emitted: u64,
}

impl SyntheticSignal {
    pub fn new(name: impl Into<String>, channels: usize, rate_hz: f64) -> Self {
        Self {
            name: name.into(),
            channels,
            rate_hz,
            max_chunk: 64,
            amplitude: 20.0,
            noise: 2.0,
            rng: StdRng::seed_from_u64(0x5eed),
            origin: None,
            emitted: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk.max(1);
        self
    }

    fn sample_at(&mut self, index: u64, origin: f64) -> Sample {
        let t = origin + index as f64 / self.rate_hz;
        let values = (0..self.channels)
            .map(|c| {
                // Channel c oscillates at (c + 1) * 2 Hz.
                let freq = (c + 1) as f64 * 2.0;
                self.amplitude * (2.0 * PI * freq * (t - origin)).sin()
                    + self.rng.gen_range(-self.noise..=self.noise)
            })
            .collect();
        Sample::new(t, values)
    }
}

impl SampleChunkSource for SyntheticSignal {
    type Entry = Sample;

    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self, _timeout: Duration) -> StreamResult<()> {
        if self.channels == 0 || !(self.rate_hz > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "synthetic source '{}' needs channels and a positive rate",
                self.name
            )));
        }
        self.origin = Some(local_clock());
        Ok(())
    }

    fn next_chunk(&mut self, timeout: Duration) -> StreamResult<Chunk<Sample>> {
        let origin = self.origin.ok_or_else(|| StreamError::SourceFailed {
            source_name: self.name.clone(),
            reason: "polled before connect".into(),
        })?;
        let due = ((local_clock() - origin) * self.rate_hz).floor() as u64 + 1;
        if due <= self.emitted {
            let wait = Duration::from_secs_f64((self.max_chunk as f64 / self.rate_hz).min(timeout.as_secs_f64()));
            thread::sleep(wait);
            return Ok(Chunk::Entries(Vec::new()));
        }
        let end = due.min(self.emitted + self.max_chunk as u64);
        let chunk = (self.emitted..end).map(|i| self.sample_at(i, origin)).collect();
        self.emitted = end;
        Ok(Chunk::Entries(chunk))
    }
}

/// Emits a random code from `codes` every `interval` seconds.
pub struct SyntheticMarkers {
    name: String,
    interval: f64,
    codes: Vec<i32>,
    rng: StdRng,
    next_due: Option<f64>,
}

impl SyntheticMarkers {
    pub fn new(name: impl Into<String>, interval: f64) -> Self {
        Self {
            name: name.into(),
            interval,
            codes: vec![1, 2],
            rng: StdRng::seed_from_u64(0xfeed),
            next_due: None,
        }
    }

    pub fn with_codes(mut self, codes: Vec<i32>) -> Self {
        self.codes = codes;
        self
    }
}

impl SampleChunkSource for SyntheticMarkers {
    type Entry = MarkerEvent;

    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self, _timeout: Duration) -> StreamResult<()> {
        if self.codes.is_empty() || !(self.interval > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "marker source '{}' needs codes and a positive interval",
                self.name
            )));
        }
        self.next_due = Some(local_clock() + self.interval);
        Ok(())
    }

    fn next_chunk(&mut self, timeout: Duration) -> StreamResult<Chunk<MarkerEvent>> {
        let due = self.next_due.ok_or_else(|| StreamError::SourceFailed {
            source_name: self.name.clone(),
            reason: "polled before connect".into(),
        })?;
        let now = local_clock();
        if now < due {
            thread::sleep(Duration::from_secs_f64((due - now).min(timeout.as_secs_f64())));
            return Ok(Chunk::Entries(Vec::new()));
        }
        let code = *self.codes.choose(&mut self.rng).unwrap_or(&0);
        self.next_due = Some(due + self.interval);
        Ok(Chunk::Entries(vec![MarkerEvent::code(due, code)]))
    }
}
