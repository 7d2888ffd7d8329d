use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::drivers::buffer::StreamBuffer;
use crate::drivers::source::{Chunk, SampleChunkSource};
use crate::drivers::{StreamError, StreamResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Connecting,
    Running,
    /// Terminal; the source handle has been released.
    Stopped,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    chunks: AtomicU64,
    appended: AtomicU64,
    dropped: AtomicU64,
}

impl IngestStats {
    /// Non-empty chunks received.
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Entries the buffer rejected (out of order or wrong width).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Timing knobs for one ingest unit.
#[derive(Clone, Copy, Debug)]
pub struct IngestTiming {
    pub connect_timeout: Duration,
    pub poll_timeout: Duration,
}

/// One running ingest unit: a dedicated thread pulling chunks from a source
/// and appending them to a single buffer.
pub struct IngestHandle {
    name: String,
    state: Arc<RwLock<IngestState>>,
    stats: Arc<IngestStats>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestHandle {
    /// Spawns the ingest thread and waits at most `timing.connect_timeout`
    /// for its connect handshake. Past that, [`StreamError::Connect`] is
    /// returned and the thread is told to stop; it never appends, even if
    /// the source's connect succeeds later.
    pub fn start<S: SampleChunkSource>(
        source: S,
        buffer: Arc<StreamBuffer<S::Entry>>,
        timing: IngestTiming,
    ) -> StreamResult<Self> {
        let name = source.name().to_string();
        let state = Arc::new(RwLock::new(IngestState::Idle));
        let stats = Arc::new(IngestStats::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = channel::bounded::<StreamResult<()>>(1);

        let worker = {
            let state = Arc::clone(&state);
            let stats = Arc::clone(&stats);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("ingest-{name}"))
                .spawn(move || run(source, buffer, timing, state, stats, stop, ready_tx))?
        };

        let handshake = match ready_rx.recv_timeout(timing.connect_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let mut current = state.write();
                if *current == IngestState::Running {
                    // Connected right at the deadline; the Ok is already queued.
                    Ok(())
                } else {
                    stop.store(true, Ordering::Release);
                    *current = IngestState::Stopped;
                    drop(current);
                    log::error!(
                        "'{name}' not available within {} ms; abandoning connect",
                        timing.connect_timeout.as_millis()
                    );
                    // The thread exits on its own once the source's connect returns.
                    drop(worker);
                    return Err(StreamError::Connect {
                        source_name: name,
                        timeout_ms: timing.connect_timeout.as_millis(),
                    });
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::SourceFailed {
                source_name: name.clone(),
                reason: "ingest thread exited during connect".into(),
            }),
        };
        if let Err(err) = handshake {
            if worker.join().is_err() {
                log::error!("ingest thread for '{name}' panicked while connecting");
            }
            *state.write() = IngestState::Stopped;
            return Err(err);
        }

        Ok(Self {
            name,
            state,
            stats,
            stop,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> IngestState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == IngestState::Running
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Stops the unit and waits for its thread. No append happens after this
    /// returns, including when another thread is stopping it concurrently.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                log::error!("ingest thread for '{}' panicked", self.name);
            }
            *self.state.write() = IngestState::Stopped;
        }
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<S: SampleChunkSource>(
    mut source: S,
    buffer: Arc<StreamBuffer<S::Entry>>,
    timing: IngestTiming,
    state: Arc<RwLock<IngestState>>,
    stats: Arc<IngestStats>,
    stop: Arc<AtomicBool>,
    ready: channel::Sender<StreamResult<()>>,
) {
    *state.write() = IngestState::Connecting;
    if let Err(err) = source.connect(timing.connect_timeout) {
        log::error!("could not connect to '{}': {err}", source.name());
        *state.write() = IngestState::Stopped;
        let _ = ready.send(Err(err));
        return;
    }
    {
        // The stop check and the Running transition share the state lock
        // with the handshake timeout in `start`.
        let mut current = state.write();
        if stop.load(Ordering::Acquire) {
            *current = IngestState::Stopped;
            drop(current);
            log::warn!("'{}' connected after the caller gave up", source.name());
            source.close();
            return;
        }
        *current = IngestState::Running;
        let _ = ready.send(Ok(()));
    }
    log::info!("ingest for '{}' running", source.name());

    while !stop.load(Ordering::Acquire) {
        match source.next_chunk(timing.poll_timeout) {
            Ok(Chunk::Entries(entries)) => {
                if entries.is_empty() {
                    continue;
                }
                stats.chunks.fetch_add(1, Ordering::Relaxed);
                for entry in entries {
                    // A stop request wins over the rest of the chunk.
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    match buffer.append(entry) {
                        Ok(()) => {
                            stats.appended.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            log::warn!("dropping entry from '{}': {err}", source.name());
                            stats.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            Ok(Chunk::Closed) => {
                log::info!("source '{}' closed", source.name());
                break;
            }
            Err(err) => {
                log::error!("source '{}' failed: {err}", source.name());
                break;
            }
        }
    }

    source.close();
    *state.write() = IngestState::Stopped;
    log::info!(
        "ingest for '{}' stopped after {} entries ({} dropped)",
        source.name(),
        stats.appended(),
        stats.dropped()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Retention;
    use crate::drivers::buffer::SignalBuffer;
    use crate::drivers::source::{ChannelSource, ManualSource};
    use crate::types::Sample;
    use std::time::Instant;

    fn timing() -> IngestTiming {
        IngestTiming {
            connect_timeout: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(5),
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn samples(ts: &[f64]) -> Vec<Sample> {
        ts.iter().map(|&t| Sample::new(t, vec![t, -t])).collect()
    }

    #[test]
    fn drains_source_and_drops_out_of_order_entries() {
        let buffer = Arc::new(SignalBuffer::new(2, Retention::Entries(100)).unwrap());
        let source = ManualSource::new(
            "eeg",
            vec![
                samples(&[0.0, 0.1, 0.2]),
                samples(&[0.15, 0.3]),
                vec![Sample::new(0.4, vec![1.0])],
                samples(&[0.5]),
            ],
        );
        let handle = IngestHandle::start(source, Arc::clone(&buffer), timing()).unwrap();
        wait_until(|| handle.state() == IngestState::Stopped);

        let stored: Vec<f64> = buffer.slice(f64::MIN, f64::MAX).iter().map(|s| s.timestamp).collect();
        assert_eq!(stored, vec![0.0, 0.1, 0.2, 0.3, 0.5]);
        assert_eq!(handle.stats().appended(), 5);
        assert_eq!(handle.stats().dropped(), 2);
        assert_eq!(handle.stats().chunks(), 4);
    }

    #[test]
    fn connect_failure_is_surfaced() {
        let buffer = Arc::new(SignalBuffer::new(1, Retention::Entries(10)).unwrap());
        let err = IngestHandle::start(ManualSource::<Sample>::unavailable("gone"), buffer, timing())
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Connect { ref source_name, .. } if source_name == "gone"));
    }

    struct SlowConnect {
        delay: Duration,
        next: f64,
    }

    impl SampleChunkSource for SlowConnect {
        type Entry = Sample;

        fn name(&self) -> &str {
            "slow"
        }

        fn connect(&mut self, _timeout: Duration) -> StreamResult<()> {
            thread::sleep(self.delay);
            Ok(())
        }

        fn next_chunk(&mut self, _timeout: Duration) -> StreamResult<Chunk<Sample>> {
            self.next += 0.01;
            thread::sleep(Duration::from_millis(1));
            Ok(Chunk::Entries(samples(&[self.next])))
        }
    }

    #[test]
    fn connect_is_bounded_by_the_timeout() {
        let buffer = Arc::new(SignalBuffer::new(2, Retention::Entries(100)).unwrap());
        let source = SlowConnect {
            delay: Duration::from_millis(400),
            next: 0.0,
        };
        let timing = IngestTiming {
            connect_timeout: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(5),
        };
        let started = Instant::now();
        let err = IngestHandle::start(source, Arc::clone(&buffer), timing).err().unwrap();
        assert!(started.elapsed() < Duration::from_millis(350));
        assert!(matches!(err, StreamError::Connect { timeout_ms: 50, .. }));

        // Once the slow connect finally returns, nothing is appended.
        thread::sleep(Duration::from_millis(600));
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_appended(), 0);
    }

    #[test]
    fn no_appends_after_stop_returns() {
        let buffer = Arc::new(SignalBuffer::new(2, Retention::Entries(100_000)).unwrap());
        let (tx, source) = ChannelSource::unbounded("push");
        let handle = Arc::new(IngestHandle::start(source, Arc::clone(&buffer), timing()).unwrap());
        assert!(handle.is_running());

        let producer = thread::spawn(move || {
            let mut t = 0.0;
            loop {
                let chunk = samples(&[t, t + 0.001]);
                t += 0.002;
                if tx.send(chunk).is_err() {
                    break;
                }
                if t > 1_000.0 {
                    break;
                }
            }
        });
        wait_until(|| buffer.len() > 50);

        let other = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.stop())
        };
        handle.stop();
        let frozen = buffer.total_appended();
        assert_eq!(handle.state(), IngestState::Stopped);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.total_appended(), frozen);

        other.join().unwrap();
        drop(handle);
        producer.join().unwrap();
    }
}
