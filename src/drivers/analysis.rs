use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::drivers::ingest::IngestState;
use crate::drivers::pipeline::StreamSession;
use crate::drivers::window::Window;
use crate::drivers::{StreamError, StreamResult};

/// When an [`AnalysisLoop`] stops on its own.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoopLimit {
    Forever,
    Iterations(usize),
    /// Seconds of signal recorded since the loop started.
    Seconds(f64),
}

/// Calls back with the latest `buffer_len` seconds every time that much new
/// signal has arrived.
#[derive(Clone, Copy, Debug)]
pub struct AnalysisLoop {
    buffer_len: f64,
    limit: LoopLimit,
    poll: Option<Duration>,
}

impl AnalysisLoop {
    pub fn new(buffer_len: f64) -> Self {
        Self {
            buffer_len,
            limit: LoopLimit::Forever,
            poll: None,
        }
    }

    pub fn with_limit(mut self, limit: LoopLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Overrides the session's `analysis_poll_ms`.
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = Some(poll);
        self
    }

    pub fn spawn<F>(self, session: Arc<StreamSession>, callback: F) -> StreamResult<AnalysisHandle>
    where
        F: FnMut(Window) + Send + 'static,
    {
        if !(self.buffer_len > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "analysis buffer length must be positive, got {}",
                self.buffer_len
            )));
        }
        let poll = self.poll.unwrap_or_else(|| session.config().analysis_poll());
        let stop = Arc::new(AtomicBool::new(false));
        let iterations = Arc::new(AtomicUsize::new(0));
        let worker = {
            let stop = Arc::clone(&stop);
            let iterations = Arc::clone(&iterations);
            thread::Builder::new()
                .name("analysis".into())
                .spawn(move || self.run(&session, poll, callback, &stop, &iterations))?
        };
        Ok(AnalysisHandle {
            stop,
            iterations,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run<F: FnMut(Window)>(
        self,
        session: &StreamSession,
        poll: Duration,
        mut callback: F,
        stop: &AtomicBool,
        iterations: &AtomicUsize,
    ) {
        let buffer = session.signal_buffer();
        let mut started: Option<f64> = None;
        let mut anchor: Option<f64> = None;

        while !stop.load(Ordering::Acquire) {
            let ingest_done = session.signal_state() == IngestState::Stopped;
            let Ok(latest) = buffer.latest_timestamp() else {
                if ingest_done {
                    break;
                }
                thread::sleep(poll);
                continue;
            };
            let start = *started.get_or_insert(latest);
            let last = *anchor.get_or_insert(latest);

            if let LoopLimit::Seconds(limit) = self.limit {
                if latest - start >= limit {
                    break;
                }
            }

            if latest - last >= self.buffer_len {
                match session.window(self.buffer_len) {
                    Ok(window) => {
                        anchor = Some(latest);
                        callback(window);
                        let done = iterations.fetch_add(1, Ordering::AcqRel) + 1;
                        if matches!(self.limit, LoopLimit::Iterations(n) if done >= n) {
                            break;
                        }
                        continue;
                    }
                    Err(err) if err.is_retryable() => {
                        log::debug!("analysis window not ready: {err}");
                    }
                    Err(err) => {
                        log::error!("analysis loop stopped: {err}");
                        break;
                    }
                }
            } else if ingest_done {
                break;
            }
            thread::sleep(poll);
        }
        log::info!(
            "analysis loop finished after {} iterations",
            iterations.load(Ordering::Acquire)
        );
    }
}

pub struct AnalysisHandle {
    stop: Arc<AtomicBool>,
    iterations: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AnalysisHandle {
    pub fn iterations(&self) -> usize {
        self.iterations.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.worker.lock().as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the loop to end on its own.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("analysis callback panicked");
            }
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.join();
    }
}

impl Drop for AnalysisHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
