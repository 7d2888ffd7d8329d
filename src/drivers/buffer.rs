use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Retention;
use crate::drivers::{StreamError, StreamResult};
use crate::types::{MarkerEvent, Sample, Timestamped, TimeRange};

pub type SignalBuffer = StreamBuffer<Sample>;
pub type MarkerBuffer = StreamBuffer<MarkerEvent>;

/// Bounded, timestamp-ordered storage for one stream.
///
/// One ingest thread appends, any number of readers slice. Each append is
/// published under the write lock in one step, so a reader sees an entry
/// entirely or not at all. Readers only hold the read lock while copying
/// the requested range out, so an append waits at most for one in-flight
/// copy of one range (two binary searches plus a clone of the entries in
/// it). Callers that slice very long ranges at high rates lengthen that
/// wait proportionally; the lock is fair, so new readers queue behind a
/// waiting writer and cannot starve it.
pub struct StreamBuffer<E: Timestamped> {
    entries: RwLock<VecDeque<E>>,
    channel_count: usize,
    retention: Retention,
    total_appended: AtomicU64,
    evicted: AtomicU64,
}

impl<E: Timestamped> StreamBuffer<E> {
    pub fn new(channel_count: usize, retention: Retention) -> StreamResult<Self> {
        if channel_count == 0 {
            return Err(StreamError::InvalidConfig(
                "a stream buffer needs at least one channel".into(),
            ));
        }
        retention.validate("buffer")?;
        let initial = match retention {
            Retention::Entries(n) => n.min(1 << 16),
            Retention::Seconds(_) => 1024,
        };
        Ok(Self {
            entries: RwLock::new(VecDeque::with_capacity(initial)),
            channel_count,
            retention,
            total_appended: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Stores `entry` after the newest one, then evicts whatever falls
    /// outside the retention horizon. Rejected entries leave the buffer
    /// untouched.
    pub fn append(&self, entry: E) -> StreamResult<()> {
        if entry.width() != self.channel_count {
            return Err(StreamError::ChannelMismatch {
                expected: self.channel_count,
                actual: entry.width(),
            });
        }
        let timestamp = entry.timestamp();
        let mut entries = self.entries.write();
        let latest = entries.back().map(Timestamped::timestamp);
        if !timestamp.is_finite() || latest.is_some_and(|latest| timestamp < latest) {
            return Err(StreamError::OutOfOrder {
                timestamp,
                latest: latest.unwrap_or(f64::NEG_INFINITY),
            });
        }
        entries.push_back(entry);
        let evicted = Self::evict(&mut entries, self.retention, timestamp);
        drop(entries);

        self.total_appended.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.evicted.fetch_add(evicted, Ordering::Relaxed);
        }
        Ok(())
    }

    fn evict(entries: &mut VecDeque<E>, retention: Retention, newest: f64) -> u64 {
        let mut evicted = 0;
        match retention {
            Retention::Entries(max) => {
                while entries.len() > max {
                    entries.pop_front();
                    evicted += 1;
                }
            }
            Retention::Seconds(horizon) => {
                let cutoff = newest - horizon;
                // The newest entry always survives.
                while entries.len() > 1 && entries.front().is_some_and(|e| e.timestamp() <= cutoff) {
                    entries.pop_front();
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Entries with `start <= timestamp < end`, oldest first. A range with
    /// nothing retained in it yields an empty vector. The read lock is held
    /// for the copy, which is allocated once at its final size.
    pub fn slice(&self, start: f64, end: f64) -> Vec<E> {
        let entries = self.entries.read();
        let lo = entries.partition_point(|e| e.timestamp() < start);
        let hi = entries.partition_point(|e| e.timestamp() < end);
        if lo >= hi {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(hi - lo);
        out.extend(entries.range(lo..hi).cloned());
        out
    }

    /// Entries with `start <= timestamp <= end`.
    pub fn slice_through(&self, start: f64, end: f64) -> Vec<E> {
        let entries = self.entries.read();
        let lo = entries.partition_point(|e| e.timestamp() < start);
        let hi = entries.partition_point(|e| e.timestamp() <= end);
        if lo >= hi {
            return Vec::new();
        }
        entries.range(lo..hi).cloned().collect()
    }

    pub fn slice_range(&self, range: TimeRange) -> Vec<E> {
        self.slice(range.start, range.end)
    }

    /// Like [`slice`](Self::slice) but fails when `start` lies past the
    /// newest retained entry, since no later read could satisfy it either.
    pub fn slice_strict(&self, start: f64, end: f64) -> StreamResult<Vec<E>> {
        let latest = self.latest_timestamp()?;
        if start > latest {
            return Err(StreamError::RangeUnavailable { start, latest });
        }
        Ok(self.slice(start, end))
    }

    pub fn latest_timestamp(&self) -> StreamResult<f64> {
        self.entries
            .read()
            .back()
            .map(Timestamped::timestamp)
            .ok_or(StreamError::EmptyBuffer)
    }

    pub fn earliest_timestamp(&self) -> StreamResult<f64> {
        self.entries
            .read()
            .front()
            .map(Timestamped::timestamp)
            .ok_or(StreamError::EmptyBuffer)
    }

    /// `(earliest, latest)` read under a single lock.
    pub fn bounds(&self) -> StreamResult<(f64, f64)> {
        let entries = self.entries.read();
        match (entries.front(), entries.back()) {
            (Some(first), Some(last)) => Ok((first.timestamp(), last.timestamp())),
            _ => Err(StreamError::EmptyBuffer),
        }
    }

    /// The `n` most recent entries, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<E> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entries ever accepted, including those since evicted.
    pub fn total_appended(&self) -> u64 {
        self.total_appended.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
