use thiserror::Error;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("source '{source_name}' not available within {timeout_ms} ms")]
    Connect { source_name: String, timeout_ms: u128 },
    #[error("entry at {timestamp} is older than latest stored timestamp {latest}")]
    OutOfOrder { timestamp: f64, latest: f64 },
    #[error("buffer is empty; no entries appended yet")]
    EmptyBuffer,
    #[error("range starting at {start} is past the newest retained timestamp {latest}")]
    RangeUnavailable { start: f64, latest: f64 },
    #[error("no samples in [{start}, {end})")]
    InsufficientData { start: f64, end: f64 },
    #[error("transform expects {expected} input channels, buffer has {actual}")]
    TransformShape { expected: usize, actual: usize },
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no transformed window has been produced yet")]
    NoTransformedWindow,
    #[error("source '{source_name}' failed: {reason}")]
    SourceFailed { source_name: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamError {
    /// Data that does not exist yet; callers may retry after more ingest.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::EmptyBuffer
                | StreamError::RangeUnavailable { .. }
                | StreamError::InsufficientData { .. }
        )
    }
}
