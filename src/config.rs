// src/config.rs
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::drivers::{StreamError, StreamResult};

/// How much history a buffer keeps before dropping its oldest entries.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    Seconds(f64),
    Entries(usize),
}

impl Retention {
    pub(crate) fn validate(&self, what: &str) -> StreamResult<()> {
        match *self {
            Retention::Seconds(s) if !(s > 0.0) || !s.is_finite() => Err(
                StreamError::InvalidConfig(format!("{what} horizon must be positive, got {s} s")),
            ),
            Retention::Entries(0) => Err(StreamError::InvalidConfig(format!(
                "{what} horizon must keep at least one entry"
            ))),
            _ => Ok(()),
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        // Enough for a few minutes of epoching at typical EEG rates.
        Retention::Seconds(120.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub signal_retention: Retention,
    pub marker_retention: Retention,
    pub connect_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub analysis_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signal_retention: Retention::default(),
            marker_retention: Retention::Entries(10_000),
            connect_timeout_ms: 5_000,
            poll_timeout_ms: 50,
            analysis_poll_ms: 10,
        }
    }
}

impl SessionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        self.signal_retention.validate("signal")?;
        self.marker_retention.validate("marker")?;
        if self.connect_timeout_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "connect_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "poll_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn analysis_poll(&self) -> Duration {
        Duration::from_millis(self.analysis_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "signal_retention": { "seconds": 0.5 } }"#).unwrap();
        assert_eq!(config.signal_retention, Retention::Seconds(0.5));
        assert_eq!(config.poll_timeout_ms, SessionConfig::default().poll_timeout_ms);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_non_positive_horizon() {
        let config = SessionConfig {
            signal_retention: Retention::Seconds(0.0),
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(StreamError::InvalidConfig(_))));
        let config = SessionConfig {
            marker_retention: Retention::Entries(0),
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(StreamError::InvalidConfig(_))));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("neurowindow-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "marker_retention": { "entries": 32 }, "poll_timeout_ms": 5 }"#)
            .unwrap();
        let config = SessionConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.marker_retention, Retention::Entries(32));
        assert_eq!(config.poll_timeout(), Duration::from_millis(5));
    }
}
