pub mod config;
pub mod drivers;
pub mod types;

pub use config::{Retention, SessionConfig};
pub use drivers::{StreamError, StreamResult, StreamSession, Window};
pub use types::{local_clock, MarkerEvent, MarkerLabel, Sample, StreamInfo, TimeRange, Unit};
