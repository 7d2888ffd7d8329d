// src/drivers/mod.rs
pub mod analysis;
pub mod buffer;
pub mod clock;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod source;
pub mod transform;
pub mod window;
// Re-exports for callers that only need the session surface.
pub use analysis::{AnalysisHandle, AnalysisLoop, LoopLimit};
pub use buffer::{MarkerBuffer, SignalBuffer, StreamBuffer};
pub use clock::{AlignedRanges, ClockAligner, EpochRange, EventRow};
pub use error::{StreamError, StreamResult};
pub use ingest::{IngestHandle, IngestState, IngestStats, IngestTiming};
pub use pipeline::StreamSession;
pub use source::{
    ChannelSource, Chunk, ChunkSender, ManualSource, SampleChunkSource, SyntheticMarkers,
    SyntheticSignal,
};
pub use transform::{
    FittedModelRecord, TransformProvider, TransformSlot, TransformSpec, TransformState,
};
pub use window::{EpochIter, Epochs, ExportedEvent, Window, WindowExport, WindowExtractor};
