// src/drivers/mod.rs
// Acquisition core: decoding, sources, the in-memory store and the pipeline between them.
pub mod buffer;
pub mod decimate;
pub mod decoder;
pub mod error;
pub mod pipeline;
pub mod source;
// Re-exports for callers outside the drivers tree
pub use buffer::{ChannelSeries, Point, PointLimit, StoreSnapshot, TimeseriesStore};
pub use decimate::decimate_min_max;
pub use decoder::{Decoded, Decoder, Protocol};
pub use error::{ChannelError, DecodeError, PersistenceError, QueryError, SourceError};
pub use pipeline::{IngestStats, IngestionPipeline, PersistenceChange, PumpOutcome, PumpReport};
pub use source::{SourceAdapter, SourceOptions, SourceRead, SourceSpec};
