//! Error types for the pipeline layer.

use crate::extractor::ExtractorError;
use crate::filings::FilingsError;

/// Errors that fail a single work unit.
///
/// None of these abort the run: the runner records the unit as failed, leaves
/// it `unprocessed` in the store, and moves on.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// A store call failed outside of a chunked upload.
    #[error("store error: {0}")]
    Store(#[from] cfstore_api::Error),
    /// Entity pre-creation exhausted its retries or hit a client error.
    /// No dependent rows were written.
    #[error("entity pre-creation failed: {0}")]
    EntityPrecreate(#[source] cfstore_api::Error),
    /// A chunk of dependent rows could not be written.
    #[error("chunk {chunk} of {table} failed: {source} | sample: {sample}")]
    ChunkFailed {
        table: String,
        chunk: usize,
        sample: String,
        #[source]
        source: cfstore_api::Error,
    },
    #[error("extraction failed: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("filing source error: {0}")]
    Filings(#[from] FilingsError),
    /// Data that cannot be shaped into rows (missing key fields and the like).
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Status code of the underlying store failure, if any.
    pub fn store_status(&self) -> Option<u16> {
        match self {
            Self::Store(e) | Self::EntityPrecreate(e) => e.status(),
            Self::ChunkFailed { source, .. } => source.status(),
            _ => None,
        }
    }
}
