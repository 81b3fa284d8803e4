//! Library layer for the Arizona campaign-finance ingest: shift repair,
//! normalisation, idempotent uploads, the work-unit queue, and the offline
//! consistency pass.
//!
//! Wraps the `cfstore_api` REST client behind the [`store::BulkStore`] seam so
//! every write path can be exercised against the in-process
//! `store::memory::MemoryStore`, available under the `test-util` feature.

pub mod config;
pub mod error;
pub mod extractor;
pub mod filings;
pub mod normalize;
pub mod pipeline;
pub mod repair;
pub mod report;
pub mod retry;
pub mod shift;
pub mod store;
pub mod transactions;
pub mod upload;
pub mod work_unit;

pub use cfstore_api;
pub use cfstore_api::{Filter, InsertMode, Row, Select};

pub use config::{StoreConfig, UploadConfig};
pub use error::PipelineError;
pub use extractor::{ExtractedRecord, ExtractedTable, Extractor, ExtractorError, RscriptExtractor};
pub use filings::{Download, FilingsClient, FilingsError};
pub use pipeline::{RunStats, Runner, UnitOutcome, UnitReport, UnitStrategy};
pub use repair::{RepairError, RepairOptions, RepairSummary};
pub use retry::{RequestTracker, RetryPolicy, TrackerSummary};
pub use shift::{OrgContact, ShiftSymptom, DEFAULT_JURISDICTION};
pub use store::BulkStore;
pub use upload::{ReferencedEntity, UploadCoordinator, UploadRow};
pub use work_unit::{WorkQueue, WorkStatus, WorkUnit};
