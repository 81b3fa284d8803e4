//! Environment-driven configuration.
//!
//! Every knob has a default; environment variables override it and CLI flags
//! override the environment.

use crate::error::PipelineError;

/// Public disclosure site used when `AZFINANCE_FILINGS_URL` is unset.
pub const DEFAULT_FILINGS_URL: &str = "https://seethemoney.az.gov";

/// Largest page the store returns for a single select.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Connection settings for the REST store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub key: String,
}

impl StoreConfig {
    /// Reads `AZFINANCE_STORE_URL` / `AZFINANCE_STORE_KEY`, falling back to
    /// `SUPABASE_URL` / `SUPABASE_KEY`.
    pub fn from_env() -> Result<Self, PipelineError> {
        let url = first_env(&["AZFINANCE_STORE_URL", "SUPABASE_URL"]).ok_or_else(|| {
            PipelineError::Config("AZFINANCE_STORE_URL (or SUPABASE_URL) is not set".to_string())
        })?;
        let key = first_env(&["AZFINANCE_STORE_KEY", "SUPABASE_KEY"]).ok_or_else(|| {
            PipelineError::Config("AZFINANCE_STORE_KEY (or SUPABASE_KEY) is not set".to_string())
        })?;
        Ok(Self { url, key })
    }

    /// Builds the REST client for this store.
    pub fn client(&self) -> Result<cfstore_api::Client, PipelineError> {
        Ok(cfstore_api::Client::new(&self.url, &self.key)?)
    }
}

/// Chunk sizes for the upload coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadConfig {
    /// Dependent rows per insert request.
    pub row_chunk: usize,
    /// Entity ids per existence check (`in.(...)` filter width).
    pub entity_check_chunk: usize,
    /// Stub entities per ignore-duplicates insert.
    pub entity_insert_chunk: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            row_chunk: 100,
            entity_check_chunk: 50,
            entity_insert_chunk: 500,
        }
    }
}

impl UploadConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            row_chunk: env_usize("AZFINANCE_ROW_CHUNK", defaults.row_chunk).max(1),
            entity_check_chunk: env_usize(
                "AZFINANCE_ENTITY_CHECK_CHUNK",
                defaults.entity_check_chunk,
            )
            .max(1),
            entity_insert_chunk: defaults.entity_insert_chunk,
        }
    }
}

/// Base URL of the filing source.
pub fn filings_url() -> String {
    std::env::var("AZFINANCE_FILINGS_URL").unwrap_or_else(|_| DEFAULT_FILINGS_URL.to_string())
}

fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.trim().is_empty())
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(default)
}
