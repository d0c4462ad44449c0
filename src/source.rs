use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One item as reported by the photo source's listing call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    /// Opaque stable identifier, unique within the library.
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    /// When the photo was captured; used by downstream keep policies.
    pub capture_time: DateTime<Utc>,
    /// Source-side modification marker. A marker newer than the one recorded
    /// at last successful processing makes the item eligible again.
    pub modified_at: DateTime<Utc>,
    /// Opaque reference handed back to `fetch_thumbnail`.
    pub thumbnail_ref: String,
}

impl SourceItem {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// One page of the source listing.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub items: Vec<SourceItem>,
    /// Token for the next page; `None` once the listing is drained.
    pub next_page_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level trouble worth retrying (timeouts, 5xx, rate limits).
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// The item is gone or inaccessible; retrying cannot help.
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Read access to the remote photo library. Implementations live outside the
/// engine (HTTP client, test fake); the engine only depends on this contract.
#[async_trait]
pub trait PhotoSource: Send + Sync {
    /// Return one page of the library listing. The engine drains pages until
    /// `next_page_token` comes back `None`.
    async fn list_page(
        &self,
        page_size: usize,
        page_token: Option<String>,
    ) -> Result<SourcePage, FetchError>;

    /// Fetch raw thumbnail bytes for an item.
    async fn fetch_thumbnail(&self, thumbnail_ref: &str) -> Result<Vec<u8>, FetchError>;
}
