use serde::{Deserialize, Serialize};

/// One photo as persisted in the store. Timestamps are RFC 3339 strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    /// Set once at first observation, never mutated.
    pub capture_time: String,
    /// Refreshed on every listing; source references expire.
    pub thumbnail_ref: String,
    pub content_hash: Option<String>,
    /// Hex-encoded perceptual fingerprints; populated together with
    /// `content_hash`, `modified_at` and `last_scanned_at` or not at all.
    pub phash: Option<String>,
    pub dhash: Option<String>,
    /// Source modification marker recorded at last successful processing.
    pub modified_at: Option<String>,
    pub last_scanned_at: Option<String>,
}

impl PhotoRecord {
    /// A record is visible to the index and cluster builder only once all
    /// fingerprints landed.
    pub fn is_fingerprinted(&self) -> bool {
        self.content_hash.is_some() && self.phash.is_some() && self.dhash.is_some()
    }
}

/// Per-item scan state consulted by the tracker.
#[derive(Debug, Clone)]
pub struct ScanState {
    pub fingerprinted: bool,
    pub modified_at: Option<String>,
}

/// A maximal set of photos considered the same or visually equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_id: String,
    pub match_kind: MatchKind,
    /// Size >= 2, ordered by capture time then id.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Every member shares an identical content hash.
    Exact,
    /// At least one pair is related only by perceptual distance.
    Similar,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Similar => "similar",
        }
    }

    /// Strict parse; an unknown kind in the store is a consistency problem
    /// the caller must surface, not paper over.
    pub fn parse(s: &str) -> Option<MatchKind> {
        match s {
            "exact" => Some(MatchKind::Exact),
            "similar" => Some(MatchKind::Similar),
            _ => None,
        }
    }
}

impl From<MatchKind> for String {
    fn from(kind: MatchKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Bookkeeping row for one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub items_listed: i64,
    pub items_processed: i64,
    pub items_failed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        status.as_str().to_string()
    }
}
