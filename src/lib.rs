//! Incremental duplicate / near-duplicate detection for large remote photo
//! libraries.
//!
//! The engine tracks per-item scan state in SQLite so repeated runs only
//! touch new or changed photos, fingerprints thumbnails with one content hash
//! and two perceptual hashes, finds neighbors through BK-tree radius queries
//! instead of pairwise comparison, and maintains the duplicate-group
//! partition with union-find. Photo access goes through the [`PhotoSource`]
//! trait; rendering reports and deleting photos are someone else's job.

pub mod cache;
pub mod config;
pub mod core;
pub mod database;
pub mod source;

pub use cache::ThumbnailCache;
pub use config::EngineConfig;
pub use core::scanner::{
    RunReport, RunSummary, ScanEngine, ScanError, ScanPhase, ScanProgress, SkippedItem,
};
pub use database::models::{DuplicateGroup, MatchKind, PhotoRecord};
pub use database::Store;
pub use source::{FetchError, PhotoSource, SourceItem, SourcePage};
