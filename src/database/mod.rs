pub mod models;
pub mod repositories;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

use repositories::{GroupRepository, PhotoRepository, RunRepository};

/// A run lock older than this is assumed to belong to a crashed process and
/// is taken over.
const STALE_LOCK_SECS: i64 = 3600;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store is locked by another run (acquired at {0})")]
    Locked(String),

    #[error("store consistency violation: {0}")]
    Consistency(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS photos (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    capture_time TEXT NOT NULL,
    thumbnail_ref TEXT NOT NULL,
    content_hash TEXT,
    phash TEXT,
    dhash TEXT,
    modified_at TEXT,
    last_scanned_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_photos_content_hash ON photos(content_hash);
CREATE INDEX IF NOT EXISTS idx_photos_phash ON photos(phash);
CREATE INDEX IF NOT EXISTS idx_photos_dhash ON photos(dhash);

CREATE TABLE IF NOT EXISTS groups (
    group_id TEXT PRIMARY KEY,
    match_kind TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL REFERENCES groups(group_id),
    photo_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (group_id, photo_id)
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    items_listed INTEGER NOT NULL DEFAULT 0,
    items_processed INTEGER NOT NULL DEFAULT 0,
    items_failed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS run_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
";

/// Single-writer SQLite store holding photo records, the duplicate-group
/// partition and run bookkeeping. The group tables are a cache: everything in
/// them is re-derivable from the photo fingerprints alone.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn photos(&self) -> PhotoRepository<'_> {
        PhotoRepository::new(&self.conn)
    }

    pub fn groups(&self) -> GroupRepository<'_> {
        GroupRepository::new(&self.conn)
    }

    pub fn runs(&self) -> RunRepository<'_> {
        RunRepository::new(&self.conn)
    }

    /// Advisory run-level lock. Concurrent runs against one store would break
    /// the atomic fingerprint+marker contract, so a second acquire fails
    /// unless the existing lock looks abandoned.
    pub fn acquire_run_lock(&self, owner: &str) -> Result<(), DatabaseError> {
        let existing: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT owner, acquired_at FROM run_lock WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((holder, acquired_at)) = existing {
            let stale = DateTime::parse_from_rfc3339(&acquired_at)
                .map(|t| Utc::now() - t.with_timezone(&Utc) > Duration::seconds(STALE_LOCK_SECS))
                .unwrap_or(true);
            if !stale {
                return Err(DatabaseError::Locked(acquired_at));
            }
            log::warn!(
                "taking over stale run lock held by {} since {}",
                holder,
                acquired_at
            );
            self.conn
                .execute("DELETE FROM run_lock WHERE id = 1", [])?;
        }

        self.conn.execute(
            "INSERT INTO run_lock (id, owner, acquired_at) VALUES (1, ?1, ?2)",
            params![owner, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn release_run_lock(&self, owner: &str) -> Result<(), DatabaseError> {
        self.conn.execute(
            "DELETE FROM run_lock WHERE id = 1 AND owner = ?1",
            params![owner],
        )?;
        Ok(())
    }

    /// Check the invariants of the persisted partition. Violations are fatal
    /// for the run and surfaced verbatim; silently repairing them could mask
    /// data loss.
    pub fn verify_integrity(&self) -> Result<(), DatabaseError> {
        let orphan: Option<String> = self
            .conn
            .query_row(
                "SELECT gm.photo_id FROM group_members gm
                 LEFT JOIN photos p ON p.id = gm.photo_id
                 WHERE p.id IS NULL LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(photo_id) = orphan {
            return Err(DatabaseError::Consistency(format!(
                "group member {} references a nonexistent photo",
                photo_id
            )));
        }

        let unfingerprinted: Option<String> = self
            .conn
            .query_row(
                "SELECT gm.photo_id FROM group_members gm
                 JOIN photos p ON p.id = gm.photo_id
                 WHERE p.content_hash IS NULL OR p.phash IS NULL OR p.dhash IS NULL
                 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(photo_id) = unfingerprinted {
            return Err(DatabaseError::Consistency(format!(
                "group member {} has no fingerprints",
                photo_id
            )));
        }

        let undersized: Option<String> = self
            .conn
            .query_row(
                "SELECT g.group_id FROM groups g
                 LEFT JOIN group_members gm ON gm.group_id = g.group_id
                 GROUP BY g.group_id HAVING COUNT(gm.photo_id) < 2 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(group_id) = undersized {
            return Err(DatabaseError::Consistency(format!(
                "group {} has fewer than two members",
                group_id
            )));
        }

        let unknown_kind: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT group_id, match_kind FROM groups
                 WHERE match_kind NOT IN ('exact', 'similar') LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((group_id, kind)) = unknown_kind {
            return Err(DatabaseError::Consistency(format!(
                "group {} has unknown match kind {:?}",
                group_id, kind
            )));
        }

        Ok(())
    }
}
