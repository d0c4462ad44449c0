use crate::database::models::{PhotoRecord, ScanState};
use crate::database::DatabaseError;
use crate::source::SourceItem;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

pub struct PhotoRepository<'c> {
    conn: &'c Connection,
}

impl<'c> PhotoRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Record an observation from the source listing. Only metadata is
    /// touched: fingerprints and the processed marker belong to
    /// `record_fingerprints`, and `capture_time` is set once.
    pub fn upsert_listing(&self, item: &SourceItem) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO photos (id, filename, mime_type, capture_time, thumbnail_ref)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 filename = excluded.filename,
                 mime_type = excluded.mime_type,
                 thumbnail_ref = excluded.thumbnail_ref",
            params![
                item.id,
                item.filename,
                item.mime_type,
                item.capture_time.to_rfc3339(),
                item.thumbnail_ref,
            ],
        )?;
        Ok(())
    }

    /// Persist the result of a successful hash computation. All columns land
    /// in one statement: a crash before this point leaves the record without
    /// fingerprints and therefore eligible for reprocessing, never half
    /// written.
    pub fn record_fingerprints(
        &self,
        id: &str,
        content_hash: &str,
        phash: &str,
        dhash: &str,
        modified_at: &str,
        last_scanned_at: &str,
    ) -> Result<(), DatabaseError> {
        let updated = self.conn.execute(
            "UPDATE photos SET
                 content_hash = ?2,
                 phash = ?3,
                 dhash = ?4,
                 modified_at = ?5,
                 last_scanned_at = ?6
             WHERE id = ?1",
            params![id, content_hash, phash, dhash, modified_at, last_scanned_at],
        )?;
        if updated == 0 {
            return Err(DatabaseError::Consistency(format!(
                "fingerprint write for unknown photo {}",
                id
            )));
        }
        Ok(())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<PhotoRecord>, DatabaseError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, filename, mime_type, capture_time, thumbnail_ref,
                        content_hash, phash, dhash, modified_at, last_scanned_at
                 FROM photos WHERE id = ?1",
                params![id],
                map_photo,
            )
            .optional()?;
        Ok(record)
    }

    /// Scan state for every known id, keyed by id; the tracker diffs the
    /// current listing against this.
    pub fn scan_states(&self) -> Result<HashMap<String, ScanState>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, phash IS NOT NULL AND dhash IS NOT NULL AND content_hash IS NOT NULL,
                    modified_at
             FROM photos",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ScanState {
                    fingerprinted: row.get::<_, bool>(1)?,
                    modified_at: row.get::<_, Option<String>>(2)?,
                },
            ))
        })?;

        let mut states = HashMap::new();
        for row in rows {
            let (id, state) = row?;
            states.insert(id, state);
        }
        Ok(states)
    }

    /// All records visible to the similarity index, ordered by id for
    /// reproducible rebuilds.
    pub fn all_fingerprinted(&self) -> Result<Vec<PhotoRecord>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, filename, mime_type, capture_time, thumbnail_ref,
                    content_hash, phash, dhash, modified_at, last_scanned_at
             FROM photos
             WHERE content_hash IS NOT NULL AND phash IS NOT NULL AND dhash IS NOT NULL
             ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_photo)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn capture_times(&self) -> Result<HashMap<String, String>, DatabaseError> {
        let mut stmt = self.conn.prepare("SELECT id, capture_time FROM photos")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut times = HashMap::new();
        for row in rows {
            let (id, time) = row?;
            times.insert(id, time);
        }
        Ok(times)
    }

    pub fn count(&self) -> Result<i64, DatabaseError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn map_photo(row: &Row<'_>) -> rusqlite::Result<PhotoRecord> {
    Ok(PhotoRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        mime_type: row.get(2)?,
        capture_time: row.get(3)?,
        thumbnail_ref: row.get(4)?,
        content_hash: row.get(5)?,
        phash: row.get(6)?,
        dhash: row.get(7)?,
        modified_at: row.get(8)?,
        last_scanned_at: row.get(9)?,
    })
}
