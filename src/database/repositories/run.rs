use crate::database::models::{RunRecord, RunStatus};
use crate::database::DatabaseError;
use rusqlite::{params, Connection, OptionalExtension};

pub struct RunRepository<'c> {
    conn: &'c Connection,
}

impl<'c> RunRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn start(&self, id: &str, started_at: &str) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO runs (id, started_at, status) VALUES (?1, ?2, ?3)",
            params![id, started_at, RunStatus::Running.as_str()],
        )?;
        Ok(())
    }

    pub fn finish(
        &self,
        id: &str,
        status: RunStatus,
        finished_at: &str,
        items_listed: i64,
        items_processed: i64,
        items_failed: i64,
    ) -> Result<(), DatabaseError> {
        self.conn.execute(
            "UPDATE runs SET
                 status = ?2,
                 finished_at = ?3,
                 items_listed = ?4,
                 items_processed = ?5,
                 items_failed = ?6
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                finished_at,
                items_listed,
                items_processed,
                items_failed
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<RunRecord>, DatabaseError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, status,
                        items_listed, items_processed, items_failed
                 FROM runs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RunRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        status: RunStatus::from(row.get::<_, String>(3)?),
                        items_listed: row.get(4)?,
                        items_processed: row.get(5)?,
                        items_failed: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
