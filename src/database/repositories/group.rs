use crate::database::models::{DuplicateGroup, MatchKind};
use crate::database::DatabaseError;
use chrono::Utc;
use rusqlite::{params, Connection};

pub struct GroupRepository<'c> {
    conn: &'c Connection,
}

impl<'c> GroupRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Replace the persisted partition with the freshly materialized one.
    /// Runs in a single transaction so readers never observe a partial
    /// partition.
    pub fn replace_partition(&self, groups: &[DuplicateGroup]) -> Result<(), DatabaseError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM group_members", [])?;
        tx.execute("DELETE FROM groups", [])?;

        let created_at = Utc::now().to_rfc3339();
        for group in groups {
            tx.execute(
                "INSERT INTO groups (group_id, match_kind, created_at) VALUES (?1, ?2, ?3)",
                params![group.group_id, group.match_kind.as_str(), created_at],
            )?;
            for (position, photo_id) in group.members.iter().enumerate() {
                tx.execute(
                    "INSERT INTO group_members (group_id, photo_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![group.group_id, photo_id, position as i64],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the full partition, members in their stored (capture-time) order,
    /// groups ordered exact-first then by size, matching run output.
    pub fn load_partition(&self) -> Result<Vec<DuplicateGroup>, DatabaseError> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_id, match_kind FROM groups")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut groups = Vec::new();
        for row in rows {
            let (group_id, kind_str) = row?;
            let match_kind = MatchKind::parse(&kind_str).ok_or_else(|| {
                DatabaseError::Consistency(format!(
                    "group {} has unknown match kind {:?}",
                    group_id, kind_str
                ))
            })?;

            let mut member_stmt = self.conn.prepare(
                "SELECT photo_id FROM group_members
                 WHERE group_id = ?1 ORDER BY position",
            )?;
            let member_rows = member_stmt.query_map(params![group_id], |row| row.get(0))?;
            let mut members = Vec::new();
            for member in member_rows {
                members.push(member?);
            }

            groups.push(DuplicateGroup {
                group_id,
                match_kind,
                members,
            });
        }

        groups.sort_by(|a, b| {
            let exact_a = a.match_kind == MatchKind::Exact;
            let exact_b = b.match_kind == MatchKind::Exact;
            exact_b
                .cmp(&exact_a)
                .then_with(|| b.members.len().cmp(&a.members.len()))
                .then_with(|| a.group_id.cmp(&b.group_id))
        });
        Ok(groups)
    }
}
