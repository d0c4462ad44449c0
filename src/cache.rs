use anyhow::Result;
use std::path::Path;

/// Thumbnail byte cache backed by sled. Keys include the modification marker
/// so a changed photo never serves stale bytes. Every failure here is
/// recoverable: the engine treats it as a cache miss.
#[derive(Clone)]
pub struct ThumbnailCache {
    db: sled::Db,
}

impl ThumbnailCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Ok(Self { db })
    }

    fn key(id: &str, marker: &str) -> String {
        format!("{}@{}", id, marker)
    }

    pub fn get(&self, id: &str, marker: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(Self::key(id, marker))?.map(|v| v.to_vec()))
    }

    pub fn put(&self, id: &str, marker: &str, bytes: &[u8]) -> Result<()> {
        self.db.insert(Self::key(id, marker), bytes)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_and_marker_isolation() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ThumbnailCache::open(temp_dir.path().join("cache")).unwrap();

        cache.put("p1", "2024-01-01T00:00:00+00:00", b"bytes-v1").unwrap();

        let hit = cache.get("p1", "2024-01-01T00:00:00+00:00").unwrap();
        assert_eq!(hit.as_deref(), Some(b"bytes-v1".as_ref()));

        // A moved marker must miss, not serve the old bytes.
        let miss = cache.get("p1", "2024-02-01T00:00:00+00:00").unwrap();
        assert!(miss.is_none());
    }
}
