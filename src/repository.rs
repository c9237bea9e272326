//! In-memory file record store, keyed by opaque identity.
//!
//! The only component permitted to mutate a stored record is
//! [`crate::state_machine::StateMachine`]; this type is a plain locked CRUD map.

use crate::model::{FileId, FileRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct FileRepository {
    records: Arc<RwLock<HashMap<FileId, FileRecord>>>,
}

impl FileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_by_id(&self, id: FileId) -> Option<FileRecord> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn get_all(&self) -> Vec<FileRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Inserts a new record. Rejects (and logs) a duplicate identity without
    /// overwriting the existing one — identities are never reused.
    pub async fn add(&self, record: FileRecord) {
        let mut records = self.records.write().await;
        if records.contains_key(&record.identity) {
            warn!(identity = %record.identity, "refusing to add duplicate identity");
            return;
        }
        records.insert(record.identity, record);
    }

    /// Persists an existing record. If the identity is absent this still inserts it
    /// (with a warning) — see the Open Question resolution in `SPEC_FULL.md` §9.
    pub async fn update(&self, record: FileRecord) {
        let mut records = self.records.write().await;
        if !records.contains_key(&record.identity) {
            warn!(identity = %record.identity, "update() on missing identity, inserting");
        }
        records.insert(record.identity, record);
    }

    pub async fn remove(&self, id: FileId) -> Option<FileRecord> {
        self.records.write().await.remove(&id)
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// History query: every record (live or REMOVED) that was ever discovered at
    /// this source path.
    pub async fn records_for_path(&self, path: &Path) -> Vec<FileRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// Drops terminal records (COMPLETED, COMPLETED_DELETE_FAILED, FAILED,
    /// REMOVED, SPACE_ERROR) whose terminal timestamp is older than `max_age`,
    /// per `SPEC_FULL.md` §3's "age-based sweep". Returns the count removed.
    pub async fn sweep_old_terminal_records(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut records = self.records.write().await;
        let stale: Vec<FileId> = records
            .values()
            .filter(|r| r.status.is_terminal())
            .filter(|r| terminal_at(r).map(|t| t < cutoff).unwrap_or(false))
            .map(|r| r.identity)
            .collect();
        for id in &stale {
            records.remove(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "swept aged-out terminal records");
        }
        stale.len()
    }
}

/// The timestamp a record entered its current terminal state, if any.
fn terminal_at(record: &FileRecord) -> Option<chrono::DateTime<Utc>> {
    record
        .completed_at
        .or(record.failed_at)
        .or(record.space_error_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn record(path: &str, size: u64) -> FileRecord {
        FileRecord::new_discovered(PathBuf::from(path), size, Utc::now())
    }

    #[tokio::test]
    async fn add_then_get() {
        let repo = FileRepository::new();
        let r = record("/src/a.mxf", 10);
        let id = r.identity;
        repo.add(r).await;
        assert!(repo.get_by_id(id).await.is_some());
        assert_eq!(repo.count().await, 1);
    }

    #[tokio::test]
    async fn add_rejects_duplicate_identity() {
        let repo = FileRepository::new();
        let r = record("/src/a.mxf", 10);
        let id = r.identity;
        repo.add(r.clone()).await;
        let mut dup = r;
        dup.size = 999;
        repo.add(dup).await;
        assert_eq!(repo.get_by_id(id).await.unwrap().size, 10);
    }

    #[tokio::test]
    async fn update_inserts_on_missing() {
        let repo = FileRepository::new();
        let r = record("/src/a.mxf", 10);
        let id = r.identity;
        repo.update(r).await;
        assert!(repo.get_by_id(id).await.is_some());
    }

    #[tokio::test]
    async fn records_for_path_returns_history() {
        let repo = FileRepository::new();
        let r1 = record("/src/x.mxf", 10);
        let r2 = record("/src/x.mxf", 20);
        repo.add(r1).await;
        repo.add(r2).await;
        assert_eq!(repo.records_for_path(Path::new("/src/x.mxf")).await.len(), 2);
    }

    #[tokio::test]
    async fn sweep_removes_only_aged_out_terminal_records() {
        use crate::model::FileStatus;

        let repo = FileRepository::new();

        let mut fresh = record("/src/fresh.mxf", 10);
        fresh.status = FileStatus::Completed;
        fresh.completed_at = Some(Utc::now());
        repo.add(fresh).await;

        let mut stale = record("/src/stale.mxf", 10);
        stale.status = FileStatus::Completed;
        stale.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
        let stale_id = stale.identity;
        repo.add(stale).await;

        let mut active = record("/src/active.mxf", 10);
        active.status = FileStatus::Copying;
        repo.add(active).await;

        let removed = repo.sweep_old_terminal_records(Duration::from_secs(3600 * 24)).await;
        assert_eq!(removed, 1);
        assert_eq!(repo.count().await, 2);
        assert!(repo.get_by_id(stale_id).await.is_none());
    }
}
