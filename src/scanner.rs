//! Scanner external interface: supplies currently-visible source paths.
//! See `SPEC_FULL.md` §6. Scanning *policy* (which directories to exclude, how
//! often to run) is external to this crate; the reference walker below exists
//! so the rest of the crate is runnable and testable end-to-end.

use crate::event_bus::EventBus;
use crate::model::{Event, FileRecord, FileStatus, FileUpdate};
use crate::repository::FileRepository;
use crate::state_machine::StateMachine;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[async_trait]
pub trait Scanner: Send + Sync {
    /// Idempotent: returns the existing active record for `path` if one exists,
    /// otherwise creates and returns a new DISCOVERED record.
    async fn add_file(&self, path: PathBuf, size: u64, mtime: DateTime<Utc>) -> FileRecord;

    /// Transitions every non-terminal, non-in-flight record whose path is not in
    /// `existing_paths` to REMOVED. Returns the count removed.
    async fn cleanup_missing(&self, existing_paths: &HashSet<PathBuf>) -> usize;
}

pub struct RepositoryScanner {
    repository: FileRepository,
    state_machine: StateMachine,
    event_bus: EventBus,
}

impl RepositoryScanner {
    pub fn new(repository: FileRepository, state_machine: StateMachine, event_bus: EventBus) -> Self {
        Self { repository, state_machine, event_bus }
    }

    async fn find_active_record(&self, path: &Path) -> Option<FileRecord> {
        self.repository
            .records_for_path(path)
            .await
            .into_iter()
            .find(|r| r.status != FileStatus::Removed)
    }
}

#[async_trait]
impl Scanner for RepositoryScanner {
    async fn add_file(&self, path: PathBuf, size: u64, mtime: DateTime<Utc>) -> FileRecord {
        if let Some(existing) = self.find_active_record(&path).await {
            return existing;
        }
        let record = FileRecord::new_discovered(path, size, mtime);
        self.repository.add(record.clone()).await;
        self.event_bus
            .publish(Event::FileDiscovered {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                file_identity: record.identity,
            })
            .await;
        record
    }

    async fn cleanup_missing(&self, existing_paths: &HashSet<PathBuf>) -> usize {
        let mut removed = 0;
        for record in self.repository.get_all().await {
            if existing_paths.contains(&record.path) {
                continue;
            }
            if record.status.is_terminal() || record.status.is_in_flight() {
                continue;
            }
            if self
                .state_machine
                .transition(record.identity, FileStatus::Removed, FileUpdate::default())
                .await
                .is_ok()
            {
                removed += 1;
            }
        }
        removed
    }
}

/// Walks `root` recursively and reports every regular file found, skipping the
/// usual noise (`.git`, `node_modules`, `.DS_Store`) — the same default
/// exclude-list shape the reference agent's own directory walker uses.
pub struct DirectoryWalker {
    pub exclude_patterns: Vec<String>,
}

impl Default for DirectoryWalker {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                ".DS_Store".to_string(),
            ],
        }
    }
}

impl DirectoryWalker {
    fn should_exclude(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.exclude_patterns.iter().any(|p| path_str.contains(p.as_str()))
    }

    pub fn walk(&self, root: &Path) -> Vec<(PathBuf, u64, DateTime<Utc>)> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if self.should_exclude(path) {
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    let mtime: DateTime<Utc> = metadata
                        .modified()
                        .map(DateTime::from)
                        .unwrap_or_else(|_| Utc::now());
                    out.push((path.to_path_buf(), metadata.len(), mtime));
                }
            }
        }
        out
    }
}

/// Drives one scan pass: walks `root`, calls `add_file` for everything found,
/// then `cleanup_missing` for everything not found. Intended as the default
/// runnable loop; callers may substitute a different `Scanner` entirely.
pub async fn scan_once(walker: &DirectoryWalker, scanner: &dyn Scanner, root: &Path) -> (usize, usize) {
    let found = walker.walk(root);
    let mut existing_paths = HashSet::new();
    for (path, size, mtime) in &found {
        existing_paths.insert(path.clone());
        scanner.add_file(path.clone(), *size, *mtime).await;
    }
    let removed = scanner.cleanup_missing(&existing_paths).await;
    (found.len(), removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use tempfile::TempDir;

    fn build_scanner() -> (RepositoryScanner, FileRepository) {
        let repo = FileRepository::new();
        let bus = EventBus::new();
        let sm = StateMachine::new(repo.clone(), bus.clone());
        (RepositoryScanner::new(repo.clone(), sm, bus), repo)
    }

    #[tokio::test]
    async fn add_file_is_idempotent_while_active() {
        let (scanner, _repo) = build_scanner();
        let path = PathBuf::from("/src/a.mxf");
        let r1 = scanner.add_file(path.clone(), 100, Utc::now()).await;
        let r2 = scanner.add_file(path.clone(), 100, Utc::now()).await;
        assert_eq!(r1.identity, r2.identity);
    }

    #[tokio::test]
    async fn cleanup_missing_removes_absent_discovered_files() {
        let (scanner, repo) = build_scanner();
        let path = PathBuf::from("/src/a.mxf");
        let record = scanner.add_file(path.clone(), 100, Utc::now()).await;

        let removed = scanner.cleanup_missing(&HashSet::new()).await;
        assert_eq!(removed, 1);
        assert_eq!(
            repo.get_by_id(record.identity).await.unwrap().status,
            FileStatus::Removed
        );
    }

    #[tokio::test]
    async fn cleanup_missing_preserves_in_flight_files() {
        let (scanner, repo) = build_scanner();
        let path = PathBuf::from("/src/a.mxf");
        let record = scanner.add_file(path.clone(), 100, Utc::now()).await;
        let mut in_flight = record.clone();
        in_flight.status = FileStatus::Copying;
        repo.update(in_flight).await;

        let removed = scanner.cleanup_missing(&HashSet::new()).await;
        assert_eq!(removed, 0);
    }

    #[test]
    fn walker_finds_files_and_skips_excluded() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.mxf"), b"data").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("config"), b"x").unwrap();

        let walker = DirectoryWalker::default();
        let found = walker.walk(dir.path());
        assert_eq!(found.len(), 1);
        assert!(found[0].0.ends_with("keep.mxf"));
    }
}
