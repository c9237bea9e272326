//! The file-transfer domain model: records, statuses, events, and queue jobs.
//!
//! `FileRecord` is the only entity workers, the copy engine, and the UI boundary all
//! ultimately read. It is never mutated directly outside `state_machine` — see
//! [`crate::state_machine::StateMachine`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque, never-reused identity for one file instance.
pub type FileId = Uuid;

/// All statuses a [`FileRecord`] can occupy.
///
/// Transitions between these are validated centrally — see
/// [`crate::state_machine::ALLOWED_TRANSITIONS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Discovered,
    Ready,
    Growing,
    ReadyToStartGrowing,
    InQueue,
    Copying,
    GrowingCopy,
    WaitingForNetwork,
    WaitingForSpace,
    Failed,
    SpaceError,
    Completed,
    CompletedDeleteFailed,
    Removed,
}

impl FileStatus {
    /// Terminal statuses never advance on their own; only rediscovery or a manual
    /// retry moves them forward again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileStatus::Completed
                | FileStatus::CompletedDeleteFailed
                | FileStatus::Failed
                | FileStatus::Removed
                | FileStatus::SpaceError
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, FileStatus::Copying | FileStatus::GrowingCopy)
    }
}

/// Copy progress, valid only while `status` is COPYING or GROWING_COPY.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub bytes_copied: u64,
    pub total_bytes: u64,
    pub copy_speed_bytes_per_sec: f64,
}

/// Why/when a deferred retry is scheduled for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    Space,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryInfo {
    pub scheduled_at: DateTime<Utc>,
    pub fires_at: DateTime<Utc>,
    pub reason: String,
    pub kind: RetryKind,
}

/// The central entity. See `SPEC_FULL.md` §3 for the full field-by-field contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub identity: FileId,
    pub path: PathBuf,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub status: FileStatus,

    pub discovered_at: DateTime<Utc>,
    pub started_copying_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub space_error_at: Option<DateTime<Utc>>,

    pub progress: Progress,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub destination_path: Option<PathBuf>,

    // Growth bookkeeping — see CopyEngine classification, SPEC_FULL.md §4.4.
    pub first_seen_size: u64,
    pub previous_size: u64,
    pub growth_stable_since: Option<DateTime<Utc>>,
    pub growth_rate: f64,

    pub retry_info: Option<RetryInfo>,
}

impl FileRecord {
    /// A freshly-discovered record, as the scanner's `add_file` would produce it.
    pub fn new_discovered(path: PathBuf, size: u64, mtime: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            identity: Uuid::new_v4(),
            path,
            size,
            mtime,
            status: FileStatus::Discovered,
            discovered_at: now,
            started_copying_at: None,
            completed_at: None,
            failed_at: None,
            space_error_at: None,
            progress: Progress::default(),
            retry_count: 0,
            error_message: None,
            destination_path: None,
            first_seen_size: size,
            previous_size: size,
            growth_stable_since: Some(now),
            growth_rate: 0.0,
            retry_info: None,
        }
    }

    /// The growing/static classification from SPEC_FULL.md §4.4.
    pub fn is_growing(&self) -> bool {
        let in_growing_states = matches!(
            self.status,
            FileStatus::Growing | FileStatus::ReadyToStartGrowing | FileStatus::GrowingCopy
        );
        if in_growing_states || self.growth_rate > 0.0 {
            return true;
        }
        let threshold = (self.first_seen_size as f64 * 0.10).max(1024.0 * 1024.0);
        (self.size as f64 - self.first_seen_size as f64) > threshold
    }
}

/// An explicit, enumerated set of fields a `StateMachine::transition` call may write.
/// `None` leaves the field untouched; only fields named here are ever mutated by a
/// transition, per the redesign flag in `SPEC_FULL.md` §9.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub error_message: Option<Option<String>>,
    pub progress: Option<Progress>,
    pub retry_count: Option<u32>,
    pub destination_path: Option<Option<PathBuf>>,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
    pub first_seen_size: Option<u64>,
    pub previous_size: Option<u64>,
    pub growth_stable_since: Option<Option<DateTime<Utc>>>,
    pub growth_rate: Option<f64>,
    pub retry_info: Option<Option<RetryInfo>>,
    pub started_copying_at: Option<DateTime<Utc>>,
}

impl FileUpdate {
    pub fn with_error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn with_progress(progress: Progress) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }
}

/// Domain events published on `FileStatusChanged` and friends — the full set from
/// `SPEC_FULL.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    FileDiscovered {
        event_id: Uuid,
        timestamp: DateTime<Utc>,
        file_identity: FileId,
    },
    FileStatusChanged {
        event_id: Uuid,
        timestamp: DateTime<Utc>,
        file_identity: FileId,
        old_status: FileStatus,
        new_status: FileStatus,
        record: FileRecord,
    },
    FileReady {
        event_id: Uuid,
        timestamp: DateTime<Utc>,
        file_identity: FileId,
    },
    FileCopyStarted {
        event_id: Uuid,
        timestamp: DateTime<Utc>,
        file_identity: FileId,
    },
    FileCopyProgress {
        event_id: Uuid,
        timestamp: DateTime<Utc>,
        file_identity: FileId,
        progress: Progress,
    },
    FileCopyCompleted {
        event_id: Uuid,
        timestamp: DateTime<Utc>,
        file_identity: FileId,
        bytes_copied: u64,
    },
    FileCopyFailed {
        event_id: Uuid,
        timestamp: DateTime<Utc>,
        file_identity: FileId,
        reason: String,
    },
    NetworkFailureDetected {
        event_id: Uuid,
        timestamp: DateTime<Utc>,
        file_identity: FileId,
        reason: String,
    },
}

impl Event {
    pub fn file_identity(&self) -> FileId {
        match self {
            Event::FileDiscovered { file_identity, .. }
            | Event::FileStatusChanged { file_identity, .. }
            | Event::FileReady { file_identity, .. }
            | Event::FileCopyStarted { file_identity, .. }
            | Event::FileCopyProgress { file_identity, .. }
            | Event::FileCopyCompleted { file_identity, .. }
            | Event::FileCopyFailed { file_identity, .. }
            | Event::NetworkFailureDetected { file_identity, .. } => *file_identity,
        }
    }

    /// A stable discriminant used to key `EventBus` subscriptions.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FileDiscovered { .. } => EventKind::FileDiscovered,
            Event::FileStatusChanged { .. } => EventKind::FileStatusChanged,
            Event::FileReady { .. } => EventKind::FileReady,
            Event::FileCopyStarted { .. } => EventKind::FileCopyStarted,
            Event::FileCopyProgress { .. } => EventKind::FileCopyProgress,
            Event::FileCopyCompleted { .. } => EventKind::FileCopyCompleted,
            Event::FileCopyFailed { .. } => EventKind::FileCopyFailed,
            Event::NetworkFailureDetected { .. } => EventKind::NetworkFailureDetected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FileDiscovered,
    FileStatusChanged,
    FileReady,
    FileCopyStarted,
    FileCopyProgress,
    FileCopyCompleted,
    FileCopyFailed,
    NetworkFailureDetected,
}

/// An immutable snapshot handed to the `JobQueue`; does not change once enqueued.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub file_identity: FileId,
    pub path: PathBuf,
    pub size: u64,
    pub creation_time: DateTime<Utc>,
    pub is_growing_at_enqueue: bool,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growing_classification_by_status() {
        let mut record = FileRecord::new_discovered(PathBuf::from("/src/a.mxf"), 100, Utc::now());
        record.status = FileStatus::Growing;
        assert!(record.is_growing());
    }

    #[test]
    fn growing_classification_by_size_delta() {
        let mut record = FileRecord::new_discovered(PathBuf::from("/src/a.mxf"), 100, Utc::now());
        record.first_seen_size = 100;
        record.size = 100 + 2 * 1024 * 1024; // exceeds the 1 MiB floor
        assert!(record.is_growing());
    }

    #[test]
    fn static_file_is_not_growing() {
        let record = FileRecord::new_discovered(PathBuf::from("/src/a.mxf"), 1_000_000, Utc::now());
        assert!(!record.is_growing());
    }
}
