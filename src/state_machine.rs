//! Sole mutator of [`FileRecord::status`]. See `SPEC_FULL.md` §4.1.

use crate::event_bus::EventBus;
use crate::model::{Event, FileId, FileRecord, FileStatus, FileUpdate};
use crate::repository::FileRepository;
use crate::utils::errors::{AgentError, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// The allowed-transitions table from `SPEC_FULL.md` §4.1, plus the edges its
/// own component sections require that the §4.9 summary diagram collapses
/// away:
/// - a pre-copy space check runs while still IN_QUEUE (before status init to
///   COPYING/GROWING_COPY, per §4.8's own ordering), so WAITING_FOR_SPACE and
///   a prep-failure FAILED must both be reachable from IN_QUEUE; giving up
///   after `max_space_retries` on that same pre-copy check
///   (`SpaceRetryScheduler::schedule_space_retry`) transitions straight from
///   IN_QUEUE to SPACE_ERROR without passing through WAITING_FOR_SPACE at all,
///   so SPACE_ERROR must be reachable from IN_QUEUE too;
/// - a retryable (non-network, non-missing-source) copy failure returns the
///   record to READY from whichever of COPYING/GROWING_COPY it was in, for
///   the next `max_retry_attempts` pass;
/// - `RepositoryScanner::cleanup_missing` marks REMOVED any non-terminal,
///   non-in-flight record whose source vanished — every status that predicate
///   can select (DISCOVERED, GROWING, READY_TO_START_GROWING, READY, IN_QUEUE,
///   WAITING_FOR_NETWORK, WAITING_FOR_SPACE) must allow REMOVED as a target;
///   `JobWorkerPool::finalize`'s own source-vanished-mid-copy arm does the same
///   straight from COPYING/GROWING_COPY, so those need REMOVED too.
pub fn allowed_transitions(from: FileStatus) -> &'static [FileStatus] {
    use FileStatus::*;
    match from {
        Discovered => &[Ready, Growing, Removed],
        Growing => &[ReadyToStartGrowing, Removed],
        ReadyToStartGrowing => &[InQueue, Removed],
        Ready => &[InQueue, WaitingForNetwork, Removed],
        InQueue => &[Copying, GrowingCopy, Ready, WaitingForSpace, Failed, Removed, SpaceError],
        Copying => &[Completed, CompletedDeleteFailed, Failed, WaitingForNetwork, Ready, Removed],
        // A growing copy whose tail drain finishes between progress-throttle
        // ticks can reach `finalize` without ever having recorded the
        // Copying-status flip `copy::growing_copy_loop` makes once growth
        // stops, so GROWING_COPY needs the same finalization targets as
        // COPYING, not just a path through it.
        GrowingCopy => &[Copying, Completed, CompletedDeleteFailed, Failed, WaitingForNetwork, Ready, Removed],
        WaitingForNetwork => &[Ready, Discovered, Removed],
        WaitingForSpace => &[Ready, Removed],
        Failed => &[Ready, Discovered],
        SpaceError => &[Ready],
        Completed | CompletedDeleteFailed | Removed => &[Discovered],
    }
}

/// Serializes all status transitions behind one lock, per `SPEC_FULL.md` §5.
#[derive(Clone)]
pub struct StateMachine {
    repository: FileRepository,
    event_bus: EventBus,
    lock: Arc<Mutex<()>>,
}

impl StateMachine {
    pub fn new(repository: FileRepository, event_bus: EventBus) -> Self {
        Self {
            repository,
            event_bus,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Validates and applies a status transition, persists the result, and
    /// schedules (without awaiting) publication of a `FileStatusChanged` event.
    pub async fn transition(
        &self,
        file_identity: FileId,
        new_status: FileStatus,
        updates: FileUpdate,
    ) -> Result<FileRecord> {
        let _guard = self.lock.lock().await;

        let mut record = self
            .repository
            .get_by_id(file_identity)
            .await
            .ok_or(AgentError::NotFound(file_identity))?;

        let old_status = record.status;
        if new_status == old_status {
            apply_updates(&mut record, &updates);
            self.repository.update(record.clone()).await;
            return Ok(record);
        }

        if !allowed_transitions(old_status).contains(&new_status) {
            return Err(AgentError::InvalidTransition {
                identity: file_identity,
                from: old_status,
                to: new_status,
            });
        }

        record.status = new_status;
        record.error_message = None;
        apply_updates(&mut record, &updates);

        let now = Utc::now();
        match new_status {
            FileStatus::Completed | FileStatus::CompletedDeleteFailed => record.completed_at = Some(now),
            FileStatus::Failed | FileStatus::Removed => record.failed_at = Some(now),
            FileStatus::SpaceError => record.space_error_at = Some(now),
            FileStatus::Copying | FileStatus::GrowingCopy
                if record.started_copying_at.is_none() =>
            {
                record.started_copying_at = Some(now);
            }
            _ => {}
        }

        self.repository.update(record.clone()).await;

        let event = Event::FileStatusChanged {
            event_id: Uuid::new_v4(),
            timestamp: now,
            file_identity,
            old_status,
            new_status,
            record: record.clone(),
        };

        // Publication happens outside the lock (dropped when this scope ends) so a
        // slow subscriber cannot stall the next transition. Spawning rather than
        // awaiting here would let this call return before the guard is dropped, so
        // instead we drop the guard explicitly and then spawn.
        drop(_guard);
        let event_bus = self.event_bus.clone();
        tokio::spawn(async move {
            event_bus.publish(event).await;
        });

        Ok(record)
    }
}

fn apply_updates(record: &mut FileRecord, updates: &FileUpdate) {
    if let Some(message) = &updates.error_message {
        record.error_message = message.clone();
    }
    if let Some(progress) = updates.progress {
        record.progress = progress;
    }
    if let Some(count) = updates.retry_count {
        record.retry_count = count;
    }
    if let Some(dest) = &updates.destination_path {
        record.destination_path = dest.clone();
    }
    if let Some(size) = updates.size {
        record.size = size;
    }
    if let Some(mtime) = updates.mtime {
        record.mtime = mtime;
    }
    if let Some(size) = updates.first_seen_size {
        record.first_seen_size = size;
    }
    if let Some(size) = updates.previous_size {
        record.previous_size = size;
    }
    if let Some(since) = &updates.growth_stable_since {
        record.growth_stable_since = *since;
    }
    if let Some(rate) = updates.growth_rate {
        record.growth_rate = rate;
    }
    if let Some(info) = &updates.retry_info {
        record.retry_info = info.clone();
    }
    if let Some(started) = updates.started_copying_at {
        record.started_copying_at = Some(started);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    async fn setup() -> (StateMachine, FileRepository, FileId) {
        let repo = FileRepository::new();
        let bus = EventBus::new();
        let sm = StateMachine::new(repo.clone(), bus);
        let record = FileRecord::new_discovered(PathBuf::from("/src/a.mxf"), 100, Utc::now());
        let id = record.identity;
        repo.add(record).await;
        (sm, repo, id)
    }

    #[tokio::test]
    async fn valid_transition_updates_status() {
        let (sm, repo, id) = setup().await;
        sm.transition(id, FileStatus::Ready, FileUpdate::default()).await.unwrap();
        assert_eq!(repo.get_by_id(id).await.unwrap().status, FileStatus::Ready);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let (sm, _repo, id) = setup().await;
        let result = sm.transition(id, FileStatus::Completed, FileUpdate::default()).await;
        assert!(matches!(result, Err(AgentError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn same_status_is_idempotent_no_op() {
        let (sm, repo, id) = setup().await;
        let before = repo.get_by_id(id).await.unwrap();
        let after = sm
            .transition(id, FileStatus::Discovered, FileUpdate::default())
            .await
            .unwrap();
        assert_eq!(before.status, after.status);
    }

    #[tokio::test]
    async fn unknown_identity_is_not_found() {
        let (sm, _repo, _id) = setup().await;
        let result = sm
            .transition(Uuid::new_v4(), FileStatus::Ready, FileUpdate::default())
            .await;
        assert!(matches!(result, Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn terminal_transition_sets_completed_at() {
        let (sm, repo, id) = setup().await;
        sm.transition(id, FileStatus::Ready, FileUpdate::default()).await.unwrap();
        sm.transition(id, FileStatus::InQueue, FileUpdate::default()).await.unwrap();
        sm.transition(id, FileStatus::Copying, FileUpdate::default()).await.unwrap();
        sm.transition(id, FileStatus::Completed, FileUpdate::default()).await.unwrap();
        assert!(repo.get_by_id(id).await.unwrap().completed_at.is_some());
    }

    #[tokio::test]
    async fn error_message_cleared_unless_resupplied() {
        let (sm, repo, id) = setup().await;
        sm.transition(id, FileStatus::Ready, FileUpdate::with_error("boom"))
            .await
            .unwrap();
        assert_eq!(
            repo.get_by_id(id).await.unwrap().error_message.as_deref(),
            Some("boom")
        );
        sm.transition(id, FileStatus::InQueue, FileUpdate::default())
            .await
            .unwrap();
        assert!(repo.get_by_id(id).await.unwrap().error_message.is_none());
    }
}
