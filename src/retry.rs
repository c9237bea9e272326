//! Arms deferred retries for files blocked by temporary destination-space
//! shortages. See `SPEC_FULL.md` §4.7.

use crate::model::{FileId, FileStatus, FileUpdate, RetryInfo, RetryKind};
use crate::state_machine::StateMachine;
use crate::utils::errors::{AgentError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The result of a pre-copy (or mid-copy) space check.
#[derive(Debug, Clone, Copy)]
pub struct SpaceCheckResult {
    pub available_bytes: u64,
    pub required_bytes: u64,
}

impl SpaceCheckResult {
    pub fn has_space(&self) -> bool {
        self.available_bytes >= self.required_bytes
    }

    /// A shortage under 20% of what's required is "temporary" — short retry;
    /// otherwise a long retry.
    pub fn is_temporary_shortage(&self) -> bool {
        if self.available_bytes >= self.required_bytes {
            return true;
        }
        let shortage = self.required_bytes - self.available_bytes;
        (shortage as f64 / self.required_bytes as f64) < 0.20
    }
}

#[derive(Clone)]
pub struct SpaceRetryScheduler {
    state_machine: StateMachine,
    retry_delay: Duration,
    max_space_retries: u32,
    tasks: Arc<Mutex<HashMap<FileId, CancellationToken>>>,
}

impl SpaceRetryScheduler {
    pub fn new(state_machine: StateMachine, retry_delay: Duration, max_space_retries: u32) -> Self {
        Self {
            state_machine,
            retry_delay,
            max_space_retries,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handles insufficient destination space for `file_identity`: gives up to
    /// SPACE_ERROR after `max_space_retries`, else arms a short or long retry.
    pub async fn schedule_space_retry(
        &self,
        file_identity: FileId,
        retry_count: u32,
        check: SpaceCheckResult,
    ) -> Result<()> {
        let new_count = retry_count + 1;

        if new_count >= self.max_space_retries {
            self.state_machine
                .transition(
                    file_identity,
                    FileStatus::SpaceError,
                    FileUpdate {
                        retry_count: Some(new_count),
                        error_message: Some(Some(format!(
                            "giving up after {} space retries",
                            self.max_space_retries
                        ))),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let delay = if check.is_temporary_shortage() {
            self.retry_delay / 2
        } else {
            self.retry_delay
        };

        let now = Utc::now();
        let retry_info = RetryInfo {
            scheduled_at: now,
            fires_at: now + ChronoDuration::seconds(delay.as_secs() as i64),
            reason: format!(
                "waiting for {} more bytes of destination space",
                check.required_bytes.saturating_sub(check.available_bytes)
            ),
            kind: RetryKind::Space,
        };

        self.state_machine
            .transition(
                file_identity,
                FileStatus::WaitingForSpace,
                FileUpdate {
                    retry_count: Some(new_count),
                    error_message: Some(Some(retry_info.reason.clone())),
                    retry_info: Some(Some(retry_info)),
                    ..Default::default()
                },
            )
            .await?;

        self.schedule_retry(file_identity, delay).await;
        Ok(())
    }

    async fn schedule_retry(&self, file_identity: FileId, delay: Duration) {
        self.cancel_existing_unlocked(file_identity).await;

        let token = CancellationToken::new();
        self.tasks.lock().await.insert(file_identity, token.clone());

        let state_machine = self.state_machine.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    tasks.lock().await.remove(&file_identity);
                    if let Ok(Some(_)) = fire_retry(&state_machine, file_identity).await {
                        info!(%file_identity, "space retry fired, record returned to READY");
                    }
                }
                _ = token.cancelled() => {
                    // Superseded by a newer retry, or cancelled on shutdown; no transition.
                }
            }
        });
    }

    /// Cancels a pending retry for `file_identity`, if any. Returns whether one
    /// was cancelled.
    pub async fn cancel_retry(&self, file_identity: FileId) -> bool {
        self.cancel_existing_unlocked(file_identity).await
    }

    async fn cancel_existing_unlocked(&self, file_identity: FileId) -> bool {
        if let Some(token) = self.tasks.lock().await.remove(&file_identity) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, token) in tasks.drain() {
            token.cancel();
        }
    }
}

/// Re-checks the record is still WAITING_FOR_SPACE before clearing it — if the
/// status has diverged (cancelled or advanced elsewhere), this is a silent no-op.
async fn fire_retry(state_machine: &StateMachine, file_identity: FileId) -> Result<Option<()>> {
    match state_machine
        .transition(
            file_identity,
            FileStatus::Ready,
            FileUpdate {
                retry_info: Some(None),
                error_message: Some(None),
                ..Default::default()
            },
        )
        .await
    {
        Ok(_) => Ok(Some(())),
        Err(AgentError::InvalidTransition { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::model::FileRecord;
    use crate::repository::FileRepository;
    use chrono::Utc;
    use std::path::PathBuf;

    async fn setup(max_retries: u32, delay: Duration) -> (SpaceRetryScheduler, FileRepository, FileId) {
        let repo = FileRepository::new();
        let bus = EventBus::new();
        let sm = StateMachine::new(repo.clone(), bus);
        let mut record = FileRecord::new_discovered(PathBuf::from("/src/a.mxf"), 100, Utc::now());
        // Matches the real call site: `JobWorkerPool::handle_job` runs the
        // pre-copy space check while the record is still IN_QUEUE, before
        // status init to COPYING/GROWING_COPY.
        record.status = FileStatus::InQueue;
        let id = record.identity;
        repo.add(record).await;
        (SpaceRetryScheduler::new(sm, delay, max_retries), repo, id)
    }

    #[tokio::test]
    async fn zero_max_retries_gives_up_immediately() {
        let (scheduler, repo, id) = setup(0, Duration::from_secs(1)).await;
        let check = SpaceCheckResult {
            available_bytes: 10,
            required_bytes: 1000,
        };
        scheduler.schedule_space_retry(id, 0, check).await.unwrap();
        assert_eq!(repo.get_by_id(id).await.unwrap().status, FileStatus::SpaceError);
    }

    #[tokio::test]
    async fn short_retry_fires_and_returns_to_ready() {
        let (scheduler, repo, id) = setup(5, Duration::from_millis(40)).await;
        let check = SpaceCheckResult {
            available_bytes: 950,
            required_bytes: 1000, // 5% shortage: temporary, short retry
        };
        scheduler.schedule_space_retry(id, 0, check).await.unwrap();
        assert_eq!(repo.get_by_id(id).await.unwrap().status, FileStatus::WaitingForSpace);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(repo.get_by_id(id).await.unwrap().status, FileStatus::Ready);
    }

    #[tokio::test]
    async fn cancelling_a_retry_prevents_it_from_firing() {
        let (scheduler, repo, id) = setup(5, Duration::from_millis(60)).await;
        let check = SpaceCheckResult {
            available_bytes: 500,
            required_bytes: 1000, // 50% shortage: long retry
        };
        scheduler.schedule_space_retry(id, 0, check).await.unwrap();
        assert!(scheduler.cancel_retry(id).await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(repo.get_by_id(id).await.unwrap().status, FileStatus::WaitingForSpace);
    }

    #[test]
    fn temporary_shortage_threshold() {
        let small = SpaceCheckResult {
            available_bytes: 850,
            required_bytes: 1000,
        };
        assert!(small.is_temporary_shortage());

        let large = SpaceCheckResult {
            available_bytes: 500,
            required_bytes: 1000,
        };
        assert!(!large.is_temporary_shortage());
    }
}
