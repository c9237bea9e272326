//! Consumes [`QueueJob`]s from the [`JobQueue`] and drives each one through the
//! [`CopyEngine`], applying the finalization table from `SPEC_FULL.md` §4.8.

use crate::config::{CopyConfig, GrowingFileConfig};
use crate::copy::{CopyEngine, CopyOutcome, CopyParams};
use crate::event_bus::EventBus;
use crate::model::{Event, FileStatus, FileUpdate, QueueJob};
use crate::queue::JobQueue;
use crate::repository::FileRepository;
use crate::retry::{SpaceCheckResult, SpaceRetryScheduler};
use crate::state_machine::StateMachine;
use crate::storage::{StorageChecker, StorageMonitor};
use crate::template::TemplateEngine;
use crate::utils::errors::AgentError;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_CONFLICT_SUFFIX: u32 = 9999;

pub struct JobWorkerPool {
    worker_count: usize,
    job_queue: JobQueue,
    repository: FileRepository,
    state_machine: StateMachine,
    copy_engine: Arc<CopyEngine>,
    storage_monitor: Arc<StorageMonitor>,
    storage_checker: StorageChecker,
    space_retry: SpaceRetryScheduler,
    template_engine: Arc<dyn TemplateEngine>,
    destination_root: PathBuf,
    copy_config: CopyConfig,
    growing_config: GrowingFileConfig,
    enable_pre_copy_space_check: bool,
    event_bus: EventBus,
}

impl JobWorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_count: usize,
        job_queue: JobQueue,
        repository: FileRepository,
        state_machine: StateMachine,
        copy_engine: Arc<CopyEngine>,
        storage_monitor: Arc<StorageMonitor>,
        space_retry: SpaceRetryScheduler,
        template_engine: Arc<dyn TemplateEngine>,
        destination_root: PathBuf,
        copy_config: CopyConfig,
        growing_config: GrowingFileConfig,
        enable_pre_copy_space_check: bool,
        event_bus: EventBus,
    ) -> Self {
        Self {
            worker_count,
            job_queue,
            repository,
            state_machine,
            copy_engine,
            storage_monitor,
            storage_checker: StorageChecker::new(),
            space_retry,
            template_engine,
            destination_root,
            copy_config,
            growing_config,
            enable_pre_copy_space_check,
            event_bus,
        }
    }

    /// Runs `worker_count` independent loops until `shutdown` is cancelled,
    /// then waits for every in-flight job to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut set = tokio::task::JoinSet::new();
        for worker_id in 0..self.worker_count {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move { pool.worker_loop(worker_id, shutdown).await });
        }
        while set.join_next().await.is_some() {}
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                info!(worker_id, "worker shutting down");
                return;
            }

            let job = tokio::select! {
                job = self.job_queue.pop_timeout() => job,
                _ = shutdown.cancelled() => {
                    info!(worker_id, "worker shutting down");
                    return;
                }
            };

            if let Some(job) = job {
                self.handle_job(worker_id, job).await;
            }
        }
    }

    async fn handle_job(&self, worker_id: usize, job: QueueJob) {
        let Some(record) = self.repository.get_by_id(job.file_identity).await else {
            warn!(worker_id, file_identity = %job.file_identity, "job for unknown record, dropping");
            return;
        };
        if record.status != FileStatus::InQueue {
            // Diverged since enqueue (e.g. removed, or already claimed) — skip silently.
            return;
        }

        if !self.storage_monitor.destination_is_available().await {
            // IN_QUEUE only allows READY as an escape (`SPEC_FULL.md` §4.1) — not
            // WAITING_FOR_NETWORK directly. Bouncing to READY re-enters the
            // `EventHandlers::on_status_changed` path, which republishes
            // FILE_READY and lets `on_ready`'s own destination check decide
            // between re-queueing and WAITING_FOR_NETWORK.
            let _ = self
                .state_machine
                .transition(
                    job.file_identity,
                    FileStatus::Ready,
                    FileUpdate::with_error("destination unavailable at dequeue"),
                )
                .await;
            return;
        }

        if self.enable_pre_copy_space_check {
            match self.check_space(&job).await {
                Ok(check) if !check.has_space() => {
                    let _ = self
                        .space_retry
                        .schedule_space_retry(job.file_identity, record.retry_count, check)
                        .await;
                    return;
                }
                Err(error) => {
                    warn!(worker_id, file_identity = %job.file_identity, %error, "space check failed, proceeding anyway");
                }
                _ => {}
            }
        }

        let destination = match self.resolve_destination_path(&job).await {
            Ok(path) => path,
            Err(error) => {
                error!(worker_id, file_identity = %job.file_identity, %error, "could not resolve destination path");
                let _ = self
                    .state_machine
                    .transition(job.file_identity, FileStatus::Failed, FileUpdate::with_error(error))
                    .await;
                return;
            }
        };

        let is_growing = job.is_growing_at_enqueue;
        let start_status = if is_growing { FileStatus::GrowingCopy } else { FileStatus::Copying };
        if self
            .state_machine
            .transition(
                job.file_identity,
                start_status,
                FileUpdate {
                    destination_path: Some(Some(destination.clone())),
                    ..Default::default()
                },
            )
            .await
            .is_err()
        {
            return;
        }
        self.event_bus
            .publish(Event::FileCopyStarted {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                file_identity: job.file_identity,
            })
            .await;

        let params = CopyParams::for_record(&self.copy_config, &self.growing_config, is_growing);
        let outcome = self
            .copy_engine
            .copy_file(job.file_identity, &job.path, &destination, is_growing, params)
            .await;

        self.finalize(worker_id, &job, record.retry_count, outcome).await;
    }

    async fn check_space(&self, job: &QueueJob) -> Result<SpaceCheckResult, AgentError> {
        let info = self
            .storage_checker
            .check_path(&self.destination_root, 0.0, 0.0)
            .await;
        Ok(SpaceCheckResult {
            available_bytes: info.free_bytes,
            required_bytes: job.size,
        })
    }

    /// Builds `<destination_root>/<template output>`, appending `_N` before the
    /// extension on a name collision, up to `MAX_CONFLICT_SUFFIX` attempts.
    async fn resolve_destination_path(&self, job: &QueueJob) -> Result<PathBuf, String> {
        let filename = job
            .path
            .file_name()
            .ok_or_else(|| format!("source path has no filename: {}", job.path.display()))?
            .to_string_lossy()
            .to_string();

        let subfolder = self.template_engine.generate_output_path(&filename, chrono::Utc::now());
        let target_dir = self.destination_root.join(subfolder);
        let mut candidate = target_dir.join(&filename);

        let mut suffix = 0u32;
        while tokio::fs::metadata(&candidate).await.is_ok() {
            suffix += 1;
            if suffix > MAX_CONFLICT_SUFFIX {
                return Err(format!("exhausted conflict suffixes for {filename}"));
            }
            candidate = target_dir.join(conflict_name(&filename, suffix));
        }
        Ok(candidate)
    }

    async fn finalize(
        &self,
        worker_id: usize,
        job: &QueueJob,
        retry_count: u32,
        outcome: Result<CopyOutcome, AgentError>,
    ) {
        let file_identity = job.file_identity;
        match outcome {
            Ok(CopyOutcome::Completed { bytes_copied }) => {
                info!(worker_id, %file_identity, bytes_copied, "copy completed");
                let _ = self
                    .state_machine
                    .transition(file_identity, FileStatus::Completed, FileUpdate::default())
                    .await;
                self.event_bus
                    .publish(Event::FileCopyCompleted {
                        event_id: Uuid::new_v4(),
                        timestamp: Utc::now(),
                        file_identity,
                        bytes_copied,
                    })
                    .await;
            }
            Ok(CopyOutcome::CompletedDeleteFailed { bytes_copied, delete_error }) => {
                warn!(worker_id, %file_identity, bytes_copied, %delete_error, "copy completed, source delete failed");
                let _ = self
                    .state_machine
                    .transition(
                        file_identity,
                        FileStatus::CompletedDeleteFailed,
                        FileUpdate::with_error(delete_error),
                    )
                    .await;
            }
            Err(AgentError::NetworkError { message, .. }) => {
                warn!(worker_id, %file_identity, %message, "network error during copy, will retry on recovery");
                let _ = self
                    .state_machine
                    .transition(file_identity, FileStatus::WaitingForNetwork, FileUpdate::with_error(message.clone()))
                    .await;
                self.event_bus
                    .publish(Event::NetworkFailureDetected {
                        event_id: Uuid::new_v4(),
                        timestamp: Utc::now(),
                        file_identity,
                        reason: message,
                    })
                    .await;
            }
            Err(AgentError::FileNotFound(message)) => {
                warn!(worker_id, %file_identity, %message, "source vanished mid-copy");
                let _ = self
                    .state_machine
                    .transition(file_identity, FileStatus::Removed, FileUpdate::with_error(message.clone()))
                    .await;
                self.event_bus
                    .publish(Event::FileCopyFailed {
                        event_id: Uuid::new_v4(),
                        timestamp: Utc::now(),
                        file_identity,
                        reason: message,
                    })
                    .await;
            }
            Err(error) => {
                let new_count = retry_count + 1;
                let message = error.to_string();
                if new_count < self.copy_config.max_retry_attempts {
                    warn!(worker_id, %file_identity, %message, attempt = new_count, "copy failed, will retry");
                    let _ = self
                        .state_machine
                        .transition(
                            file_identity,
                            FileStatus::Ready,
                            FileUpdate {
                                retry_count: Some(new_count),
                                error_message: Some(Some(message)),
                                ..Default::default()
                            },
                        )
                        .await;
                } else {
                    error!(worker_id, %file_identity, %message, attempts = new_count, "copy failed, giving up");
                    let _ = self
                        .state_machine
                        .transition(
                            file_identity,
                            FileStatus::Failed,
                            FileUpdate {
                                retry_count: Some(new_count),
                                error_message: Some(Some(message.clone())),
                                ..Default::default()
                            },
                        )
                        .await;
                    self.event_bus
                        .publish(Event::FileCopyFailed {
                            event_id: Uuid::new_v4(),
                            timestamp: Utc::now(),
                            file_identity,
                            reason: message,
                        })
                        .await;
                }
            }
        }
    }
}

fn conflict_name(filename: &str, suffix: u32) -> String {
    // Split on the *first* dot so `archive.tar.gz` keeps its full extension
    // sequence (`archive_1.tar.gz`), not just the last one.
    match filename.split_once('.') {
        Some((base, extensions)) => format!("{base}_{suffix}.{extensions}"),
        None => format!("{filename}_{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CopyConfig, GrowingFileConfig, StorageConfig};
    use crate::copy::CopyEngine;
    use crate::event_bus::EventBus;
    use crate::model::FileRecord;
    use crate::retry::SpaceRetryScheduler;
    use crate::template::RuleBasedTemplateEngine;
    use crate::ui::UiState;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn copy_config() -> CopyConfig {
        CopyConfig {
            max_concurrent_copies: 2,
            chunk_size: 1024,
            use_temporary_file: true,
            file_stable_time_seconds: 1,
            max_retry_attempts: 3,
            file_operation_timeout_seconds: 5,
            keep_completed_files_hours: 24,
        }
    }

    fn growing_config() -> GrowingFileConfig {
        GrowingFileConfig {
            enable_growing_file_support: true,
            growing_file_min_size_mb: 0,
            growing_file_safety_margin_mb: 0,
            growing_file_poll_interval_seconds: 1,
            growing_copy_pause_ms: 0,
            growing_file_growth_timeout_seconds: 1,
        }
    }

    fn generous_storage() -> StorageConfig {
        StorageConfig {
            storage_check_interval_seconds: 3600,
            source_warning_threshold_gb: 0.0,
            source_critical_threshold_gb: 0.0,
            destination_warning_threshold_gb: 0.0,
            destination_critical_threshold_gb: 0.0,
        }
    }

    async fn build_pool(source_dir: &TempDir, dest_dir: &TempDir) -> (Arc<JobWorkerPool>, FileRepository, uuid::Uuid, PathBuf) {
        let repo = FileRepository::new();
        let bus = EventBus::new();
        let sm = StateMachine::new(repo.clone(), bus.clone());

        let source_path = source_dir.path().join("clip.mxf");
        tokio::fs::write(&source_path, vec![1u8; 1024]).await.unwrap();

        let mut record = FileRecord::new_discovered(source_path.clone(), 1024, Utc::now());
        record.status = FileStatus::InQueue;
        let id = record.identity;
        repo.add(record).await;

        let ui = UiState::new();
        let monitor = Arc::new(StorageMonitor::new(
            source_dir.path().to_path_buf(),
            dest_dir.path().to_path_buf(),
            generous_storage(),
            repo.clone(),
            sm.clone(),
            ui,
        ));
        monitor.check_all().await;

        let space_retry = SpaceRetryScheduler::new(sm.clone(), Duration::from_secs(60), 5);
        let engine = Arc::new(CopyEngine::new(sm.clone(), bus.clone()));
        let template = Arc::new(RuleBasedTemplateEngine::new(vec![], ""));

        let pool = Arc::new(JobWorkerPool::new(
            1,
            JobQueue::new(),
            repo.clone(),
            sm,
            engine,
            monitor,
            space_retry,
            template,
            dest_dir.path().to_path_buf(),
            copy_config(),
            growing_config(),
            false,
            bus,
        ));

        (pool, repo, id, source_path)
    }

    #[tokio::test]
    async fn completes_a_queued_static_file() {
        let source_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();
        let (pool, repo, id, source_path) = build_pool(&source_dir, &dest_dir).await;

        let job = QueueJob {
            file_identity: id,
            path: source_path.clone(),
            size: 1024,
            creation_time: Utc::now(),
            is_growing_at_enqueue: false,
            enqueued_at: Utc::now(),
            retry_count: 0,
        };
        pool.handle_job(0, job).await;

        assert_eq!(repo.get_by_id(id).await.unwrap().status, FileStatus::Completed);
        assert!(!source_path.exists());
    }

    #[test]
    fn conflict_name_preserves_extension() {
        assert_eq!(conflict_name("clip.mxf", 1), "clip_1.mxf");
        assert_eq!(conflict_name("noext", 2), "noext_2");
        assert_eq!(conflict_name("archive.tar.gz", 1), "archive_1.tar.gz");
    }
}
