//! Periodic health/space check of source and destination.
//! See `SPEC_FULL.md` §4.6.

use super::checker::{StorageChecker, StorageInfo, StorageStatus};
use crate::config::StorageConfig;
use crate::queue::JobQueue;
use crate::repository::FileRepository;
use crate::state_machine::StateMachine;
use crate::ui::{UiEvent, UiState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StorageSide {
    Source,
    Destination,
}

pub struct StorageMonitor {
    source_path: PathBuf,
    destination_path: PathBuf,
    config: StorageConfig,
    checker: StorageChecker,
    repository: FileRepository,
    state_machine: StateMachine,
    ui_state: UiState,
    source_info: Arc<RwLock<Option<StorageInfo>>>,
    destination_info: Arc<RwLock<Option<StorageInfo>>>,
}

impl StorageMonitor {
    pub fn new(
        source_path: PathBuf,
        destination_path: PathBuf,
        config: StorageConfig,
        repository: FileRepository,
        state_machine: StateMachine,
        ui_state: UiState,
    ) -> Self {
        Self {
            source_path,
            destination_path,
            config,
            checker: StorageChecker::new(),
            repository,
            state_machine,
            ui_state,
            source_info: Arc::new(RwLock::new(None)),
            destination_info: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn destination_is_available(&self) -> bool {
        matches!(
            self.destination_info.read().await.as_ref().map(|i| i.status),
            Some(StorageStatus::Ok) | Some(StorageStatus::Warning) | None
        )
    }

    /// Current known state of both sides, for the UI boundary's `initial_state`
    /// event (`SPEC_FULL.md` §6). Empty entries are omitted rather than
    /// fabricated before the first check has run.
    pub async fn snapshot(&self) -> Vec<StorageInfo> {
        let mut out = Vec::with_capacity(2);
        if let Some(info) = self.source_info.read().await.clone() {
            out.push(info);
        }
        if let Some(info) = self.destination_info.read().await.clone() {
            out.push(info);
        }
        out
    }

    pub async fn overall_status(&self) -> StorageStatus {
        let source = self.source_info.read().await.as_ref().map(|i| i.status).unwrap_or(StorageStatus::Ok);
        let destination = self
            .destination_info
            .read()
            .await
            .as_ref()
            .map(|i| i.status)
            .unwrap_or(StorageStatus::Ok);
        source.worse_of(destination)
    }

    /// Runs the periodic check loop until `shutdown` is cancelled. Performs an
    /// immediate check before the first sleep.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.checker.cleanup_old_test_files(&self.source_path).await;
        self.checker.cleanup_old_test_files(&self.destination_path).await;

        loop {
            self.check_all().await;

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.config.storage_check_interval_seconds)) => {}
                _ = shutdown.cancelled() => {
                    info!("storage monitor shutting down");
                    return;
                }
            }
        }
    }

    pub async fn check_all(&self) {
        self.check_single(StorageSide::Source).await;
        self.check_single(StorageSide::Destination).await;
    }

    async fn check_single(&self, side: StorageSide) {
        let (path, warning, critical, cell) = match side {
            StorageSide::Source => (
                &self.source_path,
                self.config.source_warning_threshold_gb,
                self.config.source_critical_threshold_gb,
                &self.source_info,
            ),
            StorageSide::Destination => (
                &self.destination_path,
                self.config.destination_warning_threshold_gb,
                self.config.destination_critical_threshold_gb,
                &self.destination_info,
            ),
        };

        self.checker.cleanup_old_test_files(path).await;
        let new_info = self.checker.check_path(path, warning, critical).await;

        let old_status = cell.read().await.as_ref().map(|i| i.status);
        *cell.write().await = Some(new_info.clone());

        if old_status != Some(new_info.status) {
            self.ui_state.broadcast(UiEvent::StorageUpdate {
                side: side_label(side),
                old_status,
                new_status: new_info.status,
                info: new_info.clone(),
            });

            let is_recovery = side == StorageSide::Destination
                && !matches!(old_status, Some(StorageStatus::Ok) | Some(StorageStatus::Warning) | None)
                && matches!(new_info.status, StorageStatus::Ok | StorageStatus::Warning);

            if is_recovery {
                let recovered =
                    JobQueue::process_waiting_network_files(&self.repository, &self.state_machine).await;
                info!(recovered, "destination recovered, rediscovering waiting files");
            }
        }
    }
}

fn side_label(side: StorageSide) -> &'static str {
    match side {
        StorageSide::Source => "source",
        StorageSide::Destination => "destination",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use tempfile::TempDir;

    fn generous_config() -> StorageConfig {
        StorageConfig {
            storage_check_interval_seconds: 3600,
            source_warning_threshold_gb: 0.0,
            source_critical_threshold_gb: 0.0,
            destination_warning_threshold_gb: 0.0,
            destination_critical_threshold_gb: 0.0,
        }
    }

    #[tokio::test]
    async fn healthy_dirs_report_ok_overall() {
        let source = TempDir::new().unwrap();
        let destination = TempDir::new().unwrap();
        let repo = FileRepository::new();
        let bus = EventBus::new();
        let sm = StateMachine::new(repo.clone(), bus);
        let ui = UiState::new();

        let monitor = StorageMonitor::new(
            source.path().to_path_buf(),
            destination.path().to_path_buf(),
            generous_config(),
            repo,
            sm,
            ui,
        );
        monitor.check_all().await;
        assert_eq!(monitor.overall_status().await, StorageStatus::Ok);
        assert!(monitor.destination_is_available().await);
    }

    #[tokio::test]
    async fn missing_destination_is_unavailable() {
        let source = TempDir::new().unwrap();
        let repo = FileRepository::new();
        let bus = EventBus::new();
        let sm = StateMachine::new(repo.clone(), bus);
        let ui = UiState::new();

        let monitor = StorageMonitor::new(
            source.path().to_path_buf(),
            PathBuf::from("/nonexistent/destination/xyz"),
            generous_config(),
            repo,
            sm,
            ui,
        );
        monitor.check_all().await;
        assert!(!monitor.destination_is_available().await);
    }
}
