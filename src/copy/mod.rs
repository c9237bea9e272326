//! Streams a file from source to destination, handling files whose size is still
//! growing while being observed. See `SPEC_FULL.md` §4.4 for the full algorithm.

pub mod network_error;

use crate::config::{CopyConfig, GrowingFileConfig};
use crate::event_bus::EventBus;
use crate::model::{Event, FileId, FileStatus, FileUpdate, Progress};
use crate::state_machine::StateMachine;
use crate::utils::errors::{AgentError, Result};
use chrono::Utc;
use network_error::is_network_error;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

/// Tunable knobs the engine reads at the start of every copy. Static files run
/// with `safety_margin = 0`, `throttle_pause = 0` (set by the caller, see
/// [`CopyParams::for_record`]).
#[derive(Debug, Clone, Copy)]
pub struct CopyParams {
    pub chunk_size: usize,
    pub safety_margin: u64,
    pub poll_interval: Duration,
    pub throttle_pause: Duration,
    pub growth_timeout: Duration,
    pub min_growing_size: u64,
    pub io_timeout: Duration,
    pub use_temporary_file: bool,
}

impl CopyParams {
    pub fn for_record(copy: &CopyConfig, growing: &GrowingFileConfig, is_growing: bool) -> Self {
        if !is_growing {
            return Self {
                chunk_size: copy.chunk_size,
                safety_margin: 0,
                poll_interval: Duration::from_secs(growing.growing_file_poll_interval_seconds),
                throttle_pause: Duration::ZERO,
                growth_timeout: Duration::from_secs(growing.growing_file_growth_timeout_seconds),
                min_growing_size: 0,
                io_timeout: Duration::from_secs(copy.file_operation_timeout_seconds),
                use_temporary_file: copy.use_temporary_file,
            };
        }
        Self {
            chunk_size: copy.chunk_size,
            safety_margin: growing.growing_file_safety_margin_mb * 1024 * 1024,
            poll_interval: Duration::from_secs(growing.growing_file_poll_interval_seconds),
            throttle_pause: Duration::from_millis(growing.growing_copy_pause_ms),
            growth_timeout: Duration::from_secs(growing.growing_file_growth_timeout_seconds),
            min_growing_size: growing.growing_file_min_size_mb * 1024 * 1024,
            io_timeout: Duration::from_secs(copy.file_operation_timeout_seconds),
            use_temporary_file: copy.use_temporary_file,
        }
    }
}

/// What happened after a copy attempt, for the worker pool's finalization table
/// (`SPEC_FULL.md` §4.8).
pub enum CopyOutcome {
    Completed { bytes_copied: u64 },
    CompletedDeleteFailed { bytes_copied: u64, delete_error: String },
}

pub struct CopyEngine {
    state_machine: StateMachine,
    event_bus: EventBus,
}

impl CopyEngine {
    pub fn new(state_machine: StateMachine, event_bus: EventBus) -> Self {
        Self { state_machine, event_bus }
    }

    /// Copies `source` to `destination`, classifying and handling growth per
    /// `SPEC_FULL.md` §4.4. `is_growing` and `params` must already reflect the
    /// classification decided by the caller (see `FileRecord::is_growing`).
    pub async fn copy_file(
        &self,
        file_identity: FileId,
        source: &Path,
        destination: &Path,
        is_growing: bool,
        params: CopyParams,
    ) -> Result<CopyOutcome> {
        if is_growing {
            self.wait_for_minimum_size(file_identity, source, &params).await?;
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(classify_io_error(file_identity, "create_dir_all"))?;
        }

        let write_path: PathBuf = if params.use_temporary_file {
            with_tmp_suffix(destination)
        } else {
            destination.to_path_buf()
        };

        let bytes_copied = self
            .growing_copy_loop(file_identity, source, &write_path, is_growing, &params)
            .await?;

        if params.use_temporary_file {
            tokio::fs::rename(&write_path, destination)
                .await
                .map_err(classify_io_error(file_identity, "rename"))?;
        }

        self.verify_integrity(file_identity, source, destination, bytes_copied)
            .await?;

        Ok(self.delete_source_with_retry(file_identity, source, bytes_copied).await)
    }

    async fn wait_for_minimum_size(
        &self,
        file_identity: FileId,
        source: &Path,
        params: &CopyParams,
    ) -> Result<()> {
        loop {
            let metadata = timeout(params.io_timeout, tokio::fs::metadata(source))
                .await
                .map_err(|_| timeout_error(file_identity, "stat"))?
                .map_err(classify_io_error(file_identity, "stat"))?;
            if metadata.len() >= params.min_growing_size {
                return Ok(());
            }
            tokio::time::sleep(params.poll_interval).await;
        }
    }

    /// The central algorithm: copies in a loop, re-stat-ing the source to detect
    /// growth, keeping a safety margin between the copy head and the write head
    /// while the source is still growing.
    async fn growing_copy_loop(
        &self,
        file_identity: FileId,
        source: &Path,
        write_path: &Path,
        is_growing: bool,
        params: &CopyParams,
    ) -> Result<u64> {
        let mut dest_file = tokio::fs::File::create(write_path)
            .await
            .map_err(classify_io_error(file_identity, "open destination"))?;

        let mut bytes_copied: u64 = 0;
        let mut no_growth_cycles: u32 = 0;
        let mut file_finished_growing = !is_growing;
        let mut previous_size: u64 = 0;
        let start = Instant::now();
        let mut last_progress_publish = Instant::now() - Duration::from_secs(2);

        let max_no_growth_cycles = if params.poll_interval.is_zero() {
            0
        } else {
            (params.growth_timeout.as_secs_f64() / params.poll_interval.as_secs_f64()).ceil() as u32
        };

        loop {
            let metadata = timeout(params.io_timeout, tokio::fs::metadata(source))
                .await
                .map_err(|_| timeout_error(file_identity, "stat"))?
                .map_err(classify_io_error(file_identity, "stat"))?;
            let current_size = metadata.len();

            if !file_finished_growing {
                if current_size != previous_size {
                    no_growth_cycles = 0;
                } else {
                    no_growth_cycles += 1;
                }
                previous_size = current_size;
                if no_growth_cycles >= max_no_growth_cycles {
                    file_finished_growing = true;
                }
            }

            let safe_copy_to = if file_finished_growing {
                current_size
            } else {
                current_size.saturating_sub(params.safety_margin)
            };

            if safe_copy_to > bytes_copied {
                let distance = current_size.saturating_sub(bytes_copied);
                let pause = if distance > params.safety_margin * 2 {
                    Duration::ZERO
                } else {
                    params.throttle_pause
                };

                let status = if file_finished_growing {
                    FileStatus::Copying
                } else {
                    FileStatus::GrowingCopy
                };

                bytes_copied = self
                    .copy_chunk_range(
                        file_identity,
                        source,
                        &mut dest_file,
                        bytes_copied,
                        safe_copy_to,
                        status,
                        params,
                        start,
                        pause,
                        &mut last_progress_publish,
                    )
                    .await?;
            } else if !file_finished_growing {
                self.maybe_publish_zero_speed_progress(file_identity, bytes_copied, current_size, &mut last_progress_publish)
                    .await;
                tokio::time::sleep(params.poll_interval).await;
            }

            if file_finished_growing && bytes_copied >= current_size {
                dest_file
                    .flush()
                    .await
                    .map_err(classify_io_error(file_identity, "flush"))?;
                return Ok(bytes_copied);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_chunk_range(
        &self,
        file_identity: FileId,
        source: &Path,
        dest_file: &mut tokio::fs::File,
        from: u64,
        to: u64,
        status: FileStatus,
        params: &CopyParams,
        copy_start: Instant,
        pause: Duration,
        last_progress_publish: &mut Instant,
    ) -> Result<u64> {
        let mut src_file = timeout(params.io_timeout, tokio::fs::File::open(source))
            .await
            .map_err(|_| timeout_error(file_identity, "open source"))?
            .map_err(classify_io_error(file_identity, "open source"))?;
        src_file
            .seek(SeekFrom::Start(from))
            .await
            .map_err(classify_io_error(file_identity, "seek"))?;

        let mut position = from;
        let mut buffer = vec![0u8; params.chunk_size];

        while position < to {
            let want = std::cmp::min(params.chunk_size as u64, to - position) as usize;
            let read = timeout(params.io_timeout, src_file.read(&mut buffer[..want]))
                .await
                .map_err(|_| timeout_error(file_identity, "read"))?
                .map_err(classify_io_error(file_identity, "read"))?;
            if read == 0 {
                break;
            }

            timeout(params.io_timeout, dest_file.write_all(&buffer[..read]))
                .await
                .map_err(|_| timeout_error(file_identity, "write"))?
                .map_err(classify_io_error(file_identity, "write"))?;

            position += read as u64;

            self.maybe_publish_progress(file_identity, position, to, copy_start, last_progress_publish, status)
                .await;

            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        Ok(position)
    }

    /// At most one progress publish per second per file (`SPEC_FULL.md` §4.4).
    async fn maybe_publish_progress(
        &self,
        file_identity: FileId,
        bytes_copied: u64,
        total_bytes: u64,
        copy_start: Instant,
        last_publish: &mut Instant,
        status: FileStatus,
    ) {
        if last_publish.elapsed() < Duration::from_secs(1) {
            return;
        }
        *last_publish = Instant::now();

        let elapsed = copy_start.elapsed().as_secs_f64().max(0.001);
        let speed = bytes_copied as f64 / elapsed;
        let progress = Progress {
            bytes_copied,
            total_bytes,
            copy_speed_bytes_per_sec: speed,
        };

        let _ = self
            .state_machine
            .transition(file_identity, status, FileUpdate::with_progress(progress))
            .await;

        self.event_bus
            .publish(Event::FileCopyProgress {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                file_identity,
                progress,
            })
            .await;
    }

    async fn maybe_publish_zero_speed_progress(
        &self,
        file_identity: FileId,
        bytes_copied: u64,
        total_bytes: u64,
        last_publish: &mut Instant,
    ) {
        if last_publish.elapsed() < Duration::from_secs(1) {
            return;
        }
        *last_publish = Instant::now();
        self.event_bus
            .publish(Event::FileCopyProgress {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                file_identity,
                progress: Progress {
                    bytes_copied,
                    total_bytes,
                    copy_speed_bytes_per_sec: 0.0,
                },
            })
            .await;
    }

    async fn verify_integrity(
        &self,
        file_identity: FileId,
        source: &Path,
        destination: &Path,
        bytes_copied: u64,
    ) -> Result<()> {
        let source_size = tokio::fs::metadata(source)
            .await
            .map_err(classify_io_error(file_identity, "verify source"))?
            .len();
        let dest_size = tokio::fs::metadata(destination)
            .await
            .map_err(classify_io_error(file_identity, "verify destination"))?
            .len();

        if source_size != dest_size || dest_size != bytes_copied {
            let _ = tokio::fs::remove_file(destination).await;
            return Err(AgentError::IntegrityMismatch {
                identity: file_identity,
                source_size,
                dest_size,
            });
        }
        Ok(())
    }

    /// Deletes the source file with up to 3 attempts, 2s apart.
    async fn delete_source_with_retry(&self, file_identity: FileId, source: &Path, bytes_copied: u64) -> CopyOutcome {
        let mut last_error = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            match tokio::fs::remove_file(source).await {
                Ok(()) => {
                    info!(%file_identity, bytes_copied, "source deleted after copy");
                    return CopyOutcome::Completed { bytes_copied };
                }
                Err(e) => last_error = Some(e),
            }
        }
        let delete_error = last_error.map(|e| e.to_string()).unwrap_or_default();
        warn!(%file_identity, %delete_error, "failed to delete source after 3 attempts");
        CopyOutcome::CompletedDeleteFailed {
            bytes_copied,
            delete_error,
        }
    }
}

fn with_tmp_suffix(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".tmp");
    PathBuf::from(os_string)
}

fn timeout_error(identity: FileId, operation: &str) -> AgentError {
    AgentError::TimeoutError {
        identity,
        operation: operation.to_string(),
    }
}

/// Turns a raw `io::Error` into a classified `AgentError`. The
/// `NetworkErrorDetector` runs first, per `SPEC_FULL.md` §4.4/§6a — its errno
/// table includes `ENOENT`, so a source that vanished because a network mount
/// dropped is classified as `NetworkError`, not `FileNotFound`. Only once that
/// detector finds no match does a bare "not found" become `FileNotFound`;
/// anything else is propagated as a plain `Io` error for the worker to treat as
/// a hard failure.
fn classify_io_error(identity: FileId, operation: &str) -> impl Fn(std::io::Error) -> AgentError + '_ {
    move |error| {
        if is_network_error(&error) {
            return AgentError::NetworkError {
                identity,
                message: format!("{operation}: {error}"),
            };
        }
        if error.kind() == std::io::ErrorKind::NotFound {
            return AgentError::FileNotFound(format!("{operation}: {error}"));
        }
        AgentError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::model::FileRecord;
    use crate::repository::FileRepository;
    use chrono::Utc;
    use tempfile::TempDir;

    fn static_params() -> CopyParams {
        CopyParams {
            chunk_size: 1024,
            safety_margin: 0,
            poll_interval: Duration::from_millis(10),
            throttle_pause: Duration::ZERO,
            growth_timeout: Duration::from_millis(50),
            min_growing_size: 0,
            io_timeout: Duration::from_secs(5),
            use_temporary_file: true,
        }
    }

    async fn engine_with_record(dir: &TempDir, size: u64) -> (CopyEngine, FileId, PathBuf, PathBuf) {
        let repo = FileRepository::new();
        let bus = EventBus::new();
        let sm = StateMachine::new(repo.clone(), bus.clone());
        let source = dir.path().join("a.mxf");
        tokio::fs::write(&source, vec![7u8; size as usize]).await.unwrap();
        let mut record = FileRecord::new_discovered(source.clone(), size, Utc::now());
        record.status = FileStatus::Copying;
        let id = record.identity;
        repo.add(record).await;
        let destination = dir.path().join("out").join("a.mxf");
        (CopyEngine::new(sm, bus), id, source, destination)
    }

    #[tokio::test]
    async fn copies_static_file_and_deletes_source() {
        let dir = TempDir::new().unwrap();
        let (engine, id, source, destination) = engine_with_record(&dir, 10_000).await;
        let outcome = engine
            .copy_file(id, &source, &destination, false, static_params())
            .await
            .unwrap();
        match outcome {
            CopyOutcome::Completed { bytes_copied } => assert_eq!(bytes_copied, 10_000),
            _ => panic!("expected Completed"),
        }
        assert!(!source.exists());
        assert_eq!(tokio::fs::metadata(&destination).await.unwrap().len(), 10_000);
    }

    #[tokio::test]
    async fn empty_file_copies_cleanly() {
        let dir = TempDir::new().unwrap();
        let (engine, id, source, destination) = engine_with_record(&dir, 0).await;
        let outcome = engine
            .copy_file(id, &source, &destination, false, static_params())
            .await
            .unwrap();
        match outcome {
            CopyOutcome::Completed { bytes_copied } => assert_eq!(bytes_copied, 0),
            _ => panic!("expected Completed"),
        }
    }

    #[tokio::test]
    async fn vanished_source_is_classified_as_network_error_not_removed() {
        // ENOENT is in the NetworkErrorDetector's errno table (SPEC_FULL.md §6a), so a
        // source that disappears mid-copy surfaces as NetworkError, matching the
        // reference implementation, rather than the FileNotFound/REMOVED path.
        let dir = TempDir::new().unwrap();
        let (engine, id, source, destination) = engine_with_record(&dir, 10).await;
        tokio::fs::remove_file(&source).await.unwrap();

        let result = engine
            .copy_file(id, &source, &destination, false, static_params())
            .await;
        assert!(matches!(result, Err(AgentError::NetworkError { .. })));
    }
}
