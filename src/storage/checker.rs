//! Accessibility, write-access, and free-space checks for one storage path.
//! See `SPEC_FULL.md` §4.6 and §6.

use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

pub const PROBE_FILE_PREFIX: &str = ".storage_test_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageStatus {
    Ok,
    Warning,
    Critical,
    Error,
}

impl StorageStatus {
    /// Worst-first ranking used when reducing source+destination status to one
    /// overall value (`SPEC_FULL.md` §4.6).
    fn rank(self) -> u8 {
        match self {
            StorageStatus::Error => 3,
            StorageStatus::Critical => 2,
            StorageStatus::Warning => 1,
            StorageStatus::Ok => 0,
        }
    }

    pub fn worse_of(self, other: Self) -> Self {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub path: String,
    pub is_accessible: bool,
    pub has_write_access: bool,
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub status: StorageStatus,
    pub error_message: Option<String>,
}

pub struct StorageChecker;

impl StorageChecker {
    pub fn new() -> Self {
        Self
    }

    pub async fn check_path(&self, path: &Path, warning_threshold_gb: f64, critical_threshold_gb: f64) -> StorageInfo {
        let path_str = path.to_string_lossy().to_string();

        let accessible = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);

        if !accessible {
            return StorageInfo {
                path: path_str,
                is_accessible: false,
                has_write_access: false,
                free_bytes: 0,
                total_bytes: 0,
                status: StorageStatus::Error,
                error_message: Some("path is not accessible".to_string()),
            };
        }

        let has_write_access = self.check_write_access(path).await;
        let (free_bytes, total_bytes) = disk_usage(path);

        let free_gb = free_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let status = if !has_write_access {
            StorageStatus::Critical
        } else if free_gb < critical_threshold_gb {
            StorageStatus::Critical
        } else if free_gb < warning_threshold_gb {
            StorageStatus::Warning
        } else {
            StorageStatus::Ok
        };

        StorageInfo {
            path: path_str,
            is_accessible: true,
            has_write_access,
            free_bytes,
            total_bytes,
            status,
            error_message: None,
        }
    }

    async fn check_write_access(&self, dir: &Path) -> bool {
        let probe = dir.join(format!("{PROBE_FILE_PREFIX}{}.tmp", Uuid::new_v4().simple()));
        match tokio::fs::write(&probe, b"storage_write_test").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                true
            }
            Err(_) => false,
        }
    }

    /// Removes any leftover probe file — necessary because a crash mid-probe
    /// would otherwise leave artifacts on a network volume.
    pub async fn cleanup_old_test_files(&self, dir: &Path) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(PROBE_FILE_PREFIX) && name.ends_with(".tmp") {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

impl Default for StorageChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn disk_usage(path: &Path) -> (u64, u64) {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = match CString::new(path.as_os_str().to_string_lossy().as_bytes()) {
        Ok(c_path) => c_path,
        Err(_) => return (0, 0),
    };
    unsafe {
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        if libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) != 0 {
            return (0, 0);
        }
        let stat = stat.assume_init();
        let block_size = stat.f_frsize as u64;
        let free = stat.f_bavail as u64 * block_size;
        let total = stat.f_blocks as u64 * block_size;
        (free, total)
    }
}

#[cfg(not(unix))]
fn disk_usage(_path: &Path) -> (u64, u64) {
    (0, 0)
}
