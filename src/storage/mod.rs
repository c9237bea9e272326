pub mod checker;
pub mod monitor;

pub use checker::{StorageChecker, StorageInfo, StorageStatus};
pub use monitor::StorageMonitor;
