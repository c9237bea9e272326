//! Configuration management for the transfer agent.
//!
//! Loads configuration from a TOML file; every tunable named in this module has a
//! serde default so a partial file (or none at all) still produces a usable agent.

use crate::template::TemplateRule;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub paths: PathConfig,
    pub copy: CopyConfig,
    pub growing_file: GrowingFileConfig,
    pub storage: StorageConfig,
    pub space_retry: SpaceRetryConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// Local HTTP/WebSocket port for the UI boundary.
    #[serde(default = "default_port")]
    pub port: u16,

    /// How often the scanner re-walks the source directory.
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub source_directory: PathBuf,
    pub destination_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    #[serde(default = "default_max_concurrent_copies")]
    pub max_concurrent_copies: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_true")]
    pub use_temporary_file: bool,

    #[serde(default = "default_file_stable_time_seconds")]
    pub file_stable_time_seconds: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_file_operation_timeout_seconds")]
    pub file_operation_timeout_seconds: u64,

    #[serde(default = "default_keep_completed_files_hours")]
    pub keep_completed_files_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowingFileConfig {
    #[serde(default = "default_true")]
    pub enable_growing_file_support: bool,

    #[serde(default = "default_growing_file_min_size_mb")]
    pub growing_file_min_size_mb: u64,

    #[serde(default = "default_growing_file_safety_margin_mb")]
    pub growing_file_safety_margin_mb: u64,

    #[serde(default = "default_growing_file_poll_interval_seconds")]
    pub growing_file_poll_interval_seconds: u64,

    #[serde(default = "default_growing_copy_pause_ms")]
    pub growing_copy_pause_ms: u64,

    #[serde(default = "default_growing_file_growth_timeout_seconds")]
    pub growing_file_growth_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_check_interval_seconds")]
    pub storage_check_interval_seconds: u64,

    #[serde(default = "default_warning_threshold_gb")]
    pub source_warning_threshold_gb: f64,
    #[serde(default = "default_critical_threshold_gb")]
    pub source_critical_threshold_gb: f64,
    #[serde(default = "default_warning_threshold_gb")]
    pub destination_warning_threshold_gb: f64,
    #[serde(default = "default_critical_threshold_gb")]
    pub destination_critical_threshold_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceRetryConfig {
    #[serde(default = "default_true")]
    pub enable_pre_copy_space_check: bool,

    #[serde(default = "default_space_retry_delay_seconds")]
    pub space_retry_delay_seconds: u64,

    #[serde(default = "default_max_space_retries")]
    pub max_space_retries: u32,
}

/// Output-folder rule table for the template engine. See `SPEC_FULL.md` §6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub rules: Vec<TemplateRule>,
    #[serde(default = "default_category")]
    pub default_category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_agent_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "transfer-agent-01".to_string())
}

fn default_port() -> u16 {
    9990
}

fn default_scan_interval_seconds() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_copies() -> usize {
    4
}

fn default_chunk_size() -> usize {
    4 * 1024 * 1024
}

fn default_file_stable_time_seconds() -> u64 {
    5
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_file_operation_timeout_seconds() -> u64 {
    30
}

fn default_keep_completed_files_hours() -> u64 {
    24
}

fn default_growing_file_min_size_mb() -> u64 {
    10
}

fn default_growing_file_safety_margin_mb() -> u64 {
    5
}

fn default_growing_file_poll_interval_seconds() -> u64 {
    2
}

fn default_growing_copy_pause_ms() -> u64 {
    250
}

fn default_growing_file_growth_timeout_seconds() -> u64 {
    30
}

fn default_storage_check_interval_seconds() -> u64 {
    30
}

fn default_warning_threshold_gb() -> f64 {
    50.0
}

fn default_critical_threshold_gb() -> f64 {
    10.0
}

fn default_space_retry_delay_seconds() -> u64 {
    60
}

fn default_max_space_retries() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_category() -> String {
    "unsorted".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// A usable default configuration for local testing; `source_directory` and
    /// `destination_directory` still need to be overridden for any real deployment.
    pub fn default_with_paths(source: PathBuf, destination: PathBuf) -> Self {
        Config {
            agent: AgentConfig {
                id: default_agent_id(),
                port: default_port(),
                scan_interval_seconds: default_scan_interval_seconds(),
            },
            paths: PathConfig {
                source_directory: source,
                destination_directory: destination,
            },
            copy: CopyConfig {
                max_concurrent_copies: default_max_concurrent_copies(),
                chunk_size: default_chunk_size(),
                use_temporary_file: true,
                file_stable_time_seconds: default_file_stable_time_seconds(),
                max_retry_attempts: default_max_retry_attempts(),
                file_operation_timeout_seconds: default_file_operation_timeout_seconds(),
                keep_completed_files_hours: default_keep_completed_files_hours(),
            },
            growing_file: GrowingFileConfig {
                enable_growing_file_support: true,
                growing_file_min_size_mb: default_growing_file_min_size_mb(),
                growing_file_safety_margin_mb: default_growing_file_safety_margin_mb(),
                growing_file_poll_interval_seconds: default_growing_file_poll_interval_seconds(),
                growing_copy_pause_ms: default_growing_copy_pause_ms(),
                growing_file_growth_timeout_seconds: default_growing_file_growth_timeout_seconds(),
            },
            storage: StorageConfig {
                storage_check_interval_seconds: default_storage_check_interval_seconds(),
                source_warning_threshold_gb: default_warning_threshold_gb(),
                source_critical_threshold_gb: default_critical_threshold_gb(),
                destination_warning_threshold_gb: default_warning_threshold_gb(),
                destination_critical_threshold_gb: default_critical_threshold_gb(),
            },
            space_retry: SpaceRetryConfig {
                enable_pre_copy_space_check: true,
                space_retry_delay_seconds: default_space_retry_delay_seconds(),
                max_space_retries: default_max_space_retries(),
            },
            template: TemplateConfig {
                rules: Vec::new(),
                default_category: default_category(),
            },
            log: LogConfig {
                level: default_log_level(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml_str = r#"
            [agent]
            id = "agent-1"

            [paths]
            source_directory = "/src"
            destination_directory = "/dst"

            [copy]
            [growing_file]
            [storage]
            [space_retry]
            [log]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.id, "agent-1");
        assert_eq!(config.copy.max_concurrent_copies, default_max_concurrent_copies());
        assert!(config.growing_file.enable_growing_file_support);
        assert_eq!(config.template.default_category, "unsorted");
        assert!(config.template.rules.is_empty());
    }

    #[test]
    fn parses_template_rules() {
        let toml_str = r#"
            [agent]
            [paths]
            source_directory = "/src"
            destination_directory = "/dst"

            [copy]
            [growing_file]
            [storage]
            [space_retry]
            [template]
            default_category = "misc"

            [[template.rules]]
            pattern = "*.mxf"
            folder_template = "video/{date}"
            priority = 1

            [log]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.template.rules.len(), 1);
        assert_eq!(config.template.rules[0].pattern, "*.mxf");
        assert!(!config.template.rules[0].is_regex);
    }
}
