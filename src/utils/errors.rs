//! Crate-wide error type. Every fallible domain operation returns `Result<T, AgentError>`;
//! `main` and other top-level task entry points wrap it in `anyhow::Result` for narration.

use crate::model::{FileId, FileStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid transition for {identity}: {from:?} -> {to:?}")]
    InvalidTransition {
        identity: FileId,
        from: FileStatus,
        to: FileStatus,
    },

    #[error("no record with identity {0}")]
    NotFound(FileId),

    #[error("network error on {identity}: {message}")]
    NetworkError { identity: FileId, message: String },

    #[error("source file not found: {0}")]
    FileNotFound(String),

    #[error("timed out waiting on I/O for {identity}: {operation}")]
    TimeoutError { identity: FileId, operation: String },

    #[error(
        "integrity mismatch for {identity}: source {source_size} bytes, destination {dest_size} bytes"
    )]
    IntegrityMismatch {
        identity: FileId,
        source_size: u64,
        dest_size: u64,
    },

    #[error("insufficient space: need {required} bytes, {available} available")]
    SpaceShortage { required: u64, available: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
