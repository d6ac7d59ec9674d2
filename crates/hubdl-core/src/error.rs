//! Error types for hubdl core

use hubdl_types::InvalidTransition;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in hubdl core
#[derive(Debug, Error)]
pub enum HubdlError {
    #[error("Target directory already exists and is not empty: {}", path.display())]
    DuplicateTarget { path: PathBuf },

    #[error("Failed to fetch repository metadata: {0}")]
    MetadataFetch(#[from] MetadataError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Worker process crashed: {0}")]
    WorkerCrash(String),

    #[error("Verification failed: {corrupted} files corrupted, {missing} files missing")]
    Verification { corrupted: usize, missing: usize },

    #[error("Accelerator dispatch failed: {0}")]
    AcceleratorDispatch(String),

    #[error("Accelerator error: {0}")]
    AcceleratorJob(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Another hubdl process is using {}", path.display())]
    DataDirBusy { path: PathBuf },

    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl HubdlError {
    /// Check if retrying the same task is likely to help
    pub fn is_retryable(&self) -> bool {
        match self {
            HubdlError::Network(_)
            | HubdlError::Transfer(_)
            | HubdlError::WorkerCrash(_)
            | HubdlError::Verification { .. }
            | HubdlError::AcceleratorJob(_) => true,
            HubdlError::MetadataFetch(e) => e.is_retryable(),
            HubdlError::AcceleratorDispatch(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for HubdlError {
    fn from(error: serde_json::Error) -> Self {
        HubdlError::Serialization(error.to_string())
    }
}

impl From<AcceleratorError> for HubdlError {
    fn from(error: AcceleratorError) -> Self {
        HubdlError::AcceleratorDispatch(error.to_string())
    }
}

impl From<HubdlError> for String {
    fn from(error: HubdlError) -> Self {
        error.to_string()
    }
}

/// Failures while listing a repository
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(
        "Repository {repo} is gated or private and cannot be fetched through the mirror {endpoint}. \
         Accept its terms on {official_url} and switch to the official endpoint"
    )]
    GatedOnMirror {
        repo: String,
        endpoint: String,
        official_url: String,
    },

    #[error("Repository not found or access denied: {0}")]
    NotFound(String),

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl MetadataError {
    pub fn is_retryable(&self) -> bool {
        match self {
            MetadataError::Network(_) => true,
            MetadataError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Failures during the bulk transfer
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server returned {status} for {file}")]
    Status { file: String, status: u16 },

    #[error("Transfer cancelled")]
    Cancelled,
}

/// Failures talking to the accelerator daemon
#[derive(Debug, Error)]
pub enum AcceleratorError {
    #[error("RPC request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Unexpected RPC response: {0}")]
    Response(String),

    #[error("Failed to start accelerator daemon: {0}")]
    Spawn(String),
}
