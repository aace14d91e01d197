//! Error types for the filtering service

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Policy error: {0}")]
    Policy(#[from] netveil_proxy::ProxyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote API error: {0}")]
    Api(#[from] ApiError),

    #[error("Platform operation failed: {0}")]
    Platform(String),

    #[error("Failed to read settings {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    SettingsParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the local SQLite store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    Poisoned,
}

/// Failures talking to the management server
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint not found")]
    NotFound,

    #[error("Authentication required")]
    Unauthorized,

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Management server is not configured")]
    NotConfigured,

    #[error("Failed to decode response: {0}")]
    Decode(String),
}
