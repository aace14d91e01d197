//! Error types for proxy and policy operations

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Group not found: {group}")]
    GroupNotFound { group: String },

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Built-in policy is malformed: {0}")]
    BuiltinPolicy(String),

    #[error("Proxy engine is already running")]
    AlreadyRunning,

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Cycle detected in group references: {path}")]
    CycleDetected { path: String },

    #[error("Unknown group reference: {group}")]
    UnknownGroup { group: String },

    #[error("Invalid CIDR notation: {cidr}")]
    InvalidCidr { cidr: String },

    #[error("Invalid wildcard pattern: {pattern}")]
    InvalidPattern { pattern: String },

    #[error("Duplicate category id {id}: {first} and {second}")]
    DuplicateCategoryId { id: u32, first: String, second: String },

    #[error("Invalid time restriction for {day}: {reason}")]
    InvalidTimeRestriction { day: String, reason: String },

    #[error("Invalid DNS server address: {address}")]
    InvalidDnsServer { address: String },
}
