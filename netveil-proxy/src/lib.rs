//! Policy model and HTTP interception engine for the netveil filter

pub mod config;
pub mod error;
pub mod filter;
pub mod proxy;

// Re-export commonly used types
pub use config::{ConfigLoader, LoadedPolicy, PolicyConfiguration, PolicyStore, TimeRestrictionModel};
pub use error::{ProxyError, Result, ValidationError};
pub use filter::{CategoryEngine, UrlVerdict};
pub use proxy::{FilterCallbacks, ProxyEngine, ProxyServer, ProxyServerConfig, Session};
