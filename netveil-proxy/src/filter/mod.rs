//! Category and content filtering logic

pub mod matcher;
pub mod policy;
pub mod triggers;

pub use matcher::{HostMatch, HostMatcher};
pub use policy::{CategoryEngine, CategoryInfo, UrlVerdict};
pub use triggers::{TriggerMatch, TriggerMatcher};
