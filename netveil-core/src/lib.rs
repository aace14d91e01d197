//! Decision components and state machines of the netveil filter
//!
//! Everything here is driven by [`service::FilterService`], which owns one
//! instance of each component and hands [`site_filter::SiteFiltering`] to the
//! proxy engine as its callbacks.

pub mod accountability;
pub mod auth;
pub mod block_page;
pub mod captive_portal;
pub mod certs;
pub mod classify;
pub mod dns;
pub mod error;
pub mod notify;
pub mod platform;
pub mod relaxed;
pub mod service;
pub mod settings;
pub mod site_filter;
pub mod time;
pub mod timer;
pub mod web_service;

#[cfg(test)]
mod testing;

pub use error::{ApiError, CoreError, Result, StorageError};
pub use notify::{IpcRequest, Notification, NotificationSink, Notifier};
pub use service::{FilterService, IpcReply, ServiceDeps};
pub use site_filter::SiteFiltering;
