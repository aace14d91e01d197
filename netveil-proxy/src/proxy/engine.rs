//! Contract between the interception engine and the filtering pipeline

use super::session::Session;
use crate::error::Result;
use async_trait::async_trait;

/// Hooks invoked by the proxy engine for every transaction.
///
/// Implementations must not panic and must not block indefinitely; they run on
/// the engine's connection tasks.
#[async_trait]
pub trait FilterCallbacks: Send + Sync {
    /// Called before the request is forwarded. Returns `true` when a custom
    /// response was set and the transaction must short-circuit.
    async fn before_request(&self, session: &mut Session) -> bool;

    /// Whether responses of this lowercased `Content-Type` essence are
    /// inspected. Other bodies are streamed through without buffering.
    fn inspects_content_type(&self, _content_type: &str) -> bool {
        true
    }

    /// Called after the upstream response arrived, before it is returned.
    /// The session holds the buffered body only for inspected content types.
    async fn before_response(&self, session: &mut Session);

    /// The request URL matched block categories. Returns the category that
    /// was enforced, if any.
    fn blacklisted(&self, session: &mut Session, categories: &[u32]) -> Option<u32>;

    /// The request URL matched allow categories
    fn whitelisted(&self, session: &mut Session, categories: &[u32]) -> Option<u32>;
}

/// Lifecycle of an interception engine
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Bind and begin serving; returns once the engine is accepting
    async fn start(&self) -> Result<()>;

    fn stop(&self);

    fn is_running(&self) -> bool;
}
