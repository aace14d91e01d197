//! Management-server credentials

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::warn;

/// Bearer token for the management API and the re-authentication flag.
///
/// While re-authentication is pending the filter lets traffic through so the
/// user can reach the sign-in flow.
#[derive(Debug, Default)]
pub struct AuthenticationStorage {
    token: RwLock<Option<String>>,
    reauth_required: AtomicBool,
}

impl AuthenticationStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let storage = Self::new();
        storage.set_token(Some(token.into()));
        storage
    }

    pub fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Store a new token; a fresh token clears any pending re-authentication
    pub fn set_token(&self, token: Option<String>) {
        let fresh = token.is_some();
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
        if fresh {
            self.reauth_required.store(false, Ordering::SeqCst);
        }
    }

    pub fn require_reauthentication(&self) {
        if !self.reauth_required.swap(true, Ordering::SeqCst) {
            warn!("Management server rejected credentials, re-authentication required");
        }
    }

    pub fn is_reauthentication_required(&self) -> bool {
        self.reauth_required.load(Ordering::SeqCst)
    }
}
