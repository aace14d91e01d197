//! Atomically swapped policy snapshot shared by every decision path

use super::schema::PolicyConfiguration;
use super::validator::ConfigValidator;
use crate::error::Result;
use crate::filter::CategoryEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A validated policy together with its compiled rules
#[derive(Debug)]
pub struct LoadedPolicy {
    pub config: PolicyConfiguration,
    pub engine: CategoryEngine,
}

impl LoadedPolicy {
    pub fn compile(config: PolicyConfiguration) -> Result<Self> {
        ConfigValidator::validate(&config)?;
        let engine = CategoryEngine::from_config(&config)?;
        Ok(Self { config, engine })
    }

    /// Whether `host` is the management API itself
    pub fn is_management_host(&self, host: &str) -> bool {
        self.config
            .service
            .management_host
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(host.trim_end_matches('.')))
    }
}

/// Holder for the current policy.
///
/// Readers take a cheap `Arc` snapshot; a reload compiles the new policy
/// before taking the write lock, so the swap is all-or-nothing. The relaxed
/// policy flag lives here rather than in the snapshot so it survives reloads.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: RwLock<Option<Arc<LoadedPolicy>>>,
    bypass_enabled: AtomicBool,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current policy, or `None` when nothing has been loaded yet
    pub fn snapshot(&self) -> Option<Arc<LoadedPolicy>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Validate, compile and swap in a new policy. On error the previous
    /// policy stays in place.
    pub fn replace(&self, config: PolicyConfiguration) -> Result<Arc<LoadedPolicy>> {
        let loaded = Arc::new(LoadedPolicy::compile(config)?);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(loaded.clone());
        tracing::info!("Policy reloaded");
        Ok(loaded)
    }

    pub fn clear(&self) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }

    pub fn set_bypass_enabled(&self, enabled: bool) {
        self.bypass_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_bypass_enabled(&self) -> bool {
        self.bypass_enabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{Category, RuleGroup};

    fn policy_with_group(group: &str) -> PolicyConfiguration {
        let mut config = PolicyConfiguration::default();
        config.categories.insert(
            "adult".to_string(),
            Category {
                id: 4,
                description: String::new(),
                kind: Default::default(),
                relaxable: false,
                groups: vec![group.to_string()],
                triggers: vec![],
            },
        );
        config
    }

    #[test]
    fn test_empty_store() {
        let store = PolicyStore::new();
        assert!(store.snapshot().is_none());
        assert!(!store.is_loaded());
    }

    #[test]
    fn test_failed_reload_keeps_previous() {
        let store = PolicyStore::new();
        let mut good = policy_with_group("adult");
        good.groups.insert("adult".to_string(), RuleGroup::default());
        good.service.management_host = Some("manage.example.com".to_string());
        store.replace(good).unwrap();

        let bad = policy_with_group("missing");
        assert!(store.replace(bad).is_err());

        let current = store.snapshot().unwrap();
        assert!(current.is_management_host("MANAGE.example.com"));
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let store = PolicyStore::new();
        store.replace(PolicyConfiguration::default()).unwrap();
        let old = store.snapshot().unwrap();

        let mut next = PolicyConfiguration::default();
        next.service.device_name = Some("den".to_string());
        store.replace(next).unwrap();

        assert!(old.config.service.device_name.is_none());
        assert_eq!(
            store.snapshot().unwrap().config.service.device_name.as_deref(),
            Some("den")
        );
    }

    #[test]
    fn test_bypass_flag_outlives_reload() {
        let store = PolicyStore::new();
        store.set_bypass_enabled(true);
        store.replace(PolicyConfiguration::default()).unwrap();
        assert!(store.is_bypass_enabled());
    }
}
