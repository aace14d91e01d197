//! Configuration file loading and merging

use super::schema::PolicyConfiguration;
use crate::error::{ProxyError, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Built-in policy parsed once on first access
static BUILTIN_POLICY: LazyLock<std::result::Result<PolicyConfiguration, String>> =
    LazyLock::new(|| {
        toml::from_str(include_str!("../builtin-policy.toml")).map_err(|e| e.to_string())
    });

pub struct ConfigLoader;

impl ConfigLoader {
    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        // Priority order:
        // 1. $NETVEIL_CONFIG
        // 2. $XDG_CONFIG_HOME/netveil/policy.toml
        // 3. ~/.config/netveil/policy.toml

        if let Ok(path) = env::var("NETVEIL_CONFIG") {
            return PathBuf::from(path);
        }

        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("netveil/policy.toml");
        }

        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(".config/netveil/policy.toml");
        }

        PathBuf::from("policy.toml")
    }

    /// Load config from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<PolicyConfiguration> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ProxyError::ConfigLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&contents)
    }

    /// Parse a policy document
    pub fn parse(contents: &str) -> Result<PolicyConfiguration> {
        let config: PolicyConfiguration = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load built-in configuration embedded in the binary
    pub fn load_builtin() -> Result<PolicyConfiguration> {
        BUILTIN_POLICY.clone().map_err(ProxyError::BuiltinPolicy)
    }

    /// Merge a downloaded policy on top of the built-in one.
    /// Groups and categories are extended; every other section is replaced.
    pub fn merge_configs(builtin: PolicyConfiguration, user: PolicyConfiguration) -> PolicyConfiguration {
        let mut merged = builtin;

        for (name, group) in user.groups {
            merged.groups.insert(name, group);
        }

        for (name, category) in user.categories {
            merged.categories.insert(name, category);
        }

        merged.service = user.service;
        merged.time_restrictions = user.time_restrictions;
        merged.dns = user.dns;
        merged.bypass = user.bypass;
        merged.threshold = user.threshold;
        merged.content = user.content;

        merged
    }

    /// Load config with built-in as lowest-priority fallback
    pub fn load_with_builtins() -> Result<PolicyConfiguration> {
        let builtin = Self::load_builtin()?;
        let path = Self::default_config_path();

        if path.exists() {
            let user = Self::load_from_file(&path)?;
            Ok(Self::merge_configs(builtin, user))
        } else {
            tracing::debug!("Policy not found at {:?}, using built-in defaults", path);
            Ok(builtin)
        }
    }

    /// Load config from optional path or default with built-in merge
    /// Priority: Explicit path > User config > Built-in config
    pub fn load_or_default(path: Option<PathBuf>) -> Result<PolicyConfiguration> {
        if let Some(p) = path {
            let user = Self::load_from_file(&p)?;
            let builtin = Self::load_builtin()?;
            Ok(Self::merge_configs(builtin, user))
        } else {
            Self::load_with_builtins()
        }
    }
}
