//! Small JSON document of service state that must survive restarts

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Last time a policy was loaded
    #[serde(default)]
    pub last_settings_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bypasses_used: u32,
    #[serde(default)]
    pub bypasses_permitted: u32,
    /// Bypass counts come from the management server rather than local counting
    #[serde(default)]
    pub bypass_server_tracked: bool,
    /// Time zone seen when the service last ran
    #[serde(default)]
    pub last_zone_id: Option<String>,
}

pub struct SettingsStore {
    path: PathBuf,
    current: Mutex<AppSettings>,
}

impl SettingsStore {
    /// Load settings; a missing or unreadable document starts from defaults
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Ignoring corrupt settings {}: {}", path.display(), e);
                AppSettings::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
            Err(source) => return Err(CoreError::Settings { path, source }),
        };
        Ok(Self {
            path,
            current: Mutex::new(current),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, AppSettings> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self) -> AppSettings {
        self.lock().clone()
    }

    /// Modify and persist. The in-memory copy is updated even if the write fails.
    pub fn update(&self, f: impl FnOnce(&mut AppSettings)) -> Result<()> {
        let snapshot = {
            let mut settings = self.lock();
            f(&mut settings);
            settings.clone()
        };
        self.save(&snapshot)
    }

    fn save(&self, settings: &AppSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
