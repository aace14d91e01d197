//! Memory of wireless networks that sit behind a captive portal
//!
//! Persisted as two lines: the SSIDs, each base64 encoded and comma-joined,
//! then the RFC 3339 time of detection. Entries older than 12 hours are
//! discarded along with the file.

use crate::platform::{SystemClock, WifiInfo};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const CACHE_LIFETIME_HOURS: i64 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CaptivePortalCache {
    ssids: BTreeSet<String>,
    detected_at: DateTime<Utc>,
}

impl CaptivePortalCache {
    fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let ssid_line = lines.next()?;
        let detected_at = DateTime::parse_from_rfc3339(lines.next()?.trim())
            .ok()?
            .with_timezone(&Utc);

        let ssids = ssid_line
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|encoded| STANDARD.decode(encoded).ok())
            .filter_map(|raw| String::from_utf8(raw).ok())
            .collect();
        Some(Self { ssids, detected_at })
    }

    fn serialize(&self) -> String {
        let encoded: Vec<String> = self.ssids.iter().map(|s| STANDARD.encode(s)).collect();
        format!("{}\n{}\n", encoded.join(","), self.detected_at.to_rfc3339())
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    loaded: bool,
    cache: Option<CaptivePortalCache>,
}

pub struct CaptivePortalHelper {
    path: PathBuf,
    wifi: Arc<dyn WifiInfo>,
    clock: Arc<dyn SystemClock>,
    slot: Mutex<CacheSlot>,
}

impl CaptivePortalHelper {
    pub fn new(path: impl Into<PathBuf>, wifi: Arc<dyn WifiInfo>, clock: Arc<dyn SystemClock>) -> Self {
        Self {
            path: path.into(),
            wifi,
            clock,
            slot: Mutex::new(CacheSlot::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_local().with_timezone(&Utc)
    }

    /// Cache slot, reading the file on first use
    fn slot(&self) -> MutexGuard<'_, CacheSlot> {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !slot.loaded {
            slot.loaded = true;
            slot.cache = match std::fs::read_to_string(&self.path) {
                Ok(contents) => CaptivePortalCache::parse(&contents),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    warn!("Failed to read captive portal cache {}: {}", self.path.display(), e);
                    None
                }
            };
        }
        slot
    }

    fn current_ssids(&self) -> Vec<String> {
        match self.wifi.current_ssids() {
            Ok(ssids) => ssids,
            Err(e) => {
                debug!("Wi-Fi query failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Remember the networks we are connected to as captive
    pub fn on_captive_portal_detected(&self) {
        let ssids = self.current_ssids();
        if ssids.is_empty() {
            return;
        }

        let now = self.now();
        let mut slot = self.slot();
        let mut cache = match slot.cache.take() {
            Some(existing) if !self.is_expired(&existing, now) => existing,
            _ => CaptivePortalCache {
                ssids: BTreeSet::new(),
                detected_at: now,
            },
        };
        cache.ssids.extend(ssids);
        cache.detected_at = now;

        if let Err(e) = write_file(&self.path, &cache.serialize()) {
            warn!("Failed to save captive portal cache: {}", e);
        }
        info!("Captive portal recorded for {:?}", cache.ssids);
        slot.cache = Some(cache);
    }

    /// Whether the current Wi-Fi network was recently seen behind a captive portal
    pub fn is_current_network_captive_portal(&self) -> bool {
        let now = self.now();
        let mut slot = self.slot();
        let Some(cache) = slot.cache.as_ref() else {
            return false;
        };

        if self.is_expired(cache, now) {
            debug!("Captive portal cache expired");
            slot.cache = None;
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove captive portal cache: {}", e);
                }
            }
            return false;
        }

        let cached = cache.ssids.clone();
        drop(slot);
        self.current_ssids().iter().any(|ssid| cached.contains(ssid))
    }

    fn is_expired(&self, cache: &CaptivePortalCache, now: DateTime<Utc>) -> bool {
        now - cache.detected_at > chrono::Duration::hours(CACHE_LIFETIME_HOURS)
    }
}

fn write_file(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}
