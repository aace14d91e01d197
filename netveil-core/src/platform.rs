//! Operating-system collaborators: network adapters, Wi-Fi, internet
//! switch and clocks.
//!
//! The service only talks to the platform through these traits. The
//! implementations here are portable stand-ins that observe but never
//! reconfigure the host; OS-specific backends plug in at the same seams.

use crate::error::Result;
use chrono::{DateTime, FixedOffset, Local};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A network adapter and its DNS configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub id: String,
    pub is_up: bool,
    /// VPN or other tunnel adapter; never rewritten
    pub is_tunnel: bool,
    /// DNS servers currently configured, in resolver order
    pub dns_servers: Vec<IpAddr>,
    /// DNS servers come from DHCP rather than static configuration
    pub dhcp: bool,
}

pub trait NetworkInterfaces: Send + Sync {
    fn list(&self) -> Result<Vec<NetworkInterface>>;

    /// Statically configure DNS servers on an interface, in order
    fn set_dns_servers(&self, id: &str, servers: &[IpAddr]) -> Result<()>;

    /// Return an interface to DHCP-provided DNS
    fn set_dns_dhcp(&self, id: &str) -> Result<()>;

    /// Captive-portal flags exposed by the OS connectivity monitor, if any
    fn captive_portal_flags(&self) -> Option<bool>;

    fn flush_dns_cache(&self) -> Result<()>;
}

pub trait WifiInfo: Send + Sync {
    /// SSIDs of the currently connected wireless networks
    fn current_ssids(&self) -> Result<Vec<String>>;
}

/// Cuts and restores internet access during a block-threshold lockout
pub trait InternetSwitch: Send + Sync {
    fn disable_internet(&self) -> Result<()>;
    fn enable_internet(&self) -> Result<()>;
}

pub trait SystemClock: Send + Sync {
    /// Local wall-clock time, with the current UTC offset
    fn now_local(&self) -> DateTime<FixedOffset>;

    /// Identifier of the configured time zone
    fn zone_id(&self) -> String;

    /// Monotonic reading since an arbitrary fixed origin
    fn monotonic(&self) -> Duration;

    /// Whether `monotonic` is backed by a high-resolution counter
    fn is_high_resolution(&self) -> bool;
}

/// Wall clock from the OS, monotonic time from `Instant`
#[derive(Debug)]
pub struct LocalClock {
    origin: Instant,
}

impl LocalClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock for LocalClock {
    fn now_local(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }

    fn zone_id(&self) -> String {
        if let Ok(tz) = std::env::var("TZ") {
            if !tz.is_empty() {
                return tz;
            }
        }
        // /etc/localtime links into the zoneinfo database on most systems
        std::fs::read_link("/etc/localtime")
            .ok()
            .and_then(|target| {
                let target = target.to_string_lossy().into_owned();
                target
                    .split_once("zoneinfo/")
                    .map(|(_, zone)| zone.to_string())
            })
            .unwrap_or_else(|| "localtime".to_string())
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn is_high_resolution(&self) -> bool {
        true
    }
}

/// Reports no adapters, so DNS enforcement has nothing to rewrite
#[derive(Debug, Default)]
pub struct UnmanagedNetwork;

impl NetworkInterfaces for UnmanagedNetwork {
    fn list(&self) -> Result<Vec<NetworkInterface>> {
        Ok(Vec::new())
    }

    fn set_dns_servers(&self, id: &str, servers: &[IpAddr]) -> Result<()> {
        debug!("Ignoring DNS change on unmanaged interface {}: {:?}", id, servers);
        Ok(())
    }

    fn set_dns_dhcp(&self, id: &str) -> Result<()> {
        debug!("Ignoring DHCP reset on unmanaged interface {}", id);
        Ok(())
    }

    fn captive_portal_flags(&self) -> Option<bool> {
        None
    }

    fn flush_dns_cache(&self) -> Result<()> {
        Ok(())
    }
}

/// No wireless adapter
#[derive(Debug, Default)]
pub struct NoWifi;

impl WifiInfo for NoWifi {
    fn current_ssids(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Logs lockouts without touching connectivity
#[derive(Debug, Default)]
pub struct LoggingInternetSwitch;

impl InternetSwitch for LoggingInternetSwitch {
    fn disable_internet(&self) -> Result<()> {
        info!("Internet access disabled");
        Ok(())
    }

    fn enable_internet(&self) -> Result<()> {
        info!("Internet access restored");
        Ok(())
    }
}
