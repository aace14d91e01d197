//! Configuration schema types

use chrono::Weekday;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Complete filtering policy as delivered by the management server
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyConfiguration {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub groups: IndexMap<String, RuleGroup>,
    #[serde(default)]
    pub categories: IndexMap<String, Category>,
    #[serde(default)]
    pub time_restrictions: WeeklyRestrictions,
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub bypass: BypassSettings,
    #[serde(default)]
    pub threshold: ThresholdSettings,
    #[serde(default)]
    pub content: ContentSettings,
}

/// Settings describing this installation and the management server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSettings {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    /// Host of the management API; never filtered
    #[serde(default)]
    pub management_host: Option<String>,
    /// Base URL for the management API, e.g. `https://manage.example.com/api/v2/`
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    /// URL fetched to detect captive portals
    #[serde(default = "default_connectivity_url")]
    pub connectivity_probe_url: String,
    /// Exact body the connectivity URL returns on an open network
    #[serde(default = "default_connectivity_body")]
    pub connectivity_probe_body: String,
    /// Hostname resolved against each filtering DNS server to check liveness
    #[serde(default = "default_dns_probe_host")]
    pub dns_probe_host: String,
}

fn default_config_version() -> String {
    "1.0".to_string()
}

fn default_connectivity_url() -> String {
    "http://www.msftconnecttest.com/connecttest.txt".to_string()
}

fn default_connectivity_body() -> String {
    "Microsoft Connect Test".to_string()
}

fn default_dns_probe_host() -> String {
    "www.google.com".to_string()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            management_host: None,
            api_base_url: None,
            device_name: None,
            connectivity_probe_url: default_connectivity_url(),
            connectivity_probe_body: default_connectivity_body(),
            dns_probe_host: default_dns_probe_host(),
        }
    }
}

/// A named group of hosts and IP ranges
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleGroup {
    #[serde(default)]
    pub description: String,
    /// Wildcard host patterns (`*.example.com`)
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub ipv4_ranges: Vec<String>,
    #[serde(default)]
    pub ipv6_ranges: Vec<String>,
    /// References to other groups (for composition)
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Whether a category's rules block or explicitly allow traffic
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    #[default]
    Block,
    Allow,
}

/// A classification bucket that rules and triggers map into
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Category {
    pub id: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: CategoryKind,
    /// Suspended while a relaxed policy (bypass) is active
    #[serde(default)]
    pub relaxable: bool,
    /// Rule groups whose hosts belong to this category
    #[serde(default)]
    pub groups: Vec<String>,
    /// Phrases that classify a text response into this category
    #[serde(default)]
    pub triggers: Vec<String>,
}

/// Allowed-hours window for a single weekday.
///
/// `enabled_through` alternates start/end boundaries in decimal hours.
/// A boundary of exactly 24 denotes the end of the day.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TimeRestrictionModel {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub enabled_through: Vec<f64>,
}

impl TimeRestrictionModel {
    pub fn new(enabled: bool, enabled_through: impl Into<Vec<f64>>) -> Self {
        Self {
            enabled,
            enabled_through: enabled_through.into(),
        }
    }
}

/// One restriction model per weekday
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WeeklyRestrictions {
    #[serde(default)]
    pub monday: Option<TimeRestrictionModel>,
    #[serde(default)]
    pub tuesday: Option<TimeRestrictionModel>,
    #[serde(default)]
    pub wednesday: Option<TimeRestrictionModel>,
    #[serde(default)]
    pub thursday: Option<TimeRestrictionModel>,
    #[serde(default)]
    pub friday: Option<TimeRestrictionModel>,
    #[serde(default)]
    pub saturday: Option<TimeRestrictionModel>,
    #[serde(default)]
    pub sunday: Option<TimeRestrictionModel>,
}

impl WeeklyRestrictions {
    pub fn for_weekday(&self, day: Weekday) -> Option<&TimeRestrictionModel> {
        match day {
            Weekday::Mon => self.monday.as_ref(),
            Weekday::Tue => self.tuesday.as_ref(),
            Weekday::Wed => self.wednesday.as_ref(),
            Weekday::Thu => self.thursday.as_ref(),
            Weekday::Fri => self.friday.as_ref(),
            Weekday::Sat => self.saturday.as_ref(),
            Weekday::Sun => self.sunday.as_ref(),
        }
    }

    /// Iterate over the configured days, in week order
    pub fn iter(&self) -> impl Iterator<Item = (Weekday, &TimeRestrictionModel)> {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter_map(move |day| self.for_weekday(day).map(|model| (day, model)))
    }
}

/// Filtering DNS resolvers
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DnsSettings {
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub secondary: Option<String>,
}

impl DnsSettings {
    /// Parsed primary and secondary servers; blank or unparsable entries are `None`
    pub fn servers(&self) -> (Option<IpAddr>, Option<IpAddr>) {
        (parse_server(&self.primary), parse_server(&self.secondary))
    }
}

fn parse_server(value: &Option<String>) -> Option<IpAddr> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

/// Relaxed-policy quota
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BypassSettings {
    #[serde(default)]
    pub permitted: u32,
    #[serde(default = "default_bypass_minutes")]
    pub duration_minutes: u64,
    /// Passcode required locally before a bypass is requested
    #[serde(default)]
    pub passcode: Option<String>,
}

fn default_bypass_minutes() -> u64 {
    10
}

impl BypassSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_minutes.saturating_mul(60))
    }
}

impl Default for BypassSettings {
    fn default() -> Self {
        Self {
            permitted: 0,
            duration_minutes: default_bypass_minutes(),
            passcode: None,
        }
    }
}

/// Block-frequency lockout parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThresholdSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold_limit")]
    pub limit: u32,
    #[serde(default = "default_trigger_period")]
    pub trigger_period_minutes: u64,
    #[serde(default = "default_lockout_minutes")]
    pub timeout_minutes: u64,
}

fn default_threshold_limit() -> u32 {
    10
}

fn default_trigger_period() -> u64 {
    1
}

fn default_lockout_minutes() -> u64 {
    15
}

impl ThresholdSettings {
    pub fn trigger_period(&self) -> Duration {
        Duration::from_secs(self.trigger_period_minutes.max(1).saturating_mul(60))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: default_threshold_limit(),
            trigger_period_minutes: default_trigger_period(),
            timeout_minutes: default_lockout_minutes(),
        }
    }
}

/// Limits for response content classification
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentSettings {
    #[serde(default = "default_max_scan")]
    pub max_text_scan_bytes: usize,
    #[serde(default = "default_min_image")]
    pub min_image_bytes: usize,
    /// Larger images are passed through unclassified
    #[serde(default = "default_max_image")]
    pub max_image_bytes: usize,
    /// Endpoint of the external image classifier; image checks are off without it
    #[serde(default)]
    pub image_classifier_url: Option<String>,
}

fn default_max_scan() -> usize {
    512 * 1024
}

fn default_min_image() -> usize {
    2048
}

fn default_max_image() -> usize {
    8 * 1024 * 1024
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self {
            max_text_scan_bytes: default_max_scan(),
            min_image_bytes: default_min_image(),
            max_image_bytes: default_max_image(),
            image_classifier_url: None,
        }
    }
}

impl ContentSettings {
    /// Most of a response body the proxy holds in memory for inspection
    pub fn max_buffered_bytes(&self) -> usize {
        self.max_text_scan_bytes.max(self.max_image_bytes)
    }
}
