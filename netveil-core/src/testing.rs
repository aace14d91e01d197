//! In-memory collaborators shared by the unit tests

use crate::accountability::BlockEvent;
use crate::classify::ImageClassifier;
use crate::dns::{CaptivePortalDetection, ConnectivityProbe, DnsProbe};
use crate::error::{ApiError, CoreError, Result};
use crate::notify::{Notification, NotificationSink};
use crate::platform::{InternetSwitch, NetworkInterface, NetworkInterfaces, SystemClock, WifiInfo};
use crate::time::TamperEvent;
use crate::web_service::{BypassResponse, RemoteApi, ReviewRequest};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Poll `condition` until it holds, failing the test after about a second
pub async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

pub struct FakeClock {
    wall: Mutex<DateTime<FixedOffset>>,
    monotonic: Mutex<Duration>,
    zone: Mutex<String>,
    high_resolution: AtomicBool,
}

impl FakeClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            wall: Mutex::new(now),
            monotonic: Mutex::new(Duration::from_secs(1000)),
            zone: Mutex::new("America/New_York".to_string()),
            high_resolution: AtomicBool::new(true),
        }
    }

    /// Move both clocks forward
    pub fn advance(&self, by: Duration) {
        let mut wall = self.wall.lock().unwrap();
        *wall += chrono::Duration::from_std(by).unwrap();
        drop(wall);
        self.advance_monotonic(by);
    }

    pub fn advance_monotonic(&self, by: Duration) {
        *self.monotonic.lock().unwrap() += by;
    }

    pub fn set_wall(&self, now: DateTime<FixedOffset>) {
        *self.wall.lock().unwrap() = now;
    }

    pub fn set_zone(&self, zone: &str) {
        *self.zone.lock().unwrap() = zone.to_string();
    }

    pub fn set_high_resolution(&self, high: bool) {
        self.high_resolution.store(high, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(
            FixedOffset::west_opt(5 * 3600)
                .unwrap()
                .with_ymd_and_hms(2024, 1, 10, 12, 0, 0)
                .unwrap(),
        )
    }
}

impl SystemClock for FakeClock {
    fn now_local(&self) -> DateTime<FixedOffset> {
        *self.wall.lock().unwrap()
    }

    fn zone_id(&self) -> String {
        self.zone.lock().unwrap().clone()
    }

    fn monotonic(&self) -> Duration {
        *self.monotonic.lock().unwrap()
    }

    fn is_high_resolution(&self) -> bool {
        self.high_resolution.load(Ordering::SeqCst)
    }
}

/// Management server stand-in. Bypass requests answer `NotFound` unless a
/// response was queued.
#[derive(Default)]
pub struct FakeRemoteApi {
    server_time: Mutex<Option<DateTime<Utc>>>,
    bypass: Mutex<VecDeque<std::result::Result<BypassResponse, ApiError>>>,
    bypass_status: Mutex<Option<BypassResponse>>,
    bypass_requests: AtomicU32,
    bypass_delay: Mutex<Duration>,
    blocks: Mutex<Vec<BlockEvent>>,
    tampering: Mutex<Vec<TamperEvent>>,
    reviews: Mutex<Vec<ReviewRequest>>,
    base_url: Mutex<Option<String>>,
}

impl FakeRemoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_server_time(&self, time: Option<DateTime<Utc>>) {
        *self.server_time.lock().unwrap() = time;
    }

    pub fn push_bypass(&self, response: std::result::Result<BypassResponse, ApiError>) {
        self.bypass.lock().unwrap().push_back(response);
    }

    /// `None` makes the status endpoint answer `NotFound`
    pub fn set_bypass_status(&self, status: Option<BypassResponse>) {
        *self.bypass_status.lock().unwrap() = status;
    }

    /// Hold every bypass request for `delay` before answering
    pub fn set_bypass_delay(&self, delay: Duration) {
        *self.bypass_delay.lock().unwrap() = delay;
    }

    pub fn bypass_requests(&self) -> u32 {
        self.bypass_requests.load(Ordering::SeqCst)
    }

    pub fn blocks(&self) -> Vec<BlockEvent> {
        self.blocks.lock().unwrap().clone()
    }

    pub fn tampering(&self) -> Vec<TamperEvent> {
        self.tampering.lock().unwrap().clone()
    }

    pub fn reviews(&self) -> Vec<ReviewRequest> {
        self.reviews.lock().unwrap().clone()
    }

    pub fn base_url(&self) -> Option<String> {
        self.base_url.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for FakeRemoteApi {
    async fn server_time(&self) -> std::result::Result<DateTime<Utc>, ApiError> {
        (*self.server_time.lock().unwrap()).ok_or(ApiError::NotConfigured)
    }

    async fn request_bypass(&self) -> std::result::Result<BypassResponse, ApiError> {
        self.bypass_requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.bypass_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.bypass
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::NotFound))
    }

    async fn bypass_status(&self) -> std::result::Result<BypassResponse, ApiError> {
        self.bypass_status.lock().unwrap().clone().ok_or(ApiError::NotFound)
    }

    async fn notify_block(&self, event: &BlockEvent) -> std::result::Result<(), ApiError> {
        self.blocks.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn report_tampering(&self, event: &TamperEvent) -> std::result::Result<(), ApiError> {
        self.tampering.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn request_review(&self, review: &ReviewRequest) -> std::result::Result<(), ApiError> {
        self.reviews.lock().unwrap().push(review.clone());
        Ok(())
    }

    fn configure(&self, base_url: Option<&str>) -> std::result::Result<(), ApiError> {
        *self.base_url.lock().unwrap() = base_url.map(str::to_string);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        self.received.lock().unwrap().push(notification.clone());
    }
}

pub struct FakeWifi {
    ssids: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl FakeWifi {
    pub fn new(ssids: &[&str]) -> Self {
        Self {
            ssids: Mutex::new(ssids.iter().map(|s| s.to_string()).collect()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set(&self, ssids: &[&str]) {
        *self.ssids.lock().unwrap() = ssids.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl WifiInfo for FakeWifi {
    fn current_ssids(&self) -> Result<Vec<String>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Platform("wlan service unavailable".to_string()));
        }
        Ok(self.ssids.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeSwitch {
    disabled: AtomicU32,
    enabled: AtomicU32,
}

impl FakeSwitch {
    pub fn disabled(&self) -> u32 {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn enabled(&self) -> u32 {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl InternetSwitch for FakeSwitch {
    fn disable_internet(&self) -> Result<()> {
        self.disabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn enable_internet(&self) -> Result<()> {
        self.enabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn interface(id: &str, is_up: bool, is_tunnel: bool, dns: &[&str], dhcp: bool) -> NetworkInterface {
    NetworkInterface {
        id: id.to_string(),
        is_up,
        is_tunnel,
        dns_servers: dns.iter().map(|s| s.parse().unwrap()).collect(),
        dhcp,
    }
}

/// Adapters held in memory; writes update them and are recorded
pub struct FakeInterfaces {
    interfaces: Mutex<Vec<NetworkInterface>>,
    static_writes: Mutex<Vec<(String, Vec<IpAddr>)>>,
    dhcp_resets: Mutex<Vec<String>>,
    flushes: AtomicU32,
    captive_flag: Mutex<Option<bool>>,
}

impl FakeInterfaces {
    pub fn new(interfaces: Vec<NetworkInterface>) -> Self {
        Self {
            interfaces: Mutex::new(interfaces),
            static_writes: Mutex::new(Vec::new()),
            dhcp_resets: Mutex::new(Vec::new()),
            flushes: AtomicU32::new(0),
            captive_flag: Mutex::new(None),
        }
    }

    pub fn static_writes(&self) -> Vec<(String, Vec<IpAddr>)> {
        self.static_writes.lock().unwrap().clone()
    }

    pub fn dhcp_resets(&self) -> Vec<String> {
        self.dhcp_resets.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn set_captive_flag(&self, flag: Option<bool>) {
        *self.captive_flag.lock().unwrap() = flag;
    }
}

impl NetworkInterfaces for FakeInterfaces {
    fn list(&self) -> Result<Vec<NetworkInterface>> {
        Ok(self.interfaces.lock().unwrap().clone())
    }

    fn set_dns_servers(&self, id: &str, servers: &[IpAddr]) -> Result<()> {
        for iface in self.interfaces.lock().unwrap().iter_mut().filter(|i| i.id == id) {
            iface.dns_servers = servers.to_vec();
            iface.dhcp = false;
        }
        self.static_writes
            .lock()
            .unwrap()
            .push((id.to_string(), servers.to_vec()));
        Ok(())
    }

    fn set_dns_dhcp(&self, id: &str) -> Result<()> {
        for iface in self.interfaces.lock().unwrap().iter_mut().filter(|i| i.id == id) {
            iface.dns_servers.clear();
            iface.dhcp = true;
        }
        self.dhcp_resets.lock().unwrap().push(id.to_string());
        Ok(())
    }

    fn captive_portal_flags(&self) -> Option<bool> {
        *self.captive_flag.lock().unwrap()
    }

    fn flush_dns_cache(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeDnsProbe {
    up: AtomicBool,
    calls: AtomicU32,
}

impl FakeDnsProbe {
    pub fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsProbe for FakeDnsProbe {
    async fn resolves(&self, _server: IpAddr, _host: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.up.load(Ordering::SeqCst)
    }
}

/// Answers queued results, then `No`
#[derive(Default)]
pub struct FakeConnectivity {
    queue: Mutex<VecDeque<CaptivePortalDetection>>,
    calls: AtomicU32,
}

impl FakeConnectivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: CaptivePortalDetection) {
        self.queue.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for FakeConnectivity {
    async fn probe(&self, _url: &str, _expected_body: &str) -> CaptivePortalDetection {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CaptivePortalDetection::No)
    }
}

pub struct FakeImageClassifier {
    objectionable: AtomicBool,
    calls: AtomicU32,
}

impl FakeImageClassifier {
    pub fn new(objectionable: bool) -> Self {
        Self {
            objectionable: AtomicBool::new(objectionable),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageClassifier for FakeImageClassifier {
    async fn is_objectionable(&self, _image: &Bytes, _content_type: &str) -> std::result::Result<bool, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.objectionable.load(Ordering::SeqCst))
    }
}
