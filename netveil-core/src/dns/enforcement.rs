//! Keeps the filtering DNS servers applied while they are reachable and the
//! network is not a captive portal

use super::{CaptivePortalDetection, ConnectivityProbe, DnsEvent, DnsProbe};
use crate::captive_portal::CaptivePortalHelper;
use crate::notify::{Notification, Notifier};
use crate::platform::NetworkInterfaces;
use netveil_proxy::config::{LoadedPolicy, PolicyStore};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LIVENESS_TTL: Duration = Duration::from_secs(5 * 60);
const CAPTIVE_RETRY_DELAY: Duration = Duration::from_millis(1500);
const CAPTIVE_INTERVAL: Duration = Duration::from_secs(5);
const NORMAL_INTERVAL: Duration = Duration::from_secs(60);

/// Whether the configured pair differs from what was last applied
pub fn are_dns_servers_changing(
    last_primary: Option<IpAddr>,
    last_secondary: Option<IpAddr>,
    primary: Option<IpAddr>,
    secondary: Option<IpAddr>,
) -> bool {
    last_primary != primary || last_secondary != secondary
}

#[derive(Debug, Default)]
struct DnsEnforcementState {
    last_primary: Option<IpAddr>,
    last_secondary: Option<IpAddr>,
    is_captive_portal: bool,
}

pub struct DnsEnforcement {
    policy: Arc<PolicyStore>,
    interfaces: Arc<dyn NetworkInterfaces>,
    dns_probe: Arc<dyn DnsProbe>,
    connectivity: Arc<dyn ConnectivityProbe>,
    captive: Arc<CaptivePortalHelper>,
    notifier: Arc<Notifier>,
    state: tokio::sync::Mutex<DnsEnforcementState>,
    liveness: Mutex<Option<(Instant, bool)>>,
    events: broadcast::Sender<DnsEvent>,
    wake: Notify,
}

impl DnsEnforcement {
    pub fn new(
        policy: Arc<PolicyStore>,
        interfaces: Arc<dyn NetworkInterfaces>,
        dns_probe: Arc<dyn DnsProbe>,
        connectivity: Arc<dyn ConnectivityProbe>,
        captive: Arc<CaptivePortalHelper>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            policy,
            interfaces,
            dns_probe,
            connectivity,
            captive,
            notifier,
            state: tokio::sync::Mutex::new(DnsEnforcementState::default()),
            liveness: Mutex::new(None),
            events,
            wake: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DnsEvent> {
        self.events.subscribe()
    }

    /// One enforcement pass
    pub async fn trigger(&self) {
        let Some(policy) = self.policy.snapshot() else {
            debug!("No policy loaded, releasing DNS");
            self.try_enforce(false).await;
            return;
        };

        if !self.is_dns_up(&policy).await {
            info!("Filtering DNS unreachable, releasing to DHCP");
            self.try_enforce(false).await;
            return;
        }

        let mut detection = self.is_behind_captive_portal(&policy).await;
        if detection == CaptivePortalDetection::NoResponseReturned {
            tokio::time::sleep(CAPTIVE_RETRY_DELAY).await;
            detection = self.is_behind_captive_portal(&policy).await;
        }
        if detection == CaptivePortalDetection::NoResponseReturned {
            detection = if self.captive.is_current_network_captive_portal() {
                CaptivePortalDetection::Yes
            } else {
                CaptivePortalDetection::No
            };
        }

        let captive = detection == CaptivePortalDetection::Yes;
        self.set_captive_portal(captive).await;
        if captive {
            self.captive.on_captive_portal_detected();
            self.try_enforce(false).await;
            return;
        }

        self.try_enforce(true).await;
    }

    /// Apply (or release) the filtering DNS servers on every adapter.
    ///
    /// Serialized by the enforcement lock, so overlapping triggers never
    /// interleave adapter writes.
    pub async fn try_enforce(&self, filtering_enabled: bool) {
        let mut state = self.state.lock().await;

        let (primary, secondary) = match (filtering_enabled, self.policy.snapshot()) {
            (true, Some(policy)) => policy.config.dns.servers(),
            _ => (None, None),
        };
        let desired: Vec<IpAddr> = [primary, secondary].into_iter().flatten().collect();

        let interfaces = match self.interfaces.list() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Failed to list network interfaces: {}", e);
                return;
            }
        };

        let mut changed = false;
        if desired.is_empty() {
            for iface in interfaces.iter().filter(|i| !i.dhcp && !i.is_tunnel) {
                match self.interfaces.set_dns_dhcp(&iface.id) {
                    Ok(()) => {
                        debug!("Released DNS on {} to DHCP", iface.id);
                        changed = true;
                    }
                    Err(e) => warn!("Failed to release DNS on {}: {}", iface.id, e),
                }
            }
        } else {
            for iface in interfaces.iter().filter(|i| i.is_up && !i.is_tunnel) {
                let order = desired_order(&desired, &iface.dns_servers);
                if order == iface.dns_servers {
                    continue;
                }
                match self.interfaces.set_dns_servers(&iface.id, &order) {
                    Ok(()) => {
                        debug!("Set DNS on {} to {:?}", iface.id, order);
                        changed = true;
                    }
                    Err(e) => warn!("Failed to set DNS on {}: {}", iface.id, e),
                }
            }
        }

        if changed {
            let interfaces = self.interfaces.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = interfaces.flush_dns_cache() {
                    debug!("DNS cache flush failed: {}", e);
                }
            });
        }

        if are_dns_servers_changing(state.last_primary, state.last_secondary, primary, secondary) {
            info!("Filtering DNS changed to {:?} / {:?}", primary, secondary);
            state.last_primary = primary;
            state.last_secondary = secondary;
            let _ = self.events.send(DnsEvent::Changed { primary, secondary });
        }
    }

    /// Whether any configured filtering server answers. Cached for five
    /// minutes; true when no server is configured.
    pub async fn is_dns_up(&self, policy: &LoadedPolicy) -> bool {
        if let Some((checked_at, up)) = self.cached_liveness() {
            if checked_at.elapsed() < LIVENESS_TTL {
                return up;
            }
        }

        let (primary, secondary) = policy.config.dns.servers();
        let host = &policy.config.service.dns_probe_host;
        let mut up = primary.is_none() && secondary.is_none();
        for server in [primary, secondary].into_iter().flatten() {
            if self.dns_probe.resolves(server, host).await {
                up = true;
                break;
            }
        }

        if let Ok(mut cache) = self.liveness.lock() {
            *cache = Some((Instant::now(), up));
        }
        up
    }

    fn cached_liveness(&self) -> Option<(Instant, bool)> {
        self.liveness.lock().ok().and_then(|cache| *cache)
    }

    /// Forget the cached liveness result
    pub fn invalidate_dns_result(&self) {
        if let Ok(mut cache) = self.liveness.lock() {
            *cache = None;
        }
    }

    pub async fn is_behind_captive_portal(&self, policy: &LoadedPolicy) -> CaptivePortalDetection {
        if self.interfaces.captive_portal_flags() == Some(true) {
            return CaptivePortalDetection::Yes;
        }
        let service = &policy.config.service;
        self.connectivity
            .probe(&service.connectivity_probe_url, &service.connectivity_probe_body)
            .await
    }

    async fn set_captive_portal(&self, captive: bool) {
        let mut state = self.state.lock().await;
        if state.is_captive_portal != captive {
            state.is_captive_portal = captive;
            info!("Captive portal {}", if captive { "detected" } else { "cleared" });
            self.notifier
                .notify(&Notification::CaptivePortalState { detected: captive });
        }
    }

    pub async fn is_captive_portal(&self) -> bool {
        self.state.lock().await.is_captive_portal
    }

    /// Wake the enforcement loop early
    pub fn network_changed(&self) {
        self.invalidate_dns_result();
        self.wake.notify_one();
    }

    /// Enforce periodically until cancelled: every 5 seconds behind a captive
    /// portal, every minute otherwise, and on network changes
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("DNS enforcement started");
        loop {
            self.trigger().await;
            let interval = if self.is_captive_portal().await {
                CAPTIVE_INTERVAL
            } else {
                NORMAL_INTERVAL
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => debug!("Network change, re-checking DNS"),
            }
        }
        debug!("DNS enforcement stopped");
    }
}

/// Filtering servers first, then whatever else the adapter already had
fn desired_order(desired: &[IpAddr], existing: &[IpAddr]) -> Vec<IpAddr> {
    let mut order = desired.to_vec();
    order.extend(existing.iter().filter(|ip| !desired.contains(ip)).copied());
    order
}
