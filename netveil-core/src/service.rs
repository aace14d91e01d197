//! Orchestrator owning every filtering component
//!
//! [`FilterService`] wires the components together, runs their background
//! loops under one cancellation token and serves requests from the GUI.

use crate::accountability::{AccountabilityReporter, ThresholdEnforcer};
use crate::auth::AuthenticationStorage;
use crate::captive_portal::CaptivePortalHelper;
use crate::certs::CertificateExemptions;
use crate::classify::ImageClassifier;
use crate::dns::{ConnectivityProbe, DnsEnforcement, DnsProbe};
use crate::error::Result;
use crate::notify::{FilterStatus, IpcRequest, Notification, Notifier};
use crate::platform::{InternetSwitch, NetworkInterfaces, SystemClock, WifiInfo};
use crate::relaxed::{RelaxedPolicy, RelaxedPolicyOutcome};
use crate::settings::SettingsStore;
use crate::site_filter::{SiteFiltering, SiteFilteringDeps};
use crate::time::{TamperEvent, TimeDetection};
use crate::web_service::{RemoteApi, ReviewRequest};
use chrono::Utc;
use netveil_proxy::config::{PolicyConfiguration, PolicyStore};
use netveil_proxy::proxy::ProxyEngine;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESTRICTION_POLL: Duration = Duration::from_secs(1);

const SETTINGS_FILE: &str = "settings.json";
const CAPTIVE_PORTAL_FILE: &str = "captive-portal.txt";
const EXEMPTIONS_DB: &str = "certificate-exemptions.db";

/// Platform and remote collaborators supplied by the host process
pub struct ServiceDeps {
    /// Directory for persisted state (settings, exemptions, captive portals)
    pub state_dir: PathBuf,
    /// Shared with the proxy engine and anything else reading the policy
    pub policy: Arc<PolicyStore>,
    pub auth: Arc<AuthenticationStorage>,
    pub notifier: Arc<Notifier>,
    pub clock: Arc<dyn SystemClock>,
    pub interfaces: Arc<dyn NetworkInterfaces>,
    pub wifi: Arc<dyn WifiInfo>,
    pub switch: Arc<dyn InternetSwitch>,
    pub api: Arc<dyn RemoteApi>,
    pub dns_probe: Arc<dyn DnsProbe>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub classifier: Option<Arc<dyn ImageClassifier>>,
}

/// Answer to an [`IpcRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcReply {
    RelaxedPolicy(RelaxedPolicyOutcome),
    ReviewSubmitted,
    ReviewFailed(String),
    CertificateTrusted,
}

pub struct FilterService {
    policy: Arc<PolicyStore>,
    auth: Arc<AuthenticationStorage>,
    notifier: Arc<Notifier>,
    api: Arc<dyn RemoteApi>,
    settings: Arc<SettingsStore>,
    time: Arc<TimeDetection>,
    dns: Arc<DnsEnforcement>,
    certs: Arc<CertificateExemptions>,
    relaxed: Arc<RelaxedPolicy>,
    threshold: Arc<ThresholdEnforcer>,
    reporter: Arc<AccountabilityReporter>,
    filter: Arc<SiteFiltering>,
    cancel: CancellationToken,
    engine: Mutex<Option<Arc<dyn ProxyEngine>>>,
}

impl FilterService {
    pub fn new(deps: ServiceDeps) -> Result<Self> {
        std::fs::create_dir_all(&deps.state_dir)?;

        let policy = deps.policy;
        let settings = Arc::new(SettingsStore::load(deps.state_dir.join(SETTINGS_FILE))?);

        let time = Arc::new(
            TimeDetection::new(deps.clock.clone(), deps.api.clone())
                .with_last_zone(settings.get().last_zone_id),
        );
        let captive = Arc::new(CaptivePortalHelper::new(
            deps.state_dir.join(CAPTIVE_PORTAL_FILE),
            deps.wifi,
            deps.clock.clone(),
        ));
        let dns = Arc::new(DnsEnforcement::new(
            policy.clone(),
            deps.interfaces,
            deps.dns_probe,
            deps.connectivity,
            captive,
            deps.notifier.clone(),
        ));
        let certs = Arc::new(CertificateExemptions::open(
            deps.state_dir.join(EXEMPTIONS_DB),
            deps.clock.clone(),
        )?);
        let relaxed = RelaxedPolicy::new(
            policy.clone(),
            deps.api.clone(),
            settings.clone(),
            deps.notifier.clone(),
            deps.clock,
        );
        let threshold = Arc::new(ThresholdEnforcer::new(
            policy.clone(),
            deps.switch,
            deps.notifier.clone(),
        ));
        let reporter = Arc::new(AccountabilityReporter::new(deps.api.clone()));

        let filter = Arc::new(SiteFiltering::new(SiteFilteringDeps {
            policy: policy.clone(),
            auth: deps.auth.clone(),
            time: time.clone(),
            certs: certs.clone(),
            relaxed: relaxed.clone(),
            threshold: threshold.clone(),
            reporter: reporter.clone(),
            notifier: deps.notifier.clone(),
            classifier: deps.classifier,
        }));

        Ok(Self {
            policy,
            auth: deps.auth,
            notifier: deps.notifier,
            api: deps.api,
            settings,
            time,
            dns,
            certs,
            relaxed,
            threshold,
            reporter,
            filter,
            cancel: CancellationToken::new(),
            engine: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> Arc<PolicyStore> {
        self.policy.clone()
    }

    /// Callbacks to hand to the proxy engine
    pub fn filter(&self) -> Arc<SiteFiltering> {
        self.filter.clone()
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn auth(&self) -> Arc<AuthenticationStorage> {
        self.auth.clone()
    }

    pub fn time(&self) -> Arc<TimeDetection> {
        self.time.clone()
    }

    pub fn relaxed(&self) -> Arc<RelaxedPolicy> {
        self.relaxed.clone()
    }

    pub fn dns(&self) -> Arc<DnsEnforcement> {
        self.dns.clone()
    }

    pub fn certificates(&self) -> Arc<CertificateExemptions> {
        self.certs.clone()
    }

    /// Swap in a new policy and bring dependent state in line with it.
    /// An invalid policy is rejected and the previous one stays active.
    pub async fn reload(&self, config: PolicyConfiguration) -> Result<()> {
        let loaded = self.policy.replace(config)?;
        if let Err(e) = self.api.configure(loaded.config.service.api_base_url.as_deref()) {
            warn!("Invalid management API address: {}", e);
        }

        let checked_at = self.time.real_time().with_timezone(&Utc);
        if let Err(e) = self.settings.update(|s| s.last_settings_check = Some(checked_at)) {
            warn!("Failed to record settings check: {}", e);
        }

        self.relaxed.update_number_of_bypasses_from_server().await;
        self.dns.invalidate_dns_result();
        self.dns.trigger().await;
        Ok(())
    }

    /// Spawn the background loops and start the proxy engine
    pub async fn start(&self, engine: Arc<dyn ProxyEngine>) -> Result<()> {
        tokio::spawn(self.time.clone().run(self.cancel.child_token()));
        tokio::spawn(self.dns.clone().run(self.cancel.child_token()));
        tokio::spawn(self.threshold.clone().run(self.cancel.child_token()));
        tokio::spawn(watch_time_restrictions(
            self.policy.clone(),
            self.time.clone(),
            self.notifier.clone(),
            self.cancel.child_token(),
        ));

        let tamper = self.time.subscribe();
        self.time.real_time();
        if self.settings.get().last_zone_id.is_none() {
            self.remember_zone(self.time.observed_zone());
        }
        tokio::spawn(forward_tampering(
            tamper,
            self.reporter.clone(),
            self.settings.clone(),
            self.cancel.child_token(),
        ));

        self.relaxed.resume();
        engine.start().await?;
        *self.engine_slot() = Some(engine);
        info!("Filter service started");
        Ok(())
    }

    fn engine_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn ProxyEngine>>> {
        match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remember_zone(&self, zone: Option<String>) {
        if let Err(e) = self.settings.update(|s| s.last_zone_id = zone) {
            warn!("Failed to persist time zone: {}", e);
        }
    }

    pub async fn handle_ipc(&self, request: IpcRequest) -> IpcReply {
        match request {
            IpcRequest::RelaxedPolicyRequested { passcode } => {
                let outcome = self.relaxed.request_relaxed_policy(passcode.as_deref()).await;
                debug!("Relaxed policy request: {:?}", outcome);
                IpcReply::RelaxedPolicy(outcome)
            }
            IpcRequest::ClientRequestsBlockActionReview { uri, category, reason } => {
                let review = ReviewRequest { uri, category, reason };
                match self.api.request_review(&review).await {
                    Ok(()) => {
                        info!("Review requested for {}", review.uri);
                        IpcReply::ReviewSubmitted
                    }
                    Err(e) => {
                        warn!("Review request for {} failed: {}", review.uri, e);
                        IpcReply::ReviewFailed(e.to_string())
                    }
                }
            }
            IpcRequest::TrustCertificate { host, thumbprint } => {
                self.certs.trust_certificate(&host, &thumbprint);
                IpcReply::CertificateTrusted
            }
        }
    }

    /// An adapter came up, went down or changed address
    pub fn network_changed(&self) {
        self.dns.network_changed();
    }

    /// Stop every loop and the engine, and hand DNS back to DHCP
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let engine = self.engine_slot().take();
        if let Some(engine) = engine {
            engine.stop();
        }
        self.dns.try_enforce(false).await;
        self.relaxed.shutdown();
        self.threshold.shutdown();
        info!("Filter service stopped");
    }
}

/// Tell the GUI when the schedule starts or stops blocking
async fn watch_time_restrictions(
    policy: Arc<PolicyStore>,
    time: Arc<TimeDetection>,
    notifier: Arc<Notifier>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(RESTRICTION_POLL);
    let mut restricted = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now_restricted = policy
            .snapshot()
            .is_some_and(|p| !time.is_now_allowed(&p.config));
        if now_restricted != restricted {
            restricted = now_restricted;
            info!(restricted, "Time restriction changed");
            notifier.notify(&Notification::Status {
                status: if restricted {
                    FilterStatus::TimeRestricted
                } else {
                    FilterStatus::Filtering
                },
            });
        }
    }
}

async fn forward_tampering(
    mut events: tokio::sync::broadcast::Receiver<TamperEvent>,
    reporter: Arc<AccountabilityReporter>,
    settings: Arc<SettingsStore>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                if let TamperEvent::ZoneTampering { to, .. } = &event {
                    if let Err(e) = settings.update(|s| s.last_zone_id = Some(to.clone())) {
                        warn!("Failed to persist time zone: {}", e);
                    }
                }
                reporter.report_tampering(event);
            }
            Err(RecvError::Lagged(missed)) => warn!(missed, "Tamper events dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}
