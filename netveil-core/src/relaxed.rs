//! Relaxed policy ("bypass"): temporarily suspends relaxable categories
//!
//! Bypasses are counted either by the management server or, when it does not
//! track them, locally against the configured quota. Once the quota is used
//! up no further bypass is granted until the next reset: 08:15 UTC for
//! server-tracked counting, local midnight otherwise.

use crate::error::ApiError;
use crate::notify::{Notification, Notifier};
use crate::platform::SystemClock;
use crate::settings::SettingsStore;
use crate::timer::OneShotTimer;
use crate::web_service::RemoteApi;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, TimeZone, Utc};
use netveil_proxy::config::PolicyStore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaxedPolicyState {
    Deactivated,
    Activated,
    AllUsed,
}

/// Answer to a relaxed-policy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaxedPolicyOutcome {
    Granted { used: u32, permitted: u32 },
    AlreadyActive,
    /// No policy is loaded
    Unavailable,
    /// Wrong passcode
    Denied,
    AllUsed,
    /// The server declined for another reason
    Refused { message: Option<String> },
    Failed(String),
}

#[derive(Debug)]
struct BypassCounts {
    used: u32,
    permitted: u32,
    server_tracked: bool,
    state: RelaxedPolicyState,
}

impl BypassCounts {
    fn exhausted(&self) -> bool {
        self.used >= self.permitted
    }
}

pub struct RelaxedPolicy {
    policy: Arc<PolicyStore>,
    api: Arc<dyn RemoteApi>,
    settings: Arc<SettingsStore>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn SystemClock>,
    counts: Mutex<BypassCounts>,
    /// Held for the whole of a request, across the server round trip
    requests: tokio::sync::Mutex<()>,
    expiry: OneShotTimer,
    reset: OneShotTimer,
    this: Weak<RelaxedPolicy>,
}

impl RelaxedPolicy {
    pub fn new(
        policy: Arc<PolicyStore>,
        api: Arc<dyn RemoteApi>,
        settings: Arc<SettingsStore>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn SystemClock>,
    ) -> Arc<Self> {
        let saved = settings.get();
        Arc::new_cyclic(|this| Self {
            policy,
            api,
            settings,
            notifier,
            clock,
            counts: Mutex::new(BypassCounts {
                used: saved.bypasses_used,
                permitted: saved.bypasses_permitted,
                server_tracked: saved.bypass_server_tracked,
                state: RelaxedPolicyState::Deactivated,
            }),
            requests: tokio::sync::Mutex::new(()),
            expiry: OneShotTimer::new(),
            reset: OneShotTimer::new(),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BypassCounts> {
        match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> RelaxedPolicyState {
        self.lock().state
    }

    /// `(used, permitted)`
    pub fn counts(&self) -> (u32, u32) {
        let counts = self.lock();
        (counts.used, counts.permitted)
    }

    pub fn is_server_tracked(&self) -> bool {
        self.lock().server_tracked
    }

    pub fn is_active(&self) -> bool {
        self.policy.is_bypass_enabled()
    }

    /// Bypasses remain for today
    pub fn has_remaining(&self) -> bool {
        let configured = self.policy.snapshot().map(|p| p.config.bypass.permitted);
        let counts = self.lock();
        match configured {
            Some(permitted) if !counts.server_tracked => counts.used < permitted,
            _ => !counts.exhausted(),
        }
    }

    pub async fn request_relaxed_policy(&self, passcode: Option<&str>) -> RelaxedPolicyOutcome {
        let _serial = self.requests.lock().await;
        if self.policy.is_bypass_enabled() {
            debug!("Relaxed policy already in effect");
            return RelaxedPolicyOutcome::AlreadyActive;
        }

        let Some(policy) = self.policy.snapshot() else {
            return RelaxedPolicyOutcome::Unavailable;
        };
        let bypass = &policy.config.bypass;

        if let Some(expected) = bypass.passcode.as_deref().filter(|p| !p.is_empty()) {
            if passcode != Some(expected) {
                info!("Relaxed policy denied: passcode mismatch");
                return RelaxedPolicyOutcome::Denied;
            }
        }

        let exhausted = {
            let mut counts = self.lock();
            if !counts.server_tracked {
                counts.permitted = bypass.permitted;
            }
            counts.exhausted()
        };
        if exhausted {
            self.mark_all_used();
            return RelaxedPolicyOutcome::AllUsed;
        }

        match self.api.request_bypass().await {
            Ok(response) => {
                {
                    let mut counts = self.lock();
                    counts.server_tracked = true;
                    counts.used = response.used;
                    counts.permitted = response.permitted;
                }
                if response.allowed {
                    self.grant(bypass.duration(), response.message)
                } else if response.used >= response.permitted {
                    self.persist();
                    self.mark_all_used();
                    RelaxedPolicyOutcome::AllUsed
                } else {
                    self.persist();
                    info!("Relaxed policy refused by server");
                    RelaxedPolicyOutcome::Refused {
                        message: response.message,
                    }
                }
            }
            Err(ApiError::NotFound | ApiError::NotConfigured) => {
                {
                    let mut counts = self.lock();
                    counts.server_tracked = false;
                    counts.permitted = bypass.permitted;
                    if counts.exhausted() {
                        drop(counts);
                        self.mark_all_used();
                        return RelaxedPolicyOutcome::AllUsed;
                    }
                    counts.used += 1;
                }
                self.grant(bypass.duration(), None)
            }
            Err(e) => {
                warn!("Relaxed policy request failed: {}", e);
                RelaxedPolicyOutcome::Failed(e.to_string())
            }
        }
    }

    fn grant(&self, duration: Duration, message: Option<String>) -> RelaxedPolicyOutcome {
        let (used, permitted) = {
            let mut counts = self.lock();
            counts.state = RelaxedPolicyState::Activated;
            (counts.used, counts.permitted)
        };
        self.policy.set_bypass_enabled(true);
        self.persist();

        let this = self.this.clone();
        self.expiry.arm(duration, async move {
            if let Some(relaxed) = this.upgrade() {
                relaxed.on_relaxed_policy_timer_expired();
            }
        });
        self.arm_reset();

        info!(used, permitted, "Relaxed policy activated for {:?}", duration);
        self.notifier.notify(&Notification::RelaxedPolicyChange {
            state: RelaxedPolicyState::Activated,
            used,
            permitted,
            message,
        });
        RelaxedPolicyOutcome::Granted { used, permitted }
    }

    /// End the active bypass. Safe to call when none is active.
    pub fn on_relaxed_policy_timer_expired(&self) {
        if !self.policy.is_bypass_enabled() {
            return;
        }
        self.policy.set_bypass_enabled(false);
        self.expiry.disarm();

        let (used, permitted, exhausted) = {
            let mut counts = self.lock();
            counts.state = RelaxedPolicyState::Deactivated;
            (counts.used, counts.permitted, counts.exhausted())
        };
        info!("Relaxed policy expired");
        self.notifier.notify(&Notification::RelaxedPolicyChange {
            state: RelaxedPolicyState::Deactivated,
            used,
            permitted,
            message: None,
        });
        if exhausted {
            self.mark_all_used();
        }
    }

    fn mark_all_used(&self) {
        let (used, permitted, changed) = {
            let mut counts = self.lock();
            let changed = counts.state != RelaxedPolicyState::AllUsed;
            counts.state = RelaxedPolicyState::AllUsed;
            (counts.used, counts.permitted, changed)
        };
        if !changed {
            return;
        }
        info!("All relaxed policies used until reset");
        self.notifier.notify(&Notification::RelaxedPolicyChange {
            state: RelaxedPolicyState::AllUsed,
            used,
            permitted,
            message: None,
        });
        self.arm_reset();
    }

    fn arm_reset(&self) {
        let now = self.clock.now_local();
        let at = next_reset_at(now, self.is_server_tracked());
        let delay = (at - now.with_timezone(&Utc)).to_std().unwrap_or_default();
        debug!("Bypass counts reset at {}", at);

        let this = self.this.clone();
        self.reset.arm(delay, async move {
            if let Some(relaxed) = this.upgrade() {
                relaxed.on_reset().await;
            }
        });
    }

    async fn on_reset(&self) {
        {
            let mut counts = self.lock();
            if !counts.server_tracked {
                counts.used = 0;
            }
        }
        self.update_number_of_bypasses_from_server().await;
    }

    /// Resume reset scheduling after a restart
    pub fn resume(&self) {
        if self.lock().used > 0 {
            self.arm_reset();
        }
    }

    /// Synchronise counts with the server; falls back to the configured
    /// quota when the server does not track bypasses
    pub async fn update_number_of_bypasses_from_server(&self) {
        let configured = self
            .policy
            .snapshot()
            .map(|p| p.config.bypass.permitted)
            .unwrap_or_default();

        let status = self.api.bypass_status().await;
        let (used, permitted, state, changed) = {
            let mut counts = self.lock();
            match status {
                Ok(response) => {
                    counts.server_tracked = true;
                    counts.used = response.used;
                    counts.permitted = response.permitted;
                }
                Err(ApiError::NotFound | ApiError::NotConfigured) => {
                    counts.server_tracked = false;
                    counts.permitted = configured;
                }
                Err(e) => debug!("Bypass status unavailable: {}", e),
            }

            let previous = counts.state;
            if counts.state != RelaxedPolicyState::Activated {
                counts.state = if counts.permitted > 0 && counts.exhausted() {
                    RelaxedPolicyState::AllUsed
                } else {
                    RelaxedPolicyState::Deactivated
                };
            }
            (counts.used, counts.permitted, counts.state, previous != counts.state)
        };
        self.persist();

        if changed {
            self.notifier.notify(&Notification::RelaxedPolicyChange {
                state,
                used,
                permitted,
                message: None,
            });
        }
        if state == RelaxedPolicyState::AllUsed {
            self.arm_reset();
        }
    }

    fn persist(&self) {
        let (used, permitted, server_tracked) = {
            let counts = self.lock();
            (counts.used, counts.permitted, counts.server_tracked)
        };
        if let Err(e) = self.settings.update(|s| {
            s.bypasses_used = used;
            s.bypasses_permitted = permitted;
            s.bypass_server_tracked = server_tracked;
        }) {
            warn!("Failed to persist bypass counts: {}", e);
        }
    }

    /// Cancel pending timers
    pub fn shutdown(&self) {
        self.expiry.disarm();
        self.reset.disarm();
    }
}

/// Next time the bypass quota resets, strictly after `now`
pub fn next_reset_at(now: DateTime<FixedOffset>, server_tracked: bool) -> DateTime<Utc> {
    if server_tracked {
        let reset_time = NaiveTime::from_hms_opt(8, 15, 0).unwrap_or(NaiveTime::MIN);
        let now_utc = now.with_timezone(&Utc);
        let today = now_utc.date_naive().and_time(reset_time).and_utc();
        if today > now_utc {
            today
        } else {
            today + ChronoDuration::days(1)
        }
    } else {
        now.date_naive()
            .succ_opt()
            .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
            .and_then(|midnight| now.offset().from_local_datetime(&midnight).single())
            .map(|midnight| midnight.with_timezone(&Utc))
            .unwrap_or_else(|| now.with_timezone(&Utc) + ChronoDuration::days(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClock, FakeRemoteApi, RecordingSink};
    use crate::web_service::BypassResponse;
    use netveil_proxy::config::PolicyConfiguration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        policy: Arc<PolicyStore>,
        api: Arc<FakeRemoteApi>,
        sink: Arc<RecordingSink>,
        relaxed: Arc<RelaxedPolicy>,
    }

    fn fixture(permitted: u32, passcode: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let policy = Arc::new(PolicyStore::new());
        let mut config = PolicyConfiguration::default();
        config.bypass.permitted = permitted;
        config.bypass.passcode = passcode.map(str::to_string);
        policy.replace(config).unwrap();

        let api = Arc::new(FakeRemoteApi::new());
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")).unwrap());
        let notifier = Arc::new(Notifier::new());
        let sink = Arc::new(RecordingSink::new());
        notifier.subscribe(sink.clone());

        let relaxed = RelaxedPolicy::new(
            policy.clone(),
            api.clone(),
            settings,
            notifier,
            Arc::new(FakeClock::default()),
        );
        Fixture {
            _dir: dir,
            policy,
            api,
            sink,
            relaxed,
        }
    }

    fn granted(used: u32, permitted: u32) -> BypassResponse {
        BypassResponse {
            allowed: true,
            message: None,
            used,
            permitted,
        }
    }

    #[tokio::test]
    async fn test_server_tracked_exhaustion() {
        let f = fixture(0, None);
        f.api.set_bypass_status(Some(BypassResponse {
            allowed: false,
            message: None,
            used: 0,
            permitted: 2,
        }));
        f.relaxed.update_number_of_bypasses_from_server().await;
        f.api.push_bypass(Ok(granted(1, 2)));
        f.api.push_bypass(Ok(granted(2, 2)));

        assert_eq!(
            f.relaxed.request_relaxed_policy(None).await,
            RelaxedPolicyOutcome::Granted { used: 1, permitted: 2 }
        );
        assert!(f.policy.is_bypass_enabled());
        f.relaxed.on_relaxed_policy_timer_expired();

        assert_eq!(
            f.relaxed.request_relaxed_policy(None).await,
            RelaxedPolicyOutcome::Granted { used: 2, permitted: 2 }
        );
        f.relaxed.on_relaxed_policy_timer_expired();
        assert_eq!(f.relaxed.state(), RelaxedPolicyState::AllUsed);

        assert_eq!(
            f.relaxed.request_relaxed_policy(None).await,
            RelaxedPolicyOutcome::AllUsed
        );
        assert_eq!(f.api.bypass_requests(), 2);
        assert!(f.relaxed.is_server_tracked());
    }

    #[tokio::test]
    async fn test_local_counting_when_server_untracked() {
        let f = fixture(2, None);
        for expected in 1..=2 {
            assert_eq!(
                f.relaxed.request_relaxed_policy(None).await,
                RelaxedPolicyOutcome::Granted {
                    used: expected,
                    permitted: 2
                }
            );
            f.relaxed.on_relaxed_policy_timer_expired();
        }
        assert_eq!(
            f.relaxed.request_relaxed_policy(None).await,
            RelaxedPolicyOutcome::AllUsed
        );
        assert_eq!(f.api.bypass_requests(), 2);
        assert!(!f.relaxed.is_server_tracked());
    }

    #[tokio::test]
    async fn test_already_active() {
        let f = fixture(3, None);
        f.relaxed.request_relaxed_policy(None).await;
        assert_eq!(
            f.relaxed.request_relaxed_policy(None).await,
            RelaxedPolicyOutcome::AlreadyActive
        );
        assert_eq!(f.relaxed.counts(), (1, 3));
    }

    #[tokio::test]
    async fn test_passcode_and_missing_policy() {
        let f = fixture(3, Some("1234"));
        assert_eq!(
            f.relaxed.request_relaxed_policy(Some("0000")).await,
            RelaxedPolicyOutcome::Denied
        );
        assert_eq!(f.api.bypass_requests(), 0);
        assert!(matches!(
            f.relaxed.request_relaxed_policy(Some("1234")).await,
            RelaxedPolicyOutcome::Granted { .. }
        ));

        let f = fixture(3, None);
        f.policy.clear();
        assert_eq!(
            f.relaxed.request_relaxed_policy(None).await,
            RelaxedPolicyOutcome::Unavailable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_timer() {
        let f = fixture(3, None);
        f.relaxed.request_relaxed_policy(None).await;
        assert!(f.policy.is_bypass_enabled());

        // Default duration is ten minutes
        tokio::time::sleep(Duration::from_secs(10 * 60 + 1)).await;
        assert!(!f.policy.is_bypass_enabled());
        assert_eq!(f.relaxed.state(), RelaxedPolicyState::Deactivated);
    }

    #[tokio::test]
    async fn test_expiry_idempotent() {
        let f = fixture(3, None);
        f.relaxed.request_relaxed_policy(None).await;
        f.relaxed.on_relaxed_policy_timer_expired();
        f.relaxed.on_relaxed_policy_timer_expired();

        let deactivations = f
            .sink
            .received()
            .into_iter()
            .filter(|n| {
                matches!(
                    n,
                    Notification::RelaxedPolicyChange {
                        state: RelaxedPolicyState::Deactivated,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(deactivations, 1);
    }

    #[tokio::test]
    async fn test_sync_from_server() {
        let f = fixture(5, None);
        f.relaxed.update_number_of_bypasses_from_server().await;
        assert_eq!(f.relaxed.counts(), (0, 5));
        assert!(!f.relaxed.is_server_tracked());

        f.api.set_bypass_status(Some(BypassResponse {
            allowed: false,
            message: None,
            used: 3,
            permitted: 3,
        }));
        f.relaxed.update_number_of_bypasses_from_server().await;
        assert_eq!(f.relaxed.counts(), (3, 3));
        assert_eq!(f.relaxed.state(), RelaxedPolicyState::AllUsed);
    }

    #[test]
    fn test_next_reset_server_tracked() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let before = utc.with_ymd_and_hms(2024, 1, 10, 7, 0, 0).unwrap();
        let after = utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap();
        assert_eq!(
            next_reset_at(before, true),
            Utc.with_ymd_and_hms(2024, 1, 10, 8, 15, 0).unwrap()
        );
        assert_eq!(
            next_reset_at(after, true),
            Utc.with_ymd_and_hms(2024, 1, 11, 8, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_next_reset_local_midnight() {
        let new_york = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = new_york.with_ymd_and_hms(2024, 1, 10, 13, 0, 0).unwrap();
        assert_eq!(
            next_reset_at(now, false),
            Utc.with_ymd_and_hms(2024, 1, 11, 5, 0, 0).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_grant_once() {
        let f = fixture(5, None);
        f.api.set_bypass_delay(Duration::from_millis(20));

        let (a, b) = tokio::join!(
            f.relaxed.request_relaxed_policy(None),
            f.relaxed.request_relaxed_policy(None)
        );
        let granted = [&a, &b]
            .into_iter()
            .filter(|o| matches!(o, RelaxedPolicyOutcome::Granted { .. }))
            .count();
        assert_eq!(granted, 1);
        assert!(a == RelaxedPolicyOutcome::AlreadyActive || b == RelaxedPolicyOutcome::AlreadyActive);
        assert_eq!(f.relaxed.counts(), (1, 5));
        assert_eq!(f.api.bypass_requests(), 1);
    }

    #[tokio::test]
    async fn test_remaining_follows_local_quota() {
        let f = fixture(1, None);
        assert!(f.relaxed.has_remaining());
        f.relaxed.request_relaxed_policy(None).await;
        assert!(!f.relaxed.has_remaining());

        let g = fixture(0, None);
        assert!(!g.relaxed.has_remaining());
    }
}
