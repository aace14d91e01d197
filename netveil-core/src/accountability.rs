//! Block events: reporting to the management server and the block-rate
//! lockout

use crate::notify::{FilterStatus, Notification, Notifier};
use crate::platform::InternetSwitch;
use crate::time::TamperEvent;
use crate::timer::OneShotTimer;
use crate::web_service::RemoteApi;
use chrono::{DateTime, Utc};
use netveil_proxy::config::PolicyStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a request was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    TimeRestriction,
    TextTrigger,
    ImageClassification,
    BadCertificate,
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub block_type: BlockType,
    pub uri: String,
    pub category: Option<String>,
    /// Rule or trigger phrase that matched
    pub trigger: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BlockEvent {
    pub fn new(block_type: BlockType, uri: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            block_type,
            uri: uri.into(),
            category: None,
            trigger: None,
            timestamp,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn notification(&self) -> Notification {
        Notification::BlockAction {
            block_type: self.block_type,
            uri: self.uri.clone(),
            category: self.category.clone(),
            trigger: self.trigger.clone(),
        }
    }
}

/// Counts blocks per trigger period and cuts internet access when the
/// configured limit is reached
pub struct ThresholdEnforcer {
    policy: Arc<PolicyStore>,
    switch: Arc<dyn InternetSwitch>,
    notifier: Arc<Notifier>,
    count: AtomicU32,
    locked_out: Arc<AtomicBool>,
    lockout: OneShotTimer,
}

impl ThresholdEnforcer {
    pub fn new(policy: Arc<PolicyStore>, switch: Arc<dyn InternetSwitch>, notifier: Arc<Notifier>) -> Self {
        Self {
            policy,
            switch,
            notifier,
            count: AtomicU32::new(0),
            locked_out: Arc::new(AtomicBool::new(false)),
            lockout: OneShotTimer::new(),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_locked_out(&self) -> bool {
        self.locked_out.load(Ordering::SeqCst)
    }

    /// Count one block. Returns true when this block started a lockout.
    /// Blocks during a lockout are not counted and tripping clears the count.
    pub fn record_block(&self) -> bool {
        let Some(policy) = self.policy.snapshot() else {
            return false;
        };
        let settings = &policy.config.threshold;
        if !settings.enabled || self.is_locked_out() {
            return false;
        }

        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if count < settings.limit.max(1) {
            return false;
        }
        if self
            .locked_out
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.count.store(0, Ordering::SeqCst);

        let timeout = settings.timeout();
        warn!(count, "Block threshold reached, cutting internet for {:?}", timeout);
        if let Err(e) = self.switch.disable_internet() {
            error!("Failed to disable internet: {}", e);
        }
        self.notifier.notify(&Notification::CooldownEnforced {
            duration_secs: timeout.as_secs(),
        });

        let switch = self.switch.clone();
        let notifier = self.notifier.clone();
        let locked_out = self.locked_out.clone();
        self.lockout.arm(timeout, async move {
            if let Err(e) = switch.enable_internet() {
                error!("Failed to restore internet: {}", e);
            }
            locked_out.store(false, Ordering::SeqCst);
            info!("Block threshold cooldown ended");
            notifier.notify(&Notification::Status {
                status: FilterStatus::Filtering,
            });
        });
        true
    }

    /// Start a new trigger period
    pub fn reset_count(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    /// Reset the counter every trigger period until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let period = self
                .policy
                .snapshot()
                .map(|p| p.config.threshold.trigger_period())
                .unwrap_or(Duration::from_secs(60));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => self.reset_count(),
            }
        }
        debug!("Threshold counter stopped");
    }

    pub fn shutdown(&self) {
        self.lockout.disarm();
    }
}

/// Best-effort delivery of block and tamper events to the management server
pub struct AccountabilityReporter {
    api: Arc<dyn RemoteApi>,
}

impl AccountabilityReporter {
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self { api }
    }

    pub fn report_block(&self, event: BlockEvent) {
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.notify_block(&event).await {
                warn!("Failed to report block of {}: {}", event.uri, e);
            }
        });
    }

    pub fn report_tampering(&self, event: TamperEvent) {
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.report_tampering(&event).await {
                warn!("Failed to report tampering: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for, FakeRemoteApi, FakeSwitch, RecordingSink};
    use netveil_proxy::config::PolicyConfiguration;

    fn enforcer(limit: u32) -> (ThresholdEnforcer, Arc<FakeSwitch>, Arc<RecordingSink>) {
        let policy = Arc::new(PolicyStore::new());
        let mut config = PolicyConfiguration::default();
        config.threshold.enabled = true;
        config.threshold.limit = limit;
        config.threshold.timeout_minutes = 1;
        policy.replace(config).unwrap();

        let switch = Arc::new(FakeSwitch::default());
        let notifier = Arc::new(Notifier::new());
        let sink = Arc::new(RecordingSink::new());
        notifier.subscribe(sink.clone());
        (ThresholdEnforcer::new(policy, switch.clone(), notifier), switch, sink)
    }

    fn cooldowns(sink: &RecordingSink) -> usize {
        sink.received()
            .iter()
            .filter(|n| matches!(n, Notification::CooldownEnforced { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_once() {
        let (enforcer, switch, sink) = enforcer(3);
        let tripped: Vec<bool> = (0..5).map(|_| enforcer.record_block()).collect();
        assert_eq!(tripped, vec![false, false, true, false, false]);
        assert!(enforcer.is_locked_out());
        assert_eq!(enforcer.count(), 0);
        assert_eq!(switch.disabled(), 1);
        assert_eq!(cooldowns(&sink), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!enforcer.is_locked_out());
        assert_eq!(switch.enabled(), 1);
        assert!(sink.received().contains(&Notification::Status {
            status: FilterStatus::Filtering
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_starts_over_after_cooldown() {
        let (enforcer, switch, sink) = enforcer(2);
        enforcer.record_block();
        assert!(enforcer.record_block());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!enforcer.is_locked_out());
        assert!(!enforcer.record_block());
        assert_eq!(enforcer.count(), 1);
        assert_eq!(switch.disabled(), 1);
        assert_eq!(cooldowns(&sink), 1);
    }

    #[tokio::test]
    async fn test_period_reset() {
        let (enforcer, switch, _) = enforcer(3);
        enforcer.record_block();
        enforcer.record_block();
        enforcer.reset_count();
        enforcer.record_block();
        assert_eq!(enforcer.count(), 1);
        assert_eq!(switch.disabled(), 0);
    }

    #[tokio::test]
    async fn test_disabled_threshold_ignored() {
        let (enforcer, _, _) = enforcer(1);
        let mut config = PolicyConfiguration::default();
        config.threshold.enabled = false;
        enforcer.policy.replace(config).unwrap();
        assert!(!enforcer.record_block());
        assert_eq!(enforcer.count(), 0);
    }

    #[tokio::test]
    async fn test_reporter_posts_events() {
        let api = Arc::new(FakeRemoteApi::new());
        let reporter = AccountabilityReporter::new(api.clone());
        let event = BlockEvent::new(BlockType::Url, "http://bad.example/", Utc::now()).with_category("Adult");
        reporter.report_block(event.clone());
        reporter.report_tampering(TamperEvent::TimeTampering { drift_secs: 3600 });

        wait_for(|| api.blocks().len() == 1 && api.tampering().len() == 1).await;
        assert_eq!(api.blocks()[0], event);
    }
}
