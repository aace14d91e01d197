//! Notifications to the companion GUI and requests coming back from it

use crate::accountability::BlockType;
use crate::relaxed::RelaxedPolicyState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Coarse filter state shown by the GUI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStatus {
    Filtering,
    TimeRestricted,
    CooldownActive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BlockAction {
        block_type: BlockType,
        uri: String,
        category: Option<String>,
        trigger: Option<String>,
    },
    CooldownEnforced {
        duration_secs: u64,
    },
    RelaxedPolicyChange {
        state: RelaxedPolicyState,
        used: u32,
        permitted: u32,
        message: Option<String>,
    },
    CaptivePortalState {
        detected: bool,
    },
    Status {
        status: FilterStatus,
    },
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Ordered list of subscribers; each notification reaches every sink in
/// subscription order.
#[derive(Default)]
pub struct Notifier {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => sinks.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    pub fn notify(&self, notification: &Notification) {
        let sinks = match self.sinks.read() {
            Ok(sinks) => sinks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for sink in sinks {
            sink.notify(notification);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().map(|s| s.len()).unwrap_or_default()
    }
}

/// Writes every notification to the log
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        info!(?notification, "Notification");
    }
}

/// Forwards notifications to an IPC writer task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: &Notification) {
        if let Err(e) = self.tx.try_send(notification.clone()) {
            warn!("Dropping notification for IPC client: {}", e);
        }
    }
}

/// Requests sent by the GUI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    RelaxedPolicyRequested {
        #[serde(default)]
        passcode: Option<String>,
    },
    ClientRequestsBlockActionReview {
        uri: String,
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    TrustCertificate {
        host: String,
        thumbprint: String,
    },
}
