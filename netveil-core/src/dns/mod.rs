//! Filtering-DNS enforcement on the machine's network adapters

pub mod enforcement;
pub mod probe;

pub use enforcement::{are_dns_servers_changing, DnsEnforcement};
pub use probe::{HickoryDnsProbe, HttpConnectivityProbe};

use async_trait::async_trait;
use std::net::IpAddr;

/// Result of probing for a captive portal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptivePortalDetection {
    No,
    Yes,
    /// The probe got no answer at all; neither open nor captive is known
    NoResponseReturned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsEvent {
    /// The filtering DNS pair applied to the adapters changed
    Changed {
        primary: Option<IpAddr>,
        secondary: Option<IpAddr>,
    },
}

/// Checks that a specific DNS server answers queries
#[async_trait]
pub trait DnsProbe: Send + Sync {
    async fn resolves(&self, server: IpAddr, host: &str) -> bool;
}

/// Fetches a well-known URL to tell open networks from captive portals
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, url: &str, expected_body: &str) -> CaptivePortalDetection;
}
