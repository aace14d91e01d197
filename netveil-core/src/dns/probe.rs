//! Network probes backed by hickory-resolver and reqwest

use super::{CaptivePortalDetection, ConnectivityProbe, DnsProbe};
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const DNS_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves a hostname against one server, bypassing the system resolver
#[derive(Debug, Default)]
pub struct HickoryDnsProbe;

#[async_trait]
impl DnsProbe for HickoryDnsProbe {
    async fn resolves(&self, server: IpAddr, host: &str) -> bool {
        let servers = NameServerConfigGroup::from_ips_clear(&[server], 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), servers);

        let mut opts = ResolverOpts::default();
        opts.timeout = DNS_TIMEOUT;
        opts.attempts = 1;
        opts.cache_size = 0;

        let resolver = TokioAsyncResolver::tokio(config, opts);
        match resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().next().is_some(),
            Err(e) => {
                debug!("DNS server {} did not resolve {}: {}", server, host, e);
                false
            }
        }
    }
}

/// Plain-HTTP connectivity check; a portal shows up as a redirect or a
/// different body
pub struct HttpConnectivityProbe {
    client: Client,
}

impl HttpConnectivityProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn probe(&self, url: &str, expected_body: &str) -> CaptivePortalDetection {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                return CaptivePortalDetection::NoResponseReturned;
            }
        };

        if response.status() != StatusCode::OK {
            debug!("Connectivity probe returned {}", response.status());
            return CaptivePortalDetection::Yes;
        }

        match response.text().await {
            Ok(body) if body == expected_body => CaptivePortalDetection::No,
            Ok(_) => CaptivePortalDetection::Yes,
            Err(e) => {
                debug!("Connectivity probe body unreadable: {}", e);
                CaptivePortalDetection::NoResponseReturned
            }
        }
    }
}
