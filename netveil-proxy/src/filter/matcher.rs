//! Host and IP matching logic

use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::HashMap;
use std::net::IpAddr;
use wildmatch::WildMatch;

/// A rule hit: which category matched and how specific the rule was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMatch {
    pub category: u32,
    pub specificity: usize,
}

/// Matcher mapping host patterns and IP ranges to category ids
#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    exact: HashMap<String, Vec<(u32, usize)>>,
    patterns: Vec<(WildMatch, u32, usize)>,
    ipv4_ranges: Vec<(Ipv4Net, u32)>,
    ipv6_ranges: Vec<(Ipv6Net, u32)>,
}

impl HostMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host pattern for a category. Patterns without wildcards are
    /// stored for exact lookup.
    pub fn add_pattern(&mut self, pattern: &str, category: u32) {
        let pattern = pattern.trim().to_ascii_lowercase();
        let specificity = pattern_specificity(&pattern);
        if pattern.contains(['*', '?']) {
            self.patterns.push((WildMatch::new(&pattern), category, specificity));
        } else {
            self.exact
                .entry(pattern)
                .or_default()
                .push((category, specificity));
        }
    }

    pub fn add_ipv4_range(&mut self, range: Ipv4Net, category: u32) {
        self.ipv4_ranges.push((range, category));
    }

    pub fn add_ipv6_range(&mut self, range: Ipv6Net, category: u32) {
        self.ipv6_ranges.push((range, category));
    }

    /// All hostname rules matching `host`
    pub fn match_host(&self, host: &str) -> Vec<HostMatch> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut hits: Vec<HostMatch> = self
            .exact
            .get(&host)
            .into_iter()
            .flatten()
            .map(|&(category, specificity)| HostMatch { category, specificity })
            .collect();

        hits.extend(
            self.patterns
                .iter()
                .filter(|(pattern, _, _)| pattern.matches(&host))
                .map(|&(_, category, specificity)| HostMatch { category, specificity }),
        );

        hits
    }

    /// Categories whose IP ranges contain `ip`
    pub fn match_ip(&self, ip: IpAddr) -> Vec<u32> {
        match ip {
            IpAddr::V4(ipv4) => self
                .ipv4_ranges
                .iter()
                .filter(|(net, _)| net.contains(&ipv4))
                .map(|(_, category)| *category)
                .collect(),
            IpAddr::V6(ipv6) => self
                .ipv6_ranges
                .iter()
                .filter(|(net, _)| net.contains(&ipv6))
                .map(|(_, category)| *category)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
            && self.patterns.is_empty()
            && self.ipv4_ranges.is_empty()
            && self.ipv6_ranges.is_empty()
    }
}

/// Specificity = count of domain labels free of wildcards, plus one for an
/// exact host. `api.example.com` = 4, `*.example.com` = 2.
fn pattern_specificity(pattern: &str) -> usize {
    let literal_labels = pattern
        .split('.')
        .filter(|label| !label.is_empty() && !label.contains(['*', '?']))
        .count();

    if pattern.contains(['*', '?']) {
        literal_labels
    } else {
        literal_labels + 1
    }
}
