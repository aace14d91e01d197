//! Category engine: compiled blacklist/whitelist rules and text triggers

use super::matcher::HostMatcher;
use super::triggers::{TriggerMatch, TriggerMatcher};
use crate::config::schema::{CategoryKind, PolicyConfiguration, RuleGroup};
use crate::error::{ProxyError, Result};
use indexmap::IndexMap;
use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Name and behaviour of a configured category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryInfo {
    pub id: u32,
    pub name: String,
    pub kind: CategoryKind,
    pub relaxable: bool,
}

/// Outcome of URL classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlVerdict {
    /// No rule matched
    Unmatched,
    /// Allow rules won; response inspection is skipped
    Whitelisted(Vec<u32>),
    /// Block rules won
    Blacklisted(Vec<u32>),
}

/// Compiled view of a policy's categories.
///
/// Uses "more specific wins" when both allow and block rules match a host;
/// on a tie the block rule wins.
#[derive(Debug, Clone, Default)]
pub struct CategoryEngine {
    matcher: HostMatcher,
    triggers: TriggerMatcher,
    categories: HashMap<u32, CategoryInfo>,
}

impl CategoryEngine {
    /// Compile every category of a policy
    pub fn from_config(config: &PolicyConfiguration) -> Result<Self> {
        let mut matcher = HostMatcher::new();
        let mut triggers = TriggerMatcher::new();
        let mut categories = HashMap::new();

        for (name, category) in &config.categories {
            let mut processed = HashSet::new();
            for group_name in &category.groups {
                Self::expand_group(
                    group_name,
                    category.id,
                    &config.groups,
                    &mut matcher,
                    &mut processed,
                )?;
            }

            if category.kind == CategoryKind::Block {
                for phrase in &category.triggers {
                    triggers.add(phrase, category.id);
                }
            }

            categories.insert(
                category.id,
                CategoryInfo {
                    id: category.id,
                    name: name.clone(),
                    kind: category.kind,
                    relaxable: category.relaxable,
                },
            );
        }

        tracing::debug!(
            categories = categories.len(),
            triggers = triggers.len(),
            "Compiled category engine"
        );

        Ok(Self {
            matcher,
            triggers,
            categories,
        })
    }

    /// Recursively expand a group and add its hosts/IPs to the matcher
    fn expand_group(
        group_name: &str,
        category: u32,
        groups: &IndexMap<String, RuleGroup>,
        matcher: &mut HostMatcher,
        processed: &mut HashSet<String>,
    ) -> Result<()> {
        // Avoid reprocessing groups (handles DAG structure)
        if !processed.insert(group_name.to_string()) {
            return Ok(());
        }

        let group = groups.get(group_name).ok_or_else(|| ProxyError::GroupNotFound {
            group: group_name.to_string(),
        })?;

        for host in &group.hosts {
            matcher.add_pattern(host, category);
        }

        for range_str in &group.ipv4_ranges {
            let range = range_str.parse::<Ipv4Net>().map_err(|e| {
                ProxyError::Network(format!("Invalid IPv4 range {}: {}", range_str, e))
            })?;
            matcher.add_ipv4_range(range, category);
        }

        for range_str in &group.ipv6_ranges {
            let range = range_str.parse::<Ipv6Net>().map_err(|e| {
                ProxyError::Network(format!("Invalid IPv6 range {}: {}", range_str, e))
            })?;
            matcher.add_ipv6_range(range, category);
        }

        for child_name in &group.groups {
            Self::expand_group(child_name, category, groups, matcher, processed)?;
        }

        Ok(())
    }

    pub fn category(&self, id: u32) -> Option<&CategoryInfo> {
        self.categories.get(&id)
    }

    pub fn category_name(&self, id: u32) -> String {
        self.categories
            .get(&id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("category {id}"))
    }

    /// Whether a category is enforced given the relaxed-policy flag
    pub fn is_enforced(&self, id: u32, relaxed: bool) -> bool {
        match self.categories.get(&id) {
            Some(info) => !(relaxed && info.relaxable),
            None => true,
        }
    }

    /// Classify a host (and optionally its resolved address)
    pub fn classify(&self, host: &str, ip: Option<IpAddr>, relaxed: bool) -> UrlVerdict {
        let mut best_allow: Option<usize> = None;
        let mut best_block: Option<usize> = None;
        let mut allow_ids = Vec::new();
        let mut block_ids = Vec::new();

        for hit in self.matcher.match_host(host) {
            let Some(info) = self.categories.get(&hit.category) else {
                continue;
            };
            match info.kind {
                CategoryKind::Allow => {
                    best_allow = best_allow.max(Some(hit.specificity));
                    push_unique(&mut allow_ids, hit.category);
                }
                CategoryKind::Block if self.is_enforced(hit.category, relaxed) => {
                    best_block = best_block.max(Some(hit.specificity));
                    push_unique(&mut block_ids, hit.category);
                }
                CategoryKind::Block => {}
            }
        }

        match (best_allow, best_block) {
            (Some(allow), Some(block)) if allow > block => return UrlVerdict::Whitelisted(allow_ids),
            (_, Some(_)) => return UrlVerdict::Blacklisted(block_ids),
            (Some(_), None) => return UrlVerdict::Whitelisted(allow_ids),
            (None, None) => {}
        }

        // No hostname matches, fall back to address ranges; block wins a tie
        let Some(addr) = ip else {
            return UrlVerdict::Unmatched;
        };
        for category in self.matcher.match_ip(addr) {
            match self.categories.get(&category).map(|c| c.kind) {
                Some(CategoryKind::Allow) => push_unique(&mut allow_ids, category),
                Some(CategoryKind::Block) if self.is_enforced(category, relaxed) => {
                    push_unique(&mut block_ids, category)
                }
                _ => {}
            }
        }

        if !block_ids.is_empty() {
            UrlVerdict::Blacklisted(block_ids)
        } else if !allow_ids.is_empty() {
            UrlVerdict::Whitelisted(allow_ids)
        } else {
            UrlVerdict::Unmatched
        }
    }

    /// Look for a blacklist trigger phrase in response text
    pub fn match_text(&self, text: &str, max_bytes: usize, relaxed: bool) -> Option<TriggerMatch> {
        self.triggers
            .find(text, max_bytes, |category| self.is_enforced(category, relaxed))
    }
}

fn push_unique(ids: &mut Vec<u32>, id: u32) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}
