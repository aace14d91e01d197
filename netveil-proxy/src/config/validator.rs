//! Configuration validation including cycle detection

use super::schema::{PolicyConfiguration, RuleGroup, TimeRestrictionModel};
use crate::error::{Result, ValidationError};
use indexmap::IndexMap;
use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate an entire policy
    pub fn validate(config: &PolicyConfiguration) -> Result<()> {
        Self::check_cycles(config)?;
        Self::validate_references(config)?;
        Self::validate_patterns(config)?;
        Self::validate_category_ids(config)?;
        Self::validate_time_restrictions(config)?;
        Self::validate_dns(config)?;
        Ok(())
    }

    /// Check for cycles in group references using DFS
    fn check_cycles(config: &PolicyConfiguration) -> Result<()> {
        for group_name in config.groups.keys() {
            let mut visited = HashSet::new();
            let mut path = Vec::new();
            Self::dfs_cycle_check(group_name, &config.groups, &mut visited, &mut path)?;
        }
        Ok(())
    }

    /// DFS-based cycle detection
    fn dfs_cycle_check(
        group_name: &str,
        groups: &IndexMap<String, RuleGroup>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Result<()> {
        // If this group is in the current path, we found a cycle
        if path.iter().any(|p| p == group_name) {
            path.push(group_name.to_string());
            return Err(ValidationError::CycleDetected {
                path: path.join(" -> "),
            }
            .into());
        }

        if visited.contains(group_name) {
            return Ok(());
        }

        visited.insert(group_name.to_string());
        path.push(group_name.to_string());

        if let Some(group) = groups.get(group_name) {
            for child in &group.groups {
                Self::dfs_cycle_check(child, groups, visited, path)?;
            }
        }

        path.pop();
        Ok(())
    }

    /// Validate that all group references exist
    fn validate_references(config: &PolicyConfiguration) -> Result<()> {
        for (group_name, group) in &config.groups {
            for ref_name in &group.groups {
                if !config.groups.contains_key(ref_name) {
                    return Err(ValidationError::UnknownGroup {
                        group: format!("{} -> {}", group_name, ref_name),
                    }
                    .into());
                }
            }
        }

        for (category_name, category) in &config.categories {
            for ref_name in &category.groups {
                if !config.groups.contains_key(ref_name) {
                    return Err(ValidationError::UnknownGroup {
                        group: format!("category {} -> {}", category_name, ref_name),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Validate wildcard patterns and CIDR ranges
    fn validate_patterns(config: &PolicyConfiguration) -> Result<()> {
        for (group_name, group) in &config.groups {
            for pattern in &group.hosts {
                if pattern.is_empty()
                    || pattern.contains("**")
                    || pattern.contains('\0')
                    || pattern.contains('\n')
                {
                    return Err(ValidationError::InvalidPattern {
                        pattern: format!("{} in group {}", pattern, group_name),
                    }
                    .into());
                }
            }

            for range in &group.ipv4_ranges {
                if range.parse::<Ipv4Net>().is_err() {
                    return Err(ValidationError::InvalidCidr { cidr: range.clone() }.into());
                }
            }

            for range in &group.ipv6_ranges {
                if range.parse::<Ipv6Net>().is_err() {
                    return Err(ValidationError::InvalidCidr { cidr: range.clone() }.into());
                }
            }
        }

        Ok(())
    }

    fn validate_category_ids(config: &PolicyConfiguration) -> Result<()> {
        let mut seen: HashMap<u32, &str> = HashMap::new();
        for (name, category) in &config.categories {
            if let Some(first) = seen.insert(category.id, name) {
                return Err(ValidationError::DuplicateCategoryId {
                    id: category.id,
                    first: first.to_string(),
                    second: name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn validate_time_restrictions(config: &PolicyConfiguration) -> Result<()> {
        for (day, model) in config.time_restrictions.iter() {
            Self::validate_time_model(model).map_err(|reason| {
                ValidationError::InvalidTimeRestriction {
                    day: day.to_string(),
                    reason,
                }
            })?;
        }
        Ok(())
    }

    /// Boundaries lie in [0, 24], never decrease and come in start/end pairs
    pub fn validate_time_model(model: &TimeRestrictionModel) -> std::result::Result<(), String> {
        let bounds = &model.enabled_through;
        if bounds.len() % 2 != 0 {
            return Err(format!("expected start/end pairs, got {} boundaries", bounds.len()));
        }

        for hour in bounds {
            if !(0.0..=24.0).contains(hour) {
                return Err(format!("boundary {hour} outside [0, 24]"));
            }
        }

        if bounds.windows(2).any(|w| w[1] < w[0]) {
            return Err("boundaries must be non-decreasing".to_string());
        }

        Ok(())
    }

    fn validate_dns(config: &PolicyConfiguration) -> Result<()> {
        for address in [&config.dns.primary, &config.dns.secondary]
            .into_iter()
            .flatten()
        {
            let trimmed = address.trim();
            if !trimmed.is_empty() && trimmed.parse::<IpAddr>().is_err() {
                return Err(ValidationError::InvalidDnsServer {
                    address: address.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::Category;
    use crate::error::ProxyError;

    fn group(children: &[&str]) -> RuleGroup {
        RuleGroup {
            groups: children.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn category(id: u32, groups: &[&str]) -> Category {
        Category {
            id,
            description: String::new(),
            kind: Default::default(),
            relaxable: false,
            groups: groups.iter().map(|s| s.to_string()).collect(),
            triggers: vec![],
        }
    }

    #[test]
    fn test_no_cycle() {
        let mut config = PolicyConfiguration::default();
        config.groups.insert("a".to_string(), group(&["b"]));
        config.groups.insert("b".to_string(), group(&[]));

        assert!(ConfigValidator::check_cycles(&config).is_ok());
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_detect_cycle() {
        let mut config = PolicyConfiguration::default();
        config.groups.insert("a".to_string(), group(&["b"]));
        config.groups.insert("b".to_string(), group(&["a"]));

        let err = ConfigValidator::check_cycles(&config).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Validation(ValidationError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_unknown_category_group() {
        let mut config = PolicyConfiguration::default();
        config.categories.insert("adult".to_string(), category(4, &["missing"]));

        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_category_id() {
        let mut config = PolicyConfiguration::default();
        config.categories.insert("a".to_string(), category(4, &[]));
        config.categories.insert("b".to_string(), category(4, &[]));

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Validation(ValidationError::DuplicateCategoryId { id: 4, .. })
        ));
    }

    #[test]
    fn test_time_model_bounds() {
        assert!(ConfigValidator::validate_time_model(&TimeRestrictionModel::new(true, [8.0, 17.0])).is_ok());
        assert!(ConfigValidator::validate_time_model(&TimeRestrictionModel::new(true, [0.0, 24.0])).is_ok());
        assert!(ConfigValidator::validate_time_model(&TimeRestrictionModel::new(true, [17.0, 8.0])).is_err());
        assert!(ConfigValidator::validate_time_model(&TimeRestrictionModel::new(true, [8.0, 25.0])).is_err());
        assert!(ConfigValidator::validate_time_model(&TimeRestrictionModel::new(true, [8.0])).is_err());
    }

    #[test]
    fn test_invalid_dns_server() {
        let mut config = PolicyConfiguration::default();
        config.dns.primary = Some("not-an-address".to_string());
        assert!(ConfigValidator::validate(&config).is_err());

        config.dns.primary = Some("  ".to_string());
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_cidr() {
        let mut config = PolicyConfiguration::default();
        config.groups.insert(
            "lan".to_string(),
            RuleGroup {
                ipv4_ranges: vec!["10.0.0.0/33".to_string()],
                ..Default::default()
            },
        );
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
