//! The configuration record delivered by the control plane.
//!
//! Validation is whole-document: a single invalid entry rejects the reload
//! and the previous configuration stays in effect.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use ip_network::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::providers::ProviderId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalFilter,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub domain_rules: Vec<DomainRuleConfig>,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalFilter {
    #[serde(default)]
    pub allowed_ips: Vec<Ipv4Network>,
    #[serde(default)]
    pub disallowed_ips: Vec<Ipv4Network>,
    #[serde(default)]
    pub disallowed_apps: Vec<String>,
    #[serde(default)]
    pub disable_local: bool,
    /// Provider preference for rules with `fallback = "failover"`.
    #[serde(default)]
    pub failover_order: Vec<ProviderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    pub id: ProviderId,
    pub protocol: TunnelProtocol,
    pub name: String,
    /// Interpreted by the provider; for WireGuard-family tunnels this holds
    /// the textual configuration under the `config` key.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub allowed_ips: Vec<Ipv4Network>,
    #[serde(default)]
    pub disallowed_ips: Vec<Ipv4Network>,
    #[serde(default)]
    pub disallowed_apps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Wireguard,
    Awg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Matched against the executable path or its basename, case-insensitively.
    pub pattern: String,
    /// Provider id, or "direct".
    pub tunnel: ProviderId,
    #[serde(default)]
    pub fallback: Fallback,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    #[default]
    AllowDirect,
    Block,
    Drop,
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Auto,
    Realtime,
    Normal,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainRuleConfig {
    /// Exact FQDN, suffix, or category reference (`geosite:ru`).
    pub pattern: String,
    pub action: DomainAction,
    /// Required for `action = "route"`.
    #[serde(default)]
    pub tunnel: Option<ProviderId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainAction {
    Route,
    Direct,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    #[serde(default = "default_dns_servers")]
    pub servers: Vec<IpAddr>,
    /// Empty means resolve through the direct provider.
    #[serde(default)]
    pub tunnel_ids: Vec<ProviderId>,
    #[serde(default)]
    pub cache: DnsCacheConfig,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: default_dns_servers(),
            tunnel_ids: Vec::new(),
            cache: DnsCacheConfig::default(),
        }
    }
}

fn default_dns_servers() -> Vec<IpAddr> {
    vec![IpAddr::from([1, 1, 1, 1]), IpAddr::from([8, 8, 8, 8])]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_size")]
    pub max_size: usize,
    #[serde(default = "default_min_ttl", with = "seconds")]
    pub min_ttl: Duration,
    #[serde(default = "default_max_ttl", with = "seconds")]
    pub max_ttl: Duration,
    #[serde(default = "default_neg_ttl", with = "seconds")]
    pub neg_ttl: Duration,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_cache_size(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            neg_ttl: default_neg_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> usize {
    4096
}

fn default_min_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_max_ttl() -> Duration {
    Duration::from_secs(86400)
}

fn default_neg_ttl() -> Duration {
    Duration::from_secs(300)
}

mod seconds {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;

        Ok(Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_directives")]
    pub directives: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directives: default_directives(),
        }
    }
}

fn default_directives() -> String {
    "info".to_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate rule pattern '{0}'")]
    DuplicateRulePattern(String),
    #[error("rule '{pattern}' references unknown tunnel '{tunnel}'")]
    UnknownRuleTunnel { pattern: String, tunnel: ProviderId },
    #[error("domain rule '{pattern}' references unknown tunnel '{tunnel}'")]
    UnknownDomainRuleTunnel { pattern: String, tunnel: ProviderId },
    #[error("domain rule '{0}' has action 'route' but names no tunnel")]
    RouteWithoutTunnel(String),
    #[error("domain rule '{pattern}' references unknown category '{category}'")]
    UnknownCategory { pattern: String, category: String },
    #[error("rule '{0}' uses fallback 'failover' but no failover order is configured")]
    FailoverWithoutOrder(String),
    #[error("duplicate tunnel id '{0}'")]
    DuplicateTunnelId(ProviderId),
    #[error("dns cache min_ttl exceeds max_ttl")]
    InvertedTtlClamp,
    #[error("dns cache size must not be zero")]
    ZeroCacheSize,
}

impl Config {
    /// Validates the whole document against itself and the known category
    /// tables. Called before anything is applied.
    pub fn validate(
        &self,
        category_tables: &HashMap<String, Vec<String>>,
    ) -> Result<(), ConfigError> {
        let mut tunnel_ids = BTreeSet::new();

        for tunnel in &self.tunnels {
            if !tunnel_ids.insert(&tunnel.id) {
                return Err(ConfigError::DuplicateTunnelId(tunnel.id.clone()));
            }
        }

        let mut patterns = BTreeSet::new();

        for rule in &self.rules {
            if !patterns.insert(rule.pattern.to_lowercase()) {
                return Err(ConfigError::DuplicateRulePattern(rule.pattern.clone()));
            }

            if !rule.tunnel.is_direct() && !tunnel_ids.contains(&rule.tunnel) {
                return Err(ConfigError::UnknownRuleTunnel {
                    pattern: rule.pattern.clone(),
                    tunnel: rule.tunnel.clone(),
                });
            }

            if rule.fallback == Fallback::Failover && self.global.failover_order.is_empty() {
                return Err(ConfigError::FailoverWithoutOrder(rule.pattern.clone()));
            }
        }

        for rule in &self.domain_rules {
            match (rule.action, &rule.tunnel) {
                (DomainAction::Route, None) => {
                    return Err(ConfigError::RouteWithoutTunnel(rule.pattern.clone()));
                }
                (DomainAction::Route, Some(tunnel))
                    if !tunnel.is_direct() && !tunnel_ids.contains(tunnel) =>
                {
                    return Err(ConfigError::UnknownDomainRuleTunnel {
                        pattern: rule.pattern.clone(),
                        tunnel: tunnel.clone(),
                    });
                }
                _ => {}
            }

            if let Some(category) = rule.pattern.strip_prefix("geosite:")
                && !category_tables.contains_key(category)
            {
                return Err(ConfigError::UnknownCategory {
                    pattern: rule.pattern.clone(),
                    category: category.to_owned(),
                });
            }
        }

        if self.dns.cache.min_ttl > self.dns.cache.max_ttl {
            return Err(ConfigError::InvertedTtlClamp);
        }

        if self.dns.cache.max_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }

        Ok(())
    }
}
