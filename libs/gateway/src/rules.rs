//! Resolves executable identity to a provider decision.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use ip_network_table::IpNetworkTable;

use crate::config::{Fallback, GlobalFilter, Priority, RuleConfig, TunnelConfig};
use crate::providers::{ProviderId, ProviderStates};

/// The outcome of a rule lookup.
///
/// A pure function of `(configuration, provider states)`: re-running the
/// lookup with identical inputs yields an identical decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub provider: ProviderId,
    /// Whether the named provider itself carries the flow (as opposed to a
    /// fallback standing in for it).
    pub active: bool,
    pub priority: Priority,
    /// Whether an explicit rule matched. The dispatcher consults domain
    /// rules only when this is false.
    pub matched: bool,
}

struct CompiledRule {
    tunnel: ProviderId,
    fallback: Fallback,
    priority: Priority,
}

/// A tunnel's destination carve-outs, queried by longest-prefix match.
struct TunnelIpPolicy {
    /// `None` means the tunnel carries any destination.
    allowed: Option<IpNetworkTable<()>>,
    disallowed: IpNetworkTable<()>,
}

#[derive(Default)]
pub struct RuleEngine {
    by_pattern: HashMap<String, CompiledRule>,
    disallowed: HashSet<String>,
    /// Apps a specific tunnel refuses to carry; the rule's fallback applies
    /// to them.
    tunnel_disallowed: HashMap<ProviderId, HashSet<String>>,
    /// Destinations a tunnel does (not) carry; excluded ones go direct.
    tunnel_ip_policies: HashMap<ProviderId, TunnelIpPolicy>,
    failover_order: Vec<ProviderId>,
}

impl RuleEngine {
    /// Builds a fresh engine; reloads swap the whole engine atomically.
    pub fn new(rules: &[RuleConfig], global: &GlobalFilter, tunnels: &[TunnelConfig]) -> Self {
        let by_pattern = rules
            .iter()
            .map(|rule| {
                (
                    rule.pattern.to_lowercase(),
                    CompiledRule {
                        tunnel: rule.tunnel.clone(),
                        fallback: rule.fallback,
                        priority: rule.priority,
                    },
                )
            })
            .collect();

        let disallowed = global
            .disallowed_apps
            .iter()
            .map(|pattern| pattern.to_lowercase())
            .collect();

        let tunnel_disallowed = tunnels
            .iter()
            .filter(|tunnel| !tunnel.disallowed_apps.is_empty())
            .map(|tunnel| {
                (
                    tunnel.id.clone(),
                    tunnel
                        .disallowed_apps
                        .iter()
                        .map(|pattern| pattern.to_lowercase())
                        .collect(),
                )
            })
            .collect();

        let tunnel_ip_policies = tunnels
            .iter()
            .filter(|tunnel| !tunnel.allowed_ips.is_empty() || !tunnel.disallowed_ips.is_empty())
            .map(|tunnel| {
                let allowed = (!tunnel.allowed_ips.is_empty())
                    .then(|| prefix_table(&tunnel.allowed_ips));

                (
                    tunnel.id.clone(),
                    TunnelIpPolicy {
                        allowed,
                        disallowed: prefix_table(&tunnel.disallowed_ips),
                    },
                )
            })
            .collect();

        Self {
            by_pattern,
            disallowed,
            tunnel_disallowed,
            tunnel_ip_policies,
            failover_order: global.failover_order.clone(),
        }
    }

    /// Whether `tunnel` carries traffic to `dst` under its IP carve-outs.
    ///
    /// A non-empty `allowed_ips` restricts the tunnel to those prefixes;
    /// `disallowed_ips` punches holes either way. Providers without a policy
    /// carry anything.
    pub fn tunnel_permits(&self, tunnel: &ProviderId, dst: IpAddr) -> bool {
        let Some(policy) = self.tunnel_ip_policies.get(tunnel) else {
            return true;
        };

        if policy.disallowed.longest_match(dst).is_some() {
            return false;
        }

        match &policy.allowed {
            Some(allowed) => allowed.longest_match(dst).is_some(),
            None => true,
        }
    }

    pub fn decide(&self, exe: Option<&Path>, states: &ProviderStates) -> Decision {
        let Some(exe) = exe else {
            // Unknown process; never block, use the global default.
            return catch_all();
        };

        let full_path = exe.to_string_lossy().to_lowercase();
        let basename = exe
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase());

        if self.disallowed.contains(&full_path)
            || basename
                .as_deref()
                .is_some_and(|name| self.disallowed.contains(name))
        {
            return Decision {
                provider: ProviderId::drop(),
                active: true,
                priority: Priority::Auto,
                matched: true,
            };
        }

        let rule = self
            .by_pattern
            .get(&full_path)
            .or_else(|| basename.as_deref().and_then(|name| self.by_pattern.get(name)));

        let Some(rule) = rule else {
            return catch_all();
        };

        let refused_by_tunnel = self
            .tunnel_disallowed
            .get(&rule.tunnel)
            .is_some_and(|apps| {
                apps.contains(&full_path)
                    || basename.as_deref().is_some_and(|name| apps.contains(name))
            });

        if !refused_by_tunnel && (rule.tunnel.is_direct() || states.is_up(&rule.tunnel)) {
            return Decision {
                provider: rule.tunnel.clone(),
                active: true,
                priority: rule.priority,
                matched: true,
            };
        }

        let provider = match rule.fallback {
            Fallback::AllowDirect => ProviderId::direct(),
            Fallback::Block => ProviderId::block(),
            Fallback::Drop => ProviderId::drop(),
            Fallback::Failover => self
                .failover_order
                .iter()
                .find(|candidate| states.is_up(candidate))
                .cloned()
                .unwrap_or_else(ProviderId::block),
        };

        Decision {
            provider,
            active: false,
            priority: rule.priority,
            matched: true,
        }
    }
}

fn prefix_table(prefixes: &[ip_network::Ipv4Network]) -> IpNetworkTable<()> {
    let mut table = IpNetworkTable::new();

    for prefix in prefixes {
        table.insert(*prefix, ());
    }

    table
}

fn catch_all() -> Decision {
    Decision {
        provider: ProviderId::direct(),
        active: true,
        priority: Priority::Auto,
        matched: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderState;
    use test_case::test_case;

    fn engine(fallback: Fallback) -> RuleEngine {
        RuleEngine::new(
            &[RuleConfig {
                pattern: "curl.exe".to_owned(),
                tunnel: ProviderId::from("vpn-a"),
                fallback,
                priority: Priority::Normal,
            }],
            &GlobalFilter {
                failover_order: vec![ProviderId::from("vpn-b"), ProviderId::from("vpn-c")],
                ..Default::default()
            },
            &[],
        )
    }

    fn states(up: &[&str]) -> ProviderStates {
        up.iter()
            .map(|id| (ProviderId::from(*id), ProviderState::Up))
            .collect()
    }

    #[test_case("/usr/bin/curl.exe"; "matches basename of full path")]
    #[test_case("curl.exe"; "matches bare basename")]
    #[test_case("/usr/local/bin/CURL.EXE"; "matches case insensitively")]
    fn matches_executable(path: &str) {
        let engine = engine(Fallback::AllowDirect);

        let decision = engine.decide(Some(Path::new(path)), &states(&["vpn-a"]));

        assert_eq!(decision.provider, ProviderId::from("vpn-a"));
        assert!(decision.active);
        assert!(decision.matched);
    }

    #[test]
    fn unmatched_executable_goes_direct() {
        let engine = engine(Fallback::AllowDirect);

        let decision = engine.decide(Some(Path::new("/bin/ssh")), &states(&["vpn-a"]));

        assert_eq!(decision.provider, ProviderId::direct());
        assert!(!decision.matched);
    }

    #[test]
    fn unknown_process_goes_direct() {
        let engine = engine(Fallback::Block);

        let decision = engine.decide(None, &states(&[]));

        assert_eq!(decision.provider, ProviderId::direct());
        assert!(!decision.matched);
    }

    #[test_case(Fallback::AllowDirect, "direct"; "allow_direct falls back to direct")]
    #[test_case(Fallback::Block, "block"; "block synthesizes refusal")]
    #[test_case(Fallback::Drop, "drop"; "drop discards silently")]
    fn fallback_when_provider_down(fallback: Fallback, expected: &str) {
        let engine = engine(fallback);

        let decision = engine.decide(Some(Path::new("curl.exe")), &states(&[]));

        assert_eq!(decision.provider, ProviderId::from(expected));
        assert!(!decision.active);
        assert!(decision.matched);
    }

    #[test]
    fn failover_walks_preference_order() {
        let engine = engine(Fallback::Failover);

        let decision = engine.decide(Some(Path::new("curl.exe")), &states(&["vpn-c"]));

        assert_eq!(decision.provider, ProviderId::from("vpn-c"));
        assert!(!decision.active);
    }

    #[test]
    fn failover_with_nothing_up_blocks() {
        let engine = engine(Fallback::Failover);

        let decision = engine.decide(Some(Path::new("curl.exe")), &states(&[]));

        assert_eq!(decision.provider, ProviderId::block());
    }

    #[test]
    fn disallowed_app_short_circuits_to_drop() {
        let engine = RuleEngine::new(
            &[RuleConfig {
                pattern: "telemetry.exe".to_owned(),
                tunnel: ProviderId::from("vpn-a"),
                fallback: Fallback::AllowDirect,
                priority: Priority::Auto,
            }],
            &GlobalFilter {
                disallowed_apps: vec!["telemetry.exe".to_owned()],
                ..Default::default()
            },
            &[],
        );

        let decision = engine.decide(
            Some(Path::new("/opt/app/telemetry.exe")),
            &states(&["vpn-a"]),
        );

        assert_eq!(decision.provider, ProviderId::drop());
    }

    #[test]
    fn tunnel_refusing_an_app_triggers_the_fallback() {
        let engine = RuleEngine::new(
            &[RuleConfig {
                pattern: "torrent".to_owned(),
                tunnel: ProviderId::from("vpn-a"),
                fallback: Fallback::Block,
                priority: Priority::Auto,
            }],
            &GlobalFilter::default(),
            &[TunnelConfig {
                id: ProviderId::from("vpn-a"),
                protocol: crate::config::TunnelProtocol::Wireguard,
                name: "Exit A".to_owned(),
                settings: Default::default(),
                allowed_ips: Vec::new(),
                disallowed_ips: Vec::new(),
                disallowed_apps: vec!["torrent".to_owned()],
            }],
        );

        let decision = engine.decide(Some(Path::new("/usr/bin/torrent")), &states(&["vpn-a"]));

        assert_eq!(decision.provider, ProviderId::block());
        assert!(!decision.active);
    }

    #[test]
    fn tunnel_ip_carveouts_gate_destinations() {
        let net = |s: &str| s.parse::<ip_network::Ipv4Network>().unwrap();

        let engine = RuleEngine::new(
            &[],
            &GlobalFilter::default(),
            &[TunnelConfig {
                id: ProviderId::from("vpn-a"),
                protocol: crate::config::TunnelProtocol::Wireguard,
                name: "Exit A".to_owned(),
                settings: Default::default(),
                allowed_ips: vec![net("203.0.113.0/24")],
                disallowed_ips: vec![net("203.0.113.7/32")],
                disallowed_apps: Vec::new(),
            }],
        );

        let id = ProviderId::from("vpn-a");

        // Inside the allowed prefix.
        assert!(engine.tunnel_permits(&id, IpAddr::from([203, 0, 113, 5])));
        // Outside the allowed prefix.
        assert!(!engine.tunnel_permits(&id, IpAddr::from([198, 51, 100, 1])));
        // Disallowed punches a hole into allowed.
        assert!(!engine.tunnel_permits(&id, IpAddr::from([203, 0, 113, 7])));
        // Tunnels without a policy carry anything.
        assert!(engine.tunnel_permits(&ProviderId::from("vpn-b"), IpAddr::from([8, 8, 8, 8])));
    }

    #[test]
    fn decision_is_deterministic() {
        let engine = engine(Fallback::Failover);
        let states = states(&["vpn-b", "vpn-c"]);

        let first = engine.decide(Some(Path::new("curl.exe")), &states);
        let second = engine.decide(Some(Path::new("curl.exe")), &states);

        assert_eq!(first, second);
    }
}
