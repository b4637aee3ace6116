//! Packet-filter integration: leak protection, DNS block, kill switch.
//!
//! Four independently activatable modules over one OS facade. Every rule we
//! install is recorded so `close` is precise; a pre-start sweep removes
//! whatever a crashed predecessor left behind. If the filter engine itself is
//! unavailable we run *degraded*: calls become logged no-ops and routing
//! remains the coarse capture mechanism.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod ops;

#[cfg(target_os = "linux")]
mod nft;

#[cfg(target_os = "linux")]
pub use nft::NftFirewallOps;
pub use ops::{FilterRule, FirewallOps, Match, RuleSet, Verdict};

use std::collections::BTreeSet;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};

use ip_network::Ipv4Network;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("filter engine unavailable: {0}")]
    Unavailable(String),
    #[error("netfilter failure: {0}")]
    Engine(String),
}

pub struct FirewallManager<F> {
    ops: F,
    degraded: bool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    active: BTreeSet<&'static str>,
    blocked_processes: BTreeSet<PathBuf>,
    bypass_prefixes: Vec<Ipv4Network>,
    kill_switch: Option<KillSwitchConfig>,
}

#[derive(Clone)]
struct KillSwitchConfig {
    tun_interface: String,
    endpoints: Vec<SocketAddrV4>,
}

impl<F> FirewallManager<F>
where
    F: FirewallOps,
{
    pub fn new(ops: F) -> Self {
        let degraded = !ops.available();

        if degraded {
            tracing::warn!(
                "Packet-filter engine unavailable; running degraded (routing-only capture)"
            );
        }

        Self {
            ops,
            degraded,
            state: Mutex::new(State::default()),
        }
    }

    /// Removes any filter state left behind by a crashed predecessor.
    pub fn sweep_stale(&self) {
        if self.degraded {
            return;
        }

        if let Err(e) = self.ops.clear_all() {
            tracing::debug!("Nothing to sweep: {e}");
        }
    }

    /// Blocks DNS leaving through `interface`, exempting our own uid so the
    /// interceptor can still reach upstreams. Exemptions are evaluated before
    /// the blanket block.
    pub fn block_dns_on(&self, interface: &str, self_uid: u32) -> Result<(), Error> {
        let rules = vec![
            FilterRule::accept(vec![Match::SourceUid(self_uid)]),
            FilterRule::drop(vec![
                Match::OutInterface(interface.to_owned()),
                Match::UdpDstPort(53),
            ]),
            FilterRule::drop(vec![
                Match::OutInterface(interface.to_owned()),
                Match::TcpDstPort(53),
            ]),
        ];

        self.activate(RuleSet::DnsBlock, &rules)
    }

    pub fn unblock_dns(&self) -> Result<(), Error> {
        self.deactivate(RuleSet::DnsBlock)
    }

    /// Drops all IPv6 egress. IPv6 is not routed through the TUN, so without
    /// this it would leak on the real NIC.
    pub fn block_all_ipv6(&self) -> Result<(), Error> {
        self.activate(RuleSet::Ipv6Block, &[FilterRule::drop(vec![])])
    }

    pub fn unblock_ipv6(&self) -> Result<(), Error> {
        self.deactivate(RuleSet::Ipv6Block)
    }

    /// Permits egress only via loopback, the TUN, the given VPN endpoints and
    /// the bypass prefixes; everything else is dropped.
    pub fn enable_kill_switch(
        &self,
        tun_interface: &str,
        endpoints: &[SocketAddrV4],
    ) -> Result<(), Error> {
        self.state.lock().kill_switch = Some(KillSwitchConfig {
            tun_interface: tun_interface.to_owned(),
            endpoints: endpoints.to_vec(),
        });

        let rules = self.kill_switch_rules();

        self.activate(RuleSet::KillSwitch, &rules)
    }

    pub fn disable_kill_switch(&self) -> Result<(), Error> {
        self.state.lock().kill_switch = None;

        self.deactivate(RuleSet::KillSwitch)
    }

    /// Destination carve-outs that stay reachable under the kill switch.
    pub fn add_bypass_prefixes(&self, prefixes: &[Ipv4Network]) -> Result<(), Error> {
        let kill_switch_active = {
            let mut state = self.state.lock();
            state.bypass_prefixes.extend_from_slice(prefixes);

            state.kill_switch.is_some()
        };

        if kill_switch_active {
            let rules = self.kill_switch_rules();

            return self.activate(RuleSet::KillSwitch, &rules);
        }

        Ok(())
    }

    /// Records `path` as blocked.
    ///
    /// Linux has no native per-executable filter match, so enforcement is
    /// routing plus the dispatcher consulting [`Self::is_process_blocked`].
    pub fn block_process(&self, path: &Path) {
        self.state.lock().blocked_processes.insert(path.to_owned());
    }

    pub fn unblock_process(&self, path: &Path) {
        self.state.lock().blocked_processes.remove(path);
    }

    pub fn unblock_all_processes(&self) {
        self.state.lock().blocked_processes.clear();
    }

    pub fn is_process_blocked(&self, path: &Path) -> bool {
        self.state.lock().blocked_processes.contains(path)
    }

    /// Removes every rule we installed. Idempotent; runs on teardown even
    /// after cancellation.
    pub fn close(&self) {
        let active = std::mem::take(&mut self.state.lock().active);

        if self.degraded {
            return;
        }

        for set in [RuleSet::KillSwitch, RuleSet::Ipv6Block, RuleSet::DnsBlock] {
            if !active.contains(set_name(set)) {
                continue;
            }

            if let Err(e) = self.ops.clear(set) {
                tracing::warn!(set = set_name(set), "Failed to clear rule set: {e}");
            }
        }
    }

    fn kill_switch_rules(&self) -> Vec<FilterRule> {
        let state = self.state.lock();
        let Some(config) = state.kill_switch.clone() else {
            return Vec::new();
        };

        let mut rules = vec![
            FilterRule::accept(vec![Match::OutInterface("lo".to_owned())]),
            FilterRule::accept(vec![Match::OutInterface(config.tun_interface)]),
        ];

        for endpoint in &config.endpoints {
            rules.push(FilterRule::accept(vec![
                Match::DstAddr(*endpoint.ip()),
                Match::UdpDstPort(endpoint.port()),
            ]));
        }

        for prefix in &state.bypass_prefixes {
            rules.push(FilterRule::accept(vec![Match::DstPrefix(*prefix)]));
        }

        rules.push(FilterRule::drop(vec![]));

        rules
    }

    fn activate(&self, set: RuleSet, rules: &[FilterRule]) -> Result<(), Error> {
        self.state.lock().active.insert(set_name(set));

        if self.degraded {
            tracing::debug!(set = set_name(set), "Degraded mode; not installing rules");

            return Ok(());
        }

        self.ops.replace(set, rules)?;

        tracing::debug!(set = set_name(set), count = rules.len(), "Installed rule set");

        Ok(())
    }

    fn deactivate(&self, set: RuleSet) -> Result<(), Error> {
        self.state.lock().active.remove(set_name(set));

        if self.degraded {
            return Ok(());
        }

        self.ops.clear(set)?;

        Ok(())
    }
}

fn set_name(set: RuleSet) -> &'static str {
    match set {
        RuleSet::DnsBlock => "dns_block",
        RuleSet::Ipv6Block => "ipv6_block",
        RuleSet::KillSwitch => "kill_switch",
    }
}

#[cfg(test)]
mod tests {
    use super::ops::mock::MockFirewallOps;
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn dns_block_evaluates_exemption_first() {
        let manager = FirewallManager::new(MockFirewallOps::default());

        manager.block_dns_on("eth0", 987).unwrap();

        let sets = manager.ops.sets.lock();
        let rules = sets.get("dns_block").unwrap();

        assert_eq!(rules[0], FilterRule::accept(vec![Match::SourceUid(987)]));
        assert!(rules[1..].iter().all(|r| r.verdict == Verdict::Drop));
    }

    #[test]
    fn kill_switch_rule_order() {
        let manager = FirewallManager::new(MockFirewallOps::default());

        manager
            .enable_kill_switch(
                "weir0",
                &[SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 51820)],
            )
            .unwrap();

        let sets = manager.ops.sets.lock();
        let rules = sets.get("kill_switch").unwrap();

        assert_eq!(
            rules[0],
            FilterRule::accept(vec![Match::OutInterface("lo".to_owned())])
        );
        assert_eq!(
            rules[1],
            FilterRule::accept(vec![Match::OutInterface("weir0".to_owned())])
        );
        assert_eq!(
            rules[2],
            FilterRule::accept(vec![
                Match::DstAddr(Ipv4Addr::new(198, 51, 100, 7)),
                Match::UdpDstPort(51820),
            ])
        );
        assert_eq!(rules.last().unwrap(), &FilterRule::drop(vec![]));
    }

    #[test]
    fn activation_is_idempotent() {
        let manager = FirewallManager::new(MockFirewallOps::default());

        manager.block_all_ipv6().unwrap();
        let first = manager.ops.sets.lock().clone();

        manager.block_all_ipv6().unwrap();
        let second = manager.ops.sets.lock().clone();

        assert_eq!(first, second);
    }

    #[test]
    fn close_clears_every_active_set() {
        let manager = FirewallManager::new(MockFirewallOps::default());

        manager.block_dns_on("eth0", 987).unwrap();
        manager.block_all_ipv6().unwrap();
        manager.enable_kill_switch("weir0", &[]).unwrap();

        manager.close();

        assert!(manager.ops.sets.lock().is_empty());
    }

    #[test]
    fn degraded_mode_is_a_no_op() {
        let ops = MockFirewallOps {
            unavailable: true,
            ..Default::default()
        };
        let manager = FirewallManager::new(ops);

        manager.block_dns_on("eth0", 987).unwrap();
        manager.enable_kill_switch("weir0", &[]).unwrap();
        manager.close();

        assert!(manager.ops.sets.lock().is_empty());
    }

    #[test]
    fn blocked_process_set_is_queryable() {
        let manager = FirewallManager::new(MockFirewallOps::default());
        let path = Path::new("/usr/bin/curl");

        manager.block_process(path);
        assert!(manager.is_process_blocked(path));

        manager.unblock_process(path);
        assert!(!manager.is_process_blocked(path));

        manager.block_process(path);
        manager.unblock_all_processes();
        assert!(!manager.is_process_blocked(path));
    }
}
