use std::net::Ipv4Addr;

use ip_network::Ipv4Network;

use crate::Error;

/// The independently activatable rule sets we own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleSet {
    /// Blocks DNS leaving on the real NIC, with self-exemptions.
    DnsBlock,
    /// Drops all IPv6 egress.
    Ipv6Block,
    /// Permits egress only through the TUN plus a small allow-list.
    KillSwitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// A single match condition; all conditions of a rule must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    OutInterface(String),
    SourceUid(u32),
    UdpDstPort(u16),
    TcpDstPort(u16),
    DstAddr(Ipv4Addr),
    DstPrefix(Ipv4Network),
}

/// One filter rule. Evaluation within a set is first-match-wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub matches: Vec<Match>,
    pub verdict: Verdict,
}

impl FilterRule {
    pub fn accept(matches: Vec<Match>) -> Self {
        Self {
            matches,
            verdict: Verdict::Accept,
        }
    }

    pub fn drop(matches: Vec<Match>) -> Self {
        Self {
            matches,
            verdict: Verdict::Drop,
        }
    }
}

/// OS facade for the packet-filter engine.
pub trait FirewallOps: Send + Sync + 'static {
    /// Whether the filter engine is usable at all (privileges, subsystem).
    fn available(&self) -> bool;

    /// Atomically replaces the rules of `set`, preserving rule order.
    fn replace(&self, set: RuleSet, rules: &[FilterRule]) -> Result<(), Error>;

    /// Removes all rules of `set`. Tolerates the set not existing.
    fn clear(&self, set: RuleSet) -> Result<(), Error>;

    /// Removes every trace of us from the filter engine, including state left
    /// behind by a crashed predecessor.
    fn clear_all(&self) -> Result<(), Error>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub struct MockFirewallOps {
        pub sets: Mutex<BTreeMap<&'static str, Vec<FilterRule>>>,
        pub unavailable: bool,
    }

    fn key(set: RuleSet) -> &'static str {
        match set {
            RuleSet::DnsBlock => "dns_block",
            RuleSet::Ipv6Block => "ipv6_block",
            RuleSet::KillSwitch => "kill_switch",
        }
    }

    impl FirewallOps for MockFirewallOps {
        fn available(&self) -> bool {
            !self.unavailable
        }

        fn replace(&self, set: RuleSet, rules: &[FilterRule]) -> Result<(), Error> {
            self.sets.lock().insert(key(set), rules.to_vec());

            Ok(())
        }

        fn clear(&self, set: RuleSet) -> Result<(), Error> {
            self.sets.lock().remove(key(set));

            Ok(())
        }

        fn clear_all(&self) -> Result<(), Error> {
            self.sets.lock().clear();

            Ok(())
        }
    }
}
