//! nftables backend.
//!
//! All IPv4 state lives in a single `weir` table (the IPv6 block in `weir6`);
//! deleting a table cascades to its chains and rules, which keeps teardown
//! and crash-recovery sweeps precise. Batches are atomic: a replace either
//! fully applies or leaves the previous rules in place.

use std::collections::BTreeMap;
use std::ffi::CString;

use nftnl::expr::{self};
use nftnl::{Batch, Chain, ChainType, Hook, MsgType, ProtoFamily, Rule, Table, nft_expr};
use parking_lot::Mutex;

use crate::Error;
use crate::ops::{FilterRule, FirewallOps, Match, RuleSet, Verdict};

const TABLE_NAME: &std::ffi::CStr = c"weir";
const TABLE_NAME_V6: &std::ffi::CStr = c"weir6";

const DNS_CHAIN: &std::ffi::CStr = c"weir_dns";
const KILL_SWITCH_CHAIN: &std::ffi::CStr = c"weir_killswitch";
const V6_CHAIN: &std::ffi::CStr = c"weir_v6";

pub struct NftFirewallOps {
    /// Shadow of what is currently installed; we are the table's only writer.
    installed: Mutex<BTreeMap<&'static str, (RuleSet, Vec<FilterRule>)>>,
}

impl NftFirewallOps {
    pub fn new() -> Self {
        Self {
            installed: Mutex::new(BTreeMap::new()),
        }
    }

    fn rebuild_v4(&self, installed: &BTreeMap<&'static str, (RuleSet, Vec<FilterRule>)>) -> Result<(), Error> {
        // A fresh table cannot be added while the old one exists; drop it
        // first in its own batch so ENOENT does not abort the rebuild.
        delete_table(TABLE_NAME, true)?;

        let mut batch = Batch::new();

        let table = Table::new(TABLE_NAME, ProtoFamily::Ipv4);
        batch.add(&table, MsgType::Add);

        let mut chains = Vec::new();

        for (set, rules) in installed.values() {
            let (name, priority) = match set {
                RuleSet::DnsBlock => (DNS_CHAIN, 0),
                RuleSet::KillSwitch => (KILL_SWITCH_CHAIN, 10),
                RuleSet::Ipv6Block => continue,
            };

            let mut chain = Chain::new(name, &table);
            chain.set_hook(Hook::Out, priority);
            chain.set_type(ChainType::Filter);

            chains.push((chain, rules));
        }

        for (chain, _) in &chains {
            batch.add(chain, MsgType::Add);
        }

        for (chain, rules) in &chains {
            for filter_rule in rules.iter() {
                let mut rule = Rule::new(chain);

                for m in &filter_rule.matches {
                    add_match(&mut rule, m)?;
                }

                match filter_rule.verdict {
                    Verdict::Accept => rule.add_expr(&nft_expr!(verdict accept)),
                    Verdict::Drop => rule.add_expr(&nft_expr!(verdict drop)),
                }

                batch.add(&rule, MsgType::Add);
            }
        }

        send_batch(&batch.finalize())
    }

    fn install_v6_block(&self) -> Result<(), Error> {
        delete_table(TABLE_NAME_V6, true)?;

        let mut batch = Batch::new();

        let table = Table::new(TABLE_NAME_V6, ProtoFamily::Ipv6);
        batch.add(&table, MsgType::Add);

        let mut chain = Chain::new(V6_CHAIN, &table);
        chain.set_hook(Hook::Out, 0);
        chain.set_type(ChainType::Filter);
        batch.add(&chain, MsgType::Add);

        let mut rule = Rule::new(&chain);
        rule.add_expr(&nft_expr!(verdict drop));
        batch.add(&rule, MsgType::Add);

        send_batch(&batch.finalize())
    }
}

impl FirewallOps for NftFirewallOps {
    fn available(&self) -> bool {
        mnl::Socket::new(mnl::Bus::Netfilter).is_ok()
    }

    fn replace(&self, set: RuleSet, rules: &[FilterRule]) -> Result<(), Error> {
        let mut installed = self.installed.lock();
        installed.insert(set_key(set), (set, rules.to_vec()));

        match set {
            RuleSet::Ipv6Block => self.install_v6_block(),
            RuleSet::DnsBlock | RuleSet::KillSwitch => self.rebuild_v4(&installed),
        }
    }

    fn clear(&self, set: RuleSet) -> Result<(), Error> {
        let mut installed = self.installed.lock();
        installed.remove(set_key(set));

        match set {
            RuleSet::Ipv6Block => delete_table(TABLE_NAME_V6, true),
            RuleSet::DnsBlock | RuleSet::KillSwitch => {
                if installed.values().any(|(s, _)| *s != RuleSet::Ipv6Block) {
                    self.rebuild_v4(&installed)
                } else {
                    delete_table(TABLE_NAME, true)
                }
            }
        }
    }

    fn clear_all(&self) -> Result<(), Error> {
        self.installed.lock().clear();

        delete_table(TABLE_NAME, true)?;
        delete_table(TABLE_NAME_V6, true)?;

        Ok(())
    }
}

fn set_key(set: RuleSet) -> &'static str {
    match set {
        RuleSet::DnsBlock => "dns_block",
        RuleSet::Ipv6Block => "ipv6_block",
        RuleSet::KillSwitch => "kill_switch",
    }
}

fn add_match(rule: &mut Rule, m: &Match) -> Result<(), Error> {
    match m {
        Match::OutInterface(name) => {
            let name = CString::new(name.as_str())
                .map_err(|e| Error::Engine(format!("invalid interface name: {e}")))?;

            rule.add_expr(&nft_expr!(meta oifname));
            rule.add_expr(&nft_expr!(cmp == expr::InterfaceName::Exact(name)));
        }
        Match::SourceUid(uid) => {
            rule.add_expr(&nft_expr!(meta skuid));
            rule.add_expr(&nft_expr!(cmp == *uid));
        }
        Match::UdpDstPort(port) => {
            rule.add_expr(&nft_expr!(meta l4proto));
            rule.add_expr(&nft_expr!(cmp == libc::IPPROTO_UDP as u8));
            rule.add_expr(&nft_expr!(payload udp dport));
            rule.add_expr(&nft_expr!(cmp == port.to_be()));
        }
        Match::TcpDstPort(port) => {
            rule.add_expr(&nft_expr!(meta l4proto));
            rule.add_expr(&nft_expr!(cmp == libc::IPPROTO_TCP as u8));
            rule.add_expr(&nft_expr!(payload tcp dport));
            rule.add_expr(&nft_expr!(cmp == port.to_be()));
        }
        Match::DstAddr(addr) => {
            rule.add_expr(&nft_expr!(payload ipv4 daddr));
            rule.add_expr(&nft_expr!(cmp == *addr));
        }
        Match::DstPrefix(net) => {
            let prefix = u32::from(net.netmask());
            let netmask_be = u32::MAX.checked_shl(32 - prefix).unwrap_or(0).to_be();

            rule.add_expr(&nft_expr!(payload ipv4 daddr));
            rule.add_expr(&nft_expr!(bitwise mask netmask_be, xor 0u32));
            rule.add_expr(&nft_expr!(cmp == net.network_address()));
        }
    }

    Ok(())
}

/// Sends a batch that deletes `name`, optionally ignoring ENOENT.
fn delete_table(name: &std::ffi::CStr, ignore_enoent: bool) -> Result<(), Error> {
    let family = if name == TABLE_NAME_V6 {
        ProtoFamily::Ipv6
    } else {
        ProtoFamily::Ipv4
    };
    let table = Table::new(name, family);
    let mut batch = Batch::new();
    batch.add(&table, MsgType::Del);

    match send_batch(&batch.finalize()) {
        Ok(()) => Ok(()),
        Err(Error::Engine(msg))
            if ignore_enoent
                && (msg.contains("No such file or directory") || msg.contains("ENOENT")) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Sends a finalized nftnl batch over a netlink socket and processes ACKs.
fn send_batch(batch: &nftnl::FinalizedBatch) -> Result<(), Error> {
    let socket = mnl::Socket::new(mnl::Bus::Netfilter)
        .map_err(|e| Error::Unavailable(format!("failed to open netlink socket: {e}")))?;
    let portid = socket.portid();

    socket
        .send_all(batch)
        .map_err(|e| Error::Engine(format!("failed to send batch: {e}")))?;

    let mut buffer = vec![0; nftnl::nft_nlmsg_maxsize() as usize];
    let mut expected_seqs = batch.sequence_numbers();

    while !expected_seqs.is_empty() {
        let messages = socket
            .recv(&mut buffer[..])
            .map_err(|e| Error::Engine(format!("failed to receive netlink response: {e}")))?;

        for message in messages {
            let message =
                message.map_err(|e| Error::Engine(format!("netlink message error: {e}")))?;
            let expected_seq = expected_seqs
                .next()
                .ok_or_else(|| Error::Engine("unexpected ACK from netfilter".into()))?;

            mnl::cb_run(message, expected_seq, portid)
                .map_err(|e| Error::Engine(format!("netlink ACK error: {e}")))?;
        }
    }

    Ok(())
}
