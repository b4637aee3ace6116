//! Resolves DNS names to a routing action.
//!
//! Three indexes are consulted in order: exact FQDNs, a reversed-label
//! suffix trie, then category membership. First match wins.

use std::collections::HashMap;

use crate::config::{self, DomainRuleConfig};
use crate::providers::ProviderId;

/// What to do with a query (or a flow whose destination reverse-maps to a
/// domain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainDecision {
    Route(ProviderId),
    Direct,
    Block,
}

pub struct DomainRuleEngine {
    exact: HashMap<String, DomainDecision>,
    suffixes: SuffixTrie,
    categories: Vec<(SuffixTrie, DomainDecision)>,
    /// Applied when nothing matches: resolve via the default-DNS provider.
    default: DomainDecision,
}

impl DomainRuleEngine {
    /// Builds a fresh engine; reloads swap the whole engine atomically.
    ///
    /// Category references (`geosite:ru`) are resolved against
    /// `category_tables` at build time.
    pub fn new(
        rules: &[DomainRuleConfig],
        category_tables: &HashMap<String, Vec<String>>,
        default_dns_provider: ProviderId,
    ) -> Self {
        let mut exact = HashMap::new();
        let mut suffixes = SuffixTrie::default();
        let mut categories = Vec::new();

        for rule in rules {
            let decision = match (rule.action, &rule.tunnel) {
                (config::DomainAction::Block, _) => DomainDecision::Block,
                (config::DomainAction::Direct, _) => DomainDecision::Direct,
                (config::DomainAction::Route, Some(tunnel)) => {
                    DomainDecision::Route(tunnel.clone())
                }
                // Rejected by config validation.
                (config::DomainAction::Route, None) => continue,
            };

            if let Some(category) = rule.pattern.strip_prefix("geosite:") {
                let Some(members) = category_tables.get(category) else {
                    continue; // Rejected by config validation.
                };

                let mut trie = SuffixTrie::default();

                for member in members {
                    trie.insert(&normalize(member));
                }

                categories.push((trie, decision));
                continue;
            }

            let pattern = normalize(&rule.pattern);

            // A pattern is both an exact match and a suffix for subdomains.
            exact.insert(pattern.clone(), decision.clone());
            suffixes.insert_decision(&pattern, decision);
        }

        Self {
            exact,
            suffixes,
            categories,
            default: DomainDecision::Route(default_dns_provider),
        }
    }

    pub fn decide(&self, domain: &str) -> DomainDecision {
        let domain = normalize(domain);

        if let Some(decision) = self.exact.get(&domain) {
            return decision.clone();
        }

        if let Some(decision) = self.suffixes.lookup(&domain) {
            return decision.clone();
        }

        for (trie, decision) in &self.categories {
            if trie.lookup(&domain).is_some() {
                return decision.clone();
            }
        }

        self.default.clone()
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_lowercase()
}

/// A trie over reversed domain labels.
///
/// `example.com` is stored as `com → example` and matches any name whose
/// label chain ends in those labels.
#[derive(Default)]
struct SuffixTrie {
    root: Node,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    decision: Option<DomainDecision>,
}

impl SuffixTrie {
    fn insert(&mut self, domain: &str) {
        self.insert_decision(domain, DomainDecision::Direct);
    }

    fn insert_decision(&mut self, domain: &str, decision: DomainDecision) {
        let mut node = &mut self.root;

        for label in domain.rsplit('.') {
            node = node.children.entry(label.to_owned()).or_default();
        }

        node.decision = Some(decision);
    }

    /// Returns the decision of the longest matching suffix.
    fn lookup(&self, domain: &str) -> Option<&DomainDecision> {
        let mut node = &self.root;
        let mut best = None;

        for label in domain.rsplit('.') {
            let Some(child) = node.children.get(label) else {
                break;
            };

            node = child;

            if let Some(decision) = &node.decision {
                best = Some(decision);
            }
        }

        best
    }
}
