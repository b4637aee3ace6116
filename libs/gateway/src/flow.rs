//! The dispatcher's flow table.
//!
//! Keyed by 5-tuple. Once a flow's provider is chosen it never changes;
//! configuration reloads only affect new flows.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::providers::ProviderId;

const TCP_IDLE: Duration = Duration::from_secs(2 * 60 * 60);
const UDP_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: FlowProtocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub pid: Option<u32>,
    pub exe: Option<PathBuf>,
    pub provider: ProviderId,
    pub decided_at: Instant,
    last_seen: Instant,
}

#[derive(Default)]
pub struct FlowTable {
    inner: RwLock<HashMap<FlowKey, FlowEntry>>,
}

impl FlowTable {
    pub fn insert(
        &self,
        key: FlowKey,
        pid: Option<u32>,
        exe: Option<PathBuf>,
        provider: ProviderId,
        now: Instant,
    ) {
        tracing::debug!(?key, %provider, ?pid, "New flow");

        self.inner.write().insert(
            key,
            FlowEntry {
                pid,
                exe,
                provider,
                decided_at: now,
                last_seen: now,
            },
        );
    }

    /// Looks up the flow and refreshes its idle timer.
    pub fn get(&self, key: &FlowKey, now: Instant) -> Option<FlowEntry> {
        let mut inner = self.inner.write();
        let entry = inner.get_mut(key)?;

        entry.last_seen = now;

        Some(entry.clone())
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Removes a flow eagerly (TCP FIN/RST or proxy teardown).
    pub fn remove(&self, key: &FlowKey) {
        if self.inner.write().remove(key).is_some() {
            tracing::debug!(?key, "Flow closed");
        }
    }

    /// Evicts idle flows. Driven by a periodic sweep.
    pub fn evict_idle(&self, now: Instant) {
        self.inner.write().retain(|key, entry| {
            let idle_limit = match key.protocol {
                FlowProtocol::Tcp => TCP_IDLE,
                FlowProtocol::Udp => UDP_IDLE,
            };

            let keep = now.saturating_duration_since(entry.last_seen) < idle_limit;

            if !keep {
                tracing::debug!(?key, "Flow idle, evicting");
            }

            keep
        });
    }

    /// Evicts every flow carried by `provider` (provider restart).
    pub fn evict_provider(&self, provider: &ProviderId) {
        self.inner
            .write()
            .retain(|_, entry| &entry.provider != provider);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
