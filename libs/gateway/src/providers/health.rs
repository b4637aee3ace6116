//! Watches VPN providers for handshake stalls and restarts them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use super::{ProviderId, ProviderRegistry, ProviderState};
use crate::flow::FlowTable;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE: u64 = 25;
const STALL_GRACE: u64 = 30;
const ESCALATE_AFTER: u32 = 3;

/// Samples each UP provider's status every 10 s. A provider whose newest
/// handshake is older than `3 × keepalive + 30 s` is marked failed, its flows
/// are torn down, and a restart is scheduled with exponential back-off.
pub async fn run(
    registry: Arc<ProviderRegistry>,
    flow_table: Arc<FlowTable>,
    cancel: CancellationToken,
) {
    let mut backoffs: BTreeMap<ProviderId, Backoff> = BTreeMap::new();
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let set = registry.snapshot();
        let now_epoch = epoch_now();

        for (id, vpn) in set.vpn_providers() {
            if vpn.state() != ProviderState::Up {
                continue;
            }

            if !is_stalled(&vpn.status_line(), now_epoch) {
                backoffs.remove(id);
                continue;
            }

            let backoff = backoffs.entry(id.clone()).or_default();
            let delay = backoff.next_delay();

            if backoff.attempts >= ESCALATE_AFTER {
                // This is no longer a blip; the operator should hear about it.
                tracing::error!(%id, restarts = backoff.attempts, "Provider keeps losing its handshake");
            } else {
                tracing::warn!(%id, ?delay, "Provider handshake stalled, scheduling restart");
            }

            flow_table.evict_provider(id);

            tokio::spawn({
                let registry = registry.clone();
                let id = id.clone();
                let cancel = cancel.clone();

                async move {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }

                    if let Err(e) = registry.restart(&id).await {
                        tracing::warn!(%id, "Restart failed: {e:#}");
                    }
                }
            });
        }
    }
}

/// Whether the newest peer handshake is too old.
///
/// Reads `last_handshake_time_sec` and `persistent_keepalive_interval` from
/// the engine's `key=value` status lines; several peers yield several
/// handshake lines, the newest counts.
fn is_stalled(status: &str, now_epoch: u64) -> bool {
    let newest_handshake = status
        .lines()
        .filter_map(|line| line.strip_prefix("last_handshake_time_sec="))
        .filter_map(|value| value.trim().parse::<u64>().ok())
        .max();

    let Some(newest_handshake) = newest_handshake else {
        // The engine reports no handshake data; connect timeouts cover that.
        return false;
    };

    let keepalive = status
        .lines()
        .filter_map(|line| line.strip_prefix("persistent_keepalive_interval="))
        .filter_map(|value| value.trim().parse::<u64>().ok())
        .find(|interval| *interval > 0)
        .unwrap_or(DEFAULT_KEEPALIVE);

    now_epoch.saturating_sub(newest_handshake) > 3 * keepalive + STALL_GRACE
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// 2 s → 4 s → 8 s → 16 s, capped; reset by a successful handshake.
#[derive(Debug, Default)]
struct Backoff {
    attempts: u32,
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(2u64 << self.attempts.min(3));

        self.attempts = self.attempts.saturating_add(1);

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handshake_is_healthy() {
        let status = "public_key=ab\nlast_handshake_time_sec=995\npersistent_keepalive_interval=25\n";

        assert!(!is_stalled(status, 1000));
    }

    #[test]
    fn stale_handshake_is_stalled() {
        // Threshold with keepalive 25 is 105 s.
        let status = "last_handshake_time_sec=880\npersistent_keepalive_interval=25\n";

        assert!(is_stalled(status, 1000));
    }

    #[test]
    fn newest_of_several_peers_counts() {
        let status = "last_handshake_time_sec=100\nlast_handshake_time_sec=990\npersistent_keepalive_interval=25\n";

        assert!(!is_stalled(status, 1000));
    }

    #[test]
    fn missing_keepalive_falls_back_to_default() {
        // Threshold with the 25 s default is 105 s.
        assert!(!is_stalled("last_handshake_time_sec=900\n", 1000));
        assert!(is_stalled("last_handshake_time_sec=894\n", 1000));
    }

    #[test]
    fn no_handshake_data_is_not_stalled() {
        assert!(!is_stalled("", 1000));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();

        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
    }
}
