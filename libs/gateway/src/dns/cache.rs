//! Forward and reverse DNS caches.
//!
//! Forward entries answer repeat queries with decremented TTLs; the reverse
//! table lets the dispatcher apply domain rules to direct-IP connections
//! that followed a DNS lookup. Both are LRU-bounded.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::DnsCacheConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub qname: String,
    pub qtype: RecordType,
}

impl CacheKey {
    pub fn new(qname: &str, qtype: RecordType) -> Self {
        Self {
            qname: qname.trim_end_matches('.').to_lowercase(),
            qtype,
        }
    }
}

struct ForwardEntry {
    response: Message,
    inserted_at: Instant,
    ttl: Duration,
    negative: bool,
    /// Resolved through a fallback because the routing provider was down;
    /// flushed when that provider comes back up.
    provisional: bool,
}

struct ReverseEntry {
    domain: String,
    expires_at: Instant,
}

pub struct DnsCache {
    config: DnsCacheConfig,
    forward: Mutex<LruCache<CacheKey, ForwardEntry>>,
    reverse: Mutex<LruCache<IpAddr, ReverseEntry>>,
}

impl DnsCache {
    pub fn new(config: DnsCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size.max(1)).expect("max(1) is non-zero");

        Self {
            config,
            forward: Mutex::new(LruCache::new(capacity)),
            reverse: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Answers from cache, echoing the query's transaction id. Refreshes the
    /// entry's LRU position.
    pub fn answer(&self, id: u16, key: &CacheKey, now: Instant) -> Option<Message> {
        if !self.config.enabled {
            return None;
        }

        let mut forward = self.forward.lock();
        let entry = forward.get(key)?;

        let elapsed = now.saturating_duration_since(entry.inserted_at);

        if elapsed >= entry.ttl {
            forward.pop(key);

            return None;
        }

        let mut response = entry.response.clone();
        response.set_id(id);

        if !entry.negative {
            decrement_ttls(&mut response, elapsed);
        }

        tracing::trace!(qname = %key.qname, qtype = %key.qtype, negative = entry.negative, "Cache hit");

        Some(response)
    }

    /// Caches a forwarded response, clamping TTLs to `[min_ttl, max_ttl]`,
    /// and records its A answers in the reverse table.
    pub fn insert(&self, key: CacheKey, response: &Message, provisional: bool, now: Instant) {
        if !self.config.enabled {
            return;
        }

        if response.truncated() {
            tracing::trace!("Refusing to cache truncated response");

            return;
        }

        let upstream_ttl = response
            .answers()
            .iter()
            .map(|record| Duration::from_secs(u64::from(record.ttl())))
            .min()
            .unwrap_or(Duration::ZERO);

        let ttl = upstream_ttl.clamp(self.config.min_ttl, self.config.max_ttl);

        let mut clamped = response.clone();
        clamp_ttls(&mut clamped, self.config.min_ttl, self.config.max_ttl);

        {
            let mut reverse = self.reverse.lock();

            for record in clamped.answers() {
                let ip = match record.data() {
                    RData::A(a) => IpAddr::V4(a.0),
                    RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
                    _ => continue,
                };

                reverse.put(
                    ip,
                    ReverseEntry {
                        domain: key.qname.clone(),
                        expires_at: now + ttl,
                    },
                );
            }
        }

        self.forward.lock().put(
            key,
            ForwardEntry {
                response: clamped,
                inserted_at: now,
                ttl,
                negative: false,
                provisional,
            },
        );
    }

    /// Caches a negative answer (NXDOMAIN) for `neg_ttl`.
    pub fn insert_negative(&self, key: CacheKey, response: &Message, now: Instant) {
        if !self.config.enabled {
            return;
        }

        self.forward.lock().put(
            key,
            ForwardEntry {
                response: response.clone(),
                inserted_at: now,
                ttl: self.config.neg_ttl,
                negative: true,
                provisional: false,
            },
        );
    }

    /// Drops every provisional entry so the next query re-resolves through
    /// the provider that just came up.
    pub fn flush_provisional(&self) {
        let mut forward = self.forward.lock();

        let provisional = forward
            .iter()
            .filter(|(_, entry)| entry.provisional)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        for key in provisional {
            forward.pop(&key);
        }
    }

    /// The domain that resolved to `ip`, if that answer is still within TTL.
    pub fn reverse_lookup(&self, ip: IpAddr, now: Instant) -> Option<String> {
        let mut reverse = self.reverse.lock();
        let entry = reverse.get(&ip)?;

        if now >= entry.expires_at {
            reverse.pop(&ip);

            return None;
        }

        Some(entry.domain.clone())
    }
}

fn decrement_ttls(message: &mut Message, elapsed: Duration) {
    let elapsed_secs = u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX);

    let answers = message
        .take_answers()
        .into_iter()
        .map(|mut record| {
            let remaining = record.ttl().saturating_sub(elapsed_secs);
            record.set_ttl(remaining);

            record
        })
        .collect::<Vec<_>>();

    message.insert_answers(answers);
}

fn clamp_ttls(message: &mut Message, min: Duration, max: Duration) {
    let min_secs = u32::try_from(min.as_secs()).unwrap_or(u32::MAX);
    let max_secs = u32::try_from(max.as_secs()).unwrap_or(u32::MAX);

    let answers = message
        .take_answers()
        .into_iter()
        .map(|mut record| {
            let clamped = record.ttl().clamp(min_secs, max_secs);
            record.set_ttl(clamped);

            record
        })
        .collect::<Vec<_>>();

    message.insert_answers(answers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, Record};
    use std::net::Ipv4Addr;
    use std::str::FromStr as _;

    fn config() -> DnsCacheConfig {
        DnsCacheConfig {
            enabled: true,
            max_size: 16,
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(600),
            neg_ttl: Duration::from_secs(30),
        }
    }

    fn response(qname: &str, ip: Ipv4Addr, ttl: u32) -> Message {
        let name = Name::from_str(qname).unwrap();

        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(name, ttl, RData::A(A(ip))));

        message
    }

    #[test]
    fn ttl_is_clamped_to_the_configured_window() {
        let cache = DnsCache::new(config());
        let now = Instant::now();
        let key = CacheKey::new("example.com", RecordType::A);

        // Below min_ttl: still alive after upstream TTL expired.
        cache.insert(
            key.clone(),
            &response("example.com.", Ipv4Addr::new(203, 0, 113, 5), 5),
            false,
            now,
        );

        assert!(
            cache
                .answer(7, &key, now + Duration::from_secs(30))
                .is_some()
        );
        assert!(
            cache
                .answer(7, &key, now + Duration::from_secs(61))
                .is_none()
        );
    }

    #[test]
    fn huge_upstream_ttl_is_capped() {
        let cache = DnsCache::new(config());
        let now = Instant::now();
        let key = CacheKey::new("example.com", RecordType::A);

        cache.insert(
            key.clone(),
            &response("example.com.", Ipv4Addr::new(203, 0, 113, 5), 864000),
            false,
            now,
        );

        assert!(
            cache
                .answer(7, &key, now + Duration::from_secs(601))
                .is_none()
        );
    }

    #[test]
    fn served_answers_echo_the_query_id_and_decrement_ttl() {
        let cache = DnsCache::new(config());
        let now = Instant::now();
        let key = CacheKey::new("example.com", RecordType::A);

        cache.insert(
            key.clone(),
            &response("example.com.", Ipv4Addr::new(203, 0, 113, 5), 300),
            false,
            now,
        );

        let answer = cache
            .answer(0xBEEF, &key, now + Duration::from_secs(100))
            .unwrap();

        assert_eq!(answer.id(), 0xBEEF);
        assert_eq!(answer.answers()[0].ttl(), 200);
    }

    #[test]
    fn negative_entries_live_for_neg_ttl() {
        let cache = DnsCache::new(config());
        let now = Instant::now();
        let key = CacheKey::new("ads.example.com", RecordType::A);

        let mut nxdomain = Message::new();
        nxdomain.set_message_type(MessageType::Response);
        nxdomain.set_response_code(ResponseCode::NXDomain);

        cache.insert_negative(key.clone(), &nxdomain, now);

        let hit = cache.answer(1, &key, now + Duration::from_secs(29)).unwrap();
        assert_eq!(hit.response_code(), ResponseCode::NXDomain);

        assert!(
            cache
                .answer(1, &key, now + Duration::from_secs(31))
                .is_none()
        );
    }

    #[test]
    fn reverse_lookup_follows_the_forward_ttl() {
        let cache = DnsCache::new(config());
        let now = Instant::now();
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));

        cache.insert(
            CacheKey::new("example.com", RecordType::A),
            &response("example.com.", Ipv4Addr::new(203, 0, 113, 5), 300),
            false,
            now,
        );

        assert_eq!(
            cache.reverse_lookup(ip, now + Duration::from_secs(299)),
            Some("example.com".to_owned())
        );
        assert_eq!(cache.reverse_lookup(ip, now + Duration::from_secs(301)), None);
    }

    #[test]
    fn provisional_entries_flush_together() {
        let cache = DnsCache::new(config());
        let now = Instant::now();
        let provisional_key = CacheKey::new("example.com", RecordType::A);
        let stable_key = CacheKey::new("example.org", RecordType::A);

        cache.insert(
            provisional_key.clone(),
            &response("example.com.", Ipv4Addr::new(203, 0, 113, 5), 300),
            true,
            now,
        );
        cache.insert(
            stable_key.clone(),
            &response("example.org.", Ipv4Addr::new(203, 0, 113, 9), 300),
            false,
            now,
        );

        cache.flush_provisional();

        assert!(cache.answer(1, &provisional_key, now).is_none());
        assert!(cache.answer(1, &stable_key, now).is_some());
    }

    #[test]
    fn disabled_cache_answers_nothing() {
        let cache = DnsCache::new(DnsCacheConfig {
            enabled: false,
            ..config()
        });
        let now = Instant::now();
        let key = CacheKey::new("example.com", RecordType::A);

        cache.insert(
            key.clone(),
            &response("example.com.", Ipv4Addr::new(203, 0, 113, 5), 300),
            false,
            now,
        );

        assert!(cache.answer(1, &key, now).is_none());
    }
}
