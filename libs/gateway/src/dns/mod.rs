//! In-band DNS interception.
//!
//! Registered as the endpoint for all UDP/53 and TCP/53 traffic arriving
//! through the TUN. Every query runs the same pipeline: cache → domain rules
//! → forward/refuse. TCP differs from UDP only in the 2-byte length framing.

pub mod cache;

pub use cache::{CacheKey, DnsCache};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use ip_packet::IpPacket;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::oneshot;

use crate::domain_rules::{DomainDecision, DomainRuleEngine};
use crate::providers::{Provider, ProviderRegistry, ProviderState};

pub const DNS_PORT: u16 = 53;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TCP_MESSAGE: usize = 4096;

type Waiters = Vec<oneshot::Sender<Result<Message, String>>>;

pub struct DnsInterceptor {
    cache: DnsCache,
    rules: RwLock<Arc<DomainRuleEngine>>,
    registry: Arc<ProviderRegistry>,
    upstreams: RwLock<Vec<SocketAddr>>,
    /// Per-qname single-flight: concurrent identical queries trigger exactly
    /// one upstream lookup.
    inflight: parking_lot::Mutex<HashMap<CacheKey, Waiters>>,
}

impl DnsInterceptor {
    pub fn new(
        cache: DnsCache,
        rules: Arc<DomainRuleEngine>,
        registry: Arc<ProviderRegistry>,
        upstreams: Vec<IpAddr>,
    ) -> Self {
        Self {
            cache,
            rules: RwLock::new(rules),
            registry,
            upstreams: RwLock::new(
                upstreams
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, DNS_PORT))
                    .collect(),
            ),
            inflight: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Swaps rule engine and upstreams on reload. In-flight resolutions
    /// finish against the old snapshot.
    pub fn reload(&self, rules: Arc<DomainRuleEngine>, upstreams: Vec<IpAddr>) {
        *self.rules.write() = rules;
        *self.upstreams.write() = upstreams
            .into_iter()
            .map(|ip| SocketAddr::new(ip, DNS_PORT))
            .collect();
    }

    /// Handles one UDP/53 packet from the TUN; the reply is addressed back
    /// to the client, sourced from the original destination.
    pub async fn handle_udp_packet(&self, packet: IpPacket) -> Option<IpPacket> {
        let udp = packet.as_udp()?;
        let payload = udp.payload().to_vec();
        let client = SocketAddr::new(packet.source(), udp.source_port());
        let server = SocketAddr::new(packet.destination(), udp.destination_port());

        let response = self.handle_query(&payload, Instant::now()).await?;

        let reply = ip_packet::make::udp_packet(
            server.ip(),
            client.ip(),
            server.port(),
            client.port(),
            response,
        )
        .inspect_err(|e| tracing::debug!("Failed to build DNS reply: {e:#}"))
        .ok()?;

        Some(reply)
    }

    /// Serves length-prefixed DNS over an accepted TCP/53 stream.
    pub async fn serve_tcp<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut len = [0u8; 2];

            match stream.read_exact(&mut len).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e).context("Failed to read length prefix"),
            }

            let len = usize::from(u16::from_be_bytes(len));

            anyhow::ensure!(len <= MAX_TCP_MESSAGE, "DNS message too large ({len})");

            let mut payload = vec![0u8; len];
            stream
                .read_exact(&mut payload)
                .await
                .context("Failed to read DNS message")?;

            let Some(response) = self.handle_query(&payload, Instant::now()).await else {
                continue;
            };

            let prefix = (response.len() as u16).to_be_bytes();
            stream
                .write_all(&prefix)
                .await
                .context("Failed to write length prefix")?;
            stream
                .write_all(&response)
                .await
                .context("Failed to write DNS response")?;
        }
    }

    /// The resolution pipeline. Returns response wire bytes, or `None` for
    /// unparsable input.
    async fn handle_query(&self, payload: &[u8], now: Instant) -> Option<Vec<u8>> {
        let query = Message::from_vec(payload)
            .inspect_err(|e| tracing::trace!("Not a DNS query: {e}"))
            .ok()?;

        let question = query.queries().first()?.clone();
        let qname = question.name().to_string();
        let key = CacheKey::new(&qname, question.query_type());

        if let Some(cached) = self.cache.answer(query.id(), &key, now) {
            return encode(&cached);
        }

        let decision = self.rules.read().decide(&key.qname);

        tracing::trace!(qname = %key.qname, qtype = %key.qtype, ?decision, "Resolving");

        let (provider, provisional) = match decision {
            DomainDecision::Block => {
                let response = refusal(&query, ResponseCode::NXDomain);

                self.cache.insert_negative(key, &response, now);

                return encode(&response);
            }
            DomainDecision::Direct => (self.registry.snapshot().direct(), false),
            DomainDecision::Route(id) => {
                let set = self.registry.snapshot();

                match set.get(&id) {
                    Some(provider) if provider.state() == ProviderState::Up => (provider, false),
                    // Fall through to direct, marking the entry provisional
                    // so it re-resolves once the provider is up.
                    Some(_) | None => {
                        tracing::debug!(%id, qname = %key.qname, "Routing provider not up, resolving direct");

                        (set.direct(), true)
                    }
                }
            }
        };

        match self.resolve(&key, &query, provider, provisional, now).await {
            Ok(mut response) => {
                response.set_id(query.id());
                response.set_authoritative(false);
                response.set_recursion_desired(true);

                encode(&response)
            }
            Err(reason) => {
                tracing::debug!(qname = %key.qname, "Upstream resolution failed: {reason}");

                encode(&refusal(&query, ResponseCode::ServFail))
            }
        }
    }

    /// Forwards through the single-flight gate: the first caller queries
    /// upstream, concurrent identical queries wait for its result.
    async fn resolve(
        &self,
        key: &CacheKey,
        query: &Message,
        provider: Arc<Provider>,
        provisional: bool,
        now: Instant,
    ) -> Result<Message, String> {
        let waiter = {
            let mut inflight = self.inflight.lock();

            match inflight.get_mut(key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);

                    Some(rx)
                }
                None => {
                    inflight.insert(key.clone(), Vec::new());

                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return rx
                .await
                .map_err(|_| "Leading query was aborted".to_owned())?;
        }

        // If we are cancelled mid-flight the entry must go away, or every
        // later query for this name would wait forever.
        let _guard = ClearInflight {
            inflight: &self.inflight,
            key,
        };

        let result = self.forward(query, provider).await;

        if let Ok(response) = &result {
            if response.response_code() == ResponseCode::NXDomain {
                self.cache.insert_negative(key.clone(), response, now);
            } else {
                self.cache.insert(key.clone(), response, provisional, now);
            }
        }

        let waiters = self.inflight.lock().remove(key).unwrap_or_default();

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        result
    }

    /// Tries each configured upstream through the chosen provider.
    async fn forward(&self, query: &Message, provider: Arc<Provider>) -> Result<Message, String> {
        let upstreams = self.upstreams.read().clone();
        let payload = query
            .to_vec()
            .map_err(|e| format!("Failed to encode query: {e}"))?;

        let mut last_error = "No DNS upstreams configured".to_owned();

        for upstream in upstreams {
            match self.forward_to(&payload, provider.clone(), upstream).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(%upstream, "Upstream failed: {e}");

                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn forward_to(
        &self,
        payload: &[u8],
        provider: Arc<Provider>,
        upstream: SocketAddr,
    ) -> Result<Message, String> {
        let socket = provider
            .dial_udp(upstream)
            .await
            .map_err(|e| format!("Failed to dial {upstream}: {e}"))?;

        socket
            .send(payload)
            .await
            .map_err(|e| format!("Failed to send to {upstream}: {e}"))?;

        let mut buf = vec![0u8; MAX_TCP_MESSAGE];

        let n = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| format!("{upstream} timed out"))?
            .map_err(|e| format!("Failed to receive from {upstream}: {e}"))?;

        Message::from_vec(&buf[..n]).map_err(|e| format!("Invalid response from {upstream}: {e}"))
    }
}

/// Clears a single-flight entry when the leading query unwinds; its waiters
/// observe the dropped senders as an abort.
struct ClearInflight<'a> {
    inflight: &'a parking_lot::Mutex<HashMap<CacheKey, Waiters>>,
    key: &'a CacheKey,
}

impl Drop for ClearInflight<'_> {
    fn drop(&mut self) {
        self.inflight.lock().remove(self.key);
    }
}

/// Builds a refusal that echoes the transaction id and question verbatim.
fn refusal(query: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();

    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(code);
    response.set_recursion_desired(true);
    response.set_recursion_available(true);

    for question in query.queries() {
        response.add_query(question.clone());
    }

    response
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    message
        .to_vec()
        .inspect_err(|e| tracing::debug!("Failed to encode DNS response: {e}"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsCacheConfig, DomainAction, DomainRuleConfig};
    use crate::providers::{LoopbackStack, ProviderId, TransportFactory, VpnStack};
    use crate::providers::transport::LoopbackAccept;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_config() -> DnsCacheConfig {
        DnsCacheConfig {
            enabled: true,
            max_size: 64,
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(600),
            neg_ttl: Duration::from_secs(30),
        }
    }

    fn rules(rules: Vec<DomainRuleConfig>) -> Arc<DomainRuleEngine> {
        Arc::new(DomainRuleEngine::new(
            &rules,
            &HashMap::new(),
            ProviderId::direct(),
        ))
    }

    fn block_rule(pattern: &str) -> DomainRuleConfig {
        DomainRuleConfig {
            pattern: pattern.to_owned(),
            action: DomainAction::Block,
            tunnel: None,
        }
    }

    fn query(qname: &str) -> Message {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(
            Name::from_str(qname).unwrap(),
            RecordType::A,
        ));

        message
    }

    fn interceptor(rules_list: Vec<DomainRuleConfig>) -> DnsInterceptor {
        DnsInterceptor::new(
            DnsCache::new(cache_config()),
            rules(rules_list),
            Arc::new(ProviderRegistry::new()),
            vec![IpAddr::from([127, 0, 0, 1])],
        )
    }

    #[tokio::test]
    async fn blocked_domain_yields_nxdomain_without_upstream_traffic() {
        let interceptor = interceptor(vec![block_rule("ads.example.")]);

        let payload = query("ads.example.com.").to_vec().unwrap();
        let response = interceptor
            .handle_query(&payload, Instant::now())
            .await
            .unwrap();

        let response = Message::from_vec(&response).unwrap();

        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.queries().len(), 1);
        assert_eq!(
            response.queries()[0].name().to_string(),
            "ads.example.com."
        );
    }

    #[tokio::test]
    async fn blocked_domain_is_cached_negatively() {
        let interceptor = interceptor(vec![block_rule("ads.example.")]);
        let now = Instant::now();

        let payload = query("ads.example.com.").to_vec().unwrap();
        interceptor.handle_query(&payload, now).await.unwrap();

        let key = CacheKey::new("ads.example.com", RecordType::A);
        let hit = interceptor
            .cache
            .answer(9, &key, now + Duration::from_secs(29));

        assert_eq!(hit.unwrap().response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn malformed_payload_is_ignored() {
        let interceptor = interceptor(vec![]);

        assert!(
            interceptor
                .handle_query(b"definitely not dns", Instant::now())
                .await
                .is_none()
        );
    }

    /// A loopback transport that answers every query with a fixed A record,
    /// counting how many datagrams it saw.
    struct CountingResolver {
        stack: Arc<LoopbackStack>,
        queries_seen: Arc<AtomicUsize>,
    }

    impl CountingResolver {
        fn new() -> Self {
            let (stack, mut accepts) = LoopbackStack::new(Vec::new());
            let queries_seen = Arc::new(AtomicUsize::new(0));

            let counter = queries_seen.clone();

            tokio::spawn(async move {
                while let Some(accept) = accepts.recv().await {
                    let LoopbackAccept::Udp(_, mut rx, tx) = accept else {
                        continue;
                    };

                    let counter = counter.clone();

                    tokio::spawn(async move {
                        while let Some(datagram) = rx.recv().await {
                            counter.fetch_add(1, Ordering::SeqCst);

                            // Simulate upstream latency so concurrent
                            // queries overlap.
                            tokio::time::sleep(Duration::from_millis(50)).await;

                            let query = Message::from_vec(&datagram).unwrap();
                            let mut response = refusal(&query, ResponseCode::NoError);
                            response.add_answer(Record::from_rdata(
                                query.queries()[0].name().clone(),
                                300,
                                RData::A(A(Ipv4Addr::new(203, 0, 113, 5))),
                            ));

                            let _ = tx.send(response.to_vec().unwrap());
                        }
                    });
                }
            });

            Self {
                stack: Arc::new(stack),
                queries_seen,
            }
        }
    }

    struct FixedFactory(Arc<LoopbackStack>);

    impl TransportFactory for FixedFactory {
        fn create(
            &self,
            _config: &crate::config::TunnelConfig,
            _control_stream: &str,
        ) -> anyhow::Result<Arc<dyn VpnStack>> {
            Ok(self.0.clone())
        }
    }

    fn routed_interceptor(resolver: &CountingResolver) -> DnsInterceptor {
        use crate::config::{TunnelConfig, TunnelProtocol};

        let registry = Arc::new(ProviderRegistry::new());
        registry
            .reload(
                &[TunnelConfig {
                    id: ProviderId::from("vpn-a"),
                    protocol: TunnelProtocol::Wireguard,
                    name: "vpn-a".to_owned(),
                    settings: Default::default(),
                    allowed_ips: Vec::new(),
                    disallowed_ips: Vec::new(),
                    disallowed_apps: Vec::new(),
                }],
                &FixedFactory(resolver.stack.clone()),
            )
            .unwrap();

        let interceptor = DnsInterceptor::new(
            DnsCache::new(cache_config()),
            rules(vec![DomainRuleConfig {
                pattern: "example.com".to_owned(),
                action: DomainAction::Route,
                tunnel: Some(ProviderId::from("vpn-a")),
            }]),
            registry.clone(),
            vec![IpAddr::from([127, 0, 0, 1])],
        );

        interceptor
    }

    #[tokio::test]
    async fn concurrent_identical_queries_resolve_upstream_once() {
        let resolver = CountingResolver::new();
        let interceptor = Arc::new(routed_interceptor(&resolver));

        interceptor
            .registry
            .connect(&ProviderId::from("vpn-a"))
            .await
            .unwrap();

        let payload = query("example.com.").to_vec().unwrap();
        let now = Instant::now();

        let results = futures::future::join_all((0..8).map(|_| {
            let interceptor = interceptor.clone();
            let payload = payload.clone();

            async move { interceptor.handle_query(&payload, now).await }
        }))
        .await;

        assert!(results.iter().all(|r| r.is_some()));
        assert_eq!(resolver.queries_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn routed_query_records_reverse_mapping() {
        let resolver = CountingResolver::new();
        let interceptor = routed_interceptor(&resolver);

        interceptor
            .registry
            .connect(&ProviderId::from("vpn-a"))
            .await
            .unwrap();

        let now = Instant::now();
        let payload = query("example.com.").to_vec().unwrap();
        interceptor.handle_query(&payload, now).await.unwrap();

        assert_eq!(
            interceptor.cache.reverse_lookup(
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
                now + Duration::from_secs(1)
            ),
            Some("example.com".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn down_provider_falls_through_to_direct_and_marks_provisional() {
        let resolver = CountingResolver::new();
        let interceptor = routed_interceptor(&resolver);

        // Provider stays DOWN; direct dialing 127.0.0.1:53 will fail or time
        // out, so the query must end in SERVFAIL rather than an answer.
        let payload = query("example.com.").to_vec().unwrap();
        let response = interceptor
            .handle_query(&payload, Instant::now())
            .await
            .unwrap();

        let response = Message::from_vec(&response).unwrap();

        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(resolver.queries_seen.load(Ordering::SeqCst), 0);
    }
}
