//! Bootstrap resolution.
//!
//! Turns the hostname of an upstream address into concrete IP endpoints by
//! querying a dedicated set of bootstrap DNS servers (whose own addresses
//! are literal IPs). Results are cached with the minimum TTL observed
//! across the answer records; entries are purged on first lookup after
//! expiry.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::upstream::Upstream;

#[derive(Debug)]
pub enum BootstrapError {
    /// No bootstrap servers were configured for a hostname upstream.
    EmptyBootstrap,
    /// Every bootstrap query failed.
    AllQueriesFailed(String),
    /// Queries succeeded but produced no usable addresses.
    NoUsableAddresses,
    /// The hostname could not be encoded as a DNS name.
    InvalidHostname(String),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBootstrap => f.write_str("empty bootstrap list"),
            Self::AllQueriesFailed(msg) => write!(f, "all bootstrap queries failed: {}", msg),
            Self::NoUsableAddresses => f.write_str("no usable bootstrap addresses"),
            Self::InvalidHostname(host) => write!(f, "invalid hostname: {}", host),
        }
    }
}

impl std::error::Error for BootstrapError {}

struct CacheEntry {
    addresses: Vec<SocketAddr>,
    expires_at: Instant,
}

/// Cache shared across every bootstrapper created by the same factory.
#[derive(Clone, Default)]
pub struct BootstrapCache {
    inner: Arc<Mutex<FxHashMap<String, CacheEntry>>>,
}

impl BootstrapCache {
    fn get(&self, hostname: &str) -> Option<Vec<SocketAddr>> {
        let mut cache = self.inner.lock();
        match cache.get(hostname) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.addresses.clone()),
            Some(_) => {
                cache.remove(hostname);
                None
            }
            None => None,
        }
    }

    fn put(&self, hostname: String, addresses: Vec<SocketAddr>, ttl: Duration) {
        self.inner.lock().insert(
            hostname,
            CacheEntry {
                addresses,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Resolves `(hostname, port)` to an ordered endpoint list through the
/// bootstrap servers.
pub struct Bootstrapper {
    hostname: String,
    port: u16,
    servers: Vec<Arc<dyn Upstream>>,
    resolved_server_ip: Option<IpAddr>,
    ipv6_available: bool,
    cache: BootstrapCache,
}

impl Bootstrapper {
    pub fn new(
        hostname: String,
        port: u16,
        servers: Vec<Arc<dyn Upstream>>,
        resolved_server_ip: Option<IpAddr>,
        ipv6_available: bool,
        cache: BootstrapCache,
    ) -> Self {
        Self {
            hostname,
            port,
            servers,
            resolved_server_ip,
            ipv6_available,
            cache,
        }
    }

    /// Resolve the upstream hostname. IPv4 results are listed before IPv6;
    /// AAAA answers are dropped when IPv6 is unavailable.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>, BootstrapError> {
        if let Some(ip) = self.resolved_server_ip {
            return Ok(vec![SocketAddr::new(ip, self.port)]);
        }

        if let Some(cached) = self.cache.get(&self.hostname) {
            return Ok(cached);
        }

        if self.servers.is_empty() {
            return Err(BootstrapError::EmptyBootstrap);
        }

        let name = Name::from_utf8(&self.hostname)
            .map_err(|_| BootstrapError::InvalidHostname(self.hostname.clone()))?;

        let queries = self.servers.iter().flat_map(|server| {
            let name = name.clone();
            [RecordType::A, RecordType::AAAA]
                .into_iter()
                .map(move |rtype| query_addresses(server.clone(), name.clone(), rtype))
        });
        let results = join_all(queries).await;

        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        let mut min_ttl: Option<u32> = None;
        let mut last_error = None;
        let mut any_ok = false;
        for result in results {
            match result {
                Ok((ips, ttl)) => {
                    any_ok = true;
                    if let Some(ttl) = ttl {
                        min_ttl = Some(min_ttl.map_or(ttl, |t| t.min(ttl)));
                    }
                    for ip in ips {
                        match ip {
                            IpAddr::V4(_) => v4.push(SocketAddr::new(ip, self.port)),
                            IpAddr::V6(_) if self.ipv6_available => {
                                v6.push(SocketAddr::new(ip, self.port))
                            }
                            IpAddr::V6(_) => {}
                        }
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        if !any_ok {
            return Err(BootstrapError::AllQueriesFailed(
                last_error.map(|e| e.to_string()).unwrap_or_default(),
            ));
        }

        let mut addresses = v4;
        addresses.extend(v6);
        addresses.dedup();
        if addresses.is_empty() {
            return Err(BootstrapError::NoUsableAddresses);
        }

        debug!(
            "bootstrap resolved {} -> {:?} (ttl {:?})",
            self.hostname, addresses, min_ttl
        );
        let ttl = Duration::from_secs(u64::from(min_ttl.unwrap_or(0)));
        self.cache.put(self.hostname.clone(), addresses.clone(), ttl);
        Ok(addresses)
    }
}

async fn query_addresses(
    server: Arc<dyn Upstream>,
    name: Name,
    rtype: RecordType,
) -> Result<(Vec<IpAddr>, Option<u32>), crate::error::DnsError> {
    let mut request = Message::new();
    request
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, rtype));

    let response = server.exchange(&request).await?;

    let mut ips = Vec::new();
    let mut min_ttl = None;
    for record in response.answers() {
        let ip = match record.data() {
            Some(RData::A(a)) => IpAddr::V4(a.0),
            Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        ips.push(ip);
        let ttl = record.ttl();
        min_ttl = Some(min_ttl.map_or(ttl, |t: u32| t.min(ttl)));
    }
    Ok((ips, min_ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExchangeResult, InitError};
    use crate::upstream::UpstreamOptions;
    use async_trait::async_trait;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedUpstream {
        options: UpstreamOptions,
        v4: Vec<(std::net::Ipv4Addr, u32)>,
        v6: Vec<(std::net::Ipv6Addr, u32)>,
        fail: bool,
        queries: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn new(
            v4: Vec<(std::net::Ipv4Addr, u32)>,
            v6: Vec<(std::net::Ipv6Addr, u32)>,
            fail: bool,
        ) -> Self {
            Self {
                options: UpstreamOptions::default(),
                v4,
                v6,
                fail,
                queries: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn init(&mut self) -> Result<(), InitError> {
            Ok(())
        }

        async fn exchange(&self, request: &Message) -> ExchangeResult {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::DnsError::Timeout);
            }
            let query = request.queries()[0].clone();
            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .add_query(query.clone());
            match query.query_type() {
                RecordType::A => {
                    for (ip, ttl) in &self.v4 {
                        response.add_answer(Record::from_rdata(
                            query.name().clone(),
                            *ttl,
                            RData::A(A(*ip)),
                        ));
                    }
                }
                RecordType::AAAA => {
                    for (ip, ttl) in &self.v6 {
                        response.add_answer(Record::from_rdata(
                            query.name().clone(),
                            *ttl,
                            RData::AAAA(AAAA(*ip)),
                        ));
                    }
                }
                _ => {}
            }
            Ok(response)
        }

        fn options(&self) -> &UpstreamOptions {
            &self.options
        }

        fn rtt(&self) -> Duration {
            Duration::ZERO
        }

        fn adjust_rtt(&self, _elapsed: Duration) {}
    }

    fn v4(a: u8) -> std::net::Ipv4Addr {
        std::net::Ipv4Addr::new(192, 0, 2, a)
    }

    #[tokio::test]
    async fn test_merges_a_and_aaaa() {
        let server = Arc::new(ScriptedUpstream::new(
            vec![(v4(1), 300)],
            vec![("2001:db8::1".parse().unwrap(), 60)],
            false,
        ));
        let bootstrapper = Bootstrapper::new(
            "dns.example.test".to_string(),
            853,
            vec![server],
            None,
            true,
            BootstrapCache::default(),
        );

        let addrs = bootstrapper.resolve().await.unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());
        assert_eq!(addrs[0].port(), 853);
    }

    #[tokio::test]
    async fn test_filters_aaaa_without_ipv6() {
        let server = Arc::new(ScriptedUpstream::new(
            vec![(v4(1), 300)],
            vec![("2001:db8::1".parse().unwrap(), 60)],
            false,
        ));
        let bootstrapper = Bootstrapper::new(
            "dns.example.test".to_string(),
            53,
            vec![server],
            None,
            false,
            BootstrapCache::default(),
        );

        let addrs = bootstrapper.resolve().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv4());
    }

    #[tokio::test]
    async fn test_resolved_ip_bypasses_servers() {
        let server = Arc::new(ScriptedUpstream::new(vec![(v4(1), 300)], vec![], false));
        let bootstrapper = Bootstrapper::new(
            "dns.example.test".to_string(),
            53,
            vec![server.clone()],
            Some("198.51.100.7".parse().unwrap()),
            true,
            BootstrapCache::default(),
        );

        let addrs = bootstrapper.resolve().await.unwrap();
        assert_eq!(addrs, vec!["198.51.100.7:53".parse().unwrap()]);
        assert_eq!(server.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_bootstrap_errors() {
        let bootstrapper = Bootstrapper::new(
            "dns.example.test".to_string(),
            53,
            Vec::new(),
            None,
            true,
            BootstrapCache::default(),
        );
        assert!(matches!(
            bootstrapper.resolve().await,
            Err(BootstrapError::EmptyBootstrap)
        ));
    }

    #[tokio::test]
    async fn test_all_queries_failed() {
        let server = Arc::new(ScriptedUpstream::new(vec![], vec![], true));
        let bootstrapper = Bootstrapper::new(
            "dns.example.test".to_string(),
            53,
            vec![server],
            None,
            true,
            BootstrapCache::default(),
        );
        assert!(matches!(
            bootstrapper.resolve().await,
            Err(BootstrapError::AllQueriesFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_queries() {
        let server = Arc::new(ScriptedUpstream::new(vec![(v4(1), 300)], vec![], false));
        let cache = BootstrapCache::default();
        let bootstrapper = Bootstrapper::new(
            "dns.example.test".to_string(),
            53,
            vec![server.clone()],
            None,
            true,
            cache,
        );

        bootstrapper.resolve().await.unwrap();
        let after_first = server.queries.load(Ordering::SeqCst);
        bootstrapper.resolve().await.unwrap();
        assert_eq!(server.queries.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn test_expired_entry_requeried() {
        // TTL 0 expires immediately.
        let server = Arc::new(ScriptedUpstream::new(vec![(v4(1), 0)], vec![], false));
        let bootstrapper = Bootstrapper::new(
            "dns.example.test".to_string(),
            53,
            vec![server.clone()],
            None,
            true,
            BootstrapCache::default(),
        );

        bootstrapper.resolve().await.unwrap();
        let after_first = server.queries.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        bootstrapper.resolve().await.unwrap();
        assert!(server.queries.load(Ordering::SeqCst) > after_first);
    }
}
