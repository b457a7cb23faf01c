//! Shared TLS session cache.
//!
//! A bounded mapping from `(server_name, alpn)` to resumption state, shared
//! across every socket built by the same factory. rustls drives the store
//! through [`rustls::client::ClientSessionStore`]; the cache hands out one
//! scoped view per ALPN set so sessions negotiated for `dot` are never
//! offered to an `h2` connection.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;

/// At most this many TLS 1.3 tickets are retained per `(server_name, alpn)`.
const MAX_TLS13_TICKETS_PER_SERVER: usize = 4;

type CacheKey = (String, String);

struct CacheInner {
    kx_hints: Mutex<LruCache<CacheKey, NamedGroup>>,
    tls12: Mutex<LruCache<CacheKey, Tls12ClientSessionValue>>,
    tls13: Mutex<LruCache<CacheKey, Vec<Tls13ClientSessionValue>>>,
}

/// Session cache shared across sockets. Internally synchronized.
#[derive(Clone)]
pub struct TlsSessionCache {
    inner: Arc<CacheInner>,
}

impl TlsSessionCache {
    /// `capacity` bounds each internal map; oldest entries are evicted.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Arc::new(CacheInner {
                kx_hints: Mutex::new(LruCache::new(capacity)),
                tls12: Mutex::new(LruCache::new(capacity)),
                tls13: Mutex::new(LruCache::new(capacity)),
            }),
        }
    }

    /// A store view scoped to `alpn`, suitable for
    /// [`rustls::client::Resumption::store`].
    pub fn store_for(&self, alpn: &[&[u8]]) -> Arc<dyn ClientSessionStore> {
        Arc::new(ScopedSessionStore {
            inner: self.inner.clone(),
            alpn: alpn
                .iter()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect::<Vec<_>>()
                .join(","),
        })
    }
}

impl Default for TlsSessionCache {
    fn default() -> Self {
        Self::new(256)
    }
}

struct ScopedSessionStore {
    inner: Arc<CacheInner>,
    alpn: String,
}

impl ScopedSessionStore {
    fn key(&self, server_name: &ServerName<'_>) -> CacheKey {
        (server_name.to_str().into_owned(), self.alpn.clone())
    }
}

impl fmt::Debug for ScopedSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSessionStore")
            .field("alpn", &self.alpn)
            .finish()
    }
}

impl ClientSessionStore for ScopedSessionStore {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.inner.kx_hints.lock().put(self.key(&server_name), group);
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.inner.kx_hints.lock().get(&self.key(server_name)).copied()
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.inner.tls12.lock().put(self.key(&server_name), value);
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.inner.tls12.lock().get(&self.key(server_name)).cloned()
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'_>) {
        self.inner.tls12.lock().pop(&self.key(server_name));
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        let key = self.key(&server_name);
        let mut tickets = self.inner.tls13.lock();
        let entry = tickets.get_or_insert_mut(key, Vec::new);
        if entry.len() >= MAX_TLS13_TICKETS_PER_SERVER {
            entry.remove(0);
        }
        entry.push(value);
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'_>) -> Option<Tls13ClientSessionValue> {
        let mut tickets = self.inner.tls13.lock();
        let entry = tickets.get_mut(&self.key(server_name))?;
        entry.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ServerName<'static> {
        ServerName::try_from(s.to_string()).unwrap()
    }

    #[test]
    fn test_kx_hint_scoped_by_alpn() {
        let cache = TlsSessionCache::new(16);
        let dot = cache.store_for(&[b"dot"]);
        let h2 = cache.store_for(&[b"h2"]);

        dot.set_kx_hint(name("dns.example.test"), NamedGroup::X25519);
        assert_eq!(
            dot.kx_hint(&name("dns.example.test")),
            Some(NamedGroup::X25519)
        );
        assert_eq!(h2.kx_hint(&name("dns.example.test")), None);
    }

    #[test]
    fn test_kx_hint_shared_between_store_views() {
        let cache = TlsSessionCache::new(16);
        let a = cache.store_for(&[b"doq"]);
        let b = cache.store_for(&[b"doq"]);

        a.set_kx_hint(name("dns.example.test"), NamedGroup::secp256r1);
        assert_eq!(
            b.kx_hint(&name("dns.example.test")),
            Some(NamedGroup::secp256r1)
        );
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TlsSessionCache::new(2);
        let store = cache.store_for(&[b"dot"]);
        store.set_kx_hint(name("a.test"), NamedGroup::X25519);
        store.set_kx_hint(name("b.test"), NamedGroup::X25519);
        store.set_kx_hint(name("c.test"), NamedGroup::X25519);
        assert_eq!(store.kx_hint(&name("a.test")), None);
        assert!(store.kx_hint(&name("c.test")).is_some());
    }
}
