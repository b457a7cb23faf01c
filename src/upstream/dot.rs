//! DNS-over-TLS upstream (RFC 7858).
//!
//! One long-lived TLS connection, opened lazily and reused across
//! exchanges. Messages are framed with a 2-byte big-endian length.
//! Concurrent exchanges multiplex on the same stream: each is assigned a
//! fresh wire transaction id, a demux task routes responses back to the
//! matching waiter, and the original request id is restored before the
//! response is returned. The connection is reopened on close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;

use crate::address::Location;
use crate::bootstrap::Bootstrapper;
use crate::error::{DnsError, ExchangeResult, InitError};
use crate::socket_stream::{connect_stream, SocketSender, SocketStream};
use crate::tls_socket::SecureSocketParameters;
use crate::upstream::{
    frame_message, Upstream, UpstreamBase, UpstreamFactoryConfig, UpstreamOptions,
};

/// ALPN protocol id for DNS-over-TLS.
const ALPN_DOT: &[u8] = b"dot";

type WaiterMap = Arc<Mutex<FxHashMap<u16, oneshot::Sender<Message>>>>;

struct DotConnection {
    sender: SocketSender,
    waiters: WaiterMap,
    next_id: AtomicU16,
    closed: Arc<AtomicBool>,
    demux: tokio::task::AbortHandle,
}

impl DotConnection {
    /// Wire ids must be unique among in-flight exchanges on this
    /// connection.
    fn allocate_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !self.waiters.lock().contains_key(&id) {
                return id;
            }
        }
    }
}

impl Drop for DotConnection {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

/// Removes the waiter when an exchange is cancelled before its response
/// arrives, so cancellation never leaks map entries.
struct WaiterGuard {
    waiters: WaiterMap,
    id: u16,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.waiters.lock().remove(&self.id);
    }
}

pub struct DotUpstream {
    base: UpstreamBase,
    location: Location,
    server_name: String,
    bootstrapper: Option<Arc<Bootstrapper>>,
    client_config: Option<Arc<rustls::ClientConfig>>,
    conn: tokio::sync::Mutex<Option<Arc<DotConnection>>>,
}

impl DotUpstream {
    pub(crate) fn new(
        options: UpstreamOptions,
        config: UpstreamFactoryConfig,
        location: Location,
        server_name: String,
        bootstrapper: Option<Arc<Bootstrapper>>,
    ) -> Self {
        Self {
            base: UpstreamBase::new(options, config),
            location,
            server_name,
            bootstrapper,
            client_config: None,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    async fn peer_addr(&self) -> Result<SocketAddr, DnsError> {
        if let Some(addr) = self.location.to_socket_addr() {
            return Ok(addr);
        }
        let bootstrapper = self
            .bootstrapper
            .as_ref()
            .ok_or_else(|| DnsError::BootstrapFailed("no bootstrapper".to_string()))?;
        let addrs = bootstrapper
            .resolve()
            .await
            .map_err(|e| DnsError::BootstrapFailed(e.to_string()))?;
        Ok(addrs[0])
    }

    async fn ensure_connection(&self) -> Result<Arc<DotConnection>, DnsError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.closed.load(Ordering::SeqCst) {
                return Ok(conn.clone());
            }
            *guard = None;
        }

        let client_config = self
            .client_config
            .clone()
            .ok_or_else(|| DnsError::InvalidArgument("upstream not initialized".to_string()))?;

        let peer = self.peer_addr().await?;
        debug!(
            "[id={}] opening DoT connection to {}",
            self.base.options.id, peer
        );
        let socket = self.base.make_secured_socket(SecureSocketParameters {
            client_config,
            server_name: self.server_name.clone(),
        });
        let stream = connect_stream(socket, peer, Some(self.base.options.timeout)).await?;

        let sender = stream.sender();
        let waiters: WaiterMap = Arc::new(Mutex::new(FxHashMap::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let demux = tokio::spawn(demux_responses(stream, waiters.clone(), closed.clone()));

        let conn = Arc::new(DotConnection {
            sender,
            waiters,
            next_id: AtomicU16::new(rand::random()),
            closed,
            demux: demux.abort_handle(),
        });
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn exchange_inner(&self, request: &Message) -> ExchangeResult {
        // A reused connection may turn out to have been closed by the peer;
        // retry once on a fresh one.
        match self.try_exchange(request).await {
            Err(DnsError::NetworkUnreachable(_)) => self.try_exchange(request).await,
            result => result,
        }
    }

    async fn try_exchange(&self, request: &Message) -> ExchangeResult {
        let conn = self.ensure_connection().await?;

        let wire_id = conn.allocate_id();
        let mut wire_request = request.clone();
        wire_request.set_id(wire_id);
        let payload = frame_message(&wire_request.to_vec()?)?;

        let (response_tx, response_rx) = oneshot::channel();
        conn.waiters.lock().insert(wire_id, response_tx);
        let _guard = WaiterGuard {
            waiters: conn.waiters.clone(),
            id: wire_id,
        };

        if let Err(e) = conn.sender.send(&payload) {
            conn.closed.store(true, Ordering::SeqCst);
            return Err(e.into());
        }

        let mut response = response_rx
            .await
            .map_err(|_| DnsError::NetworkUnreachable("DoT connection closed".to_string()))?;
        response.set_id(request.id());
        Ok(response)
    }
}

#[async_trait]
impl Upstream for DotUpstream {
    async fn init(&mut self) -> Result<(), InitError> {
        if self.server_name.is_empty() {
            return Err(InitError::EmptyServerName);
        }
        if self.location.address().is_hostname() && self.bootstrapper.is_none() {
            return Err(InitError::EmptyBootstrap);
        }
        if rustls::pki_types::ServerName::try_from(self.server_name.clone()).is_err() {
            return Err(InitError::TlsContextInitFailed);
        }
        self.client_config = Some(Arc::new(
            self.base
                .config
                .socket_factory
                .tls_client_config(&[ALPN_DOT]),
        ));
        Ok(())
    }

    async fn exchange(&self, request: &Message) -> ExchangeResult {
        self.base.run_exchange(self.exchange_inner(request)).await
    }

    fn options(&self) -> &UpstreamOptions {
        &self.base.options
    }

    fn rtt(&self) -> std::time::Duration {
        self.base.rtt()
    }

    fn adjust_rtt(&self, elapsed: std::time::Duration) {
        self.base.adjust_rtt(elapsed);
    }
}

/// Reads length-prefixed messages off the TLS stream and hands each to the
/// waiter registered under its transaction id. A framing violation or
/// stream error tears the connection down; pending waiters observe the
/// close through their dropped senders.
async fn demux_responses(mut stream: SocketStream, waiters: WaiterMap, closed: Arc<AtomicBool>) {
    loop {
        let mut length = [0u8; 2];
        if stream.read_exact(&mut length).await.is_err() {
            break;
        }
        let mut body = vec![0u8; u16::from_be_bytes(length) as usize];
        if stream.read_exact(&mut body).await.is_err() {
            break;
        }
        let response = match Message::from_vec(&body) {
            Ok(response) => response,
            Err(e) => {
                debug!("dropping DoT connection, malformed response: {}", e);
                break;
            }
        };
        let waiter = waiters.lock().remove(&response.id());
        if let Some(waiter) = waiter {
            let _ = waiter.send(response);
        }
    }
    closed.store(true, Ordering::SeqCst);
    waiters.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rustls_util::DisabledVerifier;
    use crate::socket_factory::{SocketFactory, SocketFactoryParameters};
    use crate::upstream::plain::test_support::{make_request, make_response};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn spawn_dot_server(reverse_order: bool, queries_per_conn: usize) -> SocketAddr {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = cert.cert.der().clone();
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
            rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()),
        );
        let mut server_config = rustls::ServerConfig::builder_with_provider(
            crate::rustls_util::get_crypto_provider(),
        )
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
        server_config.alpn_protocols = vec![b"dot".to_vec()];

        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let mut tls = match acceptor.accept(stream).await {
                        Ok(tls) => tls,
                        Err(_) => return,
                    };
                    let mut pending = Vec::new();
                    for _ in 0..queries_per_conn {
                        let mut length = [0u8; 2];
                        if tls.read_exact(&mut length).await.is_err() {
                            return;
                        }
                        let mut body = vec![0u8; u16::from_be_bytes(length) as usize];
                        if tls.read_exact(&mut body).await.is_err() {
                            return;
                        }
                        let request = Message::from_vec(&body).unwrap();
                        // Encode the query ordinal into the answer address.
                        let ordinal = pending.len() as u8 + 1;
                        let response = make_response(
                            &request,
                            std::net::Ipv4Addr::new(192, 0, 2, ordinal),
                            false,
                        );
                        pending.push(response);
                    }
                    if reverse_order {
                        pending.reverse();
                    }
                    for response in pending {
                        let payload = response.to_vec().unwrap();
                        let mut framed = (payload.len() as u16).to_be_bytes().to_vec();
                        framed.extend_from_slice(&payload);
                        if tls.write_all(&framed).await.is_err() {
                            return;
                        }
                    }
                    let _ = tls.shutdown().await;
                });
            }
        });

        addr
    }

    fn make_upstream(addr: SocketAddr) -> DotUpstream {
        let config = UpstreamFactoryConfig {
            socket_factory: Arc::new(SocketFactory::new(SocketFactoryParameters {
                outbound_proxy: None,
                cert_verifier: Some(Arc::new(DisabledVerifier::new())),
            })),
            ipv6_available: true,
        };
        let options = UpstreamOptions {
            address: format!("tls://{}", addr),
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        DotUpstream::new(
            options,
            config,
            Location::from_ip_addr(addr.ip(), addr.port()),
            "localhost".to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn test_single_exchange() {
        let addr = spawn_dot_server(false, 1).await;
        let mut upstream = make_upstream(addr);
        upstream.init().await.unwrap();

        let request = make_request(0xBEEF, "example.test.");
        let response = upstream.exchange(&request).await.unwrap();
        assert_eq!(response.id(), 0xBEEF);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_out_of_order_responses() {
        // Two exchanges share one TLS connection; the server answers in
        // reverse order; each future resolves with the response for its own
        // wire transaction id.
        let addr = spawn_dot_server(true, 2).await;
        let mut upstream = make_upstream(addr);
        upstream.init().await.unwrap();
        let upstream = Arc::new(upstream);

        let first = make_request(0x0101, "first.example.test.");
        let second = make_request(0x0202, "second.example.test.");

        let u1 = upstream.clone();
        let u2 = upstream.clone();
        let (r1, r2) = tokio::join!(
            async move { u1.exchange(&first).await },
            async move { u2.exchange(&second).await },
        );
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();

        assert_eq!(r1.id(), 0x0101);
        assert_eq!(r2.id(), 0x0202);
        assert_eq!(r1.queries()[0].name().to_utf8(), "first.example.test.");
        assert_eq!(r2.queries()[0].name().to_utf8(), "second.example.test.");
    }

    #[tokio::test]
    async fn test_connection_reused_and_reopened() {
        // Server answers one query per connection, then the next exchange
        // must reopen.
        let addr = spawn_dot_server(false, 1).await;
        let mut upstream = make_upstream(addr);
        upstream.init().await.unwrap();

        let response = upstream.exchange(&make_request(1, "a.test.")).await.unwrap();
        assert_eq!(response.id(), 1);

        // First connection is exhausted; server closed it after its single
        // answer, so this request rides a fresh connection.
        let response = upstream.exchange(&make_request(2, "b.test.")).await.unwrap();
        assert_eq!(response.id(), 2);
    }

    #[tokio::test]
    async fn test_empty_server_name_rejected() {
        let addr: SocketAddr = "127.0.0.1:853".parse().unwrap();
        let config = UpstreamFactoryConfig {
            socket_factory: Arc::new(SocketFactory::new(SocketFactoryParameters::default())),
            ipv6_available: true,
        };
        let mut upstream = DotUpstream::new(
            UpstreamOptions::default(),
            config,
            Location::from_ip_addr(addr.ip(), addr.port()),
            String::new(),
            None,
        );
        assert_eq!(upstream.init().await, Err(InitError::EmptyServerName));
    }
}
