//! Socket factory.
//!
//! Builds transport sockets keyed by `(protocol, outbound_interface,
//! ignore_proxy)`. When a process-wide outbound proxy is configured and the
//! caller did not opt out, the raw socket is replaced by a [`ProxiedSocket`]
//! whose fallback policy retries through the direct pseudo-proxy. The
//! factory also owns the shared TLS session cache and the certificate
//! verifier used by every secured socket it produces.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use rustls::client::danger::ServerCertVerifier;

use crate::direct_proxy::DirectProxy;
use crate::outbound_proxy::OutboundProxy;
use crate::proxied_socket::{
    ProxiedSocket, ProxiedSocketCallbacks, ProxiedSocketParameters, ProxyConnectionFailedResult,
};
use crate::rustls_util::create_client_config;
use crate::socket::{IfId, Socket, TransportProtocol};
use crate::tcp_socket::TcpTransportSocket;
use crate::tls_session_cache::TlsSessionCache;
use crate::tls_socket::{SecureSocketParameters, TlsTransportSocket};
use crate::udp_socket::UdpTransportSocket;

/// Construction parameters for [`SocketFactory`].
#[derive(Default)]
pub struct SocketFactoryParameters {
    /// Process-wide outbound proxy; `None` means all sockets connect
    /// directly.
    pub outbound_proxy: Option<Arc<dyn OutboundProxy>>,
    /// Certificate verifier for secured sockets; `None` selects WebPKI over
    /// the bundled roots.
    pub cert_verifier: Option<Arc<dyn ServerCertVerifier>>,
}

/// Key for [`SocketFactory::make_socket`].
#[derive(Clone)]
pub struct MakeSocketParameters {
    pub proto: TransportProtocol,
    pub outbound_interface: Option<IfId>,
    pub ignore_proxy_settings: bool,
}

pub struct SocketFactory {
    next_socket_id: AtomicU64,
    outbound_proxy: Option<Arc<dyn OutboundProxy>>,
    direct_proxy: Arc<DirectProxy>,
    cert_verifier: Option<Arc<dyn ServerCertVerifier>>,
    session_cache: TlsSessionCache,
}

impl SocketFactory {
    pub fn new(params: SocketFactoryParameters) -> Self {
        Self {
            next_socket_id: AtomicU64::new(1),
            outbound_proxy: params.outbound_proxy,
            direct_proxy: Arc::new(DirectProxy::new()),
            cert_verifier: params.cert_verifier,
            session_cache: TlsSessionCache::default(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a raw transport socket, proxied when an outbound proxy is
    /// configured and not suppressed for this socket.
    pub fn make_socket(&self, params: MakeSocketParameters) -> Box<dyn Socket> {
        let id = self.next_id();
        match &self.outbound_proxy {
            Some(proxy) if !params.ignore_proxy_settings => {
                let direct: Arc<dyn OutboundProxy> = self.direct_proxy.clone();
                Box::new(ProxiedSocket::new(
                    id,
                    ProxiedSocketParameters {
                        proto: params.proto,
                        outbound_interface: params.outbound_interface,
                        proxy: proxy.clone(),
                        callbacks: ProxiedSocketCallbacks {
                            on_successful_proxy_connection: Arc::new(move || {
                                debug!("[id={}] outbound proxy reachable", id);
                            }),
                            on_proxy_connection_failed: Arc::new(move |err| {
                                debug!("[id={}] outbound proxy failed: {}", id, err);
                                ProxyConnectionFailedResult::Fallback {
                                    proxy: direct.clone(),
                                }
                            }),
                        },
                    },
                ))
            }
            _ => match params.proto {
                TransportProtocol::Udp => {
                    Box::new(UdpTransportSocket::new(id, params.outbound_interface))
                }
                TransportProtocol::Tcp => {
                    Box::new(TcpTransportSocket::new(id, params.outbound_interface))
                }
            },
        }
    }

    /// Build a TLS-secured stream socket over a (possibly proxied) inner
    /// socket.
    pub fn make_secured_socket(
        &self,
        params: MakeSocketParameters,
        secure: SecureSocketParameters,
    ) -> Box<dyn Socket> {
        let inner = self.make_socket(MakeSocketParameters {
            proto: TransportProtocol::Tcp,
            ..params
        });
        Box::new(TlsTransportSocket::new(self.next_id(), inner, secure))
    }

    /// TLS client config for the given ALPN set, wired to this factory's
    /// verifier and session cache.
    pub fn tls_client_config(&self, alpn_protocols: &[&[u8]]) -> rustls::ClientConfig {
        create_client_config(
            self.cert_verifier.clone(),
            alpn_protocols,
            &self.session_cache,
        )
    }

    /// Interface-aware UDP socket for a QUIC endpoint. QUIC datagrams do
    /// not traverse the outbound proxy.
    pub fn make_quic_udp_socket(
        &self,
        peer: &std::net::SocketAddr,
        outbound_interface: Option<&IfId>,
    ) -> std::io::Result<std::net::UdpSocket> {
        crate::socket_util::new_quic_udp_socket(peer, outbound_interface)
    }

    pub fn session_cache(&self) -> &TlsSessionCache {
        &self.session_cache
    }
}
