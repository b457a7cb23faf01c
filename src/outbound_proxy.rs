//! Outbound proxy interface.
//!
//! The proxy transport itself (SOCKS5, HTTP CONNECT) lives outside this
//! crate; this module defines the contract a proxy implementation exposes to
//! the socket layer. A proxy multiplexes many logical connections, each
//! addressed by a [`ProxyConnId`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SocketError, SocketResult};
use crate::socket::{IfId, TransportProtocol};

/// Identifier of a logical connection inside a proxy.
pub type ProxyConnId = u64;

/// Callback set a proxy drives for one logical connection.
///
/// `on_successful_proxy_connection` reports that the transport to the proxy
/// server itself came up; `on_proxy_connection_failed` reports that it did
/// not. Both concern the proxy leg only. `on_connected`/`on_read`/`on_close`
/// mirror the plain socket contract for the tunneled connection.
#[derive(Clone, Default)]
pub struct ProxyCallbacks {
    pub on_successful_proxy_connection: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_proxy_connection_failed: Option<Arc<dyn Fn(SocketError) + Send + Sync>>,
    pub on_connected: Option<Arc<dyn Fn(ProxyConnId) + Send + Sync>>,
    pub on_read: Option<Arc<dyn Fn(&[u8]) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(Option<SocketError>) + Send + Sync>>,
}

impl fmt::Debug for ProxyCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCallbacks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_read", &self.on_read.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Parameters for [`OutboundProxy::connect`].
#[derive(Clone)]
pub struct ProxyConnectParameters {
    pub proto: TransportProtocol,
    pub peer: SocketAddr,
    pub callbacks: ProxyCallbacks,
    pub timeout: Option<Duration>,
    pub outbound_interface: Option<IfId>,
}

/// A proxy through which logical connections are tunneled. Implementations
/// are internally synchronized; all methods take `&self`.
pub trait OutboundProxy: Send + Sync {
    /// Register a new logical connection. Non-blocking; progress is
    /// reported through the callbacks.
    fn connect(&self, params: ProxyConnectParameters) -> SocketResult<ProxyConnId>;

    fn send(&self, conn_id: ProxyConnId, data: &[u8]) -> SocketResult<()>;

    fn set_timeout(&self, conn_id: ProxyConnId, timeout: Duration) -> bool;

    fn set_callbacks(&self, conn_id: ProxyConnId, callbacks: ProxyCallbacks) -> SocketResult<()>;

    fn close_connection(&self, conn_id: ProxyConnId);

    #[cfg(unix)]
    fn fd(&self, conn_id: ProxyConnId) -> Option<std::os::fd::RawFd> {
        let _ = conn_id;
        None
    }
}
