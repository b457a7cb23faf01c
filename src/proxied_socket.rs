//! Socket tunneled through an outbound proxy, with transparent fallback.
//!
//! Wraps a logical proxy connection behind the plain [`Socket`] contract.
//! When the proxy reports a failure before the tunneled connection is up,
//! policy code may nominate a fallback proxy (typically the direct
//! pseudo-proxy); the next terminal close then re-connects through it with
//! whatever remains of the original timeout budget, and the original error
//! is suppressed if the re-connect takes.
//!
//! State protocol:
//! - `fallback_info` exists only between `connect` and the first
//!   `on_connected` or terminal `on_close`.
//! - after `on_connected` the fallback window is over for good.
//! - at most one proxy connection id is live at any time, and fallback
//!   fires at most once per socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::{SocketError, SocketResult};
use crate::outbound_proxy::{
    OutboundProxy, ProxyCallbacks, ProxyConnId, ProxyConnectParameters,
};
use crate::socket::{Callbacks, ConnectParameters, IfId, SharedCallbacks, Socket, TransportProtocol};

/// Decision returned by policy code when the proxy leg fails.
pub enum ProxyConnectionFailedResult {
    /// Let the failure propagate through `on_close`.
    CloseConnection,
    /// Store `proxy` and retry through it on the next close.
    Fallback { proxy: Arc<dyn OutboundProxy> },
}

/// Policy callbacks observed by the application that owns the socket
/// factory. Both concern the proxy leg, not the tunneled connection.
#[derive(Clone)]
pub struct ProxiedSocketCallbacks {
    pub on_successful_proxy_connection: Arc<dyn Fn() + Send + Sync>,
    pub on_proxy_connection_failed:
        Arc<dyn Fn(SocketError) -> ProxyConnectionFailedResult + Send + Sync>,
}

/// Parameters for [`ProxiedSocket::new`].
pub struct ProxiedSocketParameters {
    pub proto: TransportProtocol,
    pub outbound_interface: Option<IfId>,
    pub proxy: Arc<dyn OutboundProxy>,
    pub callbacks: ProxiedSocketCallbacks,
}

struct FallbackInfo {
    peer: SocketAddr,
    /// Absolute start of the original connect, for budget accounting.
    connect_timestamp: Instant,
    /// The original relative timeout.
    timeout: Option<Duration>,
    /// Set by policy when it chooses to retry; applied on the next close.
    proxy: Option<Arc<dyn OutboundProxy>>,
}

struct State {
    proxy: Arc<dyn OutboundProxy>,
    proxy_id: Option<ProxyConnId>,
    /// Set when `connect` succeeds and kept for the socket's lifetime,
    /// like the raw transports do.
    peer: Option<SocketAddr>,
    fallback_info: Option<FallbackInfo>,
    fell_back: bool,
}

struct Shared {
    id: u64,
    proto: TransportProtocol,
    outbound_interface: Option<IfId>,
    proxied_callbacks: ProxiedSocketCallbacks,
    state: Mutex<State>,
    socket_callbacks: SharedCallbacks,
}

/// Socket whose traffic is routed through an [`OutboundProxy`].
pub struct ProxiedSocket {
    shared: Arc<Shared>,
}

impl ProxiedSocket {
    pub fn new(id: u64, params: ProxiedSocketParameters) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                proto: params.proto,
                outbound_interface: params.outbound_interface,
                proxied_callbacks: params.callbacks,
                state: Mutex::new(State {
                    proxy: params.proxy,
                    proxy_id: None,
                    peer: None,
                    fallback_info: None,
                    fell_back: false,
                }),
                socket_callbacks: SharedCallbacks::default(),
            }),
        }
    }
}

impl Socket for ProxiedSocket {
    fn connect(&mut self, params: ConnectParameters) -> SocketResult<()> {
        trace!("[id={}] {}", self.shared.id, params.peer);
        if self.shared.state.lock().proxy_id.is_some() {
            return Err(SocketError::InvalidArgument(
                "socket is already connected".to_string(),
            ));
        }
        self.shared.socket_callbacks.replace(params.callbacks);
        connect_through_current_proxy(&self.shared, params.peer, params.timeout)
    }

    fn send(&mut self, data: &[u8]) -> SocketResult<()> {
        trace!("[id={}] {}", self.shared.id, data.len());
        let (proxy, conn_id) = {
            let state = self.shared.state.lock();
            (state.proxy.clone(), state.proxy_id.ok_or(SocketError::Closed)?)
        };
        proxy.send(conn_id, data)
    }

    fn set_timeout(&mut self, timeout: Duration) -> SocketResult<()> {
        trace!("[id={}] {:?}", self.shared.id, timeout);
        let (proxy, conn_id) = {
            let mut state = self.shared.state.lock();
            if let Some(info) = state.fallback_info.as_mut() {
                info.timeout = Some(timeout);
            }
            (state.proxy.clone(), state.proxy_id.ok_or(SocketError::Closed)?)
        };
        if proxy.set_timeout(conn_id, timeout) {
            Ok(())
        } else {
            Err(SocketError::Closed)
        }
    }

    fn set_callbacks(&mut self, callbacks: Callbacks) -> SocketResult<()> {
        self.shared.socket_callbacks.replace(callbacks);
        Ok(())
    }

    fn protocol(&self) -> TransportProtocol {
        self.shared.proto
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.shared.state.lock().peer
    }

    #[cfg(unix)]
    fn fd(&self) -> Option<std::os::fd::RawFd> {
        let (proxy, conn_id) = {
            let state = self.shared.state.lock();
            (state.proxy.clone(), state.proxy_id?)
        };
        proxy.fd(conn_id)
    }
}

impl Drop for ProxiedSocket {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.fallback_info = None;
        if let Some(conn_id) = state.proxy_id.take() {
            let proxy = state.proxy.clone();
            drop(state);
            proxy.close_connection(conn_id);
        }
    }
}

/// Register a connection with the current proxy and (re-)arm the fallback
/// window. Shared by the public `connect` and the fallback path.
fn connect_through_current_proxy(
    shared: &Arc<Shared>,
    peer: SocketAddr,
    timeout: Option<Duration>,
) -> SocketResult<()> {
    // Arm the fallback window before the proxy can dispatch any event for
    // the new connection; on_connected consumes it, never resurrects it.
    let proxy = {
        let mut state = shared.state.lock();
        state.fallback_info = Some(FallbackInfo {
            peer,
            connect_timestamp: Instant::now(),
            timeout,
            proxy: None,
        });
        state.proxy.clone()
    };

    let result = proxy.connect(ProxyConnectParameters {
        proto: shared.proto,
        peer,
        callbacks: dispatch_shim(shared),
        timeout,
        outbound_interface: shared.outbound_interface.clone(),
    });

    let mut state = shared.state.lock();
    match result {
        Ok(conn_id) => {
            state.proxy_id = Some(conn_id);
            state.peer = Some(peer);
            Ok(())
        }
        Err(e) => {
            state.fallback_info = None;
            Err(e)
        }
    }
}

/// The callback set installed as the proxy's dispatch target.
fn dispatch_shim(shared: &Arc<Shared>) -> ProxyCallbacks {
    let weak = Arc::downgrade(shared);

    let on_successful = weak.clone();
    let on_failed = weak.clone();
    let on_connected = weak.clone();
    let on_read = weak.clone();
    let on_close = weak;

    ProxyCallbacks {
        on_successful_proxy_connection: Some(Arc::new(move || {
            if let Some(shared) = on_successful.upgrade() {
                (shared.proxied_callbacks.on_successful_proxy_connection)();
            }
        })),
        on_proxy_connection_failed: Some(Arc::new(move |err: SocketError| {
            if let Some(shared) = on_failed.upgrade() {
                handle_proxy_connection_failed(&shared, err);
            }
        })),
        on_connected: Some(Arc::new(move |_conn_id| {
            if let Some(shared) = on_connected.upgrade() {
                trace!("[id={}] connected", shared.id);
                shared.state.lock().fallback_info = None;
                shared.socket_callbacks.dispatch_connected();
            }
        })),
        on_read: Some(Arc::new(move |data: &[u8]| {
            if let Some(shared) = on_read.upgrade() {
                trace!("[id={}] {}", shared.id, data.len());
                shared.socket_callbacks.dispatch_read(data);
            }
        })),
        on_close: Some(Arc::new(move |err: Option<SocketError>| {
            if let Some(shared) = on_close.upgrade() {
                handle_close(&shared, err);
            }
        })),
    }
}

fn handle_proxy_connection_failed(shared: &Arc<Shared>, err: SocketError) {
    let result = (shared.proxied_callbacks.on_proxy_connection_failed)(err);
    match result {
        ProxyConnectionFailedResult::CloseConnection => {
            // Nothing to do; the failure will arrive through on_close.
        }
        ProxyConnectionFailedResult::Fallback { proxy } => {
            let mut state = shared.state.lock();
            if state.fell_back {
                debug!("[id={}] fallback already used, ignoring", shared.id);
                return;
            }
            if let Some(info) = state.fallback_info.as_mut() {
                info.proxy = Some(proxy);
            }
        }
    }
}

fn handle_close(shared: &Arc<Shared>, mut error: Option<SocketError>) {
    if let Some(err) = &error {
        debug!("[id={}] {}", shared.id, err);
    }

    // The fallback window closes here no matter what: the info is consumed.
    let fallback = {
        let mut state = shared.state.lock();
        match state.fallback_info.take() {
            Some(info) if info.proxy.is_some() && !state.fell_back => {
                state.fell_back = true;
                let old = state.proxy_id.take().map(|id| (state.proxy.clone(), id));
                let new_proxy = info.proxy.clone().unwrap();
                state.proxy = new_proxy;
                Some((old, info))
            }
            _ => None,
        }
    };

    if let Some((old, info)) = fallback {
        debug!("[id={}] falling back to alternate proxy", shared.id);
        if let Some((old_proxy, old_id)) = old {
            old_proxy.close_connection(old_id);
        }
        let elapsed = info.connect_timestamp.elapsed();
        let remaining = info.timeout.map(|t| t.saturating_sub(elapsed));
        match connect_through_current_proxy(shared, info.peer, remaining) {
            Ok(()) => {
                // The new connection drives all subsequent callbacks; the
                // original error is suppressed.
                return;
            }
            Err(e) => {
                debug!("[id={}] failed to fall back: {}", shared.id, e);
                error = Some(e);
            }
        }
    }

    shared.socket_callbacks.dispatch_close(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct_proxy::DirectProxy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc::unbounded_channel;

    /// Proxy double that reports a proxy-leg failure followed by a close,
    /// recording every connect request it sees.
    #[derive(Default)]
    struct FailingProxy {
        connects: Mutex<Vec<Option<Duration>>>,
    }

    impl OutboundProxy for FailingProxy {
        fn connect(&self, params: ProxyConnectParameters) -> SocketResult<ProxyConnId> {
            self.connects.lock().push(params.timeout);
            let callbacks = params.callbacks;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(failed) = &callbacks.on_proxy_connection_failed {
                    failed(SocketError::ProxyFailed("unreachable".to_string()));
                }
                if let Some(close) = &callbacks.on_close {
                    close(Some(SocketError::ProxyFailed("unreachable".to_string())));
                }
            });
            Ok(1)
        }

        fn send(&self, _conn_id: ProxyConnId, _data: &[u8]) -> SocketResult<()> {
            Err(SocketError::Closed)
        }

        fn set_timeout(&self, _conn_id: ProxyConnId, _timeout: Duration) -> bool {
            true
        }

        fn set_callbacks(
            &self,
            _conn_id: ProxyConnId,
            _callbacks: ProxyCallbacks,
        ) -> SocketResult<()> {
            Ok(())
        }

        fn close_connection(&self, _conn_id: ProxyConnId) {}
    }

    fn policy(
        fallback: Option<Arc<dyn OutboundProxy>>,
        failures: Arc<AtomicUsize>,
    ) -> ProxiedSocketCallbacks {
        ProxiedSocketCallbacks {
            on_successful_proxy_connection: Arc::new(|| {}),
            on_proxy_connection_failed: Arc::new(move |_err| {
                failures.fetch_add(1, Ordering::SeqCst);
                match &fallback {
                    Some(proxy) => ProxyConnectionFailedResult::Fallback {
                        proxy: proxy.clone(),
                    },
                    None => ProxyConnectionFailedResult::CloseConnection,
                }
            }),
        }
    }

    #[tokio::test]
    async fn test_fallback_to_direct_connection() {
        // Scenario: the proxy reports failure, policy chooses the direct
        // pseudo-proxy, and the application observes a single on_connected
        // with no error.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let failing: Arc<FailingProxy> = Arc::new(FailingProxy::default());
        let direct: Arc<dyn OutboundProxy> = Arc::new(DirectProxy::new());
        let failures = Arc::new(AtomicUsize::new(0));

        let mut socket = ProxiedSocket::new(
            1,
            ProxiedSocketParameters {
                proto: TransportProtocol::Tcp,
                outbound_interface: None,
                proxy: failing.clone(),
                callbacks: policy(Some(direct), failures.clone()),
            },
        );

        #[derive(Debug, PartialEq)]
        enum Event {
            Connected,
            Read(Vec<u8>),
            Closed(bool),
        }
        let (event_tx, mut event_rx) = unbounded_channel();
        let connected_tx = event_tx.clone();
        let read_tx = event_tx.clone();
        let close_tx = event_tx.clone();

        socket
            .connect(ConnectParameters {
                peer: server_addr,
                callbacks: Callbacks {
                    on_connected: Some(Arc::new(move || {
                        connected_tx.send(Event::Connected).unwrap();
                    })),
                    on_read: Some(Arc::new(move |data: &[u8]| {
                        read_tx.send(Event::Read(data.to_vec())).unwrap();
                    })),
                    on_close: Some(Arc::new(move |err: Option<SocketError>| {
                        close_tx.send(Event::Closed(err.is_some())).unwrap();
                    })),
                },
                timeout: Some(Duration::from_secs(5)),
            })
            .unwrap();

        assert_eq!(event_rx.recv().await.unwrap(), Event::Connected);
        assert_eq!(event_rx.recv().await.unwrap(), Event::Read(b"hi".to_vec()));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // The failed proxy saw the original budget; the fallback consumed
        // part of it.
        let seen = failing.connects.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_peer_persists_after_connect_and_fallback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let failing: Arc<FailingProxy> = Arc::new(FailingProxy::default());
        let direct: Arc<dyn OutboundProxy> = Arc::new(DirectProxy::new());
        let failures = Arc::new(AtomicUsize::new(0));

        let mut socket = ProxiedSocket::new(
            4,
            ProxiedSocketParameters {
                proto: TransportProtocol::Tcp,
                outbound_interface: None,
                proxy: failing,
                callbacks: policy(Some(direct), failures),
            },
        );
        assert_eq!(socket.peer(), None);

        let (connected_tx, mut connected_rx) = unbounded_channel();
        socket
            .connect(ConnectParameters {
                peer: server_addr,
                callbacks: Callbacks {
                    on_connected: Some(Arc::new(move || {
                        connected_tx.send(()).unwrap();
                    })),
                    ..Callbacks::none()
                },
                timeout: Some(Duration::from_secs(5)),
            })
            .unwrap();
        assert_eq!(socket.peer(), Some(server_addr));

        // The proxy fails, the fallback connects directly; the peer is
        // unchanged once the socket is connected.
        connected_rx.recv().await.unwrap();
        assert_eq!(socket.peer(), Some(server_addr));
    }

    #[tokio::test]
    async fn test_fallback_budget_is_reduced() {
        let failing: Arc<FailingProxy> = Arc::new(FailingProxy::default());
        let recording: Arc<FailingProxy> = Arc::new(FailingProxy::default());
        let failures = Arc::new(AtomicUsize::new(0));

        let mut socket = ProxiedSocket::new(
            2,
            ProxiedSocketParameters {
                proto: TransportProtocol::Tcp,
                outbound_interface: None,
                proxy: failing.clone(),
                callbacks: policy(Some(recording.clone()), failures.clone()),
            },
        );

        let (close_tx, mut close_rx) = unbounded_channel();
        socket
            .connect(ConnectParameters {
                peer: "127.0.0.1:1".parse().unwrap(),
                callbacks: Callbacks {
                    on_close: Some(Arc::new(move |err: Option<SocketError>| {
                        close_tx.send(err.is_some()).unwrap();
                    })),
                    ..Callbacks::none()
                },
                timeout: Some(Duration::from_secs(5)),
            })
            .unwrap();

        // Both proxies fail; the second failure propagates (fallback is
        // at-most-once).
        assert!(close_rx.recv().await.unwrap());
        assert_eq!(failures.load(Ordering::SeqCst), 2);

        let second = recording.connects.lock().clone();
        assert_eq!(second.len(), 1);
        let budget = second[0].unwrap();
        assert!(budget < Duration::from_secs(5));
        assert!(budget > Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_close_connection_policy_propagates_error() {
        let failing: Arc<FailingProxy> = Arc::new(FailingProxy::default());
        let failures = Arc::new(AtomicUsize::new(0));

        let mut socket = ProxiedSocket::new(
            3,
            ProxiedSocketParameters {
                proto: TransportProtocol::Tcp,
                outbound_interface: None,
                proxy: failing,
                callbacks: policy(None, failures.clone()),
            },
        );

        let (close_tx, mut close_rx) = unbounded_channel();
        socket
            .connect(ConnectParameters {
                peer: "127.0.0.1:1".parse().unwrap(),
                callbacks: Callbacks {
                    on_close: Some(Arc::new(move |err: Option<SocketError>| {
                        close_tx.send(err.is_some()).unwrap();
                    })),
                    ..Callbacks::none()
                },
                timeout: Some(Duration::from_secs(1)),
            })
            .unwrap();

        assert!(close_rx.recv().await.unwrap());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
