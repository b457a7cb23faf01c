//! Direct-connection pseudo-proxy.
//!
//! Implements the [`OutboundProxy`] contract by opening plain sockets to the
//! peer. Used as the fallback target when the real outbound proxy fails, and
//! as the uniform backend when no proxy is configured at all. Since there is
//! no proxy leg, neither `on_successful_proxy_connection` nor
//! `on_proxy_connection_failed` ever fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{SocketError, SocketResult};
use crate::outbound_proxy::{
    OutboundProxy, ProxyCallbacks, ProxyConnId, ProxyConnectParameters,
};
use crate::socket::{Callbacks, ConnectParameters, Socket, TransportProtocol};
use crate::tcp_socket::TcpTransportSocket;
use crate::udp_socket::UdpTransportSocket;

#[derive(Default)]
pub struct DirectProxy {
    next_id: AtomicU64,
    connections: Mutex<FxHashMap<ProxyConnId, Box<dyn Socket>>>,
}

impl DirectProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutboundProxy for DirectProxy {
    fn connect(&self, params: ProxyConnectParameters) -> SocketResult<ProxyConnId> {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut socket: Box<dyn Socket> = match params.proto {
            TransportProtocol::Udp => Box::new(UdpTransportSocket::new(
                conn_id,
                params.outbound_interface.clone(),
            )),
            TransportProtocol::Tcp => Box::new(TcpTransportSocket::new(
                conn_id,
                params.outbound_interface.clone(),
            )),
        };

        socket.connect(ConnectParameters {
            peer: params.peer,
            callbacks: forwarding_callbacks(conn_id, params.callbacks),
            timeout: params.timeout,
        })?;

        self.connections.lock().insert(conn_id, socket);
        Ok(conn_id)
    }

    fn send(&self, conn_id: ProxyConnId, data: &[u8]) -> SocketResult<()> {
        let mut connections = self.connections.lock();
        let socket = connections.get_mut(&conn_id).ok_or(SocketError::Closed)?;
        socket.send(data)
    }

    fn set_timeout(&self, conn_id: ProxyConnId, timeout: Duration) -> bool {
        let mut connections = self.connections.lock();
        match connections.get_mut(&conn_id) {
            Some(socket) => socket.set_timeout(timeout).is_ok(),
            None => false,
        }
    }

    fn set_callbacks(&self, conn_id: ProxyConnId, callbacks: ProxyCallbacks) -> SocketResult<()> {
        let mut connections = self.connections.lock();
        let socket = connections.get_mut(&conn_id).ok_or(SocketError::Closed)?;
        socket.set_callbacks(forwarding_callbacks(conn_id, callbacks))
    }

    fn close_connection(&self, conn_id: ProxyConnId) {
        self.connections.lock().remove(&conn_id);
    }

    #[cfg(unix)]
    fn fd(&self, conn_id: ProxyConnId) -> Option<std::os::fd::RawFd> {
        self.connections.lock().get(&conn_id).and_then(|s| s.fd())
    }
}

fn forwarding_callbacks(conn_id: ProxyConnId, callbacks: ProxyCallbacks) -> Callbacks {
    Callbacks {
        on_connected: callbacks.on_connected.map(|on_connected| {
            Arc::new(move || on_connected(conn_id)) as Arc<dyn Fn() + Send + Sync>
        }),
        on_read: callbacks.on_read,
        on_close: callbacks.on_close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_direct_tcp_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let proxy = DirectProxy::new();
        let (event_tx, mut event_rx) = unbounded_channel();
        let connected_tx = event_tx.clone();
        let read_tx = event_tx.clone();

        let conn_id = proxy
            .connect(ProxyConnectParameters {
                proto: TransportProtocol::Tcp,
                peer: server_addr,
                callbacks: ProxyCallbacks {
                    on_connected: Some(Arc::new(move |id| {
                        connected_tx.send(format!("connected:{id}")).unwrap();
                    })),
                    on_read: Some(Arc::new(move |data: &[u8]| {
                        read_tx
                            .send(String::from_utf8_lossy(data).into_owned())
                            .unwrap();
                    })),
                    ..ProxyCallbacks::default()
                },
                timeout: Some(Duration::from_secs(5)),
                outbound_interface: None,
            })
            .unwrap();

        assert_eq!(
            event_rx.recv().await.unwrap(),
            format!("connected:{conn_id}")
        );
        proxy.send(conn_id, b"direct").unwrap();
        assert_eq!(event_rx.recv().await.unwrap(), "direct");

        proxy.close_connection(conn_id);
        assert!(matches!(
            proxy.send(conn_id, b"after close"),
            Err(SocketError::Closed)
        ));
    }
}
