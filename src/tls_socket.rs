//! TLS engine layered over a stream socket.
//!
//! The inner socket may be a raw TCP socket or a proxied one; the TLS driver
//! bridges it into async I/O, performs the rustls handshake and then speaks
//! the plain [`Socket`] callback contract towards the caller. Session
//! resumption state comes from the client config built by the factory, which
//! scopes the shared cache by `(server_name, alpn)`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{SocketError, SocketResult};
use crate::socket::{
    maybe_timeout, Callbacks, ConnectParameters, DriverCommand, SharedCallbacks, Socket,
    TransportProtocol,
};
use crate::socket_stream::{connect_stream, SocketSender};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// TLS parameters for a secured socket.
#[derive(Clone)]
pub struct SecureSocketParameters {
    pub client_config: Arc<rustls::ClientConfig>,
    pub server_name: String,
}

/// Stream socket secured with TLS, implementing the same [`Socket`]
/// contract as its inner transport. `on_connected` fires after the
/// handshake completes.
pub struct TlsTransportSocket {
    id: u64,
    inner: Option<Box<dyn Socket>>,
    tls: SecureSocketParameters,
    callbacks: SharedCallbacks,
    command_tx: Option<mpsc::UnboundedSender<DriverCommand>>,
    driver: Option<tokio::task::AbortHandle>,
    peer: Option<SocketAddr>,
    inner_sender: Arc<Mutex<Option<SocketSender>>>,
}

impl TlsTransportSocket {
    pub fn new(id: u64, inner: Box<dyn Socket>, tls: SecureSocketParameters) -> Self {
        Self {
            id,
            inner: Some(inner),
            tls,
            callbacks: SharedCallbacks::default(),
            command_tx: None,
            driver: None,
            peer: None,
            inner_sender: Arc::new(Mutex::new(None)),
        }
    }
}

impl Socket for TlsTransportSocket {
    fn connect(&mut self, params: ConnectParameters) -> SocketResult<()> {
        let inner = self.inner.take().ok_or_else(|| {
            SocketError::InvalidArgument("socket is already connected".to_string())
        })?;
        trace!(
            "[id={}] connecting TLS to {} (sni {})",
            self.id,
            params.peer,
            self.tls.server_name
        );

        let server_name = ServerName::try_from(self.tls.server_name.clone()).map_err(|_| {
            SocketError::InvalidArgument(format!("invalid server name: {}", self.tls.server_name))
        })?;

        self.callbacks.replace(params.callbacks);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(run_driver(
            self.id,
            inner,
            params.peer,
            params.timeout,
            self.tls.client_config.clone(),
            server_name,
            self.callbacks.clone(),
            command_rx,
            self.inner_sender.clone(),
        ));

        self.peer = Some(params.peer);
        self.command_tx = Some(command_tx);
        self.driver = Some(driver.abort_handle());
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> SocketResult<()> {
        trace!("[id={}] {}", self.id, data.len());
        let tx = self.command_tx.as_ref().ok_or(SocketError::Closed)?;
        tx.send(DriverCommand::Send(data.to_vec()))
            .map_err(|_| SocketError::Closed)
    }

    fn set_timeout(&mut self, timeout: Duration) -> SocketResult<()> {
        let tx = self.command_tx.as_ref().ok_or(SocketError::Closed)?;
        tx.send(DriverCommand::SetTimeout(timeout))
            .map_err(|_| SocketError::Closed)
    }

    fn set_callbacks(&mut self, callbacks: Callbacks) -> SocketResult<()> {
        self.callbacks.replace(callbacks);
        Ok(())
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[cfg(unix)]
    fn fd(&self) -> Option<std::os::fd::RawFd> {
        self.inner_sender.lock().as_ref().and_then(|s| s.fd())
    }
}

impl Drop for TlsTransportSocket {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_driver(
    id: u64,
    inner: Box<dyn Socket>,
    peer: SocketAddr,
    timeout: Option<Duration>,
    client_config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
    callbacks: SharedCallbacks,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    inner_sender: Arc<Mutex<Option<SocketSender>>>,
) {
    let mut timeout = timeout;

    let stream = match connect_stream(inner, peer, timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("[id={}] inner connect failed: {}", id, e);
            callbacks.dispatch_close(Some(e));
            return;
        }
    };
    *inner_sender.lock() = Some(stream.sender());

    let connector = tokio_rustls::TlsConnector::from(client_config);
    let tls_stream = match maybe_timeout(timeout, connector.connect(server_name, stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("[id={}] TLS handshake failed: {}", id, e);
            callbacks.dispatch_close(Some(SocketError::TlsHandshake(e.to_string())));
            return;
        }
        Err(e) => {
            callbacks.dispatch_close(Some(e));
            return;
        }
    };

    callbacks.dispatch_connected();

    let (mut read_half, mut write_half) = tokio::io::split(tls_stream);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(DriverCommand::Send(data)) => {
                    let written = async {
                        write_half.write_all(&data).await?;
                        write_half.flush().await
                    };
                    if let Err(e) = written.await {
                        debug!("[id={}] TLS send failed: {}", id, e);
                        callbacks.dispatch_close(Some(e.into()));
                        return;
                    }
                }
                Some(DriverCommand::SetTimeout(new_timeout)) => {
                    timeout = Some(new_timeout);
                }
                None => return,
            },
            received = maybe_timeout(timeout, read_half.read(&mut buf)) => match received {
                Ok(Ok(0)) => {
                    callbacks.dispatch_close(None);
                    return;
                }
                Ok(Ok(n)) => callbacks.dispatch_read(&buf[..n]),
                Ok(Err(e)) => {
                    debug!("[id={}] TLS read failed: {}", id, e);
                    callbacks.dispatch_close(Some(e.into()));
                    return;
                }
                Err(e) => {
                    callbacks.dispatch_close(Some(e));
                    return;
                }
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::spawn_tls_echo_server;
    use super::*;
    use crate::rustls_util::{create_client_config, DisabledVerifier};
    use crate::tcp_socket::TcpTransportSocket;
    use crate::tls_session_cache::TlsSessionCache;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_tls_echo_over_callback_socket() {
        let server_addr = spawn_tls_echo_server().await;

        let cache = TlsSessionCache::new(16);
        let client_config = Arc::new(create_client_config(
            Some(Arc::new(DisabledVerifier::new())),
            &[],
            &cache,
        ));

        let inner = Box::new(TcpTransportSocket::new(1, None));
        let mut socket = TlsTransportSocket::new(
            2,
            inner,
            SecureSocketParameters {
                client_config,
                server_name: "localhost".to_string(),
            },
        );

        let (event_tx, mut event_rx) = unbounded_channel();
        let connected_tx = event_tx.clone();
        let read_tx = event_tx.clone();
        socket
            .connect(ConnectParameters {
                peer: server_addr,
                callbacks: Callbacks {
                    on_connected: Some(Arc::new(move || {
                        connected_tx.send(Vec::new()).unwrap();
                    })),
                    on_read: Some(Arc::new(move |data: &[u8]| {
                        read_tx.send(data.to_vec()).unwrap();
                    })),
                    on_close: None,
                },
                timeout: Some(Duration::from_secs(5)),
            })
            .unwrap();
        socket.send(b"secured").unwrap();

        assert!(event_rx.recv().await.unwrap().is_empty());
        assert_eq!(event_rx.recv().await.unwrap(), b"secured");
    }

    #[tokio::test]
    async fn test_handshake_failure_reports_tls_error() {
        // Plain TCP acceptor that immediately closes: handshake cannot
        // complete.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let cache = TlsSessionCache::new(16);
        let client_config = Arc::new(create_client_config(
            Some(Arc::new(DisabledVerifier::new())),
            &[],
            &cache,
        ));

        let inner = Box::new(TcpTransportSocket::new(3, None));
        let mut socket = TlsTransportSocket::new(
            4,
            inner,
            SecureSocketParameters {
                client_config,
                server_name: "localhost".to_string(),
            },
        );

        let (close_tx, mut close_rx) = unbounded_channel();
        socket
            .connect(ConnectParameters {
                peer: server_addr,
                callbacks: Callbacks {
                    on_close: Some(Arc::new(move |err: Option<SocketError>| {
                        close_tx.send(err.map(|e| e.to_string())).unwrap();
                    })),
                    ..Callbacks::none()
                },
                timeout: Some(Duration::from_secs(5)),
            })
            .unwrap();

        let err = close_rx.recv().await.unwrap();
        assert!(err.is_some());
    }
}
