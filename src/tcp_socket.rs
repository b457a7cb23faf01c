//! Stream transport socket with a callback-driven driver task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{SocketError, SocketResult};
use crate::socket::{
    maybe_timeout, Callbacks, ConnectParameters, DriverCommand, SharedCallbacks, Socket,
    TransportProtocol,
};
use crate::socket_util::new_tcp_socket;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// TCP socket implementing the [`Socket`] contract. `on_read` delivers
/// whatever the stream produced; framing is the caller's concern.
pub struct TcpTransportSocket {
    id: u64,
    outbound_interface: Option<crate::socket::IfId>,
    callbacks: SharedCallbacks,
    command_tx: Option<mpsc::UnboundedSender<DriverCommand>>,
    driver: Option<tokio::task::AbortHandle>,
    peer: Option<SocketAddr>,
    fd: Arc<Mutex<Option<i32>>>,
}

impl TcpTransportSocket {
    pub fn new(id: u64, outbound_interface: Option<crate::socket::IfId>) -> Self {
        Self {
            id,
            outbound_interface,
            callbacks: SharedCallbacks::default(),
            command_tx: None,
            driver: None,
            peer: None,
            fd: Arc::new(Mutex::new(None)),
        }
    }
}

impl Socket for TcpTransportSocket {
    fn connect(&mut self, params: ConnectParameters) -> SocketResult<()> {
        if self.driver.is_some() {
            return Err(SocketError::InvalidArgument(
                "socket is already connected".to_string(),
            ));
        }
        trace!("[id={}] connecting TCP to {}", self.id, params.peer);

        self.callbacks.replace(params.callbacks);

        let socket = new_tcp_socket(&params.peer, self.outbound_interface.as_ref())?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(run_driver(
            self.id,
            socket,
            params.peer,
            params.timeout,
            self.callbacks.clone(),
            command_rx,
            self.fd.clone(),
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
        *self.fd.lock()
    }
}

impl Drop for TcpTransportSocket {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_driver(
    id: u64,
    socket: tokio::net::TcpSocket,
    peer: SocketAddr,
    timeout: Option<Duration>,
    callbacks: SharedCallbacks,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    fd_slot: Arc<Mutex<Option<i32>>>,
) {
    let mut timeout = timeout;

    let stream = match maybe_timeout(timeout, socket.connect(peer)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("[id={}] TCP connect failed: {}", id, e);
            callbacks.dispatch_close(Some(e.into()));
            return;
        }
        Err(e) => {
            callbacks.dispatch_close(Some(e));
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        *fd_slot.lock() = Some(stream.as_raw_fd());
    }

    callbacks.dispatch_connected();

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(DriverCommand::Send(data)) => {
                    if let Err(e) = write_half.write_all(&data).await {
                        debug!("[id={}] TCP send failed: {}", id, e);
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
                    debug!("[id={}] TCP read failed: {}", id, e);
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
