//! Datagram transport socket with a callback-driven driver task.

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::mpsc;

use crate::error::{SocketError, SocketResult};
use crate::socket::{
    maybe_timeout, Callbacks, ConnectParameters, DriverCommand, SharedCallbacks, Socket,
    TransportProtocol,
};
use crate::socket_util::new_udp_socket;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// UDP socket implementing the [`Socket`] contract. One datagram per
/// `on_read` delivery.
pub struct UdpTransportSocket {
    id: u64,
    outbound_interface: Option<crate::socket::IfId>,
    callbacks: SharedCallbacks,
    command_tx: Option<mpsc::UnboundedSender<DriverCommand>>,
    driver: Option<tokio::task::AbortHandle>,
    peer: Option<SocketAddr>,
    #[cfg(unix)]
    fd: Option<std::os::fd::RawFd>,
}

impl UdpTransportSocket {
    pub fn new(id: u64, outbound_interface: Option<crate::socket::IfId>) -> Self {
        Self {
            id,
            outbound_interface,
            callbacks: SharedCallbacks::default(),
            command_tx: None,
            driver: None,
            peer: None,
            #[cfg(unix)]
            fd: None,
        }
    }
}

impl Socket for UdpTransportSocket {
    fn connect(&mut self, params: ConnectParameters) -> SocketResult<()> {
        if self.driver.is_some() {
            return Err(SocketError::InvalidArgument(
                "socket is already connected".to_string(),
            ));
        }
        trace!("[id={}] connecting UDP to {}", self.id, params.peer);

        self.callbacks.replace(params.callbacks);

        let socket = new_udp_socket(&params.peer, self.outbound_interface.as_ref())?;
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            self.fd = Some(socket.as_raw_fd());
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(run_driver(
            self.id,
            socket,
            params.peer,
            params.timeout,
            self.callbacks.clone(),
            command_rx,
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
        TransportProtocol::Udp
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[cfg(unix)]
    fn fd(&self) -> Option<std::os::fd::RawFd> {
        self.fd
    }
}

impl Drop for UdpTransportSocket {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

async fn run_driver(
    id: u64,
    socket: tokio::net::UdpSocket,
    peer: SocketAddr,
    timeout: Option<Duration>,
    callbacks: SharedCallbacks,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
) {
    let mut timeout = timeout;

    match maybe_timeout(timeout, socket.connect(peer)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!("[id={}] UDP connect failed: {}", id, e);
            callbacks.dispatch_close(Some(e.into()));
            return;
        }
        Err(e) => {
            callbacks.dispatch_close(Some(e));
            return;
        }
    }

    callbacks.dispatch_connected();

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(DriverCommand::Send(data)) => {
                    if let Err(e) = socket.send(&data).await {
                        debug!("[id={}] UDP send failed: {}", id, e);
                        callbacks.dispatch_close(Some(e.into()));
                        return;
                    }
                }
                Some(DriverCommand::SetTimeout(new_timeout)) => {
                    timeout = Some(new_timeout);
                }
                // Handle dropped; stop silently.
                None => return,
            },
            received = maybe_timeout(timeout, socket.recv(&mut buf)) => match received {
                Ok(Ok(n)) => callbacks.dispatch_read(&buf[..n]),
                Ok(Err(e)) => {
                    debug!("[id={}] UDP recv failed: {}", id, e);
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
