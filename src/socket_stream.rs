//! Bridges a callback-driven [`Socket`] into the async I/O world.
//!
//! Exchange tasks are plain futures; the socket layer reports events through
//! callbacks. [`connect_stream`] installs callbacks that forward events into
//! a channel and resolves once the socket is connected. The returned
//! [`SocketStream`] implements `AsyncRead`/`AsyncWrite` for stream
//! transports and exposes datagram-preserving reads for UDP.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::error::{SocketError, SocketResult};
use crate::socket::{Callbacks, ConnectParameters, Socket};

enum StreamEvent {
    Connected,
    Data(Vec<u8>),
    Closed(Option<SocketError>),
}

/// Cloneable write handle for a connected socket. Writes are synchronous:
/// they enqueue into the transport driver.
#[derive(Clone)]
pub struct SocketSender {
    socket: Arc<parking_lot::Mutex<Box<dyn Socket>>>,
}

impl SocketSender {
    pub fn send(&self, data: &[u8]) -> SocketResult<()> {
        self.socket.lock().send(data)
    }

    #[cfg(unix)]
    pub fn fd(&self) -> Option<std::os::fd::RawFd> {
        self.socket.lock().fd()
    }
}

/// Async adapter over a connected callback socket.
pub struct SocketStream {
    sender: SocketSender,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    buffer: BytesMut,
    closed: Option<Option<SocketError>>,
}

/// Connect `socket` to `peer` and wait for the connection to be
/// established. Returns an error if the socket closes before connecting or
/// the timeout fires first.
pub async fn connect_stream(
    mut socket: Box<dyn Socket>,
    peer: SocketAddr,
    timeout: Option<Duration>,
) -> SocketResult<SocketStream> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let connected_tx = event_tx.clone();
    let read_tx = event_tx.clone();
    let close_tx = event_tx;
    let callbacks = Callbacks {
        on_connected: Some(Arc::new(move || {
            let _ = connected_tx.send(StreamEvent::Connected);
        })),
        on_read: Some(Arc::new(move |data: &[u8]| {
            let _ = read_tx.send(StreamEvent::Data(data.to_vec()));
        })),
        on_close: Some(Arc::new(move |err: Option<SocketError>| {
            let _ = close_tx.send(StreamEvent::Closed(err));
        })),
    };

    socket.connect(ConnectParameters {
        peer,
        callbacks,
        timeout,
    })?;

    // The driver enforces the timeout; if it is dropped without reporting,
    // the channel closes and we surface that as a plain close.
    loop {
        match event_rx.recv().await {
            Some(StreamEvent::Connected) => break,
            Some(StreamEvent::Data(_)) => continue,
            Some(StreamEvent::Closed(Some(err))) => return Err(err),
            Some(StreamEvent::Closed(None)) | None => return Err(SocketError::Closed),
        }
    }

    Ok(SocketStream {
        sender: SocketSender {
            socket: Arc::new(parking_lot::Mutex::new(socket)),
        },
        events: event_rx,
        buffer: BytesMut::new(),
        closed: None,
    })
}

impl SocketStream {
    /// Cloneable write handle, usable while reads are parked in a demux
    /// task.
    pub fn sender(&self) -> SocketSender {
        self.sender.clone()
    }

    /// Receive one message event, preserving datagram boundaries. Intended
    /// for datagram sockets; must not be mixed with `AsyncRead` usage.
    pub async fn recv_message(&mut self) -> SocketResult<Vec<u8>> {
        if let Some(err) = self.closed.take() {
            return Err(err.unwrap_or(SocketError::Closed));
        }
        loop {
            match self.events.recv().await {
                Some(StreamEvent::Data(data)) => return Ok(data),
                Some(StreamEvent::Connected) => continue,
                Some(StreamEvent::Closed(Some(err))) => return Err(err),
                Some(StreamEvent::Closed(None)) | None => return Err(SocketError::Closed),
            }
        }
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.buffer.is_empty() {
                let to_copy = self.buffer.len().min(buf.remaining());
                buf.put_slice(&self.buffer[..to_copy]);
                self.buffer.advance(to_copy);
                return Poll::Ready(Ok(()));
            }

            if let Some(err) = &self.closed {
                return match err {
                    // EOF
                    None => Poll::Ready(Ok(())),
                    Some(e) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
                };
            }

            match self.events.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Data(data))) => {
                    self.buffer.extend_from_slice(&data);
                }
                Poll::Ready(Some(StreamEvent::Connected)) => continue,
                Poll::Ready(Some(StreamEvent::Closed(err))) => {
                    self.closed = Some(err);
                }
                Poll::Ready(None) => {
                    self.closed = Some(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.sender.send(buf) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
