//! Abstract socket contract shared by all transports.
//!
//! A socket is connected once, then drives the caller through a callback set:
//! exactly one of `on_connected` / `on_close` fires after a successful
//! `connect`, zero or more `on_read` deliveries happen in between, and
//! `on_close` is terminal. Callback dispatch on a given socket is totally
//! ordered. `set_callbacks` may race with dispatch from the driver task; the
//! next dispatched callback observes the new set.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SocketError, SocketResult};

/// Transport selector for raw sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("UDP"),
            Self::Tcp => f.write_str("TCP"),
        }
    }
}

/// Outbound network interface selector, by name or by index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IfId {
    Name(String),
    Index(u32),
}

/// Caller-supplied callback set. Cloning takes a snapshot, which is how the
/// dispatch path reads it: snapshot under the lock, release, then invoke.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_connected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_read: Option<Arc<dyn Fn(&[u8]) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(Option<SocketError>) + Send + Sync>>,
}

impl Callbacks {
    pub fn none() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_read", &self.on_read.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Parameters for [`Socket::connect`].
#[derive(Clone)]
pub struct ConnectParameters {
    pub peer: SocketAddr,
    pub callbacks: Callbacks,
    pub timeout: Option<Duration>,
}

/// Abstract transport socket. `connect` is non-blocking: it either fails
/// synchronously or returns success and eventually invokes exactly one of
/// `on_connected` or `on_close(err)`.
pub trait Socket: Send {
    fn connect(&mut self, params: ConnectParameters) -> SocketResult<()>;

    fn send(&mut self, data: &[u8]) -> SocketResult<()>;

    fn set_timeout(&mut self, timeout: Duration) -> SocketResult<()>;

    fn set_callbacks(&mut self, callbacks: Callbacks) -> SocketResult<()>;

    fn protocol(&self) -> TransportProtocol;

    fn peer(&self) -> Option<SocketAddr>;

    /// Raw descriptor of the underlying socket, once connected.
    #[cfg(unix)]
    fn fd(&self) -> Option<std::os::fd::RawFd> {
        None
    }
}

/// Commands accepted by a transport driver task.
pub(crate) enum DriverCommand {
    Send(Vec<u8>),
    SetTimeout(Duration),
}

/// Callback set shared between a socket handle and its driver task.
/// Dispatch takes a snapshot under the lock and releases it before invoking
/// application code, so `set_callbacks` never deadlocks against dispatch.
#[derive(Clone, Default)]
pub(crate) struct SharedCallbacks {
    inner: Arc<parking_lot::Mutex<Callbacks>>,
}

impl SharedCallbacks {
    pub fn replace(&self, callbacks: Callbacks) {
        *self.inner.lock() = callbacks;
    }

    pub fn snapshot(&self) -> Callbacks {
        self.inner.lock().clone()
    }

    pub fn dispatch_connected(&self) {
        let cbs = self.snapshot();
        if let Some(on_connected) = cbs.on_connected {
            on_connected();
        }
    }

    pub fn dispatch_read(&self, data: &[u8]) {
        let cbs = self.snapshot();
        if let Some(on_read) = cbs.on_read {
            on_read(data);
        }
    }

    pub fn dispatch_close(&self, error: Option<SocketError>) {
        let cbs = self.snapshot();
        if let Some(on_close) = cbs.on_close {
            on_close(error);
        }
    }
}

/// Await `fut` under an optional deadline.
pub(crate) async fn maybe_timeout<F>(timeout: Option<Duration>, fut: F) -> SocketResult<F::Output>
where
    F: std::future::Future,
{
    match timeout {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| SocketError::Timeout),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callbacks_snapshot_is_cheap() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();
        let cbs = Callbacks {
            on_connected: Some(Arc::new(move || {
                hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            ..Callbacks::none()
        };
        let snapshot = cbs.clone();
        drop(cbs);
        (snapshot.on_connected.unwrap())();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
