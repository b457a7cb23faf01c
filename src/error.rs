//! Error types shared across the socket and upstream layers.

use std::fmt;

/// Errors surfaced by the socket layer (raw, secured and proxied sockets).
#[derive(Debug)]
pub enum SocketError {
    /// A parameter was rejected before any I/O happened.
    InvalidArgument(String),
    /// Establishing or using the connection failed.
    Network(std::io::Error),
    /// The operation did not finish within the configured timeout.
    Timeout,
    /// The TLS handshake was not completed.
    TlsHandshake(String),
    /// The outbound proxy reported a failure for this connection.
    ProxyFailed(String),
    /// The connection was torn down before the operation finished.
    Closed,
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::Network(e) => write!(f, "network error: {}", e),
            Self::Timeout => write!(f, "operation timed out"),
            Self::TlsHandshake(msg) => write!(f, "TLS handshake failed: {}", msg),
            Self::ProxyFailed(msg) => write!(f, "proxy connection failed: {}", msg),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::InvalidInput => Self::InvalidArgument(e.to_string()),
            _ => Self::Network(e),
        }
    }
}

pub type SocketResult<T> = Result<T, SocketError>;

/// Errors returned from [`crate::upstream::Upstream::exchange`].
#[derive(Debug)]
pub enum DnsError {
    /// A caller-supplied value (address, stamp, prefix length) was rejected.
    InvalidArgument(String),
    /// The upstream hostname could not be resolved through the bootstrap servers.
    BootstrapFailed(String),
    /// The exchange did not finish within the upstream timeout.
    Timeout,
    /// The peer was unreachable at the network layer.
    NetworkUnreachable(String),
    /// The TLS handshake with the upstream failed.
    TlsHandshakeFailed(String),
    /// The peer violated the transport protocol (malformed response, bad
    /// length prefix, unexpected HTTP status).
    ProtocolViolation(String),
    /// The exchange was cancelled before it finished.
    Cancelled,
    /// The outbound proxy failed and no fallback was possible.
    ProxyFailed(String),
    /// The DNS message codec rejected the request or response.
    Codec(String),
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::BootstrapFailed(msg) => write!(f, "bootstrap failed: {}", msg),
            Self::Timeout => write!(f, "exchange timed out"),
            Self::NetworkUnreachable(msg) => write!(f, "network unreachable: {}", msg),
            Self::TlsHandshakeFailed(msg) => write!(f, "TLS handshake failed: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::Cancelled => write!(f, "exchange cancelled"),
            Self::ProxyFailed(msg) => write!(f, "proxy failed: {}", msg),
            Self::Codec(msg) => write!(f, "codec error: {}", msg),
        }
    }
}

impl std::error::Error for DnsError {}

impl From<SocketError> for DnsError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            SocketError::Timeout => Self::Timeout,
            SocketError::TlsHandshake(msg) => Self::TlsHandshakeFailed(msg),
            SocketError::ProxyFailed(msg) => Self::ProxyFailed(msg),
            SocketError::Network(e) => Self::NetworkUnreachable(e.to_string()),
            SocketError::Closed => Self::NetworkUnreachable("connection closed".to_string()),
        }
    }
}

impl From<std::io::Error> for DnsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::InvalidInput => Self::InvalidArgument(e.to_string()),
            _ => Self::NetworkUnreachable(e.to_string()),
        }
    }
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        Self::Codec(e.to_string())
    }
}

pub type ExchangeResult = Result<hickory_proto::op::Message, DnsError>;

/// Errors returned from [`crate::upstream::Upstream::init`]. Terminal for the
/// upstream; the caller may reconstruct it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    EmptyServerName,
    EmptyBootstrap,
    BootstrapperInitFailed,
    InvalidAddress,
    TlsContextInitFailed,
    HttpHeadersInitFailed,
    HttpPoolInitFailed,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::EmptyServerName => "server name is empty",
            Self::EmptyBootstrap => "bootstrap should not be empty when server IP address is not known",
            Self::BootstrapperInitFailed => "failed to create bootstrapper",
            Self::InvalidAddress => "passed server address is not valid",
            Self::TlsContextInitFailed => "failed to initialize TLS context",
            Self::HttpHeadersInitFailed => "failed to initialize HTTP headers",
            Self::HttpPoolInitFailed => "failed to initialize HTTP connection pool",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for InitError {}

/// Errors returned from [`crate::upstream::UpstreamFactory::create_upstream`].
#[derive(Debug)]
pub enum UpstreamCreateError {
    InvalidUrl(String),
    InvalidStamp(String),
    InitFailed(InitError),
}

impl fmt::Display for UpstreamCreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl(msg) => write!(f, "invalid URL: {}", msg),
            Self::InvalidStamp(msg) => write!(f, "invalid DNS stamp: {}", msg),
            Self::InitFailed(e) => write!(f, "error initializing upstream: {}", e),
        }
    }
}

impl std::error::Error for UpstreamCreateError {}

impl From<InitError> for UpstreamCreateError {
    fn from(e: InitError) -> Self {
        Self::InitFailed(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let e: SocketError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(e, SocketError::Timeout));

        let e: DnsError = SocketError::TlsHandshake("bad cert".to_string()).into();
        assert!(matches!(e, DnsError::TlsHandshakeFailed(_)));
    }

    #[test]
    fn test_init_error_display() {
        assert_eq!(
            InitError::EmptyBootstrap.to_string(),
            "bootstrap should not be empty when server IP address is not known"
        );
    }
}
