//! Upstream DNS servers.
//!
//! One [`Upstream`] per configured remote resolver. Variants:
//! - plain DNS over UDP with transparent TCP retry on truncation
//! - plain DNS over TCP (`tcp://`)
//! - DNS-over-TLS (`tls://`)
//! - DNS-over-HTTPS (`https://`)
//! - DNS-over-QUIC (`quic://`)
//! - DNSCrypt (`sdns://` stamps)
//!
//! `init` is invoked exactly once by the factory and must succeed before
//! any `exchange`. Dropping an upstream aborts its connection drivers and
//! cancels in-flight work.

pub mod dnscrypt;
pub mod doh;
pub mod doq;
pub mod dot;
pub mod factory;
pub mod plain;
pub mod stamp;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::Mutex;

use crate::error::{DnsError, ExchangeResult, InitError};
use crate::socket::{IfId, Socket, TransportProtocol};
use crate::socket_factory::{MakeSocketParameters, SocketFactory};
use crate::tls_socket::SecureSocketParameters;

pub use factory::{UpstreamAddress, UpstreamFactory};

/// Used when [`UpstreamOptions::timeout`] is zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for a single upstream.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOptions {
    /// Server address, one of:
    ///     `8.8.8.8:53` -- plain DNS
    ///     `tcp://8.8.8.8:53` -- plain DNS over TCP
    ///     `tls://1.1.1.1` -- DNS-over-TLS
    ///     `https://dns.example.com/dns-query` -- DNS-over-HTTPS
    ///     `quic://dns.example.com:853` -- DNS-over-QUIC
    ///     `sdns://...` -- DNS stamp
    pub address: String,

    /// DNS server URLs used to resolve the hostname in `address`. Each
    /// URL's host part must already be a literal IP.
    pub bootstrap: Vec<String>,

    /// Exchange timeout. Zero means the 5 second default.
    pub timeout: Duration,

    /// Pre-resolved server IP. When set, the bootstrapper is bypassed.
    pub resolved_server_ip: Option<IpAddr>,

    /// Caller-supplied numeric id, carried through logs.
    pub id: i32,

    /// Network interface to route traffic through.
    pub outbound_interface: Option<IfId>,

    /// Suppress the process-wide outbound proxy for this upstream.
    pub ignore_proxy_settings: bool,
}

/// Configuration shared by every upstream a factory produces. Outlives all
/// of them.
#[derive(Clone)]
pub struct UpstreamFactoryConfig {
    pub socket_factory: Arc<SocketFactory>,
    pub ipv6_available: bool,
}

/// A configured remote resolver plus the transport needed to reach it.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Initialize the upstream. Called exactly once, before any exchange.
    async fn init(&mut self) -> Result<(), InitError>;

    /// Perform one DNS exchange. The response's transaction id equals the
    /// request's.
    async fn exchange(&self, request: &Message) -> ExchangeResult;

    fn options(&self) -> &UpstreamOptions;

    /// Rolling RTT estimate.
    fn rtt(&self) -> Duration;

    fn adjust_rtt(&self, elapsed: Duration);

    fn address(&self) -> &str {
        &self.options().address
    }
}

/// State common to all upstream variants.
pub(crate) struct UpstreamBase {
    pub options: UpstreamOptions,
    pub config: UpstreamFactoryConfig,
    rtt: Mutex<Duration>,
}

impl UpstreamBase {
    pub fn new(mut options: UpstreamOptions, config: UpstreamFactoryConfig) -> Self {
        if options.timeout.is_zero() {
            options.timeout = DEFAULT_TIMEOUT;
        }
        Self {
            options,
            config,
            rtt: Mutex::new(Duration::ZERO),
        }
    }

    pub fn rtt(&self) -> Duration {
        *self.rtt.lock()
    }

    pub fn adjust_rtt(&self, elapsed: Duration) {
        let mut rtt = self.rtt.lock();
        *rtt = (*rtt + elapsed) / 2;
    }

    pub fn make_socket(&self, proto: TransportProtocol) -> Box<dyn Socket> {
        self.config.socket_factory.make_socket(MakeSocketParameters {
            proto,
            outbound_interface: self.options.outbound_interface.clone(),
            ignore_proxy_settings: self.options.ignore_proxy_settings,
        })
    }

    pub fn make_secured_socket(&self, secure: SecureSocketParameters) -> Box<dyn Socket> {
        self.config.socket_factory.make_secured_socket(
            MakeSocketParameters {
                proto: TransportProtocol::Tcp,
                outbound_interface: self.options.outbound_interface.clone(),
                ignore_proxy_settings: self.options.ignore_proxy_settings,
            },
            secure,
        )
    }

    /// Run `fut` under the exchange timeout and fold the elapsed time into
    /// the RTT estimate on success.
    pub async fn run_exchange<F>(&self, fut: F) -> ExchangeResult
    where
        F: std::future::Future<Output = ExchangeResult>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(self.options.timeout, fut)
            .await
            .map_err(|_| DnsError::Timeout)?;
        if result.is_ok() {
            self.adjust_rtt(started.elapsed());
        }
        result
    }
}

/// Parse a wire-format DNS message, mapping codec failures to protocol
/// violations.
pub(crate) fn parse_response(bytes: &[u8]) -> Result<Message, DnsError> {
    Message::from_vec(bytes)
        .map_err(|e| DnsError::ProtocolViolation(format!("malformed DNS response: {}", e)))
}

/// Prepend the 2-byte big-endian length used by DNS over stream transports.
pub(crate) fn frame_message(payload: &[u8]) -> Result<Vec<u8>, DnsError> {
    if payload.len() > u16::MAX as usize {
        return Err(DnsError::InvalidArgument(format!(
            "message too large: {} bytes",
            payload.len()
        )));
    }
    let mut framed = Vec::with_capacity(payload.len() + 2);
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_factory::SocketFactoryParameters;

    fn test_config() -> UpstreamFactoryConfig {
        UpstreamFactoryConfig {
            socket_factory: Arc::new(SocketFactory::new(SocketFactoryParameters::default())),
            ipv6_available: true,
        }
    }

    #[test]
    fn test_zero_timeout_coerced_to_default() {
        let base = UpstreamBase::new(
            UpstreamOptions {
                address: "8.8.8.8:53".to_string(),
                ..Default::default()
            },
            test_config(),
        );
        assert_eq!(base.options.timeout, DEFAULT_TIMEOUT);

        let base = UpstreamBase::new(
            UpstreamOptions {
                timeout: Duration::from_millis(750),
                ..Default::default()
            },
            test_config(),
        );
        assert_eq!(base.options.timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_adjust_rtt_is_halving_average() {
        let base = UpstreamBase::new(UpstreamOptions::default(), test_config());
        base.adjust_rtt(Duration::from_millis(100));
        assert_eq!(base.rtt(), Duration::from_millis(50));
        base.adjust_rtt(Duration::from_millis(150));
        assert_eq!(base.rtt(), Duration::from_millis(100));
    }

    #[test]
    fn test_adjust_rtt_monotone_bounded() {
        // new RTT stays within [min(old, elapsed), max(old, elapsed)]
        let base = UpstreamBase::new(UpstreamOptions::default(), test_config());
        base.adjust_rtt(Duration::from_millis(80));
        for elapsed_ms in [10u64, 500, 3, 80, 1000] {
            let old = base.rtt();
            let elapsed = Duration::from_millis(elapsed_ms);
            base.adjust_rtt(elapsed);
            let new = base.rtt();
            assert!(new >= old.min(elapsed));
            assert!(new <= old.max(elapsed));
        }
    }

    #[test]
    fn test_frame_message() {
        let framed = frame_message(&[0xAB; 3]).unwrap();
        assert_eq!(framed, vec![0x00, 0x03, 0xAB, 0xAB, 0xAB]);
        assert!(frame_message(&vec![0; 70000]).is_err());
    }
}
