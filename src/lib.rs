//! updns - a client-side DNS resolver library.
//!
//! Performs DNS exchanges against upstream servers over a variety of
//! transports, optionally through an outbound proxy, with DNS64 prefix
//! discovery and address synthesis for IPv6-only networks.
//!
//! # Features
//!
//! - **Multi-transport upstreams**: plain UDP/TCP, DNS-over-TLS,
//!   DNS-over-HTTPS, DNS-over-QUIC and DNSCrypt (via `sdns://` stamps)
//! - **Outbound proxy support**: sockets can be tunneled through a proxy,
//!   with transparent fallback to a direct connection on proxy failure
//! - **Bootstrap resolution**: hostname upstreams are resolved through a
//!   dedicated set of bootstrap servers, with TTL-based caching
//! - **TLS session reuse**: a shared session cache enables resumption
//!   across reconnects (and 0-RTT for DNS-over-QUIC)
//! - **DNS64**: Pref64 discovery per RFC 7050 and IPv4-embedded IPv6
//!   address synthesis per RFC 6052
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use updns::socket_factory::{SocketFactory, SocketFactoryParameters};
//! use updns::upstream::{UpstreamFactory, UpstreamFactoryConfig, UpstreamOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = UpstreamFactory::new(UpstreamFactoryConfig {
//!     socket_factory: Arc::new(SocketFactory::new(SocketFactoryParameters::default())),
//!     ipv6_available: true,
//! });
//! let upstream = factory
//!     .create_upstream(UpstreamOptions {
//!         address: "tls://1.1.1.1".to_string(),
//!         ..Default::default()
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod bootstrap;
pub mod direct_proxy;
pub mod dns64;
pub mod error;
pub mod outbound_proxy;
pub mod proxied_socket;
mod rustls_util;
pub mod socket;
pub mod socket_factory;
mod socket_stream;
mod socket_util;
mod tcp_socket;
pub mod tls_session_cache;
pub mod tls_socket;
mod udp_socket;
pub mod upstream;

pub use error::{DnsError, InitError, SocketError, UpstreamCreateError};
pub use rustls_util::DisabledVerifier;
