//! Upstream factory: address parsing and assembly of the dependency graph
//! (bootstrapper, socket factory, transport variant).

use std::fmt;
use std::sync::Arc;

use log::debug;
use url::Url;

use crate::address::{Address, Location};
use crate::bootstrap::{BootstrapCache, Bootstrapper};
use crate::error::{InitError, UpstreamCreateError};
use crate::upstream::dnscrypt::DnscryptUpstream;
use crate::upstream::doh::DohUpstream;
use crate::upstream::doq::DoqUpstream;
use crate::upstream::dot::DotUpstream;
use crate::upstream::plain::PlainUpstream;
use crate::upstream::stamp::{ServerStamp, StampProtoType};
use crate::upstream::{Upstream, UpstreamFactoryConfig, UpstreamOptions};

const DEFAULT_PLAIN_PORT: u16 = 53;
const DEFAULT_DOT_PORT: u16 = 853;
const DEFAULT_DOQ_PORT: u16 = 853;
const DEFAULT_DOH_PORT: u16 = 443;

/// Parsed form of an upstream address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddress {
    Plain { location: Location },
    PlainTcp { location: Location },
    Dot { location: Location, server_name: String },
    Doh { location: Location, server_name: String, path: String },
    Doq { location: Location, server_name: String },
    Dnscrypt { stamp: ServerStamp },
}

impl UpstreamAddress {
    pub fn parse(address: &str) -> Result<Self, UpstreamCreateError> {
        if address.starts_with("sdns://") {
            return Self::parse_stamp(address);
        }
        if let Some(rest) = address.strip_prefix("tcp://") {
            let location = Location::from_str(rest, Some(DEFAULT_PLAIN_PORT))
                .map_err(|e| UpstreamCreateError::InvalidUrl(e.to_string()))?;
            return Ok(Self::PlainTcp { location });
        }
        if let Some(rest) = address.strip_prefix("tls://") {
            let location = Location::from_str(rest, Some(DEFAULT_DOT_PORT))
                .map_err(|e| UpstreamCreateError::InvalidUrl(e.to_string()))?;
            let server_name = server_name_of(&location);
            return Ok(Self::Dot {
                location,
                server_name,
            });
        }
        if let Some(rest) = address.strip_prefix("quic://") {
            let location = Location::from_str(rest, Some(DEFAULT_DOQ_PORT))
                .map_err(|e| UpstreamCreateError::InvalidUrl(e.to_string()))?;
            let server_name = server_name_of(&location);
            return Ok(Self::Doq {
                location,
                server_name,
            });
        }
        if address.starts_with("https://") {
            let url = Url::parse(address)
                .map_err(|e| UpstreamCreateError::InvalidUrl(e.to_string()))?;
            let host = url
                .host_str()
                .ok_or_else(|| UpstreamCreateError::InvalidUrl("missing host".to_string()))?;
            let port = url.port().unwrap_or(DEFAULT_DOH_PORT);
            let host_address = Address::from(host)
                .map_err(|e| UpstreamCreateError::InvalidUrl(e.to_string()))?;
            let location = Location::new(host_address, port);
            let server_name = server_name_of(&location);
            return Ok(Self::Doh {
                location,
                server_name,
                path: url.path().to_string(),
            });
        }
        if address.contains("://") {
            return Err(UpstreamCreateError::InvalidUrl(format!(
                "unsupported scheme: {}",
                address
            )));
        }

        let location = Location::from_str(address, Some(DEFAULT_PLAIN_PORT))
            .map_err(|e| UpstreamCreateError::InvalidUrl(e.to_string()))?;
        Ok(Self::Plain { location })
    }

    fn parse_stamp(address: &str) -> Result<Self, UpstreamCreateError> {
        let stamp = ServerStamp::parse(address)
            .map_err(|e| UpstreamCreateError::InvalidStamp(e.to_string()))?;
        match stamp.proto.expect("parse always sets the protocol") {
            StampProtoType::Plain => {
                let location = Location::from_str(&stamp.server_addr, Some(DEFAULT_PLAIN_PORT))
                    .map_err(|e| UpstreamCreateError::InvalidStamp(e.to_string()))?;
                Ok(Self::Plain { location })
            }
            StampProtoType::Dnscrypt => Ok(Self::Dnscrypt { stamp }),
            StampProtoType::Doh => {
                let host = if stamp.server_addr.is_empty() {
                    &stamp.provider_name
                } else {
                    &stamp.server_addr
                };
                let location = Location::from_str(host, Some(DEFAULT_DOH_PORT))
                    .map_err(|e| UpstreamCreateError::InvalidStamp(e.to_string()))?;
                Ok(Self::Doh {
                    location,
                    server_name: stamp.provider_name.clone(),
                    path: stamp.path.clone(),
                })
            }
            StampProtoType::Tls | StampProtoType::Doq => {
                let host = if stamp.server_addr.is_empty() {
                    &stamp.provider_name
                } else {
                    &stamp.server_addr
                };
                let location = Location::from_str(host, Some(DEFAULT_DOT_PORT))
                    .map_err(|e| UpstreamCreateError::InvalidStamp(e.to_string()))?;
                let server_name = stamp.provider_name.clone();
                if stamp.proto == Some(StampProtoType::Tls) {
                    Ok(Self::Dot {
                        location,
                        server_name,
                    })
                } else {
                    Ok(Self::Doq {
                        location,
                        server_name,
                    })
                }
            }
        }
    }

    /// The peer location, where one exists outside a stamp.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Plain { location }
            | Self::PlainTcp { location }
            | Self::Dot { location, .. }
            | Self::Doh { location, .. }
            | Self::Doq { location, .. } => Some(location),
            Self::Dnscrypt { .. } => None,
        }
    }
}

impl fmt::Display for UpstreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain { location } => write!(f, "{}", location),
            Self::PlainTcp { location } => write!(f, "tcp://{}", location),
            Self::Dot { location, .. } => write!(f, "tls://{}", location),
            Self::Doh { location, path, .. } => write!(f, "https://{}{}", location, path),
            Self::Doq { location, .. } => write!(f, "quic://{}", location),
            Self::Dnscrypt { stamp } => f.write_str(&stamp.encode()),
        }
    }
}

/// TLS server name for a peer: the hostname, or the bare IP literal.
fn server_name_of(location: &Location) -> String {
    match location.address() {
        Address::Hostname(hostname) => hostname.clone(),
        Address::Ipv4(addr) => addr.to_string(),
        Address::Ipv6(addr) => addr.to_string(),
    }
}

/// Produces ready-to-use upstreams. Outlives every upstream it creates.
pub struct UpstreamFactory {
    config: UpstreamFactoryConfig,
    bootstrap_cache: BootstrapCache,
}

impl UpstreamFactory {
    pub fn new(config: UpstreamFactoryConfig) -> Self {
        Self {
            config,
            bootstrap_cache: BootstrapCache::default(),
        }
    }

    pub fn config(&self) -> &UpstreamFactoryConfig {
        &self.config
    }

    /// Parse `options.address`, assemble the dependency graph and return an
    /// initialized upstream.
    pub async fn create_upstream(
        &self,
        options: UpstreamOptions,
    ) -> Result<Arc<dyn Upstream>, UpstreamCreateError> {
        let address = UpstreamAddress::parse(&options.address)?;
        debug!("[id={}] creating upstream for {}", options.id, address);

        let bootstrapper = match address.location() {
            Some(location) if location.address().is_hostname() => {
                Some(self.make_bootstrapper(&options, location).await?)
            }
            _ => None,
        };

        let mut upstream = self.build_variant(address, options, bootstrapper);
        upstream.init().await.map_err(UpstreamCreateError::InitFailed)?;
        Ok(Arc::from(upstream))
    }

    fn build_variant(
        &self,
        address: UpstreamAddress,
        options: UpstreamOptions,
        bootstrapper: Option<Arc<Bootstrapper>>,
    ) -> Box<dyn Upstream> {
        let config = self.config.clone();
        match address {
            UpstreamAddress::Plain { location } => Box::new(PlainUpstream::new(
                options,
                config,
                location,
                false,
                bootstrapper,
            )),
            UpstreamAddress::PlainTcp { location } => Box::new(PlainUpstream::new(
                options,
                config,
                location,
                true,
                bootstrapper,
            )),
            UpstreamAddress::Dot {
                location,
                server_name,
            } => Box::new(DotUpstream::new(
                options,
                config,
                location,
                server_name,
                bootstrapper,
            )),
            UpstreamAddress::Doh {
                location,
                server_name,
                path,
            } => Box::new(DohUpstream::new(
                options,
                config,
                location,
                server_name,
                path,
                bootstrapper,
            )),
            UpstreamAddress::Doq {
                location,
                server_name,
            } => Box::new(DoqUpstream::new(
                options,
                config,
                location,
                server_name,
                bootstrapper,
            )),
            UpstreamAddress::Dnscrypt { stamp } => {
                Box::new(DnscryptUpstream::new(options, config, stamp))
            }
        }
    }

    /// Build the bootstrapper for a hostname upstream. Bootstrap servers
    /// themselves must be addressed by literal IPs.
    async fn make_bootstrapper(
        &self,
        options: &UpstreamOptions,
        location: &Location,
    ) -> Result<Arc<Bootstrapper>, UpstreamCreateError> {
        if options.bootstrap.is_empty() && options.resolved_server_ip.is_none() {
            return Err(UpstreamCreateError::InitFailed(InitError::EmptyBootstrap));
        }

        let mut servers = Vec::with_capacity(options.bootstrap.len());
        for bootstrap_url in &options.bootstrap {
            let address = UpstreamAddress::parse(bootstrap_url)?;
            match address.location() {
                Some(location) if !location.address().is_hostname() => {}
                _ => {
                    return Err(UpstreamCreateError::InvalidUrl(format!(
                        "bootstrap host must be a literal IP: {}",
                        bootstrap_url
                    )));
                }
            }
            let bootstrap_options = UpstreamOptions {
                address: bootstrap_url.clone(),
                bootstrap: Vec::new(),
                timeout: options.timeout,
                resolved_server_ip: None,
                id: options.id,
                outbound_interface: options.outbound_interface.clone(),
                ignore_proxy_settings: options.ignore_proxy_settings,
            };
            let mut server = self.build_variant(address, bootstrap_options, None);
            server
                .init()
                .await
                .map_err(UpstreamCreateError::InitFailed)?;
            servers.push(Arc::from(server));
        }

        let hostname = location
            .address()
            .hostname()
            .expect("caller checked for a hostname")
            .to_string();
        Ok(Arc::new(Bootstrapper::new(
            hostname,
            location.port(),
            servers,
            options.resolved_server_ip,
            self.config.ipv6_available,
            self.bootstrap_cache.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_factory::{SocketFactory, SocketFactoryParameters};
    use crate::upstream::plain::test_support::{make_request, make_response};
    use crate::upstream::stamp::props;
    use hickory_proto::op::Message;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn make_factory() -> UpstreamFactory {
        UpstreamFactory::new(UpstreamFactoryConfig {
            socket_factory: Arc::new(SocketFactory::new(SocketFactoryParameters::default())),
            ipv6_available: true,
        })
    }

    #[test]
    fn test_parse_format_round_trip() {
        let dnscrypt_stamp = ServerStamp {
            proto: Some(StampProtoType::Dnscrypt),
            properties: props::DNSSEC,
            server_addr: "192.0.2.8:8443".to_string(),
            server_pk: vec![0xAB; 32],
            provider_name: "2.dnscrypt-cert.example.test".to_string(),
            ..Default::default()
        }
        .encode();

        for address in [
            "8.8.8.8:53",
            "tcp://8.8.8.8:53",
            "tls://1.1.1.1:853",
            "tls://dns.example.test:853",
            "https://dns.example.test:443/dns-query",
            "quic://94.140.14.14:853",
            "[2606:4700::1111]:53",
            dnscrypt_stamp.as_str(),
        ] {
            let parsed = UpstreamAddress::parse(address).unwrap();
            let reparsed = UpstreamAddress::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "round trip for {}", address);
        }
    }

    #[test]
    fn test_default_ports() {
        for (address, port) in [
            ("9.9.9.9", 53),
            ("tcp://9.9.9.9", 53),
            ("tls://dns.example.test", 853),
            ("quic://dns.example.test", 853),
            ("https://dns.example.test/dns-query", 443),
        ] {
            let parsed = UpstreamAddress::parse(address).unwrap();
            assert_eq!(parsed.location().unwrap().port(), port, "{}", address);
        }
    }

    #[test]
    fn test_doh_path_preserved() {
        match UpstreamAddress::parse("https://dns.example.test/custom/path").unwrap() {
            UpstreamAddress::Doh { path, .. } => assert_eq!(path, "/custom/path"),
            other => panic!("expected Doh, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        assert!(matches!(
            UpstreamAddress::parse("ftp://8.8.8.8"),
            Err(UpstreamCreateError::InvalidUrl(_))
        ));
        assert!(matches!(
            UpstreamAddress::parse("sdns://not-base64!!!"),
            Err(UpstreamCreateError::InvalidStamp(_))
        ));
    }

    #[tokio::test]
    async fn test_hostname_without_bootstrap_rejected() {
        let factory = make_factory();
        let result = factory
            .create_upstream(UpstreamOptions {
                address: "tls://dns.example.test".to_string(),
                ..Default::default()
            })
            .await;
        assert!(matches!(
            result,
            Err(UpstreamCreateError::InitFailed(InitError::EmptyBootstrap))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_url_with_hostname_rejected() {
        let factory = make_factory();
        let result = factory
            .create_upstream(UpstreamOptions {
                address: "tls://dns.example.test".to_string(),
                bootstrap: vec!["resolver.example.test:53".to_string()],
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(UpstreamCreateError::InvalidUrl(_))));
    }

    async fn spawn_answering_udp_server(answer: std::net::Ipv4Addr) -> SocketAddr {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let (n, from) = match server.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                let request = Message::from_vec(&buf[..n]).unwrap();
                let response = make_response(&request, answer, false);
                let _ = server.send_to(&response.to_vec().unwrap(), from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_create_plain_and_exchange() {
        let addr = spawn_answering_udp_server("192.0.2.10".parse().unwrap()).await;
        let factory = make_factory();

        let upstream = factory
            .create_upstream(UpstreamOptions {
                address: addr.to_string(),
                timeout: Duration::from_secs(5),
                ..Default::default()
            })
            .await
            .unwrap();

        let response = upstream
            .exchange(&make_request(0x7777, "example.test."))
            .await
            .unwrap();
        assert_eq!(response.id(), 0x7777);
    }

    #[tokio::test]
    async fn test_hostname_upstream_resolves_through_bootstrap() {
        // The bootstrap server answers the A query for the upstream's
        // hostname with 127.0.0.1; the "real" upstream then answers the DNS
        // query on the bootstrapped port.
        let answer_addr = spawn_answering_udp_server("192.0.2.20".parse().unwrap()).await;
        let bootstrap_addr = spawn_answering_udp_server("127.0.0.1".parse().unwrap()).await;
        let factory = make_factory();

        let upstream = factory
            .create_upstream(UpstreamOptions {
                address: format!("upstream.example.test:{}", answer_addr.port()),
                bootstrap: vec![bootstrap_addr.to_string()],
                timeout: Duration::from_secs(5),
                ..Default::default()
            })
            .await
            .unwrap();

        let response = upstream
            .exchange(&make_request(0x2020, "query.example.test."))
            .await
            .unwrap();
        assert_eq!(response.id(), 0x2020);
    }

    #[tokio::test]
    async fn test_resolved_server_ip_bypasses_bootstrap() {
        let answer_addr = spawn_answering_udp_server("192.0.2.30".parse().unwrap()).await;
        let factory = make_factory();

        let upstream = factory
            .create_upstream(UpstreamOptions {
                address: format!("upstream.example.test:{}", answer_addr.port()),
                resolved_server_ip: Some(answer_addr.ip()),
                timeout: Duration::from_secs(5),
                ..Default::default()
            })
            .await
            .unwrap();

        let response = upstream
            .exchange(&make_request(0x3030, "query.example.test."))
            .await
            .unwrap();
        assert_eq!(response.id(), 0x3030);
    }
}
