use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Host component of an upstream or bootstrap address. Either a literal IP
/// or a hostname that still needs bootstrap resolution.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        // Bracketed IPv6 literal, e.g. "[2606:4700::1111]".
        if let Some(inner) = s.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unterminated IPv6 literal: {}", s),
                )
            })?;
            let addr = inner.parse::<Ipv6Addr>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid IPv6 literal: {}", s),
                )
            })?;
            return Ok(Address::Ipv6(addr));
        }

        let mut dots = 0;
        let mut possible_ipv4 = true;
        let mut possible_ipv6 = true;
        let mut possible_hostname = true;
        for b in s.as_bytes().iter() {
            let c = *b;
            if c == b':' {
                possible_ipv4 = false;
                possible_hostname = false;
                break;
            } else if c == b'.' {
                possible_ipv6 = false;
                dots += 1;
                if dots > 3 {
                    // can only be a hostname.
                    break;
                }
            } else if (c >= b'A' && c <= b'F') || (c >= b'a' && c <= b'f') {
                possible_ipv4 = false;
            } else if c < b'0' || c > b'9' {
                possible_ipv4 = false;
                possible_ipv6 = false;
                break;
            }
        }

        if possible_ipv4 && dots == 3 {
            if let Ok(addr) = s.parse::<Ipv4Addr>() {
                return Ok(Address::Ipv4(addr));
            }
        }

        if possible_ipv6 {
            if let Ok(addr) = s.parse::<Ipv6Addr>() {
                return Ok(Address::Ipv6(addr));
            }
        }

        if possible_hostname && !s.is_empty() {
            return Ok(Address::Hostname(s.to_string()));
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to parse address: {}", s),
        ))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(ref hostname) => Some(hostname),
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(addr) => Some(IpAddr::V4(*addr)),
            Address::Ipv6(addr) => Some(IpAddr::V6(*addr)),
            Address::Hostname(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(addr) => write!(f, "{}", addr),
            Address::Ipv6(addr) => write!(f, "[{}]", addr),
            Address::Hostname(hostname) => f.write_str(hostname),
        }
    }
}

/// An address plus port. The hostname variant is resolved through the
/// bootstrapper before any socket is opened.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Location {
    address: Address,
    port: u16,
}

impl Location {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    /// Parse `host[:port]` with an optional default port. Accepts bare
    /// hostnames, IPv4 literals and bracketed IPv6 literals.
    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        let (address_str, port) = if s.starts_with('[') {
            match s.rfind("]:") {
                Some(i) => {
                    let port = s[i + 2..].parse::<u16>().map_err(|_| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("invalid port in: {}", s),
                        )
                    })?;
                    (&s[0..i + 1], Some(port))
                }
                None => (s, default_port),
            }
        } else {
            match s.rfind(':') {
                Some(i) => {
                    // The ':' could be from an unbracketed IPv6 address.
                    match s[i + 1..].parse::<u16>() {
                        Ok(port) if !s[0..i].contains(':') => (&s[0..i], Some(port)),
                        _ => (s, default_port),
                    }
                }
                None => (s, default_port),
            }
        };

        let address = Address::from(address_str)?;
        let port = port.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("no port in: {}", s))
        })?;

        Ok(Self { address, port })
    }

    pub fn from_ip_addr(ip: IpAddr, port: u16) -> Self {
        let address = match ip {
            IpAddr::V4(addr) => Address::Ipv4(addr),
            IpAddr::V6(addr) => Address::Ipv6(addr),
        };
        Self { address, port }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the socket address if the host is a literal IP.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
