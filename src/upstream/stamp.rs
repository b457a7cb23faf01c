//! DNS stamps (`sdns://`), per the DNSCrypt stamp specification.
//!
//! A stamp is base64url (no padding) over a small binary layout: one
//! protocol byte, 8 bytes of informal properties, then length-prefixed
//! fields that vary by protocol. `parse` and `encode` are exact inverses.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

const STAMP_SCHEME: &str = "sdns://";

/// Informal server properties (bit flags in the stamp).
pub mod props {
    pub const DNSSEC: u64 = 0x01;
    pub const NO_LOGS: u64 = 0x02;
    pub const NO_FILTER: u64 = 0x04;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampProtoType {
    Plain,
    Dnscrypt,
    Doh,
    Tls,
    Doq,
}

impl StampProtoType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Plain),
            0x01 => Some(Self::Dnscrypt),
            0x02 => Some(Self::Doh),
            0x03 => Some(Self::Tls),
            0x04 => Some(Self::Doq),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Plain => 0x00,
            Self::Dnscrypt => 0x01,
            Self::Doh => 0x02,
            Self::Tls => 0x03,
            Self::Doq => 0x04,
        }
    }
}

#[derive(Debug)]
pub enum StampError {
    MissingScheme,
    BadEncoding,
    Truncated,
    UnknownProtocol(u8),
    BadField(&'static str),
}

impl fmt::Display for StampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScheme => f.write_str("missing sdns:// scheme"),
            Self::BadEncoding => f.write_str("invalid base64url payload"),
            Self::Truncated => f.write_str("stamp is truncated"),
            Self::UnknownProtocol(b) => write!(f, "unknown protocol byte: {:#04x}", b),
            Self::BadField(field) => write!(f, "invalid field: {}", field),
        }
    }
}

impl std::error::Error for StampError {}

/// A parsed server stamp. Fields not applicable to the protocol are empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerStamp {
    pub proto: Option<StampProtoType>,
    pub properties: u64,
    /// `ip[:port]`; may be empty for DoH stamps that rely on the hostname.
    pub server_addr: String,
    /// DNSCrypt provider public key (Ed25519, 32 bytes).
    pub server_pk: Vec<u8>,
    /// Certificate hashes for DoH/DoT/DoQ.
    pub hashes: Vec<Vec<u8>>,
    /// DNSCrypt provider name, or the TLS hostname for DoH/DoT/DoQ.
    pub provider_name: String,
    /// DoH path.
    pub path: String,
}

impl ServerStamp {
    pub fn parse(input: &str) -> Result<Self, StampError> {
        let encoded = input
            .strip_prefix(STAMP_SCHEME)
            .ok_or(StampError::MissingScheme)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| StampError::BadEncoding)?;
        let mut reader = Reader::new(&bytes);

        let proto = StampProtoType::from_byte(reader.read_u8()?)
            .ok_or_else(|| StampError::UnknownProtocol(bytes[0]))?;
        let properties = u64::from_le_bytes(
            reader
                .read_bytes(8)?
                .try_into()
                .expect("read_bytes returned 8 bytes"),
        );

        let mut stamp = ServerStamp {
            proto: Some(proto),
            properties,
            ..Default::default()
        };

        match proto {
            StampProtoType::Plain => {
                stamp.server_addr = reader.read_string("server address")?;
            }
            StampProtoType::Dnscrypt => {
                stamp.server_addr = reader.read_string("server address")?;
                stamp.server_pk = reader.read_lp()?.to_vec();
                if stamp.server_pk.len() != 32 {
                    return Err(StampError::BadField("provider public key"));
                }
                stamp.provider_name = reader.read_string("provider name")?;
            }
            StampProtoType::Doh => {
                stamp.server_addr = reader.read_string("server address")?;
                stamp.hashes = reader.read_vlp()?;
                stamp.provider_name = reader.read_string("hostname")?;
                stamp.path = reader.read_string("path")?;
            }
            StampProtoType::Tls | StampProtoType::Doq => {
                stamp.server_addr = reader.read_string("server address")?;
                stamp.hashes = reader.read_vlp()?;
                stamp.provider_name = reader.read_string("hostname")?;
            }
        }
        Ok(stamp)
    }

    pub fn encode(&self) -> String {
        let proto = self.proto.expect("stamp protocol is set");
        let mut bytes = vec![proto.to_byte()];
        bytes.extend_from_slice(&self.properties.to_le_bytes());

        match proto {
            StampProtoType::Plain => {
                push_lp(&mut bytes, self.server_addr.as_bytes());
            }
            StampProtoType::Dnscrypt => {
                push_lp(&mut bytes, self.server_addr.as_bytes());
                push_lp(&mut bytes, &self.server_pk);
                push_lp(&mut bytes, self.provider_name.as_bytes());
            }
            StampProtoType::Doh => {
                push_lp(&mut bytes, self.server_addr.as_bytes());
                push_vlp(&mut bytes, &self.hashes);
                push_lp(&mut bytes, self.provider_name.as_bytes());
                push_lp(&mut bytes, self.path.as_bytes());
            }
            StampProtoType::Tls | StampProtoType::Doq => {
                push_lp(&mut bytes, self.server_addr.as_bytes());
                push_vlp(&mut bytes, &self.hashes);
                push_lp(&mut bytes, self.provider_name.as_bytes());
            }
        }

        format!("{}{}", STAMP_SCHEME, URL_SAFE_NO_PAD.encode(bytes))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, StampError> {
        let b = *self.bytes.get(self.pos).ok_or(StampError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], StampError> {
        let end = self.pos.checked_add(len).ok_or(StampError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(StampError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    /// One length-prefixed field.
    fn read_lp(&mut self) -> Result<&'a [u8], StampError> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    fn read_string(&mut self, field: &'static str) -> Result<String, StampError> {
        String::from_utf8(self.read_lp()?.to_vec()).map_err(|_| StampError::BadField(field))
    }

    /// A set of length-prefixed fields; every length byte except the last
    /// has its high bit set.
    fn read_vlp(&mut self) -> Result<Vec<Vec<u8>>, StampError> {
        let mut items = Vec::new();
        loop {
            let len = self.read_u8()?;
            let more = len & 0x80 != 0;
            let item = self.read_bytes((len & 0x7f) as usize)?;
            if !item.is_empty() {
                items.push(item.to_vec());
            }
            if !more {
                return Ok(items);
            }
        }
    }
}

fn push_lp(bytes: &mut Vec<u8>, field: &[u8]) {
    debug_assert!(field.len() <= 0x7f);
    bytes.push(field.len() as u8);
    bytes.extend_from_slice(field);
}

fn push_vlp(bytes: &mut Vec<u8>, items: &[Vec<u8>]) {
    if items.is_empty() {
        bytes.push(0x00);
        return;
    }
    for (i, item) in items.iter().enumerate() {
        let last = i == items.len() - 1;
        let mut len = item.len() as u8;
        if !last {
            len |= 0x80;
        }
        bytes.push(len);
        bytes.extend_from_slice(item);
    }
}
