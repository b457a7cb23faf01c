//! DNS64 prefix discovery (RFC 7050) and NAT64 address synthesis
//! (RFC 6052).

use std::fmt;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use log::debug;

use crate::error::DnsError;
use crate::upstream::Upstream;

/// Allowed Pref64 lengths in bytes (32, 40, 48, 56, 64 and 96 bits).
const ALLOWED_PREFIX_LENGTHS: [usize; 6] = [4, 5, 6, 7, 8, 12];

/// The Well-Known IPv4 addresses of `ipv4only.arpa.` (RFC 7050).
const WELL_KNOWN_IPV4: [[u8; 4]; 2] = [[192, 0, 0, 170], [192, 0, 0, 171]];

const IPV4_ONLY_HOST: &str = "ipv4only.arpa.";

#[derive(Debug)]
pub enum Dns64Error {
    /// The discovery query failed.
    QueryFailed(DnsError),
    /// The response carried no AAAA records.
    NoAaaaRecords,
    /// No AAAA record embedded a Well-Known IPv4 address at a legal offset.
    NoPrefixFound,
    /// Synthesis was asked for a prefix of illegal length.
    InvalidPrefixLength(usize),
}

impl fmt::Display for Dns64Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueryFailed(e) => write!(f, "discovery query failed: {}", e),
            Self::NoAaaaRecords => f.write_str("no AAAA records in discovery response"),
            Self::NoPrefixFound => f.write_str("no Pref64 found in discovery response"),
            Self::InvalidPrefixLength(len) => write!(f, "invalid Pref64 length: {} bytes", len),
        }
    }
}

impl std::error::Error for Dns64Error {}

/// Discover the Pref64::/n prefixes of the network by querying `upstream`
/// for `AAAA ipv4only.arpa.`. Duplicates are removed, order of first
/// appearance is kept.
pub async fn discover_prefixes(upstream: &Arc<dyn Upstream>) -> Result<Vec<Vec<u8>>, Dns64Error> {
    let mut request = Message::new();
    request
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(
            Name::from_utf8(IPV4_ONLY_HOST).expect("well-known name is valid"),
            RecordType::AAAA,
        ));

    let response = upstream
        .exchange(&request)
        .await
        .map_err(Dns64Error::QueryFailed)?;

    let mut saw_aaaa = false;
    let mut prefixes: Vec<Vec<u8>> = Vec::new();
    for record in response.answers() {
        let addr = match record.data() {
            Some(RData::AAAA(aaaa)) => aaaa.0.octets(),
            _ => continue,
        };
        saw_aaaa = true;
        if let Some(prefix) = extract_prefix(&addr) {
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
    }

    if !saw_aaaa {
        return Err(Dns64Error::NoAaaaRecords);
    }
    if prefixes.is_empty() {
        return Err(Dns64Error::NoPrefixFound);
    }
    debug!("discovered {} Pref64 prefix(es)", prefixes.len());
    Ok(prefixes)
}

/// Locate a Well-Known IPv4 address inside a synthesized AAAA answer and
/// return the Pref64 preceding it.
fn extract_prefix(addr: &[u8; 16]) -> Option<Vec<u8>> {
    for &len in ALLOWED_PREFIX_LENGTHS.iter() {
        let mut embedded = [0u8; 4];
        let mut src = len;
        for octet in embedded.iter_mut() {
            // Octet 8 is the reserved "u" byte and never carries data.
            if src == 8 {
                src += 1;
            }
            if src >= 16 {
                return None;
            }
            *octet = addr[src];
            src += 1;
        }
        if WELL_KNOWN_IPV4.contains(&embedded) {
            return Some(addr[..len].to_vec());
        }
    }
    None
}

/// Embed `ipv4` into `pref64` per RFC 6052. The prefix length must be one
/// of {4, 5, 6, 7, 8, 12} bytes; byte 8 of the result is always zero.
pub fn synthesize_ipv4_embedded_ipv6_address(
    pref64: &[u8],
    ipv4: &[u8; 4],
) -> Result<[u8; 16], Dns64Error> {
    if !ALLOWED_PREFIX_LENGTHS.contains(&pref64.len()) {
        return Err(Dns64Error::InvalidPrefixLength(pref64.len()));
    }

    let mut result = [0u8; 16];
    result[..pref64.len()].copy_from_slice(pref64);
    result[8] = 0;

    let mut dst = pref64.len();
    for &octet in ipv4.iter() {
        if dst == 8 {
            dst += 1;
        }
        result[dst] = octet;
        dst += 1;
    }
    Ok(result)
}
