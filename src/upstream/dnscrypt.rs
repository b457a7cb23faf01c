//! DNSCrypt upstream (v2 protocol, configured through `sdns://` stamps).
//!
//! A TXT query to the stamp's provider name fetches the resolver's signed
//! certificates; the signature is checked against the stamp's provider
//! public key, and the best certificate (valid dates, highest serial)
//! selects the cipher and the resolver's short-term key. Every exchange is
//! then sealed with the shared secret negotiated between a per-upstream
//! client key and that resolver key, padded to a 64-byte boundary.
//! Responses echo the client nonce half. UDP first, with a TCP retry on
//! truncation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_lc_rs::signature::{UnparsedPublicKey, ED25519};
use crypto_box::aead::{Aead, Nonce, OsRng};
use crypto_box::{ChaChaBox, PublicKey, SalsaBox, SecretKey};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use log::debug;
use tokio::io::AsyncReadExt;

use crate::address::Location;
use crate::error::{DnsError, ExchangeResult, InitError};
use crate::socket::TransportProtocol;
use crate::socket_stream::connect_stream;
use crate::upstream::stamp::ServerStamp;
use crate::upstream::{
    frame_message, parse_response, Upstream, UpstreamBase, UpstreamFactoryConfig, UpstreamOptions,
};

const CERT_MAGIC: [u8; 4] = *b"DNSC";
const RESOLVER_MAGIC: [u8; 8] = *b"r6fnvWj8";
const CLIENT_NONCE_SIZE: usize = 12;
const NONCE_SIZE: usize = 24;
const CLIENT_MAGIC_SIZE: usize = 8;
const PUBLIC_KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
/// Encrypted client queries are padded to a multiple of this.
const PAD_BLOCK_SIZE: usize = 64;
/// Minimum padded client query size.
const MIN_PADDED_QUERY_SIZE: usize = 256;
/// Certificate layout: magic(4) es(2) minor(2) sig(64) pk(32) client-magic(8)
/// serial(4) ts-start(4) ts-end(4).
const CERT_MIN_SIZE: usize = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EsVersion {
    XSalsa20Poly1305,
    XChaCha20Poly1305,
}

impl EsVersion {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(Self::XSalsa20Poly1305),
            0x0002 => Some(Self::XChaCha20Poly1305),
            _ => None,
        }
    }
}

/// A verified resolver certificate.
#[derive(Debug, Clone)]
struct ResolverCertificate {
    es_version: EsVersion,
    resolver_pk: [u8; PUBLIC_KEY_SIZE],
    client_magic: [u8; CLIENT_MAGIC_SIZE],
    serial: u32,
    ts_start: u32,
    ts_end: u32,
}

impl ResolverCertificate {
    /// Parse one TXT payload and verify its Ed25519 signature against the
    /// provider key from the stamp.
    fn parse_and_verify(bytes: &[u8], provider_pk: &[u8]) -> Result<Self, DnsError> {
        if bytes.len() < CERT_MIN_SIZE {
            return Err(DnsError::ProtocolViolation("certificate too short".to_string()));
        }
        if bytes[0..4] != CERT_MAGIC {
            return Err(DnsError::ProtocolViolation("bad certificate magic".to_string()));
        }
        let es_version = EsVersion::from_u16(u16::from_be_bytes([bytes[4], bytes[5]]))
            .ok_or_else(|| DnsError::ProtocolViolation("unsupported es-version".to_string()))?;

        let signature = &bytes[8..72];
        let signed = &bytes[72..];
        UnparsedPublicKey::new(&ED25519, provider_pk)
            .verify(signed, signature)
            .map_err(|_| DnsError::ProtocolViolation("bad certificate signature".to_string()))?;

        let mut resolver_pk = [0u8; PUBLIC_KEY_SIZE];
        resolver_pk.copy_from_slice(&bytes[72..104]);
        let mut client_magic = [0u8; CLIENT_MAGIC_SIZE];
        client_magic.copy_from_slice(&bytes[104..112]);

        Ok(Self {
            es_version,
            resolver_pk,
            client_magic,
            serial: u32::from_be_bytes([bytes[112], bytes[113], bytes[114], bytes[115]]),
            ts_start: u32::from_be_bytes([bytes[116], bytes[117], bytes[118], bytes[119]]),
            ts_end: u32::from_be_bytes([bytes[120], bytes[121], bytes[122], bytes[123]]),
        })
    }

    fn is_valid_at(&self, now: u32) -> bool {
        self.ts_start <= now && now <= self.ts_end
    }
}

enum CipherBox {
    Salsa(SalsaBox),
    Chacha(ChaChaBox),
}

impl CipherBox {
    fn new(version: EsVersion, resolver_pk: &[u8; PUBLIC_KEY_SIZE], client_sk: &SecretKey) -> Self {
        let resolver_pk = PublicKey::from(*resolver_pk);
        match version {
            EsVersion::XSalsa20Poly1305 => Self::Salsa(SalsaBox::new(&resolver_pk, client_sk)),
            EsVersion::XChaCha20Poly1305 => Self::Chacha(ChaChaBox::new(&resolver_pk, client_sk)),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, DnsError> {
        match self {
            Self::Salsa(b) => b.encrypt(Nonce::<SalsaBox>::from_slice(nonce), plaintext),
            Self::Chacha(b) => b.encrypt(Nonce::<ChaChaBox>::from_slice(nonce), plaintext),
        }
        .map_err(|_| DnsError::ProtocolViolation("encryption failed".to_string()))
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, DnsError> {
        match self {
            Self::Salsa(b) => b.decrypt(Nonce::<SalsaBox>::from_slice(nonce), ciphertext),
            Self::Chacha(b) => b.decrypt(Nonce::<ChaChaBox>::from_slice(nonce), ciphertext),
        }
        .map_err(|_| DnsError::ProtocolViolation("decryption failed".to_string()))
    }
}

/// The state negotiated from the best certificate.
struct NegotiatedState {
    client_magic: [u8; CLIENT_MAGIC_SIZE],
    client_pk: [u8; PUBLIC_KEY_SIZE],
    cipher: CipherBox,
}

/// ISO/IEC 7816-4 style padding: 0x80 then zeros, to a 64-byte boundary
/// with a 256-byte client minimum.
fn pad_query(payload: &[u8]) -> Vec<u8> {
    let unpadded = payload.len() + 1;
    let target = unpadded
        .div_ceil(PAD_BLOCK_SIZE)
        .max(MIN_PADDED_QUERY_SIZE / PAD_BLOCK_SIZE)
        * PAD_BLOCK_SIZE;
    let mut padded = Vec::with_capacity(target);
    padded.extend_from_slice(payload);
    padded.push(0x80);
    padded.resize(target, 0);
    padded
}

fn unpad_message(mut padded: Vec<u8>) -> Result<Vec<u8>, DnsError> {
    loop {
        match padded.pop() {
            Some(0) => continue,
            Some(0x80) => return Ok(padded),
            _ => {
                return Err(DnsError::ProtocolViolation(
                    "bad response padding".to_string(),
                ))
            }
        }
    }
}

fn encrypt_query(
    state: &NegotiatedState,
    payload: &[u8],
) -> Result<(Vec<u8>, [u8; CLIENT_NONCE_SIZE]), DnsError> {
    let client_nonce: [u8; CLIENT_NONCE_SIZE] = rand::random();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..CLIENT_NONCE_SIZE].copy_from_slice(&client_nonce);

    let sealed = state.cipher.seal(&nonce, &pad_query(payload))?;

    let mut wire =
        Vec::with_capacity(CLIENT_MAGIC_SIZE + PUBLIC_KEY_SIZE + CLIENT_NONCE_SIZE + sealed.len());
    wire.extend_from_slice(&state.client_magic);
    wire.extend_from_slice(&state.client_pk);
    wire.extend_from_slice(&client_nonce);
    wire.extend_from_slice(&sealed);
    Ok((wire, client_nonce))
}

fn decrypt_response(
    state: &NegotiatedState,
    client_nonce: &[u8; CLIENT_NONCE_SIZE],
    wire: &[u8],
) -> Result<Vec<u8>, DnsError> {
    if wire.len() < RESOLVER_MAGIC.len() + NONCE_SIZE + TAG_SIZE {
        return Err(DnsError::ProtocolViolation("short response".to_string()));
    }
    if wire[..RESOLVER_MAGIC.len()] != RESOLVER_MAGIC {
        return Err(DnsError::ProtocolViolation("bad resolver magic".to_string()));
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&wire[RESOLVER_MAGIC.len()..RESOLVER_MAGIC.len() + NONCE_SIZE]);
    if nonce[..CLIENT_NONCE_SIZE] != client_nonce[..] {
        return Err(DnsError::ProtocolViolation("nonce mismatch".to_string()));
    }
    let plaintext = state
        .cipher
        .open(&nonce, &wire[RESOLVER_MAGIC.len() + NONCE_SIZE..])?;
    unpad_message(plaintext)
}

pub struct DnscryptUpstream {
    base: UpstreamBase,
    stamp: ServerStamp,
    server_addr: Option<SocketAddr>,
    state: tokio::sync::Mutex<Option<Arc<NegotiatedState>>>,
}

impl DnscryptUpstream {
    pub(crate) fn new(
        options: UpstreamOptions,
        config: UpstreamFactoryConfig,
        stamp: ServerStamp,
    ) -> Self {
        Self {
            base: UpstreamBase::new(options, config),
            stamp,
            server_addr: None,
            state: tokio::sync::Mutex::new(None),
        }
    }

    fn server_addr(&self) -> Result<SocketAddr, DnsError> {
        self.server_addr
            .ok_or_else(|| DnsError::InvalidArgument("upstream not initialized".to_string()))
    }

    /// Fetch, verify and select the resolver certificate, then derive the
    /// shared secret. Runs once and is reused by subsequent exchanges.
    async fn ensure_state(&self) -> Result<Arc<NegotiatedState>, DnsError> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }

        let certs = self.fetch_certificates().await?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let best = certs
            .into_iter()
            .filter(|cert| cert.is_valid_at(now))
            .max_by_key(|cert| cert.serial)
            .ok_or_else(|| {
                DnsError::ProtocolViolation("no valid DNSCrypt certificate".to_string())
            })?;
        debug!(
            "[id={}] selected DNSCrypt certificate serial {}",
            self.base.options.id, best.serial
        );

        let client_sk = SecretKey::generate(&mut OsRng);
        let state = Arc::new(NegotiatedState {
            client_magic: best.client_magic,
            client_pk: *client_sk.public_key().as_bytes(),
            cipher: CipherBox::new(best.es_version, &best.resolver_pk, &client_sk),
        });
        *guard = Some(state.clone());
        Ok(state)
    }

    async fn fetch_certificates(&self) -> Result<Vec<ResolverCertificate>, DnsError> {
        let provider = Name::from_utf8(&self.stamp.provider_name)
            .map_err(|_| DnsError::InvalidArgument("invalid provider name".to_string()))?;
        let mut request = Message::new();
        request
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(provider, RecordType::TXT));
        let payload = request.to_vec()?;

        let peer = self.server_addr()?;
        let socket = self.base.make_socket(TransportProtocol::Udp);
        let mut stream = connect_stream(socket, peer, Some(self.base.options.timeout)).await?;
        stream.sender().send(&payload)?;

        let response = loop {
            let datagram = stream.recv_message().await?;
            match parse_response(&datagram) {
                Ok(response) if response.id() == request.id() => break response,
                _ => continue,
            }
        };

        let mut certs = Vec::new();
        for record in response.answers() {
            let txt = match record.data() {
                Some(RData::TXT(txt)) => txt,
                _ => continue,
            };
            let bytes: Vec<u8> = txt
                .txt_data()
                .iter()
                .flat_map(|segment| segment.iter().copied())
                .collect();
            match ResolverCertificate::parse_and_verify(&bytes, &self.stamp.server_pk) {
                Ok(cert) => certs.push(cert),
                Err(e) => debug!(
                    "[id={}] skipping certificate: {}",
                    self.base.options.id, e
                ),
            }
        }
        if certs.is_empty() {
            return Err(DnsError::ProtocolViolation(
                "no usable DNSCrypt certificate".to_string(),
            ));
        }
        Ok(certs)
    }

    async fn exchange_udp(
        &self,
        state: &NegotiatedState,
        payload: &[u8],
    ) -> Result<Vec<u8>, DnsError> {
        let (wire, client_nonce) = encrypt_query(state, payload)?;
        let peer = self.server_addr()?;
        let socket = self.base.make_socket(TransportProtocol::Udp);
        let mut stream = connect_stream(socket, peer, Some(self.base.options.timeout)).await?;
        stream.sender().send(&wire)?;

        loop {
            let datagram = stream.recv_message().await?;
            match decrypt_response(state, &client_nonce, &datagram) {
                Ok(plaintext) => return Ok(plaintext),
                // Unrelated or corrupt datagram; keep waiting.
                Err(_) => continue,
            }
        }
    }

    async fn exchange_tcp(
        &self,
        state: &NegotiatedState,
        payload: &[u8],
    ) -> Result<Vec<u8>, DnsError> {
        let (wire, client_nonce) = encrypt_query(state, payload)?;
        let peer = self.server_addr()?;
        let socket = self.base.make_socket(TransportProtocol::Tcp);
        let mut stream = connect_stream(socket, peer, Some(self.base.options.timeout)).await?;
        stream.sender().send(&frame_message(&wire)?)?;

        let mut length = [0u8; 2];
        stream.read_exact(&mut length).await?;
        let mut body = vec![0u8; u16::from_be_bytes(length) as usize];
        stream.read_exact(&mut body).await?;
        decrypt_response(state, &client_nonce, &body)
    }

    async fn exchange_inner(&self, request: &Message) -> ExchangeResult {
        let state = self.ensure_state().await?;
        // The whole message is encrypted; the id never appears on the wire.
        let payload = request.to_vec()?;

        let plaintext = self.exchange_udp(&state, &payload).await?;
        let response = parse_response(&plaintext)?;
        if response.id() != request.id() {
            return Err(DnsError::ProtocolViolation(
                "transaction id mismatch".to_string(),
            ));
        }
        if !response.truncated() {
            return Ok(response);
        }

        debug!(
            "[id={}] truncated DNSCrypt response, retrying over TCP",
            self.base.options.id
        );
        let plaintext = self.exchange_tcp(&state, &payload).await?;
        let response = parse_response(&plaintext)?;
        if response.truncated() {
            return Err(DnsError::ProtocolViolation(
                "response truncated after TCP retry".to_string(),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl Upstream for DnscryptUpstream {
    async fn init(&mut self) -> Result<(), InitError> {
        if self.stamp.provider_name.is_empty() {
            return Err(InitError::EmptyServerName);
        }
        let location = Location::from_str(&self.stamp.server_addr, Some(443))
            .map_err(|_| InitError::InvalidAddress)?;
        self.server_addr = Some(location.to_socket_addr().ok_or(InitError::InvalidAddress)?);
        Ok(())
    }

    async fn exchange(&self, request: &Message) -> ExchangeResult {
        self.base.run_exchange(self.exchange_inner(request)).await
    }

    fn options(&self) -> &UpstreamOptions {
        &self.base.options
    }

    fn rtt(&self) -> std::time::Duration {
        self.base.rtt()
    }

    fn adjust_rtt(&self, elapsed: std::time::Duration) {
        self.base.adjust_rtt(elapsed);
    }
}
