//! DNS-over-QUIC upstream (RFC 9250).
//!
//! One QUIC connection per upstream, one bidirectional stream per
//! exchange, messages framed with a 2-byte big-endian length. The request
//! id is zeroed on the wire. When the session ticket cache holds a ticket
//! for the server, the connection attempts 0-RTT; DNS queries are safe to
//! replay, which is what RFC 9250 requires of early data. The UDP socket
//! is bound through the socket factory so the outbound interface is
//! honored; QUIC datagrams do not traverse the outbound proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use log::debug;

use crate::address::Location;
use crate::bootstrap::Bootstrapper;
use crate::error::{DnsError, ExchangeResult, InitError};
use crate::upstream::{
    frame_message, parse_response, Upstream, UpstreamBase, UpstreamFactoryConfig, UpstreamOptions,
};

/// ALPN protocol id for DNS-over-QUIC.
const ALPN_DOQ: &[u8] = b"doq";

/// Largest framed response we accept: length prefix plus a full message.
const MAX_RESPONSE_SIZE: usize = 2 + u16::MAX as usize;

pub struct DoqUpstream {
    base: UpstreamBase,
    location: Location,
    server_name: String,
    bootstrapper: Option<Arc<Bootstrapper>>,
    client_config: Option<quinn::ClientConfig>,
    endpoint: tokio::sync::Mutex<Option<quinn::Endpoint>>,
    connection: tokio::sync::Mutex<Option<quinn::Connection>>,
}

impl DoqUpstream {
    pub(crate) fn new(
        options: UpstreamOptions,
        config: UpstreamFactoryConfig,
        location: Location,
        server_name: String,
        bootstrapper: Option<Arc<Bootstrapper>>,
    ) -> Self {
        Self {
            base: UpstreamBase::new(options, config),
            location,
            server_name,
            bootstrapper,
            client_config: None,
            endpoint: tokio::sync::Mutex::new(None),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    async fn peer_addr(&self) -> Result<SocketAddr, DnsError> {
        if let Some(addr) = self.location.to_socket_addr() {
            return Ok(addr);
        }
        let bootstrapper = self
            .bootstrapper
            .as_ref()
            .ok_or_else(|| DnsError::BootstrapFailed("no bootstrapper".to_string()))?;
        let addrs = bootstrapper
            .resolve()
            .await
            .map_err(|e| DnsError::BootstrapFailed(e.to_string()))?;
        Ok(addrs[0])
    }

    async fn ensure_endpoint(&self, peer: &SocketAddr) -> Result<quinn::Endpoint, DnsError> {
        let mut guard = self.endpoint.lock().await;
        if let Some(endpoint) = guard.as_ref() {
            return Ok(endpoint.clone());
        }

        let client_config = self
            .client_config
            .clone()
            .ok_or_else(|| DnsError::InvalidArgument("upstream not initialized".to_string()))?;

        let socket = self
            .base
            .config
            .socket_factory
            .make_quic_udp_socket(peer, self.base.options.outbound_interface.as_ref())?;
        let mut endpoint = quinn::Endpoint::new(
            quinn::EndpointConfig::default(),
            None,
            socket,
            Arc::new(quinn::TokioRuntime),
        )
        .map_err(|e| DnsError::NetworkUnreachable(format!("QUIC endpoint failed: {}", e)))?;
        endpoint.set_default_client_config(client_config);

        *guard = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn ensure_connection(&self) -> Result<quinn::Connection, DnsError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.close_reason().is_none() {
                return Ok(connection.clone());
            }
            *guard = None;
        }

        let peer = self.peer_addr().await?;
        let endpoint = self.ensure_endpoint(&peer).await?;
        debug!(
            "[id={}] opening DoQ connection to {}",
            self.base.options.id, peer
        );

        let connecting = endpoint
            .connect(peer, &self.server_name)
            .map_err(|e| DnsError::InvalidArgument(format!("QUIC connect failed: {}", e)))?;
        // 0-RTT when the ticket cache allows it; otherwise a full handshake.
        let connection = match connecting.into_0rtt() {
            Ok((connection, _accepted)) => connection,
            Err(connecting) => connecting.await.map_err(map_connection_error)?,
        };

        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn invalidate_connection(&self) {
        *self.connection.lock().await = None;
    }

    async fn run(&self, request: &Message) -> ExchangeResult {
        let connection = self.ensure_connection().await?;

        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(map_connection_error)?;

        let mut wire_request = request.clone();
        // RFC 9250: the transaction id on the wire must be zero.
        wire_request.set_id(0);
        let framed = frame_message(&wire_request.to_vec()?)?;

        send.write_all(&framed)
            .await
            .map_err(|e| DnsError::NetworkUnreachable(format!("DoQ write failed: {}", e)))?;
        send.finish()
            .map_err(|e| DnsError::NetworkUnreachable(format!("DoQ finish failed: {}", e)))?;

        let buf = recv
            .read_to_end(MAX_RESPONSE_SIZE)
            .await
            .map_err(|e| DnsError::NetworkUnreachable(format!("DoQ read failed: {}", e)))?;
        if buf.len() < 2 {
            return Err(DnsError::ProtocolViolation("short DoQ response".to_string()));
        }
        let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if length != buf.len() - 2 {
            return Err(DnsError::ProtocolViolation(format!(
                "bad DoQ length prefix: {} for {} bytes",
                length,
                buf.len() - 2
            )));
        }

        let mut response = parse_response(&buf[2..])?;
        response.set_id(request.id());
        Ok(response)
    }

    async fn exchange_inner(&self, request: &Message) -> ExchangeResult {
        // The idle connection may have died; rebuild it once.
        match self.run(request).await {
            Err(DnsError::NetworkUnreachable(e)) => {
                self.invalidate_connection().await;
                debug!("[id={}] retrying DoQ exchange: {}", self.base.options.id, e);
                self.run(request).await
            }
            result => result,
        }
    }
}

fn map_connection_error(e: quinn::ConnectionError) -> DnsError {
    match e {
        quinn::ConnectionError::TransportError(e) => DnsError::TlsHandshakeFailed(e.to_string()),
        other => DnsError::NetworkUnreachable(other.to_string()),
    }
}

#[async_trait]
impl Upstream for DoqUpstream {
    async fn init(&mut self) -> Result<(), InitError> {
        if self.server_name.is_empty() {
            return Err(InitError::EmptyServerName);
        }
        if self.location.address().is_hostname() && self.bootstrapper.is_none() {
            return Err(InitError::EmptyBootstrap);
        }

        let mut tls_config = self
            .base
            .config
            .socket_factory
            .tls_client_config(&[ALPN_DOQ]);
        tls_config.enable_early_data = true;
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|_| InitError::TlsContextInitFailed)?;
        self.client_config = Some(quinn::ClientConfig::new(Arc::new(quic_tls)));
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
