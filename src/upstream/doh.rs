//! DNS-over-HTTPS upstream (RFC 8484).
//!
//! HTTP/2 POST (or GET) carrying `application/dns-message` over a
//! persistent h2 session per `(host, port)`. The session is created
//! lazily, shared by concurrent exchanges through h2's own multiplexing,
//! and recreated when the connection dies. Per RFC 8484 the request id is
//! zeroed on the wire and restored on the response. Redirects are followed
//! within the same origin, up to a small bound; other statuses outside
//! 2xx are protocol errors.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use h2::client::SendRequest;
use hickory_proto::op::Message;
use http::{Method, Request, StatusCode, Uri};
use log::debug;

use crate::address::Location;
use crate::bootstrap::Bootstrapper;
use crate::error::{DnsError, ExchangeResult, InitError};
use crate::socket_stream::connect_stream;
use crate::tls_socket::SecureSocketParameters;
use crate::upstream::{parse_response, Upstream, UpstreamBase, UpstreamFactoryConfig, UpstreamOptions};

/// ALPN protocol id for HTTP/2.
const ALPN_H2: &[u8] = b"h2";

const CONTENT_TYPE_DNS_MESSAGE: &str = "application/dns-message";

/// 3xx responses are followed at most this many times per exchange.
const MAX_REDIRECTS: usize = 5;

struct H2Session {
    send_request: SendRequest<Bytes>,
    _driver: Arc<DriverHandle>,
}

impl Clone for H2Session {
    fn clone(&self) -> Self {
        Self {
            send_request: self.send_request.clone(),
            _driver: self._driver.clone(),
        }
    }
}

/// Aborts the h2 connection driver once every session clone is gone.
struct DriverHandle(tokio::task::AbortHandle);

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct DohUpstream {
    base: UpstreamBase,
    location: Location,
    server_name: String,
    path: String,
    bootstrapper: Option<Arc<Bootstrapper>>,
    client_config: Option<Arc<rustls::ClientConfig>>,
    session: tokio::sync::Mutex<Option<H2Session>>,
    use_get: bool,
}

impl DohUpstream {
    pub(crate) fn new(
        options: UpstreamOptions,
        config: UpstreamFactoryConfig,
        location: Location,
        server_name: String,
        path: String,
        bootstrapper: Option<Arc<Bootstrapper>>,
    ) -> Self {
        Self {
            base: UpstreamBase::new(options, config),
            location,
            server_name,
            path,
            bootstrapper,
            client_config: None,
            session: tokio::sync::Mutex::new(None),
            use_get: false,
        }
    }

    /// Switch this upstream to RFC 8484 GET requests.
    pub fn set_use_get(&mut self, use_get: bool) {
        self.use_get = use_get;
    }

    fn authority(&self) -> String {
        if self.location.port() == 443 {
            self.server_name.clone()
        } else {
            format!("{}:{}", self.server_name, self.location.port())
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

    async fn ensure_session(&self) -> Result<H2Session, DnsError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let client_config = self
            .client_config
            .clone()
            .ok_or_else(|| DnsError::InvalidArgument("upstream not initialized".to_string()))?;

        let peer = self.peer_addr().await?;
        debug!(
            "[id={}] opening DoH connection to {}",
            self.base.options.id, peer
        );
        let socket = self.base.make_secured_socket(SecureSocketParameters {
            client_config,
            server_name: self.server_name.clone(),
        });
        let stream = connect_stream(socket, peer, Some(self.base.options.timeout)).await?;

        let (send_request, connection) = h2::client::handshake(stream)
            .await
            .map_err(|e| DnsError::NetworkUnreachable(format!("H2 handshake failed: {}", e)))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("DoH connection driver ended: {}", e);
            }
        });

        let session = H2Session {
            send_request,
            _driver: Arc::new(DriverHandle(driver.abort_handle())),
        };
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    fn build_request(&self, path: &str, payload: &[u8]) -> Result<Request<()>, DnsError> {
        let builder = if self.use_get {
            Request::builder()
                .method(Method::GET)
                .uri(format!(
                    "https://{}{}?dns={}",
                    self.authority(),
                    path,
                    URL_SAFE_NO_PAD.encode(payload)
                ))
                .header(http::header::ACCEPT, CONTENT_TYPE_DNS_MESSAGE)
        } else {
            Request::builder()
                .method(Method::POST)
                .uri(format!("https://{}{}", self.authority(), path))
                .header(http::header::ACCEPT, CONTENT_TYPE_DNS_MESSAGE)
                .header(http::header::CONTENT_TYPE, CONTENT_TYPE_DNS_MESSAGE)
        };
        builder
            .body(())
            .map_err(|e| DnsError::InvalidArgument(format!("bad request: {}", e)))
    }

    /// One HTTP request/response on the shared session.
    async fn request_once(
        &self,
        path: &str,
        payload: &[u8],
    ) -> Result<(StatusCode, Option<String>, Vec<u8>), DnsError> {
        let session = self.ensure_session().await?;
        let mut send_request = session.send_request.clone().ready().await.map_err(|e| {
            DnsError::NetworkUnreachable(format!("H2 connection unusable: {}", e))
        })?;

        let request = self.build_request(path, payload)?;
        let (response, mut send_stream) = send_request
            .send_request(request, self.use_get)
            .map_err(|e| DnsError::NetworkUnreachable(format!("H2 send failed: {}", e)))?;
        if !self.use_get {
            send_stream
                .send_data(Bytes::copy_from_slice(payload), true)
                .map_err(|e| DnsError::NetworkUnreachable(format!("H2 body send failed: {}", e)))?;
        }

        let response = response
            .await
            .map_err(|e| DnsError::NetworkUnreachable(format!("H2 response failed: {}", e)))?;
        let status = response.status();
        let location = response
            .headers()
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut recv_stream = response.into_body();
        while let Some(chunk) = recv_stream.data().await {
            let chunk = chunk
                .map_err(|e| DnsError::NetworkUnreachable(format!("H2 body read failed: {}", e)))?;
            let _ = recv_stream.flow_control().release_capacity(chunk.len());
            body.extend_from_slice(&chunk);
        }
        Ok((status, location, body))
    }

    /// Resolve a redirect target against this upstream's origin. Only
    /// same-origin targets are followed.
    fn redirect_path(&self, location: &str) -> Result<String, DnsError> {
        if location.starts_with('/') {
            return Ok(location.to_string());
        }
        let uri: Uri = location
            .parse()
            .map_err(|_| DnsError::ProtocolViolation(format!("bad redirect: {}", location)))?;
        let same_origin = uri.scheme_str() == Some("https")
            && uri.host() == Some(self.server_name.as_str())
            && uri.port_u16().unwrap_or(443) == self.location.port();
        if !same_origin {
            return Err(DnsError::ProtocolViolation(format!(
                "cross-origin redirect: {}",
                location
            )));
        }
        Ok(uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string()))
    }

    async fn run(&self, request: &Message) -> ExchangeResult {
        let mut wire_request = request.clone();
        // The id is zeroed on the wire to keep responses cacheable.
        wire_request.set_id(0);
        let payload = wire_request.to_vec()?;

        let mut path = self.path.clone();
        for _ in 0..=MAX_REDIRECTS {
            let (status, location, body) = self.request_once(&path, &payload).await?;

            if status.is_redirection() {
                let target = location.ok_or_else(|| {
                    DnsError::ProtocolViolation(format!("redirect without location ({})", status))
                })?;
                path = self.redirect_path(&target)?;
                debug!("[id={}] following redirect to {}", self.base.options.id, path);
                continue;
            }
            if !status.is_success() {
                return Err(DnsError::ProtocolViolation(format!(
                    "HTTP status {}",
                    status
                )));
            }

            let mut response = parse_response(&body)?;
            response.set_id(request.id());
            return Ok(response);
        }
        Err(DnsError::ProtocolViolation("too many redirects".to_string()))
    }

    async fn exchange_inner(&self, request: &Message) -> ExchangeResult {
        // A pooled session may be dead; rebuild it once.
        match self.run(request).await {
            Err(DnsError::NetworkUnreachable(e)) => {
                self.invalidate_session().await;
                debug!("[id={}] retrying DoH exchange: {}", self.base.options.id, e);
                self.run(request).await
            }
            result => result,
        }
    }
}

#[async_trait]
impl Upstream for DohUpstream {
    async fn init(&mut self) -> Result<(), InitError> {
        if self.server_name.is_empty() {
            return Err(InitError::EmptyServerName);
        }
        if self.location.address().is_hostname() && self.bootstrapper.is_none() {
            return Err(InitError::EmptyBootstrap);
        }
        if rustls::pki_types::ServerName::try_from(self.server_name.clone()).is_err() {
            return Err(InitError::TlsContextInitFailed);
        }
        // Validate that the fixed request parts form a legal URI.
        let probe = format!("https://{}{}", self.authority(), self.path);
        if probe.parse::<Uri>().is_err() {
            return Err(InitError::HttpHeadersInitFailed);
        }
        self.client_config = Some(Arc::new(
            self.base
                .config
                .socket_factory
                .tls_client_config(&[ALPN_H2]),
        ));
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
