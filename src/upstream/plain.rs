//! Plain DNS upstream. UDP by default; a truncated response is retried
//! once over TCP against the same peer, under the same exchange deadline.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use log::debug;
use tokio::io::AsyncReadExt;

use crate::address::Location;
use crate::bootstrap::Bootstrapper;
use crate::error::{DnsError, ExchangeResult, InitError};
use crate::socket::TransportProtocol;
use crate::socket_stream::connect_stream;
use crate::upstream::{
    frame_message, parse_response, Upstream, UpstreamBase, UpstreamFactoryConfig, UpstreamOptions,
};

pub struct PlainUpstream {
    base: UpstreamBase,
    location: Location,
    /// `tcp://` upstreams skip UDP entirely.
    prefer_tcp: bool,
    bootstrapper: Option<Arc<Bootstrapper>>,
}

impl PlainUpstream {
    pub(crate) fn new(
        options: UpstreamOptions,
        config: UpstreamFactoryConfig,
        location: Location,
        prefer_tcp: bool,
        bootstrapper: Option<Arc<Bootstrapper>>,
    ) -> Self {
        Self {
            base: UpstreamBase::new(options, config),
            location,
            prefer_tcp,
            bootstrapper,
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

    async fn exchange_inner(&self, request: &Message) -> ExchangeResult {
        let peer = self.peer_addr().await?;
        let payload = request.to_vec()?;

        if self.prefer_tcp {
            return self.exchange_tcp(peer, request.id(), &payload).await;
        }

        let response = self.exchange_udp(peer, request.id(), &payload).await?;
        if !response.truncated() {
            return Ok(response);
        }

        debug!(
            "[id={}] truncated UDP response, retrying over TCP",
            self.base.options.id
        );
        let response = self.exchange_tcp(peer, request.id(), &payload).await?;
        if response.truncated() {
            return Err(DnsError::ProtocolViolation(
                "response truncated after TCP retry".to_string(),
            ));
        }
        Ok(response)
    }

    async fn exchange_udp(
        &self,
        peer: SocketAddr,
        request_id: u16,
        payload: &[u8],
    ) -> ExchangeResult {
        let socket = self.base.make_socket(TransportProtocol::Udp);
        let mut stream = connect_stream(socket, peer, Some(self.base.options.timeout)).await?;
        stream.sender().send(payload)?;

        loop {
            let datagram = stream.recv_message().await?;
            let response = match parse_response(&datagram) {
                Ok(response) => response,
                // Not necessarily ours; keep waiting for a matching reply.
                Err(_) => continue,
            };
            if response.id() == request_id {
                return Ok(response);
            }
        }
    }

    async fn exchange_tcp(
        &self,
        peer: SocketAddr,
        request_id: u16,
        payload: &[u8],
    ) -> ExchangeResult {
        let socket = self.base.make_socket(TransportProtocol::Tcp);
        let mut stream = connect_stream(socket, peer, Some(self.base.options.timeout)).await?;
        stream.sender().send(&frame_message(payload)?)?;

        let mut length = [0u8; 2];
        stream.read_exact(&mut length).await?;
        let mut body = vec![0u8; u16::from_be_bytes(length) as usize];
        stream.read_exact(&mut body).await?;

        let response = parse_response(&body)?;
        if response.id() != request_id {
            return Err(DnsError::ProtocolViolation(format!(
                "transaction id mismatch: sent {}, got {}",
                request_id,
                response.id()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Upstream for PlainUpstream {
    async fn init(&mut self) -> Result<(), InitError> {
        if self.location.address().is_hostname() && self.bootstrapper.is_none() {
            return Err(InitError::EmptyBootstrap);
        }
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

#[cfg(test)]
pub(crate) mod test_support {
    use hickory_proto::op::{Message, MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record, RecordType};

    /// Build a test request for an A record.
    pub fn make_request(id: u16, name: &str) -> Message {
        let mut request = Message::new();
        request
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                hickory_proto::rr::Name::from_utf8(name).unwrap(),
                RecordType::A,
            ));
        request
    }

    /// Build a response to `request` answering with `ip`.
    pub fn make_response(request: &Message, ip: std::net::Ipv4Addr, truncated: bool) -> Message {
        let query = request.queries()[0].clone();
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_truncated(truncated)
            .add_query(query.clone())
            .add_answer(Record::from_rdata(query.name().clone(), 300, RData::A(A(ip))));
        response
    }
}
