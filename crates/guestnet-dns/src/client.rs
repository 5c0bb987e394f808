//! Upstream query transport.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use guestnet_common::error::{NetError, Result};
use guestnet_common::types::Protocol;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Largest datagram accepted from an upstream.
const MAX_UDP_RESPONSE: usize = 4096;

/// Sends one query to one upstream and returns its response.
///
/// The handler bounds every call with its own timeout, so implementations
/// need not time out themselves.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Exchanges `query` with `upstream` over `protocol`.
    async fn exchange(
        &self,
        query: &Message,
        upstream: SocketAddr,
        protocol: Protocol,
    ) -> Result<Message>;
}

/// [`UpstreamClient`] speaking plain DNS over UDP or TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkClient;

impl NetworkClient {
    /// Creates a client.
    pub const fn new() -> Self {
        Self
    }

    async fn exchange_udp(query: &[u8], id: u16, upstream: SocketAddr) -> Result<Message> {
        let local: SocketAddr = if upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| NetError::upstream(upstream, e))?;
        socket
            .connect(upstream)
            .await
            .map_err(|e| NetError::upstream(upstream, e))?;
        let _ = socket
            .send(query)
            .await
            .map_err(|e| NetError::upstream(upstream, e))?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        loop {
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|e| NetError::upstream(upstream, e))?;
            match Message::from_vec(&buf[..n]) {
                Ok(response) if response.id() == id => return Ok(response),
                Ok(response) => {
                    tracing::debug!(%upstream, id = response.id(), "discarding mismatched response");
                }
                Err(e) => {
                    tracing::debug!(%upstream, error = %e, "discarding malformed response");
                }
            }
        }
    }

    async fn exchange_tcp(query: &[u8], upstream: SocketAddr) -> Result<Message> {
        let len = u16::try_from(query.len())
            .map_err(|_| NetError::upstream(upstream, "query exceeds 65535 bytes"))?;
        let mut stream = TcpStream::connect(upstream)
            .await
            .map_err(|e| NetError::upstream(upstream, e))?;

        let mut frame = Vec::with_capacity(query.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(query);
        stream
            .write_all(&frame)
            .await
            .map_err(|e| NetError::upstream(upstream, e))?;

        let len = stream
            .read_u16()
            .await
            .map_err(|e| NetError::upstream(upstream, e))?;
        let mut buf = vec![0u8; usize::from(len)];
        let _ = stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| NetError::upstream(upstream, e))?;
        Message::from_vec(&buf).map_err(|e| NetError::upstream(upstream, e))
    }
}

#[async_trait]
impl UpstreamClient for NetworkClient {
    async fn exchange(
        &self,
        query: &Message,
        upstream: SocketAddr,
        protocol: Protocol,
    ) -> Result<Message> {
        let bytes = query
            .to_vec()
            .map_err(|e| NetError::upstream(upstream, e))?;
        match protocol {
            Protocol::Udp => Self::exchange_udp(&bytes, query.id(), upstream).await,
            Protocol::Tcp => Self::exchange_tcp(&bytes, upstream).await,
        }
    }
}
