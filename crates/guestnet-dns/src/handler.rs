//! Failover query handling shared by every transport of a forwarder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use guestnet_common::types::Protocol;
use hickory_proto::op::{Message, MessageType, ResponseCode};

use crate::client::UpstreamClient;

/// Answers queries by trying each upstream once, in published order.
///
/// The upstream list is replaced wholesale through [`set_upstreams`]; a
/// query in flight keeps the list it started with.
///
/// [`set_upstreams`]: FailoverHandler::set_upstreams
pub struct FailoverHandler {
    upstreams: ArcSwap<Vec<SocketAddr>>,
    client: Arc<dyn UpstreamClient>,
    timeout: Duration,
}

impl std::fmt::Debug for FailoverHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverHandler")
            .field("upstreams", &self.upstreams.load_full())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FailoverHandler {
    /// Creates a handler with no upstreams.
    pub fn new(client: Arc<dyn UpstreamClient>, timeout: Duration) -> Self {
        Self {
            upstreams: ArcSwap::from_pointee(Vec::new()),
            client,
            timeout,
        }
    }

    /// Replaces the upstream list.
    pub fn set_upstreams(&self, upstreams: Vec<SocketAddr>) {
        tracing::debug!(?upstreams, "upstream set replaced");
        self.upstreams.store(Arc::new(upstreams));
    }

    /// Current upstream list.
    pub fn upstreams(&self) -> Arc<Vec<SocketAddr>> {
        self.upstreams.load_full()
    }

    /// Per-upstream timeout.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolves `query`.
    ///
    /// Returns the first successful response that carries answers. Failing
    /// that, the last response any upstream gave; failing that, SERVFAIL.
    /// Upstream errors are logged and skipped.
    pub async fn resolve(&self, query: &Message, protocol: Protocol) -> Message {
        let upstreams = self.upstreams.load_full();
        let mut last = None;

        for &upstream in upstreams.iter() {
            let attempt =
                tokio::time::timeout(self.timeout, self.client.exchange(query, upstream, protocol))
                    .await;
            match attempt {
                Ok(Ok(response)) => {
                    if response.response_code() == ResponseCode::NoError
                        && !response.answers().is_empty()
                    {
                        return response;
                    }
                    tracing::debug!(
                        %upstream,
                        rcode = %response.response_code(),
                        "upstream gave no usable answer"
                    );
                    last = Some(response);
                }
                Ok(Err(e)) => tracing::warn!(%upstream, error = %e, "upstream query failed"),
                Err(_) => tracing::warn!(%upstream, timeout = ?self.timeout, "upstream timed out"),
            }
        }

        last.unwrap_or_else(|| server_failure(query))
    }

    /// Decodes a wire-format query, resolves it and encodes the response.
    /// Returns `None` for input that is not a decodable query.
    pub async fn handle(&self, packet: &[u8], protocol: Protocol) -> Option<Vec<u8>> {
        let query = match Message::from_vec(packet) {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed query");
                return None;
            }
        };
        if query.message_type() != MessageType::Query {
            return None;
        }

        let response = self.resolve(&query, protocol).await;
        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(id = query.id(), error = %e, "failed to encode response");
                None
            }
        }
    }
}

/// SERVFAIL response echoing the question of `query`.
pub fn server_failure(query: &Message) -> Message {
    let mut response = Message::error_msg(query.id(), query.op_code(), ResponseCode::ServFail);
    let _ = response
        .add_queries(query.queries().to_vec())
        .set_recursion_desired(query.recursion_desired());
    response
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::str::FromStr;

    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};

    use super::*;

    #[test]
    fn server_failure_echoes_question() {
        let mut query = Message::new();
        let _ = query
            .set_id(4242)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_str("example.com.").unwrap(),
                RecordType::A,
            ));

        let response = server_failure(&query);
        assert_eq!(response.id(), 4242);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert!(response.recursion_desired());
        assert_eq!(response.queries(), query.queries());
    }
}
