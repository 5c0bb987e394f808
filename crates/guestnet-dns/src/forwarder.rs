//! UDP and TCP failover forwarder.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use guestnet_common::constants::{self, DNS_PORT};
use guestnet_common::error::{NetError, Result};
use guestnet_common::types::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::DnsService;
use crate::client::{NetworkClient, UpstreamClient};
use crate::handler::FailoverHandler;
use crate::resolv::{UpstreamDns, watch_upstreams};

/// Largest query datagram accepted from a client.
const MAX_UDP_QUERY: usize = 4096;

/// Settings shared by both forwarder backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    address: String,
    timeout: Duration,
    resolv_conf: PathBuf,
    zone: String,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout: constants::DEFAULT_DNS_TIMEOUT,
            resolv_conf: constants::default_resolv_conf(),
            zone: ".".to_owned(),
        }
    }
}

impl ForwarderConfig {
    /// Creates a configuration listening on `address` (`ip` or `ip:port`).
    pub fn new(address: impl Into<String>) -> Self {
        Self::default().address(address)
    }

    /// Sets the listen address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets the per-upstream timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the resolver configuration followed for upstreams.
    #[must_use]
    pub fn resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Sets the served zone (CoreDNS backend only).
    #[must_use]
    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    /// Per-upstream timeout.
    pub const fn upstream_timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolver configuration path.
    pub fn resolv_conf_path(&self) -> &Path {
        &self.resolv_conf
    }

    /// Served zone.
    pub fn zone_name(&self) -> &str {
        &self.zone
    }

    /// Listen address, with port 53 when none was given.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] when the address is missing or invalid.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(NetError::config("listen address is required"));
        }
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(addr);
        }
        address
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, DNS_PORT))
            .map_err(|_| NetError::config(format!("invalid listen address {address}")))
    }

    /// Checks the configuration before anything is bound.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let _ = self.listen_addr()?;
        if self.timeout.is_zero() {
            return Err(NetError::config("upstream timeout must be positive"));
        }
        if self.zone.is_empty() {
            return Err(NetError::config("zone is required"));
        }
        Ok(())
    }
}

/// Failover forwarder serving UDP and TCP on one address.
///
/// Upstreams follow the resolver configuration file. Stopping closes both
/// listeners; queries in flight are abandoned.
#[derive(Debug)]
pub struct DnsFailoverForwarder {
    handler: Arc<FailoverHandler>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl DnsFailoverForwarder {
    /// Starts a forwarder querying upstreams over the network.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, either listener
    /// cannot be bound or the resolver directory cannot be watched.
    pub async fn start(config: &ForwarderConfig) -> Result<Self> {
        Self::start_with_client(config, Arc::new(NetworkClient::new())).await
    }

    /// Starts a forwarder querying upstreams through `client`.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn start_with_client(
        config: &ForwarderConfig,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<Self> {
        config.validate()?;
        let requested = config.listen_addr()?;

        let udp = UdpSocket::bind(requested)
            .await
            .map_err(|e| NetError::kernel(format!("bind udp {requested}"), e))?;
        let local_addr = udp
            .local_addr()
            .map_err(|e| NetError::kernel("query udp address", e))?;
        let tcp = TcpListener::bind(local_addr)
            .await
            .map_err(|e| NetError::kernel(format!("bind tcp {local_addr}"), e))?;

        let cancel = CancellationToken::new();
        let mut updates = watch_upstreams(config.resolv_conf_path(), cancel.child_token())?;

        let handler = Arc::new(FailoverHandler::new(client, config.upstream_timeout()));
        if let Some(first) = updates.recv().await {
            let _ = apply_upstreams(&handler, first);
        }

        let _ = tokio::spawn(follow_upstreams(handler.clone(), updates));
        let _ = tokio::spawn(serve_udp(Arc::new(udp), handler.clone(), cancel.clone()));
        let _ = tokio::spawn(serve_tcp(tcp, handler.clone(), cancel.clone()));

        tracing::info!(
            address = %local_addr,
            resolv_conf = %config.resolv_conf_path().display(),
            "dns forwarder started"
        );
        Ok(Self {
            handler,
            local_addr,
            cancel,
            stopped: AtomicBool::new(false),
        })
    }

    /// Address both listeners are bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The query handler, exposing the current upstream set.
    pub fn handler(&self) -> &FailoverHandler {
        &self.handler
    }

    /// Resolves once [`stop`](DnsService::stop) has been called.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }
}

impl DnsService for DnsFailoverForwarder {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        tracing::info!(address = %self.local_addr, "dns forwarder stopped");
    }
}

impl Drop for DnsFailoverForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Installs a published set. Terminal values end the watch without
/// replacing the set in use.
fn apply_upstreams(handler: &FailoverHandler, update: UpstreamDns) -> bool {
    if update.is_terminal() {
        if let Some(e) = update.error {
            tracing::debug!(error = %e, "upstream updates ended");
        }
        return false;
    }
    if let Some(e) = &update.error {
        tracing::warn!(error = %e, "resolver configuration unreadable");
    }
    handler.set_upstreams(update.endpoints);
    true
}

async fn follow_upstreams(handler: Arc<FailoverHandler>, mut updates: mpsc::Receiver<UpstreamDns>) {
    while let Some(update) = updates.recv().await {
        if !apply_upstreams(&handler, update) {
            break;
        }
    }
}

async fn serve_udp(socket: Arc<UdpSocket>, handler: Arc<FailoverHandler>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_UDP_QUERY];
    loop {
        let (n, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "udp receive failed");
                    continue;
                }
            },
        };

        let packet = buf[..n].to_vec();
        let socket = socket.clone();
        let handler = handler.clone();
        let cancel = cancel.clone();
        let _ = tokio::spawn(async move {
            let response = tokio::select! {
                () = cancel.cancelled() => return,
                response = handler.handle(&packet, Protocol::Udp) => response,
            };
            if let Some(bytes) = response {
                if let Err(e) = socket.send_to(&bytes, peer).await {
                    tracing::debug!(%peer, error = %e, "udp reply failed");
                }
            }
        });
    }
    tracing::debug!("udp listener closed");
}

async fn serve_tcp(listener: TcpListener, handler: Arc<FailoverHandler>, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "tcp accept failed");
                    continue;
                }
            },
        };

        let handler = handler.clone();
        let cancel = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = serve_tcp_connection(stream, &handler) => {
                    if let Err(e) = result {
                        tracing::debug!(%peer, error = %e, "tcp connection closed");
                    }
                }
            }
        });
    }
    tracing::debug!("tcp listener closed");
}

/// Answers length-prefixed queries until the client closes the connection.
async fn serve_tcp_connection(mut stream: TcpStream, handler: &FailoverHandler) -> std::io::Result<()> {
    loop {
        let len = match stream.read_u16().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut packet = vec![0u8; usize::from(len)];
        let _ = stream.read_exact(&mut packet).await?;

        let Some(response) = handler.handle(&packet, Protocol::Tcp).await else {
            return Ok(());
        };
        let Ok(len) = u16::try_from(response.len()) else {
            tracing::warn!(size = response.len(), "response too large for tcp framing");
            return Ok(());
        };
        let mut frame = Vec::with_capacity(response.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&response);
        stream.write_all(&frame).await?;
    }
}
