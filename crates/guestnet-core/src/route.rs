//! Default route lookup and the default-interface watcher.
//!
//! The watcher follows the interface carrying the IPv4 default route so the
//! NAT rules of a bridge can be moved when the host switches uplinks (wired
//! to wireless, VPN up or down).

use std::future::Future;

use futures::{Stream, StreamExt, TryStreamExt};
use guestnet_common::error::{NetError, Result};
use netlink_packet_route::route::RouteAttribute;
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::constants::{RTMGRP_IPV4_ROUTE, RTMGRP_LINK};
use rtnetlink::{Handle, IpVersion};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::link::{link_name, run_netlink};

/// Main routing table id.
const RT_TABLE_MAIN: u8 = 254;

/// Returns the name of the interface carrying the IPv4 default route.
///
/// # Errors
///
/// Returns [`NetError::NoDefaultRoute`] when there is none, or an error if
/// the routing table cannot be read.
pub fn get_default_interface() -> Result<String> {
    run_netlink(|handle| async move { query_default_interface(&handle).await })
}

/// Async form of [`get_default_interface`] on an existing connection.
///
/// # Errors
///
/// See [`get_default_interface`].
pub async fn query_default_interface(handle: &Handle) -> Result<String> {
    let mut routes = handle.route().get(IpVersion::V4).execute();
    while let Some(route) = routes
        .try_next()
        .await
        .map_err(|e| NetError::kernel("list routes", e))?
    {
        if route.header.destination_prefix_length != 0 || route.header.table != RT_TABLE_MAIN {
            continue;
        }
        let Some(index) = route.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Oif(index) => Some(*index),
            _ => None,
        }) else {
            continue;
        };
        match link_name(handle, index).await {
            Ok(name) => return Ok(name),
            Err(e) => tracing::debug!(index, error = %e, "skipping default route"),
        }
    }
    Err(NetError::NoDefaultRoute)
}

/// Stream of default-interface names. An empty string means the host lost
/// its default route.
#[derive(Debug)]
pub struct InterfaceSubscription {
    receiver: mpsc::Receiver<String>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl InterfaceSubscription {
    /// Waits for the next value. Returns `None` once the watcher stopped.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Stops the watcher. Safe to call more than once.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for InterfaceSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Watches link and IPv4 route notifications and emits the default
/// interface whenever it changes, starting with its current value.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the notification socket cannot be opened or bound.
pub fn subscribe_default_interface_changes() -> Result<InterfaceSubscription> {
    let (mut connection, handle, messages) =
        rtnetlink::new_connection().map_err(|e| NetError::kernel("open netlink connection", e))?;
    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, RTMGRP_LINK | RTMGRP_IPV4_ROUTE))
        .map_err(|e| NetError::kernel("subscribe to link updates", e))?;
    let driver = AbortOnDrop(tokio::spawn(connection));

    let updates = messages.map(|_| ());
    let subscription = spawn_change_watcher(updates, move || {
        // The connection lives as long as the watcher task holds this closure.
        let _driver = &driver;
        let handle = handle.clone();
        async move { query_default_interface(&handle).await }
    });
    Ok(subscription)
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs the change-suppression loop over any notification source. Each item
/// of `updates` triggers a fresh `query`; a failed query counts as "no
/// default interface".
pub fn spawn_change_watcher<S, Q, F>(mut updates: S, mut query: Q) -> InterfaceSubscription
where
    S: Stream<Item = ()> + Send + Unpin + 'static,
    Q: FnMut() -> F + Send + 'static,
    F: Future<Output = Result<String>> + Send,
{
    let (tx, receiver) = mpsc::channel(1);
    let token = CancellationToken::new();
    let cancel = token.clone();

    let task = tokio::spawn(async move {
        let mut current = query().await.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "no initial default interface");
            String::new()
        });
        tokio::select! {
            () = cancel.cancelled() => return,
            sent = tx.send(current.clone()) => if sent.is_err() { return },
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                update = updates.next() => {
                    if update.is_none() {
                        tracing::debug!("link notification stream closed");
                        break;
                    }
                    let next = query().await.unwrap_or_default();
                    if next == current {
                        continue;
                    }
                    if next.is_empty() {
                        tracing::info!("default route lost");
                    } else {
                        tracing::info!(interface = %next, "default interface changed");
                    }
                    current = next;
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        sent = tx.send(current.clone()) => if sent.is_err() { break },
                    }
                }
            }
        }
    });

    InterfaceSubscription {
        receiver,
        token,
        task,
    }
}
