//! Resolver configuration parsing and the upstream watcher.
//!
//! The watcher observes the directory holding the resolver file rather than
//! the file itself, since resolver managers replace the file by renaming a
//! new one over it.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use guestnet_common::constants::DNS_PORT;
use guestnet_common::error::{NetError, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One published upstream set.
#[derive(Debug)]
pub struct UpstreamDns {
    /// Resolver endpoints in file order.
    pub endpoints: Vec<SocketAddr>,
    /// Outcome of the read that produced this set. The last value of a
    /// watch always carries [`NetError::WatchTerminated`].
    pub error: Option<NetError>,
}

impl UpstreamDns {
    /// Whether this is the final value of a watch.
    pub const fn is_terminal(&self) -> bool {
        matches!(self.error, Some(NetError::WatchTerminated { .. }))
    }
}

/// Extracts `nameserver` entries. Comments and malformed lines are skipped;
/// IPv6 resolvers are ignored.
pub fn parse_resolv_conf(contents: &str) -> Vec<SocketAddr> {
    contents
        .lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or_default())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            if fields.next() != Some("nameserver") {
                return None;
            }
            match fields.next()?.parse::<IpAddr>() {
                Ok(ip @ IpAddr::V4(_)) => Some(SocketAddr::new(ip, DNS_PORT)),
                Ok(IpAddr::V6(ip)) => {
                    tracing::debug!(nameserver = %ip, "ignoring IPv6 nameserver");
                    None
                }
                Err(_) => None,
            }
        })
        .collect()
}

/// Reads the upstream set from `path`. A read failure yields an empty set
/// carrying the error.
pub fn read_upstreams(path: &Path) -> UpstreamDns {
    match std::fs::read_to_string(path) {
        Ok(contents) => UpstreamDns {
            endpoints: parse_resolv_conf(&contents),
            error: None,
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read resolver configuration");
            UpstreamDns {
                endpoints: Vec::new(),
                error: Some(NetError::io(path, e)),
            }
        }
    }
}

/// Whether `a` and `b` hold the same elements with the same multiplicity,
/// in any order.
pub fn same_members<T: Eq + Hash>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut counts: HashMap<&T, usize> = HashMap::with_capacity(a.len());
    for v in a {
        *counts.entry(v).or_default() += 1;
    }
    b.iter().all(|v| match counts.get_mut(v) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    })
}

/// Watches `path` and publishes its upstream set: once at start, then after
/// every change of the file that alters the set. The stream ends with a
/// terminal value when `cancel` fires or the watch closes.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the containing directory cannot be watched.
pub fn watch_upstreams(
    path: &Path,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<UpstreamDns>> {
    let path = path.to_path_buf();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = path
        .file_name()
        .map(ToOwned::to_owned)
        .ok_or_else(|| NetError::config(format!("{} names no file", path.display())))?;

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = event_tx.send(event);
        })
        .map_err(|e| NetError::kernel("create file watcher", e))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| NetError::kernel(format!("watch {}", dir.display()), e))?;
    tracing::debug!(dir = %dir.display(), "watching resolver directory");

    let (tx, rx) = mpsc::channel(1);
    let _ = tokio::spawn(async move {
        let _watcher = watcher;
        let first = read_upstreams(&path);
        let mut current = first.endpoints.clone();
        if !publish(&tx, first, &cancel).await {
            return;
        }

        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => break "cancelled",
                event = events.recv() => {
                    let event = match event {
                        None => break "watcher closed",
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "file watcher error");
                            continue;
                        }
                        Some(Ok(event)) => event,
                    };
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    if !event.paths.iter().any(|p| p.file_name() == Some(base.as_os_str())) {
                        continue;
                    }
                    let next = read_upstreams(&path);
                    if same_members(&current, &next.endpoints) {
                        continue;
                    }
                    tracing::info!(upstreams = ?next.endpoints, "resolver configuration changed");
                    current.clone_from(&next.endpoints);
                    if !publish(&tx, next, &cancel).await {
                        break "cancelled";
                    }
                }
            }
        };

        tracing::debug!(reason, "upstream watch ended");
        let _ = tx
            .send(UpstreamDns {
                endpoints: Vec::new(),
                error: Some(NetError::WatchTerminated {
                    reason: reason.to_owned(),
                }),
            })
            .await;
    });

    Ok(rx)
}

/// Sends `value` unless the watch is cancelled first or nobody listens.
async fn publish(
    tx: &mpsc::Sender<UpstreamDns>,
    value: UpstreamDns,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        sent = tx.send(value) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_nameservers_in_order() {
        let conf = "# generated\nsearch lan\nnameserver 10.0.0.1\nnameserver 1.1.1.1 # cloudflare\noptions edns0\n";
        assert_eq!(
            parse_resolv_conf(conf),
            vec![addr("10.0.0.1:53"), addr("1.1.1.1:53")]
        );
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let conf = "nameserver\nnameserver not-an-ip\n; nameserver 9.9.9.9\nnameserver ::1\nnameserver 8.8.8.8\n";
        assert_eq!(parse_resolv_conf(conf), vec![addr("8.8.8.8:53")]);
        assert!(parse_resolv_conf("garbage\x00\x01").is_empty());
    }

    #[test]
    fn missing_file_reports_error_with_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let ups = read_upstreams(&dir.path().join("resolv.conf"));
        assert!(ups.endpoints.is_empty());
        assert!(matches!(ups.error, Some(NetError::Io { .. })));
        assert!(!ups.is_terminal());
    }

    #[test]
    fn same_members_ignores_order_but_not_multiplicity() {
        assert!(same_members(&[1, 2, 3], &[3, 1, 2]));
        assert!(same_members::<u8>(&[], &[]));
        assert!(!same_members(&[1, 1, 2], &[1, 2, 2]));
        assert!(!same_members(&[1, 2], &[1, 2, 3]));
    }
}
