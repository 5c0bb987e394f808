//! [`LinkManager`] backed by rtnetlink.
//!
//! Each operation opens its own netlink socket on a short-lived helper
//! thread. New threads inherit the network namespace of their creator, so
//! calls made inside [`crate::namespace::Network::execute`] act on the
//! namespace rather than on the host.

use std::fs::File;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use futures::TryStreamExt;
use guestnet_common::constants::DEFAULT_NETNS_DIR;
use guestnet_common::error::{NetError, Result};
use guestnet_common::types::LinkKind;
use ipnetwork::Ipv4Network;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use rtnetlink::Handle;

use super::{LinkManager, tap};

/// Link manager talking to the kernel over rtnetlink.
#[derive(Debug, Clone)]
pub struct NetlinkLinkManager {
    netns_dir: PathBuf,
}

impl Default for NetlinkLinkManager {
    fn default() -> Self {
        Self {
            netns_dir: PathBuf::from(DEFAULT_NETNS_DIR),
        }
    }
}

impl NetlinkLinkManager {
    /// Creates a manager resolving named namespaces under `/run/netns`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves named namespaces under `dir` instead.
    #[must_use]
    pub fn with_netns_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.netns_dir = dir.into();
        self
    }

    fn open_namespace(&self, name: &str) -> Result<File> {
        let path = self.netns_dir.join(name);
        File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NetError::NotFound {
                    kind: "namespace",
                    name: name.to_owned(),
                }
            } else {
                NetError::io(path, e)
            }
        })
    }

    fn add_veth(&self, name: &str, peer: &str, namespace: Option<&str>) -> Result<()> {
        let target = namespace.map(|ns| self.open_namespace(ns)).transpose()?;

        run_netlink(|handle| async move {
            handle
                .link()
                .add()
                .veth(name.to_owned(), peer.to_owned())
                .execute()
                .await
                .map_err(|e| link_error("add veth", name, e))?;

            let Some(target) = target else {
                return Ok(());
            };

            let moved = async {
                let index = link_index(&handle, peer).await?;
                handle
                    .link()
                    .set(index)
                    .setns_by_fd(target.as_raw_fd())
                    .execute()
                    .await
                    .map_err(|e| link_error("move link", peer, e))
            }
            .await;

            if let Err(e) = moved {
                // Deleting one end of a veth pair removes both.
                let cleanup = async {
                    let index = link_index(&handle, name).await?;
                    handle
                        .link()
                        .del(index)
                        .execute()
                        .await
                        .map_err(|e| link_error("delete link", name, e))
                }
                .await;
                return Err(match cleanup {
                    Ok(()) => e,
                    Err(rollback) => e.with_rollback(rollback),
                });
            }
            Ok(())
        })?;

        tracing::debug!(link = %name, peer = %peer, namespace = ?namespace, "veth pair added");
        Ok(())
    }
}

impl LinkManager for NetlinkLinkManager {
    fn add_link(&self, name: &str, kind: &LinkKind) -> Result<()> {
        match kind {
            LinkKind::Bridge => {
                run_netlink(|handle| async move {
                    handle
                        .link()
                        .add()
                        .bridge(name.to_owned())
                        .execute()
                        .await
                        .map_err(|e| link_error("add link", name, e))
                })?;
                tracing::debug!(link = %name, "bridge link added");
                Ok(())
            }
            LinkKind::Tap => tap::create_persistent_tap(name),
            LinkKind::Veth {
                peer,
                peer_namespace,
            } => self.add_veth(name, peer, peer_namespace.as_deref()),
        }
    }

    fn set_ip(&self, name: &str, address: Ipv4Network) -> Result<()> {
        run_netlink(|handle| async move {
            let index = link_index(&handle, name).await?;
            match handle
                .address()
                .add(index, IpAddr::V4(address.ip()), address.prefix())
                .execute()
                .await
            {
                Ok(()) => Ok(()),
                Err(e) if errno(&e) == Some(libc::EEXIST) => {
                    tracing::debug!(link = %name, address = %address, "address already assigned");
                    Ok(())
                }
                Err(e) => Err(NetError::kernel(format!("set address {address} on {name}"), e)),
            }
        })
    }

    fn exists(&self, name: &str) -> Result<bool> {
        run_netlink(|handle| async move {
            match link_index(&handle, name).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        run_netlink(|handle| async move {
            let index = link_index(&handle, name).await?;
            let master_index = link_index(&handle, master).await?;
            handle
                .link()
                .set(index)
                .controller(master_index)
                .execute()
                .await
                .map_err(|e| link_error("set master", name, e))
        })
    }

    fn bring_up(&self, name: &str) -> Result<()> {
        run_netlink(|handle| async move {
            let index = link_index(&handle, name).await?;
            handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .map_err(|e| link_error("bring up", name, e))
        })
    }

    fn has_ip(&self, name: &str, address: Ipv4Network) -> Result<bool> {
        run_netlink(|handle| async move {
            let index = link_index(&handle, name).await?;
            let mut addresses = handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();
            while let Some(message) = addresses
                .try_next()
                .await
                .map_err(|e| NetError::kernel(format!("list addresses of {name}"), e))?
            {
                if message.header.prefix_len != address.prefix() {
                    continue;
                }
                let matches = message.attributes.iter().any(|attr| {
                    matches!(attr, AddressAttribute::Address(IpAddr::V4(ip)) if *ip == address.ip())
                });
                if matches {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        run_netlink(|handle| async move {
            let index = match link_index(&handle, name).await {
                Ok(index) => index,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            match handle.link().del(index).execute().await {
                Ok(()) => Ok(()),
                Err(e) => match link_error("delete link", name, e) {
                    e if e.is_not_found() => Ok(()),
                    e => Err(e),
                },
            }
        })?;
        tracing::debug!(link = %name, "link deleted");
        Ok(())
    }

    fn disable_tx_offloading(&self, name: &str) -> Result<()> {
        let ethtool = which::which("ethtool").map_err(|e| NetError::kernel("locate ethtool", e))?;
        run_ethtool(&ethtool, name)
    }

    fn add_default_route(&self, name: &str, gateway: Ipv4Addr) -> Result<()> {
        run_netlink(|handle| async move {
            let index = link_index(&handle, name).await?;
            handle
                .route()
                .add()
                .v4()
                .gateway(gateway)
                .output_interface(index)
                .execute()
                .await
                .map_err(|e| match errno(&e) {
                    Some(libc::EEXIST) => NetError::AlreadyExists {
                        kind: "route",
                        name: format!("default via {gateway}"),
                    },
                    _ => NetError::kernel(format!("add default route via {gateway} on {name}"), e),
                })
        })?;
        tracing::debug!(link = %name, gateway = %gateway, "default route added");
        Ok(())
    }
}

fn run_ethtool(ethtool: &Path, name: &str) -> Result<()> {
    let output = Command::new(ethtool)
        .args(["-K", name, "tx", "off"])
        .output()
        .map_err(|e| NetError::io(ethtool, e))?;
    if !output.status.success() {
        return Err(NetError::kernel(
            format!("disable tx offloading on {name}"),
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    tracing::debug!(link = %name, "tx offloading disabled");
    Ok(())
}

/// Runs `f` against a fresh rtnetlink connection on a helper thread and
/// waits for its result. A panic inside `f` is re-raised on the caller.
///
/// # Errors
///
/// Returns an error if the connection cannot be opened, or whatever `f`
/// returns.
pub(crate) fn run_netlink<T, F, Fut>(f: F) -> Result<T>
where
    T: Send,
    F: FnOnce(Handle) -> Fut + Send,
    Fut: Future<Output = Result<T>>,
{
    std::thread::scope(|scope| {
        let worker = scope.spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| NetError::kernel("start netlink runtime", e))?;
            runtime.block_on(async move {
                let (connection, handle, _) = rtnetlink::new_connection()
                    .map_err(|e| NetError::kernel("open netlink connection", e))?;
                let driver = tokio::spawn(connection);
                let result = f(handle).await;
                driver.abort();
                result
            })
        });
        worker
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    })
}

/// Positive errno carried by a netlink error reply.
fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(message) => message.code.map(|code| -code.get()),
        _ => None,
    }
}

fn link_error(operation: &str, name: &str, err: rtnetlink::Error) -> NetError {
    match errno(&err) {
        Some(libc::EEXIST) => NetError::AlreadyExists {
            kind: "link",
            name: name.to_owned(),
        },
        Some(libc::ENODEV) => NetError::NotFound {
            kind: "link",
            name: name.to_owned(),
        },
        _ => NetError::kernel(format!("{operation} {name}"), err),
    }
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
    let mut links = handle.link().get().match_name(name.to_owned()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(NetError::NotFound {
            kind: "link",
            name: name.to_owned(),
        }),
        Err(e) => Err(link_error("get link", name, e)),
    }
}

/// Resolves a link index to its interface name.
pub(crate) async fn link_name(handle: &Handle, index: u32) -> Result<String> {
    let mut links = handle.link().get().match_index(index).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| NetError::kernel(format!("get link {index}"), e))?
        .ok_or_else(|| NetError::NotFound {
            kind: "link",
            name: index.to_string(),
        })?;
    link.attributes
        .into_iter()
        .find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name),
            _ => None,
        })
        .ok_or_else(|| NetError::NotFound {
            kind: "link name",
            name: index.to_string(),
        })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn netns_dir_is_configurable() {
        let manager = NetlinkLinkManager::new().with_netns_dir("/tmp/netns");
        assert_eq!(manager.netns_dir, PathBuf::from("/tmp/netns"));
    }

    #[test]
    fn missing_namespace_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = NetlinkLinkManager::new().with_netns_dir(dir.path());
        let err = manager.open_namespace("absent").unwrap_err();
        assert!(err.is_not_found());
    }
}
