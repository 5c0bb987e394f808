//! Named network namespaces as bind mounts under the netns run directory,
//! the layout `ip netns` uses.
//!
//! Namespace membership is per thread. Every switch in this module happens
//! on a scoped helper thread that exits afterwards, so the calling thread
//! and any runtime worker never change namespace.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use guestnet_common::constants::DEFAULT_NETNS_DIR;
use guestnet_common::error::{NetError, Result};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, setns, unshare};

use super::NamespaceBackend;

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// [`NamespaceBackend`] over the running kernel.
#[derive(Debug, Clone)]
pub struct KernelNamespaces {
    dir: PathBuf,
}

impl Default for KernelNamespaces {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_NETNS_DIR),
        }
    }
}

impl KernelNamespaces {
    /// Manages namespaces under `/run/netns`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manages namespaces under `dir` instead.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(NetError::config(format!("invalid namespace name {name:?}")));
        }
        Ok(self.dir.join(name))
    }

    fn open(&self, name: &str) -> Result<File> {
        let path = self.path(name)?;
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
}

impl NamespaceBackend for KernelNamespaces {
    fn create(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        if path.exists() {
            tracing::debug!(namespace = %name, "namespace already exists");
            return Ok(());
        }

        fs::create_dir_all(&self.dir).map_err(|e| NetError::io(&self.dir, e))?;
        let _ = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| NetError::io(&path, e))?;

        let created = std::thread::scope(|s| {
            s.spawn(|| -> Result<()> {
                unshare(CloneFlags::CLONE_NEWNET)
                    .map_err(|e| NetError::kernel("unshare network namespace", e))?;
                mount(
                    Some(THREAD_NETNS),
                    &path,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(|e| NetError::kernel(format!("bind namespace {name}"), e))
            })
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        });

        if let Err(e) = created {
            if let Err(rm) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %rm, "failed to remove mount point");
            }
            return Err(e);
        }

        tracing::info!(namespace = %name, "namespace created");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match umount2(&path, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::ENOENT | Errno::EINVAL) => {}
            Err(e) => return Err(NetError::kernel(format!("unmount namespace {name}"), e)),
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(namespace = %name, "namespace deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NetError::io(path, e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name)?.exists())
    }

    fn enter(&self, name: &str, f: &mut (dyn FnMut() -> Result<()> + Send)) -> Result<()> {
        let target = self.open(name)?;

        std::thread::scope(|s| {
            s.spawn(|| -> Result<()> {
                let origin = File::open(THREAD_NETNS).map_err(|e| NetError::io(THREAD_NETNS, e))?;
                setns(&target, CloneFlags::CLONE_NEWNET)
                    .map_err(|e| NetError::kernel(format!("enter namespace {name}"), e))?;
                let _restore = Restore(origin);
                f()
            })
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        })
    }
}

/// Switches the current thread back to the namespace it came from.
struct Restore(File);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.0, CloneFlags::CLONE_NEWNET) {
            tracing::warn!(error = %e, "failed to restore network namespace");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn names_cannot_escape_the_directory() {
        let ns = KernelNamespaces::with_dir("/tmp/does-not-matter");
        for bad in ["", "a/b", "..", "."] {
            assert!(matches!(ns.path(bad), Err(NetError::Config { .. })), "{bad:?}");
        }
    }

    #[test]
    fn missing_namespace_does_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let ns = KernelNamespaces::with_dir(dir.path());
        assert!(!ns.exists("vm1").unwrap());
    }

    #[test]
    fn entering_missing_namespace_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ns = KernelNamespaces::with_dir(dir.path());
        let mut called = false;
        let err = ns
            .enter("vm1", &mut || {
                called = true;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!called);
    }

    #[test]
    fn deleting_missing_namespace_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ns = KernelNamespaces::with_dir(dir.path());
        ns.delete("vm1").unwrap();
    }
}
