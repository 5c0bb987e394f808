//! Lease engine abstraction and the server handle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use guestnet_common::error::Result;

use crate::config::DhcpConfig;

/// A running lease engine.
pub trait LeaseServer: Send + Sync {
    /// Closes the engine's sockets.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine could not be told to close.
    fn close(&self) -> Result<()>;

    /// Blocks until the engine has shut down.
    ///
    /// # Errors
    ///
    /// Returns the engine's terminal error, if any.
    fn wait(&self) -> Result<()>;
}

/// Starts lease engines from a validated configuration.
pub trait LeaseEngine: Send + Sync {
    /// Starts serving leases.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot start.
    fn start(&self, config: &DhcpConfig) -> Result<Box<dyn LeaseServer>>;
}

/// Handle on a running DHCP server.
pub struct DhcpServer {
    server: Box<dyn LeaseServer>,
    lease_file: PathBuf,
    stopped: AtomicBool,
}

impl std::fmt::Debug for DhcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpServer")
            .field("lease_file", &self.lease_file)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl DhcpServer {
    /// Validates `config` and starts `engine` with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the engine fails
    /// to start.
    pub fn start(config: &DhcpConfig, engine: &dyn LeaseEngine) -> Result<Self> {
        config.validate()?;
        let server = engine
            .start(config)
            .map_err(|e| e.context("failed to start DHCP server"))?;
        tracing::info!(
            router = ?config.router(),
            lease_file = %config.lease_file_path().display(),
            "DHCP server started"
        );
        Ok(Self {
            server,
            lease_file: config.lease_file_path().to_path_buf(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Lease database path, removed on stop.
    pub fn lease_file(&self) -> &Path {
        &self.lease_file
    }

    /// Closes the engine, waits for it and removes the lease file. Only
    /// the first call acts; failures are logged.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping DHCP server");
        if let Err(e) = self.server.close() {
            tracing::warn!(error = %e, "failed to close DHCP server");
        }
        if let Err(e) = self.server.wait() {
            tracing::warn!(error = %e, "DHCP server error");
        }
        if let Err(e) = std::fs::remove_file(&self.lease_file) {
            tracing::warn!(
                path = %self.lease_file.display(),
                error = %e,
                "failed to remove lease file"
            );
        }
    }

    /// Blocks until the engine exits.
    ///
    /// # Errors
    ///
    /// Returns the engine's terminal error, if any.
    pub fn wait(&self) -> Result<()> {
        self.server.wait()
    }
}

impl Drop for DhcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
