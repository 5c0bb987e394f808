//! Supervision of helper daemons (`coredns`, `coredhcp`) run as child
//! processes.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::error::{NetError, Result};

/// Locates `binary` on `PATH`.
///
/// # Errors
///
/// Returns [`NetError::NotFound`] when no executable of that name exists.
pub fn find_binary(binary: &str) -> Result<PathBuf> {
    which::which(binary).map_err(|_| NetError::NotFound {
        kind: "binary",
        name: binary.to_owned(),
    })
}

/// A running child process with a once-only stop.
#[derive(Debug)]
pub struct ManagedProcess {
    program: PathBuf,
    pid: u32,
    child: Mutex<Child>,
    stopped: AtomicBool,
    reaped: AtomicBool,
}

impl ManagedProcess {
    /// Spawns `program` with `args`. Standard output is discarded; standard
    /// error is inherited so daemon diagnostics reach the operator.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    pub fn spawn<I, S>(program: &Path, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| NetError::io(program, e))?;
        let pid = child.id();
        tracing::info!(program = %program.display(), pid, "process started");
        Ok(Self {
            program: program.to_path_buf(),
            pid,
            child: Mutex::new(child),
            stopped: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
        })
    }

    /// Operating-system process id.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends SIGTERM and reaps the process. Only the first call acts;
    /// later calls return immediately.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.reaped.load(Ordering::SeqCst) {
            match i32::try_from(self.pid) {
                Ok(raw) => match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => {
                        tracing::warn!(pid = self.pid, error = %e, "failed to signal process");
                    }
                },
                Err(e) => tracing::warn!(pid = self.pid, error = %e, "invalid pid"),
            }
        }
        match self.wait() {
            Ok(status) => {
                tracing::info!(program = %self.program.display(), %status, "process stopped");
            }
            Err(e) => tracing::warn!(error = %e, "failed to reap process"),
        }
    }

    /// Blocks until the process exits. Safe to call repeatedly; later calls
    /// return the recorded status.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the process fails.
    pub fn wait(&self) -> Result<ExitStatus> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let status = child.wait().map_err(|e| NetError::io(&self.program, e))?;
        self.reaped.store(true, Ordering::SeqCst);
        Ok(status)
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn missing_binary_is_not_found() {
        let err = find_binary("guestnet-definitely-missing-binary").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn stop_terminates_and_is_once_only() {
        let Ok(sleep) = find_binary("sleep") else {
            return;
        };
        let process = ManagedProcess::spawn(&sleep, ["30"]).unwrap();
        assert!(process.pid() > 0);
        process.stop();
        assert!(process.is_stopped());
        process.stop();
        assert!(!process.wait().unwrap().success());
    }

    #[test]
    fn wait_reports_exit_status() {
        let Ok(truth) = find_binary("true") else {
            return;
        };
        let process = ManagedProcess::spawn(&truth, std::iter::empty::<&str>()).unwrap();
        assert!(process.wait().unwrap().success());
        process.stop();
        assert!(process.wait().unwrap().success());
    }
}
