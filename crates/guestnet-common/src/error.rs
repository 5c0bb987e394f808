//! Unified error types for the guestnet workspace.
//!
//! Callers distinguish failures by variant, never by message text:
//! [`NetError::is_already_exists`] and [`NetError::is_not_found`] look through
//! [`NetError::Context`] wrappers so annotated errors keep their kind.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum NetError {
    /// A configuration value is missing or invalid. Raised before any
    /// kernel state is touched.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A kernel object with the requested name is already present.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Type of the existing object (link, table, chain, namespace).
        kind: &'static str,
        /// Name of the existing object.
        name: String,
    },

    /// A named kernel object is missing.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Type of the missing object.
        kind: &'static str,
        /// Name of the missing object.
        name: String,
    },

    /// Any other kernel call failed.
    #[error("{operation} failed: {message}")]
    Kernel {
        /// Operation that was attempted.
        operation: String,
        /// Message reported by the kernel or the tool driving it.
        message: String,
    },

    /// An error annotated with the step that produced it.
    #[error("{context}: {source}")]
    Context {
        /// Step being performed when the error occurred.
        context: String,
        /// Underlying error.
        source: Box<NetError>,
    },

    /// Cleanup after a failure also failed. Both causes are kept.
    #[error("{primary}, {rollback}")]
    Rollback {
        /// The failure that triggered the rollback.
        primary: Box<NetError>,
        /// The failure raised while undoing earlier steps.
        rollback: Box<NetError>,
    },

    /// The IPv4 routing table holds no default route.
    #[error("network disconnected: no default route")]
    NoDefaultRoute,

    /// A background watch ended, either cancelled or because its event
    /// source closed.
    #[error("watch terminated: {reason}")]
    WatchTerminated {
        /// Why the watch ended.
        reason: String,
    },

    /// A DNS upstream failed to answer a query.
    #[error("upstream {upstream}: {message}")]
    Upstream {
        /// Address of the upstream resolver.
        upstream: String,
        /// What went wrong.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Several independent steps failed.
    #[error("{0}")]
    Multiple(ErrorList),

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl NetError {
    /// Builds a [`NetError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Builds a [`NetError::Kernel`] from any displayable cause.
    pub fn kernel(operation: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::Kernel {
            operation: operation.into(),
            message: cause.to_string(),
        }
    }

    /// Builds a [`NetError::Upstream`].
    pub fn upstream(upstream: impl fmt::Display, cause: impl fmt::Display) -> Self {
        Self::Upstream {
            upstream: upstream.to_string(),
            message: cause.to_string(),
        }
    }

    /// Builds a [`NetError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps this error with the step that produced it.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Joins a primary failure with the failure of its cleanup.
    #[must_use]
    pub fn with_rollback(self, rollback: Self) -> Self {
        Self::Rollback {
            primary: Box::new(self),
            rollback: Box::new(rollback),
        }
    }

    /// Returns `true` when the kernel reported an existing object.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::Context { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }

    /// Returns `true` when the kernel reported a missing object.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Aggregate of independent failures, collected while every step of a
/// cleanup is attempted.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<NetError>);

impl ErrorList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Records a failure.
    pub fn push(&mut self, error: NetError) {
        self.0.push(error);
    }

    /// Records the error of `result`, if any.
    pub fn record<T>(&mut self, result: Result<T>) {
        if let Err(e) = result {
            self.0.push(e);
        }
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over recorded failures in the order they happened.
    pub fn iter(&self) -> std::slice::Iter<'_, NetError> {
        self.0.iter()
    }

    /// `Ok` when empty, the sole error when there is one, and
    /// [`NetError::Multiple`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns the recorded failures, if any.
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(NetError::Multiple(self)),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl FromIterator<NetError> for ErrorList {
    fn from_iter<I: IntoIterator<Item = NetError>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ErrorList {
    type Item = NetError;
    type IntoIter = std::vec::IntoIter<NetError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ErrorList {
    type Item = &'a NetError;
    type IntoIter = std::slice::Iter<'a, NetError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_context() {
        let err = NetError::AlreadyExists {
            kind: "link",
            name: "br0".into(),
        }
        .context("failed to add bridge br0");
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "failed to add bridge br0: link br0 already exists");
    }

    #[test]
    fn rollback_reports_both_causes() {
        let primary = NetError::kernel("bring up", "device busy").context("failed to bring bridge br0 up");
        let cleanup = NetError::kernel("delete link", "permission denied").context("failed to delete link");
        let msg = primary.with_rollback(cleanup).to_string();
        assert_eq!(
            msg,
            "failed to bring bridge br0 up: bring up failed: device busy, \
             failed to delete link: delete link failed: permission denied"
        );
    }

    #[test]
    fn empty_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn single_error_is_unwrapped() {
        let mut list = ErrorList::new();
        list.push(NetError::NoDefaultRoute);
        assert!(matches!(list.into_result(), Err(NetError::NoDefaultRoute)));
    }

    #[test]
    fn multiple_errors_are_counted() {
        let mut list = ErrorList::new();
        list.record::<()>(Err(NetError::config("a")));
        list.record(Ok(1));
        list.record::<()>(Err(NetError::NoDefaultRoute));
        assert_eq!(list.len(), 2);

        let Err(NetError::Multiple(list)) = list.into_result() else {
            unreachable!("expected an aggregate");
        };
        assert!(list.iter().any(|e| matches!(e, NetError::NoDefaultRoute)));
        assert!(list.to_string().contains("; "));
    }
}
