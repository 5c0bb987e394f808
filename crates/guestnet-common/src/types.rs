//! Domain primitive types used across the guestnet workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// Kind of kernel network link created by the link manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Layer-2 software switch.
    Bridge,
    /// Persistent tap device handing raw frames to user space.
    Tap,
    /// Virtual cable. The link itself is one end, `peer` the other.
    Veth {
        /// Name of the other end.
        peer: String,
        /// Named namespace the peer end is moved into on creation.
        peer_namespace: Option<String>,
    },
}

impl LinkKind {
    /// Short name of the kind, as the kernel spells it.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Tap => "tap",
            Self::Veth { .. } => "veth",
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Administrative state of a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Link is administratively down.
    #[default]
    Down,
    /// Link is administratively up.
    Up,
}

/// Transport protocol, used by port-match firewall rules and to pick the
/// DNS upstream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Transmission Control Protocol.
    Tcp,
    /// User Datagram Protocol.
    Udp,
}

impl Protocol {
    /// Lower-case protocol name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(NetError::config(format!("unsupported protocol: {other}"))),
        }
    }
}

/// Lifecycle state of a namespaced network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkState {
    /// Namespace, veth pair and in-namespace topology are being built.
    Provisioning,
    /// Every resource exists; the handle may be used.
    Ready,
    /// Resources were released.
    Destroyed,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}
