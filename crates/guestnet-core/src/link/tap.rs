//! Persistent tap devices through `/dev/net/tun`.
#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use guestnet_common::constants::MAX_IFNAME_LEN;
use guestnet_common::error::{NetError, Result};
use nix::errno::Errno;

const TUN_DEVICE: &str = "/dev/net/tun";

nix::ioctl_write_int!(tun_set_iff, b'T', 202);
nix::ioctl_write_int!(tun_set_persist, b'T', 203);

/// `struct ifreq` as `TUNSETIFF` reads it: name, flags, then the unused
/// remainder of the union.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn tap(name: &str) -> Self {
        let mut req = Self {
            name: [0; libc::IFNAMSIZ],
            #[allow(clippy::cast_possible_truncation)]
            flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        req
    }
}

/// Creates a tap device that outlives the file descriptor used to create it.
///
/// # Errors
///
/// Returns [`NetError::Config`] for an invalid name, [`NetError::AlreadyExists`]
/// when a tap of that name is held open elsewhere, and a kernel error
/// otherwise.
pub(crate) fn create_persistent_tap(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(NetError::config(format!(
            "tap name {name:?} must be 1 to {MAX_IFNAME_LEN} bytes"
        )));
    }

    let tun = OpenOptions::new()
        .read(true)
        .write(true)
        .open(TUN_DEVICE)
        .map_err(|e| NetError::io(TUN_DEVICE, e))?;
    let req = IfReq::tap(name);

    // SAFETY: `tun` is an open descriptor for the tun control device and
    // `req` is a properly laid out ifreq that lives across the call.
    let _ = unsafe { tun_set_iff(tun.as_raw_fd(), std::ptr::addr_of!(req) as libc::c_ulong) }
        .map_err(|e| match e {
            Errno::EBUSY => NetError::AlreadyExists {
                kind: "link",
                name: name.to_owned(),
            },
            e => NetError::kernel(format!("create tap {name}"), e),
        })?;

    // SAFETY: same descriptor, now bound to the tap; the argument is a plain
    // integer flag.
    let _ = unsafe { tun_set_persist(tun.as_raw_fd(), 1) }
        .map_err(|e| NetError::kernel(format!("make tap {name} persistent"), e))?;

    tracing::debug!(tap = %name, "persistent tap created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    #[test]
    fn name_is_nul_terminated() {
        let req = IfReq::tap("tap0");
        assert_eq!(req.name[3], b'0' as libc::c_char);
        assert_eq!(req.name[4], 0);
    }

    #[test]
    fn overlong_name_is_rejected_before_open() {
        let err = create_persistent_tap("a-very-long-tap-name").unwrap_err();
        assert!(matches!(err, NetError::Config { .. }));
    }
}
