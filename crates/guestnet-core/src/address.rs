//! IPv4 address helpers shared by the bridge builder and the DHCP
//! configuration.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::Ipv4Network;

/// Returns the address right after the network base, or `None` when the
/// network has no room for it (`/32`, or overflow past `255.255.255.255`).
///
/// A `/31` yields its second address.
pub fn first_usable_address(network: Ipv4Network) -> Option<Ipv4Addr> {
    let base = u32::from(network.network());
    let candidate = Ipv4Addr::from(base.checked_add(1)?);
    network.contains(candidate).then_some(candidate)
}

/// Whether `start..=end` is an ascending IPv4 range inside `network`.
///
/// Any IPv6 input is rejected.
pub fn is_valid_range(start: IpAddr, end: IpAddr, network: Ipv4Network) -> bool {
    let (IpAddr::V4(start), IpAddr::V4(end)) = (start, end) else {
        return false;
    };
    network.contains(start) && network.contains(end) && u32::from(end) > u32::from(start)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn first_usable_in_common_subnets() {
        assert_eq!(
            first_usable_address(net("192.168.1.0/24")),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(
            first_usable_address(net("10.0.0.0/30")),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn first_usable_ignores_host_bits() {
        assert_eq!(
            first_usable_address(net("172.16.5.77/16")),
            Some(Ipv4Addr::new(172, 16, 0, 1))
        );
    }

    #[test]
    fn point_to_point_yields_second_address() {
        assert_eq!(
            first_usable_address(net("10.0.0.0/31")),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn single_host_networks_have_no_usable_address() {
        assert_eq!(first_usable_address(net("0.0.0.0/32")), None);
        assert_eq!(first_usable_address(net("255.255.255.255/32")), None);
    }

    #[test]
    fn result_always_inside_network() {
        for cidr in ["10.1.2.0/24", "10.1.2.128/25", "100.64.0.0/10", "0.0.0.0/0"] {
            let network = net(cidr);
            let first = first_usable_address(network).unwrap();
            assert!(network.contains(first), "{first} outside {cidr}");
        }
    }

    #[test]
    fn ascending_range_inside_network_is_valid() {
        let network = net("192.168.1.0/24");
        assert!(is_valid_range(ip("192.168.1.10"), ip("192.168.1.20"), network));
    }

    #[test]
    fn descending_or_empty_range_is_invalid() {
        let network = net("192.168.1.0/24");
        assert!(!is_valid_range(ip("192.168.1.20"), ip("192.168.1.10"), network));
        assert!(!is_valid_range(ip("192.168.1.10"), ip("192.168.1.10"), network));
    }

    #[test]
    fn endpoints_outside_network_are_invalid() {
        let network = net("192.168.1.0/24");
        assert!(!is_valid_range(ip("192.168.0.10"), ip("192.168.1.20"), network));
        assert!(!is_valid_range(ip("192.168.1.10"), ip("192.168.2.1"), network));
    }

    #[test]
    fn ipv6_endpoints_are_invalid() {
        let network = net("192.168.1.0/24");
        assert!(!is_valid_range(ip("::1"), ip("192.168.1.20"), network));
        assert!(!is_valid_range(ip("192.168.1.10"), ip("fe80::1"), network));
    }
}
