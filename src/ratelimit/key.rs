//! Client key derivation.

use std::net::{IpAddr, Ipv6Addr};

use super::exchange::Request;

/// Default IPv6 prefix length used to group addresses into one client.
pub const DEFAULT_IPV6_SUBNET: u8 = 56;

/// Derive a client key from an IP address.
///
/// IPv6 addresses are collapsed to their network prefix of `ipv6_subnet`
/// bits and rendered in CIDR notation, since a single client usually owns a
/// whole range. IPv4 addresses (including IPv4-mapped IPv6 ones), unparsable
/// input, and any address when `ipv6_subnet` is `None` are returned as-is.
pub fn ip_key(ip: &str, ipv6_subnet: Option<u8>) -> String {
    let Some(prefix) = ipv6_subnet else {
        return ip.to_string();
    };

    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(addr)) if addr.to_ipv4_mapped().is_none() => {
            format!("{}/{}", network_prefix(addr, prefix), prefix)
        }
        _ => ip.to_string(),
    }
}

/// Zero every bit of `addr` past the first `prefix` bits.
fn network_prefix(addr: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    let prefix = u32::from(prefix.min(128));
    let mask = match prefix {
        0 => 0,
        bits => u128::MAX << (128 - bits),
    };
    Ipv6Addr::from(u128::from(addr) & mask)
}

/// Key used by the default key generator.
///
/// A request without a client address maps to the empty key; the `ip`
/// validation check reports it on the first request.
pub(crate) fn default_key(request: &Request, ipv6_subnet: Option<u8>) -> String {
    request
        .client_ip
        .as_deref()
        .map(|ip| ip_key(ip, ipv6_subnet))
        .unwrap_or_default()
}
