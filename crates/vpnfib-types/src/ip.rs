//! IP address and prefix types with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IP address that can be either IPv4 or IPv6.
///
/// Ordering puts every IPv4 address before any IPv6 address, which is the
/// order used when next hops are sorted into a stable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpAddress {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddress {
    /// Returns true if this is an IPv4 address.
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    /// Returns true if this is an IPv6 address.
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, IpAddress::V6(_))
    }

    /// Maximum prefix length for this address family.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            IpAddress::V4(_) => 32,
            IpAddress::V6(_) => 128,
        }
    }

    /// The host route (/32 or /128) covering exactly this address.
    pub fn host_prefix(&self) -> IpPrefix {
        IpPrefix {
            address: *self,
            prefix_len: self.max_prefix_len(),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = if s.contains(':') {
            s.parse::<Ipv6Addr>().map(IpAddress::V6).ok()
        } else {
            s.parse::<Ipv4Addr>().map(IpAddress::V4).ok()
        };
        parsed.ok_or_else(|| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl TryFrom<String> for IpAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpAddress> for String {
    fn from(addr: IpAddress) -> Self {
        addr.to_string()
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(addr)
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(addr)
    }
}

/// An IP network prefix in CIDR notation (e.g., "10.0.0.0/24").
///
/// The address is kept as given; [`IpPrefix::network`] yields the masked
/// form when a canonical network address is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddress,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new prefix, rejecting lengths beyond the address family.
    pub fn new(address: IpAddress, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > address.max_prefix_len() {
            return Err(ParseError::InvalidIpPrefix(format!(
                "{}/{}",
                address, prefix_len
            )));
        }
        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    pub const fn address(&self) -> &IpAddress {
        &self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Returns true for /32 (IPv4) or /128 (IPv6) prefixes.
    pub const fn is_host_route(&self) -> bool {
        self.prefix_len == self.address.max_prefix_len()
    }

    /// Ethertype carried by packets destined to this prefix.
    pub const fn ethertype(&self) -> u16 {
        match self.address {
            IpAddress::V4(_) => 0x0800,
            IpAddress::V6(_) => 0x86dd,
        }
    }

    /// The prefix with all host bits cleared.
    pub fn network(&self) -> IpPrefix {
        let address = match self.address {
            IpAddress::V4(addr) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                IpAddress::V4(Ipv4Addr::from(u32::from(addr) & mask))
            }
            IpAddress::V6(addr) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                IpAddress::V6(Ipv6Addr::from(u128::from(addr) & mask))
            }
        };
        IpPrefix {
            address,
            prefix_len: self.prefix_len,
        }
    }

    /// Directed broadcast address of an IPv4 subnet. `None` for IPv6 and
    /// for /31 and /32 prefixes, which have no broadcast address.
    pub fn broadcast(&self) -> Option<IpAddress> {
        match self.address {
            IpAddress::V4(addr) if self.prefix_len < 31 => {
                let host_bits = u32::MAX >> u32::from(self.prefix_len);
                Some(IpAddress::V4(Ipv4Addr::from(u32::from(addr) | host_bits)))
            }
            _ => None,
        }
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: &IpAddress) -> bool {
        if addr.is_ipv4() != self.is_ipv4() {
            return false;
        }
        let candidate = IpPrefix {
            address: *addr,
            prefix_len: self.prefix_len,
        };
        candidate.network().address == self.network().address
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    /// Accepts "addr/len" or a bare address, which is read as a host route.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addr, len)) = s.rsplit_once('/') else {
            let address: IpAddress = s
                .parse()
                .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
            return Ok(address.host_prefix());
        };

        let address: IpAddress = addr
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_address_family_detection() {
        let v4: IpAddress = "192.168.1.5".parse().unwrap();
        let v6: IpAddress = "2001:db8::1".parse().unwrap();
        assert!(v4.is_ipv4());
        assert!(v6.is_ipv6());
        assert!("300.1.1.1".parse::<IpAddress>().is_err());
    }

    #[test]
    fn test_ipv4_sorts_before_ipv6() {
        let mut addrs: Vec<IpAddress> = vec![
            "2001:db8::1".parse().unwrap(),
            "10.0.2.2".parse().unwrap(),
            "10.0.2.1".parse().unwrap(),
        ];
        addrs.sort();
        let rendered: Vec<String> = addrs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["10.0.2.1", "10.0.2.2", "2001:db8::1"]);
    }

    #[test]
    fn test_prefix_parse_and_display() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert_eq!(prefix.prefix_len(), 24);
        assert_eq!(prefix.to_string(), "10.0.0.0/24");
        assert!(!prefix.is_host_route());
        assert_eq!(prefix.ethertype(), 0x0800);
    }

    #[test]
    fn test_bare_address_is_host_route() {
        let prefix: IpPrefix = "10.0.2.5".parse().unwrap();
        assert_eq!(prefix.to_string(), "10.0.2.5/32");
        assert!(prefix.is_host_route());

        let v6: IpPrefix = "2001:db8::5".parse().unwrap();
        assert_eq!(v6.prefix_len(), 128);
        assert_eq!(v6.ethertype(), 0x86dd);
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/x".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_network_and_broadcast() {
        let prefix: IpPrefix = "10.0.0.77/24".parse().unwrap();
        assert_eq!(prefix.network().to_string(), "10.0.0.0/24");
        assert_eq!(prefix.broadcast().unwrap().to_string(), "10.0.0.255");

        let host: IpPrefix = "10.0.0.1/32".parse().unwrap();
        assert_eq!(host.broadcast(), None);

        let zero: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert_eq!(zero.network().to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_contains() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.contains(&"10.0.0.200".parse().unwrap()));
        assert!(!prefix.contains(&"10.0.1.1".parse().unwrap()));
        assert!(!prefix.contains(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_serde_as_string() {
        let prefix: IpPrefix = "20.0.0.0/24".parse().unwrap();
        let json = serde_json::to_string(&prefix).unwrap();
        assert_eq!(json, "\"20.0.0.0/24\"");
        let back: IpPrefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prefix);
    }
}
