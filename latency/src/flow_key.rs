/*
FaF DNS Latency measures DNS query/response round trip times
Copyright (C) 2022  James Bates

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Identifying tuple for one DNS exchange: IP version, source address, transaction id

use crate::error::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP version of the querying host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn from_u8(version: u8) -> Result<Self> {
        match version {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            other => Err(Error::InvalidKey(format!("unsupported ip_version {}", other))),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    /// Number of raw address bytes a key of this version carries
    pub const fn address_len(self) -> usize {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 16,
        }
    }
}

/// Key of an in-flight DNS query.
///
/// The address is held as a `std::net::IpAddr`, so equality and hashing do not depend on how
/// the capture layer packed it. A v4 key and a v6 key never compare equal, even when the v6
/// address is the v4-mapped form of the v4 one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    addr: IpAddr,
    dns_id: u16,
}

impl FlowKey {
    /// Length of the packed map key: ip_version, pad, dns_id, src_ip4, src_ip6
    pub const MAP_KEY_LEN: usize = 24;

    pub const fn new(addr: IpAddr, dns_id: u16) -> Self {
        Self { addr, dns_id }
    }

    /// Build a key from raw event fields. `addr` holds the address octets in network order.
    pub fn from_raw(ip_version: u8, addr: &[u8], dns_id: u16) -> Result<Self> {
        let version = IpVersion::from_u8(ip_version)?;
        if addr.len() != version.address_len() {
            return Err(Error::InvalidKey(format!(
                "ip_version {} needs a {} byte address, got {} bytes",
                ip_version,
                version.address_len(),
                addr.len()
            )));
        }

        let addr = match version {
            IpVersion::V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(addr);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpVersion::V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(addr);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };

        Ok(Self { addr, dns_id })
    }

    /// Build a v4 key from the packed `src_ip4` form: network order octets read as a little-endian u32
    pub fn from_src_ip4(src_ip4: u32, dns_id: u16) -> Self {
        Self { addr: IpAddr::V4(Ipv4Addr::from(src_ip4.to_le_bytes())), dns_id }
    }

    pub fn ip_version(&self) -> IpVersion {
        match self.addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn dns_id(&self) -> u16 {
        self.dns_id
    }

    /// Packed v4 address, 0 for v6 keys
    pub fn src_ip4(&self) -> u32 {
        match self.addr {
            IpAddr::V4(v4) => u32::from_le_bytes(v4.octets()),
            IpAddr::V6(_) => 0,
        }
    }

    /// Raw v6 address, all zero for v4 keys
    pub fn src_ip6(&self) -> [u8; 16] {
        match self.addr {
            IpAddr::V4(_) => [0; 16],
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Pack into the 24 byte map key layout. The unused address field is zeroed.
    pub fn to_map_key_bytes(&self) -> [u8; Self::MAP_KEY_LEN] {
        let mut bytes = [0u8; Self::MAP_KEY_LEN];
        bytes[0] = self.ip_version().as_u8();
        bytes[2..4].copy_from_slice(&self.dns_id.to_le_bytes());
        match self.addr {
            IpAddr::V4(v4) => bytes[4..8].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => bytes[8..24].copy_from_slice(&v6.octets()),
        }
        bytes
    }

    /// Inverse of [`FlowKey::to_map_key_bytes`]. Non-zero padding or a populated address field
    /// that does not belong to the declared version is rejected rather than guessed at.
    pub fn from_map_key_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::MAP_KEY_LEN {
            return Err(Error::InvalidKey(format!(
                "map key must be {} bytes, got {}",
                Self::MAP_KEY_LEN,
                bytes.len()
            )));
        }
        if bytes[1] != 0 {
            return Err(Error::InvalidKey(format!("non-zero pad byte {:#x}", bytes[1])));
        }

        let dns_id = u16::from_le_bytes([bytes[2], bytes[3]]);
        let (addr, unused) = match IpVersion::from_u8(bytes[0])? {
            IpVersion::V4 => (&bytes[4..8], &bytes[8..24]),
            IpVersion::V6 => (&bytes[8..24], &bytes[4..8]),
        };
        if unused.iter().any(|b| *b != 0) {
            return Err(Error::InvalidKey(format!(
                "ip_version {} key carries data in the other address field",
                bytes[0]
            )));
        }

        Self::from_raw(bytes[0], addr, dns_id)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.dns_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_v4() {
        let key = FlowKey::from_raw(4, &[10, 0, 0, 1], 0x1234).unwrap();
        assert_eq!(key.ip_version(), IpVersion::V4);
        assert_eq!(key.addr(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(key.dns_id(), 0x1234);
        assert_eq!(key.to_string(), "10.0.0.1#4660");
    }

    #[test]
    fn test_from_raw_rejects_bad_version() {
        assert!(matches!(FlowKey::from_raw(5, &[10, 0, 0, 1], 1), Err(Error::InvalidKey(_))));
        assert!(matches!(FlowKey::from_raw(0, &[0; 16], 1), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_from_raw_rejects_length_mismatch() {
        assert!(matches!(FlowKey::from_raw(4, &[0; 16], 1), Err(Error::InvalidKey(_))));
        assert!(matches!(FlowKey::from_raw(6, &[10, 0, 0, 1], 1), Err(Error::InvalidKey(_))));
        assert!(matches!(FlowKey::from_raw(4, &[], 1), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_versions_never_equal() {
        let v4 = FlowKey::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7);
        let mapped = FlowKey::new(IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped()), 7);
        assert_ne!(v4, mapped);

        let zero4 = FlowKey::from_raw(4, &[0; 4], 7).unwrap();
        let zero6 = FlowKey::from_raw(6, &[0; 16], 7).unwrap();
        assert_ne!(zero4, zero6);
    }

    #[test]
    fn test_src_ip4_is_little_endian_packed() {
        let key = FlowKey::from_raw(4, &[10, 0, 0, 1], 1).unwrap();
        // 10.0.0.1 octets read as a little-endian u32
        assert_eq!(key.src_ip4(), 0x0100_000a);
        assert_eq!(FlowKey::from_src_ip4(0x0100_000a, 1), key);
        assert_eq!(key.src_ip6(), [0; 16]);
    }

    #[test]
    fn test_same_key_from_packed_and_octets_hashes_equal() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(FlowKey::from_raw(4, &[192, 168, 1, 100], 53).unwrap());
        set.insert(FlowKey::from_src_ip4(u32::from_le_bytes([192, 168, 1, 100]), 53));
        set.insert(FlowKey::new("192.168.1.100".parse().unwrap(), 53));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_map_key_layout() {
        let key = FlowKey::from_raw(4, &[10, 0, 0, 1], 0x1234).unwrap();
        let bytes = key.to_map_key_bytes();
        assert_eq!(&bytes[..8], &[4, 0, 0x34, 0x12, 10, 0, 0, 1]);
        assert!(bytes[8..].iter().all(|b| *b == 0));
        assert_eq!(FlowKey::from_map_key_bytes(&bytes).unwrap(), key);

        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let key = FlowKey::new(IpAddr::V6(v6), 0xbeef);
        let bytes = key.to_map_key_bytes();
        assert_eq!(bytes[0], 6);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..], &v6.octets());
        assert_eq!(FlowKey::from_map_key_bytes(&bytes).unwrap(), key);
    }

    #[test]
    fn test_map_key_rejects_deviations() {
        let good = FlowKey::from_raw(4, &[10, 0, 0, 1], 1).unwrap().to_map_key_bytes();

        assert!(matches!(FlowKey::from_map_key_bytes(&good[..20]), Err(Error::InvalidKey(_))));

        let mut padded = good;
        padded[1] = 1;
        assert!(matches!(FlowKey::from_map_key_bytes(&padded), Err(Error::InvalidKey(_))));

        let mut stray_v6 = good;
        stray_v6[20] = 0xff;
        assert!(matches!(FlowKey::from_map_key_bytes(&stray_v6), Err(Error::InvalidKey(_))));

        let mut bad_version = good;
        bad_version[0] = 7;
        assert!(matches!(FlowKey::from_map_key_bytes(&bad_version), Err(Error::InvalidKey(_))));
    }
}
