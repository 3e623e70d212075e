//! AMS addressing: NetId and NetId + port endpoints.

use crate::error::{AdsError, AdsResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// AMS port of the TwinCAT I/O server.
pub const PORT_IO_SERVER: u16 = 300;
/// AMS port of an EtherCAT master device.
pub const PORT_ETHERCAT_MASTER: u16 = 0xFFFF;
/// AMS port of the first PLC runtime.
pub const PORT_PLC_RUNTIME: u16 = 851;

/// 6-byte logical address of an AMS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NetId(pub [u8; 6]);

impl NetId {
    /// Encoded size in bytes.
    pub const SIZE: usize = 6;

    /// Create a NetId from its six octets.
    #[must_use]
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    /// Raw octets.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parse from the first six bytes of a slice.
    pub fn from_bytes(bytes: &[u8]) -> AdsResult<Self> {
        let octets: [u8; 6] = bytes
            .get(..Self::SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                AdsError::InvalidPayload(format!("NetId needs 6 bytes, got {}", bytes.len()))
            })?;
        Ok(Self(octets))
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}.{b}.{c}.{d}.{e}.{g}")
    }
}

impl FromStr for NetId {
    type Err = AdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != Self::SIZE {
            return Err(AdsError::Config(format!(
                "NetId '{s}' must have 6 dotted octets"
            )));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            *octet = part
                .parse()
                .map_err(|e| AdsError::Config(format!("invalid NetId '{s}': {e}")))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for NetId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Full AMS endpoint: NetId plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AmsAddr {
    /// Endpoint NetId.
    pub net_id: NetId,
    /// AMS port.
    pub port: u16,
}

impl AmsAddr {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Create an endpoint address.
    #[must_use]
    pub const fn new(net_id: NetId, port: u16) -> Self {
        Self { net_id, port }
    }

    /// Same NetId, different port.
    #[must_use]
    pub const fn with_port(self, port: u16) -> Self {
        Self {
            net_id: self.net_id,
            port,
        }
    }

    /// Serialize to the 8-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..6].copy_from_slice(&self.net_id.0);
        bytes[6..].copy_from_slice(&self.port.to_le_bytes());
        bytes
    }

    /// Parse from the 8-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> AdsResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(AdsError::InvalidPayload(format!(
                "AMS address needs 8 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            net_id: NetId::from_bytes(bytes)?,
            port: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

impl fmt::Display for AmsAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net_id, self.port)
    }
}

impl FromStr for AmsAddr {
    type Err = AdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (net_id, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AdsError::Config(format!("AMS address '{s}' must be <netid>:<port>")))?;
        let port = port
            .parse()
            .map_err(|e| AdsError::Config(format!("invalid AMS port in '{s}': {e}")))?;
        Ok(Self::new(net_id.parse()?, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: NetId = "5.12.82.132.1.1".parse().unwrap();
        assert_eq!(id, NetId::new(5, 12, 82, 132, 1, 1));
        assert_eq!(id.to_string(), "5.12.82.132.1.1");
    }

    #[test]
    fn test_parse_rejects_bad_netid() {
        assert!("1.2.3.4.5".parse::<NetId>().is_err());
        assert!("1.2.3.4.5.256".parse::<NetId>().is_err());
        assert!("a.b.c.d.e.f".parse::<NetId>().is_err());
    }

    #[test]
    fn test_ams_addr_wire_form() {
        let addr = AmsAddr::new(NetId::new(10, 0, 0, 1, 1, 1), PORT_IO_SERVER);
        let bytes = addr.to_bytes();
        assert_eq!(&bytes[6..], &[0x2C, 0x01]);
        assert_eq!(AmsAddr::from_bytes(&bytes).unwrap(), addr);
        assert!(AmsAddr::from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn test_ams_addr_from_str() {
        let addr: AmsAddr = "1.2.3.4.1.1:65535".parse().unwrap();
        assert_eq!(addr.port, PORT_ETHERCAT_MASTER);
        assert!("1.2.3.4.1.1".parse::<AmsAddr>().is_err());
    }

    #[test]
    fn test_netid_serde_as_string() {
        let id = NetId::new(192, 168, 1, 10, 1, 1);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"192.168.1.10.1.1\"");
        let back: NetId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
