//! 48-bit hardware addresses — the main identifier on the gossip fabric.
//!
//! Mesh tooling is sloppy about MAC formatting, so the parser accepts any
//! mix of colons, dashes, or no separators at all, upper or lower case.
//! Exactly twelve hex digits must remain after stripping separators.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::{Serialize, Serializer};

/// A 48-bit hardware (MAC) address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddr(pub [u8; 6]);

/// The all-zero "unset" sentinel. Stream clients push records with this
/// source to have the daemon substitute its own address.
pub const UNSET_ADDR: HardwareAddr = HardwareAddr([0; 6]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse hardware address from {0:?}")]
pub struct ParseHwAddrError(pub String);

impl HardwareAddr {
    /// True for the six-zero-bytes sentinel.
    pub fn is_unset(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Build from a six-byte wire field.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = b.try_into().ok()?;
        Some(HardwareAddr(bytes))
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for HardwareAddr {
    type Err = ParseHwAddrError;

    // Collect hex digits, skip everything else. 12 digits or bust.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut n = 0usize;
        for c in s.bytes() {
            let v = match c {
                b'0'..=b'9' => c - b'0',
                b'A'..=b'F' => c - b'A' + 0xa,
                b'a'..=b'f' => c - b'a' + 0xa,
                _ => continue,
            };
            if n >= 12 {
                return Err(ParseHwAddrError(s.to_string()));
            }
            if n % 2 == 0 {
                addr[n >> 1] = v << 4;
            } else {
                addr[n >> 1] += v;
            }
            n += 1;
        }
        if n == 12 {
            Ok(HardwareAddr(addr))
        } else {
            Err(ParseHwAddrError(s.to_string()))
        }
    }
}

impl From<[u8; 6]> for HardwareAddr {
    fn from(b: [u8; 6]) -> Self {
        HardwareAddr(b)
    }
}

impl Serialize for HardwareAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HwAddrVisitor;

        impl Visitor<'_> for HwAddrVisitor {
            type Value = HardwareAddr;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hardware address string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(HwAddrVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_separator_styles() {
        let expected = HardwareAddr([0x02, 0xca, 0xfe, 0x00, 0xba, 0xbe]);
        for s in [
            "02:ca:fe:00:ba:be",
            "02-ca-fe-00-ba-be",
            "02cafe00babe",
            "02:CA:FE:00:BA:BE",
            "02CAFE00BABE",
        ] {
            assert_eq!(s.parse::<HardwareAddr>().unwrap(), expected, "input {s}");
        }
    }

    #[test]
    fn parse_rejects_wrong_digit_counts() {
        assert!("02:ca:fe:00:ba:b".parse::<HardwareAddr>().is_err());
        assert!("02cafe00bab".parse::<HardwareAddr>().is_err());
        assert!("02cafe00babe0".parse::<HardwareAddr>().is_err());
        assert!("".parse::<HardwareAddr>().is_err());
        assert!("zz:zz:zz:zz:zz:zz".parse::<HardwareAddr>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let addr = HardwareAddr([0xde, 0xad, 0xbe, 0xef, 0x12, 0x34]);
        assert_eq!(addr.to_string(), "de:ad:be:ef:12:34");
        assert_eq!(addr.to_string().parse::<HardwareAddr>().unwrap(), addr);
    }

    #[test]
    fn unset_sentinel() {
        assert!(UNSET_ADDR.is_unset());
        assert!(!HardwareAddr([0, 0, 0, 0, 0, 1]).is_unset());
    }

    #[test]
    fn serde_uses_string_form() {
        let addr = HardwareAddr([0x02, 0xca, 0xfe, 0x00, 0xba, 0xbe]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"02:ca:fe:00:ba:be\"");
        let back: HardwareAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
