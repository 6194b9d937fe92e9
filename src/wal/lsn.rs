// ABOUTME: Log sequence number type for positions in the PostgreSQL WAL
// ABOUTME: Totally ordered, displayed and serialized in the server's X/Y hex form

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A byte position in the write-ahead log.
///
/// Displayed as `X/Y` where X is the upper 32 bits and Y the lower 32 bits,
/// both hexadecimal, matching `pg_current_wal_lsn()` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Bytes between `other` and `self`, zero if `other` is ahead.
    pub const fn distance_from(self, other: Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN '{0}' (expected X/Y hex form)")]
pub struct LsnParseError(String);

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| LsnParseError(s.to_string()))?;
        let high = u32::from_str_radix(high, 16).map_err(|_| LsnParseError(s.to_string()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| LsnParseError(s.to_string()))?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.as_u64(), 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::ZERO);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("12345".parse::<Lsn>().is_err());
        assert!("G/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let lsn = Lsn::new(0x1_0000_0010);
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"1/10\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }

    #[test]
    fn test_distance() {
        assert_eq!(Lsn::new(100).distance_from(Lsn::new(40)), 60);
        assert_eq!(Lsn::new(40).distance_from(Lsn::new(100)), 0);
    }
}
