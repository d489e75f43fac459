use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// A 32-byte SHA-256 digest used throughout shoal, for file identities,
/// chunk checksums and room message ids.
///
/// On the wire (all shoal protocols are JSON) it's a lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id32(pub [u8; 32]);

impl Id32 {
    pub fn new(from: [u8; 32]) -> Id32 {
        Id32(from)
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<Self> {
        let mut v = [0u8; 32];
        if b.len() != 32 {
            anyhow::bail!("buffer length must be 32, but it's {}", b.len());
        }
        v.copy_from_slice(b);
        Ok(Id32(v))
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Id32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Id32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl FromStr for Id32 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        if s.len() != 64 {
            anyhow::bail!("expected a hex string of length 64, got {}", s.len());
        }
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id32(out))
    }
}

impl Serialize for Id32 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for Id32 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Id32Visitor;

        impl<'de> serde::de::Visitor<'de> for Id32Visitor {
            type Value = Id32;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a 64-character hex string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Id32::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(Id32Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let s = "06f04cc728bef957a658876ef807f0514e4d715392969998efef584d2c3e435e";
        let id = Id32::from_str(s).unwrap();
        assert_eq!(id.as_string(), s);
    }

    #[test]
    fn test_serde_is_hex_string() {
        let id = Id32::new([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: Id32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(Id32::from_str("abcd").is_err());
        assert!(serde_json::from_str::<Id32>("\"abcd\"").is_err());
    }
}
