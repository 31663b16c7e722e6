//! 128-bit unique identifiers for items and classes
//!
//! The external form is base-58 (Bitcoin alphabet) left-padded with the zero
//! digit `1` to a fixed 22 characters, so every uid prints at the same width.
//! Ordering is unsigned big-endian, which is also how SQLite compares the
//! 16-byte BLOB column form.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::storage::error::StoreError;

/// Length of the padded base-58 form
pub const UID_STRING_LEN: usize = 22;

/// Number of bytes in a uid
pub const UID_LEN: usize = 16;

/// A 128-bit unique identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uid(u128);

impl Uid {
    /// The all-zero uid
    pub const NIL: Uid = Uid(0);

    /// Create a random uid
    pub fn new() -> Self {
        Self::from_bytes(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Create a uid from its big-endian byte form
    pub const fn from_bytes(bytes: [u8; UID_LEN]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    /// Create a uid from a numeric value
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Parse from a byte slice (as read from a BLOB column)
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        let bytes: [u8; UID_LEN] = bytes
            .try_into()
            .map_err(|_| StoreError::InvalidUid(format!("expected 16 bytes, got {}", bytes.len())))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Big-endian byte form
    pub const fn to_bytes(self) -> [u8; UID_LEN] {
        self.0.to_be_bytes()
    }

    /// Numeric value
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Encode as padded base-58
    pub fn to_bs58(self) -> String {
        let encoded = bs58::encode(self.to_bytes()).into_string();
        let mut out = String::with_capacity(UID_STRING_LEN);
        for _ in encoded.len()..UID_STRING_LEN {
            out.push('1');
        }
        out.push_str(&encoded);
        out
    }

    /// Decode from padded (or unpadded) base-58
    pub fn from_bs58(s: &str) -> Result<Self, StoreError> {
        if s.is_empty() || s.len() > UID_STRING_LEN {
            return Err(StoreError::InvalidUid(format!(
                "'{}' is not 1..={} base-58 characters",
                s, UID_STRING_LEN
            )));
        }
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| StoreError::InvalidUid(format!("'{}': {}", s, e)))?;

        let significant: &[u8] = match decoded.iter().position(|&b| b != 0) {
            Some(first) => &decoded[first..],
            None => &[],
        };
        if significant.len() > UID_LEN {
            return Err(StoreError::InvalidUid(format!("'{}' exceeds 128 bits", s)));
        }

        let mut bytes = [0u8; UID_LEN];
        bytes[UID_LEN - significant.len()..].copy_from_slice(significant);
        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bs58())
    }
}

impl FromStr for Uid {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bs58(s)
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_bs58())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uid::from_bs58(&s).map_err(serde::de::Error::custom)
    }
}

impl ToSql for Uid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_bytes().to_vec()))
    }
}

impl FromSql for Uid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let blob = value.as_blob()?;
        let bytes: [u8; UID_LEN] = blob.try_into().map_err(|_| FromSqlError::InvalidBlobSize {
            expected_size: UID_LEN,
            blob_size: blob.len(),
        })?;
        Ok(Self::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_length_is_fixed() {
        for uid in [
            Uid::NIL,
            Uid::from_u128(1),
            Uid::from_u128(57),
            Uid::from_u128(58),
            Uid::from_u128(u128::MAX),
            Uid::new(),
        ] {
            let s = uid.to_bs58();
            assert_eq!(s.len(), UID_STRING_LEN, "{:?}", uid);
            assert_eq!(Uid::from_bs58(&s).unwrap(), uid);
        }
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(Uid::NIL.to_bs58(), "1".repeat(22));
        assert_eq!(Uid::from_u128(1).to_bs58(), format!("{}2", "1".repeat(21)));
    }

    #[test]
    fn test_unpadded_input_accepted() {
        assert_eq!(Uid::from_bs58("2").unwrap(), Uid::from_u128(1));
    }

    #[test]
    fn test_invalid_input() {
        assert!(Uid::from_bs58("").is_err());
        assert!(Uid::from_bs58("0OIl").is_err());
        assert!(Uid::from_bs58(&"z".repeat(23)).is_err());
        // 22 'z' digits exceed 2^128
        assert!(Uid::from_bs58(&"z".repeat(22)).is_err());
    }

    #[test]
    fn test_ordering_is_big_endian_unsigned() {
        let low = Uid::from_bytes([0x00; 16]);
        let mut high_bytes = [0x00; 16];
        high_bytes[0] = 0x80;
        let high = Uid::from_bytes(high_bytes);
        let mut mid_bytes = [0xFF; 16];
        mid_bytes[0] = 0x7F;
        let mid = Uid::from_bytes(mid_bytes);

        assert!(low < mid);
        assert!(mid < high);
        assert_eq!(high.to_bytes().cmp(&mid.to_bytes()), high.cmp(&mid));
    }

    #[test]
    fn test_slice_round_trip() {
        let uid = Uid::new();
        assert_eq!(Uid::from_slice(&uid.to_bytes()).unwrap(), uid);
        assert!(Uid::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_serde_uses_bs58() {
        let uid = Uid::from_u128(1);
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, format!("\"{}2\"", "1".repeat(21)));
        let back: Uid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uid);
    }

    #[test]
    fn test_sqlite_blob_order_matches() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (uid BLOB NOT NULL)").unwrap();
        let uids = [
            Uid::from_u128(u128::MAX),
            Uid::from_u128(1),
            Uid::from_u128(1 << 127),
            Uid::NIL,
        ];
        for uid in &uids {
            conn.execute("INSERT INTO t (uid) VALUES (?)", [uid]).unwrap();
        }

        let stored: Vec<Uid> = conn
            .prepare("SELECT uid FROM t ORDER BY uid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let mut expected = uids.to_vec();
        expected.sort();
        assert_eq!(stored, expected);
    }
}
