use std::fmt;
use std::str::FromStr;

use hex::FromHex;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const LEN: usize = 32;

/// 32-byte BLAKE3 digest naming a stored object.
///
/// Blobs, chunks, trees and commits are all keyed by an `ObjectId`; the
/// hashing context that produced it lives in `ledgit-crypto`. On the wire
/// and in metadata files it is a 64-character lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; LEN]);

impl ObjectId {
    /// Plain BLAKE3 of `data`, with no hashing context.
    ///
    /// Legacy object keys were derived this way.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub const fn from_hash(digest: [u8; LEN]) -> Self {
        Self(digest)
    }

    /// All zeros; never the id of stored content.
    pub const fn null() -> Self {
        Self([0; LEN])
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes as hex, for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        <[u8; LEN]>::from_hex(s).map(Self).map_err(|e| match e {
            hex::FromHexError::InvalidStringLength if s.len() % 2 == 0 => TypeError::InvalidLength {
                expected: LEN,
                actual: s.len() / 2,
            },
            other => TypeError::InvalidHex(other.to_string()),
        })
    }

    /// Directory shard for on-disk layouts: the first byte as two hex digits.
    pub fn fanout(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectId").field(&format_args!("{}", self.short_hex())).finish()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}
