//! Core key types for versiondb.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;

/// Value type indicator in internal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Deletion marker (tombstone).
    Deletion = 0,
    /// Normal value.
    Value = 1,
}

/// Value type used when constructing seek targets. Since value types are
/// the low byte of the packed tail and sort in decreasing order for the
/// same (user key, sequence), the highest-numbered type sorts first.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        matches!(self, ValueType::Deletion)
    }
}

/// Internal key format used for storage.
///
/// An internal key combines:
/// - User key (the key provided by the user)
/// - Sequence number (56 bits)
/// - Value type (Value or Deletion)
///
/// Encoded format:
/// ```text
/// [user_key][packed (8 bytes, big-endian): sequence << 8 | value_type]
/// ```
///
/// Ordering: ascending user key; among equal user keys, descending
/// (sequence, type) so that newer records sort first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    /// The user-provided key.
    user_key: Bytes,
    /// Sequence number.
    sequence: u64,
    /// Value type.
    value_type: ValueType,
}

impl InternalKey {
    /// Maximum sequence number (56 bits).
    pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

    /// Create a new internal key.
    pub fn new(user_key: impl Into<Bytes>, sequence: u64, value_type: ValueType) -> Self {
        debug_assert!(sequence <= Self::MAX_SEQUENCE);
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    /// Create an internal key for a stored value.
    pub fn for_value(user_key: impl Into<Bytes>, sequence: u64) -> Self {
        Self::new(user_key, sequence, ValueType::Value)
    }

    /// Create an internal key for a deletion marker.
    pub fn for_deletion(user_key: impl Into<Bytes>, sequence: u64) -> Self {
        Self::new(user_key, sequence, ValueType::Deletion)
    }

    /// Create the key that sorts before every entry for `user_key` at or
    /// below `sequence`.
    pub fn for_seek(user_key: impl Into<Bytes>, sequence: u64) -> Self {
        Self::new(user_key, sequence, VALUE_TYPE_FOR_SEEK)
    }

    /// Get the user key.
    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    /// Get the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Get the value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        self.value_type.is_deletion()
    }

    /// Encode the internal key to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.user_key.len() + 8);
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Encode into an existing buffer.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.user_key);
        let packed = (self.sequence << 8) | (self.value_type.to_byte() as u64);
        buf.put_u64(packed);
    }

    /// Decode an internal key from bytes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }

        let user_key_len = data.len() - 8;
        let user_key = Bytes::copy_from_slice(&data[..user_key_len]);

        let mut packed_bytes = &data[user_key_len..];
        let packed = packed_bytes.get_u64();

        let value_type = ValueType::from_byte((packed & 0xFF) as u8)?;
        let sequence = packed >> 8;

        Some(Self {
            user_key,
            sequence,
            value_type,
        })
    }

    /// Get the encoded length.
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + 8
    }

    /// Extract the user key portion from an encoded internal key.
    pub fn parse_user_key(encoded: &[u8]) -> Option<&[u8]> {
        if encoded.len() < 8 {
            return None;
        }
        Some(&encoded[..encoded.len() - 8])
    }

    /// Extract the sequence number from an encoded internal key.
    pub fn parse_sequence(encoded: &[u8]) -> Option<u64> {
        if encoded.len() < 8 {
            return None;
        }
        let packed_bytes = &encoded[encoded.len() - 8..];
        let packed = u64::from_be_bytes(packed_bytes.try_into().ok()?);
        Some(packed >> 8)
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            Ordering::Equal => {
                // For the same user key, newer entries sort first.
                let a = (self.sequence << 8) | self.value_type.to_byte() as u64;
                let b = (other.sequence << 8) | other.value_type.to_byte() as u64;
                b.cmp(&a)
            }
            ord => ord,
        }
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' @ {} : {}",
            String::from_utf8_lossy(&self.user_key),
            self.sequence,
            self.value_type.to_byte()
        )
    }
}

/// A key prepared for point lookups: a user key bound to the snapshot
/// sequence the reader captured at open time.
#[derive(Debug, Clone)]
pub struct LookupKey {
    user_key: Bytes,
    internal_key: Bytes,
}

impl LookupKey {
    /// Create a lookup key for `user_key` at snapshot `sequence`.
    pub fn new(user_key: impl Into<Bytes>, sequence: u64) -> Self {
        let user_key = user_key.into();
        let internal_key =
            InternalKey::for_seek(user_key.clone(), sequence.min(InternalKey::MAX_SEQUENCE))
                .encode();
        Self {
            user_key,
            internal_key,
        }
    }

    /// The raw user key.
    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    /// The encoded internal key used as the seek target.
    pub fn internal_key(&self) -> &[u8] {
        &self.internal_key
    }
}

/// Options controlling a point read.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Verify table checksums while reading.
    pub verify_checksums: bool,
    /// Copy at most this many value bytes into the result.
    pub limit: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            limit: usize::MAX,
        }
    }
}
