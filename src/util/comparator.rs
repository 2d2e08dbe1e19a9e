//! Key comparison utilities.

use std::cmp::Ordering;

/// Trait for comparing user keys.
pub trait Comparator: Send + Sync {
    /// Compare two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Get the name of this comparator. Recorded in the manifest and
    /// checked on recovery; changing the ordering without changing the
    /// name corrupts the database.
    fn name(&self) -> &str;
}

/// Default bytewise comparator (lexicographic ordering).
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl BytewiseComparator {
    /// Create a new bytewise comparator.
    pub fn new() -> Self {
        Self
    }
}

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "leveldb.BytewiseComparator"
    }
}

/// Compare encoded internal keys (user_key + packed sequence/type tail).
///
/// Internal keys are compared by:
/// 1. User key in ascending order
/// 2. Sequence number in descending order (newer first)
/// 3. Value type in descending order
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalKeyComparator {
    user_comparator: BytewiseComparator,
}

impl InternalKeyComparator {
    /// Create a new internal key comparator.
    pub fn new() -> Self {
        Self {
            user_comparator: BytewiseComparator::new(),
        }
    }

    /// Extract the user key from an encoded internal key.
    pub fn user_key<'a>(&self, internal_key: &'a [u8]) -> &'a [u8] {
        if internal_key.len() < 8 {
            internal_key
        } else {
            &internal_key[..internal_key.len() - 8]
        }
    }

    /// Get the user comparator.
    pub fn user_comparator(&self) -> &BytewiseComparator {
        &self.user_comparator
    }

    /// Compare two user keys.
    pub fn compare_user_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user_comparator.compare(a, b)
    }
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let user_key_a = self.user_key(a);
        let user_key_b = self.user_key(b);

        match self.user_comparator.compare(user_key_a, user_key_b) {
            Ordering::Equal => {
                if a.len() >= 8 && b.len() >= 8 {
                    let num_a = u64::from_be_bytes(a[a.len() - 8..].try_into().unwrap());
                    let num_b = u64::from_be_bytes(b[b.len() - 8..].try_into().unwrap());
                    // Descending: larger (sequence, type) comes first.
                    num_b.cmp(&num_a)
                } else {
                    a.len().cmp(&b.len())
                }
            }
            ord => ord,
        }
    }

    fn name(&self) -> &str {
        "leveldb.InternalKeyComparator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InternalKey, ValueType};
    use bytes::Bytes;

    #[test]
    fn test_bytewise_compare() {
        let cmp = BytewiseComparator::new();

        assert_eq!(cmp.compare(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(cmp.compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(cmp.compare(b"abd", b"abc"), Ordering::Greater);
        assert_eq!(cmp.compare(b"ab", b"abc"), Ordering::Less);
        assert_eq!(cmp.compare(b"", b"a"), Ordering::Less);
    }

    #[test]
    fn test_internal_key_comparator() {
        let cmp = InternalKeyComparator::new();

        let key1 = InternalKey::new(Bytes::from("user"), 100, ValueType::Value).encode();
        let key2 = InternalKey::new(Bytes::from("user"), 200, ValueType::Value).encode();

        // Higher sequence comes first (descending).
        assert_eq!(cmp.compare(&key2, &key1), Ordering::Less);
        assert_eq!(cmp.compare(&key1, &key2), Ordering::Greater);

        let key3 = InternalKey::new(Bytes::from("aaa"), 100, ValueType::Value).encode();
        let key4 = InternalKey::new(Bytes::from("bbb"), 100, ValueType::Value).encode();
        assert_eq!(cmp.compare(&key3, &key4), Ordering::Less);
    }

    #[test]
    fn test_comparator_matches_internal_key_ord() {
        let cmp = InternalKeyComparator::new();
        let keys = [
            InternalKey::for_value(Bytes::from("a"), 5),
            InternalKey::for_value(Bytes::from("a"), 1),
            InternalKey::for_deletion(Bytes::from("a"), 1),
            InternalKey::for_value(Bytes::from("b"), 9),
        ];

        for x in &keys {
            for y in &keys {
                assert_eq!(
                    cmp.compare(&x.encode(), &y.encode()),
                    x.cmp(y),
                    "mismatch for {} vs {}",
                    x,
                    y
                );
            }
        }
    }
}
