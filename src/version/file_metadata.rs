//! File metadata for on-disk table files.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use crate::types::InternalKey;

/// Metadata about one immutable table file.
///
/// Carries everything the catalog needs to locate the table and route
/// reads to it: its number, size, the sequence offset assigned to its
/// first key, and its key range. Shared across versions via `Arc`; the
/// strong count is the file's reference count, and the physical file
/// becomes garbage once no live version retains it.
#[derive(Debug)]
pub struct FileMetadata {
    /// Unique file number. Never reused.
    number: u64,
    /// File size in bytes.
    file_size: u64,
    /// Sequence-number base assigned to the table's first key.
    seq_off: u64,
    /// Smallest internal key in the file.
    smallest: InternalKey,
    /// Largest internal key in the file.
    largest: InternalKey,
    /// Seeks remaining before this file volunteers for compaction.
    ///
    /// One seek costs about as much as compacting 16KB, so the budget
    /// scales with file size, floored at 100.
    allowed_seeks: AtomicI64,
}

impl FileMetadata {
    /// Create new file metadata.
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        Self::with_seq_off(number, file_size, 0, smallest, largest)
    }

    /// Create new file metadata with an explicit sequence offset.
    pub fn with_seq_off(
        number: u64,
        file_size: u64,
        seq_off: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) -> Self {
        debug_assert!(smallest <= largest);
        let allowed_seeks = std::cmp::max(100, (file_size / 16384) as i64);

        Self {
            number,
            file_size,
            seq_off,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }

    /// Get the file number.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Get the file size.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Get the sequence offset.
    pub fn seq_off(&self) -> u64 {
        self.seq_off
    }

    /// Get the smallest key.
    pub fn smallest(&self) -> &InternalKey {
        &self.smallest
    }

    /// Get the largest key.
    pub fn largest(&self) -> &InternalKey {
        &self.largest
    }

    /// Get the remaining seek budget.
    pub fn allowed_seeks(&self) -> i64 {
        self.allowed_seeks.load(AtomicOrdering::Relaxed)
    }

    /// Charge one seek against the budget. Returns true when the budget
    /// is exhausted.
    pub fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1 <= 0
    }

    /// Check if the file's user-key range intersects `[smallest, largest]`.
    pub fn overlaps_user_range(&self, smallest: &[u8], largest: &[u8]) -> bool {
        self.largest.user_key() >= smallest && self.smallest.user_key() <= largest
    }

    /// Check if a user key falls inside this file's range.
    pub fn may_contain_user_key(&self, user_key: &[u8]) -> bool {
        user_key >= self.smallest.user_key() && user_key <= self.largest.user_key()
    }

    /// Clone this descriptor with its smallest key raised to `smallest`.
    ///
    /// Used when a sublevel compaction consumed only the front of the
    /// file; the tail stays live under the truncated range. The clone
    /// gets a fresh seek budget.
    pub fn truncated_to(&self, smallest: InternalKey) -> Self {
        Self::with_seq_off(
            self.number,
            self.file_size,
            self.seq_off,
            smallest,
            self.largest.clone(),
        )
    }
}

impl Clone for FileMetadata {
    fn clone(&self) -> Self {
        Self {
            number: self.number,
            file_size: self.file_size,
            seq_off: self.seq_off,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(AtomicOrdering::Relaxed)),
        }
    }
}

impl PartialEq for FileMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number && self.smallest == other.smallest
    }
}

impl Eq for FileMetadata {}

impl PartialOrd for FileMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileMetadata {
    fn cmp(&self, other: &Self) -> Ordering {
        // Sort by smallest key first, then by file number for stability.
        match self.smallest.cmp(&other.smallest) {
            Ordering::Equal => self.number.cmp(&other.number),
            ord => ord,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;
    use bytes::Bytes;

    fn make_key(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(Bytes::copy_from_slice(user_key), seq, ValueType::Value)
    }

    #[test]
    fn test_file_metadata_basic() {
        let meta = FileMetadata::with_seq_off(1, 1024, 500, make_key(b"aaa", 1), make_key(b"zzz", 100));

        assert_eq!(meta.number(), 1);
        assert_eq!(meta.file_size(), 1024);
        assert_eq!(meta.seq_off(), 500);
        assert_eq!(meta.smallest().user_key(), b"aaa");
        assert_eq!(meta.largest().user_key(), b"zzz");
    }

    #[test]
    fn test_overlaps_user_range() {
        let meta = FileMetadata::new(1, 1024, make_key(b"bbb", 1), make_key(b"ddd", 100));

        assert!(meta.overlaps_user_range(b"aaa", b"ccc"));
        assert!(meta.overlaps_user_range(b"ccc", b"eee"));
        assert!(meta.overlaps_user_range(b"aaa", b"eee"));
        assert!(meta.overlaps_user_range(b"bbb", b"ddd"));
        assert!(meta.overlaps_user_range(b"ccc", b"ccc"));

        assert!(!meta.overlaps_user_range(b"aaa", b"aaz"));
        assert!(!meta.overlaps_user_range(b"eee", b"zzz"));
    }

    #[test]
    fn test_may_contain_user_key() {
        let meta = FileMetadata::new(1, 1024, make_key(b"bbb", 1), make_key(b"ddd", 100));

        assert!(meta.may_contain_user_key(b"bbb"));
        assert!(meta.may_contain_user_key(b"ccc"));
        assert!(meta.may_contain_user_key(b"ddd"));
        assert!(!meta.may_contain_user_key(b"aaa"));
        assert!(!meta.may_contain_user_key(b"eee"));
    }

    #[test]
    fn test_seek_budget() {
        // Small file: floor of 100 seeks.
        let small = FileMetadata::new(1, 1024, make_key(b"a", 1), make_key(b"z", 1));
        assert_eq!(small.allowed_seeks(), 100);

        // 16KB per seek above the floor.
        let large = FileMetadata::new(2, 100 * 16384, make_key(b"a", 1), make_key(b"z", 1));
        assert_eq!(large.allowed_seeks(), 100);

        let larger = FileMetadata::new(3, 200 * 16384, make_key(b"a", 1), make_key(b"z", 1));
        assert_eq!(larger.allowed_seeks(), 200);
    }

    #[test]
    fn test_charge_seek_exhaustion() {
        let meta = FileMetadata::new(1, 1024, make_key(b"a", 1), make_key(b"z", 1));

        let mut fired = 0;
        for _ in 0..100 {
            if meta.charge_seek() {
                fired += 1;
            }
        }
        // Only the 100th charge reports exhaustion the first time.
        assert_eq!(fired, 1);
        assert!(meta.allowed_seeks() <= 0);
    }

    #[test]
    fn test_ordering() {
        let meta1 = FileMetadata::new(1, 100, make_key(b"aaa", 1), make_key(b"bbb", 1));
        let meta2 = FileMetadata::new(2, 100, make_key(b"ccc", 1), make_key(b"ddd", 1));
        let meta3 = FileMetadata::new(3, 100, make_key(b"aaa", 1), make_key(b"ccc", 1));

        assert!(meta1 < meta2);
        assert!(meta1 < meta3); // same smallest, lower number first
        assert!(meta3 < meta2);
    }

    #[test]
    fn test_truncated_to() {
        let meta = FileMetadata::new(9, 4096, make_key(b"aaa", 5), make_key(b"zzz", 5));
        let cut = meta.truncated_to(make_key(b"mmm", 5));

        assert_eq!(cut.number(), 9);
        assert_eq!(cut.smallest().user_key(), b"mmm");
        assert_eq!(cut.largest().user_key(), b"zzz");
    }
}
