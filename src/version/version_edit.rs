//! VersionEdit - describes changes between versions.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::InternalKey;
use crate::util::coding::{
    decode_length_prefixed, decode_varint64, encode_length_prefixed, encode_varint64,
};
use crate::{Error, Result};

use super::{EditTag, FileMetadata};

/// A VersionEdit describes the changes between two Versions.
///
/// It records:
/// - New files to add (with their sequence offsets)
/// - Files to delete
/// - Files whose smallest key was truncated (sublevel mode)
/// - Updated counters and compaction pointers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    /// Comparator name (set on the first edit of a database).
    pub comparator: Option<String>,
    /// Log file number.
    pub log_number: Option<u64>,
    /// Previous log number (kept for recovery of older layouts).
    pub prev_log_number: Option<u64>,
    /// Next file number to allocate.
    pub next_file_number: Option<u64>,
    /// Last sequence number used.
    pub last_sequence: Option<u64>,
    /// Compaction pointers by level.
    pub compact_pointers: BTreeMap<usize, InternalKey>,
    /// Files to delete: (level, file_number).
    pub deleted_files: BTreeSet<(usize, u64)>,
    /// New files to add: (level, FileMetadata).
    pub new_files: Vec<(usize, FileMetadata)>,
    /// Files whose smallest key moves up to `truncate_key`:
    /// (level, file_number). Sublevel mode only.
    pub updated_files: BTreeSet<(usize, u64)>,
    /// The new smallest key for every updated file.
    pub truncate_key: Option<InternalKey>,
    /// Highest level touched by this edit. Maintained in memory for the
    /// builder's level sizing; never serialized.
    pub max_level: usize,
}

impl VersionEdit {
    /// Create a new empty edit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the comparator name.
    pub fn set_comparator(&mut self, name: impl Into<String>) {
        self.comparator = Some(name.into());
    }

    /// Set the log number.
    pub fn set_log_number(&mut self, num: u64) {
        self.log_number = Some(num);
    }

    /// Set the previous log number.
    pub fn set_prev_log_number(&mut self, num: u64) {
        self.prev_log_number = Some(num);
    }

    /// Set the next file number.
    pub fn set_next_file_number(&mut self, num: u64) {
        self.next_file_number = Some(num);
    }

    /// Set the last sequence number.
    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    /// Set a compaction pointer.
    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.touch_level(level);
        self.compact_pointers.insert(level, key);
    }

    /// Record a file deletion.
    pub fn delete_file(&mut self, level: usize, file_number: u64) {
        self.touch_level(level);
        self.deleted_files.insert((level, file_number));
    }

    /// Add a new file.
    pub fn add_file(&mut self, level: usize, file: FileMetadata) {
        self.touch_level(level);
        self.new_files.push((level, file));
    }

    /// Record that a file's smallest key moves up to the truncate key.
    pub fn update_file(&mut self, level: usize, file_number: u64) {
        self.touch_level(level);
        self.updated_files.insert((level, file_number));
    }

    /// Set the truncate key applied to every updated file.
    pub fn set_truncate_key(&mut self, key: InternalKey) {
        self.truncate_key = Some(key);
    }

    fn touch_level(&mut self, level: usize) {
        if level > self.max_level {
            self.max_level = level;
        }
    }

    /// Check if the edit is empty.
    pub fn is_empty(&self) -> bool {
        self.comparator.is_none()
            && self.log_number.is_none()
            && self.prev_log_number.is_none()
            && self.next_file_number.is_none()
            && self.last_sequence.is_none()
            && self.compact_pointers.is_empty()
            && self.deleted_files.is_empty()
            && self.new_files.is_empty()
            && self.updated_files.is_empty()
            && self.truncate_key.is_none()
    }

    /// Encode the edit to bytes.
    ///
    /// Emission order is deterministic: scalar fields first, then the
    /// keyed collections in (level, number) order, so two equal edits
    /// encode identically.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);

        if let Some(ref name) = self.comparator {
            encode_varint64(&mut buf, EditTag::Comparator.to_tag());
            encode_length_prefixed(&mut buf, name.as_bytes());
        }

        if let Some(num) = self.log_number {
            encode_varint64(&mut buf, EditTag::LogNumber.to_tag());
            encode_varint64(&mut buf, num);
        }

        if let Some(num) = self.prev_log_number {
            encode_varint64(&mut buf, EditTag::PrevLogNumber.to_tag());
            encode_varint64(&mut buf, num);
        }

        if let Some(num) = self.next_file_number {
            encode_varint64(&mut buf, EditTag::NextFileNumber.to_tag());
            encode_varint64(&mut buf, num);
        }

        if let Some(seq) = self.last_sequence {
            encode_varint64(&mut buf, EditTag::LastSequence.to_tag());
            encode_varint64(&mut buf, seq);
        }

        for (&level, key) in &self.compact_pointers {
            encode_varint64(&mut buf, EditTag::CompactPointer.to_tag());
            encode_varint64(&mut buf, level as u64);
            encode_length_prefixed(&mut buf, &key.encode());
        }

        for &(level, file_number) in &self.deleted_files {
            encode_varint64(&mut buf, EditTag::DeletedFile.to_tag());
            encode_varint64(&mut buf, level as u64);
            encode_varint64(&mut buf, file_number);
        }

        for &(level, file_number) in &self.updated_files {
            encode_varint64(&mut buf, EditTag::UpdatedFile.to_tag());
            encode_varint64(&mut buf, level as u64);
            encode_varint64(&mut buf, file_number);
        }

        if let Some(ref key) = self.truncate_key {
            encode_varint64(&mut buf, EditTag::TruncateKey.to_tag());
            encode_length_prefixed(&mut buf, &key.encode());
        }

        let mut files: Vec<&(usize, FileMetadata)> = self.new_files.iter().collect();
        files.sort_by_key(|(level, f)| (*level, f.number()));
        for (level, file) in files {
            encode_varint64(&mut buf, EditTag::NewFileWithSeq.to_tag());
            encode_varint64(&mut buf, *level as u64);
            encode_varint64(&mut buf, file.number());
            encode_varint64(&mut buf, file.file_size());
            encode_varint64(&mut buf, file.seq_off());
            encode_length_prefixed(&mut buf, &file.smallest().encode());
            encode_length_prefixed(&mut buf, &file.largest().encode());
        }

        buf.freeze()
    }

    /// Decode an edit from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();
        let mut cursor = data;

        while !cursor.is_empty() {
            let raw = decode_varint64(&mut cursor)
                .ok_or_else(|| Error::corruption("truncated edit tag"))?;
            let tag = EditTag::from_tag(raw)
                .ok_or_else(|| Error::corruption(format!("unknown edit tag: {}", raw)))?;

            match tag {
                EditTag::Comparator => {
                    let name = decode_length_prefixed(&mut cursor)
                        .ok_or_else(|| Error::corruption("truncated comparator name"))?;
                    edit.comparator = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::corruption("invalid comparator name"))?,
                    );
                }
                EditTag::LogNumber => {
                    edit.log_number = Some(decode_edit_number(&mut cursor, "log number")?);
                }
                EditTag::PrevLogNumber => {
                    edit.prev_log_number =
                        Some(decode_edit_number(&mut cursor, "prev log number")?);
                }
                EditTag::NextFileNumber => {
                    edit.next_file_number =
                        Some(decode_edit_number(&mut cursor, "next file number")?);
                }
                EditTag::LastSequence => {
                    edit.last_sequence = Some(decode_edit_number(&mut cursor, "last sequence")?);
                }
                EditTag::CompactPointer => {
                    let level = decode_edit_number(&mut cursor, "compact pointer level")? as usize;
                    let key = decode_edit_key(&mut cursor, "compact pointer key")?;
                    edit.set_compact_pointer(level, key);
                }
                EditTag::DeletedFile => {
                    let level = decode_edit_number(&mut cursor, "deleted file level")? as usize;
                    let number = decode_edit_number(&mut cursor, "deleted file number")?;
                    edit.delete_file(level, number);
                }
                EditTag::UpdatedFile => {
                    let level = decode_edit_number(&mut cursor, "updated file level")? as usize;
                    let number = decode_edit_number(&mut cursor, "updated file number")?;
                    edit.update_file(level, number);
                }
                EditTag::TruncateKey => {
                    edit.truncate_key = Some(decode_edit_key(&mut cursor, "truncate key")?);
                }
                EditTag::NewFile | EditTag::NewFileWithSeq => {
                    let level = decode_edit_number(&mut cursor, "new file level")? as usize;
                    let number = decode_edit_number(&mut cursor, "new file number")?;
                    let file_size = decode_edit_number(&mut cursor, "new file size")?;
                    // The older record layout predates sequence offsets.
                    let seq_off = if tag == EditTag::NewFileWithSeq {
                        decode_edit_number(&mut cursor, "new file seq offset")?
                    } else {
                        0
                    };
                    let smallest = decode_edit_key(&mut cursor, "new file smallest key")?;
                    let largest = decode_edit_key(&mut cursor, "new file largest key")?;

                    edit.add_file(
                        level,
                        FileMetadata::with_seq_off(number, file_size, seq_off, smallest, largest),
                    );
                }
            }
        }

        Ok(edit)
    }
}

fn decode_edit_number(cursor: &mut &[u8], what: &str) -> Result<u64> {
    decode_varint64(cursor).ok_or_else(|| Error::corruption(format!("truncated {}", what)))
}

fn decode_edit_key(cursor: &mut &[u8], what: &str) -> Result<InternalKey> {
    let raw = decode_length_prefixed(cursor)
        .ok_or_else(|| Error::corruption(format!("truncated {}", what)))?;
    InternalKey::decode(raw).ok_or_else(|| Error::corruption(format!("invalid {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;
    use bytes::BufMut;

    fn make_key(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(Bytes::copy_from_slice(user_key), seq, ValueType::Value)
    }

    fn make_file(level: usize, number: u64) -> (usize, FileMetadata) {
        (
            level,
            FileMetadata::with_seq_off(
                number,
                1024 * number,
                10 * number,
                make_key(b"aaa", 1),
                make_key(b"zzz", 100),
            ),
        )
    }

    #[test]
    fn test_version_edit_empty() {
        let edit = VersionEdit::new();
        assert!(edit.is_empty());
        assert!(edit.encode().is_empty());
        assert!(VersionEdit::decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_version_edit_roundtrip_full() {
        let mut edit = VersionEdit::new();

        edit.set_comparator("leveldb.BytewiseComparator");
        edit.set_log_number(10);
        edit.set_prev_log_number(9);
        edit.set_next_file_number(100);
        edit.set_last_sequence(5000);

        edit.set_compact_pointer(1, make_key(b"compact", 50));
        edit.set_compact_pointer(3, make_key(b"cursor", 51));

        edit.delete_file(0, 1);
        edit.delete_file(0, 2);
        edit.delete_file(2, 7);

        edit.update_file(1, 4);
        edit.set_truncate_key(make_key(b"half", 42));

        let (lvl, f) = make_file(0, 3);
        edit.add_file(lvl, f);
        let (lvl, f) = make_file(1, 4);
        edit.add_file(lvl, f);

        let decoded = VersionEdit::decode(&edit.encode()).unwrap();

        assert_eq!(decoded.comparator.as_deref(), Some("leveldb.BytewiseComparator"));
        assert_eq!(decoded.log_number, Some(10));
        assert_eq!(decoded.prev_log_number, Some(9));
        assert_eq!(decoded.next_file_number, Some(100));
        assert_eq!(decoded.last_sequence, Some(5000));

        assert_eq!(decoded.compact_pointers.len(), 2);
        assert_eq!(
            decoded.compact_pointers.get(&1).map(|k| k.user_key()),
            Some(b"compact".as_ref())
        );

        assert_eq!(decoded.deleted_files.len(), 3);
        assert!(decoded.deleted_files.contains(&(2, 7)));

        assert_eq!(decoded.updated_files.len(), 1);
        assert!(decoded.updated_files.contains(&(1, 4)));
        assert_eq!(
            decoded.truncate_key.as_ref().map(|k| k.user_key()),
            Some(b"half".as_ref())
        );

        assert_eq!(decoded.new_files.len(), 2);
        assert_eq!(decoded.new_files[0].0, 0);
        assert_eq!(decoded.new_files[0].1.number(), 3);
        assert_eq!(decoded.new_files[0].1.seq_off(), 30);
        assert_eq!(decoded.new_files[1].0, 1);
        assert_eq!(decoded.new_files[1].1.number(), 4);

        assert_eq!(decoded.max_level, edit.max_level);
        assert_eq!(decoded, edit);
    }

    #[test]
    fn test_version_edit_encode_is_stable() {
        let mut a = VersionEdit::new();
        a.delete_file(1, 9);
        a.delete_file(0, 3);
        a.set_compact_pointer(2, make_key(b"x", 1));
        a.set_compact_pointer(0, make_key(b"y", 1));

        let mut b = VersionEdit::new();
        b.set_compact_pointer(0, make_key(b"y", 1));
        b.set_compact_pointer(2, make_key(b"x", 1));
        b.delete_file(0, 3);
        b.delete_file(1, 9);

        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn test_version_edit_legacy_new_file_tag() {
        // Hand-build a record with the pre-seq-offset file tag.
        let mut buf = BytesMut::new();
        encode_varint64(&mut buf, EditTag::NewFile.to_tag());
        encode_varint64(&mut buf, 1); // level
        encode_varint64(&mut buf, 42); // number
        encode_varint64(&mut buf, 4096); // size
        encode_length_prefixed(&mut buf, &make_key(b"a", 1).encode());
        encode_length_prefixed(&mut buf, &make_key(b"m", 9).encode());

        let edit = VersionEdit::decode(&buf).unwrap();
        assert_eq!(edit.new_files.len(), 1);
        assert_eq!(edit.new_files[0].1.number(), 42);
        assert_eq!(edit.new_files[0].1.seq_off(), 0);
    }

    #[test]
    fn test_version_edit_rejects_unknown_tag() {
        let mut buf = BytesMut::new();
        encode_varint64(&mut buf, 99);
        assert!(VersionEdit::decode(&buf).is_err());
    }

    #[test]
    fn test_version_edit_rejects_truncated_payload() {
        let mut edit = VersionEdit::new();
        edit.set_last_sequence(1 << 40);
        let encoded = edit.encode();

        let err = VersionEdit::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(err.is_corruption());

        let mut buf = BytesMut::new();
        encode_varint64(&mut buf, EditTag::Comparator.to_tag());
        buf.put_u8(200); // claims a 200-byte name with nothing behind it
        assert!(VersionEdit::decode(&buf).is_err());
    }

    #[test]
    fn test_max_level_tracking() {
        let mut edit = VersionEdit::new();
        assert_eq!(edit.max_level, 0);

        edit.delete_file(3, 1);
        assert_eq!(edit.max_level, 3);

        let (lvl, f) = make_file(5, 2);
        edit.add_file(lvl, f);
        assert_eq!(edit.max_level, 5);

        edit.set_compact_pointer(1, make_key(b"p", 1));
        assert_eq!(edit.max_level, 5);
    }
}
