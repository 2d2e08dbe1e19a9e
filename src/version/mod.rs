//! Version management: the durable catalog of table files.
//!
//! - **FileMetadata**: descriptor of one immutable table file
//! - **VersionEdit**: serializable delta between two versions
//! - **Version**: immutable snapshot of all files, organized by level
//! - **VersionBuilder**: folds edits onto a base version
//! - **Manifest**: append-only log of edits, replayed on recovery
//! - **VersionSet**: owns the version chain, the manifest, and counters
//!
//! # File organization
//!
//! ```text
//! Level 0:  [SST-1] [SST-2] [SST-3]        (overlapping, newest first)
//! Level 1:  [SST-4][SST-5][SST-6]          (non-overlapping, sorted)
//! Level 2:  [SST-7][SST-8][SST-9][SST-10]  (non-overlapping, sorted)
//! ...
//! ```
//!
//! With sublevels enabled each level splits into lanes grouped into an
//! input pool (fed from above) and an output pool (drained downward),
//! allowing partial compactions.

mod builder;
mod file_metadata;
pub mod manifest;
mod sublevel;
mod version_edit;
mod version_set;

pub(crate) mod version;

pub use builder::VersionBuilder;
pub use file_metadata::FileMetadata;
pub use manifest::{ManifestReader, ManifestWriter};
pub use version::{GetStats, Version};
pub use version_edit::VersionEdit;
pub use version_set::VersionSet;

/// Tag values identifying fields in an encoded [`VersionEdit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EditTag {
    /// Comparator name.
    Comparator = 1,
    /// Log number.
    LogNumber = 2,
    /// Next file number.
    NextFileNumber = 3,
    /// Last sequence number.
    LastSequence = 4,
    /// Compaction pointer for a level.
    CompactPointer = 5,
    /// Deleted file (level, file_number).
    DeletedFile = 6,
    /// New file without a sequence offset (legacy layout, decode only).
    NewFile = 7,
    /// Previous log number (kept for compatibility).
    PrevLogNumber = 9,
    /// New file with a sequence offset.
    NewFileWithSeq = 10,
    /// Updated (truncated) file (level, file_number).
    UpdatedFile = 11,
    /// The truncate key applied to updated files.
    TruncateKey = 12,
}

impl EditTag {
    /// Decode a tag from its varint value.
    pub fn from_tag(value: u64) -> Option<Self> {
        match value {
            1 => Some(EditTag::Comparator),
            2 => Some(EditTag::LogNumber),
            3 => Some(EditTag::NextFileNumber),
            4 => Some(EditTag::LastSequence),
            5 => Some(EditTag::CompactPointer),
            6 => Some(EditTag::DeletedFile),
            7 => Some(EditTag::NewFile),
            9 => Some(EditTag::PrevLogNumber),
            10 => Some(EditTag::NewFileWithSeq),
            11 => Some(EditTag::UpdatedFile),
            12 => Some(EditTag::TruncateKey),
            _ => None,
        }
    }

    /// The tag's varint value.
    pub fn to_tag(self) -> u64 {
        self as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_tag_roundtrip() {
        for tag in [
            EditTag::Comparator,
            EditTag::LogNumber,
            EditTag::NextFileNumber,
            EditTag::LastSequence,
            EditTag::CompactPointer,
            EditTag::DeletedFile,
            EditTag::NewFile,
            EditTag::PrevLogNumber,
            EditTag::NewFileWithSeq,
            EditTag::UpdatedFile,
            EditTag::TruncateKey,
        ] {
            assert_eq!(EditTag::from_tag(tag.to_tag()), Some(tag));
        }
    }

    #[test]
    fn test_edit_tag_unknown() {
        assert_eq!(EditTag::from_tag(0), None);
        assert_eq!(EditTag::from_tag(8), None);
        assert_eq!(EditTag::from_tag(13), None);
    }
}
