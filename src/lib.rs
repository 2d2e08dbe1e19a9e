//! # versiondb
//!
//! The version-management core of an LSM-tree key-value engine: the
//! durable catalog of immutable table files organized into levels, the
//! MANIFEST log that makes every catalog change crash-safe, and the
//! planner that selects inputs for background compactions.
//!
//! The write-ahead log, memtable, and SSTable reader/writer live
//! outside this crate; reads reach table contents through the
//! [`TableCache`] seam.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use versiondb::{Options, VersionSet, VersionEdit, MemTableCache};
//!
//! let options = Arc::new(Options::default());
//! let cache = Arc::new(MemTableCache::new());
//! let vs = VersionSet::new(path, options, cache);
//!
//! // Recover the catalog (false on a fresh database).
//! vs.recover()?;
//!
//! // Register a flushed table.
//! let mut edit = VersionEdit::new();
//! edit.add_file(0, file_metadata);
//! vs.log_and_apply(&mut edit)?;
//!
//! // Plan background work.
//! if let Some(compaction) = vs.pick_compaction(true)? {
//!     // hand the plan to the compaction executor
//! }
//! ```

// Public modules
pub mod error;
pub mod options;
pub mod types;

// Internal modules
mod compaction;
mod table_cache;
mod util;
mod version;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{Options, OptionsBuilder};
pub use types::{InternalKey, LookupKey, ReadOptions, ValueType};

// Version management
pub use version::{
    EditTag, FileMetadata, GetStats, ManifestReader, ManifestWriter, Version, VersionBuilder,
    VersionEdit, VersionSet,
};

// Compaction planning
pub use compaction::Compaction;

// Table cache seam
pub use table_cache::{MemTableCache, TableCache};

// File naming helpers
pub use util::filename::{
    current_file_path, descriptor_file_path, log_file_path, parse_file_name, read_current_file,
    set_current_file, table_file_path, temp_file_path, FileType,
};

// Comparators
pub use util::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
