//! VersionBuilder - folds a sequence of edits onto a base version.
//!
//! Applying a whole recovery log edit-by-edit through full versions
//! would copy the file lists once per edit; the builder accumulates the
//! deltas and materializes a single successor at the end.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::options::Options;
use crate::types::InternalKey;
use crate::{Error, Result};

use super::{FileMetadata, Version, VersionEdit};

/// Orders added files by (smallest key, file number).
#[derive(Clone)]
struct BySmallest(Arc<FileMetadata>);

impl PartialEq for BySmallest {
    fn eq(&self, other: &Self) -> bool {
        self.0.cmp(&other.0) == std::cmp::Ordering::Equal
    }
}
impl Eq for BySmallest {}
impl PartialOrd for BySmallest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for BySmallest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

#[derive(Default)]
struct LevelState {
    deleted_files: HashSet<u64>,
    added_files: BTreeSet<BySmallest>,
    updated_files: HashSet<u64>,
}

/// Accumulates [`VersionEdit`]s over a base [`Version`] and produces the
/// merged successor. The base is retained and never mutated.
pub struct VersionBuilder {
    options: Arc<Options>,
    base: Arc<Version>,
    levels: Vec<LevelState>,
    truncate_key: Option<InternalKey>,
    /// Encoded compact-pointer updates seen while applying, keyed by
    /// level, for the version set to adopt.
    compact_pointers: BTreeMap<usize, Vec<u8>>,
}

impl VersionBuilder {
    /// Create a builder over `base`.
    pub fn new(options: Arc<Options>, base: Arc<Version>) -> Self {
        let mut levels = Vec::with_capacity(base.files.len());
        levels.resize_with(base.files.len(), LevelState::default);
        Self {
            options,
            base,
            levels,
            truncate_key: None,
            compact_pointers: BTreeMap::new(),
        }
    }

    /// Apply all of the changes in `edit` to the accumulated state.
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<()> {
        if !self.options.enable_sublevel {
            // Keep one level past the highest touched one so the top
            // level stays empty scratch space.
            if self.levels.len() <= edit.max_level + 1 {
                self.levels.resize_with(edit.max_level + 2, LevelState::default);
            }
            for (&level, key) in &edit.compact_pointers {
                self.compact_pointers.insert(level, key.encode().to_vec());
            }
        }

        for &(level, number) in &edit.deleted_files {
            self.level_state(level, "deleted file")?.deleted_files.insert(number);
        }

        for (level, f) in &edit.new_files {
            let file = Arc::new(f.clone());
            let state = self.level_state(*level, "new file")?;
            state.deleted_files.remove(&file.number());
            state.added_files.insert(BySmallest(file));
        }

        if let Some(key) = &edit.truncate_key {
            self.truncate_key = Some(key.clone());
        }

        for &(level, number) in &edit.updated_files {
            debug_assert!(self.options.enable_sublevel);
            self.level_state(level, "updated file")?.updated_files.insert(number);
        }

        Ok(())
    }

    fn level_state(&mut self, level: usize, what: &str) -> Result<&mut LevelState> {
        if level >= self.levels.len() {
            // Levels never grow implicitly in sublevel mode; an edit
            // referencing a lane past the layout is corrupt.
            return Err(Error::corruption(format!(
                "{} level {} out of range ({} levels)",
                what,
                level,
                self.levels.len()
            )));
        }
        Ok(&mut self.levels[level])
    }

    /// Compact-pointer updates collected from the applied edits.
    pub(crate) fn compact_pointers(&self) -> &BTreeMap<usize, Vec<u8>> {
        &self.compact_pointers
    }

    /// Materialize the accumulated state as a new version.
    pub fn save_to(&self) -> Result<Version> {
        let mut v = Version::empty(Arc::clone(&self.options));
        if v.files.len() < self.levels.len() {
            v.files.resize_with(self.levels.len(), Vec::new);
        }

        for (level, state) in self.levels.iter().enumerate() {
            // Merge the added files with the pre-existing ones in
            // smallest-key order (ties broken by file number, base
            // first), dropping deletions along the way.
            let base_files: &[Arc<FileMetadata>] = if level < self.base.files.len() {
                &self.base.files[level]
            } else {
                &[]
            };

            let mut merged: Vec<&Arc<FileMetadata>> =
                Vec::with_capacity(base_files.len() + state.added_files.len());
            let mut base_iter = base_files.iter().peekable();
            for BySmallest(added) in &state.added_files {
                while base_iter
                    .peek()
                    .is_some_and(|b| b.as_ref() <= added.as_ref())
                {
                    if let Some(b) = base_iter.next() {
                        merged.push(b);
                    }
                }
                merged.push(added);
            }
            merged.extend(base_iter);

            for f in merged {
                self.maybe_add_file(&mut v, level, f)?;
            }
        }

        debug_assert!(
            self.options.enable_sublevel
                || v.files.last().map_or(true, |files| files.is_empty()),
            "highest level must stay empty"
        );

        Ok(v)
    }

    fn maybe_add_file(&self, v: &mut Version, level: usize, f: &Arc<FileMetadata>) -> Result<()> {
        let state = &self.levels[level];

        if state.deleted_files.contains(&f.number()) {
            // File is deleted: do nothing.
            return Ok(());
        }

        if state.updated_files.contains(&f.number()) {
            // File is updated, which means truncated: emit a clone whose
            // smallest key is the truncate key.
            debug_assert!(self.options.enable_sublevel);
            let key = self
                .truncate_key
                .clone()
                .ok_or_else(|| Error::corruption("updated file without a truncate key"))?;
            debug_assert!(*f.smallest() < key);
            debug_assert!(*f.largest() >= key);
            v.files[level].push(Arc::new(f.truncated_to(key)));
            return Ok(());
        }

        if level > 0 {
            if let Some(prev) = v.files[level].last() {
                if prev.largest() >= f.smallest() {
                    let msg = format!(
                        "overlapping ranges in same level: {} vs. {}",
                        prev.largest(),
                        f.smallest()
                    );
                    if self.options.paranoid_checks {
                        return Err(Error::corruption(msg));
                    }
                    debug_assert!(false, "{}", msg);
                }
            }
        }

        v.files[level].push(Arc::clone(f));
        Ok(())
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

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> FileMetadata {
        FileMetadata::new(number, 1024, make_key(smallest, 1), make_key(largest, 1))
    }

    fn empty_base() -> (Arc<Options>, Arc<Version>) {
        let options = Arc::new(Options::default());
        let base = Arc::new(Version::empty(Arc::clone(&options)));
        (options, base)
    }

    #[test]
    fn test_builder_add_files() {
        let (options, base) = empty_base();
        let mut builder = VersionBuilder::new(options, base);

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(1, b"a", b"z"));
        edit.add_file(0, meta(2, b"b", b"y"));
        edit.add_file(1, meta(3, b"c", b"x"));
        builder.apply(&edit).unwrap();

        let v = builder.save_to().unwrap();
        assert_eq!(v.num_files(0), 2);
        assert_eq!(v.num_files(1), 1);
        assert_eq!(v.total_files(), 3);
    }

    #[test]
    fn test_builder_sorts_levels_by_smallest() {
        let (options, base) = empty_base();
        let mut builder = VersionBuilder::new(options, base);

        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(9, b"m", b"p"));
        edit.add_file(1, meta(7, b"a", b"c"));
        edit.add_file(1, meta(8, b"e", b"k"));
        builder.apply(&edit).unwrap();

        let v = builder.save_to().unwrap();
        let numbers: Vec<u64> = v.files(1).iter().map(|f| f.number()).collect();
        assert_eq!(numbers, vec![7, 8, 9]);
    }

    #[test]
    fn test_builder_delete_files() {
        let (options, base) = empty_base();
        let mut builder = VersionBuilder::new(Arc::clone(&options), base);

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(1, b"a", b"m"));
        edit.add_file(0, meta(2, b"n", b"z"));
        builder.apply(&edit).unwrap();
        let v1 = Arc::new(builder.save_to().unwrap());

        let mut builder2 = VersionBuilder::new(options, Arc::clone(&v1));
        let mut edit2 = VersionEdit::new();
        edit2.delete_file(0, 1);
        builder2.apply(&edit2).unwrap();
        let v2 = builder2.save_to().unwrap();

        assert_eq!(v1.num_files(0), 2);
        assert_eq!(v2.num_files(0), 1);
        assert_eq!(v2.files(0)[0].number(), 2);
    }

    #[test]
    fn test_builder_add_overrides_earlier_delete() {
        let (options, base) = empty_base();
        let mut builder = VersionBuilder::new(options, base);

        let mut edit = VersionEdit::new();
        edit.delete_file(1, 5);
        edit.add_file(1, meta(5, b"a", b"c"));
        builder.apply(&edit).unwrap();

        let v = builder.save_to().unwrap();
        assert_eq!(v.num_files(1), 1);
    }

    #[test]
    fn test_builder_base_files_shared_not_copied() {
        let (options, base) = empty_base();
        let mut builder = VersionBuilder::new(Arc::clone(&options), base);
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(1, b"a", b"c"));
        builder.apply(&edit).unwrap();
        let v1 = Arc::new(builder.save_to().unwrap());

        let builder2 = VersionBuilder::new(options, Arc::clone(&v1));
        let v2 = builder2.save_to().unwrap();

        // The successor shares the same descriptor allocation.
        assert!(Arc::ptr_eq(&v1.files(1)[0], &v2.files(1)[0]));
    }

    #[test]
    fn test_builder_grows_levels_from_edit() {
        let (options, base) = empty_base();
        let base_levels = base.num_levels();
        let mut builder = VersionBuilder::new(options, base);

        let mut edit = VersionEdit::new();
        edit.add_file(base_levels, meta(1, b"a", b"c"));
        builder.apply(&edit).unwrap();

        let v = builder.save_to().unwrap();
        // One level past the touched one, and that top level is empty.
        assert_eq!(v.num_levels(), base_levels + 2);
        assert_eq!(v.num_files(base_levels), 1);
        assert_eq!(v.num_files(base_levels + 1), 0);
    }

    #[test]
    fn test_builder_collects_compact_pointers() {
        let (options, base) = empty_base();
        let mut builder = VersionBuilder::new(options, base);

        let mut edit = VersionEdit::new();
        edit.set_compact_pointer(1, make_key(b"cursor", 5));
        builder.apply(&edit).unwrap();

        let pointers = builder.compact_pointers();
        assert_eq!(pointers.len(), 1);
        assert_eq!(
            pointers.get(&1).map(|p| p.as_slice()),
            Some(make_key(b"cursor", 5).encode().as_ref())
        );
    }

    #[test]
    fn test_builder_overlap_is_error_when_paranoid() {
        let options = Arc::new(Options {
            paranoid_checks: true,
            ..Default::default()
        });
        let base = Arc::new(Version::empty(Arc::clone(&options)));
        let mut builder = VersionBuilder::new(options, base);

        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(1, b"a", b"m"));
        edit.add_file(1, meta(2, b"k", b"z")); // overlaps
        builder.apply(&edit).unwrap();

        assert!(builder.save_to().is_err());
    }

    #[test]
    fn test_builder_truncated_update() {
        let options = Arc::new(Options {
            enable_sublevel: true,
            ..Default::default()
        });
        let base = Arc::new(Version::empty(Arc::clone(&options)));

        let mut builder = VersionBuilder::new(Arc::clone(&options), base);
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(4, b"a", b"z"));
        builder.apply(&edit).unwrap();
        let v1 = Arc::new(builder.save_to().unwrap());

        let mut builder2 = VersionBuilder::new(options, v1);
        let mut edit2 = VersionEdit::new();
        edit2.set_truncate_key(make_key(b"m", 1));
        edit2.update_file(1, 4);
        builder2.apply(&edit2).unwrap();
        let v2 = builder2.save_to().unwrap();

        assert_eq!(v2.num_files(1), 1);
        assert_eq!(v2.files(1)[0].smallest().user_key(), b"m");
        assert_eq!(v2.files(1)[0].largest().user_key(), b"z");
    }
}
