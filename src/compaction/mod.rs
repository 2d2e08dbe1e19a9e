//! Compaction planning.
//!
//! The planner inspects the current version and produces a [`Compaction`]
//! plan: which files to merge, which level the output lands on, where the
//! output must split, and the pre-seeded edit that installs the result.
//! Executing the plan (reading tables, merging, writing outputs) belongs
//! to the embedding engine.

mod planner;

use std::sync::Arc;

use crate::options::Options;
use crate::types::InternalKey;
use crate::util::comparator::{Comparator, InternalKeyComparator};
use crate::version::version::total_file_size;
use crate::version::{FileMetadata, Version, VersionEdit};

/// A planned compaction: the input files per lane, the grandparent set
/// bounding output file size, and the edit that will install the result.
#[derive(Debug)]
pub struct Compaction {
    level: usize,
    /// First lane of the source output pool (sublevel mode).
    base_input_sublevel: Option<usize>,
    /// Lane the compaction output lands on (sublevel mode).
    output_sublevel: Option<usize>,
    max_output_file_size: u64,
    max_grandparent_overlap_bytes: u64,
    /// Upper bound on bytes consumed by one sublevel compaction.
    max_compaction_size: Option<u64>,
    enable_sublevel: bool,
    enable_should_stop_before: bool,
    icmp: InternalKeyComparator,

    input_version: Arc<Version>,

    /// Input files: `inputs[0]` from `level` and `inputs[1]` from
    /// `level+1`, or one entry per source lane in sublevel mode.
    pub(crate) inputs: Vec<Vec<Arc<FileMetadata>>>,
    /// Files from level+2 that overlap the compaction's key range.
    pub(crate) grandparents: Vec<Arc<FileMetadata>>,
    /// The edit this compaction will install, pre-seeded with the
    /// compact-pointer update.
    pub(crate) edit: VersionEdit,
    /// Left bound of the planned key range (sublevel mode).
    pub(crate) start_key: Option<InternalKey>,

    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    // Per-level cursors for is_base_level_for_key; they only advance,
    // which assumes the executor feeds keys in increasing order.
    level_ptrs: Vec<usize>,
}

impl Compaction {
    /// Plan a compaction of `level` into `level + 1`.
    pub(crate) fn new(options: &Options, level: usize, input_version: Arc<Version>) -> Self {
        debug_assert!(!options.enable_sublevel);
        let num_levels = input_version.num_levels();
        Self {
            level,
            base_input_sublevel: None,
            output_sublevel: None,
            max_output_file_size: options.max_file_size_for_level(level),
            max_grandparent_overlap_bytes: options.max_grandparent_overlap_bytes(),
            max_compaction_size: None,
            enable_sublevel: false,
            enable_should_stop_before: options.enable_should_stop_before,
            icmp: InternalKeyComparator::new(),
            input_version,
            inputs: vec![Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            edit: VersionEdit::new(),
            start_key: None,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; num_levels],
        }
    }

    /// Plan a sublevel compaction draining `lanes` lanes of `level`'s
    /// output pool into the lane `output_sublevel`.
    pub(crate) fn new_sublevel(
        options: &Options,
        level: usize,
        input_version: Arc<Version>,
        base_input_sublevel: usize,
        output_sublevel: usize,
        lanes: usize,
    ) -> Self {
        debug_assert!(options.enable_sublevel);
        Self {
            level,
            base_input_sublevel: Some(base_input_sublevel),
            output_sublevel: Some(output_sublevel),
            max_output_file_size: options.max_file_size_for_level(level),
            max_grandparent_overlap_bytes: options.max_grandparent_overlap_bytes(),
            max_compaction_size: Some(options.max_compaction_size_for_level(level)),
            enable_sublevel: true,
            enable_should_stop_before: options.enable_should_stop_before,
            icmp: InternalKeyComparator::new(),
            input_version,
            inputs: vec![Vec::new(); lanes],
            grandparents: Vec::new(),
            edit: VersionEdit::new(),
            start_key: None,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: Vec::new(),
        }
    }

    /// The level being compacted.
    pub fn level(&self) -> usize {
        self.level
    }

    /// The level the output lands on.
    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    /// First lane of the source output pool (sublevel mode).
    pub fn base_input_sublevel(&self) -> Option<usize> {
        self.base_input_sublevel
    }

    /// Lane receiving the compaction output (sublevel mode).
    pub fn output_sublevel(&self) -> Option<usize> {
        self.output_sublevel
    }

    /// Target size for output tables.
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// Grandparent-overlap bound used by [`Compaction::should_stop_before`].
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        self.max_grandparent_overlap_bytes
    }

    /// Byte budget for one sublevel compaction, if bounded.
    pub fn max_compaction_size(&self) -> Option<u64> {
        self.max_compaction_size
    }

    /// Number of input lanes.
    pub fn num_input_sublevels(&self) -> usize {
        self.inputs.len()
    }

    /// Files in input lane `which`.
    pub fn input(&self, which: usize) -> &[Arc<FileMetadata>] {
        &self.inputs[which]
    }

    /// Number of files in input lane `which`.
    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// Grandparent files overlapping the compaction range.
    pub fn grandparents(&self) -> &[Arc<FileMetadata>] {
        &self.grandparents
    }

    /// The version this plan was made against.
    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// Left bound of the planned range (sublevel mode).
    pub fn start_key(&self) -> Option<&InternalKey> {
        self.start_key.as_ref()
    }

    /// The edit that installs this compaction's result.
    pub fn edit(&self) -> &VersionEdit {
        &self.edit
    }

    /// Mutable access to the install edit, for the executor to add its
    /// output files.
    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    /// Take the install edit out of the plan.
    pub fn take_edit(&mut self) -> VersionEdit {
        std::mem::take(&mut self.edit)
    }

    /// The single input file of a one-file compaction.
    pub fn the_only_file(&self) -> Option<Arc<FileMetadata>> {
        self.inputs
            .iter()
            .find(|lane| !lane.is_empty())
            .map(|lane| Arc::clone(&lane[0]))
    }

    /// Count input files, optionally only those whose smallest key is
    /// below `truncate_key`.
    pub fn total_num_input_files(&self, truncate_key: Option<&InternalKey>) -> usize {
        self.inputs
            .iter()
            .map(|lane| match truncate_key {
                Some(key) => lane.iter().take_while(|f| f.smallest() < key).count(),
                None => lane.len(),
            })
            .sum()
    }

    /// Sum input bytes, optionally only for files whose smallest key is
    /// below `truncate_key`.
    pub fn total_num_input_bytes(&self, truncate_key: Option<&InternalKey>) -> u64 {
        self.inputs
            .iter()
            .map(|lane| -> u64 {
                match truncate_key {
                    Some(key) => lane
                        .iter()
                        .take_while(|f| f.smallest() < key)
                        .map(|f| f.file_size())
                        .sum(),
                    None => total_file_size(lane),
                }
            })
            .sum()
    }

    /// A trivial move renames the single input file into the next level
    /// without reading it. Vetoed when the file would drag too much
    /// grandparent overlap along.
    pub fn is_trivial_move(&self) -> bool {
        if !self.enable_sublevel {
            self.num_input_files(0) == 1
                && self.num_input_files(1) == 0
                && (!self.enable_should_stop_before
                    || total_file_size(&self.grandparents) <= self.max_grandparent_overlap_bytes)
        } else {
            self.total_num_input_files(None) == 1
        }
    }

    /// Record the deletion of every input file in the install edit.
    pub fn add_input_deletions(&mut self) {
        let input_base_level = self.base_input_sublevel.unwrap_or(self.level);
        for which in 0..self.inputs.len() {
            for i in 0..self.inputs[which].len() {
                let number = self.inputs[which][i].number();
                self.edit.delete_file(input_base_level + which, number);
            }
        }
    }

    /// Record deletions for inputs fully consumed up to `key`, and
    /// truncations for those the key splits. Sublevel mode only.
    pub fn add_input_deletions_or_updates(&mut self, key: &InternalKey) {
        debug_assert!(self.enable_sublevel);
        self.edit.set_truncate_key(key.clone());
        let base = self.base_input_sublevel.unwrap_or(self.level);

        for which in 0..self.inputs.len() {
            for i in 0..self.inputs[which].len() {
                let meta = Arc::clone(&self.inputs[which][i]);
                if meta.largest() < key {
                    self.edit.delete_file(base + which, meta.number());
                } else {
                    if meta.smallest() < key {
                        self.edit.update_file(base + which, meta.number());
                    }
                    if self.level > 0 {
                        debug_assert!(
                            i + 1 >= self.inputs[which].len()
                                || self.inputs[which][i + 1].smallest() > key
                        );
                        break;
                    }
                }
            }
        }
    }

    /// True iff no level at or below the output's grandparents contains
    /// `user_key`, so tombstones for it may be dropped.
    ///
    /// The per-level cursors only move forward; callers must present
    /// keys in increasing order.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        if self.enable_sublevel {
            // Lane indices do not line up with levels here; never claim
            // base level, so deletion markers are kept.
            return false;
        }
        let ucmp = *self.icmp.user_comparator();
        for lvl in self.level + 2..self.input_version.num_levels() {
            let files = self.input_version.files(lvl);
            while self.level_ptrs[lvl] < files.len() {
                let f = &files[self.level_ptrs[lvl]];
                if ucmp.compare(user_key, f.largest().user_key()) != std::cmp::Ordering::Greater {
                    // Advanced far enough.
                    if ucmp.compare(user_key, f.smallest().user_key())
                        != std::cmp::Ordering::Less
                    {
                        // Key falls in this file's range.
                        return false;
                    }
                    break;
                }
                self.level_ptrs[lvl] += 1;
            }
        }
        true
    }

    /// Returns true when the output being built has crossed too many
    /// grandparent bytes at `internal_key` and should be finalized
    /// before the key is appended.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        if !self.enable_should_stop_before {
            return false;
        }
        if self.enable_sublevel {
            return false;
        }

        // Scan to the earliest grandparent file containing the key.
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                &self.grandparents[self.grandparent_index].largest().encode(),
            ) == std::cmp::Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size();
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap_bytes {
            // Too much overlap for the current output; start a new one.
            self.overlapped_bytes = 0;
            true
        } else {
            false
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

    fn make_file(num: u64, size: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetadata> {
        Arc::new(FileMetadata::new(
            num,
            size,
            make_key(smallest, 1),
            make_key(largest, 1),
        ))
    }

    fn empty_version() -> Arc<Version> {
        Arc::new(Version::empty(Arc::new(Options::default())))
    }

    #[test]
    fn test_trivial_move_rules() {
        let options = Options::default();
        let mut c = Compaction::new(&options, 1, empty_version());
        c.inputs[0].push(make_file(1, 1000, b"a", b"c"));
        assert!(c.is_trivial_move());

        // A second input at the next level blocks the move.
        c.inputs[1].push(make_file(2, 1000, b"b", b"d"));
        assert!(!c.is_trivial_move());

        // Heavy grandparent overlap blocks it too.
        let mut c = Compaction::new(&options, 1, empty_version());
        c.inputs[0].push(make_file(1, 1000, b"a", b"c"));
        c.grandparents
            .push(make_file(3, options.max_grandparent_overlap_bytes() + 1, b"a", b"z"));
        assert!(!c.is_trivial_move());
    }

    #[test]
    fn test_add_input_deletions() {
        let options = Options::default();
        let mut c = Compaction::new(&options, 1, empty_version());
        c.inputs[0].push(make_file(7, 1000, b"a", b"c"));
        c.inputs[1].push(make_file(8, 1000, b"a", b"b"));
        c.inputs[1].push(make_file(9, 1000, b"c", b"d"));

        c.add_input_deletions();
        let edit = c.edit();
        assert_eq!(edit.deleted_files.len(), 3);
        assert!(edit.deleted_files.contains(&(1, 7)));
        assert!(edit.deleted_files.contains(&(2, 8)));
        assert!(edit.deleted_files.contains(&(2, 9)));
    }

    #[test]
    fn test_should_stop_before() {
        let options = Options {
            table_file_size: 1000,
            level_factor: 2, // overlap bound = 2000 bytes
            ..Default::default()
        };
        let mut c = Compaction::new(&options, 0, empty_version());
        c.grandparents.push(make_file(1, 1500, b"a", b"c"));
        c.grandparents.push(make_file(2, 1500, b"d", b"f"));
        c.grandparents.push(make_file(3, 1500, b"g", b"i"));

        // First key never stops (nothing crossed yet).
        let k = |s: &str| make_key(s.as_bytes(), 1).encode();
        assert!(!c.should_stop_before(&k("a")));
        // Crossing one grandparent (1500 <= 2000): keep going.
        assert!(!c.should_stop_before(&k("e")));
        // Crossing the second (3000 > 2000): split output.
        assert!(c.should_stop_before(&k("z")));
        // Counter reset after the split.
        assert!(!c.should_stop_before(&k("z")));
    }

    #[test]
    fn test_is_base_level_for_key() {
        let options = Options::default();
        let mut base = Version::empty(Arc::new(Options::default()));
        base.files.resize_with(4, Vec::new);
        base.files[2] = vec![make_file(1, 1000, b"d", b"f")];
        base.files[3] = vec![make_file(2, 1000, b"m", b"p")];

        let mut c = Compaction::new(&options, 0, Arc::new(base));

        assert!(c.is_base_level_for_key(b"a")); // before everything
        assert!(!c.is_base_level_for_key(b"e")); // inside level-2 file
        assert!(c.is_base_level_for_key(b"g")); // gap
        assert!(!c.is_base_level_for_key(b"n")); // inside level-3 file
        assert!(c.is_base_level_for_key(b"q")); // past everything
    }

    #[test]
    fn test_total_input_accounting_with_truncation() {
        let options = Options {
            enable_sublevel: true,
            ..Default::default()
        };
        let mut c = Compaction::new_sublevel(&options, 1, empty_version(), 1, 3, 2);
        c.inputs[0].push(make_file(1, 100, b"a", b"c"));
        c.inputs[0].push(make_file(2, 200, b"d", b"f"));
        c.inputs[1].push(make_file(3, 400, b"b", b"e"));

        assert_eq!(c.total_num_input_files(None), 3);
        assert_eq!(c.total_num_input_bytes(None), 700);

        let cut = make_key(b"d", InternalKey::MAX_SEQUENCE);
        // Files whose smallest key precedes "d": 1 and 3.
        assert_eq!(c.total_num_input_files(Some(&cut)), 2);
        assert_eq!(c.total_num_input_bytes(Some(&cut)), 500);
    }

    #[test]
    fn test_sublevel_deletions_or_updates() {
        let options = Options {
            enable_sublevel: true,
            ..Default::default()
        };
        let mut c = Compaction::new_sublevel(&options, 1, empty_version(), 2, 5, 2);
        c.inputs[0].push(make_file(1, 100, b"a", b"c")); // fully consumed
        c.inputs[0].push(make_file(2, 100, b"d", b"h")); // split by the key
        c.inputs[1].push(make_file(3, 100, b"g", b"k")); // not yet reached

        let cut = make_key(b"f", InternalKey::MAX_SEQUENCE);
        c.add_input_deletions_or_updates(&cut);

        let edit = c.edit();
        assert_eq!(edit.truncate_key.as_ref().map(|k| k.user_key()), Some(b"f".as_ref()));
        assert!(edit.deleted_files.contains(&(2, 1)));
        assert!(edit.updated_files.contains(&(2, 2)));
        // Lane 1's file starts past the key: neither deleted nor updated.
        assert!(!edit.deleted_files.contains(&(3, 3)));
        assert!(!edit.updated_files.contains(&(3, 3)));
    }
}
