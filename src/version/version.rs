//! Version - immutable snapshot of the table files active at a point in
//! time.
//!
//! Readers hold an `Arc<Version>` captured at open time and traverse it
//! without locks; the version set installs successors atomically and the
//! snapshot stays valid until the last reader drops it.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::options::Options;
use crate::table_cache::TableCache;
use crate::types::{InternalKey, LookupKey, ReadOptions, ValueType};
use crate::util::comparator::{Comparator, InternalKeyComparator};
use crate::{Error, Result};

use super::FileMetadata;

/// Total bytes across a slice of files.
pub(crate) fn total_file_size(files: &[Arc<FileMetadata>]) -> u64 {
    files.iter().map(|f| f.file_size()).sum()
}

/// Binary search for the earliest file whose largest key is at or after
/// `key`. Requires `files` sorted and disjoint.
pub(crate) fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetadata>],
    key: &[u8],
) -> usize {
    files.partition_point(|f| icmp.compare(&f.largest().encode(), key) == Ordering::Less)
}

fn after_file(user_key: Option<&[u8]>, f: &FileMetadata) -> bool {
    // A missing user key occurs before all keys and is therefore never
    // after *f*.
    matches!(user_key, Some(k) if k > f.largest().user_key())
}

fn before_file(user_key: Option<&[u8]>, f: &FileMetadata) -> bool {
    // A missing user key occurs after all keys and is therefore never
    // before *f*.
    matches!(user_key, Some(k) if k < f.smallest().user_key())
}

/// Check whether any file in `files` overlaps the user-key range
/// `[smallest_user_key, largest_user_key]`; `None` bounds are unbounded.
/// `disjoint_sorted_files` enables the binary-search fast path.
pub(crate) fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint_sorted_files: bool,
    files: &[Arc<FileMetadata>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    if !disjoint_sorted_files {
        // Need to check against all files.
        return files
            .iter()
            .any(|f| !after_file(smallest_user_key, f) && !before_file(largest_user_key, f));
    }

    let index = match smallest_user_key {
        Some(user_key) => {
            let small =
                InternalKey::for_seek(Bytes::copy_from_slice(user_key), InternalKey::MAX_SEQUENCE);
            find_file(icmp, files, &small.encode())
        }
        None => 0,
    };

    if index >= files.len() {
        // Beginning of range is after all files, so no overlap.
        return false;
    }

    !before_file(largest_user_key, &files[index])
}

/// Statistics collected by a point read, used to charge seek pressure.
#[derive(Debug, Clone, Default)]
pub struct GetStats {
    /// First file that was searched without producing a hit, with its
    /// level; charged a seek when the read consulted a second file.
    pub seek_file: Option<(Arc<FileMetadata>, usize)>,
}

/// An immutable snapshot of all table files, organized by level.
///
/// Level 0 may contain overlapping files, iterated newest-first; higher
/// levels are sorted and disjoint. In sublevel mode each element of
/// `files` is a lane, and the pools map levels onto contiguous lane
/// ranges.
pub struct Version {
    pub(crate) options: Arc<Options>,
    pub(crate) icmp: InternalKeyComparator,

    /// Files per level (or per lane in sublevel mode).
    pub(crate) files: Vec<Vec<Arc<FileMetadata>>>,

    /// Per-level `(base_lane, lane_count)` slices of `files` feeding
    /// compactions in. Empty unless sublevels are enabled.
    pub(crate) input_pool: Vec<(usize, usize)>,
    /// Per-level lane slices compactions drain from. The terminal entry
    /// has length zero.
    pub(crate) output_pool: Vec<(usize, usize)>,

    /// Level that should be compacted next, with its fullness score.
    /// Score >= 1 means compaction is needed. Filled by finalize.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: Option<usize>,

    /// File (and its level) whose seek budget ran out; set at most once.
    seek_compaction: Mutex<Option<(Arc<FileMetadata>, usize)>>,
}

impl Version {
    /// Create an empty version shaped for the given options.
    pub(crate) fn empty(options: Arc<Options>) -> Self {
        let (files, input_pool, output_pool) = if options.enable_sublevel {
            // Lane 0 is level 0; lane 1 is the first input lane of level
            // 1; the terminal output entry is the empty sentinel.
            (
                vec![Vec::new(), Vec::new()],
                vec![(0, 1), (1, 1)],
                vec![(0, 1), (2, 0)],
            )
        } else {
            (
                vec![Vec::new(); options.max_mem_compact_level + 1],
                Vec::new(),
                Vec::new(),
            )
        };

        Self {
            options,
            icmp: InternalKeyComparator::new(),
            files,
            input_pool,
            output_pool,
            compaction_score: -1.0,
            compaction_level: None,
            seek_compaction: Mutex::new(None),
        }
    }

    /// Number of levels (lanes in sublevel mode).
    pub fn num_levels(&self) -> usize {
        self.files.len()
    }

    /// Files at a level (lane).
    pub fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.files[level]
    }

    /// Number of files at a level (lane).
    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Total bytes at a level (lane).
    pub fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    /// Total number of files across all levels.
    pub fn total_files(&self) -> usize {
        self.files.iter().map(|f| f.len()).sum()
    }

    /// The compaction score computed by finalization.
    pub fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    /// The level finalization chose for the next size compaction.
    pub fn compaction_level(&self) -> Option<usize> {
        self.compaction_level
    }

    /// Check whether a size compaction is warranted.
    pub fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.file_to_compact().is_some()
    }

    /// The file armed for seek-triggered compaction, if any.
    pub fn file_to_compact(&self) -> Option<(Arc<FileMetadata>, usize)> {
        self.seek_compaction.lock().clone()
    }

    /// Iterate every `(level, file)` pair in the snapshot.
    pub fn all_files(&self) -> impl Iterator<Item = (usize, &Arc<FileMetadata>)> {
        self.files
            .iter()
            .enumerate()
            .flat_map(|(level, files)| files.iter().map(move |f| (level, f)))
    }

    /// Look up `key`, consulting candidate files level by level through
    /// the table cache.
    ///
    /// Returns the value (truncated to `options.limit`) or `None` when
    /// the key is absent or deleted. The returned stats identify the
    /// first file searched fruitlessly, for seek accounting via
    /// [`Version::update_stats`].
    pub fn get(
        &self,
        options: &ReadOptions,
        key: &LookupKey,
        table_cache: &dyn TableCache,
    ) -> Result<(Option<Bytes>, GetStats)> {
        let ikey = key.internal_key();
        let user_key = key.user_key();
        let ucmp = *self.icmp.user_comparator();

        let mut stats = GetStats::default();
        let mut last_file_read: Option<(Arc<FileMetadata>, usize)> = None;

        // Entries never hop across levels, so data found in a smaller
        // level makes later levels irrelevant.
        for level in 0..self.files.len() {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }

            let candidates: Vec<Arc<FileMetadata>> = if level == 0 {
                // Level-0 files may overlap each other. Find all files
                // that overlap user_key and process them from newest to
                // oldest.
                let mut tmp: Vec<Arc<FileMetadata>> = files
                    .iter()
                    .filter(|f| f.may_contain_user_key(user_key))
                    .cloned()
                    .collect();
                tmp.sort_by(|a, b| b.number().cmp(&a.number()));
                tmp
            } else {
                let index = find_file(&self.icmp, files, ikey);
                match files.get(index) {
                    Some(f)
                        if ucmp.compare(user_key, f.smallest().user_key()) != Ordering::Less =>
                    {
                        vec![Arc::clone(f)]
                    }
                    // All of the candidate is past any data for user_key.
                    _ => Vec::new(),
                }
            };

            for f in candidates {
                if last_file_read.is_some() && stats.seek_file.is_none() {
                    // More than one seek for this read; charge the first.
                    stats.seek_file = last_file_read.clone();
                }
                last_file_read = Some((Arc::clone(&f), level));

                let entry =
                    table_cache.get(options, f.number(), f.file_size(), f.seq_off(), ikey)?;
                let (entry_key, value) = match entry {
                    Some(e) => e,
                    None => continue,
                };

                let parsed = InternalKey::decode(&entry_key).ok_or_else(|| {
                    Error::corruption(format!(
                        "corrupted key for {}",
                        String::from_utf8_lossy(user_key)
                    ))
                })?;

                if ucmp.compare(parsed.user_key(), user_key) != Ordering::Equal {
                    continue; // keep searching in other files
                }

                return match parsed.value_type() {
                    ValueType::Value => {
                        let take = value.len().min(options.limit);
                        Ok((Some(value.slice(..take)), stats))
                    }
                    ValueType::Deletion => Ok((None, stats)),
                };
            }
        }

        Ok((None, stats))
    }

    /// Charge one seek to the file a read identified. Returns true when
    /// the file's budget ran out and it was armed for seek compaction.
    pub fn update_stats(&self, stats: &GetStats) -> bool {
        if let Some((f, level)) = &stats.seek_file {
            if f.charge_seek() {
                let mut slot = self.seek_compaction.lock();
                if slot.is_none() {
                    *slot = Some((Arc::clone(f), *level));
                    return true;
                }
            }
        }
        false
    }

    /// Sample a key observed by an iterator read. When the key is
    /// covered by at least two files the first is charged a seek, since
    /// reads there merge across files.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let user_key = match InternalKey::parse_user_key(internal_key) {
            Some(k) => k,
            None => return false,
        };

        let mut matches = 0;
        let mut first: Option<(Arc<FileMetadata>, usize)> = None;
        self.for_each_overlapping(user_key, internal_key, |level, f| {
            matches += 1;
            if matches == 1 {
                first = Some((Arc::clone(f), level));
            }
            // Stop once a second match is known.
            matches < 2
        });

        if matches >= 2 {
            return self.update_stats(&GetStats { seek_file: first });
        }
        false
    }

    /// Invoke `func(level, file)` on every file that may contain
    /// `user_key`, newest first, until it returns false.
    pub fn for_each_overlapping(
        &self,
        user_key: &[u8],
        internal_key: &[u8],
        mut func: impl FnMut(usize, &Arc<FileMetadata>) -> bool,
    ) {
        // Search level 0 from newest to oldest.
        let mut tmp: Vec<&Arc<FileMetadata>> = self.files[0]
            .iter()
            .filter(|f| f.may_contain_user_key(user_key))
            .collect();
        tmp.sort_by(|a, b| b.number().cmp(&a.number()));
        for f in tmp {
            if !func(0, f) {
                return;
            }
        }

        // Search other levels.
        for level in 1..self.files.len() {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }

            let index = find_file(&self.icmp, files, internal_key);
            if let Some(f) = files.get(index) {
                if user_key >= f.smallest().user_key() && !func(level, f) {
                    return;
                }
            }
        }
    }

    /// Check whether any file at `level` overlaps the user-key range.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Collect all files in `level` overlapping `[begin, end]`.
    ///
    /// In level 0 an overlapping file may widen the query's user-key
    /// range; the sweep restarts with the expanded bounds until the set
    /// is closed under transitive overlap.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetadata>> {
        let ucmp = *self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| Bytes::copy_from_slice(k.user_key()));
        let mut user_end = end.map(|k| Bytes::copy_from_slice(k.user_key()));

        let mut inputs = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let f = Arc::clone(&self.files[level][i]);
            i += 1;
            let file_start = f.smallest().user_key();
            let file_limit = f.largest().user_key();

            if user_begin
                .as_ref()
                .is_some_and(|b| ucmp.compare(file_limit, b) == Ordering::Less)
            {
                // Completely before the range; skip it.
            } else if user_end
                .as_ref()
                .is_some_and(|e| ucmp.compare(file_start, e) == Ordering::Greater)
            {
                // Completely after the range; skip it.
            } else {
                if level == 0 {
                    // Level-0 files may overlap each other; if this file
                    // expands the range, restart the search.
                    if user_begin
                        .as_ref()
                        .is_some_and(|b| ucmp.compare(file_start, b) == Ordering::Less)
                    {
                        user_begin = Some(Bytes::copy_from_slice(file_start));
                        inputs.clear();
                        i = 0;
                        continue;
                    }
                    if user_end
                        .as_ref()
                        .is_some_and(|e| ucmp.compare(file_limit, e) == Ordering::Greater)
                    {
                        user_end = Some(Bytes::copy_from_slice(file_limit));
                        inputs.clear();
                        i = 0;
                        continue;
                    }
                }
                inputs.push(f);
            }
        }
        inputs
    }

    /// Pick the level a fresh memtable output covering
    /// `[smallest_user_key, largest_user_key]` should land on: push past
    /// empty levels while the next level is clear and the grandparent
    /// overlap stays bounded.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            let start = InternalKey::for_seek(
                Bytes::copy_from_slice(smallest_user_key),
                InternalKey::MAX_SEQUENCE,
            );
            let limit = InternalKey::new(
                Bytes::copy_from_slice(largest_user_key),
                0,
                ValueType::Deletion,
            );

            while level < self.options.max_mem_compact_level {
                if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key))
                {
                    break;
                }
                if level + 2 < self.files.len() {
                    // Do not overlap too many grandparent bytes.
                    let overlaps =
                        self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                    if total_file_size(&overlaps) > self.options.max_grandparent_overlap_bytes() {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// Number of sublevel lanes serving `level`.
    pub fn num_sublevels_in_level(&self, level: usize) -> usize {
        debug_assert!(self.options.enable_sublevel);
        debug_assert_eq!(self.input_pool.len(), self.output_pool.len());
        if level >= self.input_pool.len() {
            return 0;
        }
        if level == 0 {
            return 1;
        }
        self.input_pool[level].1 + self.output_pool[level].1
    }

    fn pool_files(&self, pool: &[(usize, usize)], level: usize) -> usize {
        let (base, len) = pool[level];
        (base..base + len).map(|row| self.files[row].len()).sum()
    }

    fn pool_bytes(&self, pool: &[(usize, usize)], level: usize) -> u64 {
        let (base, len) = pool[level];
        (base..base + len)
            .map(|row| total_file_size(&self.files[row]))
            .sum()
    }

    /// Number of files in `level` counting both pools.
    pub fn num_files_in_level_sub(&self, level: usize) -> usize {
        debug_assert!(self.options.enable_sublevel);
        if level == 0 {
            self.files[0].len()
        } else if level < self.input_pool.len() {
            self.pool_files(&self.input_pool, level) + self.pool_files(&self.output_pool, level)
        } else {
            0
        }
    }

    /// Bytes in `level` counting both pools.
    pub fn num_bytes_in_level_sub(&self, level: usize) -> u64 {
        debug_assert!(self.options.enable_sublevel);
        if level == 0 {
            self.pool_bytes(&self.input_pool, 0)
        } else if level < self.input_pool.len() {
            self.pool_bytes(&self.input_pool, level) + self.pool_bytes(&self.output_pool, level)
        } else {
            0
        }
    }

    /// Number of logical levels in sublevel mode.
    pub fn num_levels_sub(&self) -> usize {
        debug_assert!(self.options.enable_sublevel);
        self.input_pool.len()
    }

    /// The per-level input lane slices (sublevel mode).
    pub fn input_pool(&self) -> &[(usize, usize)] {
        &self.input_pool
    }

    /// The per-level output lane slices (sublevel mode).
    pub fn output_pool(&self) -> &[(usize, usize)] {
        &self.output_pool
    }

    /// Render the per-level file layout for diagnostics.
    pub fn debug_string(&self) -> String {
        let mut r = String::new();
        for (level, files) in self.files.iter().enumerate() {
            // E.g.,
            //   --- level 1 ---
            //   17:123['a' .. 'd']
            //   20:43['e' .. 'g']
            r.push_str(&format!("--- level {} ---\n", level));
            for f in files {
                r.push_str(&format!(
                    " {}:{}[{} .. {}]\n",
                    f.number(),
                    f.file_size(),
                    f.smallest(),
                    f.largest()
                ));
            }
        }
        r
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("levels", &self.files.len())
            .field("total_files", &self.total_files())
            .field("compaction_score", &self.compaction_score)
            .field("compaction_level", &self.compaction_level)
            .finish()
    }
}
