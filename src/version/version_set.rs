//! VersionSet - owns the live version chain and the MANIFEST.
//!
//! The set composes `current ⊕ edit → v'` through the builder, makes the
//! edit durable in the manifest, and only then installs v' as current.
//! Readers keep whatever version was current when they arrived; the
//! files a version references stay alive (and on disk) until the last
//! such reader lets go.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::options::Options;
use crate::table_cache::TableCache;
use crate::types::InternalKey;
use crate::util::comparator::{Comparator, InternalKeyComparator};
use crate::util::filename::{
    current_file_path, delete_file, descriptor_file_path, set_current_file,
};
use crate::{Error, Result};

use super::manifest::{ManifestReader, ManifestWriter};
use super::sublevel::reorganize_sublevels;
use super::{FileMetadata, Version, VersionBuilder, VersionEdit};

/// Owns the version chain, the manifest writer, and the database-wide
/// counters.
pub struct VersionSet {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<dyn TableCache>,

    /// Next file number to allocate. 1 is reserved for the first
    /// manifest.
    next_file_number: AtomicU64,
    /// Number the next minted manifest file will use.
    manifest_file_number: AtomicU64,
    /// Last sequence number handed out.
    last_sequence: AtomicU64,
    /// Current write-ahead log number.
    log_number: AtomicU64,
    /// Log number of the previous (being-flushed) memtable.
    prev_log_number: AtomicU64,

    /// The most recently installed version.
    current: ArcSwap<Version>,
    /// Every version still referenced by some reader, for live-file
    /// enumeration. Pruned as versions die.
    live: Mutex<Vec<Weak<Version>>>,

    /// Per-level encoded internal key where the last compaction at that
    /// level ended; empty when unset.
    compact_pointers: RwLock<Vec<Vec<u8>>>,

    /// Open manifest writer, created lazily on the first apply.
    manifest: Mutex<Option<ManifestWriter>>,

    /// Serializes log_and_apply/foreign_apply/recover. Readers never
    /// take it; `current` is lock-free.
    apply_lock: Mutex<()>,
}

impl VersionSet {
    /// Create a version set over `db_path` with an empty initial
    /// version.
    pub fn new(db_path: &Path, options: Arc<Options>, table_cache: Arc<dyn TableCache>) -> Self {
        let initial = Arc::new(Version::empty(Arc::clone(&options)));
        let compact_pointer_levels = if options.enable_sublevel {
            0
        } else {
            options.max_mem_compact_level + 1
        };

        Self {
            db_path: db_path.to_path_buf(),
            options,
            icmp: InternalKeyComparator::new(),
            table_cache,
            next_file_number: AtomicU64::new(2),
            manifest_file_number: AtomicU64::new(1),
            last_sequence: AtomicU64::new(0),
            log_number: AtomicU64::new(0),
            prev_log_number: AtomicU64::new(0),
            current: ArcSwap::new(Arc::clone(&initial)),
            live: Mutex::new(vec![Arc::downgrade(&initial)]),
            compact_pointers: RwLock::new(vec![Vec::new(); compact_pointer_levels]),
            manifest: Mutex::new(None),
            apply_lock: Mutex::new(()),
        }
    }

    /// The database directory.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// The configured options.
    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    /// The internal key comparator.
    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// The table cache used to resolve reads against table files.
    pub fn table_cache(&self) -> &Arc<dyn TableCache> {
        &self.table_cache
    }

    /// The current version.
    pub fn current(&self) -> Arc<Version> {
        self.current.load_full()
    }

    /// Allocate and return a fresh file number.
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// The next file number, without allocating it.
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.load(Ordering::SeqCst)
    }

    /// Ensure `number` is never allocated again.
    pub fn mark_file_number_used(&self, number: u64) {
        let mut cur = self.next_file_number.load(Ordering::SeqCst);
        while cur <= number {
            match self.next_file_number.compare_exchange(
                cur,
                number + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
    }

    /// The last sequence number handed out.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Advance the last sequence number. Never moves backwards.
    pub fn set_last_sequence(&self, seq: u64) {
        debug_assert!(seq >= self.last_sequence());
        self.last_sequence.store(seq, Ordering::SeqCst);
    }

    /// The current log number.
    pub fn log_number(&self) -> u64 {
        self.log_number.load(Ordering::SeqCst)
    }

    /// The previous log number.
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number.load(Ordering::SeqCst)
    }

    /// The number the next minted manifest will use.
    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number.load(Ordering::SeqCst)
    }

    /// Name of the user-key comparator this database was built with.
    pub fn comparator_name(&self) -> &str {
        self.icmp.user_comparator().name()
    }

    /// The encoded compact pointer for a level, if set.
    pub fn compact_pointer(&self, level: usize) -> Option<Vec<u8>> {
        let pointers = self.compact_pointers.read();
        match pointers.get(level) {
            Some(p) if !p.is_empty() => Some(p.clone()),
            _ => None,
        }
    }

    /// Record where the next compaction at `level` should resume.
    pub(crate) fn set_compact_pointer(&self, level: usize, encoded: Vec<u8>) {
        let mut pointers = self.compact_pointers.write();
        if pointers.len() <= level {
            pointers.resize(level + 1, Vec::new());
        }
        pointers[level] = encoded;
    }

    fn merge_compact_pointers(
        &self,
        updates: &std::collections::BTreeMap<usize, Vec<u8>>,
    ) {
        for (&level, encoded) in updates {
            self.set_compact_pointer(level, encoded.clone());
        }
    }

    /// Install `v` as the new current version and link it into the live
    /// chain.
    fn append_version(&self, v: Version) {
        let v = Arc::new(v);
        {
            let mut live = self.live.lock();
            live.retain(|w| w.strong_count() > 0);
            live.push(Arc::downgrade(&v));
        }
        self.current.store(v);
    }

    /// Apply `edit` to the current version, make it durable in the
    /// manifest, and install the result.
    ///
    /// Missing counters in the edit are filled from the set's state. On
    /// any manifest failure the new version is discarded, counters are
    /// untouched, and the error is returned; a later call may retry.
    pub fn log_and_apply(&self, edit: &mut VersionEdit) -> Result<()> {
        let _guard = self.apply_lock.lock();

        match edit.log_number {
            Some(n) => {
                if n < self.log_number() || n >= self.next_file_number() {
                    return Err(Error::invalid_argument(format!(
                        "edit log number {} out of range",
                        n
                    )));
                }
            }
            None => edit.set_log_number(self.log_number()),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number());
        }
        edit.set_next_file_number(self.next_file_number());
        edit.set_last_sequence(self.last_sequence());

        let current = self.current();
        let mut builder = VersionBuilder::new(Arc::clone(&self.options), Arc::clone(&current));
        builder.apply(edit)?;
        let mut v = builder.save_to()?;
        if self.options.enable_sublevel {
            reorganize_sublevels(&mut v, edit, &current)?;
        }
        self.finalize(&mut v);

        // Adopt compact-pointer updates immediately rather than waiting
        // for the install, so a failed compaction retries a different
        // key range next time.
        self.merge_compact_pointers(builder.compact_pointers());

        // Initialize a new manifest if necessary, starting it with a
        // snapshot of the current state.
        let mut manifest_guard = self.manifest.lock();
        let mut created: Option<PathBuf> = None;
        if manifest_guard.is_none() {
            let path = descriptor_file_path(&self.db_path, self.manifest_file_number());
            let result = ManifestWriter::create(&path)
                .and_then(|mut w| self.write_snapshot(&mut w).map(|_| w));
            match result {
                Ok(w) => {
                    *manifest_guard = Some(w);
                    created = Some(path);
                }
                Err(e) => {
                    let _ = delete_file(&path);
                    return Err(e);
                }
            }
        }

        let writer = manifest_guard
            .as_mut()
            .ok_or_else(|| Error::internal("no active manifest"))?;

        let mut appended = writer.add_edit(edit);
        if appended.is_ok() {
            appended = if self.options.sync_manifest {
                writer.sync()
            } else {
                writer.flush()
            };
        }

        let installed = appended.and_then(|_| {
            if let Some(_path) = &created {
                if !self.options.rotating_manifest {
                    // Make the new manifest reachable through CURRENT.
                    set_current_file(&self.db_path, self.manifest_file_number())?;
                } else {
                    // Rotation finds the winner by counters; dropping
                    // the alternate file and CURRENT speeds up the next
                    // recovery.
                    let manifest_number = self.manifest_file_number();
                    debug_assert!(manifest_number < 3);
                    for path in [
                        descriptor_file_path(&self.db_path, 3 - manifest_number),
                        current_file_path(&self.db_path),
                    ] {
                        debug!("delete {}", path.display());
                        let _ = delete_file(&path);
                    }
                }
            }
            Ok(())
        });

        if let Err(e) = installed {
            warn!("MANIFEST write: {}", e);
            if let Some(path) = created {
                *manifest_guard = None;
                let _ = delete_file(&path);
            }
            return Err(e);
        }
        drop(manifest_guard);

        // The edit is durable; now (and only now) publish the version.
        self.append_version(v);
        if let Some(n) = edit.log_number {
            self.log_number.store(n, Ordering::SeqCst);
        }
        if let Some(n) = edit.prev_log_number {
            self.prev_log_number.store(n, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Apply an edit produced elsewhere (a bootstrap peer, a test
    /// harness) without touching the manifest.
    ///
    /// The edit's comparator must match and its counters must advance
    /// monotonically.
    pub fn foreign_apply(&self, edit: &VersionEdit) -> Result<()> {
        let _guard = self.apply_lock.lock();

        if let Some(name) = &edit.comparator {
            if name != self.comparator_name() {
                return Err(Error::invalid_argument(format!(
                    "{} does not match existing comparator {}",
                    name,
                    self.comparator_name()
                )));
            }
        }

        let mut next_file_number = self.next_file_number();
        let mut last_sequence = self.last_sequence();
        let mut log_number = self.log_number();
        let mut prev_log_number = self.prev_log_number();

        if let Some(n) = edit.log_number {
            if n < log_number {
                return Err(Error::invalid_argument("log number moved backwards"));
            }
            log_number = n;
        }
        if let Some(n) = edit.prev_log_number {
            if n < prev_log_number {
                return Err(Error::invalid_argument("prev log number moved backwards"));
            }
            prev_log_number = n;
        }
        if let Some(n) = edit.next_file_number {
            if n < next_file_number {
                return Err(Error::invalid_argument("next file number moved backwards"));
            }
            next_file_number = n;
        }
        if let Some(n) = edit.last_sequence {
            if n < last_sequence {
                return Err(Error::invalid_argument("last sequence moved backwards"));
            }
            last_sequence = n;
        }
        if log_number >= next_file_number {
            return Err(Error::invalid_argument(
                "log number not covered by next file number",
            ));
        }

        let current = self.current();
        let mut builder = VersionBuilder::new(Arc::clone(&self.options), Arc::clone(&current));
        builder.apply(edit)?;
        let mut v = builder.save_to()?;
        if self.options.enable_sublevel {
            reorganize_sublevels(&mut v, edit, &current)?;
        }
        // No finalization: nothing will plan compactions off this state.

        self.append_version(v);
        self.log_number.store(log_number, Ordering::SeqCst);
        self.prev_log_number.store(prev_log_number, Ordering::SeqCst);
        self.next_file_number.store(next_file_number, Ordering::SeqCst);
        self.last_sequence.store(last_sequence, Ordering::SeqCst);
        Ok(())
    }

    /// Recover the catalog from disk.
    ///
    /// Considers up to three manifest candidates: the two rotating slots
    /// and the file CURRENT names. Each parseable candidate yields a
    /// counter tuple; the componentwise-greatest tuple wins (compared in
    /// order: last_sequence, next_file, log_number, prev_log_number).
    /// A corrupt candidate is tolerated as long as another one wins.
    ///
    /// Returns `Ok(false)` for a fresh database with no manifest at all.
    pub fn recover(&self) -> Result<bool> {
        let _guard = self.apply_lock.lock();

        let mut first_error: Option<Error> = None;

        let mut names: [Option<PathBuf>; 3] = [None, None, None];
        for slot in 0..2 {
            let path = descriptor_file_path(&self.db_path, slot as u64 + 1);
            if path.exists() {
                names[slot] = Some(path);
            }
        }
        match crate::util::filename::read_current_file(&self.db_path) {
            Ok(Some(name)) => {
                let path = self.db_path.join(&name);
                if names.iter().flatten().all(|p| *p != path) {
                    names[2] = Some(path);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("CURRENT read: {}", e);
                first_error = Some(e);
            }
        }

        if names.iter().all(Option::is_none) {
            return match first_error {
                Some(e) => Err(e),
                None => Ok(false), // fresh database
            };
        }

        let current = self.current();
        let mut selected: Option<usize> = None;
        let mut candidates: [Option<Candidate>; 3] = [None, None, None];
        let mut final_next_file = 0u64;
        let mut final_last_seq = 0u64;
        let mut final_log_number = 0u64;
        let mut final_prev_log_number = 0u64;

        for (slot, path) in names.iter().enumerate() {
            let path = match path {
                Some(p) => p,
                None => continue,
            };

            match self.load_candidate(path, &current) {
                Ok(candidate) => {
                    self.mark_file_number_used(candidate.prev_log_number);
                    self.mark_file_number_used(candidate.log_number);

                    if candidate.last_seq >= final_last_seq
                        && candidate.next_file >= final_next_file
                        && candidate.log_number >= final_log_number
                        && candidate.prev_log_number >= final_prev_log_number
                    {
                        final_last_seq = candidate.last_seq;
                        final_next_file = candidate.next_file;
                        final_log_number = candidate.log_number;
                        final_prev_log_number = candidate.prev_log_number;
                        selected = Some(slot);
                    }
                    candidates[slot] = Some(candidate);
                }
                Err(e) => {
                    warn!("MANIFEST read {}: {}", path.display(), e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let selected = match selected {
            Some(slot) => slot,
            None => {
                return Err(first_error
                    .unwrap_or_else(|| Error::corruption("no valid manifest available")));
            }
        };

        let winner = candidates[selected]
            .as_ref()
            .ok_or_else(|| Error::internal("selected candidate missing"))?;

        let mut v = winner.builder.save_to()?;
        self.finalize(&mut v);
        self.append_version(v);
        self.merge_compact_pointers(winner.builder.compact_pointers());

        if !self.options.rotating_manifest {
            self.next_file_number
                .store(final_next_file + 1, Ordering::SeqCst);
            self.manifest_file_number
                .store(final_next_file, Ordering::SeqCst);
        } else {
            self.next_file_number.store(final_next_file, Ordering::SeqCst);
            // Write into the slot the winner did not come from.
            let next_slot = if selected == 0 { 2 } else { 1 };
            self.manifest_file_number.store(next_slot, Ordering::SeqCst);
        }

        self.log_number.store(final_log_number, Ordering::SeqCst);
        self.prev_log_number
            .store(final_prev_log_number, Ordering::SeqCst);
        self.last_sequence.store(final_last_seq, Ordering::SeqCst);

        Ok(true)
    }

    /// Fold one manifest candidate into a builder and collect its final
    /// counter tuple.
    fn load_candidate(&self, path: &Path, base: &Arc<Version>) -> Result<Candidate> {
        let mut reader = ManifestReader::open(path)?;
        let mut builder = VersionBuilder::new(Arc::clone(&self.options), Arc::clone(base));

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file = None;
        let mut last_seq = None;

        while let Some(edit) = reader.read_edit()? {
            if let Some(name) = &edit.comparator {
                if name != self.comparator_name() {
                    return Err(Error::invalid_argument(format!(
                        "{} does not match existing comparator {}",
                        name,
                        self.comparator_name()
                    )));
                }
            }

            builder.apply(&edit)?;

            if let Some(n) = edit.log_number {
                log_number = Some(n);
            }
            if let Some(n) = edit.prev_log_number {
                prev_log_number = Some(n);
            }
            if let Some(n) = edit.next_file_number {
                next_file = Some(n);
            }
            if let Some(n) = edit.last_sequence {
                last_seq = Some(n);
            }
        }

        let next_file =
            next_file.ok_or_else(|| Error::corruption("no next_file entry in descriptor"))?;
        let log_number =
            log_number.ok_or_else(|| Error::corruption("no log_number entry in descriptor"))?;
        let last_seq =
            last_seq.ok_or_else(|| Error::corruption("no last_seq_number entry in descriptor"))?;

        Ok(Candidate {
            builder,
            next_file,
            last_seq,
            log_number,
            prev_log_number: prev_log_number.unwrap_or(0),
        })
    }

    /// Write a snapshot of the current state as a single edit: the
    /// comparator name, every non-empty compact pointer, and every live
    /// file. Used as the first record of a newly minted manifest.
    pub(crate) fn write_snapshot(&self, writer: &mut ManifestWriter) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator(self.comparator_name());

        {
            let pointers = self.compact_pointers.read();
            for (level, encoded) in pointers.iter().enumerate() {
                if !encoded.is_empty() {
                    let key = InternalKey::decode(encoded)
                        .ok_or_else(|| Error::corruption("undecodable compact pointer"))?;
                    edit.set_compact_pointer(level, key);
                }
            }
        }

        let current = self.current();
        for (level, f) in current.all_files() {
            edit.add_file(level, f.as_ref().clone());
        }

        writer.add_edit(&edit)
    }

    /// Precompute the best level for the next size compaction.
    pub(crate) fn finalize(&self, v: &mut Version) {
        let mut best_level = None;
        let mut best_score = -1.0f64;

        if self.options.enable_sublevel {
            debug_assert_eq!(v.input_pool.len(), v.output_pool.len());
            for level in 0..v.input_pool.len().saturating_sub(1) {
                let score = if level == 0 {
                    v.files[0].len() as f64 / self.options.l0_compaction_trigger as f64
                } else {
                    v.num_bytes_in_level_sub(level) as f64
                        / self.options.max_bytes_for_level(level)
                };
                if score > best_score {
                    best_level = Some(level);
                    best_score = score;
                }
            }
        } else {
            for level in 0..v.files.len().saturating_sub(1) {
                let score = if level == 0 {
                    // Level 0 is bounded by file count, not bytes: with
                    // larger write buffers fewer level-0 compactions are
                    // better, and every level-0 file is consulted by
                    // every read regardless of its size.
                    v.files[0].len() as f64 / self.options.l0_compaction_trigger as f64
                } else {
                    v.level_bytes(level) as f64 / self.options.max_bytes_for_level(level)
                };
                if score > best_score {
                    best_level = Some(level);
                    best_score = score;
                }
            }
        }

        v.compaction_level = best_level;
        v.compaction_score = best_score;
    }

    /// Union of file numbers referenced by any live version.
    pub fn live_files(&self) -> BTreeSet<u64> {
        let mut live = BTreeSet::new();
        let mut registry = self.live.lock();
        registry.retain(|w| w.strong_count() > 0);
        for weak in registry.iter() {
            if let Some(v) = weak.upgrade() {
                for (_, f) in v.all_files() {
                    live.insert(f.number());
                }
            }
        }
        live
    }

    /// Number of files in a level of the current version.
    pub fn num_level_files(&self, level: usize) -> usize {
        let current = self.current();
        if self.options.enable_sublevel {
            current.num_files_in_level_sub(level)
        } else if level < current.num_levels() {
            current.num_files(level)
        } else {
            0
        }
    }

    /// Bytes in a level of the current version.
    pub fn num_level_bytes(&self, level: usize) -> u64 {
        let current = self.current();
        if self.options.enable_sublevel {
            current.num_bytes_in_level_sub(level)
        } else if level < current.num_levels() {
            current.level_bytes(level)
        } else {
            0
        }
    }

    /// One-line per-level file-count rendering, for logs.
    pub fn level_summary(&self) -> String {
        let current = self.current();
        let mut summary = String::from("files[");
        if self.options.enable_sublevel {
            for level in 0..current.num_levels_sub() {
                summary.push_str(&format!(
                    " {}@{}&{}",
                    current.num_files_in_level_sub(level),
                    current.input_pool[level].1,
                    current.output_pool[level].1,
                ));
            }
        } else {
            for level in 0..current.num_levels() {
                summary.push_str(&format!(" {}", current.num_files(level)));
            }
        }
        summary.push_str(" ]");
        summary
    }

    /// Largest overlap (in bytes) any single file has with the next
    /// level. A gauge of how expensive compactions are about to get.
    pub fn max_next_level_overlapping_bytes(&self) -> u64 {
        let current = self.current();
        let mut result = 0;
        for level in 1..current.num_levels().saturating_sub(1) {
            for f in current.files(level) {
                let overlaps = current.get_overlapping_inputs(
                    level + 1,
                    Some(f.smallest()),
                    Some(f.largest()),
                );
                let sum = super::version::total_file_size(&overlaps);
                result = result.max(sum);
            }
        }
        result
    }
}

/// One folded manifest candidate and the counter tuple it ended with.
struct Candidate {
    builder: VersionBuilder,
    next_file: u64,
    last_seq: u64,
    log_number: u64,
    prev_log_number: u64,
}
