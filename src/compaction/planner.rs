//! Input selection for compactions.
//!
//! Size-triggered compactions walk each level round-robin via the
//! per-level compact pointers; seek-triggered ones start from the file
//! whose read budget ran out. Either way the seed file is grown into a
//! closed input set against the next level before the plan is handed to
//! the executor.

use std::sync::Arc;

use log::debug;

use crate::types::InternalKey;
use crate::util::comparator::Comparator;
use crate::version::version::total_file_size;
use crate::version::{FileMetadata, Version, VersionSet};
use crate::{Error, Result};

use super::Compaction;

/// Smallest and largest internal keys covered by `inputs`.
fn key_range(inputs: &[Arc<FileMetadata>]) -> Option<(InternalKey, InternalKey)> {
    let mut range: Option<(InternalKey, InternalKey)> = None;
    for f in inputs {
        range = Some(match range {
            None => (f.smallest().clone(), f.largest().clone()),
            Some((mut smallest, mut largest)) => {
                if f.smallest() < &smallest {
                    smallest = f.smallest().clone();
                }
                if f.largest() > &largest {
                    largest = f.largest().clone();
                }
                (smallest, largest)
            }
        });
    }
    range
}

/// Smallest and largest internal keys covered by two input sets.
fn key_range2(
    a: &[Arc<FileMetadata>],
    b: &[Arc<FileMetadata>],
) -> Option<(InternalKey, InternalKey)> {
    let all: Vec<Arc<FileMetadata>> = a.iter().chain(b.iter()).cloned().collect();
    key_range(&all)
}

impl VersionSet {
    /// Pick the next compaction to run, or `None` when nothing is due.
    ///
    /// Compactions triggered by too much data in a level take priority
    /// over those triggered by seeks.
    pub fn pick_compaction(&self, allow_seek_compaction: bool) -> Result<Option<Compaction>> {
        let current = self.current();
        let options = self.options();

        let size_compaction = current.compaction_score() >= 1.0;
        let seek_state = current.file_to_compact();

        let mut c = if size_compaction {
            let level = current
                .compaction_level()
                .ok_or_else(|| Error::internal("compaction score without a level"))?;

            if options.enable_sublevel {
                // Sublevel input selection is self-contained; the edit
                // carries no compact pointer.
                return self
                    .setup_sublevel_inputs(level, &current)
                    .map(Some);
            }

            let mut c = Compaction::new(options, level, Arc::clone(&current));

            // Pick the first file that comes after the compact pointer
            // for this level, wrapping around at the end of the key
            // space.
            let pointer = self.compact_pointer(level);
            for f in current.files(level) {
                let past_pointer = match &pointer {
                    Some(p) => {
                        self.icmp().compare(&f.largest().encode(), p)
                            == std::cmp::Ordering::Greater
                    }
                    None => true,
                };
                if past_pointer {
                    c.inputs[0].push(Arc::clone(f));
                    break;
                }
            }
            if c.inputs[0].is_empty() {
                match current.files(level).first() {
                    Some(f) => c.inputs[0].push(Arc::clone(f)),
                    None => return Ok(None), // level emptied since scoring
                }
            }
            c
        } else if allow_seek_compaction && seek_state.is_some() {
            if options.enable_sublevel {
                // Seek charging records lane indices, which the sublevel
                // planner cannot consume; size compactions only.
                return Ok(None);
            }
            let (file, level) = match seek_state {
                Some(s) => s,
                None => return Ok(None),
            };
            let mut c = Compaction::new(options, level, Arc::clone(&current));
            c.inputs[0].push(file);
            c
        } else {
            return Ok(None);
        };

        // Files in level 0 may overlap each other, so pick up all
        // overlapping ones; this replaces the seed with the closed set
        // containing it.
        if c.level() == 0 {
            if let Some((smallest, largest)) = key_range(&c.inputs[0]) {
                c.inputs[0] = current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
                debug_assert!(!c.inputs[0].is_empty());
            }
        }

        self.setup_other_inputs(&mut c, &current);

        Ok(Some(c))
    }

    /// Complete a plan seeded with `inputs[0]`: pull in the overlapping
    /// next-level files, grow the seed when that costs nothing, collect
    /// grandparents, and advance the compact pointer.
    fn setup_other_inputs(&self, c: &mut Compaction, current: &Arc<Version>) {
        let level = c.level();
        let options = self.options();

        let (mut smallest, mut largest) = match key_range(&c.inputs[0]) {
            Some(range) => range,
            None => return,
        };

        c.inputs[1] = current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

        let (mut all_start, mut all_limit) = match key_range2(&c.inputs[0], &c.inputs[1]) {
            Some(range) => range,
            None => return,
        };

        // See if the number of inputs at `level` can grow without
        // changing the set of `level+1` files picked up.
        if !c.inputs[1].is_empty() {
            let expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            let inputs0_size = total_file_size(&c.inputs[0]);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size < options.expanded_compaction_byte_size_limit()
            {
                if let Some((new_start, new_limit)) = key_range(&expanded0) {
                    let expanded1 = current.get_overlapping_inputs(
                        level + 1,
                        Some(&new_start),
                        Some(&new_limit),
                    );
                    if expanded1.len() == c.inputs[1].len() {
                        debug!(
                            "expanding@{} {}+{} ({}+{} bytes) to {}+{} ({}+{} bytes)",
                            level,
                            c.inputs[0].len(),
                            c.inputs[1].len(),
                            inputs0_size,
                            inputs1_size,
                            expanded0.len(),
                            expanded1.len(),
                            expanded0_size,
                            inputs1_size,
                        );
                        smallest = new_start;
                        largest = new_limit;
                        c.inputs[0] = expanded0;
                        c.inputs[1] = expanded1;
                        if let Some(range) = key_range2(&c.inputs[0], &c.inputs[1]) {
                            all_start = range.0;
                            all_limit = range.1;
                        }
                    }
                }
            }
        }

        // Grandparents bound how large an output file may grow
        // (parent == level+1; grandparent == level+2).
        if level + 2 < current.num_levels() {
            c.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        debug!("compacting@{} '{}' .. '{}'", level, smallest, largest);

        // Update the resume point immediately instead of waiting for the
        // edit to apply, so a failed compaction tries a different key
        // range next time.
        self.set_compact_pointer(level, largest.encode().to_vec());
        c.edit.set_compact_pointer(level, largest);
    }

    /// Build a sublevel plan for `level`: one input lane per lane of its
    /// output pool, covering a key range grown until every lane's
    /// overlap is closed.
    fn setup_sublevel_inputs(&self, level: usize, current: &Arc<Version>) -> Result<Compaction> {
        let options = self.options();
        debug_assert!(options.enable_sublevel);

        let output_pool = current.output_pool();
        let input_pool = current.input_pool();
        if level >= output_pool.len() || output_pool[level].1 == 0 {
            return Err(Error::corruption(format!(
                "level {} scored for compaction with an empty output pool",
                level
            )));
        }
        if level + 1 >= input_pool.len() || input_pool[level + 1].1 == 0 {
            return Err(Error::corruption(format!(
                "level {} has no input lane to compact into",
                level + 1
            )));
        }

        let (base, lanes) = output_pool[level];
        let output_sublevel = input_pool[level + 1].0;
        let mut c = Compaction::new_sublevel(
            options,
            level,
            Arc::clone(current),
            base,
            output_sublevel,
            lanes,
        );

        // Seed with the file holding the globally smallest left bound
        // across the non-empty lanes.
        let mut seed: Option<(Arc<FileMetadata>, usize)> = None;
        for i in 0..lanes {
            let lane = current.files(base + i);
            if let Some(f) = lane.first() {
                if seed
                    .as_ref()
                    .map_or(true, |(s, _)| f.smallest() < s.smallest())
                {
                    seed = Some((Arc::clone(f), i));
                }
            }
        }
        let (seed_file, seed_lane) = seed.ok_or_else(|| {
            Error::corruption(format!("level {} output pool has only empty lanes", level))
        })?;

        let left_bound = seed_file.smallest().clone();
        let mut right_bound = seed_file.largest().clone();

        // Extend the right bound until no lane has a file leaking over
        // it: any file that starts at or before the bound drags its own
        // upper end in.
        if level > 0 {
            c.start_key = Some(left_bound.clone());
            let ucmp = *self.icmp().user_comparator();
            let mut next_visit = vec![0usize; lanes];
            next_visit[seed_lane] = 1;

            loop {
                let mut has_changed = false;
                for (i, cursor) in next_visit.iter_mut().enumerate() {
                    let lane = current.files(base + i);
                    let right_key = right_bound.user_key().to_vec();
                    while *cursor < lane.len()
                        && ucmp.compare(lane[*cursor].largest().user_key(), &right_key)
                            != std::cmp::Ordering::Greater
                    {
                        *cursor += 1;
                    }
                    if *cursor >= lane.len() {
                        continue;
                    }
                    let file = &lane[*cursor];
                    if ucmp.compare(file.smallest().user_key(), right_bound.user_key())
                        != std::cmp::Ordering::Greater
                    {
                        right_bound = file.largest().clone();
                        has_changed = true;
                        *cursor += 1;
                    }
                }
                if !has_changed {
                    break;
                }
            }
        }

        for i in 0..lanes {
            c.inputs[i] =
                current.get_overlapping_inputs(base + i, Some(&left_bound), Some(&right_bound));
        }

        Ok(c)
    }

    /// Plan a compaction covering `[begin, end]` at `level`.
    ///
    /// Bounded to roughly one output file's worth of input for levels
    /// past 0, since level-0 files overlap and must all move together.
    /// Not available in sublevel mode.
    pub fn compact_range(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Result<Option<Compaction>> {
        let options = self.options();
        if options.enable_sublevel {
            return Err(Error::not_supported(
                "range compaction with sublevels enabled",
            ));
        }

        let current = self.current();
        if level >= current.num_levels() {
            return Ok(None);
        }

        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return Ok(None);
        }

        // Avoid compacting too much in one shot when the range is large.
        // Level 0 is exempt: its files overlap, and dropping an older
        // overlapping file while keeping a newer one would resurface
        // stale data.
        if level > 0 {
            let limit = options.max_file_size_for_level(level);
            let mut total = 0;
            for (i, f) in inputs.iter().enumerate() {
                total += f.file_size();
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(options, level, Arc::clone(&current));
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c, &current);
        Ok(Some(c))
    }
}
