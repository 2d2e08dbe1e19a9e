//! Sublevel pool reorganization.
//!
//! In sublevel mode every level owns two pools of lanes: an input pool
//! that receives data from the level above, and an output pool that the
//! next compaction drains. After each edit the lanes of the freshly
//! built version are rewritten row-major against the predecessor's
//! layout:
//!
//! - empty lanes are dropped, except an input pool always keeps at least
//!   one lane;
//! - a compaction that consumed level-0 files prepends an empty input
//!   lane at level 1 to make room for its output;
//! - a level that emptied its output pool while the next level still has
//!   input lanes gets the same treatment one level down;
//! - a level whose output pool drained but whose input pool is over
//!   budget demotes all but its top input lane into the output pool;
//! - a non-empty output pool on the terminal level grows a fresh level
//!   after it.

use std::sync::Arc;

use crate::version::version::total_file_size;
use crate::{Error, Result};

use super::{FileMetadata, Version, VersionEdit};

fn lane_at(files: &[Vec<Arc<FileMetadata>>], idx: usize) -> Result<&Vec<Arc<FileMetadata>>> {
    files
        .get(idx)
        .ok_or_else(|| Error::corruption(format!("sublevel row {} out of range", idx)))
}

/// Rewrite `version`'s lanes and pools against the predecessor
/// `current`. On error `version` is unusable and must be discarded; the
/// currently installed version is untouched.
pub(crate) fn reorganize_sublevels(
    version: &mut Version,
    edit: &VersionEdit,
    current: &Version,
) -> Result<()> {
    let options = version.options.clone();
    debug_assert!(options.enable_sublevel);
    if current.input_pool.len() != current.output_pool.len() {
        return Err(Error::corruption("sublevel pools out of step"));
    }

    let files = std::mem::take(&mut version.files);

    let mut new_files: Vec<Vec<Arc<FileMetadata>>> = Vec::with_capacity(files.len() + 1);
    let mut input_pool: Vec<(usize, usize)> = Vec::with_capacity(current.input_pool.len() + 1);
    let mut output_pool: Vec<(usize, usize)> = Vec::with_capacity(current.output_pool.len() + 1);

    let mut new_input_sublevel = false;

    for level in 0..current.input_pool.len() {
        if level == 0 {
            // Level 0 is single-lane on both sides.
            new_files.push(lane_at(&files, 0)?.clone());
            input_pool.push((0, 1));
            output_pool.push((0, 1));
            // A deletion at level 0 means the compaction that produced
            // this edit consumed level-0 files; its output needs a fresh
            // input lane at the next level.
            if edit
                .deleted_files
                .iter()
                .next()
                .is_some_and(|&(lvl, _)| lvl == 0)
            {
                new_input_sublevel = true;
            }
            continue;
        }

        // Copy the input pool's lanes, dropping empties but keeping at
        // least one lane.
        let mut base_sublevel = new_files.len();
        let mut bytes: u64 = 0;
        let mut first = true;
        if new_input_sublevel {
            new_files.push(Vec::new());
            first = false;
        }
        let (in_base, in_len) = current.input_pool[level];
        for i in 0..in_len {
            let lane = lane_at(&files, in_base + i)?;
            if first || !lane.is_empty() {
                bytes += total_file_size(lane);
                new_files.push(lane.clone());
            }
            first = false;
        }
        if first {
            return Err(Error::corruption(format!(
                "level {} lost its input pool",
                level
            )));
        }
        input_pool.push((base_sublevel, new_files.len() - base_sublevel));

        // Copy the output pool's non-empty lanes.
        new_input_sublevel = false;
        base_sublevel = new_files.len();
        let (out_base, out_len) = current.output_pool[level];
        for i in 0..out_len {
            let lane = lane_at(&files, out_base + i)?;
            if !lane.is_empty() {
                new_files.push(lane.clone());
            }
        }
        let mut length = new_files.len() - base_sublevel;

        if length == 0
            && level + 1 < current.input_pool.len()
            && current.input_pool[level + 1].1 > 0
        {
            // This level just finished a full compaction round; the next
            // level's input pool gets a fresh lane for the output.
            new_input_sublevel = true;
        }

        if length == 0 && bytes as f64 >= options.max_bytes_for_level(level) - 1.0 {
            // Over budget with nothing left to drain: demote all but the
            // top input lane into the output pool.
            if input_pool[level].1 == 1 {
                // A single input lane cannot be split; park its data in
                // a fresh lane and leave the original empty on top.
                debug_assert_eq!(input_pool[level].0, new_files.len() - 1);
                let last = new_files.len() - 1;
                let moved = std::mem::take(&mut new_files[last]);
                new_files.push(moved);
                input_pool[level].1 = 2;
            }
            length = input_pool[level].1 - 1;
            if length == 0 {
                return Err(Error::corruption(format!(
                    "level {} has no sublevel to demote for compaction",
                    level
                )));
            }
            input_pool[level].1 = 1;
            output_pool.push((input_pool[level].0 + 1, length));
        } else {
            output_pool.push((base_sublevel, length));
        }

        // A level scored for size compaction must have output lanes to
        // drain, or the planner would spin.
        let mut total: u64 = 0;
        for &(base, len) in [&input_pool[level], &output_pool[level]] {
            for lane in &new_files[base..base + len] {
                total += total_file_size(lane);
            }
        }
        let score = total as f64 / options.max_bytes_for_level(level);
        if output_pool[level].1 == 0 && score >= 1.0 {
            return Err(Error::corruption(format!(
                "level {} needs compaction but has an empty output pool",
                level
            )));
        }
    }

    debug_assert_eq!(input_pool.len(), output_pool.len());
    if output_pool
        .last()
        .is_some_and(|&(_, len)| len > 0)
    {
        // Make room for the terminal level's compaction output.
        new_files.push(Vec::new());
        input_pool.push((new_files.len() - 1, 1));
        output_pool.push((new_files.len(), 0));
    }

    let terminal_ok = output_pool
        .last()
        .is_some_and(|&(base, len)| base == new_files.len() && len == 0);
    let lanes_covered = 1 + input_pool
        .iter()
        .zip(output_pool.iter())
        .skip(1)
        .map(|(i, o)| i.1 + o.1)
        .sum::<usize>();
    if !terminal_ok || lanes_covered != new_files.len() {
        return Err(Error::corruption("sublevel reorganization left gaps"));
    }

    version.files = new_files;
    version.input_pool = input_pool;
    version.output_pool = output_pool;
    Ok(())
}
