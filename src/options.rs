//! Configuration options for versiondb.

/// Default number of L0 files that triggers a compaction.
pub const DEFAULT_L0_COMPACTION_TRIGGER: usize = 4;

/// Default multiplier for the level-1 byte budget.
pub const DEFAULT_L1_COMPACTION_TRIGGER: usize = 5;

/// Default per-level size multiplier.
pub const DEFAULT_LEVEL_FACTOR: usize = 10;

/// Default target size for a single table file (2MB).
pub const DEFAULT_TABLE_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Default highest level a fresh memtable output may be pushed to.
pub const DEFAULT_MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Configuration for the version set and compaction planner.
///
/// These knobs control when compactions fire and how large their inputs
/// may grow. The derived helpers mirror the level-size arithmetic used
/// throughout the planner.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of level-0 files that triggers a size compaction.
    pub l0_compaction_trigger: usize,

    /// Level-1 holds `l1_compaction_trigger * table_file_size` bytes
    /// before a size compaction fires there.
    pub l1_compaction_trigger: usize,

    /// Each level past 1 holds `level_factor` times the bytes of the
    /// previous one. Also bounds grandparent overlap.
    pub level_factor: usize,

    /// Target size for table files produced by compactions.
    pub table_file_size: u64,

    /// Highest level a memtable flush output may be placed at when it
    /// overlaps nothing below.
    pub max_mem_compact_level: usize,

    /// Partition levels into input/output sublevel lanes.
    pub enable_sublevel: bool,

    /// Alternate between MANIFEST-1 and MANIFEST-2 instead of minting a
    /// fresh manifest number and updating CURRENT.
    pub rotating_manifest: bool,

    /// Split compaction outputs when they overlap too many grandparent
    /// bytes, and let that bound veto trivial moves.
    pub enable_should_stop_before: bool,

    /// Turn builder overlap violations into errors instead of debug
    /// assertions.
    pub paranoid_checks: bool,

    /// Fsync the manifest after every appended record.
    pub sync_manifest: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            l0_compaction_trigger: DEFAULT_L0_COMPACTION_TRIGGER,
            l1_compaction_trigger: DEFAULT_L1_COMPACTION_TRIGGER,
            level_factor: DEFAULT_LEVEL_FACTOR,
            table_file_size: DEFAULT_TABLE_FILE_SIZE,
            max_mem_compact_level: DEFAULT_MAX_MEM_COMPACT_LEVEL,
            enable_sublevel: false,
            rotating_manifest: false,
            enable_should_stop_before: true,
            paranoid_checks: false,
            sync_manifest: true,
        }
    }
}

impl Options {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.l0_compaction_trigger == 0 {
            return Err(crate::Error::invalid_argument(
                "l0_compaction_trigger must be at least 1",
            ));
        }
        if self.l1_compaction_trigger == 0 {
            return Err(crate::Error::invalid_argument(
                "l1_compaction_trigger must be at least 1",
            ));
        }
        if self.level_factor < 2 {
            return Err(crate::Error::invalid_argument(
                "level_factor must be at least 2",
            ));
        }
        if self.table_file_size < 1024 {
            return Err(crate::Error::invalid_argument(
                "table_file_size must be at least 1KB",
            ));
        }
        Ok(())
    }

    /// Maximum bytes of grandparent (level+2) overlap before a compaction
    /// output is split into a new table.
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        self.level_factor as u64 * self.table_file_size
    }

    /// Maximum bytes in all compacted files. Input expansion at the lower
    /// level is rejected if it would push the total past this.
    pub fn expanded_compaction_byte_size_limit(&self) -> u64 {
        (2 * (self.level_factor as u64 + 2) + 1) * self.table_file_size
    }

    /// Byte budget for a level. Level 1 holds
    /// `l1_compaction_trigger * table_file_size`; each level after that
    /// multiplies by `level_factor`.
    ///
    /// The result for level zero is not really used since the level-0
    /// compaction threshold is based on the number of files.
    pub fn max_bytes_for_level(&self, level: usize) -> f64 {
        let mut result = (self.l1_compaction_trigger as u64 * self.table_file_size) as f64;
        let mut level = level;
        while level > 1 {
            result *= self.level_factor as f64;
            level -= 1;
        }
        result
    }

    /// Target size for table files written at a level.
    pub fn max_file_size_for_level(&self, _level: usize) -> u64 {
        // TODO(opt): vary per level to reduce the number of files?
        self.table_file_size
    }

    /// Upper bound on the bytes read by one sublevel compaction.
    pub fn max_compaction_size_for_level(&self, _level: usize) -> u64 {
        debug_assert!(self.enable_sublevel);
        self.level_factor as u64 * self.table_file_size
    }
}

/// Builder for Options.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the level-0 compaction trigger.
    pub fn l0_compaction_trigger(mut self, n: usize) -> Self {
        self.options.l0_compaction_trigger = n;
        self
    }

    /// Set the level-1 byte-budget multiplier.
    pub fn l1_compaction_trigger(mut self, n: usize) -> Self {
        self.options.l1_compaction_trigger = n;
        self
    }

    /// Set the per-level size multiplier.
    pub fn level_factor(mut self, n: usize) -> Self {
        self.options.level_factor = n;
        self
    }

    /// Set the target table file size.
    pub fn table_file_size(mut self, bytes: u64) -> Self {
        self.options.table_file_size = bytes;
        self
    }

    /// Enable or disable sublevel lanes.
    pub fn enable_sublevel(mut self, value: bool) -> Self {
        self.options.enable_sublevel = value;
        self
    }

    /// Enable or disable manifest rotation.
    pub fn rotating_manifest(mut self, value: bool) -> Self {
        self.options.rotating_manifest = value;
        self
    }

    /// Enable or disable paranoid checks.
    pub fn paranoid_checks(mut self, value: bool) -> Self {
        self.options.paranoid_checks = value;
        self
    }

    /// Build the options.
    pub fn build(self) -> crate::Result<Options> {
        self.options.validate()?;
        Ok(self.options)
    }
}
