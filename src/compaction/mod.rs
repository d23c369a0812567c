//! Leveled compaction planning.
//!
//! Planning is a pure function over a snapshot of the SSTable registry,
//! so it can be unit-tested without touching disk and the engine's
//! compaction worker stays a thin execute loop.
//!
//! ## Policy
//!
//! - **Level 0** holds freshly flushed tables and may contain overlapping
//!   key ranges.  When the L0 table count reaches the configured trigger,
//!   the overlapping set under the union key range — in practice the
//!   whole level — merges into a single level-1 table.
//! - **Level ≥ 1**: when the cumulative byte size of level `L` exceeds
//!   `ratio × size(L-1)` (and `L-1` is non-empty), the oldest table at
//!   `L` plus every overlapping table at `L+1` merge down into `L+1`.
//! - Equal keys resolve to the value from the newer input (larger file
//!   id).  Tombstones are dropped only when no table outside the input
//!   set overlaps the merged key range, i.e. nothing below the output
//!   can still hold an older version of a merged key.
//!
//! The read path orders all tables newest-first by file id and never
//! relies on per-level non-overlap, so compaction is purely a space /
//! read-amplification concern and can never change visible state.


// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Thresholds driving the leveled policy.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of level-0 tables that triggers an L0→L1 merge.
    pub l0_trigger: usize,

    /// A level may grow to this multiple of the previous level's size
    /// before it is compacted down.
    pub level_size_ratio: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_trigger: 10,
            level_size_ratio: 10,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Snapshot view
// ------------------------------------------------------------------------------------------------

/// The planner's view of one SSTable.
#[derive(Debug, Clone)]
pub struct TableMeta {
    /// File id; larger = newer.
    pub file_id: u64,

    /// Current level.
    pub level: u32,

    /// File size in bytes.
    pub size_bytes: u64,

    /// Smallest key.
    pub min_key: Vec<u8>,

    /// Largest key.
    pub max_key: Vec<u8>,
}

impl TableMeta {
    fn overlaps_range(&self, min: &[u8], max: &[u8]) -> bool {
        self.min_key.as_slice() <= max && min <= self.max_key.as_slice()
    }
}

// ------------------------------------------------------------------------------------------------
// Task
// ------------------------------------------------------------------------------------------------

/// One planned merge: the inputs, where the output lands, and whether
/// tombstones may be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    /// File ids to merge, in no particular order.
    pub inputs: Vec<u64>,

    /// Level of the merged output table.
    pub target_level: u32,

    /// True when no surviving table overlaps the merged key range, so
    /// tombstones have nothing left to shadow.
    pub drops_tombstones: bool,
}

// ------------------------------------------------------------------------------------------------
// Planning
// ------------------------------------------------------------------------------------------------

/// Produces the next merge to run, or `None` when the tree is in shape.
pub fn plan(tables: &[TableMeta], config: &CompactionConfig) -> Option<CompactionTask> {
    plan_l0(tables, config).or_else(|| plan_leveled(tables, config))
}

fn plan_l0(tables: &[TableMeta], config: &CompactionConfig) -> Option<CompactionTask> {
    let l0: Vec<&TableMeta> = tables.iter().filter(|t| t.level == 0).collect();
    if l0.is_empty() || l0.len() < config.l0_trigger {
        return None;
    }

    // L0 tables may overlap arbitrarily (each is one flushed memtable),
    // so the overlapping set under the union key range is the whole
    // level; merging it wholesale is what actually shrinks the table
    // count when flushes happen to be disjoint.
    let mut selected = Vec::with_capacity(l0.len());
    let mut min = l0[0].min_key.clone();
    let mut max = l0[0].max_key.clone();
    for table in &l0 {
        if table.min_key < min {
            min = table.min_key.clone();
        }
        if table.max_key > max {
            max = table.max_key.clone();
        }
        selected.push(table.file_id);
    }

    Some(finish_task(tables, selected, 1, &min, &max))
}

fn plan_leveled(tables: &[TableMeta], config: &CompactionConfig) -> Option<CompactionTask> {
    let max_level = tables.iter().map(|t| t.level).max()?;
    for level in 1..=max_level {
        let level_size: u64 = size_of_level(tables, level);
        let prev_size: u64 = size_of_level(tables, level - 1);
        if level_size == 0 || prev_size == 0 || level_size <= config.level_size_ratio * prev_size {
            continue;
        }

        let oldest = tables
            .iter()
            .filter(|t| t.level == level)
            .min_by_key(|t| t.file_id)?;
        let mut selected = vec![oldest.file_id];
        let mut min = oldest.min_key.clone();
        let mut max = oldest.max_key.clone();
        for table in tables {
            if table.level == level + 1 && table.overlaps_range(&min, &max) {
                if table.min_key < min {
                    min = table.min_key.clone();
                }
                if table.max_key > max {
                    max = table.max_key.clone();
                }
                selected.push(table.file_id);
            }
        }

        return Some(finish_task(tables, selected, level + 1, &min, &max));
    }
    None
}

fn size_of_level(tables: &[TableMeta], level: u32) -> u64 {
    tables
        .iter()
        .filter(|t| t.level == level)
        .map(|t| t.size_bytes)
        .sum()
}

fn finish_task(
    tables: &[TableMeta],
    inputs: Vec<u64>,
    target_level: u32,
    min: &[u8],
    max: &[u8],
) -> CompactionTask {
    let shadowed_below = tables
        .iter()
        .any(|t| !inputs.contains(&t.file_id) && t.overlaps_range(min, max));
    CompactionTask {
        inputs,
        target_level,
        drops_tombstones: !shadowed_below,
    }
}
