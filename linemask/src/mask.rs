use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use lincore::data::interval::{union_ranges, ChannelRange};
use lincore::data::spectrum::ReductionGroup;

/// External sentinel for "no protection".
pub const NO_MASK: [i64; 2] = [-1, -1];

/// Per-row protection mask plus the iteration bookkeeping the baseline
/// fitter uses to skip rows whose mask has not moved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RowMaskRecord {
    pub row_id: usize,
    /// Disjoint, ascending ranges; empty means no protection.
    pub mask: Vec<ChannelRange>,
    /// `Some(n)`: identical since iteration `n`. `None`: changed in the
    /// latest run.
    pub unchanged_since: Option<u32>,
}

impl RowMaskRecord {
    /// Mask in the external `[[start, end], ...]` form, `[[-1, -1]]` when
    /// empty.
    pub fn mask_channels(&self) -> Vec<[i64; 2]> {
        if self.mask.is_empty() {
            vec![NO_MASK]
        } else {
            self.mask
                .iter()
                .map(|r| [r.start as i64, r.end as i64])
                .collect()
        }
    }
}

/// Merge one row's raw contributions into the minimal disjoint sorted
/// interval list.
pub fn merge_row_mask(raw: &[ChannelRange], nchan: usize) -> Vec<ChannelRange> {
    union_ranges(raw, nchan)
}

/// The per-row protection mask store, the only state that escapes this
/// subsystem. One `apply` call per reduction-group invocation; rows not
/// mentioned in the contributions get the empty mask.
#[derive(Clone, Debug)]
pub struct MaskStore {
    pub nchan: usize,
    records: Vec<RowMaskRecord>,
}

impl MaskStore {
    pub fn new(group: &ReductionGroup) -> Self {
        MaskStore {
            nchan: group.nchan,
            records: group
                .rows
                .iter()
                .map(|r| RowMaskRecord {
                    row_id: r.row_id,
                    mask: Vec::new(),
                    unchanged_since: None,
                })
                .collect(),
        }
    }

    pub fn records(&self) -> &[RowMaskRecord] {
        &self.records
    }

    pub fn record(&self, row_idx: usize) -> &RowMaskRecord {
        &self.records[row_idx]
    }

    /// Merge raw contributions into every row's mask and update the
    /// no-change markers. Returns the number of rows whose mask changed.
    pub fn apply(
        &mut self,
        contributions: &[(usize, ChannelRange)],
        iteration: u32,
    ) -> usize {
        let mut per_row: FxHashMap<usize, Vec<ChannelRange>> = FxHashMap::default();
        for &(row_idx, range) in contributions {
            per_row.entry(row_idx).or_default().push(range);
        }

        let mut changed = 0usize;
        for (idx, rec) in self.records.iter_mut().enumerate() {
            let merged = match per_row.get(&idx) {
                Some(raw) => union_ranges(raw, self.nchan),
                None => Vec::new(),
            };
            if merged == rec.mask {
                rec.unchanged_since = Some(rec.unchanged_since.unwrap_or(iteration));
            } else {
                rec.mask = merged;
                rec.unchanged_since = None;
                changed += 1;
            }
        }
        changed
    }
}
