use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Inclusive channel range `[start, end]` inside one spectrum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRange {
    pub start: usize,
    pub end: usize,
}

impl ChannelRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "inverted channel range {}..{}", start, end);
        ChannelRange { start, end }
    }

    /// Width in channels, counting both endpoints.
    #[inline]
    pub fn width(&self) -> usize {
        self.end - self.start + 1
    }

    /// Line center in fractional channel units.
    #[inline]
    pub fn center(&self) -> f64 {
        0.5 * (self.start as f64 + self.end as f64)
    }

    /// Number of channels shared with `other` (0 if disjoint).
    #[inline]
    pub fn overlap_channels(&self, other: &ChannelRange) -> usize {
        let lo = self.start.max(other.start);
        let hi = self.end.min(other.end);
        if hi >= lo { hi - lo + 1 } else { 0 }
    }

    /// Overlap as a fraction of the narrower of the two ranges.
    #[inline]
    pub fn overlap_fraction(&self, other: &ChannelRange) -> f64 {
        let shared = self.overlap_channels(other);
        if shared == 0 {
            return 0.0;
        }
        shared as f64 / self.width().min(other.width()) as f64
    }

    #[inline]
    pub fn contains_channel(&self, chan: usize) -> bool {
        chan >= self.start && chan <= self.end
    }
}

/// Union of possibly overlapping, possibly unordered inclusive ranges.
///
/// Marks every covered channel in a length-(nchan+2) occupancy array and
/// recovers the merged ranges from the boundary transitions, so the result
/// is independent of input order and internal overlap. Ranges are clipped
/// to `[0, nchan)`; the output is disjoint and sorted ascending.
pub fn union_ranges(ranges: &[ChannelRange], nchan: usize) -> Vec<ChannelRange> {
    if nchan == 0 || ranges.is_empty() {
        return Vec::new();
    }

    // one guard cell on each side so transitions at 0 and nchan-1 are seen
    let mut covered = vec![false; nchan + 2];
    for r in ranges {
        if r.start >= nchan {
            continue;
        }
        let hi = r.end.min(nchan - 1);
        for c in r.start..=hi {
            covered[c + 1] = true;
        }
    }

    let mut out = Vec::new();
    let mut open: Option<usize> = None;
    for (i, (&a, &b)) in covered.iter().tuple_windows().enumerate() {
        match (a, b) {
            (false, true) => open = Some(i), // rising edge: range starts at channel i
            (true, false) => {
                if let Some(s) = open.take() {
                    out.push(ChannelRange::new(s, i - 1));
                }
            }
            _ => {}
        }
    }
    out
}

/// True if adjacent ranges in `sorted` never touch or overlap.
pub fn is_disjoint_sorted(sorted: &[ChannelRange]) -> bool {
    sorted
        .windows(2)
        .all(|w| w[0].end < w[1].start && w[0].start <= w[1].start)
}
