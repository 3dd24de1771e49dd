use serde::{Deserialize, Serialize};

/// Sky position of one pointing, ICRS-like frame, degrees.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyPosition {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        SkyPosition { ra_deg, dec_deg }
    }

    /// Small-angle separation in arcseconds; RA scaled by cos(dec).
    ///
    /// Fine at the arcsecond scales this pipeline groups pointings on,
    /// wrong near the poles or across the RA wrap.
    pub fn separation_arcsec(&self, other: &SkyPosition) -> f64 {
        let dec_mid = 0.5 * (self.dec_deg + other.dec_deg);
        let dra = (self.ra_deg - other.ra_deg) * dec_mid.to_radians().cos();
        let ddec = self.dec_deg - other.dec_deg;
        (dra * dra + ddec * ddec).sqrt() * 3600.0
    }
}

/// Per-spectrum metadata for one row of a reduction group.
///
/// `time_group` tags the independent time-ordered split the row came from;
/// rows at the same position but different groups are cross-checked against
/// each other during detection cleaning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpectrumRow {
    pub row_id: usize,
    pub position: SkyPosition,
    pub flag_valid: bool,
    pub time_group: u32,
}

/// One reduction group: all spectra for one spw/field/antenna combination,
/// fully resident in memory.
///
/// Spectral values and channel masks are stored row-major with stride
/// `nchan`; row metadata is indexed by the same row order. `row_id` is the
/// stable external identity, the vector index is the arena index used
/// everywhere inside this subsystem.
#[derive(Clone, Debug, Default)]
pub struct ReductionGroup {
    pub nchan: usize,
    pub rows: Vec<SpectrumRow>,
    data: Vec<f32>,
    channel_mask: Vec<bool>,
}

impl ReductionGroup {
    pub fn new(nchan: usize) -> Self {
        ReductionGroup {
            nchan,
            rows: Vec::new(),
            data: Vec::new(),
            channel_mask: Vec::new(),
        }
    }

    /// Append one row. `mask` marks channels that are already invalid
    /// (true = flagged). Panics if the lengths do not match `nchan`;
    /// uniform channel counts within a group are a caller precondition.
    pub fn push_row(&mut self, row: SpectrumRow, spectrum: &[f32], mask: &[bool]) {
        assert_eq!(spectrum.len(), self.nchan, "spectrum length != nchan");
        assert_eq!(mask.len(), self.nchan, "mask length != nchan");
        self.rows.push(row);
        self.data.extend_from_slice(spectrum);
        self.channel_mask.extend_from_slice(mask);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn spectrum(&self, idx: usize) -> &[f32] {
        &self.data[idx * self.nchan..(idx + 1) * self.nchan]
    }

    #[inline]
    pub fn mask(&self, idx: usize) -> &[bool] {
        &self.channel_mask[idx * self.nchan..(idx + 1) * self.nchan]
    }

    /// Arena indices of rows that survive the upstream summary flag.
    pub fn valid_indices(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.flag_valid)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: usize, ra: f64, dec: f64) -> SpectrumRow {
        SpectrumRow {
            row_id: id,
            position: SkyPosition::new(ra, dec),
            flag_valid: true,
            time_group: 0,
        }
    }

    #[test]
    fn test_separation_arcsec() {
        let a = SkyPosition::new(10.0, 0.0);
        let b = SkyPosition::new(10.0 + 1.0 / 3600.0, 0.0);
        assert!((a.separation_arcsec(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_group_indexing() {
        let mut g = ReductionGroup::new(4);
        g.push_row(row(7, 1.0, 2.0), &[0.0, 1.0, 2.0, 3.0], &[false; 4]);
        g.push_row(row(9, 1.0, 2.0), &[4.0, 5.0, 6.0, 7.0], &[true, false, false, false]);
        assert_eq!(g.len(), 2);
        assert_eq!(g.spectrum(1), &[4.0, 5.0, 6.0, 7.0]);
        assert!(g.mask(1)[0]);
        assert_eq!(g.rows[0].row_id, 7);
    }

    #[test]
    fn test_valid_indices_skip_flagged() {
        let mut g = ReductionGroup::new(2);
        let mut bad = row(0, 0.0, 0.0);
        bad.flag_valid = false;
        g.push_row(bad, &[0.0, 0.0], &[false; 2]);
        g.push_row(row(1, 0.0, 0.0), &[0.0, 0.0], &[false; 2]);
        assert_eq!(g.valid_indices(), vec![1]);
    }
}
