use statrs::distribution::{ContinuousCDF, Normal};

/// Running-mean smoothing with edge clamping.
///
/// `half_width` is the number of neighbors on each side; the window shrinks
/// at the spectrum edges instead of reflecting, so edge channels stay close
/// to their raw values.
pub fn box_smooth(y: &[f32], half_width: usize) -> Vec<f32> {
    let n = y.len();
    if n == 0 || half_width == 0 {
        return y.to_vec();
    }
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(half_width);
        let hi = (i + half_width).min(n - 1);
        let mut acc = 0.0f64;
        for &v in &y[lo..=hi] {
            acc += v as f64;
        }
        out.push((acc / (hi - lo + 1) as f64) as f32);
    }
    out
}

/// Average `factor` native channels into one binned channel.
///
/// Masked channels are excluded from the average; a binned channel is
/// masked only when every contributing channel was masked. The trailing
/// partial bin (when `factor` does not divide the length) is dropped, as
/// its statistics are not comparable to full bins.
pub fn bin_spectrum(y: &[f32], mask: &[bool], factor: usize) -> (Vec<f32>, Vec<bool>) {
    assert_eq!(y.len(), mask.len(), "spectrum/mask length mismatch");
    if factor <= 1 {
        return (y.to_vec(), mask.to_vec());
    }
    let nbin = y.len() / factor;
    let mut by = Vec::with_capacity(nbin);
    let mut bm = Vec::with_capacity(nbin);
    for b in 0..nbin {
        let lo = b * factor;
        let mut acc = 0.0f64;
        let mut cnt = 0usize;
        for c in lo..lo + factor {
            if !mask[c] {
                acc += y[c] as f64;
                cnt += 1;
            }
        }
        if cnt == 0 {
            by.push(0.0);
            bm.push(true);
        } else {
            by.push((acc / cnt as f64) as f32);
            bm.push(false);
        }
    }
    (by, bm)
}

/// Power-of-4 binning factors to search for lines: 1, 4, 16, ... capped so
/// a binned spectrum keeps at least ~50 channels.
pub fn binning_schedule(nchan: usize) -> Vec<usize> {
    let mut out = vec![1usize];
    let mut b = 4usize;
    while b <= nchan / 50 {
        out.push(b);
        b *= 4;
    }
    out
}

/// MAD-based robust noise estimate.
///
/// Median absolute deviation about the median, scaled to the equivalent
/// Gaussian sigma. Insensitive to the line channels themselves as long as
/// they are a minority of the samples.
pub fn robust_noise_mad(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let med = median_f32(samples);
    let dev: Vec<f32> = samples.iter().map(|&v| (v - med).abs()).collect();
    let mad = median_f32(&dev);
    mad * mad_to_sigma() as f32
}

/// Scale from MAD to Gaussian sigma: 1 / Phi^-1(3/4) ~= 1.4826.
fn mad_to_sigma() -> f64 {
    let n = Normal::standard();
    1.0 / n.inverse_cdf(0.75)
}

/// Median of a float slice; non-finite values are ignored.
pub fn median_f32(v: &[f32]) -> f32 {
    let mut s: Vec<f32> = v.iter().copied().filter(|x| x.is_finite()).collect();
    if s.is_empty() {
        return 0.0;
    }
    s.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = s.len();
    if n % 2 == 1 {
        s[n / 2]
    } else {
        0.5 * (s[n / 2 - 1] + s[n / 2])
    }
}

/// Median of an f64 slice; non-finite values are ignored.
pub fn median_f64(v: &[f64]) -> f64 {
    let mut s: Vec<f64> = v.iter().copied().filter(|x| x.is_finite()).collect();
    if s.is_empty() {
        return 0.0;
    }
    s.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = s.len();
    if n % 2 == 1 {
        s[n / 2]
    } else {
        0.5 * (s[n / 2 - 1] + s[n / 2])
    }
}

/// Mean and population standard deviation; (0, 0) for an empty slice.
pub fn mean_std(v: &[f64]) -> (f64, f64) {
    if v.is_empty() {
        return (0.0, 0.0);
    }
    let n = v.len() as f64;
    let mean = v.iter().sum::<f64>() / n;
    let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}
