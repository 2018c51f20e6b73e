// histeq.rs — Global histogram equalization, CPU reference.
//
// Histogram equalization redistributes intensities so the output
// approximates a uniform distribution:
//
//   1. Histogram: count occurrences of each intensity 0..=255.
//   2. Cumulative: inclusive prefix sum, cumulative[i] = Σ hist[0..=i].
//   3. LUT: lut[i] = round(cumulative[i] * 255 / total), clamped to 255.
//   4. Back-projection: output[p] = lut[input[p]].
//
// These serial routines are the authority the device pipeline is checked
// against: every backend must reproduce them bit-for-bit. The types here
// are also the host-side copies the pipeline reads back for diagnostics.
//
// ROUNDING
// ────────
// The LUT is computed in exact integer arithmetic:
//
//   lut[i] = min(255, (255 * c + total / 2) / total)
//
// which is round-half-up of c * 255 / total. The product needs 64 bits
// (c can reach 2^32 - 1). Note there is no "cdf_min" offset: a constant
// image maps every level to 255, and the darkest occupied level of a
// varied image does not necessarily become 0.

use std::fmt;

use crate::image::Plane;

/// Number of histogram bins (one per 8-bit intensity).
pub const BIN_COUNT: usize = 256;

/// Largest output intensity.
const MAX_LEVEL: u64 = 255;

// ============================================================
// Histogram
// ============================================================

/// 256 pixel counts indexed by intensity.
#[derive(Clone, PartialEq, Eq)]
pub struct Histogram {
    counts: [u32; BIN_COUNT],
}

impl Histogram {
    pub fn from_counts(counts: [u32; BIN_COUNT]) -> Self {
        Histogram { counts }
    }

    pub fn counts(&self) -> &[u32; BIN_COUNT] {
        &self.counts
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Check that the counts add up to the plane's pixel count.
    pub fn verify(&self, pixel_count: usize) -> Result<(), String> {
        let total = self.total();
        if total != pixel_count as u64 {
            return Err(format!("histogram sums to {total}, expected {pixel_count} pixels"));
        }
        Ok(())
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Histogram ")?;
        fmt_bins(f, &self.counts)
    }
}

// ============================================================
// Cumulative histogram
// ============================================================

/// Inclusive prefix sum of a histogram. Non-decreasing; the last entry is
/// the total pixel count.
#[derive(Clone, PartialEq, Eq)]
pub struct CumulativeHistogram {
    values: [u32; BIN_COUNT],
}

impl CumulativeHistogram {
    pub fn from_values(values: [u32; BIN_COUNT]) -> Self {
        CumulativeHistogram { values }
    }

    pub fn values(&self) -> &[u32; BIN_COUNT] {
        &self.values
    }

    /// Last entry: the number of pixels counted.
    pub fn total(&self) -> u32 {
        self.values[BIN_COUNT - 1]
    }

    pub fn verify(&self, pixel_count: usize) -> Result<(), String> {
        if let Some(i) = self.values.windows(2).position(|w| w[1] < w[0]) {
            return Err(format!(
                "cumulative histogram decreases at bin {} ({} -> {})",
                i + 1,
                self.values[i],
                self.values[i + 1],
            ));
        }
        if self.total() as u64 != pixel_count as u64 {
            return Err(format!(
                "cumulative histogram ends at {}, expected {pixel_count} pixels",
                self.total()
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CumulativeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CumulativeHistogram ")?;
        fmt_bins(f, &self.values)
    }
}

// ============================================================
// LUT
// ============================================================

/// Intensity lookup table, old level → new level.
#[derive(Clone, PartialEq, Eq)]
pub struct Lut {
    table: [u8; BIN_COUNT],
}

impl Lut {
    /// `lut[i] = i`. Back-projecting through it reproduces the input.
    pub fn identity() -> Self {
        let mut table = [0u8; BIN_COUNT];
        for (i, v) in table.iter_mut().enumerate() {
            *v = i as u8;
        }
        Lut { table }
    }

    pub fn from_table(table: [u8; BIN_COUNT]) -> Self {
        Lut { table }
    }

    /// Build from device words, rejecting any entry above 255 or any
    /// decrease between neighbouring entries.
    pub fn from_words(words: &[u32; BIN_COUNT]) -> Result<Self, String> {
        let mut table = [0u8; BIN_COUNT];
        for (i, &w) in words.iter().enumerate() {
            if w > MAX_LEVEL as u32 {
                return Err(format!("LUT entry {i} is {w}, outside [0, 255]"));
            }
            table[i] = w as u8;
        }
        let lut = Lut { table };
        if !lut.is_monotonic() {
            return Err("LUT is not non-decreasing".to_string());
        }
        Ok(lut)
    }

    /// Entries widened to device words.
    pub fn to_words(&self) -> [u32; BIN_COUNT] {
        let mut words = [0u32; BIN_COUNT];
        for (w, &v) in words.iter_mut().zip(self.table.iter()) {
            *w = v as u32;
        }
        words
    }

    #[inline]
    pub fn get(&self, level: u8) -> u8 {
        self.table[level as usize]
    }

    pub fn table(&self) -> &[u8; BIN_COUNT] {
        &self.table
    }

    pub fn is_monotonic(&self) -> bool {
        self.table.windows(2).all(|w| w[0] <= w[1])
    }
}

impl fmt::Debug for Lut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lut ")?;
        fmt_bins(f, &self.to_words())
    }
}

/// Space-separated bin values, as the diagnostic dump prints them.
fn fmt_bins(f: &mut fmt::Formatter<'_>, bins: &[u32; BIN_COUNT]) -> fmt::Result {
    write!(f, "[")?;
    for (i, v) in bins.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{v}")?;
    }
    write!(f, "]")
}

// ============================================================
// Reference stages
// ============================================================

/// Stage 1: count intensities.
pub fn compute_histogram(plane: &Plane) -> Histogram {
    let mut counts = [0u32; BIN_COUNT];
    for y in 0..plane.height() {
        for &v in plane.row(y) {
            counts[v as usize] += 1;
        }
    }
    Histogram { counts }
}

/// Stage 2: inclusive prefix sum.
pub fn inclusive_scan(hist: &Histogram) -> CumulativeHistogram {
    let mut values = [0u32; BIN_COUNT];
    let mut acc = 0u32;
    for (out, &c) in values.iter_mut().zip(hist.counts.iter()) {
        acc = acc.wrapping_add(c);
        *out = acc;
    }
    CumulativeHistogram { values }
}

/// One LUT entry: `round(c * 255 / total)` clamped to 255.
///
/// # Panics
/// Panics if `total == 0`; a non-empty plane never has zero pixels.
#[inline]
pub fn normalize_entry(c: u32, total: u32) -> u32 {
    assert!(total > 0, "normalize_entry: total pixel count is zero");
    let total = total as u64;
    ((MAX_LEVEL * c as u64 + total / 2) / total).min(MAX_LEVEL) as u32
}

/// Stage 3: scale the cumulative distribution to [0, 255].
pub fn normalize_lut(cumulative: &CumulativeHistogram, total: u32) -> Lut {
    let mut table = [0u8; BIN_COUNT];
    for (t, &c) in table.iter_mut().zip(cumulative.values.iter()) {
        *t = normalize_entry(c, total) as u8;
    }
    Lut { table }
}

/// Stage 4: remap every pixel through the LUT.
pub fn back_project(plane: &Plane, lut: &Lut) -> Plane {
    let mut out = Plane::new(plane.width(), plane.height());
    for y in 0..plane.height() {
        for (o, &v) in out.row_mut(y).iter_mut().zip(plane.row(y)) {
            *o = lut.get(v);
        }
    }
    out
}

/// All four stages on one plane.
///
/// Returns an empty plane for an empty input.
pub fn equalize_plane(plane: &Plane) -> Plane {
    if plane.pixel_count() == 0 {
        return Plane::new(0, 0);
    }
    let hist = compute_histogram(plane);
    let cumulative = inclusive_scan(&hist);
    let lut = normalize_lut(&cumulative, plane.pixel_count() as u32);
    back_project(plane, &lut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_uniform_input() {
        // Each value appears once; CDF is linear → output ≈ input.
        let mut img = Plane::new(256, 1);
        for x in 0..256 {
            img.set(x, 0, x as u8);
        }
        let out = equalize_plane(&img);
        for x in 0..256 {
            let diff = (out.get(x, 0) as i32 - x as i32).abs();
            assert!(diff <= 1, "pixel {x}: expected ~{x}, got {}", out.get(x, 0));
        }
    }

    #[test]
    fn test_constant_image_maps_to_white() {
        let img = Plane::filled(10, 10, 128);
        let out = equalize_plane(&img);
        assert!(out.pixels().all(|v| v == 255));
    }

    #[test]
    fn test_all_black_4x4() {
        let img = Plane::new(4, 4);
        let hist = compute_histogram(&img);
        assert_eq!(hist.counts()[0], 16);
        assert!(hist.counts()[1..].iter().all(|&c| c == 0));

        let cum = inclusive_scan(&hist);
        assert!(cum.values().iter().all(|&c| c == 16));

        let lut = normalize_lut(&cum, 16);
        assert!(lut.table().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_four_level_chain() {
        let img = Plane::from_vec(2, 2, vec![0, 85, 170, 255]);
        let hist = compute_histogram(&img);
        for level in [0, 85, 170, 255] {
            assert_eq!(hist.counts()[level], 1);
        }
        let cum = inclusive_scan(&hist);
        assert_eq!(cum.values()[0], 1);
        assert_eq!(cum.values()[85], 2);
        assert_eq!(cum.values()[170], 3);
        assert_eq!(cum.values()[255], 4);

        let lut = normalize_lut(&cum, 4);
        assert_eq!(lut.get(255), 255);
        // round(1 * 255 / 4) = round(63.75)
        assert_eq!(lut.get(0), 64);
        assert_eq!(lut.get(85), 128);
        assert_eq!(lut.get(170), 191);

        let out = back_project(&img, &lut);
        assert_eq!(out.to_contiguous(), vec![64, 128, 191, 255]);
    }

    #[test]
    fn test_low_contrast_is_stretched() {
        let w = 110;
        let mut img = Plane::new(w, 1);
        for x in 0..w {
            img.set(x, 0, (100 + x % 11) as u8);
        }
        let out = equalize_plane(&img);
        let min_val = out.pixels().min().unwrap();
        let max_val = out.pixels().max().unwrap();
        assert!(max_val - min_val > 100, "range {min_val}..{max_val} not expanded enough");
    }

    #[test]
    fn test_preserves_ordering() {
        let img = Plane::from_vec(5, 1, vec![10, 50, 100, 150, 200]);
        let out = equalize_plane(&img);
        for i in 1..5 {
            assert!(out.get(i, 0) >= out.get(i - 1, 0), "monotonicity violated at {i}");
        }
    }

    #[test]
    fn test_identity_lut_is_noop() {
        let data: Vec<u8> = (0..200).map(|i| (i * 37 % 256) as u8).collect();
        let img = Plane::from_vec(20, 10, data);
        assert_eq!(back_project(&img, &Lut::identity()), img);
    }

    #[test]
    fn test_normalize_entry_rounds_half_up() {
        // 2 * 255 / 4 = 127.5 → 128
        assert_eq!(normalize_entry(2, 4), 128);
        assert_eq!(normalize_entry(0, 7), 0);
        assert_eq!(normalize_entry(7, 7), 255);
        // no overflow at the top of the u32 range
        assert_eq!(normalize_entry(u32::MAX, u32::MAX), 255);
    }

    #[test]
    fn test_histogram_verify() {
        let hist = compute_histogram(&Plane::new(3, 3));
        assert!(hist.verify(9).is_ok());
        assert!(hist.verify(10).is_err());
    }

    #[test]
    fn test_cumulative_verify_rejects_decrease() {
        let mut values = [5u32; BIN_COUNT];
        values[10] = 4;
        let err = CumulativeHistogram::from_values(values).verify(5).unwrap_err();
        assert!(err.contains("bin 10"), "{err}");
    }

    #[test]
    fn test_lut_from_words_rejects_out_of_range() {
        let mut words = Lut::identity().to_words();
        words[255] = 256;
        assert!(Lut::from_words(&words).is_err());
        assert_eq!(Lut::from_words(&Lut::identity().to_words()).unwrap(), Lut::identity());
    }

    #[test]
    fn test_strided_plane_ignores_padding() {
        let img = Plane::from_vec_with_stride(2, 2, 3, vec![0, 0, 99, 0, 0, 99]);
        let hist = compute_histogram(&img);
        assert_eq!(hist.counts()[0], 4);
        assert_eq!(hist.counts()[99], 0);
    }
}
