//! # Spectral Accumulator
//!
//! Running superposition of all key spectra, each shifted by its
//! current pitch. Single-key moves update it incrementally in O(bins);
//! block moves rebuild it from scratch. The cutoff window keeps the
//! guard zones and everything above the treble limit out of the sum.

use crate::math;
use crate::spectrum::{NUM_BINS, Spectrum};

/// Negatives larger than this are a bookkeeping bug, not rounding.
const CLAMP_EPSILON: f64 = 1e-10;

/// Sum of pitch-shifted key spectra over the cutoff window.
pub struct Accumulator {
    bins: Vec<f64>,
    lower_cutoff: i64,
    upper_cutoff: i64,
}

impl Accumulator {
    pub fn new(lower_cutoff: usize, upper_cutoff: usize) -> Self {
        Self {
            bins: vec![0.0; NUM_BINS],
            lower_cutoff: lower_cutoff as i64,
            upper_cutoff: upper_cutoff as i64,
        }
    }

    pub fn clear(&mut self) {
        self.bins.fill(0.0);
    }

    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    /// Sole read path from a spectrum into the sum: intensity at source
    /// bin `m`, zero outside the open cutoff window.
    #[inline]
    fn element(&self, spectrum: &Spectrum, m: i64) -> f64 {
        if m > self.lower_cutoff && m < self.upper_cutoff {
            spectrum.bin(m as usize)
        } else {
            0.0
        }
    }

    /// Adds a spectrum shifted by `shift` bins (positive = up in
    /// frequency), scaled by `weight`. The minimizer only ever uses
    /// weights of exactly +1 and -1.
    ///
    /// Tiny negatives from floating-point accumulation are clamped to
    /// zero; anything below -1e-10 means the add/subtract bookkeeping
    /// is broken and is fatal.
    pub fn add_shifted(&mut self, spectrum: &Spectrum, shift: i64, weight: f64) {
        for m in 0..NUM_BINS as i64 {
            let value = self.bins[m as usize] + self.element(spectrum, m - shift) * weight;
            self.bins[m as usize] = if value >= 0.0 {
                value
            } else if value > -CLAMP_EPSILON {
                0.0
            } else {
                log::error!("accumulator bin {m} went negative ({value:e})");
                panic!("accumulator bin {m} went negative ({value:e})");
            };
        }
    }

    /// Shannon entropy of the normalized accumulator.
    pub fn entropy(&self) -> f64 {
        math::entropy(&self.bins)
    }
}
