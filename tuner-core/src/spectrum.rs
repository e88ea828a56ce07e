//! # Log-Frequency Spectrum
//!
//! A fixed-width vector of non-negative intensities on a logarithmic
//! frequency axis. Because the axis is logarithmic at one cent per bin,
//! shifting a spectrum by `n` bins detunes it by exactly `n` cents,
//! which is what makes the accumulator arithmetic of the minimizer a
//! pure translation.

use serde::{Deserialize, Serialize};

/// Number of log-frequency bins spanning the piano range.
///
/// Eight octaves at [`crate::math::BINS_PER_OCTAVE`] bins per octave,
/// starting one semitone below A0.
pub const NUM_BINS: usize = 9600;

/// Width of the guard zones at both ends of the bin range, in bins.
pub const GUARD_BINS: usize = 100;

/// An intensity spectrum on the log-frequency axis.
///
/// Invariant: all stored values are non-negative and their sum is
/// finite. The preprocessing pipeline rewrites spectra in place; the
/// minimizer only reads them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    bins: Vec<f64>,
}

impl Spectrum {
    /// Creates an all-zero spectrum of the standard width.
    pub fn zeros() -> Self {
        Self { bins: vec![0.0; NUM_BINS] }
    }

    /// Wraps raw bin data without validation.
    ///
    /// Width mismatches are caught later by the preprocessing
    /// consistency check, not here.
    pub fn from_bins(bins: Vec<f64>) -> Self {
        Self { bins }
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    pub fn bins_mut(&mut self) -> &mut [f64] {
        &mut self.bins
    }

    /// Intensity at bin `m`. Panics on out-of-range indices; callers
    /// are expected to stay inside the guard window.
    #[inline]
    pub fn bin(&self, m: usize) -> f64 {
        self.bins[m]
    }

    /// Adds intensity at a single bin, ignoring out-of-range targets.
    pub fn add_peak(&mut self, m: usize, intensity: f64) {
        if let Some(bin) = self.bins.get_mut(m) {
            *bin += intensity;
        }
    }

    /// Total mass of the spectrum.
    pub fn total_mass(&self) -> f64 {
        self.bins.iter().sum()
    }
}
