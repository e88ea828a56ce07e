//! # Math Kernel
//!
//! Small numeric helpers shared by the whole engine: the log-frequency
//! bin mapping, L1 normalization, and Shannon entropy.
//!
//! ## Features
//! - Frequency <-> bin conversions at one cent per bin
//! - Mass normalization for intensity spectra
//! - Shannon entropy with the `0 * ln 0 = 0` convention

/// Number of bins per octave on the log-frequency axis.
///
/// One bin per cent, so a pitch shift in cents is a rigid translation
/// of the spectrum by the same number of bins.
pub const BINS_PER_OCTAVE: f64 = 1200.0;

/// Frequency of bin zero in Hz (G#0, one semitone below the lowest
/// piano key). The 100-cent guard zone above it ends exactly at A0.
pub const BIN_ZERO_HZ: f64 = 25.956543598746574;

/// Converts a frequency in Hz to a fractional bin index.
///
/// # Arguments
/// * `frequency` - Frequency in Hz (must be positive)
///
/// # Returns
/// * Fractional bin index on the log-frequency axis
pub fn ftom(frequency: f64) -> f64 {
    BINS_PER_OCTAVE * (frequency / BIN_ZERO_HZ).log2()
}

/// Converts a fractional bin index back to a frequency in Hz.
pub fn mtof(bin: f64) -> f64 {
    BIN_ZERO_HZ * (bin / BINS_PER_OCTAVE).exp2()
}

/// Rescales a slice so that its total mass is 1.
///
/// Slices with no mass are left untouched.
///
/// # Returns
/// * The total mass before normalization
pub fn normalize(bins: &mut [f64]) -> f64 {
    let total: f64 = bins.iter().sum();
    if total > 0.0 {
        for bin in bins.iter_mut() {
            *bin /= total;
        }
    }
    total
}

/// Shannon entropy of a non-negative intensity distribution.
///
/// The input does not need to be normalized; it is treated as an
/// unnormalized probability distribution. Bins that are zero (or
/// negative, which only happens transiently from floating-point
/// accumulation) contribute nothing, following `0 * ln 0 = 0`.
///
/// # Returns
/// * `H = -sum(p * ln p)` over the L1-normalized distribution, or 0 for
///   a distribution without mass
pub fn entropy(bins: &[f64]) -> f64 {
    let mut total = 0.0;
    let mut weighted_log = 0.0;
    for &x in bins {
        if x > 0.0 {
            total += x;
            weighted_log += x * x.ln();
        }
    }
    if total <= 0.0 {
        0.0
    } else {
        // H = ln S - (1/S) * sum(x ln x), identical to -sum(p ln p)
        total.ln() - weighted_log / total
    }
}
