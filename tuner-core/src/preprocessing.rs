//! # Auditory Preprocessing
//!
//! Seven-stage pipeline that turns the raw recorded spectra of a piano
//! snapshot into the cleaned, perceptually weighted line spectra the
//! entropy minimizer works on. Stages run in a fixed order:
//!
//! 1. Consistency check (abort on malformed input)
//! 2. Normalize each spectrum to unit mass
//! 3. Clean: subtract a smoothed noise floor
//! 4. Cut everything below the key's fundamental
//! 5. SPL-A loudness weighting
//! 6. Extrapolate missing inharmonicity measurements
//! 7. Improve high-frequency peaks, then mollify
//!
//! All spectra are rewritten in place. The pipeline reports per-key
//! progress and polls cancellation after every per-key step and
//! between the global stages.

use anyhow::{Result, bail};
use linreg::linear_regression;
use once_cell::sync::Lazy;

use crate::math;
use crate::messages::WorkerLink;
use crate::piano::Piano;
use crate::spectrum::{GUARD_BINS, NUM_BINS, Spectrum};

/// Half-width of the moving-average window used as the noise floor
/// estimate, in bins. Wide enough to be flat under a spectral line.
const NOISE_FLOOR_HALF_WINDOW: usize = 100;

/// Margin below the fundamental kept when cutting low frequencies, in
/// bins (one semitone).
const LOW_CUT_MARGIN_BINS: i64 = 100;

/// Standard deviation of the mollification kernel, in bins.
const MOLLIFY_SIGMA_BINS: f64 = 5.0;

/// Keys whose ET440 fundamental lies above this frequency get their
/// noisy upper range replaced by a synthetic line spectrum.
const SYNTHETIC_TREBLE_HZ: f64 = 1000.0;

/// Maximum partial index considered when synthesizing treble spectra.
const SYNTHETIC_MAX_PARTIAL: u32 = 32;

/// How the pipeline ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepOutcome {
    Completed,
    Cancelled,
}

/// Runs the full pipeline over the snapshot.
///
/// Returns an error for malformed input (wrong bin count, massless
/// spectrum, A4 out of range); the caller aborts the calculation. A
/// cancelled run is not an error. Side effects on the snapshot persist
/// either way; the snapshot is discarded with the calculation.
pub fn preprocess(piano: &mut Piano, link: &WorkerLink) -> Result<PrepOutcome> {
    check_consistency(piano)?;
    let n = piano.key_count();

    for k in 0..n {
        math::normalize(piano.key_mut(k).spectrum.bins_mut());
        link.emit_progress(0.25 * k as f64 / n as f64);
        if link.is_cancelled() {
            return Ok(PrepOutcome::Cancelled);
        }
    }

    for k in 0..n {
        subtract_noise_floor(piano.key_mut(k).spectrum.bins_mut());
        link.emit_progress(0.25 + 0.25 * k as f64 / n as f64);
        if link.is_cancelled() {
            return Ok(PrepOutcome::Cancelled);
        }
    }

    for k in 0..n {
        let fundamental = piano.et440(k);
        cut_low_frequencies(piano.key_mut(k).spectrum.bins_mut(), fundamental);
        if link.is_cancelled() {
            return Ok(PrepOutcome::Cancelled);
        }
    }

    for k in 0..n {
        apply_spl_a_weighting(piano.key_mut(k).spectrum.bins_mut());
        link.emit_progress(0.5 + 0.25 * k as f64 / n as f64);
        if link.is_cancelled() {
            return Ok(PrepOutcome::Cancelled);
        }
    }

    extrapolate_inharmonicity(piano);
    if link.is_cancelled() {
        return Ok(PrepOutcome::Cancelled);
    }

    improve_high_frequency_peaks(piano);
    if link.is_cancelled() {
        return Ok(PrepOutcome::Cancelled);
    }

    for k in 0..n {
        mollify(piano.key_mut(k).spectrum.bins_mut());
        link.emit_progress(0.75 + 0.25 * k as f64 / n as f64);
        if link.is_cancelled() {
            return Ok(PrepOutcome::Cancelled);
        }
    }

    #[cfg(feature = "dump-spectra")]
    for (k, key) in piano.keys().iter().enumerate() {
        if let Err(e) = crate::dump::dump_spectrum(k, "preprocessed", &key.spectrum) {
            log::warn!("failed to dump spectrum of key {k}: {e}");
        }
    }

    Ok(PrepOutcome::Completed)
}

/// Stage 1: rejects snapshots the rest of the pipeline cannot handle.
fn check_consistency(piano: &Piano) -> Result<()> {
    if piano.a4_index() >= piano.key_count() {
        bail!(
            "A4 index {} outside the key range 0..{}",
            piano.a4_index(),
            piano.key_count()
        );
    }
    for (k, key) in piano.keys().iter().enumerate() {
        if key.spectrum.is_empty() {
            bail!("key {} has an empty spectrum", k);
        }
        if key.spectrum.len() != NUM_BINS {
            bail!(
                "key {} has {} spectrum bins, expected {}",
                k,
                key.spectrum.len(),
                NUM_BINS
            );
        }
        if key.spectrum.total_mass() <= 0.0 {
            bail!("key {} has a silent spectrum", k);
        }
    }
    Ok(())
}

/// Stage 3: estimates the noise floor as a wide moving average and
/// subtracts it, clamping at zero. Spectral lines are much narrower
/// than the window, so they survive; broadband noise does not.
fn subtract_noise_floor(bins: &mut [f64]) {
    let n = bins.len();
    let mut prefix = vec![0.0; n + 1];
    for m in 0..n {
        prefix[m + 1] = prefix[m] + bins[m];
    }
    for m in 0..n {
        let lo = m.saturating_sub(NOISE_FLOOR_HALF_WINDOW);
        let hi = (m + NOISE_FLOOR_HALF_WINDOW + 1).min(n);
        let floor = (prefix[hi] - prefix[lo]) / (hi - lo) as f64;
        bins[m] = (bins[m] - floor).max(0.0);
    }
}

/// Stage 4: zeros all bins more than one semitone below the key's
/// nominal fundamental. Whatever lives down there is rumble or
/// cross-talk from lower strings, not this key.
fn cut_low_frequencies(bins: &mut [f64], fundamental_hz: f64) {
    let cut = (math::ftom(fundamental_hz).round() as i64 - LOW_CUT_MARGIN_BINS).max(0) as usize;
    let len = bins.len();
    for bin in bins.iter_mut().take(cut.min(len)) {
        *bin = 0.0;
    }
}

// IEC 61672 A-weighting as a power factor per bin, normalized to 1 at
// 1 kHz. Computed once for the whole bin range.
static SPL_A_TABLE: Lazy<Vec<f64>> = Lazy::new(|| {
    (0..NUM_BINS)
        .map(|m| spl_a_power_weight(math::mtof(m as f64)))
        .collect()
});

fn spl_a_amplitude_ratio(f: f64) -> f64 {
    let f2 = f * f;
    let c1 = 20.6_f64 * 20.6;
    let c2 = 107.7_f64 * 107.7;
    let c3 = 737.9_f64 * 737.9;
    let c4 = 12194.0_f64 * 12194.0;
    (c4 * f2 * f2) / ((f2 + c1) * ((f2 + c2) * (f2 + c3)).sqrt() * (f2 + c4))
}

fn spl_a_power_weight(f: f64) -> f64 {
    let ratio = spl_a_amplitude_ratio(f) / spl_a_amplitude_ratio(1000.0);
    ratio * ratio
}

/// Stage 5: applies the ear's loudness weighting so that the entropy
/// measure favors the part of the spectrum we actually hear.
fn apply_spl_a_weighting(bins: &mut [f64]) {
    for (bin, weight) in bins.iter_mut().zip(SPL_A_TABLE.iter()) {
        *bin *= weight;
    }
}

/// Stage 6: fills missing inharmonicity measurements.
///
/// B grows roughly exponentially along the keyboard, so a linear
/// least-squares fit of `ln B` against the key index over the measured
/// keys gives a smooth interpolation and a sane extrapolation at both
/// ends. Needs at least two measured keys; otherwise the unmeasured
/// keys stay harmonic.
fn extrapolate_inharmonicity(piano: &mut Piano) {
    let (xs, ys): (Vec<f64>, Vec<f64>) = piano
        .keys()
        .iter()
        .enumerate()
        .filter_map(|(k, key)| {
            key.measured_inharmonicity
                .filter(|&b| b > 0.0)
                .map(|b| (k as f64, b.ln()))
        })
        .unzip();
    if xs.len() < 2 {
        log::info!("not enough inharmonicity measurements to extrapolate ({})", xs.len());
        return;
    }
    match linear_regression::<_, _, f64>(&xs, &ys) {
        Ok((slope, intercept)) => {
            for (k, key) in piano.keys_mut().iter_mut().enumerate() {
                if key.measured_inharmonicity.is_none() {
                    key.measured_inharmonicity = Some((intercept + slope * k as f64).exp());
                }
            }
        }
        Err(e) => log::warn!("inharmonicity regression failed: {e:?}"),
    }
}

/// Stage 7a: replaces the spectra of treble keys by synthetic line
/// spectra.
///
/// Short treble strings decay fast and their recordings carry little
/// usable energy above the fundamental, so the measured peaks up there
/// are unreliable. The expected partial positions follow from the
/// (possibly extrapolated) inharmonicity, which is a better estimate
/// than the recording itself.
fn improve_high_frequency_peaks(piano: &mut Piano) {
    for k in 0..piano.key_count() {
        let fundamental = piano.et440(k);
        if fundamental < SYNTHETIC_TREBLE_HZ {
            continue;
        }
        let b = piano.key(k).inharmonicity();
        let mass = piano.key(k).spectrum.total_mass();
        let mut synthetic = Spectrum::zeros();
        for partial in 1..=SYNTHETIC_MAX_PARTIAL {
            let n = partial as f64;
            let hz = n * fundamental * ((1.0 + n * n * b) / (1.0 + b)).sqrt();
            let m = math::ftom(hz).round();
            if m >= (NUM_BINS - GUARD_BINS) as f64 {
                break;
            }
            synthetic.add_peak(m as usize, 1.0 / (n * n));
        }
        let synthetic_mass = synthetic.total_mass();
        if synthetic_mass > 0.0 && mass > 0.0 {
            for bin in synthetic.bins_mut() {
                *bin *= mass / synthetic_mass;
            }
            piano.key_mut(k).spectrum = synthetic;
        }
    }
}

// Normalized Gaussian kernel with a 3-sigma support.
static MOLLIFY_KERNEL: Lazy<Vec<f64>> = Lazy::new(|| {
    let radius = (3.0 * MOLLIFY_SIGMA_BINS).ceil() as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|d| (-0.5 * (d as f64 / MOLLIFY_SIGMA_BINS).powi(2)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    for w in kernel.iter_mut() {
        *w /= total;
    }
    kernel
});

/// Stage 7b: convolves the spectrum with a compact Gaussian kernel.
///
/// Sharp single-bin lines make the entropy landscape needle-shaped and
/// almost impossible to search; a few cents of smoothing widens the
/// basins without moving the minima.
fn mollify(bins: &mut [f64]) {
    let radius = (MOLLIFY_KERNEL.len() / 2) as i64;
    let n = bins.len() as i64;
    let mut smoothed = vec![0.0; bins.len()];
    for (m, out) in smoothed.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (j, weight) in MOLLIFY_KERNEL.iter().enumerate() {
            let source = m as i64 + j as i64 - radius;
            if source >= 0 && source < n {
                sum += bins[source as usize] * weight;
            }
        }
        *out = sum;
    }
    bins.copy_from_slice(&smoothed);
}
