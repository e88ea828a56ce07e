//! # Initial Tuning Curve
//!
//! Deterministic seed for the Monte Carlo search: a stretched tuning
//! curve derived from the measured inharmonicities. Without this seed
//! the entropy landscape has spurious minima with whole flanks shifted
//! by half a tone; starting from a physically plausible stretch keeps
//! the search near the right valley.
//!
//! Also home of the per-key tolerance corridor that softly bounds how
//! far the search may wander from the seed.

use std::f64::consts::LN_2;

use once_cell::sync::Lazy;

use crate::piano::Piano;

/// Minimum number of keys required on each side of A4. Smaller pianos
/// get a zero seed curve and rely on the search alone.
pub const MIN_FLANK_KEYS: usize = 13;

/// Expected deviation in cents of the n-th partial of a string with
/// inharmonicity `b` from its ideal n-th harmonic.
///
/// Derived from the partial series `f_n = n * f_1 * sqrt(1 + n^2 B)`
/// with the fundamental itself normalized to the defining frequency:
/// `cents = (600 / ln 2) * ln((1 + n^2 B) / (1 + B))`.
fn partial_stretch_cents(b: f64, n: u32) -> f64 {
    let n2 = (n * n) as f64;
    (600.0 / LN_2) * ((1.0 + n2 * b) / (1.0 + b)).ln()
}

/// Computes the seed tuning curve in cents for every key.
///
/// The curve is anchored on a linear A3-A5 segment derived from octave
/// partial matching at A4, then extended to the treble by matching the
/// 4th/2nd partials an octave apart (30/70 blend) and to the bass by
/// matching the 6th/3rd and 10th/5th partials (blended towards the
/// double-octave pair at the very bottom).
///
/// Pianos with fewer than [`MIN_FLANK_KEYS`] keys on either side of A4
/// get an all-zero curve.
pub fn compute_initial_curve(piano: &Piano) -> Vec<f64> {
    let n = piano.key_count();
    let a4 = piano.a4_index();
    let mut curve = vec![0.0; n];
    if a4 < MIN_FLANK_KEYS || n - a4 <= MIN_FLANK_KEYS {
        log::info!("piano too small for a stretched seed curve, starting flat");
        return curve;
    }

    let cents = |k: usize, partial: u32| partial_stretch_cents(piano.key(k).inharmonicity(), partial);

    let a3 = a4 - 12;
    let a5 = a4 + 12;

    // Anchor segment: A4 stays put, A5 follows the second partial of
    // A4, A3 compensates the fourth partial of A3 against it.
    let pitch_a5 = cents(a4, 2);
    let pitch_a3 = cents(a4, 2) - cents(a3, 4);
    for k in a3..a4 {
        curve[k] = pitch_a3 * (a4 - k) as f64 / 12.0;
    }
    curve[a4] = 0.0;
    for k in (a4 + 1)..=a5 {
        curve[k] = pitch_a5 * (k - a4) as f64 / 12.0;
    }

    // Treble extension, one key at a time from the octave below.
    for k in (a5 + 1)..n {
        let p42 = curve[k - 12] + cents(k - 12, 4) - cents(k, 2);
        let p21 = curve[k - 12] + cents(k - 12, 2);
        curve[k] = 0.3 * p42 + 0.7 * p21;
    }

    // Bass extension, blending from single-octave to double-octave
    // partial pairs towards the bottom end.
    for k in (0..a3).rev() {
        let p63 = curve[k + 12] + cents(k + 12, 3) - cents(k, 6);
        let p105 = curve[k + 12] + cents(k + 12, 5) - cents(k, 10);
        let fraction = k as f64 / a3 as f64;
        curve[k] = p63 * fraction + p105 * (1.0 - fraction);
    }

    curve
}

/// One half of the tolerance curve: `f(dk) = 5 + a dk^2 + b dk^3`.
struct FlankCubic {
    a: f64,
    b: f64,
}

impl FlankCubic {
    /// Solves the cubic so that both anchor values are hit exactly.
    fn through(dk1: f64, v1: f64, dk2: f64, v2: f64) -> Self {
        let r1 = v1 - 5.0;
        let r2 = v2 - 5.0;
        let det = dk1 * dk1 * dk2 * dk2 * (dk2 - dk1);
        Self {
            a: (r1 * dk2 * dk2 * dk2 - r2 * dk1 * dk1 * dk1) / det,
            b: (r2 * dk1 * dk1 - r1 * dk2 * dk2) / det,
        }
    }

    fn eval(&self, dk: f64) -> f64 {
        5.0 + self.a * dk * dk + self.b * dk * dk * dk
    }
}

// Anchors: A0 -> 30, A2 -> 15, A4 -> 5, A6 -> 15, A7 -> 30 cents.
static BASS_FLANK: Lazy<FlankCubic> = Lazy::new(|| FlankCubic::through(-48.0, 30.0, -24.0, 15.0));
static TREBLE_FLANK: Lazy<FlankCubic> = Lazy::new(|| FlankCubic::through(24.0, 15.0, 36.0, 30.0));

/// Allowed deviation from the seed curve for a key, in integer cents.
///
/// Tight around A4 and widening towards both ends of the keyboard,
/// where the entropy landscape is flatter and the seed curve less
/// certain.
pub fn tolerance(key: usize, a4_index: usize) -> i32 {
    let dk = key as f64 - a4_index as f64;
    let flank = if dk < 0.0 { &*BASS_FLANK } else { &*TREBLE_FLANK };
    flank.eval(dk).round() as i32
}
