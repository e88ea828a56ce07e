//! # Piano Model
//!
//! This module provides the piano snapshot consumed by the tuning
//! engine: the ordered set of keys with their recorded spectra and
//! inharmonicity measurements, and the equal temperament frequency
//! calculations everything else is expressed against.
//!
//! ## Features
//! - 88-key (or arbitrary-size) key container with an A4 reference index
//! - Equal temperament frequency calculations with cent offsets
//! - Cent pitch conversions against the A4 = 440 Hz reference scale
//! - Key index to note name mappings for logs and diagnostics
//!
//! The snapshot is a deep copy taken when a calculation starts. The
//! engine mutates it freely (preprocessing rewrites spectra in place,
//! accepted moves write back computed frequencies) and discards it when
//! the calculation ends.

use serde::{Deserialize, Serialize};

use crate::spectrum::Spectrum;

/// Reference concert pitch for A4 in Hz.
pub const CONCERT_PITCH_HZ: f64 = 440.0;

/// Number of keys on a standard piano (A0 to C8).
pub const STANDARD_KEY_COUNT: usize = 88;

/// Index of A4 on a standard 88-key piano.
pub const STANDARD_A4_INDEX: usize = 48;

/// A single piano key with its recording-derived data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    /// Log-binned intensity spectrum of the recording. Preprocessing
    /// rewrites this in place.
    pub spectrum: Spectrum,
    /// Measured inharmonicity coefficient B (>= 0). `None` means the
    /// key was not measured; the extrapolation stage of the
    /// preprocessing pipeline is the only other writer.
    pub measured_inharmonicity: Option<f64>,
    /// Frequency at which the key was recorded, in Hz. Zero means the
    /// key was recorded at its nominal pitch.
    pub recorded_frequency: f64,
    /// Frequency computed by the tuning engine, in Hz. Written back
    /// after every accepted move.
    pub computed_frequency: f64,
}

impl Key {
    /// Creates a key from a recorded spectrum and its measurements.
    pub fn new(spectrum: Spectrum, measured_inharmonicity: Option<f64>, recorded_frequency: f64) -> Self {
        Self {
            spectrum,
            measured_inharmonicity,
            recorded_frequency,
            computed_frequency: 0.0,
        }
    }

    /// Inharmonicity coefficient used in calculations. Unmeasured keys
    /// count as perfectly harmonic.
    pub fn inharmonicity(&self) -> f64 {
        self.measured_inharmonicity.unwrap_or(0.0)
    }
}

/// Snapshot of a piano: its keys and the A4 reference position.
///
/// Invariant: `a4_index < key_count`. The initial-curve estimator
/// additionally wants at least 13 keys on each side of A4 and falls
/// back to a zero curve otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piano {
    keys: Vec<Key>,
    a4_index: usize,
}

impl Piano {
    /// Creates a snapshot from a key list and the A4 index.
    pub fn new(keys: Vec<Key>, a4_index: usize) -> Self {
        debug_assert!(a4_index < keys.len(), "A4 index outside the key range");
        Self { keys, a4_index }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn a4_index(&self) -> usize {
        self.a4_index
    }

    pub fn key(&self, index: usize) -> &Key {
        &self.keys[index]
    }

    pub fn key_mut(&mut self, index: usize) -> &mut Key {
        &mut self.keys[index]
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut [Key] {
        &mut self.keys
    }

    /// Equal temperament frequency of a key at a cent offset.
    ///
    /// The defining frequency of key `k` detuned by `pitch_cents`
    /// relative to a scale anchored at `a4_hz`:
    /// `f = a4_hz * 2^((k - a4)/12 + cents/1200)`.
    ///
    /// # Arguments
    /// * `key` - Key index
    /// * `pitch_cents` - Cent offset from the equal temperament pitch
    /// * `a4_hz` - Anchor frequency for A4 in Hz
    pub fn equal_temperament(&self, key: usize, pitch_cents: f64, a4_hz: f64) -> f64 {
        let semitones = key as f64 - self.a4_index as f64;
        a4_hz * (semitones / 12.0 + pitch_cents / 1200.0).exp2()
    }

    /// Equal temperament frequency of a key on the A4 = 440 Hz scale.
    pub fn et440(&self, key: usize) -> f64 {
        self.equal_temperament(key, 0.0, CONCERT_PITCH_HZ)
    }

    /// Cent pitch of a frequency against the key's ET440 frequency,
    /// rounded to the nearest integer cent.
    pub fn pitch_from_frequency(&self, key: usize, frequency_hz: f64) -> i32 {
        (1200.0 * (frequency_hz / self.et440(key)).log2()).round() as i32
    }

    /// Cent pitch at which the key was recorded, against ET440.
    ///
    /// Keys without a recorded frequency count as recorded at their
    /// nominal pitch.
    pub fn recorded_pitch(&self, key: usize) -> i32 {
        let recorded = self.keys[key].recorded_frequency;
        if recorded > 0.0 {
            self.pitch_from_frequency(key, recorded)
        } else {
            0
        }
    }
}

/// Scientific note name of a key, given the A4 position.
///
/// Used for log messages and diagnostic dump labels.
///
/// # Arguments
/// * `key` - Key index
/// * `a4_index` - Index of A4 in the same key range
///
/// # Returns
/// * Note name such as "A4", "C#3" or "Bb2" (sharps only)
pub fn note_name(key: usize, a4_index: usize) -> String {
    const NOTE_NAMES: [&str; 12] = [
        "A", "A#", "B", "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#",
    ];
    // Position on a virtual keyboard that starts at A0, like the
    // standard piano layout. The octave number changes at C.
    let from_a0 = key as i64 - a4_index as i64 + STANDARD_A4_INDEX as i64;
    let note_index = from_a0.rem_euclid(12) as usize;
    let octave = (from_a0 + 9).div_euclid(12);
    format!("{}{}", NOTE_NAMES[note_index], octave)
}
