// tuner-core/src/lib.rs

//! The core logic for the entropy-minimizing piano tuner.
//! This crate computes optimal tuning curves from recorded key spectra
//! and measured inharmonicities: the per-key pitch offsets that
//! minimize the Shannon entropy of the superposed log-frequency
//! spectra. It is completely headless and contains no GUI code; hosts
//! talk to it through the channel link in [`messages`] or the thread
//! handle in [`worker`].

pub mod accumulator;
pub mod curve;
#[cfg(feature = "dump-spectra")]
pub mod dump;
pub mod math;
pub mod messages;
pub mod minimizer;
pub mod piano;
pub mod preprocessing;
pub mod spectrum;
pub mod worker;

pub use messages::{CalculationPhase, HostLink, PitchOverride, TunerEvent, WorkerLink};
pub use minimizer::{EntropyMinimizer, Outcome};
pub use piano::{CONCERT_PITCH_HZ, Key, Piano, STANDARD_A4_INDEX, STANDARD_KEY_COUNT};
pub use spectrum::{GUARD_BINS, NUM_BINS, Spectrum};
pub use worker::TuningSession;
