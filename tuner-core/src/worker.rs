//! # Tuning Session Worker
//!
//! Runs the entropy minimizer on a dedicated worker thread and hands
//! the host a small handle for the duration of the calculation.
//!
//! ## Architecture
//! - **Worker Thread**: owns the snapshot and the minimizer, runs the
//!   whole calculation sequentially
//! - **Host Thread**: receives events, may submit pitch overrides and
//!   request cancellation at any time
//! - **Communication**: crossbeam channels plus one shared atomic flag
//!
//! The handle never blocks the worker: events are emitted without
//! back-pressure and dropping the handle only requests cancellation,
//! it does not wait.

use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;

use crate::messages::{self, HostLink, TunerEvent};
use crate::minimizer::{EntropyMinimizer, Outcome};
use crate::piano::Piano;

/// Host-side handle of a running tuning calculation.
pub struct TuningSession {
    link: HostLink,
    thread_handle: Option<JoinHandle<Outcome>>,
}

impl TuningSession {
    /// Starts a calculation over the snapshot on a dedicated thread.
    ///
    /// The snapshot is moved into the worker; the host observes
    /// results exclusively through the event stream (and, after
    /// [`join`](Self::join), through the returned outcome).
    ///
    /// # Arguments
    /// * `piano` - Deep copy of the host's piano at start time
    /// * `seed` - Optional RNG seed for reproducible runs
    pub fn start(piano: Piano, seed: Option<u64>) -> Self {
        let (worker_link, host_link) = messages::link();
        let thread_handle = thread::spawn(move || {
            log::info!("tuning calculation started ({} keys)", piano.key_count());
            let mut minimizer = EntropyMinimizer::new(piano, worker_link, seed);
            let outcome = minimizer.run();
            log::info!("tuning calculation ended: {outcome:?}");
            outcome
        });
        Self {
            link: host_link,
            thread_handle: Some(thread_handle),
        }
    }

    /// Event stream from the worker. The host may drain it at its own
    /// pace; the worker never blocks on it.
    pub fn events(&self) -> &Receiver<TunerEvent> {
        self.link.events()
    }

    /// Submits a manual pitch for one key. Requests for the A4
    /// reference, out-of-range keys or unchanged pitches are ignored.
    pub fn override_pitch(&self, key_index: usize, frequency_hz: f64) {
        self.link.request_override(key_index, frequency_hz);
    }

    /// Requests cooperative cancellation. The worker observes the flag
    /// within one Monte Carlo iteration or preprocessing step.
    pub fn cancel(&self) {
        self.link.cancel();
    }

    /// Waits for the worker to finish and returns how it ended.
    ///
    /// A worker that died from a broken numerical invariant counts as
    /// aborted.
    pub fn join(mut self) -> Outcome {
        match self.thread_handle.take() {
            Some(handle) => match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::error!("tuning worker panicked");
                    Outcome::Aborted
                }
            },
            None => Outcome::Aborted,
        }
    }
}

impl Drop for TuningSession {
    /// A dropped handle cancels the calculation but does not wait for
    /// the worker; the thread winds down on its own.
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.link.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CalculationPhase;
    use crate::piano::Key;
    use crate::spectrum::Spectrum;
    use std::time::Duration;

    /// Synthetic piano with one spectral line per key, placed at the
    /// key's nominal fundamental.
    fn spike_piano() -> Piano {
        let keys = (0..27)
            .map(|k| {
                let mut s = Spectrum::zeros();
                s.add_peak(3600 + 100 * k, 1.0);
                Key::new(s, None, 0.0)
            })
            .collect();
        Piano::new(keys, 13)
    }

    #[test]
    fn test_malformed_snapshot_aborts() {
        // Empty spectra fail the preprocessing consistency check
        let keys = (0..27).map(|_| Key::new(Spectrum::zeros(), None, 0.0)).collect();
        let session = TuningSession::start(Piano::new(keys, 13), Some(1));
        assert_eq!(session.join(), Outcome::Aborted);
    }

    #[test]
    fn test_cancelled_session_aborts() {
        let session = TuningSession::start(spike_piano(), Some(1));
        session.cancel();
        assert_eq!(session.join(), Outcome::Aborted);
    }

    #[test]
    fn test_override_pitch_reaches_the_worker() {
        // The synthetic piano keeps the search running (no move ever
        // improves), so the worker is alive to drain the override
        let session = TuningSession::start(spike_piano(), Some(7));
        // ET440 of key 10 raised by 30 cents
        let target_hz = 440.0 * ((10.0 - 13.0) / 12.0f64 + 30.0 / 1200.0).exp2();
        session.override_pitch(10, target_hz);

        let mut observed = false;
        while let Ok(event) = session.events().recv_timeout(Duration::from_secs(10)) {
            if let TunerEvent::TuningCurveUpdate { key_index: 10, frequency_hz } = event {
                if (frequency_hz - target_hz).abs() < 1e-6 {
                    observed = true;
                    break;
                }
            }
        }
        assert!(observed, "override update never came back through the session");
        session.cancel();
        assert_eq!(session.join(), Outcome::Aborted);
    }

    #[test]
    fn test_aborted_session_reports_the_phase() {
        let keys = (0..27).map(|_| Key::new(Spectrum::zeros(), None, 0.0)).collect();
        let session = TuningSession::start(Piano::new(keys, 13), Some(1));
        let mut phases = Vec::new();
        while let Ok(event) = session.events().recv_timeout(Duration::from_secs(5)) {
            if let TunerEvent::PhaseTransition(phase) = event {
                phases.push(phase);
                if phase == CalculationPhase::Aborted {
                    break;
                }
            }
        }
        assert_eq!(
            phases,
            vec![CalculationPhase::PreprocessingStarted, CalculationPhase::Aborted]
        );
        assert_eq!(session.join(), Outcome::Aborted);
    }
}
