//! # Worker / Host Messaging
//!
//! The engine runs on a dedicated worker thread and talks to its host
//! through crossbeam channels plus one shared atomic flag:
//!
//! - **Events** (worker -> host): tuning curve updates, progress and
//!   phase transitions. Emission is non-blocking; the host may drop or
//!   coalesce events at its leisure without ever stalling the worker.
//! - **Overrides** (host -> worker): manual pitch requests, drained at
//!   the top of every Monte Carlo iteration.
//! - **Cancellation** (host -> worker): a shared atomic boolean polled
//!   cooperatively by the worker. Unlike events it can never be lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};

/// Phases of a tuning calculation, in the order the host observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationPhase {
    PreprocessingStarted,
    PreprocessingFinished,
    InitialCurveReady,
    EntropyReductionStarted,
    Finished,
    Aborted,
}

/// One-way event stream from the worker to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum TunerEvent {
    /// A key's computed frequency changed. Emitted per key after every
    /// accepted move (block moves emit one per key).
    TuningCurveUpdate { key_index: usize, frequency_hz: f64 },
    /// Normalized progress of the current phase in `[0, 1]`.
    Progress { fraction: f64 },
    /// The calculation entered a new phase.
    PhaseTransition(CalculationPhase),
}

/// Manual pitch request for a single key, submitted by the host while
/// the minimizer runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchOverride {
    pub key_index: usize,
    pub frequency_hz: f64,
}

/// Worker-side end of the link.
pub struct WorkerLink {
    events: Sender<TunerEvent>,
    overrides: Receiver<PitchOverride>,
    cancel: Arc<AtomicBool>,
}

/// Host-side end of the link.
pub struct HostLink {
    events: Receiver<TunerEvent>,
    overrides: Sender<PitchOverride>,
    cancel: Arc<AtomicBool>,
}

/// Creates a connected worker/host link pair.
pub fn link() -> (WorkerLink, HostLink) {
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let (override_tx, override_rx) = crossbeam_channel::unbounded();
    let cancel = Arc::new(AtomicBool::new(false));
    (
        WorkerLink {
            events: event_tx,
            overrides: override_rx,
            cancel: Arc::clone(&cancel),
        },
        HostLink {
            events: event_rx,
            overrides: override_tx,
            cancel,
        },
    )
}

impl WorkerLink {
    /// Emits an event without blocking. A disconnected host is not an
    /// error; the worker keeps computing and the event is discarded.
    pub fn emit(&self, event: TunerEvent) {
        let _ = self.events.try_send(event);
    }

    pub fn emit_phase(&self, phase: CalculationPhase) {
        self.emit(TunerEvent::PhaseTransition(phase));
    }

    pub fn emit_progress(&self, fraction: f64) {
        self.emit(TunerEvent::Progress { fraction });
    }

    pub fn emit_update(&self, key_index: usize, frequency_hz: f64) {
        self.emit(TunerEvent::TuningCurveUpdate { key_index, frequency_hz });
    }

    /// True once the host requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Next pending override, if any. Never blocks.
    pub fn next_override(&self) -> Option<PitchOverride> {
        self.overrides.try_recv().ok()
    }
}

impl HostLink {
    /// Event stream from the worker.
    pub fn events(&self) -> &Receiver<TunerEvent> {
        &self.events
    }

    /// Submits a manual pitch for one key. Invalid requests (A4, out of
    /// range, unchanged pitch) are ignored by the worker.
    pub fn request_override(&self, key_index: usize, frequency_hz: f64) {
        let _ = self.overrides.send(PitchOverride { key_index, frequency_hz });
    }

    /// Requests cooperative cancellation of the calculation.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}
