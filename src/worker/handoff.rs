//! State shared between the backend handle and the worker thread.
//!
//! Slots are single-value and overwrite on write, except the interactive slot
//! which the asker never refills before its request resolves. A bounded(1)
//! wake channel lets producers nudge the worker out of its idle wait; a full
//! channel already means "wake up", so sends never block.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use super::messages::{InteractiveRequest, MonitorResult};
use crate::frame::Frame;

/// Lifecycle of the worker as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerPhase {
    /// Establishing the session / loading the model.
    Starting = 0,
    /// Accepting work.
    Ready = 1,
    /// Startup failed; no work will ever be dispatched.
    Failed = 2,
    /// Worker loop exited after shutdown.
    Stopped = 3,
}

impl WorkerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerPhase::Starting,
            1 => WorkerPhase::Ready,
            2 => WorkerPhase::Failed,
            _ => WorkerPhase::Stopped,
        }
    }
}

#[derive(Default)]
pub(crate) struct Slots {
    pub pending_frame: Option<Frame>,
    pub interactive: Option<InteractiveRequest>,
    pub result: Option<MonitorResult>,
}

pub(crate) struct Shared {
    slots: Mutex<Slots>,
    wake_tx: Sender<()>,
    pub wake_rx: Receiver<()>,
    pub running: AtomicBool,
    pub paused: AtomicBool,
    pub abort_requested: AtomicBool,
    /// Guards the one-question-at-a-time rule for `ask`.
    pub ask_in_flight: AtomicBool,
    phase: AtomicU8,
    /// Completion time of the last monitor or interactive dispatch.
    last_dispatch: Mutex<Option<Instant>>,
}

impl Shared {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            slots: Mutex::new(Slots::default()),
            wake_tx,
            wake_rx,
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            ask_in_flight: AtomicBool::new(false),
            phase: AtomicU8::new(WorkerPhase::Starting as u8),
            last_dispatch: Mutex::new(None),
        }
    }

    pub fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    pub fn last_dispatch(&self) -> Option<Instant> {
        *self
            .last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_dispatched(&self) {
        *self
            .last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_never_blocks() {
        let shared = Shared::new();
        shared.wake();
        shared.wake();
        shared.wake();
        assert!(shared.wake_rx.try_recv().is_ok());
        assert!(shared.wake_rx.try_recv().is_err());
    }

    #[test]
    fn test_phase_round_trips() {
        let shared = Shared::new();
        assert_eq!(shared.phase(), WorkerPhase::Starting);
        shared.set_phase(WorkerPhase::Failed);
        assert_eq!(shared.phase(), WorkerPhase::Failed);
    }

    #[test]
    fn test_frame_slot_overwrites() {
        let shared = Shared::new();
        shared.slots().pending_frame = Some(Frame::solid_bgr(1, 1, [1, 1, 1]));
        shared.slots().pending_frame = Some(Frame::solid_bgr(1, 1, [2, 2, 2]));
        let frame = shared.slots().pending_frame.take().unwrap();
        assert_eq!(frame.data(), &[2, 2, 2]);
    }
}
