use std::sync::Mutex;

use capstan_store_core::{Derivation, StorePath};

/// The queue-side states a step moves through while this core drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Connecting,
    SendingInputs,
    Building,
    ReceivingOutputs,
}

/// One enqueued build unit, as far as this core is concerned.
#[derive(Debug, Clone)]
pub struct Step {
    pub drv_path: StorePath,
    pub drv: Derivation,
}

#[derive(Debug, Default)]
struct ActiveStepState {
    cancelled: bool,
    pid: Option<u32>,
}

/// Shared live state of a running step.
///
/// The pid slot lets an external watchdog signal the transport process to
/// cancel a step mid-flight. There is a known race against pid reuse; the
/// slot is cleared on every exit path to keep the window small.
#[derive(Debug, Default)]
pub struct ActiveStep {
    state: Mutex<ActiveStepState>,
}

impl ActiveStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.lock().unwrap().cancelled = true;
    }

    pub fn cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    pub fn set_pid(&self, pid: u32) {
        self.state.lock().unwrap().pid = Some(pid);
    }

    pub fn clear_pid(&self) {
        self.state.lock().unwrap().pid = None;
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().unwrap().pid
    }
}
