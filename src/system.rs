//! Shared system state.
//!
//! One instance is shared between the cooperative main loop and the
//! interrupt-context code (stepper tick, limit edges). Every field is an
//! atomic with single-word read-modify-write updates, so neither context
//! can observe a torn value and no flag update is lost.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};

use serde::Serialize;

use crate::config::{N_AXIS, Settings};

/// Execution-request bitflags. Each flag has one producer context and one
/// consumer context; they are set with `fetch_or` and consumed with
/// `fetch_and`, never read-modify-written non-atomically.
pub mod exec {
    pub const STATUS_REPORT: u8 = 1 << 0;
    pub const CYCLE_START: u8 = 1 << 1;
    pub const CYCLE_STOP: u8 = 1 << 2;
    pub const FEED_HOLD: u8 = 1 << 3;
    pub const RESET: u8 = 1 << 4;
    pub const ALARM: u8 = 1 << 5;
    pub const CRIT_EVENT: u8 = 1 << 6;
}

/// Coarse machine state. `Alarm` is sticky: it locks out motion until an
/// explicit reset cycle clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum MachineState {
    Idle = 0,
    Init = 1,
    Queued = 2,
    Cycle = 3,
    Hold = 4,
    Homing = 5,
    Alarm = 6,
}

impl MachineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MachineState::Init,
            2 => MachineState::Queued,
            3 => MachineState::Cycle,
            4 => MachineState::Hold,
            5 => MachineState::Homing,
            6 => MachineState::Alarm,
            _ => MachineState::Idle,
        }
    }
}

/// Cause recorded by the limit/estop supervisor. The numeric codes match
/// what the reporting layer has always shown operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Fault {
    None = 0,
    XAxis = 1,
    YAxis = 2,
    UAxis = 3,
    ZAxis = 4,
    XyAxis = 5,
    UzAxis = 6,
    EStop = 7,
    Bounce = 254,
    Undefined = 255,
}

impl Fault {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Fault::None,
            1 => Fault::XAxis,
            2 => Fault::YAxis,
            3 => Fault::UAxis,
            4 => Fault::ZAxis,
            5 => Fault::XyAxis,
            6 => Fault::UzAxis,
            7 => Fault::EStop,
            254 => Fault::Bounce,
            _ => Fault::Undefined,
        }
    }
}

/// Authoritative machine position plus runtime flags.
#[derive(Debug)]
pub struct SystemState {
    /// Machine position in steps, written only by the stepper tick and the
    /// homing routine.
    position: [AtomicI32; N_AXIS],
    execute: AtomicU8,
    state: AtomicU8,
    auto_start: AtomicBool,
    err: AtomicU8,
    /// Step events left in the interrupted block after a feed hold ramps
    /// to zero; consumed by cycle reinitialization.
    step_events_remaining: AtomicU32,
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            position: [const { AtomicI32::new(0) }; N_AXIS],
            execute: AtomicU8::new(0),
            state: AtomicU8::new(MachineState::Init as u8),
            auto_start: AtomicBool::new(true),
            err: AtomicU8::new(Fault::None as u8),
            step_events_remaining: AtomicU32::new(0),
        }
    }

    // --- execution flags ---

    pub fn set_exec(&self, mask: u8) {
        self.execute.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear_exec(&self, mask: u8) {
        self.execute.fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn exec_is_set(&self, mask: u8) -> bool {
        self.execute.load(Ordering::Acquire) & mask != 0
    }

    /// Test-and-clear in one atomic operation; returns true when any of the
    /// requested flags was pending.
    pub fn take_exec(&self, mask: u8) -> bool {
        self.execute.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    pub fn exec_flags(&self) -> u8 {
        self.execute.load(Ordering::Acquire)
    }

    // --- machine state ---

    pub fn machine_state(&self) -> MachineState {
        MachineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_machine_state(&self, state: MachineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start.load(Ordering::Acquire)
    }

    pub fn set_auto_start(&self, on: bool) {
        self.auto_start.store(on, Ordering::Release);
    }

    // --- fault code ---

    pub fn fault(&self) -> Fault {
        Fault::from_u8(self.err.load(Ordering::Acquire))
    }

    pub fn set_fault(&self, fault: Fault) {
        self.err.store(fault as u8, Ordering::Release);
    }

    // --- position ---

    pub fn position_steps(&self) -> [i32; N_AXIS] {
        let mut out = [0i32; N_AXIS];
        for (axis, p) in self.position.iter().enumerate() {
            out[axis] = p.load(Ordering::Acquire);
        }
        out
    }

    pub fn set_position_steps(&self, steps: [i32; N_AXIS]) {
        for (axis, p) in self.position.iter().enumerate() {
            p.store(steps[axis], Ordering::Release);
        }
    }

    /// Single-step update from the pulse engine. `positive` follows the
    /// logical axis direction, before any polarity inversion.
    pub fn bump_position(&self, axis: usize, positive: bool) {
        let delta = if positive { 1 } else { -1 };
        self.position[axis].fetch_add(delta, Ordering::AcqRel);
    }

    // --- feed hold bookkeeping ---

    pub fn set_step_events_remaining(&self, remaining: u32) {
        self.step_events_remaining.store(remaining, Ordering::Release);
    }

    pub fn step_events_remaining(&self) -> u32 {
        self.step_events_remaining.load(Ordering::Acquire)
    }

    /// Read-only snapshot for the reporting layer. Field reads are
    /// individually atomic; no lock is taken.
    pub fn status(&self, settings: &Settings) -> StatusSnapshot {
        let steps = self.position_steps();
        let mut position_mm = [0.0; N_AXIS];
        for axis in 0..N_AXIS {
            position_mm[axis] = steps[axis] as f64 / settings.axes.steps_per_mm[axis];
        }
        StatusSnapshot {
            state: self.machine_state(),
            position_steps: steps,
            position_mm,
            exec_flags: self.exec_flags(),
            fault: self.fault(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: MachineState,
    pub position_steps: [i32; N_AXIS],
    pub position_mm: [f64; N_AXIS],
    pub exec_flags: u8,
    pub fault: Fault,
}
