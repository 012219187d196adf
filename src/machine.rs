//! Machine assembly and runtime protocol.
//!
//! `Machine` wires the shared state, block ring, motion façade, stepper
//! engine and limit supervisor together, and runs the engine from a pump
//! task that stands in for the step timer interrupt: tick, sleep the delay
//! the engine asks for, repeat. Everything the pump shares with the
//! command side goes through atomics or the ring, so neither side ever
//! blocks the other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{N_AXIS, Settings};
use crate::hal::StepperHal;
use crate::limits::{self, HomingError, LimitSupervisor};
use crate::motion::MotionController;
use crate::planner::BlockRing;
use crate::stepper::{IDLE_POLL_US, StepperEngine};
use crate::system::{Fault, MachineState, StatusSnapshot, SystemState, exec};

/// Grace period for the pump to observe a freshly raised reset flag
/// before the queue is torn down.
const RESET_SETTLE: Duration = Duration::from_millis(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MachineError {
    #[error("homing is disabled in the configuration")]
    HomingDisabled,
    #[error("cannot home while a cycle is running")]
    Busy,
    #[error("homing aborted by reset")]
    HomingAborted,
}

impl From<HomingError> for MachineError {
    fn from(_: HomingError) -> Self {
        MachineError::HomingAborted
    }
}

pub struct Machine<H: StepperHal + 'static> {
    sys: Arc<SystemState>,
    ring: Arc<BlockRing>,
    settings: Arc<Settings>,
    hal: Arc<Mutex<H>>,
    supervisor: Arc<Mutex<LimitSupervisor>>,
    motion: MotionController,
}

impl<H: StepperHal + 'static> Machine<H> {
    pub fn new(settings: Settings, hal: H) -> Self {
        let settings = Arc::new(settings);
        let sys = Arc::new(SystemState::new());
        let ring = Arc::new(BlockRing::new());
        let supervisor = Arc::new(Mutex::new(LimitSupervisor::new(sys.clone(), &settings)));
        let motion = MotionController::new(ring.clone(), sys.clone(), settings.clone());
        sys.set_machine_state(MachineState::Idle);
        Self {
            sys,
            ring,
            settings,
            hal: Arc::new(Mutex::new(hal)),
            supervisor,
            motion,
        }
    }

    pub fn motion(&mut self) -> &mut MotionController {
        &mut self.motion
    }

    pub fn system(&self) -> Arc<SystemState> {
        self.sys.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn status(&self) -> StatusSnapshot {
        self.sys.status(&self.settings)
    }

    /// Run a closure against the hardware backend. Test hook for poking
    /// simulated switches mid-flight.
    pub fn with_hal<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        let mut hal = self.hal.lock().expect("hal mutex poisoned");
        f(&mut hal)
    }

    /// Start the stepper pump: the host-side stand-in for the step timer
    /// interrupt. Runs until the task is aborted.
    pub fn spawn_pump(&self) -> JoinHandle<()> {
        let sys = self.sys.clone();
        let ring = self.ring.clone();
        let settings = self.settings.clone();
        let hal = self.hal.clone();
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            let mut engine = StepperEngine::new(ring, sys, &settings);
            loop {
                let delay = {
                    let mut hal = hal.lock().expect("hal mutex poisoned");
                    supervisor
                        .lock()
                        .expect("supervisor mutex poisoned")
                        .poll(&mut *hal);
                    engine.tick(&mut *hal)
                };
                let us = delay.unwrap_or(IDLE_POLL_US);
                tokio::time::sleep(Duration::from_micros(u64::from(us))).await;
            }
        })
    }

    /// Runtime housekeeping: reset recovery and status report requests.
    /// The host calls this from its command loop.
    pub async fn service(&mut self) {
        if self.sys.exec_is_set(exec::RESET) {
            self.finish_reset().await;
        }
        // Engine raises this when a cycle drains or a hold completes; by
        // here the state word already tells the story.
        self.sys.take_exec(exec::CYCLE_STOP);
        if self.sys.take_exec(exec::STATUS_REPORT) {
            let status = self.status();
            tracing::info!(?status, "status report");
        }
    }

    /// Immediate kill: raise the reset flag, wait for the pump to go
    /// quiescent, then tear down the queue. The sticky alarm survives if
    /// the kill came from a critical event.
    pub async fn reset(&mut self) {
        self.sys.set_exec(exec::RESET);
        self.finish_reset().await;
    }

    async fn finish_reset(&mut self) {
        tokio::time::sleep(RESET_SETTLE).await;
        self.ring.reset();
        self.motion.planner_mut().reset(self.sys.position_steps());
        self.sys.set_step_events_remaining(0);
        self.sys
            .clear_exec(exec::CYCLE_START | exec::CYCLE_STOP | exec::FEED_HOLD);
        if self.sys.take_exec(exec::CRIT_EVENT) {
            self.sys.set_exec(exec::ALARM);
            self.sys.set_machine_state(MachineState::Alarm);
            tracing::error!(fault = ?self.sys.fault(), "critical event, machine alarmed");
        } else {
            self.sys.set_machine_state(MachineState::Idle);
            tracing::info!("reset complete");
        }
        self.sys.clear_exec(exec::RESET);
    }

    /// Pause the running cycle with a controlled deceleration.
    pub fn feed_hold(&self) {
        if self.sys.machine_state() == MachineState::Cycle {
            self.sys.set_auto_start(false);
            self.sys.set_exec(exec::FEED_HOLD);
        }
    }

    /// Start motion that was queued with auto-start off. No effect unless
    /// the machine is parked in `Queued`.
    pub fn cycle_start(&self) {
        if self.sys.machine_state() == MachineState::Queued && !self.sys.exec_is_set(exec::RESET) {
            self.sys.set_exec(exec::CYCLE_START);
        }
    }

    /// Resume from a feed hold: replan the interrupted block from a
    /// standstill and restart the cycle.
    pub fn resume(&mut self) {
        if self.sys.machine_state() != MachineState::Hold || self.sys.exec_is_set(exec::RESET) {
            return;
        }
        let remaining = self.sys.step_events_remaining();
        self.motion
            .planner_mut()
            .cycle_reinitialize(remaining, &self.settings);
        self.sys.set_step_events_remaining(0);
        self.sys.clear_exec(exec::CYCLE_STOP);
        self.sys.set_auto_start(true);
        self.sys.set_exec(exec::CYCLE_START);
    }

    /// Drop out of the sticky alarm without homing. Position is whatever
    /// it was; the operator owns that risk.
    pub fn clear_alarm(&self) {
        if self.sys.machine_state() == MachineState::Alarm {
            self.sys.clear_exec(exec::ALARM);
            self.sys.set_fault(Fault::None);
            self.sys.set_machine_state(MachineState::Idle);
            tracing::warn!("alarm cleared without homing");
        }
    }

    /// Full homing sequence. The limit supervisor is disarmed while the
    /// axes deliberately drive into their switches, and machine zero plus
    /// the planner origin are re-established on success.
    pub async fn home(&mut self) -> Result<(), MachineError> {
        if !self.settings.homing.enable {
            return Err(MachineError::HomingDisabled);
        }
        if matches!(
            self.sys.machine_state(),
            MachineState::Cycle | MachineState::Hold | MachineState::Homing
        ) {
            return Err(MachineError::Busy);
        }
        self.supervisor
            .lock()
            .expect("supervisor mutex poisoned")
            .set_armed(false);

        let hal = self.hal.clone();
        let sys = self.sys.clone();
        let settings = self.settings.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut hal = hal.lock().expect("hal mutex poisoned");
            limits::go_home(&mut *hal, &sys, &settings)
        })
        .await
        .expect("homing task panicked");

        self.supervisor
            .lock()
            .expect("supervisor mutex poisoned")
            .set_armed(true);
        match outcome {
            Ok(()) => {
                self.ring.reset();
                self.motion.planner_mut().reset([0; N_AXIS]);
                self.sys.set_machine_state(MachineState::Idle);
                Ok(())
            }
            Err(e) => {
                self.sys.set_machine_state(MachineState::Alarm);
                Err(e.into())
            }
        }
    }
}
