//! Limit switches, estop and homing.
//!
//! Two halves. `LimitSupervisor` is the hard-limit watchdog: it edge-detects
//! the limit inputs and the estop, optionally re-samples them through the
//! debounce filter, and kills the machine by raising the reset and critical
//! event flags. The homing routines drive a reduced open-loop stepping loop
//! built from the same Bresenham/pacer primitives as the main engine,
//! because homing ends with abrupt per-axis stops that the block planner
//! cannot express.

use std::sync::Arc;

use crate::config::{AXES_MASK, N_AXIS, Settings, X_AXIS, Y_AXIS, Z_AXIS, U_AXIS};
use crate::hal::StepperHal;
use crate::planner::{ACCELERATION_TICKS_PER_SECOND, MINIMUM_STEPS_PER_MINUTE};
use crate::stepper::{BresenhamAxes, RateAdjust, RatePacer};
use crate::system::{Fault, MachineState, SystemState, exec};

/// Estop bit in a sampled switch state word, alongside the axis bits.
const ESTOP_BIT: u8 = 1 << 7;

/// Debounce sampler: read the switches every 10 us until 50 consecutive
/// reads agree, giving up after 500 reads total.
const DEBOUNCE_READS_MAX: u16 = 500;
const DEBOUNCE_READS_STABLE: u16 = 50;
const DEBOUNCE_READ_GAP_US: u32 = 10;

/// Consecutive identical reads required by the homing loop before it
/// trusts a switch state.
const HOMING_STABLE_READS: u8 = 10;

/// Sample the switch inputs through the debounce filter and classify what
/// is engaged. A state that never settles is a fault of its own.
pub fn sample_fault<H: StepperHal + ?Sized>(hal: &mut H) -> Fault {
    let mut prev = 0u8;
    let mut stable = 0u16;
    for _ in 0..DEBOUNCE_READS_MAX {
        hal.delay_us(DEBOUNCE_READ_GAP_US);
        let mut state = hal.read_limit_pins() & AXES_MASK;
        if hal.read_estop() {
            state |= ESTOP_BIT;
        }
        if state == prev {
            stable += 1;
            if stable == DEBOUNCE_READS_STABLE {
                return classify_state(state);
            }
        } else {
            prev = state;
            stable = 0;
        }
    }
    Fault::Bounce
}

fn classify_state(state: u8) -> Fault {
    let x = state & (1 << X_AXIS) != 0;
    let y = state & (1 << Y_AXIS) != 0;
    let z = state & (1 << Z_AXIS) != 0;
    let u = state & (1 << U_AXIS) != 0;
    if x && y {
        Fault::XyAxis
    } else if u && z {
        Fault::UzAxis
    } else if x {
        Fault::XAxis
    } else if y {
        Fault::YAxis
    } else if u {
        Fault::UAxis
    } else if z {
        Fault::ZAxis
    } else if state & ESTOP_BIT != 0 {
        Fault::EStop
    } else if state == 0 {
        Fault::None
    } else {
        Fault::Undefined
    }
}

/// Hard-limit and estop watchdog.
///
/// `poll` stands in for the pin-change interrupt: the host pump calls it
/// between step batches, so worst-case reaction is one poll period. Homing
/// disarms it while it drives the axes into the switches on purpose.
pub struct LimitSupervisor {
    sys: Arc<SystemState>,
    hard_enable: bool,
    soft_debounce: bool,
    armed: bool,
    prev_pins: u8,
}

impl LimitSupervisor {
    pub fn new(sys: Arc<SystemState>, settings: &Settings) -> Self {
        Self {
            sys,
            hard_enable: settings.limits.hard_enable,
            soft_debounce: settings.limits.soft_debounce,
            armed: true,
            prev_pins: 0,
        }
    }

    pub fn set_armed(&mut self, armed: bool) {
        self.armed = armed;
        self.prev_pins = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn poll<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        let estop = hal.read_estop();
        let pins = if self.hard_enable {
            hal.read_limit_pins() & AXES_MASK
        } else {
            0
        };
        let rising = pins & !self.prev_pins;
        self.prev_pins = pins;
        if !self.armed {
            return;
        }
        if !estop && rising == 0 {
            return;
        }
        // Already alarmed: nothing further to kill.
        if self.sys.machine_state() == MachineState::Alarm
            || self.sys.exec_is_set(exec::ALARM)
        {
            return;
        }
        let fault = if self.soft_debounce {
            sample_fault(hal)
        } else if estop {
            Fault::EStop
        } else {
            classify_state(pins)
        };
        if fault != Fault::None {
            self.kill(fault);
        }
    }

    fn kill(&self, fault: Fault) {
        tracing::warn!(?fault, "limit event, killing motion");
        self.sys.set_fault(fault);
        self.sys.set_exec(exec::RESET | exec::CRIT_EVENT);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingError {
    /// Reset raised while a homing move was in flight.
    Aborted,
}

/// Read the limit inputs until `HOMING_STABLE_READS` consecutive samples
/// agree. Keeps homing honest against contact chatter right at the
/// trip point.
fn stable_limit_pins<H: StepperHal + ?Sized>(hal: &mut H) -> u8 {
    let mut prev = hal.read_limit_pins() & AXES_MASK;
    let mut stable = 1u8;
    while stable < HOMING_STABLE_READS {
        hal.delay_us(2);
        let state = hal.read_limit_pins() & AXES_MASK;
        if state == prev {
            stable += 1;
        } else {
            prev = state;
            stable = 0;
        }
    }
    prev
}

/// Move the axes in `cycle_mask` toward (`approach`) or off (`!approach`)
/// their switches at `rate` mm/min, stopping each axis independently on
/// its switch transition. Only reset can interrupt the loop.
fn homing_move<H: StepperHal + ?Sized>(
    hal: &mut H,
    sys: &SystemState,
    settings: &Settings,
    cycle_mask: u8,
    approach: bool,
    rate: f64,
) -> Result<(), HomingError> {
    let mut steps = [0u32; N_AXIS];
    let mut n_active = 0u32;
    for axis in 0..N_AXIS {
        if cycle_mask & (1 << axis) != 0 {
            steps[axis] = settings.axes.steps_per_mm[axis].round() as u32;
            n_active += 1;
        }
    }
    if n_active == 0 {
        return Ok(());
    }
    let mut bresenham = BresenhamAxes::new(steps);
    let step_event_count = bresenham.step_event_count();

    // Reduce the governing rate by the distance actually traveled per
    // event when several axes move together, same correction the planner
    // applies to multi-axis lines.
    let ds = step_event_count as f64 / (n_active as f64).sqrt();
    let delta_rate =
        (ds * settings.stepper.acceleration / (60.0 * ACCELERATION_TICKS_PER_SECOND)).ceil() as u32;
    let target_rate = ((ds * rate) as u32).max(MINIMUM_STEPS_PER_MINUTE);
    let mut pacer = RatePacer::new(MINIMUM_STEPS_PER_MINUTE);

    // Direction bit set moves toward negative travel; the homing direction
    // mask says which axes home negative. Leaving a switch goes the
    // opposite way.
    let dir_bits = if approach {
        settings.homing.dir_mask & cycle_mask
    } else {
        !settings.homing.dir_mask & cycle_mask
    };
    hal.set_direction_pins(dir_bits ^ settings.axes.invert_mask);

    let mut remaining = cycle_mask;
    loop {
        let pins = stable_limit_pins(hal);
        // Bit set while an axis should keep moving.
        let travel = if approach { !pins } else { pins };

        let due = bresenham.advance(remaining);
        let mut pulse = 0u8;
        for axis in 0..N_AXIS {
            let bit = 1 << axis;
            if due & bit == 0 {
                continue;
            }
            if travel & bit != 0 {
                pulse |= bit;
            } else {
                remaining &= !bit;
            }
        }

        if remaining == 0 {
            return Ok(());
        }
        if sys.exec_is_set(exec::RESET) {
            return Err(HomingError::Aborted);
        }

        if pulse != 0 {
            hal.set_step_pins(pulse);
            hal.delay_us(settings.stepper.pulse_microseconds);
            hal.set_step_pins(0);
        }
        hal.delay_us(pacer.dt_us().saturating_sub(settings.stepper.pulse_microseconds));
        pacer.advance(RateAdjust::Up {
            delta: delta_rate,
            ceiling: target_rate,
        });
    }
}

/// Fixed-count open-loop move used for the post-homing pull-off.
fn open_loop_move<H: StepperHal + ?Sized>(
    hal: &mut H,
    sys: &SystemState,
    settings: &Settings,
    move_steps: [u32; N_AXIS],
    dir_bits: u8,
    rate: f64,
) -> Result<(), HomingError> {
    let mut bresenham = BresenhamAxes::new(move_steps);
    let step_event_count = bresenham.step_event_count();
    if step_event_count == 0 {
        return Ok(());
    }
    let mut mm = 0.0f64;
    for axis in 0..N_AXIS {
        if move_steps[axis] > 0 {
            let d = move_steps[axis] as f64 / settings.axes.steps_per_mm[axis];
            mm += d * d;
        }
    }
    let mm = mm.sqrt();
    let rate_steps = (rate * step_event_count as f64 / mm) as u32;
    let delta_rate = ((step_event_count as f64 / mm) * settings.stepper.acceleration
        / (60.0 * ACCELERATION_TICKS_PER_SECOND))
        .ceil() as u32;
    let target_rate = rate_steps.max(MINIMUM_STEPS_PER_MINUTE);
    let mut pacer = RatePacer::new(MINIMUM_STEPS_PER_MINUTE);

    hal.set_direction_pins(dir_bits ^ settings.axes.invert_mask);
    let mut completed = 0u32;
    while completed < step_event_count {
        if sys.exec_is_set(exec::RESET) {
            return Err(HomingError::Aborted);
        }
        let due = bresenham.advance(AXES_MASK);
        if due != 0 {
            hal.set_step_pins(due);
            hal.delay_us(settings.stepper.pulse_microseconds);
            hal.set_step_pins(0);
        }
        completed += 1;
        hal.delay_us(pacer.dt_us().saturating_sub(settings.stepper.pulse_microseconds));
        pacer.advance(RateAdjust::Up {
            delta: delta_rate,
            ceiling: target_rate,
        });
    }
    Ok(())
}

fn debounce_pause<H: StepperHal + ?Sized>(hal: &mut H, settings: &Settings) {
    hal.delay_us(u32::from(settings.homing.debounce_delay_ms) * 1_000);
}

/// Full homing sequence: seek each configured axis group into its switches
/// at the seek rate, then release/re-approach every homed axis
/// `locate_cycles` times at the feed rate, pull off the switches, and
/// declare that spot machine zero.
///
/// The caller must disarm the limit supervisor around this and reset the
/// planner position afterwards.
pub fn go_home<H: StepperHal + ?Sized>(
    hal: &mut H,
    sys: &SystemState,
    settings: &Settings,
) -> Result<(), HomingError> {
    hal.set_stepper_enable(true);
    sys.set_machine_state(MachineState::Homing);
    tracing::info!("homing started");

    let mut homed_mask = 0u8;
    for group in settings.homing.group_masks() {
        homing_move(hal, sys, settings, group, true, settings.homing.seek_rate)?;
        homed_mask |= group;
    }
    debounce_pause(hal, settings);

    let mut n_cycle = settings.homing.locate_cycles;
    while n_cycle > 0 {
        n_cycle -= 1;
        homing_move(hal, sys, settings, homed_mask, false, settings.homing.feed_rate)?;
        debounce_pause(hal, settings);
        if n_cycle > 0 {
            homing_move(hal, sys, settings, homed_mask, true, settings.homing.feed_rate)?;
            debounce_pause(hal, settings);
        }
    }

    // Pull off the switches so normal travel cannot graze them, then call
    // this spot zero.
    let mut pulloff_steps = [0u32; N_AXIS];
    for axis in 0..N_AXIS {
        if homed_mask & (1 << axis) != 0 {
            pulloff_steps[axis] =
                (settings.homing.pulloff[axis] * settings.axes.steps_per_mm[axis]).round() as u32;
        }
    }
    let away_bits = !settings.homing.dir_mask & homed_mask;
    open_loop_move(
        hal,
        sys,
        settings,
        pulloff_steps,
        away_bits,
        settings.homing.feed_rate,
    )?;

    sys.set_position_steps([0; N_AXIS]);
    tracing::info!(mask = homed_mask, "homing complete, machine zeroed");
    Ok(())
}
