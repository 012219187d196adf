//! Step pulse engine.
//!
//! `StepperEngine::tick` is the body of the step timer interrupt: one call
//! per step event while a block executes. It walks the block with a
//! multi-axis Bresenham rasterizer, paces the inter-step delay along the
//! planned trapezoid, and reports the delay to program into the timer for
//! the next event.
//!
//! The Bresenham walker and the rate pacer are standalone so the homing
//! routine can drive the same primitives open-loop, outside the block
//! buffer.

use std::sync::Arc;

use crate::config::{AXES_MASK, N_AXIS, Settings};
use crate::hal::StepperHal;
use crate::planner::{
    Block, BlockRing, MICROSECONDS_PER_ACCELERATION_TICK, MINIMUM_STEPS_PER_MINUTE,
};
use crate::system::{MachineState, SystemState, exec};

/// Suggested pump poll period while the engine is idle, in microseconds.
pub const IDLE_POLL_US: u32 = 1_000;

/// Multi-axis Bresenham accumulator set.
///
/// Counters are seeded at half the governing count so pulses land centred
/// in their event windows; each event every axis accumulator advances by
/// its step count and emits on overflow. Over a full walk each axis emits
/// exactly its step count, with inter-pulse gaps never off by more than
/// one event from ideal spacing.
#[derive(Debug, Clone)]
pub struct BresenhamAxes {
    counters: [i64; N_AXIS],
    steps: [u32; N_AXIS],
    step_event_count: u32,
}

impl BresenhamAxes {
    pub fn new(steps: [u32; N_AXIS]) -> Self {
        let step_event_count = steps.iter().copied().max().unwrap_or(0);
        Self {
            counters: [-((step_event_count as i64) >> 1); N_AXIS],
            steps,
            step_event_count,
        }
    }

    pub fn step_event_count(&self) -> u32 {
        self.step_event_count
    }

    /// Advance one step event for the axes in `mask`; returns the axes due
    /// a pulse this event.
    pub fn advance(&mut self, mask: u8) -> u8 {
        let mut due = 0u8;
        for axis in 0..N_AXIS {
            if mask & (1 << axis) == 0 {
                continue;
            }
            self.counters[axis] += self.steps[axis] as i64;
            if self.counters[axis] > 0 {
                due |= 1 << axis;
                self.counters[axis] -= self.step_event_count as i64;
            }
        }
        due
    }
}

/// Integer rate pacer following the constant-acceleration line in the
/// velocity/time domain: accumulate elapsed time per step event, and on
/// each acceleration tick move the step rate by one delta.
#[derive(Debug, Clone)]
pub struct RatePacer {
    rate: u32, // steps/min
    dt_us: u32,
    accumulator_us: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum RateAdjust {
    Hold,
    Up { delta: u32, ceiling: u32 },
    Down { delta: u32, floor: u32 },
}

impl RatePacer {
    pub fn new(initial_rate: u32) -> Self {
        let rate = initial_rate.max(MINIMUM_STEPS_PER_MINUTE);
        Self {
            rate,
            dt_us: dt_for_rate(rate),
            accumulator_us: MICROSECONDS_PER_ACCELERATION_TICK / 2,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn dt_us(&self) -> u32 {
        self.dt_us
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate.max(MINIMUM_STEPS_PER_MINUTE);
        self.dt_us = dt_for_rate(self.rate);
    }

    /// Account one step event of elapsed time and apply any due
    /// acceleration ticks.
    pub fn advance(&mut self, adjust: RateAdjust) {
        self.accumulator_us += self.dt_us;
        while self.accumulator_us >= MICROSECONDS_PER_ACCELERATION_TICK {
            self.accumulator_us -= MICROSECONDS_PER_ACCELERATION_TICK;
            match adjust {
                RateAdjust::Hold => {}
                RateAdjust::Up { delta, ceiling } => {
                    self.rate = (self.rate + delta).min(ceiling.max(MINIMUM_STEPS_PER_MINUTE));
                }
                RateAdjust::Down { delta, floor } => {
                    self.rate = self
                        .rate
                        .saturating_sub(delta)
                        .max(floor.max(MINIMUM_STEPS_PER_MINUTE));
                }
            }
        }
        self.dt_us = dt_for_rate(self.rate);
    }
}

fn dt_for_rate(rate: u32) -> u32 {
    60_000_000 / rate.max(MINIMUM_STEPS_PER_MINUTE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepperState {
    /// Outputs quiescent.
    Idle,
    /// Walking a block from the ring.
    Executing,
    /// Feed hold: ramping the rate to zero under the deceleration law.
    Stopping,
}

struct ActiveBlock {
    block: Block,
    bresenham: BresenhamAxes,
    /// Step events completed within the current plan. Reset by cycle
    /// reinitialization while the Bresenham counters carry on, so no step
    /// is ever missed or doubled across a hold.
    completed: u32,
    pacer: RatePacer,
}

impl ActiveBlock {
    fn new(block: Block, carry_rate: Option<u32>) -> Self {
        let initial = match carry_rate {
            Some(rate) => rate.min(block.initial_rate),
            None => block.initial_rate,
        };
        Self {
            bresenham: BresenhamAxes::new(block.steps),
            completed: 0,
            pacer: RatePacer::new(initial),
            block,
        }
    }
}

/// Timer-interrupt-driven stepper state machine.
pub struct StepperEngine {
    ring: Arc<BlockRing>,
    sys: Arc<SystemState>,
    state: StepperState,
    active: Option<ActiveBlock>,
    pulse_us: u32,
    idle_lock_time: u8,
    invert_mask: u8,
    /// Set when a feed hold has ramped to a stop and the interrupted block
    /// awaits cycle reinitialization.
    hold_complete: bool,
    /// Ramp rate carried across a block boundary during a feed hold.
    carry_rate: Option<u32>,
}

impl StepperEngine {
    pub fn new(ring: Arc<BlockRing>, sys: Arc<SystemState>, settings: &Settings) -> Self {
        Self {
            ring,
            sys,
            state: StepperState::Idle,
            active: None,
            pulse_us: settings.stepper.pulse_microseconds,
            idle_lock_time: settings.stepper.idle_lock_time,
            invert_mask: settings.axes.invert_mask,
            hold_complete: false,
            carry_rate: None,
        }
    }

    pub fn state(&self) -> StepperState {
        self.state
    }

    pub fn is_quiescent(&self) -> bool {
        self.state == StepperState::Idle || self.hold_complete
    }

    /// One step event. Returns the delay until the next event should fire,
    /// or `None` while there is nothing to execute.
    pub fn tick<H: StepperHal + ?Sized>(&mut self, hal: &mut H) -> Option<u32> {
        // Kill/reset overrides everything: no new pulse once the flag is
        // up. The in-flight pulse (if any) completed on the previous tick.
        if self.sys.exec_is_set(exec::RESET) {
            self.halt(hal);
            return None;
        }
        if self.sys.take_exec(exec::CYCLE_START) {
            self.cycle_start(hal);
        }
        if self.sys.take_exec(exec::FEED_HOLD) && self.state == StepperState::Executing {
            self.state = StepperState::Stopping;
            self.sys.set_machine_state(MachineState::Hold);
            self.sys.set_auto_start(false);
            tracing::debug!("feed hold: decelerating");
        }
        match self.state {
            StepperState::Idle => None,
            StepperState::Executing | StepperState::Stopping => {
                if self.hold_complete {
                    return None;
                }
                self.step_event(hal)
            }
        }
    }

    /// Forced idle from either context. Outputs go quiescent immediately;
    /// any active block is abandoned (the ring is drained by the reset
    /// path in the main loop).
    pub fn halt<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        hal.set_step_pins(0);
        if self.state != StepperState::Idle {
            tracing::debug!("stepper halted");
        }
        self.state = StepperState::Idle;
        self.active = None;
        self.hold_complete = false;
        self.carry_rate = None;
        self.apply_idle_disable(hal);
    }

    fn cycle_start<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        if self.hold_complete {
            // Resume after a hold: the head block was replanned from a
            // standstill; refresh the trapezoid but keep the Bresenham
            // walk exactly where it stopped.
            self.hold_complete = false;
            self.carry_rate = None;
            if let Some(active) = &mut self.active {
                if let Some(block) = self.ring.current() {
                    self.ring.mark_head_started();
                    active.block = block;
                    active.completed = 0;
                    active.pacer = RatePacer::new(block.initial_rate);
                } else {
                    self.active = None;
                }
            }
            hal.set_stepper_enable(true);
            self.state = StepperState::Executing;
            self.sys.set_machine_state(MachineState::Cycle);
            tracing::debug!("cycle resumed");
        } else if self.state == StepperState::Idle && !self.ring.is_empty() {
            hal.set_stepper_enable(true);
            self.state = StepperState::Executing;
            self.sys.set_machine_state(MachineState::Cycle);
        }
    }

    fn step_event<H: StepperHal + ?Sized>(&mut self, hal: &mut H) -> Option<u32> {
        if self.active.is_none() {
            match self.ring.current() {
                Some(block) => {
                    self.ring.mark_head_started();
                    // Direction polarity correction happens at the pins;
                    // position accounting stays in logical direction bits.
                    hal.set_direction_pins(block.direction_bits ^ self.invert_mask);
                    self.active = Some(ActiveBlock::new(block, self.carry_rate.take()));
                }
                None => {
                    self.finish_cycle(hal);
                    return None;
                }
            }
        }
        let Some(active) = self.active.as_mut() else {
            return None;
        };
        let block = active.block;

        // Rasterize one step event and pulse the due axes.
        let due = active.bresenham.advance(AXES_MASK);
        if due != 0 {
            hal.set_step_pins(due);
            hal.delay_us(self.pulse_us);
            hal.set_step_pins(0);
            for axis in 0..N_AXIS {
                if due & (1 << axis) != 0 {
                    self.sys
                        .bump_position(axis, block.direction_bits & (1 << axis) == 0);
                }
            }
        }
        active.completed += 1;

        if active.completed >= block.step_event_count {
            let dt = active.pacer.dt_us();
            if self.state == StepperState::Stopping {
                self.carry_rate = Some(active.pacer.rate());
            }
            self.ring.discard_current();
            self.active = None;
            return Some(dt);
        }

        // Trapezoid pacing: integer-accumulated rate delta once per
        // acceleration tick, clamped to the block's rate bounds.
        match self.state {
            StepperState::Stopping => {
                active.pacer.advance(RateAdjust::Down {
                    delta: block.rate_delta,
                    floor: MINIMUM_STEPS_PER_MINUTE,
                });
                if active.pacer.rate() <= MINIMUM_STEPS_PER_MINUTE {
                    let remaining = block.step_event_count - active.completed;
                    self.sys.set_step_events_remaining(remaining);
                    self.sys.set_exec(exec::CYCLE_STOP);
                    self.hold_complete = true;
                    tracing::debug!(remaining, "feed hold complete");
                    return None;
                }
            }
            _ => {
                if active.completed < block.accelerate_until {
                    active.pacer.advance(RateAdjust::Up {
                        delta: block.rate_delta,
                        ceiling: block.nominal_rate,
                    });
                } else if active.completed >= block.decelerate_after {
                    active.pacer.advance(RateAdjust::Down {
                        delta: block.rate_delta,
                        floor: block.final_rate,
                    });
                } else {
                    // Cruise: snap off any rounding left over from the
                    // acceleration ramp.
                    active.pacer.set_rate(block.nominal_rate);
                    active.pacer.advance(RateAdjust::Hold);
                }
            }
        }
        Some(active.pacer.dt_us())
    }

    fn finish_cycle<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        self.state = StepperState::Idle;
        self.carry_rate = None;
        self.sys.set_exec(exec::CYCLE_STOP);
        self.sys.set_machine_state(MachineState::Idle);
        self.apply_idle_disable(hal);
        tracing::debug!("block buffer drained, stepper idle");
    }

    fn apply_idle_disable<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        // 255 keeps the drivers energised to hold position between moves.
        if self.idle_lock_time == 255 {
            return;
        }
        // Hold torque for the configured lock time so the axes settle
        // before the drivers release.
        hal.delay_us(u32::from(self.idle_lock_time) * 1_000);
        hal.set_stepper_enable(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hal::SimBackend;
    use crate::motion::build_line_request;
    use crate::planner::Planner;

    struct Rig {
        planner: Planner,
        engine: StepperEngine,
        sys: Arc<SystemState>,
        sim: SimBackend,
        settings: Settings,
    }

    fn rig() -> Rig {
        rig_with(Settings::default(), SimBackend::new())
    }

    fn rig_with(settings: Settings, sim: SimBackend) -> Rig {
        let ring = Arc::new(BlockRing::new());
        let sys = Arc::new(SystemState::new());
        Rig {
            planner: Planner::new(ring.clone()),
            engine: StepperEngine::new(ring, sys.clone(), &settings),
            sys,
            sim,
            settings,
        }
    }

    fn enqueue(rig: &mut Rig, target_mm: [f64; N_AXIS], feed: f64) {
        let request = build_line_request(
            rig.planner.position_steps(),
            target_mm,
            feed,
            false,
            &rig.settings,
        )
        .expect("non-degenerate line");
        assert_eq!(
            rig.planner.enqueue(&request, &rig.settings),
            crate::planner::EnqueueStatus::Planned
        );
    }

    fn run_to_idle(rig: &mut Rig, max_ticks: usize) -> Vec<u32> {
        rig.sys.set_exec(exec::CYCLE_START);
        let mut delays = Vec::new();
        for _ in 0..max_ticks {
            match rig.engine.tick(&mut rig.sim) {
                Some(dt) => delays.push(dt),
                None => return delays,
            }
        }
        panic!("engine did not finish within {} ticks", max_ticks);
    }

    #[test]
    fn bresenham_exact_pulse_counts() {
        let mut rig = rig();
        // 1000/250/7/999 steps at 80 steps/mm.
        enqueue(&mut rig, [12.5, 3.125, 0.0875, 12.4875], 300.0);
        run_to_idle(&mut rig, 5_000);
        assert_eq!(rig.sim.pulse_counts(), [1000, 250, 7, 999]);
        assert_eq!(rig.sys.position_steps(), [1000, 250, 7, 999]);
    }

    #[test]
    fn bresenham_pulses_evenly_distributed() {
        let mut rig = rig();
        enqueue(&mut rig, [12.5, 3.125, 0.0, 0.0], 300.0);
        run_to_idle(&mut rig, 5_000);
        // Y fires 250 times over 1000 events; event-index gaps may differ
        // by at most one event.
        let y_events: Vec<usize> = rig
            .sim
            .pulse_log()
            .iter()
            .enumerate()
            .filter(|(_, (_, mask))| mask & 0b0010 != 0)
            .map(|(event, _)| event)
            .collect();
        assert_eq!(y_events.len(), 250);
        let gaps: Vec<usize> = y_events.windows(2).map(|w| w[1] - w[0]).collect();
        let min = gaps.iter().min().unwrap();
        let max = gaps.iter().max().unwrap();
        assert!(max - min <= 1, "uneven spacing: min {} max {}", min, max);
    }

    #[test]
    fn trapezoid_rates_follow_plan() {
        let mut rig = rig();
        enqueue(&mut rig, [12.5, 0.0, 0.0, 0.0], 200.0);
        let delays = run_to_idle(&mut rig, 5_000);
        let rates: Vec<u32> = delays.iter().map(|dt| 60_000_000 / dt).collect();
        let nominal = *rates.iter().max().unwrap();
        // Accelerating front, cruising middle, decelerating tail.
        let first_cruise = rates.iter().position(|&r| r == nominal).unwrap();
        let last_cruise = rates.len() - 1
            - rates.iter().rev().position(|&r| r == nominal).unwrap();
        assert!(rates[..first_cruise].windows(2).all(|w| w[0] <= w[1]));
        assert!(rates[last_cruise..].windows(2).all(|w| w[0] >= w[1]));
        assert!(rates.iter().all(|&r| r <= nominal));
    }

    #[test]
    fn feed_hold_ramps_and_resume_completes_block() {
        let mut rig = rig();
        enqueue(&mut rig, [12.5, 0.0, 0.0, 0.0], 200.0);
        rig.sys.set_exec(exec::CYCLE_START);
        for _ in 0..200 {
            rig.engine.tick(&mut rig.sim).expect("still executing");
        }
        rig.sys.set_exec(exec::FEED_HOLD);
        let mut ticks = 0;
        while rig.engine.tick(&mut rig.sim).is_some() {
            ticks += 1;
            assert!(ticks < 4_000, "hold never completed");
        }
        assert!(rig.sys.exec_is_set(exec::CYCLE_STOP));
        assert_eq!(rig.sys.machine_state(), MachineState::Hold);
        let remaining = rig.sys.step_events_remaining();
        assert!(remaining > 0 && remaining < 1000);
        assert_eq!(rig.sim.pulse_counts()[0] as u32, 1000 - remaining);

        // Replan the interrupted block and resume; every step of the
        // original 1000 must come out exactly once.
        rig.sys.clear_exec(exec::CYCLE_STOP);
        rig.planner.cycle_reinitialize(remaining, &rig.settings);
        run_to_idle(&mut rig, 5_000);
        assert_eq!(rig.sim.pulse_counts()[0], 1000);
        assert_eq!(rig.sys.position_steps()[0], 1000);
    }

    #[test]
    fn reset_stops_pulsing_within_one_tick() {
        let mut rig = rig();
        enqueue(&mut rig, [12.5, 0.0, 0.0, 0.0], 200.0);
        rig.sys.set_exec(exec::CYCLE_START);
        for _ in 0..50 {
            rig.engine.tick(&mut rig.sim).expect("still executing");
        }
        let pulses_at_kill = rig.sim.pulse_counts();
        rig.sys.set_exec(exec::RESET);
        assert_eq!(rig.engine.tick(&mut rig.sim), None);
        assert_eq!(rig.engine.state(), StepperState::Idle);
        assert_eq!(rig.sim.pulse_counts(), pulses_at_kill);
        assert_eq!(rig.sim.step_pins(), 0);
        // Still no pulses on further ticks while the flag stands.
        assert_eq!(rig.engine.tick(&mut rig.sim), None);
        assert_eq!(rig.sim.pulse_counts(), pulses_at_kill);
    }

    #[test]
    fn negative_direction_counts_down() {
        let mut rig = rig();
        enqueue(&mut rig, [-2.0, 0.0, 0.0, 0.0], 200.0);
        run_to_idle(&mut rig, 2_000);
        assert_eq!(rig.sys.position_steps()[0], -160);
        assert_eq!(rig.sim.position()[0], -160);
    }

    #[test]
    fn invert_mask_corrects_backwards_wiring() {
        let mut settings = Settings::default();
        settings.axes.invert_mask = 0b0001;
        let mut rig = rig_with(settings, SimBackend::new().with_inverted_wiring(0b0001));
        enqueue(&mut rig, [2.0, 1.0, 0.0, 0.0], 200.0);
        run_to_idle(&mut rig, 2_000);
        // Logical direction is positive on both axes, so the X pin is
        // driven at the flipped level and the backwards motor still
        // travels positive.
        assert_eq!(rig.sim.direction_pins(), 0b0001);
        assert_eq!(rig.sim.position()[0], 160);
        assert_eq!(rig.sim.position()[1], 80);
        assert_eq!(rig.sys.position_steps(), [160, 80, 0, 0]);
    }

    #[test]
    fn idle_lock_releases_drivers_after_delay() {
        let mut settings = Settings::default();
        settings.stepper.idle_lock_time = 30;
        let mut rig = rig_with(settings, SimBackend::new());
        enqueue(&mut rig, [1.0, 0.0, 0.0, 0.0], 200.0);
        run_to_idle(&mut rig, 2_000);
        assert!(!rig.sim.enabled());
        let last_pulse = rig.sim.pulse_log().last().map(|(t, _)| *t).unwrap();
        assert!(rig.sim.clock_us() >= last_pulse + 30_000);
    }

    #[test]
    fn idle_lock_255_keeps_drivers_energised() {
        let mut rig = rig();
        enqueue(&mut rig, [1.0, 0.0, 0.0, 0.0], 200.0);
        run_to_idle(&mut rig, 2_000);
        assert!(rig.sim.enabled());
    }
}
