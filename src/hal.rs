//! Hardware boundary.
//!
//! The core never touches registers directly; everything goes through
//! `StepperHal` so the planner/stepper/homing logic is portable and can run
//! against the simulated backend in tests and on the host.
//!
//! Mask conventions: one bit per axis (`1 << axis`), a set direction bit
//! moves the axis toward negative travel, a set limit bit means the switch
//! is engaged. The core XORs `axes.invert_mask` into the direction bits
//! before they reach the backend, so a backend wired backwards on an axis
//! is compensated in configuration.

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::config::N_AXIS;

/// Output/input set per axis plus the estop input and the step clock.
/// Implementations must be cheap: these are called once per step event.
pub trait StepperHal: Send {
    /// Drive the step outputs. Rising edges on set bits produce one motor
    /// step each; the caller clears the mask after the pulse width.
    fn set_step_pins(&mut self, mask: u8);
    fn set_direction_pins(&mut self, mask: u8);
    fn set_stepper_enable(&mut self, enabled: bool);
    /// Limit inputs, one bit per axis, set = engaged.
    fn read_limit_pins(&mut self) -> u8;
    fn read_estop(&mut self) -> bool;
    /// Busy-wait used for pulse widths and the reduced homing loop.
    fn delay_us(&mut self, us: u32);
}

/// Simulated backend with a virtual microsecond clock.
///
/// Tracks its own step position per axis from the pulses it receives, so
/// tests can compare what the core thinks happened against what the
/// "motors" actually did. Limit switches engage when an axis position is at
/// or below its configured trigger coordinate, which is what homing toward
/// negative travel expects.
pub struct SimBackend {
    clock_us: u64,
    direction_mask: u8,
    /// Axes whose "motors" respond backwards to the direction pin, the
    /// way a swapped coil pair does on real hardware.
    wiring_invert: u8,
    step_pins: u8,
    enabled: bool,
    position: [i64; N_AXIS],
    pulses: [u64; N_AXIS],
    /// (clock, mask) per rising edge, for pulse-timing assertions.
    pulse_log: Vec<(u64, u8)>,
    switch_at: [Option<i64>; N_AXIS],
    forced_limits: u8,
    estop: bool,
    bounce: Option<BounceSim>,
}

struct BounceSim {
    rng: StdRng,
    window_us: u64,
    until_us: u64,
    last_clean: u8,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    pub fn new() -> Self {
        Self {
            clock_us: 0,
            direction_mask: 0,
            wiring_invert: 0,
            step_pins: 0,
            enabled: false,
            position: [0; N_AXIS],
            pulses: [0; N_AXIS],
            pulse_log: Vec::new(),
            switch_at: [None; N_AXIS],
            forced_limits: 0,
            estop: false,
            bounce: None,
        }
    }

    /// Place a limit switch that engages at or below `trigger` steps.
    pub fn with_switch(mut self, axis: usize, trigger: i64) -> Self {
        self.switch_at[axis] = Some(trigger);
        self
    }

    /// Mark axes whose motors run backwards relative to the direction
    /// pin. Pairs with `axes.invert_mask` in the settings, which is how
    /// the operator corrects for exactly this wiring.
    pub fn with_inverted_wiring(mut self, mask: u8) -> Self {
        self.wiring_invert = mask;
        self
    }

    /// Simulate mechanical switch bounce: reads within `window_us` of a
    /// switch transition flicker randomly. Seeded so tests stay stable.
    pub fn with_bounce(mut self, window_us: u64, seed: u64) -> Self {
        self.bounce = Some(BounceSim {
            rng: StdRng::seed_from_u64(seed),
            window_us,
            until_us: 0,
            last_clean: 0,
        });
        self
    }

    pub fn set_position(&mut self, position: [i64; N_AXIS]) {
        self.position = position;
    }

    pub fn position(&self) -> [i64; N_AXIS] {
        self.position
    }

    pub fn pulse_counts(&self) -> [u64; N_AXIS] {
        self.pulses
    }

    pub fn pulse_log(&self) -> &[(u64, u8)] {
        &self.pulse_log
    }

    pub fn clear_pulse_log(&mut self) {
        self.pulse_log.clear();
    }

    pub fn clock_us(&self) -> u64 {
        self.clock_us
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn step_pins(&self) -> u8 {
        self.step_pins
    }

    /// Direction pin levels as last driven, before wiring polarity.
    pub fn direction_pins(&self) -> u8 {
        self.direction_mask
    }

    /// Assert limit inputs regardless of position (test hook for an
    /// unexpected trigger mid-travel).
    pub fn force_limits(&mut self, mask: u8) {
        self.forced_limits = mask;
    }

    pub fn set_estop(&mut self, engaged: bool) {
        self.estop = engaged;
    }

    fn natural_limits(&self) -> u8 {
        let mut mask = 0u8;
        for axis in 0..N_AXIS {
            if let Some(trigger) = self.switch_at[axis] {
                if self.position[axis] <= trigger {
                    mask |= 1 << axis;
                }
            }
        }
        mask | self.forced_limits
    }
}

impl StepperHal for SimBackend {
    fn set_step_pins(&mut self, mask: u8) {
        let rising = mask & !self.step_pins;
        if rising != 0 {
            self.pulse_log.push((self.clock_us, rising));
            let effective_dir = self.direction_mask ^ self.wiring_invert;
            for axis in 0..N_AXIS {
                if rising & (1 << axis) != 0 {
                    self.pulses[axis] += 1;
                    if effective_dir & (1 << axis) != 0 {
                        self.position[axis] -= 1;
                    } else {
                        self.position[axis] += 1;
                    }
                }
            }
        }
        self.step_pins = mask;
    }

    fn set_direction_pins(&mut self, mask: u8) {
        self.direction_mask = mask;
    }

    fn set_stepper_enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn read_limit_pins(&mut self) -> u8 {
        let clean = self.natural_limits();
        if let Some(bounce) = &mut self.bounce {
            if clean != bounce.last_clean {
                bounce.last_clean = clean;
                bounce.until_us = self.clock_us + bounce.window_us;
            }
            if self.clock_us < bounce.until_us {
                // Flicker a random subset of the axis bits while settling.
                let noise: u8 = bounce.rng.random::<u8>() & crate::config::AXES_MASK;
                return clean ^ noise;
            }
        }
        clean
    }

    fn read_estop(&mut self) -> bool {
        self.estop
    }

    fn delay_us(&mut self, us: u32) {
        self.clock_us += us as u64;
    }
}
