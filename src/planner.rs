//! Velocity-planning block buffer.
//!
//! Incoming line segments become `Block`s: fixed-direction step-space
//! segments with a precomputed trapezoidal speed profile. Junction speeds
//! between consecutive blocks are bounded by the centripetal-acceleration
//! limit implied by the turn angle and the configured junction deviation,
//! then a backward/forward pass settles every entry speed so no block ever
//! demands more deceleration than the configured acceleration allows
//! (`v_entry^2 = v_exit^2 + 2*a*d`).
//!
//! The ring is single-producer (motion facade, main context) and
//! single-consumer (stepper tick, interrupt context). Slots are
//! seqlock-guarded so the consumer can copy the head block without ever
//! observing a half-written plan, and the producer can replan queued
//! blocks while the consumer walks the head.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};

use crate::config::{N_AXIS, Settings};

/// Ring capacity in slots. One slot stays empty to disambiguate full from
/// empty, so 17 blocks can be queued.
pub const BLOCK_BUFFER_SIZE: usize = 18;

/// Acceleration management granularity of the pulse engine, shared with
/// the homing loop.
pub const ACCELERATION_TICKS_PER_SECOND: f64 = 50.0;
pub const MICROSECONDS_PER_ACCELERATION_TICK: u32 =
    (1_000_000.0 / ACCELERATION_TICKS_PER_SECOND) as u32;

/// Floor for programmed step rates. Rates below this are indistinguishable
/// from stalled on the original hardware timer.
pub const MINIMUM_STEPS_PER_MINUTE: u32 = 800;

/// Speed carried through a completely stopped junction, in mm/min.
pub const MINIMUM_PLANNER_SPEED: f64 = 0.0;

/// One planned fixed-direction segment in step space.
///
/// Immutable once the stepper has copied it out of the ring, except for the
/// remaining-step rescale done by `cycle_reinitialize` while the stepper is
/// holding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Block {
    /// Step count along each axis, always non-negative.
    pub steps: [u32; N_AXIS],
    /// Max across axes; the Bresenham rasterizer emits this many events.
    pub step_event_count: u32,
    /// One bit per axis, set = negative travel.
    pub direction_bits: u8,

    /// mm/min as requested (never exceeded, may never be reached).
    pub nominal_speed: f64,
    /// mm/min at the junction with the previous block.
    pub entry_speed: f64,
    /// Junction-limited ceiling for `entry_speed`.
    pub max_entry_speed: f64,
    /// Total travel in mm.
    pub millimeters: f64,
    pub recalculate: bool,
    /// Set when nominal speed is reachable from a standstill within this
    /// block; such blocks never constrain their neighbours' entry speeds.
    pub nominal_length: bool,

    /// Step rates in steps/min for the trapezoid generator.
    pub initial_rate: u32,
    pub final_rate: u32,
    pub nominal_rate: u32,
    /// steps/min added or removed per acceleration tick.
    pub rate_delta: u32,
    /// Step-event index where acceleration ends.
    pub accelerate_until: u32,
    /// Step-event index where deceleration begins.
    pub decelerate_after: u32,
}

/// Seqlock-guarded slot. Single writer (producer side); the consumer
/// retries its copy until it reads an even, unchanged sequence.
struct Slot {
    seq: AtomicUsize,
    block: UnsafeCell<Block>,
}

impl Slot {
    fn new() -> Self {
        Self {
            seq: AtomicUsize::new(0),
            block: UnsafeCell::new(Block::default()),
        }
    }

    fn write(&self, f: impl FnOnce(&mut Block)) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        // Safety: single producer; readers detect the odd sequence and retry.
        unsafe { f(&mut *self.block.get()) };
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn read(&self) -> Block {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // Safety: torn copies are detected by the sequence recheck.
            let copy = unsafe { *self.block.get() };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return copy;
            }
        }
    }
}

/// Fixed-capacity circular queue of block slots.
///
/// Only the motion facade moves `tail` (enqueue), only the stepper tick
/// moves `head` (retire). `head_started` marks that the consumer has begun
/// the head block; the planner then treats it as immutable.
pub struct BlockRing {
    slots: [Slot; BLOCK_BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
    head_started: AtomicBool,
}

// Safety: slot access is mediated by the seqlock plus the single-writer
// head/tail discipline documented above.
unsafe impl Sync for BlockRing {}
unsafe impl Send for BlockRing {}

impl Default for BlockRing {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockRing {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::new()),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            head_started: AtomicBool::new(false),
        }
    }

    pub fn next_index(index: usize) -> usize {
        (index + 1) % BLOCK_BUFFER_SIZE
    }

    pub fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    pub fn is_full(&self) -> bool {
        Self::next_index(self.tail()) == self.head()
    }

    pub fn len(&self) -> usize {
        (self.tail() + BLOCK_BUFFER_SIZE - self.head()) % BLOCK_BUFFER_SIZE
    }

    /// Producer: publish a block. The slot write completes before the tail
    /// store, so the consumer can never dequeue a half-written block.
    pub(crate) fn produce(&self, block: Block) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = Self::next_index(tail);
        if next == self.head() {
            return false;
        }
        self.slots[tail].write(|slot| *slot = block);
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Producer: replan a queued slot in place.
    pub(crate) fn rewrite(&self, index: usize, f: impl FnOnce(&mut Block)) {
        self.slots[index].write(f);
    }

    /// Copy of the block at `index`. Valid for queued indices only.
    pub fn block_at(&self, index: usize) -> Block {
        self.slots[index].read()
    }

    /// Consumer: copy of the head block, if any.
    pub fn current(&self) -> Option<Block> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail() {
            return None;
        }
        Some(self.slots[head].read())
    }

    /// Consumer: the head block is now executing; the planner must leave
    /// it alone.
    pub fn mark_head_started(&self) {
        self.head_started.store(true, Ordering::Release);
    }

    pub fn head_started(&self) -> bool {
        self.head_started.load(Ordering::Acquire)
    }

    pub(crate) fn clear_head_started(&self) {
        self.head_started.store(false, Ordering::Release);
    }

    /// Consumer: retire the head block.
    pub fn discard_current(&self) {
        let head = self.head.load(Ordering::Relaxed);
        debug_assert!(head != self.tail(), "discard on empty ring");
        self.head_started.store(false, Ordering::Relaxed);
        self.head.store(Self::next_index(head), Ordering::Release);
    }

    /// Drop all queued blocks. Only legal with the consumer quiescent.
    pub fn reset(&self) {
        self.head_started.store(false, Ordering::Relaxed);
        self.head.store(self.tail.load(Ordering::Acquire), Ordering::Release);
    }

    /// Queued indices from head to tail in execution order.
    pub fn queued_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut index = self.head();
        let tail = self.tail();
        while index != tail {
            out.push(index);
            index = Self::next_index(index);
        }
        out
    }
}

/// A line segment ready for planning, already converted to step space by
/// the motion facade.
#[derive(Debug, Clone, Copy)]
pub struct LineRequest {
    pub target_steps: [i32; N_AXIS],
    pub steps: [u32; N_AXIS],
    pub direction_bits: u8,
    pub millimeters: f64,
    /// mm/min
    pub nominal_speed: f64,
    pub unit_vec: [f64; N_AXIS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// Block queued and the plan recalculated.
    Planned,
    /// Degenerate request (no step events); nothing queued.
    Dropped,
    /// Ring full; the caller must poll and retry, never drop motion.
    Full,
}

/// Lookahead planner: owns the producer end of the ring plus the planned
/// position and the previous-segment state junctions are computed against.
pub struct Planner {
    ring: std::sync::Arc<BlockRing>,
    /// Planned position in steps; trails the requested targets, not the
    /// executed ones.
    position: [i32; N_AXIS],
    previous_unit_vec: [f64; N_AXIS],
    /// mm/min; zero marks a chain starting from rest.
    previous_nominal_speed: f64,
}

impl Planner {
    pub fn new(ring: std::sync::Arc<BlockRing>) -> Self {
        Self {
            ring,
            position: [0; N_AXIS],
            previous_unit_vec: [0.0; N_AXIS],
            previous_nominal_speed: 0.0,
        }
    }

    pub fn position_steps(&self) -> [i32; N_AXIS] {
        self.position
    }

    /// Resync the planned position, used after homing redefines zero.
    pub fn set_position_steps(&mut self, steps: [i32; N_AXIS]) {
        self.position = steps;
        self.previous_unit_vec = [0.0; N_AXIS];
        self.previous_nominal_speed = 0.0;
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Drop every queued block and restart the chain from `position`.
    /// Only legal with the stepper quiescent.
    pub fn reset(&mut self, position: [i32; N_AXIS]) {
        self.ring.reset();
        self.set_position_steps(position);
    }

    /// Queue one line segment and settle the lookahead plan.
    pub fn enqueue(&mut self, request: &LineRequest, settings: &Settings) -> EnqueueStatus {
        let step_event_count = request.steps.iter().copied().max().unwrap_or(0);
        if step_event_count == 0 {
            return EnqueueStatus::Dropped;
        }
        if self.ring.is_full() {
            return EnqueueStatus::Full;
        }

        let acceleration = settings.stepper.acceleration;
        let inverse_millimeters = 1.0 / request.millimeters;
        let inverse_minute = request.nominal_speed * inverse_millimeters;

        let mut block = Block {
            steps: request.steps,
            step_event_count,
            direction_bits: request.direction_bits,
            nominal_speed: request.nominal_speed,
            millimeters: request.millimeters,
            nominal_rate: ((step_event_count as f64 * inverse_minute).ceil() as u32)
                .max(MINIMUM_STEPS_PER_MINUTE),
            rate_delta: ((step_event_count as f64 * inverse_millimeters * acceleration
                / (60.0 * ACCELERATION_TICKS_PER_SECOND))
                .ceil() as u32)
                .max(1),
            recalculate: true,
            ..Block::default()
        };

        // A drained ring means the chain restarts from rest; the previous
        // unit vector no longer describes a junction the wire will take at
        // speed.
        if self.ring.is_empty() {
            self.previous_nominal_speed = 0.0;
        }

        // Junction speed limit against the previous segment's direction.
        let mut vmax_junction = MINIMUM_PLANNER_SPEED;
        if self.previous_nominal_speed > 0.0 {
            let mut dot = 0.0;
            for axis in 0..N_AXIS {
                dot += self.previous_unit_vec[axis] * request.unit_vec[axis];
            }
            let cos_theta = -dot;
            if cos_theta < 0.95 {
                vmax_junction = self.previous_nominal_speed.min(block.nominal_speed);
                if cos_theta > -0.95 {
                    // Nonzero angle: centripetal bound from the junction
                    // deviation circle.
                    let sin_theta_d2 = (0.5 * (1.0 - cos_theta)).sqrt();
                    vmax_junction = vmax_junction.min(
                        (acceleration * settings.stepper.junction_deviation * sin_theta_d2
                            / (1.0 - sin_theta_d2))
                            .sqrt(),
                    );
                }
            }
        }
        // A started head block keeps its programmed trapezoid, so the
        // junction into its successor is capped at the exit speed already
        // committed there.
        if !self.ring.is_empty() && self.ring.head_started() {
            let prev_index =
                (self.ring.tail() + BLOCK_BUFFER_SIZE - 1) % BLOCK_BUFFER_SIZE;
            if prev_index == self.ring.head() {
                let prev = self.ring.block_at(prev_index);
                let committed_exit =
                    prev.nominal_speed * prev.final_rate as f64 / prev.nominal_rate as f64;
                vmax_junction = vmax_junction.min(committed_exit);
            }
        }
        block.max_entry_speed = vmax_junction;

        let v_allowable =
            max_allowable_speed(-acceleration, MINIMUM_PLANNER_SPEED, block.millimeters);
        block.entry_speed = vmax_junction.min(v_allowable);
        block.nominal_length = block.nominal_speed <= v_allowable;

        calculate_trapezoid(&mut block, MINIMUM_PLANNER_SPEED);

        self.previous_unit_vec = request.unit_vec;
        self.previous_nominal_speed = block.nominal_speed;
        self.position = request.target_steps;

        let produced = self.ring.produce(block);
        debug_assert!(produced, "ring filled between check and produce");
        self.recalculate(acceleration);
        EnqueueStatus::Planned
    }

    /// Rescale the partially executed head block after a feed hold: the
    /// consumed portion is gone, the remainder replans from a standstill.
    /// Only legal with the stepper holding (consumer quiescent).
    pub fn cycle_reinitialize(&mut self, step_events_remaining: u32, settings: &Settings) {
        if self.ring.is_empty() || step_events_remaining == 0 {
            return;
        }
        self.ring.clear_head_started();
        let head = self.ring.head();
        self.ring.rewrite(head, |block| {
            block.millimeters *= step_events_remaining as f64 / block.step_event_count as f64;
            block.step_event_count = step_events_remaining;
            block.entry_speed = 0.0;
            block.max_entry_speed = 0.0;
            block.nominal_length = false;
            block.recalculate = true;
        });
        self.recalculate(settings.stepper.acceleration);
    }

    /// Backward/forward settle of entry speeds plus trapezoid recompute
    /// over every queued-but-not-executing block.
    fn recalculate(&mut self, acceleration: f64) {
        let mut indices = self.ring.queued_indices();
        if self.ring.head_started() && !indices.is_empty() {
            // The executing block is immutable, and the junction into its
            // successor is already committed in its programmed final rate.
            indices.remove(0);
        }
        let n = indices.len();
        if n == 0 {
            return;
        }
        let mut blocks: Vec<Block> = indices.iter().map(|&i| self.ring.block_at(i)).collect();

        // Backward pass: raise entry speeds toward what deceleration into
        // the successor permits. The oldest block's entry is a boundary
        // condition and is never rewritten.
        for i in (1..n.saturating_sub(1)).rev() {
            let next_entry = blocks[i + 1].entry_speed;
            let current = &mut blocks[i];
            if current.entry_speed != current.max_entry_speed {
                current.entry_speed = if !current.nominal_length
                    && current.max_entry_speed > next_entry
                {
                    current
                        .max_entry_speed
                        .min(max_allowable_speed(-acceleration, next_entry, current.millimeters))
                } else {
                    current.max_entry_speed
                };
                current.recalculate = true;
            }
        }

        // Forward pass: no block may enter faster than its predecessor can
        // accelerate to over its own length.
        for i in 1..n {
            let prev = blocks[i - 1];
            if !prev.nominal_length && prev.entry_speed < blocks[i].entry_speed {
                let entry = blocks[i].entry_speed.min(max_allowable_speed(
                    -acceleration,
                    prev.entry_speed,
                    prev.millimeters,
                ));
                if entry != blocks[i].entry_speed {
                    blocks[i].entry_speed = entry;
                    blocks[i].recalculate = true;
                }
            }
        }

        // Trapezoid recompute for every block whose junction moved.
        for i in 0..n {
            let exit_speed = if i + 1 < n {
                blocks[i + 1].entry_speed
            } else {
                MINIMUM_PLANNER_SPEED
            };
            if blocks[i].recalculate || (i + 1 < n && blocks[i + 1].recalculate) {
                calculate_trapezoid(&mut blocks[i], exit_speed);
            }
            blocks[i].recalculate = false;
        }

        for (slot, block) in indices.iter().zip(blocks.iter()) {
            self.ring.rewrite(*slot, |b| *b = *block);
        }
    }
}

/// Highest speed reachable when decelerating at `acceleration` (negative)
/// down to `target_velocity` over `distance` mm.
pub fn max_allowable_speed(acceleration: f64, target_velocity: f64, distance: f64) -> f64 {
    (target_velocity * target_velocity - 2.0 * acceleration * distance).sqrt()
}

/// Step events needed to change between two step rates at `acceleration`
/// (steps/min^2).
fn estimate_acceleration_distance(initial_rate: f64, target_rate: f64, acceleration: f64) -> f64 {
    (target_rate * target_rate - initial_rate * initial_rate) / (2.0 * acceleration)
}

/// Acceleration-phase length when accel and decel ramps meet below nominal
/// speed (triangle profile).
fn intersection_distance(
    initial_rate: f64,
    final_rate: f64,
    acceleration: f64,
    distance: f64,
) -> f64 {
    (2.0 * acceleration * distance - initial_rate * initial_rate + final_rate * final_rate)
        / (4.0 * acceleration)
}

/// Fill in the trapezoid generator parameters for the given exit speed.
fn calculate_trapezoid(block: &mut Block, exit_speed: f64) {
    let entry_factor = (block.entry_speed / block.nominal_speed).min(1.0);
    let exit_factor = (exit_speed / block.nominal_speed).min(1.0);
    block.initial_rate = ((block.nominal_rate as f64 * entry_factor).ceil() as u32)
        .max(MINIMUM_STEPS_PER_MINUTE)
        .min(block.nominal_rate);
    block.final_rate = ((block.nominal_rate as f64 * exit_factor).ceil() as u32)
        .max(MINIMUM_STEPS_PER_MINUTE)
        .min(block.nominal_rate);

    let acceleration_per_minute =
        block.rate_delta as f64 * ACCELERATION_TICKS_PER_SECOND * 60.0;
    let mut accelerate_steps = estimate_acceleration_distance(
        block.initial_rate as f64,
        block.nominal_rate as f64,
        acceleration_per_minute,
    )
    .ceil()
    .max(0.0);
    let decelerate_steps = estimate_acceleration_distance(
        block.nominal_rate as f64,
        block.final_rate as f64,
        -acceleration_per_minute,
    )
    .floor()
    .max(0.0);

    let events = block.step_event_count as f64;
    let mut plateau_steps = events - accelerate_steps - decelerate_steps;
    if plateau_steps < 0.0 {
        // Triangle profile: ramps meet before nominal speed is reached.
        accelerate_steps = intersection_distance(
            block.initial_rate as f64,
            block.final_rate as f64,
            acceleration_per_minute,
            events,
        )
        .ceil()
        .clamp(0.0, events);
        plateau_steps = 0.0;
    }
    block.accelerate_until = accelerate_steps as u32;
    block.decelerate_after = (accelerate_steps + plateau_steps) as u32;
}
