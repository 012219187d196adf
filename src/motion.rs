//! Motion control façade.
//!
//! Callers hand this layer moves in millimetres; it converts them to step
//! targets, feeds the lookahead planner, and provides the blocking-style
//! primitives a job runner needs: arcs flattened to line segments, dwells,
//! and queue synchronization. All waiting is done by polling with short
//! async sleeps so a reset is observed within one poll period.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{N_AXIS, Settings};
use crate::planner::{BlockRing, EnqueueStatus, LineRequest, Planner};
use crate::system::{MachineState, SystemState, exec};

/// Poll period while waiting on the block queue or spindown.
const WAIT_POLL: Duration = Duration::from_millis(1);
/// Dwells sleep in slices so a reset cuts them short.
const DWELL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MotionError {
    #[error("motion aborted by reset")]
    Aborted,
    #[error("machine is in alarm state; clear the alarm and home first")]
    Alarm,
}

/// Convert a millimetre-space target into a planner line request. Returns
/// `None` when the move rounds to zero steps on every axis.
///
/// `invert_feed_rate` keeps the classic meaning: the feed value is
/// 1/minutes for the whole move instead of mm/min.
pub fn build_line_request(
    position_steps: [i32; N_AXIS],
    target_mm: [f64; N_AXIS],
    feed_rate: f64,
    invert_feed_rate: bool,
    settings: &Settings,
) -> Option<LineRequest> {
    let mut target_steps = [0i32; N_AXIS];
    let mut steps = [0u32; N_AXIS];
    let mut direction_bits = 0u8;
    let mut delta_mm = [0.0f64; N_AXIS];
    let mut millimeters = 0.0f64;
    for axis in 0..N_AXIS {
        target_steps[axis] = (target_mm[axis] * settings.axes.steps_per_mm[axis]).round() as i32;
        let delta = i64::from(target_steps[axis]) - i64::from(position_steps[axis]);
        steps[axis] = delta.unsigned_abs() as u32;
        if delta < 0 {
            direction_bits |= 1 << axis;
        }
        delta_mm[axis] = delta as f64 / settings.axes.steps_per_mm[axis];
        millimeters += delta_mm[axis] * delta_mm[axis];
    }
    if steps.iter().all(|&s| s == 0) {
        return None;
    }
    let millimeters = millimeters.sqrt();
    let mut unit_vec = [0.0f64; N_AXIS];
    for axis in 0..N_AXIS {
        unit_vec[axis] = delta_mm[axis] / millimeters;
    }
    let nominal_speed = if invert_feed_rate {
        millimeters * feed_rate
    } else {
        feed_rate
    };
    Some(LineRequest {
        target_steps,
        steps,
        direction_bits,
        millimeters,
        nominal_speed,
        unit_vec,
    })
}

/// Owns the planner and turns millimetre-space commands into queued
/// blocks. One instance per machine; commands are issued sequentially.
pub struct MotionController {
    planner: Planner,
    ring: Arc<BlockRing>,
    sys: Arc<SystemState>,
    settings: Arc<Settings>,
}

impl MotionController {
    pub fn new(ring: Arc<BlockRing>, sys: Arc<SystemState>, settings: Arc<Settings>) -> Self {
        Self {
            planner: Planner::new(ring.clone()),
            ring,
            sys,
            settings,
        }
    }

    pub fn planner_mut(&mut self) -> &mut Planner {
        &mut self.planner
    }

    /// True while the block queue has no room for another segment.
    pub fn is_full(&self) -> bool {
        self.planner.is_full()
    }

    /// Current program position in millimetres, derived from the planner's
    /// step tally so it never drifts from what was actually queued.
    pub fn position_mm(&self) -> [f64; N_AXIS] {
        let steps = self.planner.position_steps();
        let mut mm = [0.0; N_AXIS];
        for axis in 0..N_AXIS {
            mm[axis] = f64::from(steps[axis]) / self.settings.axes.steps_per_mm[axis];
        }
        mm
    }

    fn check_operational(&self) -> Result<(), MotionError> {
        if self.sys.exec_is_set(exec::RESET) {
            return Err(MotionError::Aborted);
        }
        if self.sys.machine_state() == MachineState::Alarm || self.sys.exec_is_set(exec::ALARM) {
            return Err(MotionError::Alarm);
        }
        Ok(())
    }

    /// Queue a straight move to `target_mm`. Blocks (politely) while the
    /// ring is full; errors out rather than queueing into a dead machine.
    pub async fn line(
        &mut self,
        target_mm: [f64; N_AXIS],
        feed_rate: f64,
        invert_feed_rate: bool,
    ) -> Result<(), MotionError> {
        let Some(request) =
            build_line_request(self.planner.position_steps(), target_mm, feed_rate,
                invert_feed_rate, &self.settings)
        else {
            return Ok(());
        };
        loop {
            self.check_operational()?;
            match self.planner.enqueue(&request, &self.settings) {
                EnqueueStatus::Planned => break,
                EnqueueStatus::Dropped => return Ok(()),
                EnqueueStatus::Full => tokio::time::sleep(WAIT_POLL).await,
            }
        }
        if self.sys.auto_start() {
            self.sys.set_exec(exec::CYCLE_START);
        } else if self.sys.machine_state() == MachineState::Idle {
            self.sys.set_machine_state(MachineState::Queued);
        }
        Ok(())
    }

    /// Trace an arc in the plane spanned by `plane` while the other two
    /// axes interpolate linearly, flattened to line segments no longer
    /// than the configured chord length.
    ///
    /// `offset` points from the current position to the arc centre, in
    /// plane coordinates. Segment endpoints are placed with a small-angle
    /// rotation that is re-trued with exact trig every few segments, so
    /// approximation error does not accumulate.
    pub async fn arc(
        &mut self,
        target_mm: [f64; N_AXIS],
        offset: [f64; 2],
        plane: (usize, usize),
        clockwise: bool,
        feed_rate: f64,
        invert_feed_rate: bool,
    ) -> Result<(), MotionError> {
        let (axis_0, axis_1) = plane;
        let position = self.position_mm();
        let radius = (offset[0] * offset[0] + offset[1] * offset[1]).sqrt();
        let center_0 = position[axis_0] + offset[0];
        let center_1 = position[axis_1] + offset[1];

        let mut r_0 = -offset[0];
        let mut r_1 = -offset[1];
        let rt_0 = target_mm[axis_0] - center_0;
        let rt_1 = target_mm[axis_1] - center_1;

        let mut angular_travel = (r_0 * rt_1 - r_1 * rt_0).atan2(r_0 * rt_0 + r_1 * rt_1);
        if clockwise {
            if angular_travel >= 0.0 {
                angular_travel -= TAU;
            }
        } else if angular_travel <= 0.0 {
            angular_travel += TAU;
        }

        // Off-plane axes ride along linearly.
        let mut linear = [0.0f64; N_AXIS];
        let mut linear_sq = 0.0f64;
        for axis in 0..N_AXIS {
            if axis != axis_0 && axis != axis_1 {
                linear[axis] = target_mm[axis] - position[axis];
                linear_sq += linear[axis] * linear[axis];
            }
        }

        let arc_len = angular_travel.abs() * radius;
        let millimeters = (arc_len * arc_len + linear_sq).sqrt();
        if millimeters == 0.0 {
            return Ok(());
        }
        let segments = (millimeters / self.settings.feed.mm_per_arc_segment).floor() as u32;
        if segments == 0 {
            return self.line(target_mm, feed_rate, invert_feed_rate).await;
        }

        let theta_per_segment = angular_travel / f64::from(segments);
        // Second-order small-angle rotation, cheap enough to run per
        // segment at planner level.
        let cos_t = 1.0 - 0.5 * theta_per_segment * theta_per_segment;
        let sin_t = theta_per_segment * (cos_t + 4.0) / 6.0;

        let mut arc_target = position;
        let mut count = 0u8;
        for i in 1..segments {
            if count < self.settings.feed.n_arc_correction {
                let r_new = r_0 * cos_t - r_1 * sin_t;
                r_1 = r_0 * sin_t + r_1 * cos_t;
                r_0 = r_new;
                count += 1;
            } else {
                // Re-true against the accumulated exact angle.
                let theta = theta_per_segment * f64::from(i);
                let (sin_i, cos_i) = theta.sin_cos();
                r_0 = -offset[0] * cos_i + offset[1] * sin_i;
                r_1 = -offset[0] * sin_i - offset[1] * cos_i;
                count = 0;
            }
            arc_target[axis_0] = center_0 + r_0;
            arc_target[axis_1] = center_1 + r_1;
            for axis in 0..N_AXIS {
                if axis != axis_0 && axis != axis_1 {
                    arc_target[axis] =
                        position[axis] + linear[axis] * f64::from(i) / f64::from(segments);
                }
            }
            self.line(arc_target, feed_rate, invert_feed_rate).await?;
        }
        // Land exactly on the programmed endpoint.
        self.line(target_mm, feed_rate, invert_feed_rate).await
    }

    /// Wait until every queued block has finished executing.
    pub async fn synchronize(&self) -> Result<(), MotionError> {
        loop {
            self.check_operational()?;
            let busy = !self.ring.is_empty()
                || matches!(
                    self.sys.machine_state(),
                    MachineState::Cycle | MachineState::Hold
                );
            if !busy {
                return Ok(());
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Drain the queue, then hold position for `seconds`.
    pub async fn dwell(&self, seconds: f64) -> Result<(), MotionError> {
        self.synchronize().await?;
        let mut left = Duration::from_secs_f64(seconds.max(0.0));
        while !left.is_zero() {
            self.check_operational()?;
            let slice = left.min(DWELL_SLICE);
            tokio::time::sleep(slice).await;
            left -= slice;
        }
        self.check_operational()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::BLOCK_BUFFER_SIZE;

    fn controller() -> MotionController {
        MotionController::new(
            Arc::new(BlockRing::new()),
            Arc::new(SystemState::new()),
            Arc::new(Settings::default()),
        )
    }

    #[test]
    fn line_request_conversion() {
        let settings = Settings::default(); // 80 steps/mm everywhere
        let request =
            build_line_request([0; N_AXIS], [1.0, -2.0, 0.0, 0.5], 300.0, false, &settings)
                .expect("non-degenerate");
        assert_eq!(request.target_steps, [80, -160, 0, 40]);
        assert_eq!(request.steps, [80, 160, 0, 40]);
        assert_eq!(request.direction_bits, 0b0010);
        assert!((request.millimeters - (1.0f64 + 4.0 + 0.25).sqrt()).abs() < 1e-12);
        assert!((request.unit_vec[1] + 2.0 / request.millimeters).abs() < 1e-12);
        assert_eq!(request.nominal_speed, 300.0);
    }

    #[test]
    fn inverse_feed_scales_with_distance() {
        let settings = Settings::default();
        // 2.0 means finish in half a minute regardless of length.
        let request = build_line_request([0; N_AXIS], [3.0, 4.0, 0.0, 0.0], 2.0, true, &settings)
            .expect("non-degenerate");
        assert!((request.nominal_speed - 10.0).abs() < 1e-12);
    }

    #[test]
    fn sub_step_move_is_none() {
        let settings = Settings::default();
        assert!(build_line_request([0; N_AXIS], [0.001; N_AXIS], 300.0, false, &settings).is_none());
    }

    #[tokio::test]
    async fn queued_lines_mark_machine_queued() {
        let mut mc = controller();
        mc.sys.set_auto_start(false);
        mc.sys.set_machine_state(MachineState::Idle);
        mc.line([1.0, 0.0, 0.0, 0.0], 300.0, false).await.unwrap();
        assert_eq!(mc.sys.machine_state(), MachineState::Queued);
        assert_eq!(mc.ring.len(), 1);
    }

    #[tokio::test]
    async fn auto_start_requests_cycle() {
        let mut mc = controller();
        mc.line([1.0, 0.0, 0.0, 0.0], 300.0, false).await.unwrap();
        assert!(mc.sys.exec_is_set(exec::CYCLE_START));
    }

    #[tokio::test]
    async fn line_refused_in_alarm() {
        let mut mc = controller();
        mc.sys.set_machine_state(MachineState::Alarm);
        assert_eq!(
            mc.line([1.0, 0.0, 0.0, 0.0], 300.0, false).await,
            Err(MotionError::Alarm)
        );
        assert!(mc.ring.is_empty());
    }

    #[tokio::test]
    async fn arc_endpoints_stay_on_circle() {
        let mut mc = controller();
        // Quarter circle in XY, radius 1 mm, centre at (1, 0), swept the
        // short (clockwise) way; few enough segments to fit the ring
        // without a consumer.
        mc.arc(
            [1.0, 1.0, 0.0, 0.0],
            [1.0, 0.0],
            (0, 1),
            true,
            300.0,
            false,
        )
        .await
        .expect("arc queues");
        let n = mc.ring.len();
        assert!(n > 2 && n < BLOCK_BUFFER_SIZE);

        // Walk the queued blocks and check each endpoint's radius about
        // the centre; step quantization allows a couple steps of slack.
        let mut pos = [0.0f64, 0.0];
        for index in mc.ring.queued_indices() {
            let block = mc.ring.block_at(index);
            for (slot, axis) in [(0usize, 0usize), (1, 1)] {
                let sign = if block.direction_bits & (1 << axis) != 0 {
                    -1.0
                } else {
                    1.0
                };
                pos[slot] += sign * f64::from(block.steps[axis]) / 80.0;
            }
            let r = ((pos[0] - 1.0).powi(2) + pos[1].powi(2)).sqrt();
            assert!((r - 1.0).abs() < 0.03, "radius drifted to {}", r);
        }
        // Endpoint lands exactly on the programmed target.
        assert_eq!(mc.planner.position_steps(), [80, 80, 0, 0]);
    }

    #[tokio::test]
    async fn full_arc_with_linear_ride_along() {
        // Coarser chords so the half circle fits the ring without a
        // consumer draining it.
        let mut settings = Settings::default();
        settings.feed.mm_per_arc_segment = 0.3;
        let mut mc = MotionController::new(
            Arc::new(BlockRing::new()),
            Arc::new(SystemState::new()),
            Arc::new(settings),
        );
        // Half circle with Z feeding linearly alongside.
        mc.arc(
            [2.0, 0.0, 0.4, 0.0],
            [1.0, 0.0],
            (0, 1),
            false,
            300.0,
            false,
        )
        .await
        .expect("arc queues");
        assert_eq!(mc.planner.position_steps(), [160, 0, 32, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn dwell_observes_reset() {
        let mc = controller();
        mc.sys.set_exec(exec::RESET);
        assert_eq!(mc.dwell(1.0).await, Err(MotionError::Aborted));
    }

    #[tokio::test]
    async fn synchronize_returns_when_queue_empty_and_idle() {
        let mc = controller();
        mc.synchronize().await.expect("idle machine is in sync");
    }
}
