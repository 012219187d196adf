// End-to-end pipeline tests: motion façade -> planner -> stepper pump ->
// simulated hardware, with the limit supervisor watching. Time is paused
// tokio virtual time, so whole cut programs run in milliseconds.

use std::time::Duration;

use hotwire_core::config::{AXES_MASK, N_AXIS, Settings};
use hotwire_core::hal::SimBackend;
use hotwire_core::machine::Machine;
use hotwire_core::system::{Fault, MachineState, exec};

fn sim_with_switches() -> SimBackend {
    let mut sim = SimBackend::new();
    for axis in 0..N_AXIS {
        sim = sim.with_switch(axis, -400);
    }
    sim
}

fn machine() -> Machine<SimBackend> {
    Machine::new(Settings::default(), sim_with_switches())
}

/// Poll `cond` once per virtual millisecond until it holds.
async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..120_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(start_paused = true)]
async fn square_cut_runs_to_completion() {
    let mut m = machine();
    let pump = m.spawn_pump();

    let f = 300.0;
    let motion = m.motion();
    motion.line([10.0, 0.0, 0.0, 10.0], f, false).await.unwrap();
    motion.line([10.0, 10.0, 10.0, 10.0], f, false).await.unwrap();
    motion.line([0.0, 10.0, 10.0, 0.0], f, false).await.unwrap();
    motion.line([0.0, 0.0, 0.0, 0.0], f, false).await.unwrap();
    motion.synchronize().await.unwrap();

    // Both gantries end where they started, having emitted every step.
    assert_eq!(m.with_hal(|hal| hal.position()), [0i64; N_AXIS]);
    assert_eq!(m.with_hal(|hal| hal.pulse_counts()), [1600, 1600, 1600, 1600]);
    assert_eq!(m.status().state, MachineState::Idle);
    assert_eq!(m.status().position_steps, [0; N_AXIS]);
    pump.abort();
}

#[tokio::test(start_paused = true)]
async fn arc_lead_out_lands_on_target() {
    let mut m = machine();
    let pump = m.spawn_pump();

    let motion = m.motion();
    motion
        .arc([5.0, 5.0, 0.0, 0.0], [5.0, 0.0], (0, 1), true, 300.0, false)
        .await
        .unwrap();
    motion.synchronize().await.unwrap();

    assert_eq!(m.with_hal(|hal| hal.position()), [400, 400, 0, 0]);
    pump.abort();
}

#[tokio::test(start_paused = true)]
async fn feed_hold_then_resume_loses_no_steps() {
    let mut m = machine();
    let pump = m.spawn_pump();
    let sys = m.system();

    m.motion().line([50.0, 0.0, 0.0, 0.0], 300.0, false).await.unwrap();
    wait_until(|| m.with_hal(|hal| hal.pulse_counts()[0]) > 100, "cut underway").await;

    m.feed_hold();
    wait_until(|| sys.step_events_remaining() > 0, "hold spindown").await;
    assert_eq!(sys.machine_state(), MachineState::Hold);
    let at_hold = m.with_hal(|hal| hal.pulse_counts()[0]);
    assert!(at_hold < 4000);

    // Held: no further pulses.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(m.with_hal(|hal| hal.pulse_counts()[0]), at_hold);

    m.resume();
    m.motion().synchronize().await.unwrap();
    assert_eq!(m.with_hal(|hal| hal.pulse_counts()[0]), 4000);
    assert_eq!(m.with_hal(|hal| hal.position()[0]), 4000);
    assert_eq!(m.status().position_steps[0], 4000);
    pump.abort();
}

#[tokio::test(start_paused = true)]
async fn limit_trip_kills_the_cut_and_alarms() {
    let mut m = machine();
    let pump = m.spawn_pump();
    let sys = m.system();

    m.motion().line([50.0, 0.0, 0.0, 0.0], 300.0, false).await.unwrap();
    wait_until(|| m.with_hal(|hal| hal.pulse_counts()[0]) > 50, "cut underway").await;

    m.with_hal(|hal| hal.force_limits(1 << 1));
    wait_until(|| sys.exec_is_set(exec::RESET), "supervisor kill").await;

    // Nothing moves once the kill flag stands.
    let frozen = m.with_hal(|hal| hal.pulse_counts());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(m.with_hal(|hal| hal.pulse_counts()), frozen);

    m.service().await;
    assert_eq!(sys.machine_state(), MachineState::Alarm);
    assert_eq!(sys.fault(), Fault::YAxis);

    // Alarm is sticky: motion refused until cleared.
    assert!(m.motion().line([1.0, 0.0, 0.0, 0.0], 300.0, false).await.is_err());
    m.clear_alarm();
    m.motion().line([1.0, 0.0, 0.0, 0.0], 300.0, false).await.unwrap();
    pump.abort();
}

#[tokio::test(start_paused = true)]
async fn estop_faults_as_estop() {
    let mut m = machine();
    let pump = m.spawn_pump();
    let sys = m.system();

    m.motion().line([20.0, 0.0, 0.0, 0.0], 300.0, false).await.unwrap();
    wait_until(|| m.with_hal(|hal| hal.pulse_counts()[0]) > 10, "cut underway").await;

    m.with_hal(|hal| hal.set_estop(true));
    wait_until(|| sys.exec_is_set(exec::RESET), "estop kill").await;
    m.service().await;
    assert_eq!(sys.fault(), Fault::EStop);
    assert_eq!(sys.machine_state(), MachineState::Alarm);
    pump.abort();
}

#[tokio::test(start_paused = true)]
async fn reset_drains_the_queue() {
    let mut m = machine();
    let pump = m.spawn_pump();

    let motion = m.motion();
    for i in 1..=6 {
        motion
            .line([f64::from(i) * 5.0, 0.0, 0.0, 0.0], 300.0, false)
            .await
            .unwrap();
    }
    m.reset().await;
    assert_eq!(m.status().state, MachineState::Idle);

    // A fresh move from wherever the reset left us still works.
    let here = m.status().position_mm;
    let mut target = here;
    target[0] += 1.0;
    m.motion().line(target, 300.0, false).await.unwrap();
    m.motion().synchronize().await.unwrap();
    assert!((m.status().position_mm[0] - (here[0] + 1.0)).abs() < 1e-9);
    pump.abort();
}

#[tokio::test(start_paused = true)]
async fn home_cut_home_is_repeatable() {
    let mut settings = Settings::default();
    settings.homing.dir_mask = AXES_MASK;
    let mut m = Machine::new(settings, sim_with_switches());
    let pump = m.spawn_pump();

    m.home().await.unwrap();
    let zero = m.with_hal(|hal| hal.position());

    let motion = m.motion();
    motion.line([8.0, 3.0, 3.0, 8.0], 400.0, false).await.unwrap();
    motion.line([2.0, 6.0, 6.0, 2.0], 400.0, false).await.unwrap();
    motion.synchronize().await.unwrap();

    m.home().await.unwrap();
    assert_eq!(m.with_hal(|hal| hal.position()), zero);
    assert_eq!(m.status().position_steps, [0; N_AXIS]);
    pump.abort();
}

#[tokio::test(start_paused = true)]
async fn dwell_holds_position_for_its_duration() {
    let mut m = machine();
    let pump = m.spawn_pump();

    m.motion().line([2.0, 0.0, 0.0, 0.0], 300.0, false).await.unwrap();
    m.motion().dwell(0.25).await.unwrap();
    // Dwell only returns once the queue drained and the pause elapsed.
    assert_eq!(m.with_hal(|hal| hal.position()[0]), 160);
    assert_eq!(m.status().state, MachineState::Idle);
    pump.abort();
}
