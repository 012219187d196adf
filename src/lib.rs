//! Motion core for a four-axis hot-wire foam cutter.
//!
//! The wire is carried by two independent XY gantries (X/Y and U/Z), so
//! every move is planned across four axes that must stay coordinated for
//! the cut surface to come out straight. The crate provides the full
//! pipeline: a lookahead velocity planner, a Bresenham step pulse engine
//! with trapezoidal speed profiles, limit/estop supervision with homing,
//! and an async motion façade on top.
//!
//! Hardware access goes through [`hal::StepperHal`]; the bundled
//! [`hal::SimBackend`] runs the whole pipeline against a virtual clock for
//! tests and host-side dry runs.

pub mod config;
pub mod hal;
pub mod limits;
pub mod machine;
pub mod motion;
pub mod planner;
pub mod stepper;
pub mod system;

pub use config::{N_AXIS, Settings, load_settings};
pub use hal::{SimBackend, StepperHal};
pub use machine::{Machine, MachineError};
pub use motion::{MotionController, MotionError};
pub use system::{Fault, MachineState, StatusSnapshot, SystemState};
