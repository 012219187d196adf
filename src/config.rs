//! Machine calibration settings.
//!
//! The motion core consumes these values per operation (block enqueue,
//! homing cycle) and never caches them across operations, so a settings
//! change applies to the next planned block rather than in-flight motion.
//!
//! ```toml
//! [axes]
//! steps_per_mm = [80.0, 80.0, 80.0, 80.0]
//!
//! [stepper]
//! acceleration = 90000.0     # mm/min^2
//! junction_deviation = 0.05  # mm
//!
//! [homing]
//! groups = ["xyuz"]
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Axis indexing. The wire runs X/Y on one tower and U/Z on the other;
/// all step/direction/limit masks use one bit per axis in this order.
pub const N_AXIS: usize = 4;
pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;
pub const U_AXIS: usize = 3;

pub const AXIS_NAMES: [char; N_AXIS] = ['x', 'y', 'z', 'u'];

/// Mask with every axis bit set.
pub const AXES_MASK: u8 = 0x0F;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Read-only calibration snapshot consumed by the planner, the stepper
/// engine and the homing routine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub axes: AxisSettings,
    #[serde(default)]
    pub stepper: StepperSettings,
    #[serde(default)]
    pub feed: FeedSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub homing: HomingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxisSettings {
    #[serde(default = "default_steps_per_mm")]
    pub steps_per_mm: [f64; N_AXIS],
    /// Direction polarity mask, one bit per axis. A set bit flips the
    /// physical direction signal for that axis.
    #[serde(default)]
    pub invert_mask: u8,
}

impl Default for AxisSettings {
    fn default() -> Self {
        Self {
            steps_per_mm: default_steps_per_mm(),
            invert_mask: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepperSettings {
    #[serde(default = "default_pulse_microseconds")]
    pub pulse_microseconds: u32,
    /// Global acceleration in mm/min^2.
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    /// Junction deviation in mm, bounds path deviation at direction changes.
    #[serde(default = "default_junction_deviation")]
    pub junction_deviation: f64,
    /// Milliseconds the drivers stay energised after motion stops.
    /// 255 keeps them energised forever.
    #[serde(default = "default_idle_lock_time")]
    pub idle_lock_time: u8,
}

impl Default for StepperSettings {
    fn default() -> Self {
        Self {
            pulse_microseconds: default_pulse_microseconds(),
            acceleration: default_acceleration(),
            junction_deviation: default_junction_deviation(),
            idle_lock_time: default_idle_lock_time(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedSettings {
    /// mm/min
    #[serde(default = "default_feed_rate")]
    pub default_feed_rate: f64,
    /// mm/min
    #[serde(default = "default_seek_rate")]
    pub default_seek_rate: f64,
    /// Maximum chord length when subdividing arcs.
    #[serde(default = "default_mm_per_arc_segment")]
    pub mm_per_arc_segment: f64,
    /// Exact-trig correction interval during arc subdivision.
    #[serde(default = "default_n_arc_correction")]
    pub n_arc_correction: u8,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            default_feed_rate: default_feed_rate(),
            default_seek_rate: default_seek_rate(),
            mm_per_arc_segment: default_mm_per_arc_segment(),
            n_arc_correction: default_n_arc_correction(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitSettings {
    #[serde(default = "default_true")]
    pub hard_enable: bool,
    /// When set, a limit edge defers the system kill to a polled sampler
    /// that must see a stable pin state before committing.
    #[serde(default = "default_true")]
    pub soft_debounce: bool,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            hard_enable: default_true(),
            soft_debounce: default_true(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HomingSettings {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Homing direction mask, one bit per axis. A set bit homes that axis
    /// toward the negative end of travel.
    #[serde(default = "default_homing_dir_mask")]
    pub dir_mask: u8,
    /// Precision locate rate in mm/min.
    #[serde(default = "default_homing_feed_rate")]
    pub feed_rate: f64,
    /// Initial search rate in mm/min.
    #[serde(default = "default_homing_seek_rate")]
    pub seek_rate: f64,
    /// Switch settle time between homing phases, in ms.
    #[serde(default = "default_homing_debounce_delay")]
    pub debounce_delay_ms: u16,
    /// Retraction from the released switch that defines machine zero, in mm.
    #[serde(default = "default_homing_pulloff")]
    pub pulloff: [f64; N_AXIS],
    /// Release/re-approach repetitions during the locate phase.
    #[serde(default = "default_locate_cycles")]
    pub locate_cycles: u8,
    /// Axis groups homed sequentially, each a string of axis letters.
    /// Grouping and order are configuration, not behavior; the foam cutter
    /// runs all four axes in one group.
    #[serde(default = "default_homing_groups")]
    pub groups: Vec<String>,
}

impl Default for HomingSettings {
    fn default() -> Self {
        Self {
            enable: default_true(),
            dir_mask: default_homing_dir_mask(),
            feed_rate: default_homing_feed_rate(),
            seek_rate: default_homing_seek_rate(),
            debounce_delay_ms: default_homing_debounce_delay(),
            pulloff: default_homing_pulloff(),
            locate_cycles: default_locate_cycles(),
            groups: default_homing_groups(),
        }
    }
}

impl HomingSettings {
    /// Axis bit masks for the configured groups, in homing order.
    /// Unknown axis letters are rejected by `Settings::validate`.
    pub fn group_masks(&self) -> Vec<u8> {
        self.groups
            .iter()
            .map(|group| {
                group
                    .chars()
                    .filter_map(|c| {
                        AXIS_NAMES.iter().position(|&n| n == c.to_ascii_lowercase())
                    })
                    .fold(0u8, |mask, axis| mask | (1 << axis))
            })
            .collect()
    }
}

impl Settings {
    /// Reject out-of-range values. Callers keep the prior snapshot when
    /// this fails; an invalid value never reaches the motion core.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (axis, &spm) in self.axes.steps_per_mm.iter().enumerate() {
            if !(spm > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "steps_per_mm[{}] must be > 0, got {}",
                    AXIS_NAMES[axis], spm
                )));
            }
        }
        if self.stepper.pulse_microseconds == 0 {
            return Err(ConfigError::Invalid(
                "pulse_microseconds must be > 0".into(),
            ));
        }
        if !(self.stepper.acceleration > 0.0) {
            return Err(ConfigError::Invalid("acceleration must be > 0".into()));
        }
        if !(self.stepper.junction_deviation > 0.0) {
            return Err(ConfigError::Invalid(
                "junction_deviation must be > 0".into(),
            ));
        }
        if !(self.feed.mm_per_arc_segment > 0.0) {
            return Err(ConfigError::Invalid(
                "mm_per_arc_segment must be > 0".into(),
            ));
        }
        if !(self.homing.feed_rate > 0.0 && self.homing.seek_rate > 0.0) {
            return Err(ConfigError::Invalid("homing rates must be > 0".into()));
        }
        if self.homing.locate_cycles == 0 {
            return Err(ConfigError::Invalid(
                "homing locate_cycles must be >= 1".into(),
            ));
        }
        for group in &self.homing.groups {
            for c in group.chars() {
                if !AXIS_NAMES.contains(&c.to_ascii_lowercase()) {
                    return Err(ConfigError::Invalid(format!(
                        "unknown axis '{}' in homing group '{}'",
                        c, group
                    )));
                }
            }
        }
        Ok(())
    }
}

// Default value functions. The numbers come from the stock foam cutter
// profile: 200 steps/rev at 16 microsteps on a 2mm-pitch belt with a
// 20-tooth pulley gives 80 steps/mm on every axis.
fn default_steps_per_mm() -> [f64; N_AXIS] {
    [80.0, 80.0, 80.0, 80.0]
}
fn default_pulse_microseconds() -> u32 {
    10
}
fn default_acceleration() -> f64 {
    25.0 * 60.0 * 60.0 // 25 mm/s^2, stored in mm/min^2
}
fn default_junction_deviation() -> f64 {
    0.05
}
fn default_idle_lock_time() -> u8 {
    255
}
fn default_feed_rate() -> f64 {
    200.0
}
fn default_seek_rate() -> f64 {
    500.0
}
fn default_mm_per_arc_segment() -> f64 {
    0.1
}
fn default_n_arc_correction() -> u8 {
    25
}
fn default_true() -> bool {
    true
}
fn default_homing_dir_mask() -> u8 {
    AXES_MASK // all axes home toward negative
}
fn default_homing_feed_rate() -> f64 {
    100.0
}
fn default_homing_seek_rate() -> f64 {
    500.0
}
fn default_homing_debounce_delay() -> u16 {
    250
}
fn default_homing_pulloff() -> [f64; N_AXIS] {
    [1.0, 1.0, 1.0, 1.0]
}
fn default_locate_cycles() -> u8 {
    2
}
fn default_homing_groups() -> Vec<String> {
    vec!["xyuz".to_string()]
}

/// Load and validate settings from a TOML file.
pub fn load_settings(path: &str) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read settings file '{}': {}", path, e);
        e
    })?;
    let settings: Settings = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse settings TOML: {}", e);
        e
    })?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn default_values() {
        let settings = Settings::default();
        assert_eq!(settings.axes.steps_per_mm, [80.0; 4]);
        assert_eq!(settings.stepper.pulse_microseconds, 10);
        assert_eq!(settings.stepper.acceleration, 90_000.0);
        assert_eq!(settings.stepper.junction_deviation, 0.05);
        assert_eq!(settings.homing.locate_cycles, 2);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn load_settings_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("cutter.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "[stepper]\nacceleration = 50000.0\n\n[homing]\nseek_rate = 400.0"
        )
        .unwrap();
        file.flush().unwrap();
        let settings = load_settings(file_path.to_str().unwrap()).unwrap();
        assert_eq!(settings.stepper.acceleration, 50_000.0);
        assert_eq!(settings.homing.seek_rate, 400.0);
        // Defaults for missing fields
        assert_eq!(settings.feed.default_feed_rate, 200.0);
    }

    #[test]
    fn load_settings_missing_file() {
        let result = load_settings("nonexistent_settings.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn invalid_value_rejected() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "[axes]\nsteps_per_mm = [0.0, 80.0, 80.0, 80.0]").unwrap();
        file.flush().unwrap();
        let result = load_settings(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn homing_group_masks() {
        let mut settings = Settings::default();
        assert_eq!(settings.homing.group_masks(), vec![0x0F]);
        settings.homing.groups = vec!["xy".into(), "uz".into()];
        assert_eq!(
            settings.homing.group_masks(),
            vec![
                (1 << X_AXIS) | (1 << Y_AXIS),
                (1 << U_AXIS) | (1 << Z_AXIS)
            ]
        );
        settings.homing.groups = vec!["q".into()];
        assert!(settings.validate().is_err());
    }
}
