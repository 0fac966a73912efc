//! Machine configuration: TOML loading, parameter validation, and
//! leadscrew compensation tables.
//!
//! The external config layer hands the controller one validated
//! `MachineConfig` at initialization. Optional fields use
//! `#[serde(default)]` so partial files deserialize forward-compatibly;
//! `validate()` enforces the parameter bounds the core depends on
//! (strictly positive jerk above all).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{CYCLE_TIME_MAX, CYCLE_TIME_MIN, DEFAULT_QUEUE_SIZE, MAX_AXES, MAX_JOINTS};

// ─── Errors ─────────────────────────────────────────────────────────

/// Configuration loading or validation failure. Fatal at init.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config validation: {0}")]
    Validation(String),
    #[error("compensation file: {0}")]
    CompFile(#[from] CompFileError),
}

/// Leadscrew compensation file failure.
#[derive(Debug, Error)]
pub enum CompFileError {
    #[error("cannot read {path}: {detail}")]
    Io { path: String, detail: String },
    #[error("{path}:{line}: expected {expected} numeric columns")]
    BadRow { path: String, line: usize, expected: usize },
    #[error("{path}: entries not sorted by nominal position")]
    Unsorted { path: String },
}

// ─── Joint Configuration ────────────────────────────────────────────

/// Kind of joint: determines units and wrap behavior upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JointType {
    #[default]
    Linear,
    Angular,
}

/// Compensation file column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompFileType {
    /// nominal / forward position / reverse position triples.
    #[default]
    Triplet,
    /// nominal / fwd trim / fwd slope / rev trim / rev slope quintuples.
    Quintuplet,
}

/// Per-joint configuration, mirroring the external INI surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointConfig {
    #[serde(default)]
    pub joint_type: JointType,

    /// Software travel limits [user units].
    pub min_limit: f64,
    pub max_limit: f64,

    /// Kinematic ceilings [user units/s, /s², /s³].
    pub max_velocity: f64,
    pub max_acceleration: f64,
    pub max_jerk: f64,

    /// Following-error limit at full speed [user units].
    #[serde(default = "default_ferror")]
    pub ferror: f64,
    /// Following-error floor at low speed [user units].
    #[serde(default = "default_min_ferror")]
    pub min_ferror: f64,

    /// Mechanical backlash taken up on reversal [user units].
    #[serde(default)]
    pub backlash: f64,
    /// Optional leadscrew compensation table path.
    #[serde(default)]
    pub comp_file: Option<String>,
    #[serde(default)]
    pub comp_file_type: CompFileType,

    // ── Homing ──
    /// Final resting coordinate after homing [user units].
    #[serde(default)]
    pub home: f64,
    /// Joint coordinate of the switch/index event [user units].
    #[serde(default)]
    pub home_offset: f64,
    /// Initial switch search velocity [user units/s]; 0 = no switch.
    #[serde(default)]
    pub home_search_vel: f64,
    /// Final latch velocity [user units/s]; sign vs search selects
    /// rising or falling edge capture.
    #[serde(default)]
    pub home_latch_vel: f64,
    /// Velocity for the final move to `home`; 0 = rapid.
    #[serde(default)]
    pub home_final_vel: f64,
    /// Sequence group for multi-joint homing; -1 = not in home-all.
    #[serde(default = "default_home_sequence")]
    pub home_sequence: i32,
    /// Finish homing on the encoder index pulse.
    #[serde(default)]
    pub home_use_index: bool,
    /// Do not trip hard limits during homing moves.
    #[serde(default)]
    pub home_ignore_limits: bool,
    /// Home switch is shared with another joint or the limit switch.
    #[serde(default)]
    pub home_is_shared: bool,
    /// Unlock a locking rotary indexer before homing.
    #[serde(default)]
    pub home_unlock_first: bool,
    /// Clear the homed flag whenever the machine is disabled.
    #[serde(default)]
    pub volatile_home: bool,
    /// Joint is a locking rotary indexer.
    #[serde(default)]
    pub locking_indexer: bool,
}

fn default_ferror() -> f64 {
    1.0
}
fn default_min_ferror() -> f64 {
    0.1
}
fn default_home_sequence() -> i32 {
    -1
}

impl JointConfig {
    pub fn validate(&self, idx: usize) -> Result<(), ConfigError> {
        if self.min_limit >= self.max_limit {
            return Err(ConfigError::Validation(format!(
                "joint {idx}: min_limit {} >= max_limit {}",
                self.min_limit, self.max_limit
            )));
        }
        if self.max_velocity <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "joint {idx}: max_velocity must be positive"
            )));
        }
        if self.max_acceleration <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "joint {idx}: max_acceleration must be positive"
            )));
        }
        if self.max_jerk <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "joint {idx}: max_jerk must be strictly positive"
            )));
        }
        if self.ferror < self.min_ferror {
            return Err(ConfigError::Validation(format!(
                "joint {idx}: ferror {} below min_ferror {}",
                self.ferror, self.min_ferror
            )));
        }
        // A latch move needs either a switch search or an index pulse
        // to terminate it; a search needs a latch to refine it.
        if self.home_search_vel == 0.0
            && self.home_latch_vel != 0.0
            && !self.home_use_index
        {
            return Err(ConfigError::Validation(format!(
                "joint {idx}: non-zero HOME_LATCH_VEL needs HOME_SEARCH_VEL or HOME_USE_INDEX"
            )));
        }
        if self.home_search_vel != 0.0 && self.home_latch_vel == 0.0 {
            return Err(ConfigError::Validation(format!(
                "joint {idx}: non-zero HOME_SEARCH_VEL needs HOME_LATCH_VEL"
            )));
        }
        Ok(())
    }
}

// ─── Axis Configuration ─────────────────────────────────────────────

/// Per-Cartesian-axis limits, used by the teleop planner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisConfig {
    pub min_limit: f64,
    pub max_limit: f64,
    pub max_velocity: f64,
    pub max_acceleration: f64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            min_limit: f64::MIN,
            max_limit: f64::MAX,
            max_velocity: 100.0,
            max_acceleration: 1000.0,
        }
    }
}

// ─── Trajectory Configuration ───────────────────────────────────────

/// Trajectory-level parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrajConfig {
    /// Servo cycle time [s].
    pub cycle_time: f64,
    /// Default tool-tip velocity [user units/s].
    pub default_velocity: f64,
    /// Tool-tip velocity ceiling [user units/s].
    pub max_velocity: f64,
    /// Tool-tip acceleration ceiling [user units/s²].
    pub max_acceleration: f64,
    /// Tool-tip jerk ceiling [user units/s³].
    pub max_jerk: f64,
    /// Segment queue capacity.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Coarse-to-servo interpolation ratio (1 = trajectory rate equals
    /// servo rate).
    #[serde(default = "default_interp_rate")]
    pub interpolation_rate: usize,
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}
fn default_interp_rate() -> usize {
    1
}

impl TrajConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(CYCLE_TIME_MIN..=CYCLE_TIME_MAX).contains(&self.cycle_time) {
            return Err(ConfigError::Validation(format!(
                "cycle_time {} out of range [{CYCLE_TIME_MIN}, {CYCLE_TIME_MAX}]",
                self.cycle_time
            )));
        }
        if self.max_velocity <= 0.0 || self.max_acceleration <= 0.0 {
            return Err(ConfigError::Validation(
                "trajectory velocity and acceleration must be positive".into(),
            ));
        }
        if self.max_jerk <= 0.0 {
            return Err(ConfigError::Validation(
                "trajectory max_jerk must be strictly positive".into(),
            ));
        }
        if self.queue_size < 4 {
            return Err(ConfigError::Validation(format!(
                "queue_size {} too small",
                self.queue_size
            )));
        }
        if self.interpolation_rate == 0 {
            return Err(ConfigError::Validation("interpolation_rate must be >= 1".into()));
        }
        Ok(())
    }
}

// ─── Machine Configuration ──────────────────────────────────────────

/// The complete configuration bundle passed in at initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub traj: TrajConfig,
    pub joints: Vec<JointConfig>,
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
}

impl MachineConfig {
    /// Parse and validate a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.traj.validate()?;
        if self.joints.is_empty() || self.joints.len() > MAX_JOINTS {
            return Err(ConfigError::Validation(format!(
                "joint count {} out of range [1, {MAX_JOINTS}]",
                self.joints.len()
            )));
        }
        if self.axes.len() > MAX_AXES {
            return Err(ConfigError::Validation(format!(
                "axis count {} exceeds {MAX_AXES}",
                self.axes.len()
            )));
        }
        for (i, j) in self.joints.iter().enumerate() {
            j.validate(i)?;
        }
        Ok(())
    }

    pub fn num_joints(&self) -> usize {
        self.joints.len()
    }
}

// ─── Compensation Table ─────────────────────────────────────────────

/// One compensation table row, normalized to trim/slope form.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CompEntry {
    /// Nominal (commanded) position this row anchors at.
    pub nominal: f64,
    pub fwd_trim: f64,
    pub fwd_slope: f64,
    pub rev_trim: f64,
    pub rev_slope: f64,
}

/// Leadscrew compensation table for one joint, sorted by nominal.
#[derive(Debug, Clone, Default)]
pub struct CompTable {
    pub entries: Vec<CompEntry>,
}

impl CompTable {
    /// Parse a whitespace-separated table file.
    ///
    /// Triplet rows are `nominal forward reverse` measured positions;
    /// trims are derived as measurement error and slopes from adjacent
    /// rows. Quintuplet rows carry trim and slope explicitly.
    pub fn from_file(path: &Path, kind: CompFileType) -> Result<Self, CompFileError> {
        let text = std::fs::read_to_string(path).map_err(|e| CompFileError::Io {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Self::from_str_table(&text, kind, &path.display().to_string())
    }

    pub fn from_str_table(
        text: &str,
        kind: CompFileType,
        path: &str,
    ) -> Result<Self, CompFileError> {
        let expected = match kind {
            CompFileType::Triplet => 3,
            CompFileType::Quintuplet => 5,
        };
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Option<Vec<f64>> =
                line.split_whitespace().map(|t| t.parse::<f64>().ok()).collect();
            match cols {
                Some(c) if c.len() == expected => rows.push(c),
                _ => {
                    return Err(CompFileError::BadRow {
                        path: path.to_string(),
                        line: lineno + 1,
                        expected,
                    });
                }
            }
        }

        if rows.windows(2).any(|w| w[0][0] >= w[1][0]) {
            return Err(CompFileError::Unsorted { path: path.to_string() });
        }

        let entries = match kind {
            CompFileType::Quintuplet => rows
                .iter()
                .map(|r| CompEntry {
                    nominal: r[0],
                    fwd_trim: r[1],
                    fwd_slope: r[2],
                    rev_trim: r[3],
                    rev_slope: r[4],
                })
                .collect(),
            CompFileType::Triplet => {
                // trim = measured - nominal; slope from this row to the
                // next (last row repeats the previous slope).
                let n = rows.len();
                (0..n)
                    .map(|i| {
                        let (nom, fwd, rev) = (rows[i][0], rows[i][1], rows[i][2]);
                        let (fwd_slope, rev_slope) = if i + 1 < n {
                            let dx = rows[i + 1][0] - nom;
                            (
                                ((rows[i + 1][1] - rows[i + 1][0]) - (fwd - nom)) / dx,
                                ((rows[i + 1][2] - rows[i + 1][0]) - (rev - nom)) / dx,
                            )
                        } else {
                            (0.0, 0.0)
                        };
                        CompEntry {
                            nominal: nom,
                            fwd_trim: fwd - nom,
                            fwd_slope,
                            rev_trim: rev - nom,
                            rev_slope,
                        }
                    })
                    .collect()
            }
        };

        Ok(Self { entries })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
