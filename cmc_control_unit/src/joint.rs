//! Per-joint runtime state, pre-allocated at startup.

use cmc_common::config::{CompFileType, CompTable, ConfigError, JointConfig};
use cmc_common::flags::JointFlags;
use cmc_motion::cubic::CubicInterpolator;
use cmc_motion::free_planner::FreePlanner;

use crate::homing::HomeState;

/// Everything the cycle mutates for one joint.
#[derive(Debug, Clone)]
pub struct JointRuntime {
    pub cfg: JointConfig,
    /// Leadscrew compensation table (empty → plain backlash).
    pub comp: CompTable,
    /// Cursor into the table, walked incrementally as the joint moves.
    pub comp_cursor: usize,

    pub flags: JointFlags,

    // ── Positions [user units unless noted] ──
    /// Commanded position after interpolation.
    pub pos_cmd: f64,
    /// Feedback in joint coordinates.
    pub pos_fb: f64,
    /// Raw feedback in motor coordinates.
    pub motor_pos_fb: f64,
    /// Output in motor coordinates.
    pub motor_pos_cmd: f64,
    /// Joint-to-motor offset established by homing.
    pub motor_offset: f64,
    /// Commanded position before interpolation.
    pub coarse_pos: f64,
    /// Commanded velocity [user units/s].
    pub vel_cmd: f64,

    // ── Following error ──
    pub ferror: f64,
    pub ferror_high_mark: f64,
    /// Velocity-scaled limit, floored at `min_ferror`.
    pub ferror_limit: f64,

    // ── Backlash / screw compensation ──
    /// Raw correction from the table (steps on reversal).
    pub backlash_corr: f64,
    /// Ramped correction actually applied to the output.
    pub backlash_filt: f64,
    pub backlash_vel: f64,

    // ── Planners ──
    pub free: FreePlanner,
    pub cubic: CubicInterpolator,

    // ── Homing ──
    pub home_state: HomeState,
    /// Settle countdown between homing moves [cycles].
    pub home_pause_timer: u64,
    /// Feedback latched at the most recent switch event.
    pub switch_latch_pos: f64,
    /// Encoder index handshake mirror.
    pub index_enable: bool,
    /// Locking-indexer unlock request.
    pub unlock_request: bool,

    // ── Jogging ──
    pub old_jog_counts: i32,
    /// Velocity of the last keyboard jog command [user units/s].
    pub jog_vel: f64,
    pub kb_jog_active: bool,
    pub wheel_jog_active: bool,

    /// Motor position latched by capture hardware (probe).
    pub probed_pos: f64,
}

impl JointRuntime {
    /// Build a joint from its validated configuration, loading the
    /// compensation table if one is configured.
    pub fn from_config(cfg: &JointConfig) -> Result<Self, ConfigError> {
        let comp = match &cfg.comp_file {
            Some(path) => CompTable::from_file(std::path::Path::new(path), cfg.comp_file_type)?,
            None => CompTable::default(),
        };
        Ok(Self::with_table(cfg.clone(), comp))
    }

    /// Build with an explicit table (tests, or pre-parsed tables).
    pub fn with_table(cfg: JointConfig, comp: CompTable) -> Self {
        let free = FreePlanner {
            max_vel: cfg.max_velocity,
            max_acc: cfg.max_acceleration,
            ..Default::default()
        };
        Self {
            cfg,
            comp,
            comp_cursor: 0,
            flags: JointFlags::ACTIVE,
            pos_cmd: 0.0,
            pos_fb: 0.0,
            motor_pos_fb: 0.0,
            motor_pos_cmd: 0.0,
            motor_offset: 0.0,
            coarse_pos: 0.0,
            vel_cmd: 0.0,
            ferror: 0.0,
            ferror_high_mark: 0.0,
            ferror_limit: 0.0,
            backlash_corr: 0.0,
            backlash_filt: 0.0,
            backlash_vel: 0.0,
            free,
            cubic: CubicInterpolator::new(0.001, 1),
            home_state: HomeState::Idle,
            home_pause_timer: 0,
            switch_latch_pos: 0.0,
            index_enable: false,
            unlock_request: false,
            old_jog_counts: 0,
            jog_vel: 0.0,
            kb_jog_active: false,
            wheel_jog_active: false,
            probed_pos: 0.0,
        }
    }

    /// Placeholder for an unconfigured joint slot.
    pub fn inactive() -> Self {
        let cfg = JointConfig {
            joint_type: Default::default(),
            min_limit: -1.0,
            max_limit: 1.0,
            max_velocity: 1.0,
            max_acceleration: 1.0,
            max_jerk: 1.0,
            ferror: 1.0,
            min_ferror: 0.1,
            backlash: 0.0,
            comp_file: None,
            comp_file_type: CompFileType::Triplet,
            home: 0.0,
            home_offset: 0.0,
            home_search_vel: 0.0,
            home_latch_vel: 0.0,
            home_final_vel: 0.0,
            home_sequence: -1,
            home_use_index: false,
            home_ignore_limits: false,
            home_is_shared: false,
            home_unlock_first: false,
            volatile_home: false,
            locking_indexer: false,
        };
        let mut j = Self::with_table(cfg, CompTable::default());
        j.flags = JointFlags::empty();
        j
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.flags.contains(JointFlags::ACTIVE)
    }

    #[inline]
    pub fn is_homed(&self) -> bool {
        self.flags.contains(JointFlags::HOMED)
    }

    #[inline]
    pub fn is_homing(&self) -> bool {
        self.flags.contains(JointFlags::HOMING)
    }

    /// Jog range: full travel when homed, effectively unbounded when
    /// the position reference is not yet established.
    pub fn jog_limits(&self) -> (f64, f64) {
        if self.is_homed() {
            (self.cfg.min_limit, self.cfg.max_limit)
        } else {
            (-1e12, 1e12)
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
