//! The servo cycle: deterministic read → plan → write, once per
//! period.
//!
//! Ordered phases, the order being part of the contract:
//!
//!  1. Overrun detection against a short period history.
//!  2. Read inputs: feedback, switches, spindle, following error,
//!     net feed/spindle scale.
//!  3. Forward kinematics → Cartesian feedback.
//!  4. Probe interaction.
//!  5. Mode transitions (free / coord / teleop / disabled), gated on
//!     in-position.
//!  6. Jogwheels (free mode only).
//!  7. Homing sequencer and per-joint homing.
//!  8. Spindle command synthesis (constant surface speed).
//!  9. Position commands: free planners, or the coordinated planner
//!     through the cubic interpolators, or teleop integration.
//! 10. Soft-limit post-check on the commanded positions.
//! 11. Backlash / leadscrew compensation.
//! 12. Write outputs and publish the status snapshot.
//!
//! The cycle allocates nothing; all state is pre-allocated at
//! startup. RT scheduling setup (mlockall, CPU pinning, SCHED_FIFO,
//! absolute-time sleeping) lives behind the `rt` feature; without it
//! a plain sleeping loop is used for simulation.

use cmc_common::config::{ConfigError, MachineConfig};
use cmc_common::consts::{CYCLE_HISTORY, MAX_AXES, MAX_DIO, MAX_JOINTS, OVERRUN_RATIO};
use cmc_common::flags::{FeedEnables, JointFlags, MotionFlags};
use cmc_common::io::{JointIo, MachineIo};
use cmc_common::pose::Pose;
use cmc_common::status::{MotionStatusSnap, ProbeSnapState};
use cmc_motion::kinematics::{Kinematics, KinematicsKind};
use cmc_motion::planner::TrajPlanner;
use tracing::{error, info, warn};

use crate::command::{Command, CommandAck, CommandMailbox, ModeRequest};
use crate::comp;
use crate::homing::{self, HomeState, HomingInputs, HomingSequencer};
use crate::joint::JointRuntime;
use crate::probe::{ProbeEngine, ProbeEvent};

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-cycle timing statistics. Updated every cycle with no
/// allocation.
#[derive(Debug, Clone)]
pub struct CycleStats {
    pub cycle_count: u64,
    pub last_cycle_ns: i64,
    pub min_cycle_ns: i64,
    pub max_cycle_ns: i64,
    pub sum_cycle_ns: i64,
    pub overruns: u64,
}

impl CycleStats {
    pub const fn new() -> Self {
        Self {
            cycle_count: 0,
            last_cycle_ns: 0,
            min_cycle_ns: i64::MAX,
            max_cycle_ns: 0,
            sum_cycle_ns: 0,
            overruns: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, duration_ns: i64) {
        self.cycle_count += 1;
        self.last_cycle_ns = duration_ns;
        self.min_cycle_ns = self.min_cycle_ns.min(duration_ns);
        self.max_cycle_ns = self.max_cycle_ns.max(duration_ns);
        self.sum_cycle_ns += duration_ns;
    }

    #[inline]
    pub fn avg_cycle_ns(&self) -> i64 {
        if self.cycle_count == 0 { 0 } else { self.sum_cycle_ns / self.cycle_count as i64 }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Operating State ────────────────────────────────────────────────

/// Overall operating state, derived from the enable and mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MotionState {
    #[default]
    Disabled = 0,
    Free = 1,
    Teleop = 2,
    Coord = 3,
}

// ─── I/O Bundle ─────────────────────────────────────────────────────

/// The complete pin image the external I/O layer exchanges with the
/// controller around each cycle.
#[derive(Debug, Clone)]
pub struct ControllerIo {
    pub machine: MachineIo,
    pub joints: [JointIo; MAX_JOINTS],
}

impl Default for ControllerIo {
    fn default() -> Self {
        Self { machine: MachineIo::default(), joints: [JointIo::default(); MAX_JOINTS] }
    }
}

// ─── Spindle ────────────────────────────────────────────────────────

/// Commanded spindle state (from the task thread).
#[derive(Debug, Clone, Copy, Default)]
pub struct SpindleCommand {
    /// Programmed speed [rev/s], signed.
    pub speed_rps: f64,
    pub on: bool,
    /// Constant-surface-speed factor [user units/min]; 0 = G97.
    pub css_factor: f64,
    /// Tool x offset used as the CSS radius reference.
    pub css_xoffset: f64,
    /// Radius below which CSS holds the programmed speed.
    pub const_speed_radius: f64,
    /// Resulting speed request [rev/s].
    pub speed_req_rps: f64,
    /// CSS tracking error, for diagnostics.
    pub css_error: f64,
}

// ─── Teleop ─────────────────────────────────────────────────────────

/// Per-axis teleoperation integration state.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeleopData {
    pub desired_vel: [f64; MAX_AXES],
    pub current_vel: [f64; MAX_AXES],
}

#[inline]
fn pose_axis(pose: &Pose, i: usize) -> f64 {
    match i {
        0 => pose.tran.x,
        1 => pose.tran.y,
        2 => pose.tran.z,
        3 => pose.a,
        4 => pose.b,
        5 => pose.c,
        6 => pose.u,
        7 => pose.v,
        _ => pose.w,
    }
}

#[inline]
fn pose_axis_set(pose: &mut Pose, i: usize, v: f64) {
    match i {
        0 => pose.tran.x = v,
        1 => pose.tran.y = v,
        2 => pose.tran.z = v,
        3 => pose.a = v,
        4 => pose.b = v,
        5 => pose.c = v,
        6 => pose.u = v,
        7 => pose.v = v,
        _ => pose.w = v,
    }
}

// ─── Controller ─────────────────────────────────────────────────────

/// The servo-cycle controller.
pub struct ServoController {
    pub config: MachineConfig,
    num_joints: usize,
    /// Servo period [s].
    period: f64,
    servo_freq: f64,

    kins: Box<dyn Kinematics>,
    pub joints: Vec<JointRuntime>,
    pub planner: TrajPlanner,
    pub mailbox: CommandMailbox,
    pub io: ControllerIo,
    pub status: MotionStatusSnap,
    pub stats: CycleStats,

    sequencer: HomingSequencer,
    probe: ProbeEngine,
    teleop: TeleopData,
    pub spindle: SpindleCommand,

    // ── Mode requests and flags ──
    motion_flags: MotionFlags,
    state: MotionState,
    enabling: bool,
    coordinating: bool,
    teleoperating: bool,

    // ── Scaling ──
    feed_scale: f64,
    spindle_scale: f64,
    enables_new: FeedEnables,
    net_feed_scale: f64,
    net_spindle_scale: f64,

    // ── Limit override ──
    override_limit_mask: u32,
    overriding: bool,
    on_soft_limit: bool,

    // ── Stepping ──
    stepping: bool,
    id_for_step: i32,

    // ── Kinematics feedback bookkeeping ──
    carte_pos_cmd: Pose,
    carte_pos_fb: Pose,
    carte_pos_cmd_ok: bool,
    carte_pos_fb_ok: bool,
    world_home: Pose,

    // ── Overrun detection ──
    cycle_history: [i64; CYCLE_HISTORY],
    history_index: usize,
    history_priming: bool,
    last_cycle_start: i64,
    overrun_reported: bool,

    first_pass: bool,
}

impl ServoController {
    /// Build a controller from a validated configuration. Loads
    /// compensation tables and pre-allocates all runtime state.
    pub fn new(config: MachineConfig, kins: Box<dyn Kinematics>) -> Result<Self, ConfigError> {
        config.validate()?;
        let period = config.traj.cycle_time;
        let interp = config.traj.interpolation_rate;
        let traj_period = period * interp as f64;

        let mut joints = Vec::with_capacity(MAX_JOINTS);
        for cfg in &config.joints {
            let mut joint = JointRuntime::from_config(cfg)?;
            joint.cubic = cmc_motion::cubic::CubicInterpolator::new(traj_period, interp);
            joints.push(joint);
        }
        while joints.len() < MAX_JOINTS {
            joints.push(JointRuntime::inactive());
        }

        let mut planner = TrajPlanner::new(traj_period, config.traj.queue_size);
        planner
            .set_vmax(config.traj.max_velocity, config.traj.max_velocity)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        planner
            .set_amax(config.traj.max_acceleration)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        planner
            .set_jerk_limit(config.traj.max_jerk)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        planner.set_vlimit(config.traj.max_velocity);

        let num_joints = config.num_joints();
        Ok(Self {
            config,
            num_joints,
            period,
            servo_freq: 1.0 / period,
            kins,
            joints,
            planner,
            mailbox: CommandMailbox::default(),
            io: ControllerIo::default(),
            status: MotionStatusSnap::default(),
            stats: CycleStats::new(),
            sequencer: HomingSequencer::default(),
            probe: ProbeEngine::default(),
            teleop: TeleopData::default(),
            spindle: SpindleCommand::default(),
            motion_flags: MotionFlags::default(),
            state: MotionState::Disabled,
            enabling: false,
            coordinating: false,
            teleoperating: false,
            feed_scale: 1.0,
            spindle_scale: 1.0,
            enables_new: FeedEnables::all(),
            net_feed_scale: 1.0,
            net_spindle_scale: 1.0,
            override_limit_mask: 0,
            overriding: false,
            on_soft_limit: false,
            stepping: false,
            id_for_step: 0,
            carte_pos_cmd: Pose::ZERO,
            carte_pos_fb: Pose::ZERO,
            carte_pos_cmd_ok: false,
            carte_pos_fb_ok: false,
            world_home: Pose::ZERO,
            cycle_history: [0; CYCLE_HISTORY],
            history_index: 0,
            history_priming: true,
            last_cycle_start: 0,
            overrun_reported: false,
            first_pass: true,
        })
    }

    #[inline]
    pub fn motion_state(&self) -> MotionState {
        self.state
    }

    #[inline]
    pub fn period(&self) -> f64 {
        self.period
    }

    /// Task-side reclamation of planner heap buffers.
    pub fn drain_reclaim(&mut self) -> usize {
        self.planner.drain_reclaim()
    }

    // ─── The Cycle ──────────────────────────────────────────────────

    /// Run one servo cycle. `now_ns` is a monotonic timestamp used
    /// only for overrun detection.
    pub fn run_cycle(&mut self, now_ns: i64) {
        self.detect_overrun(now_ns);
        self.status.begin_update();

        self.process_commands();
        self.process_inputs();
        self.do_forward_kins();
        self.process_probe_inputs();
        self.check_for_faults();
        self.set_operating_mode();
        self.handle_jogwheels();
        self.do_homing();
        self.get_spindle_cmds();
        self.get_pos_cmds();
        self.check_soft_limits();
        self.compute_screw_comp();
        self.output_to_io();
        self.update_status();

        self.status.end_update();
        self.first_pass = false;
    }

    // ── Phase 1: overrun detection ──

    fn detect_overrun(&mut self, now_ns: i64) {
        let this_run = now_ns - self.last_cycle_start;
        if self.last_cycle_start != 0 && !self.history_priming {
            let anomalous = self
                .cycle_history
                .iter()
                .all(|&sample| this_run as f64 > OVERRUN_RATIO * sample as f64);
            if anomalous {
                self.stats.overruns += 1;
                if !self.overrun_reported {
                    self.overrun_reported = true;
                    warn!(
                        this_run_ns = this_run,
                        history = ?self.cycle_history,
                        "unexpected realtime delay between servo cycles"
                    );
                }
            }
        }
        if self.last_cycle_start != 0 {
            self.cycle_history[self.history_index] = this_run;
            self.history_index += 1;
            if self.history_index == CYCLE_HISTORY {
                self.history_index = 0;
                self.history_priming = false;
            }
        }
        self.last_cycle_start = now_ns;
    }

    // ── Commands ──

    fn process_commands(&mut self) {
        let Some(cmd) = self.mailbox.take() else { return };
        let ack = self.execute_command(cmd);
        self.mailbox.acknowledge(ack);
    }

    fn execute_command(&mut self, cmd: Command) -> CommandAck {
        match cmd {
            Command::Enable => {
                self.enabling = true;
                CommandAck::Done
            }
            Command::Disable => {
                self.enabling = false;
                CommandAck::Done
            }
            Command::SetMode(req) => {
                match req {
                    ModeRequest::Free => {
                        self.coordinating = false;
                        self.teleoperating = false;
                    }
                    ModeRequest::Coord => {
                        self.coordinating = true;
                        self.teleoperating = false;
                    }
                    ModeRequest::Teleop => {
                        self.teleoperating = true;
                    }
                }
                CommandAck::Done
            }
            Command::SetFeedScale(s) => {
                self.feed_scale = s.max(0.0);
                CommandAck::Done
            }
            Command::SetSpindleScale(s) => {
                self.spindle_scale = s.max(0.0);
                CommandAck::Done
            }
            Command::SetEnables(e) => {
                self.enables_new = e;
                CommandAck::Done
            }
            Command::Pause => {
                self.planner.pause();
                CommandAck::Done
            }
            Command::Resume => {
                self.stepping = false;
                self.planner.resume();
                CommandAck::Done
            }
            Command::Step => {
                if self.planner.is_paused() {
                    self.stepping = true;
                    self.id_for_step = self.planner.status().exec_id;
                    self.planner.resume();
                    CommandAck::Done
                } else {
                    CommandAck::Rejected
                }
            }
            Command::Abort => {
                self.planner.abort();
                for joint in self.joints.iter_mut().take(self.num_joints) {
                    joint.free.enable = false;
                    joint.kb_jog_active = false;
                }
                self.teleop.desired_vel = [0.0; MAX_AXES];
                CommandAck::Done
            }
            Command::JogCont { joint, vel } => self.jog_cont(joint, vel),
            Command::JogIncr { joint, dist, vel } => self.jog_incr(joint, dist, vel),
            Command::JogAbort { joint } => {
                if joint < self.num_joints {
                    self.joints[joint].free.enable = false;
                    self.joints[joint].kb_jog_active = false;
                    CommandAck::Done
                } else {
                    CommandAck::Rejected
                }
            }
            Command::Home { joint } => match joint {
                None => {
                    if self.state == MotionState::Free {
                        self.sequencer.start();
                        CommandAck::Done
                    } else {
                        CommandAck::Rejected
                    }
                }
                Some(j) => {
                    if self.state == MotionState::Free
                        && j < self.num_joints
                        && self.joints[j].home_state == HomeState::Idle
                    {
                        self.joints[j].free.enable = false;
                        self.joints[j].home_state = HomeState::Start;
                        CommandAck::Done
                    } else {
                        CommandAck::Rejected
                    }
                }
            },
            Command::HomeAbort => {
                self.sequencer.abort();
                for joint in self.joints.iter_mut().take(self.num_joints) {
                    if joint.home_state != HomeState::Idle {
                        joint.home_state = HomeState::Abort;
                    }
                }
                CommandAck::Done
            }
            Command::SetTeleopVector { vel } => {
                self.teleop.desired_vel = vel;
                CommandAck::Done
            }
            Command::StartProbe { probe_type } => {
                self.probe.start(probe_type);
                CommandAck::Done
            }
            Command::ClearProbe => {
                self.probe.clear();
                CommandAck::Done
            }
            Command::SpindleOn { speed_rps, css_factor, css_xoffset } => {
                self.spindle.speed_rps = speed_rps;
                self.spindle.css_factor = css_factor;
                self.spindle.css_xoffset = css_xoffset;
                self.spindle.on = true;
                CommandAck::Done
            }
            Command::SpindleOff => {
                self.spindle.on = false;
                self.spindle.speed_rps = 0.0;
                CommandAck::Done
            }
            Command::SetSpindleSpeed(s) => {
                self.spindle.speed_rps = s;
                CommandAck::Done
            }
            Command::OverrideLimits => {
                self.override_limit_mask = u32::MAX;
                self.overriding = true;
                CommandAck::Done
            }
        }
    }

    fn jog_cont(&mut self, joint_num: usize, vel: f64) -> CommandAck {
        if self.state != MotionState::Free
            || joint_num >= self.num_joints
            || self.joints[joint_num].is_homing()
        {
            return CommandAck::Rejected;
        }
        let joint = &mut self.joints[joint_num];
        let (min, max) = joint.jog_limits();
        joint.free.pos_cmd = if vel >= 0.0 { max } else { min };
        joint.jog_vel = vel.abs();
        joint.free.max_vel = vel.abs().min(joint.cfg.max_velocity);
        joint.free.enable = true;
        joint.kb_jog_active = true;
        joint.flags.remove(JointFlags::AT_HOME);
        CommandAck::Done
    }

    fn jog_incr(&mut self, joint_num: usize, dist: f64, vel: f64) -> CommandAck {
        if self.state != MotionState::Free
            || joint_num >= self.num_joints
            || self.joints[joint_num].is_homing()
        {
            return CommandAck::Rejected;
        }
        let joint = &mut self.joints[joint_num];
        let (min, max) = joint.jog_limits();
        let target = (joint.free.pos_cmd + dist).clamp(min, max);
        joint.free.pos_cmd = target;
        joint.jog_vel = vel.abs();
        joint.free.max_vel = vel.abs().min(joint.cfg.max_velocity);
        joint.free.enable = true;
        joint.kb_jog_active = true;
        joint.flags.remove(JointFlags::AT_HOME);
        CommandAck::Done
    }

    // ── Phase 2: inputs ──

    fn process_inputs(&mut self) {
        // Net feed scale from the enable bits that apply right now:
        // the executing move's bits in coord mode, the live ones
        // otherwise.
        let enables = if self.state == MotionState::Coord {
            self.planner.status().enables_queued
        } else {
            self.enables_new
        };
        let mut scale = 1.0;
        if enables.contains(FeedEnables::FEED_SCALE) {
            scale *= self.feed_scale;
        }
        if enables.contains(FeedEnables::ADAPTIVE_FEED) {
            scale *= self.io.machine.adaptive_feed.clamp(0.0, 1.0);
        }
        if enables.contains(FeedEnables::FEED_HOLD) && self.io.machine.feed_hold {
            scale = 0.0;
        }
        self.net_feed_scale = scale;

        let mut sscale = 1.0;
        if enables.contains(FeedEnables::SPINDLE_SCALE) {
            sscale *= self.spindle_scale;
        }
        self.net_spindle_scale = sscale;

        for (i, joint) in self.joints.iter_mut().enumerate().take(self.num_joints) {
            if !joint.is_active() {
                continue;
            }
            let jio = &self.io.joints[i];
            joint.index_enable = jio.index_enable;
            joint.motor_pos_fb = jio.motor_pos_fb;
            joint.probed_pos = jio.probed_pos;
            joint.pos_fb = joint.motor_pos_fb - (joint.backlash_filt + joint.motor_offset);

            // Following error and its velocity-scaled limit.
            joint.ferror = joint.pos_cmd - joint.pos_fb;
            let abs_ferror = joint.ferror.abs();
            if abs_ferror > joint.ferror_high_mark {
                joint.ferror_high_mark = abs_ferror;
            }
            joint.ferror_limit = if joint.cfg.max_velocity > 0.0 {
                (joint.cfg.ferror * joint.vel_cmd.abs() / joint.cfg.max_velocity)
                    .max(joint.cfg.min_ferror)
            } else {
                joint.cfg.min_ferror
            };
            joint.flags.set(JointFlags::FERROR, abs_ferror > joint.ferror_limit);

            // Limit switches; homing may ask to ignore them.
            if !(joint.cfg.home_ignore_limits && joint.home_state != HomeState::Idle) {
                joint.flags.set(JointFlags::POS_LIMIT, jio.pos_lim_sw);
                joint.flags.set(JointFlags::NEG_LIMIT, jio.neg_lim_sw);
            }

            joint.flags.set(JointFlags::AMP_FAULT, jio.amp_fault);
            joint.flags.set(JointFlags::HOME_SW, jio.home_sw);
        }
    }

    // ── Phase 3: forward kinematics ──

    fn all_homed(&self) -> bool {
        self.joints
            .iter()
            .take(self.num_joints)
            .all(|j| !j.is_active() || j.is_homed())
    }

    fn joint_fb_array(&self) -> [f64; MAX_JOINTS] {
        let mut out = [0.0; MAX_JOINTS];
        for (i, j) in self.joints.iter().enumerate().take(self.num_joints) {
            out[i] = j.pos_fb;
        }
        out
    }

    fn do_forward_kins(&mut self) {
        let fb = self.joint_fb_array();
        match self.kins.kind() {
            KinematicsKind::Identity => {
                if let Ok(pose) = self.kins.forward(&fb, &self.carte_pos_fb) {
                    self.carte_pos_fb = pose;
                }
                self.carte_pos_fb_ok = self.all_homed();
            }
            KinematicsKind::Both => {
                if self.all_homed() {
                    if !self.carte_pos_fb_ok {
                        // No usable previous solution: seed with home.
                        self.carte_pos_fb = self.world_home;
                    }
                    match self.kins.forward(&fb, &self.carte_pos_fb) {
                        Ok(pose) => {
                            self.carte_pos_fb = pose;
                            self.carte_pos_fb_ok = true;
                        }
                        Err(_) => {
                            // Non-convergence is survivable: feedback
                            // is marked invalid, the cycle keeps
                            // running.
                            self.carte_pos_fb_ok = false;
                        }
                    }
                } else {
                    self.carte_pos_fb_ok = false;
                }
            }
            KinematicsKind::InverseOnly => {
                if matches!(self.state, MotionState::Coord | MotionState::Teleop) {
                    self.carte_pos_fb = self.carte_pos_cmd;
                    self.carte_pos_fb_ok = true;
                } else {
                    self.carte_pos_fb_ok = false;
                }
            }
        }
    }

    // ── Phase 4: probe ──

    fn process_probe_inputs(&mut self) {
        if !self.probe.is_probing() {
            return;
        }
        let motion_done = self.planner.is_done();
        match self.probe.update(self.io.machine.probe_input, motion_done) {
            ProbeEvent::None => {}
            ProbeEvent::Tripped => {
                // Latch the probed pose from the hardware captures.
                let mut probed = [0.0; MAX_JOINTS];
                for (i, joint) in self.joints.iter().enumerate().take(self.num_joints) {
                    probed[i] =
                        joint.probed_pos - (joint.backlash_filt + joint.motor_offset);
                }
                if let Ok(pose) = self.kins.forward(&probed, &self.carte_pos_fb) {
                    self.status.probed_pos = pose;
                }
                self.planner.abort();
            }
            ProbeEvent::Finished { report } => {
                self.status.probed_pos = self.carte_pos_cmd;
                if report {
                    error!("probe move finished without the expected contact change");
                    self.motion_flags.insert(MotionFlags::ERROR);
                }
                self.planner.abort();
            }
        }
    }

    // ── Phase 5a: faults ──

    fn check_for_faults(&mut self) {
        // External enable dropping while running stops everything.
        if self.motion_flags.contains(MotionFlags::ENABLE) && !self.io.machine.enable {
            error!("motion stopped by enable input");
            self.enabling = false;
        }
        if !self.io.machine.enable || !self.enabling {
            // Drop every motion-synchronized output while disabled.
            for n in 0..MAX_DIO {
                self.io.machine.synch_do[n] = false;
            }
        }

        for (i, joint) in self.joints.iter_mut().enumerate().take(self.num_joints) {
            if !joint.is_active() || !joint.flags.contains(JointFlags::ENABLED) {
                continue;
            }

            let neg_override = self.override_limit_mask & (1 << (i * 2)) != 0;
            let pos_override = self.override_limit_mask & (2 << (i * 2)) != 0;
            let on_pos = joint.flags.contains(JointFlags::POS_LIMIT) && !pos_override;
            let on_neg = joint.flags.contains(JointFlags::NEG_LIMIT) && !neg_override;
            if on_pos || on_neg {
                if !joint.is_homing() {
                    if !joint.flags.contains(JointFlags::ERROR) {
                        error!(joint = i, "on limit switch");
                        // Latch an override so the operator can jog
                        // back off the switch.
                        self.override_limit_mask |= 3 << (i * 2);
                    }
                    joint.flags.insert(JointFlags::ERROR);
                    self.motion_flags.insert(MotionFlags::ERROR);
                }
            } else if !joint.flags.contains(JointFlags::POS_LIMIT)
                && !joint.flags.contains(JointFlags::NEG_LIMIT)
            {
                // Off the switch: release the latched override.
                self.override_limit_mask &= !(3 << (i * 2));
            }

            if joint.flags.contains(JointFlags::AMP_FAULT) {
                if !joint.flags.contains(JointFlags::ERROR) {
                    error!(joint = i, "amplifier fault");
                }
                joint.flags.insert(JointFlags::ERROR);
                self.enabling = false;
            }

            if joint.flags.contains(JointFlags::FERROR) {
                if !joint.flags.contains(JointFlags::ERROR) {
                    error!(
                        joint = i,
                        ferror = joint.ferror,
                        limit = joint.ferror_limit,
                        "following error"
                    );
                }
                joint.flags.insert(JointFlags::ERROR);
                self.enabling = false;
            }
        }
    }

    // ── Phase 5b: mode transitions ──

    fn set_operating_mode(&mut self) {
        // Disabling.
        if !self.enabling && self.motion_flags.contains(MotionFlags::ENABLE) {
            self.planner.clear();
            for joint in self.joints.iter_mut().take(self.num_joints) {
                joint.free.enable = false;
                joint.free.curr_vel = 0.0;
                joint.cubic.drain();
                if joint.is_active() {
                    joint.flags.remove(JointFlags::ENABLED);
                    joint.flags.remove(JointFlags::HOMING);
                    joint.home_state = HomeState::Idle;
                    if joint.cfg.volatile_home {
                        joint.flags.remove(JointFlags::HOMED | JointFlags::AT_HOME);
                    }
                }
                // Joint error flags stay: they may explain the trip.
            }
            self.teleop.current_vel = [0.0; MAX_AXES];
            self.motion_flags.remove(MotionFlags::ENABLE);
        }

        // Enabling.
        if self.enabling && !self.motion_flags.contains(MotionFlags::ENABLE) {
            self.planner.set_pos(self.carte_pos_cmd);
            for joint in self.joints.iter_mut().take(self.num_joints) {
                joint.free.curr_pos = joint.pos_cmd;
                if joint.is_active() {
                    joint.flags.insert(JointFlags::ENABLED);
                    joint.flags.remove(JointFlags::HOMING);
                    joint.home_state = HomeState::Idle;
                }
                joint.flags.remove(JointFlags::ERROR);
            }
            self.motion_flags.insert(MotionFlags::ENABLE);
            self.motion_flags.remove(MotionFlags::ERROR);
        }

        let inpos = self.motion_flags.contains(MotionFlags::INPOS);

        // Entering teleop.
        if self.teleoperating && !self.motion_flags.contains(MotionFlags::TELEOP) {
            if inpos {
                self.planner.set_pos(self.carte_pos_cmd);
                for joint in self.joints.iter_mut().take(self.num_joints) {
                    joint.cubic.drain();
                }
                self.motion_flags.insert(MotionFlags::TELEOP);
                self.motion_flags.remove(MotionFlags::ERROR);
                self.teleop.current_vel = [0.0; MAX_AXES];
            } else {
                self.teleoperating = false;
            }
        } else {
            if inpos && !self.teleoperating && self.motion_flags.contains(MotionFlags::TELEOP) {
                self.motion_flags.remove(MotionFlags::TELEOP);
                if !self.coordinating {
                    for joint in self.joints.iter_mut().take(self.num_joints) {
                        joint.free.curr_pos = joint.pos_cmd;
                    }
                }
            }

            // Entering coordinated mode.
            if self.coordinating && !self.motion_flags.contains(MotionFlags::COORD) {
                if inpos {
                    self.planner.set_pos(self.carte_pos_cmd);
                    for joint in self.joints.iter_mut().take(self.num_joints) {
                        joint.cubic.drain();
                    }
                    self.overriding = false;
                    self.override_limit_mask = 0;
                    self.motion_flags.insert(MotionFlags::COORD);
                    self.motion_flags.remove(MotionFlags::TELEOP);
                    self.motion_flags.remove(MotionFlags::ERROR);
                } else {
                    self.coordinating = false;
                }
            }

            // Leaving coordinated mode for free mode.
            if !self.coordinating && self.motion_flags.contains(MotionFlags::COORD) {
                if inpos {
                    for joint in self.joints.iter_mut().take(self.num_joints) {
                        joint.free.curr_pos = joint.pos_cmd;
                        joint.free.enable = false;
                    }
                    self.motion_flags.remove(MotionFlags::COORD);
                    self.motion_flags.remove(MotionFlags::TELEOP);
                    self.motion_flags.remove(MotionFlags::ERROR);
                } else {
                    self.coordinating = true;
                }
            }
        }

        self.state = if !self.motion_flags.contains(MotionFlags::ENABLE) {
            MotionState::Disabled
        } else if self.motion_flags.contains(MotionFlags::TELEOP) {
            MotionState::Teleop
        } else if self.motion_flags.contains(MotionFlags::COORD) {
            MotionState::Coord
        } else {
            MotionState::Free
        };
    }

    // ── Phase 6: jogwheels ──

    fn handle_jogwheels(&mut self) {
        let homing_active =
            self.sequencer.is_active() || self.joints.iter().any(|j| j.is_homing());
        for (i, joint) in self.joints.iter_mut().enumerate().take(self.num_joints) {
            joint.wheel_jog_active = false;
            if !joint.is_active() {
                continue;
            }
            let jio = &self.io.joints[i];
            let new_counts = jio.jog_counts;
            let delta = new_counts - joint.old_jog_counts;
            joint.old_jog_counts = new_counts;

            if self.first_pass
                || delta == 0
                || self.state != MotionState::Free
                || !jio.jog_enable
                || homing_active
                || joint.kb_jog_active
                || self.net_feed_scale < 0.0001
            {
                continue;
            }

            let distance = delta as f64 * jio.jog_scale;
            if (distance > 0.0 && joint.flags.contains(JointFlags::POS_LIMIT))
                || (distance < 0.0 && joint.flags.contains(JointFlags::NEG_LIMIT))
            {
                continue;
            }
            let pos = joint.free.pos_cmd + distance;
            let (min, max) = joint.jog_limits();
            if pos < min || pos > max {
                continue;
            }
            joint.free.pos_cmd = pos;
            joint.free.max_vel = joint.cfg.max_velocity;
            joint.free.enable = true;
            joint.wheel_jog_active = true;
            joint.flags.remove(JointFlags::ERROR);
        }
    }

    // ── Phase 7: homing ──

    fn do_homing(&mut self) {
        if self.state != MotionState::Free {
            return;
        }
        self.sequencer.update(&mut self.joints, self.num_joints);

        for i in 0..self.num_joints {
            if !self.joints[i].is_active() {
                continue;
            }
            let input = HomingInputs {
                home_sw: self.joints[i].flags.contains(JointFlags::HOME_SW),
                on_pos_limit: self.joints[i].flags.contains(JointFlags::POS_LIMIT),
                on_neg_limit: self.joints[i].flags.contains(JointFlags::NEG_LIMIT),
                rotary_is_unlocked: self.io.machine.rotary_is_unlocked[i],
            };
            homing::update_joint(&mut self.joints[i], &input, i, self.servo_freq);
        }
    }

    fn homing_active(&self) -> bool {
        self.sequencer.is_active() || self.joints.iter().any(|j| j.is_homing())
    }

    // ── Phase 8: spindle command synthesis ──

    fn get_spindle_cmds(&mut self) {
        if self.spindle.css_factor != 0.0 && self.spindle.on {
            // Constant surface speed: spindle speed varies with the
            // working radius to hold the tangential velocity.
            let denom = self.spindle.css_xoffset - self.carte_pos_cmd.tran.x;
            let csr = self.spindle.const_speed_radius;
            let mut speed = if csr > 0.0 {
                // Speed is held constant inside the radius floor.
                if denom.abs() >= csr {
                    self.spindle.speed_rps * csr / denom
                } else {
                    self.spindle.speed_rps
                }
            } else if denom != 0.0 {
                self.spindle.css_factor / (denom * 60.0)
            } else {
                self.spindle.speed_rps
            };
            speed = speed.abs();
            let max_positive = self.spindle.speed_rps.abs();
            if speed > max_positive {
                speed = max_positive;
            }
            let direction = if self.spindle.speed_rps < 0.0 { -1.0 } else { 1.0 };
            self.spindle.speed_req_rps = speed * direction;
            self.spindle.css_error = (self.spindle.css_factor / 60.0
                - denom * self.io.machine.spindle_speed_in.abs())
                * direction;
        } else {
            self.spindle.speed_req_rps = if self.spindle.on { self.spindle.speed_rps } else { 0.0 };
            self.spindle.css_error = 0.0;
        }
    }

    // ── Phase 9: position commands ──

    fn forward_cmd_kins(&mut self) {
        let mut positions = [0.0; MAX_JOINTS];
        for (i, j) in self.joints.iter().enumerate().take(self.num_joints) {
            positions[i] = j.coarse_pos;
        }
        match self.kins.kind() {
            KinematicsKind::Identity => {
                if let Ok(pose) = self.kins.forward(&positions, &self.carte_pos_cmd) {
                    self.carte_pos_cmd = pose;
                }
                self.carte_pos_cmd_ok = self.all_homed();
            }
            KinematicsKind::Both => {
                if self.all_homed() {
                    if !self.carte_pos_cmd_ok {
                        self.carte_pos_cmd = self.world_home;
                    }
                    match self.kins.forward(&positions, &self.carte_pos_cmd) {
                        Ok(pose) => {
                            self.carte_pos_cmd = pose;
                            self.carte_pos_cmd_ok = true;
                        }
                        Err(_) => self.carte_pos_cmd_ok = false,
                    }
                } else {
                    self.carte_pos_cmd_ok = false;
                }
            }
            KinematicsKind::InverseOnly => {
                self.carte_pos_cmd_ok = false;
            }
        }
    }

    fn get_pos_cmds(&mut self) {
        match self.state {
            MotionState::Free => {
                self.motion_flags.insert(MotionFlags::INPOS);
                for joint in self.joints.iter_mut().take(self.num_joints) {
                    if !joint.is_active() {
                        continue;
                    }
                    // Homing owns the planner limits while it runs;
                    // jogs rescale from the commanded velocity so an
                    // override change takes effect mid-move.
                    if joint.home_state == HomeState::Idle && joint.kb_jog_active {
                        joint.free.max_vel =
                            (joint.jog_vel * self.net_feed_scale).min(joint.cfg.max_velocity);
                    }
                    joint.free.max_acc = joint.cfg.max_acceleration;

                    // Never jog further into a tripped hard limit.
                    let toward_pos = joint.free.pos_cmd >= joint.free.curr_pos;
                    if (toward_pos && joint.flags.contains(JointFlags::POS_LIMIT))
                        || (!toward_pos && joint.flags.contains(JointFlags::NEG_LIMIT))
                    {
                        joint.free.max_vel = 0.0;
                    }

                    joint.free.update(self.period);
                    joint.pos_cmd = joint.free.curr_pos;
                    joint.vel_cmd = joint.free.curr_vel;
                    joint.coarse_pos = joint.free.curr_pos;

                    if joint.free.active {
                        joint.flags.remove(JointFlags::INPOS);
                        self.motion_flags.remove(MotionFlags::INPOS);
                        joint.flags.remove(JointFlags::AT_HOME);
                        if self.override_limit_mask != 0 {
                            self.overriding = true;
                        }
                    } else {
                        joint.flags.insert(JointFlags::INPOS);
                        joint.kb_jog_active = false;
                    }
                }
                // Jog over an overridden limit finished: rearm trips.
                if self.overriding && self.motion_flags.contains(MotionFlags::INPOS) {
                    self.override_limit_mask = 0;
                    self.overriding = false;
                }
                self.forward_cmd_kins();
            }

            MotionState::Coord => {
                // Refill the interpolators from the trajectory
                // planner at the coarse rate.
                while self.joints[0].cubic.need_next_point() {
                    self.planner.run_cycle(
                        &mut self.io.machine,
                        self.net_feed_scale,
                        self.stepping,
                    );
                    self.carte_pos_cmd = self.planner.current_pos();
                    match self.kins.inverse(&self.carte_pos_cmd) {
                        Ok(positions) => {
                            for (i, joint) in
                                self.joints.iter_mut().enumerate().take(MAX_JOINTS)
                            {
                                joint.coarse_pos = positions[i];
                                joint.cubic.add_point(joint.coarse_pos);
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "inverse kinematics failed; aborting");
                            self.motion_flags.insert(MotionFlags::ERROR);
                            self.planner.abort();
                            for joint in self.joints.iter_mut() {
                                joint.cubic.add_point(joint.coarse_pos);
                            }
                        }
                    }
                }
                for joint in self.joints.iter_mut().take(self.num_joints) {
                    let old_pos_cmd = joint.pos_cmd;
                    let (pos, _, _) = joint.cubic.interpolate();
                    joint.pos_cmd = pos;
                    joint.vel_cmd = (joint.pos_cmd - old_pos_cmd) * self.servo_freq;
                }
                self.motion_flags.set(MotionFlags::INPOS, self.planner.is_done());
            }

            MotionState::Teleop => {
                // Integrate per-axis desired velocity through the
                // acceleration limiter.
                for (i, axis_cfg) in self.config.axes.iter().enumerate().take(MAX_AXES) {
                    let desired_acc = (self.teleop.desired_vel[i]
                        - self.teleop.current_vel[i])
                        / self.period;
                    let acc = desired_acc
                        .clamp(-axis_cfg.max_acceleration, axis_cfg.max_acceleration);
                    let vel = (self.teleop.current_vel[i] + acc * self.period)
                        .clamp(-axis_cfg.max_velocity, axis_cfg.max_velocity);
                    self.teleop.current_vel[i] = vel;
                    let new = pose_axis(&self.carte_pos_cmd, i) + vel * self.period;
                    pose_axis_set(&mut self.carte_pos_cmd, i, new);
                }

                match self.kins.inverse(&self.carte_pos_cmd) {
                    Ok(positions) => {
                        for (i, joint) in self.joints.iter_mut().enumerate().take(MAX_JOINTS) {
                            joint.coarse_pos = positions[i];
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "inverse kinematics failed in teleop");
                        self.motion_flags.insert(MotionFlags::ERROR);
                        self.teleop.desired_vel = [0.0; MAX_AXES];
                    }
                }
                let mut moving = false;
                for joint in self.joints.iter_mut().take(self.num_joints) {
                    let old_pos_cmd = joint.pos_cmd;
                    joint.pos_cmd = joint.coarse_pos;
                    joint.vel_cmd = (joint.pos_cmd - old_pos_cmd) * self.servo_freq;
                    if joint.vel_cmd.abs() > 1e-12 {
                        moving = true;
                    }
                }
                self.motion_flags.set(MotionFlags::INPOS, !moving);
            }

            MotionState::Disabled => {
                // Track feedback so enabling causes no jump.
                self.carte_pos_cmd = self.carte_pos_fb;
                for joint in self.joints.iter_mut().take(self.num_joints) {
                    joint.pos_cmd = joint.pos_fb;
                    joint.coarse_pos = joint.pos_fb;
                    joint.vel_cmd = 0.0;
                }
                self.motion_flags.insert(MotionFlags::INPOS);
            }
        }
    }

    // ── Phase 10: soft limit post-check ──

    fn check_soft_limits(&mut self) {
        // Upstream should never command past a soft limit, but two
        // cases slip through: an arc whose interior leaves the limits
        // while both endpoints are inside, and bad homing parameters
        // placing pos_cmd outside after the offset shifts.
        let mut on_limit = false;
        for (i, joint) in self.joints.iter().enumerate().take(self.num_joints) {
            if !joint.is_active() || !joint.is_homed() {
                continue;
            }
            if joint.pos_cmd > joint.cfg.max_limit {
                on_limit = true;
                if !self.on_soft_limit {
                    error!(joint = i, pos_cmd = joint.pos_cmd, "exceeded positive soft limit");
                }
            } else if joint.pos_cmd < joint.cfg.min_limit {
                on_limit = true;
                if !self.on_soft_limit {
                    error!(joint = i, pos_cmd = joint.pos_cmd, "exceeded negative soft limit");
                }
            }
        }
        if on_limit {
            if !self.on_soft_limit {
                self.motion_flags.insert(MotionFlags::ERROR);
                self.on_soft_limit = true;
            }
        } else {
            self.on_soft_limit = false;
        }
    }

    // ── Phase 11: compensation ──

    fn compute_screw_comp(&mut self) {
        for joint in self.joints.iter_mut().take(self.num_joints) {
            if !joint.is_active() {
                continue;
            }
            comp::compute_correction(joint);
            comp::ramp_filter(joint, self.period, self.net_feed_scale);
        }
    }

    // ── Phase 12: outputs and status ──

    fn output_to_io(&mut self) {
        for (i, joint) in self.joints.iter_mut().enumerate().take(self.num_joints) {
            joint.motor_pos_cmd = joint.pos_cmd + joint.backlash_filt + joint.motor_offset;
            let jio = &mut self.io.joints[i];
            jio.motor_pos_cmd = joint.motor_pos_cmd;
            jio.amp_enable = joint.flags.contains(JointFlags::ENABLED);
            jio.index_enable = joint.index_enable;
            // The coordinated planner drives rotary unlock itself;
            // homing owns it otherwise.
            if self.state != MotionState::Coord {
                self.io.machine.rotary_unlock[i] = joint.unlock_request;
            }
        }
        self.io.machine.spindle_speed_out = self.spindle.speed_req_rps
            * self.net_spindle_scale
            * self.planner.status().spindle_speed_sign;
    }

    fn update_status(&mut self) {
        let homing_active = self.homing_active();
        let snap = &mut self.status;
        snap.motion_flags = self.motion_flags.bits();
        snap.motion_state = self.state as u8;
        snap.carte_pos_cmd = self.carte_pos_cmd;
        snap.carte_pos_fb = self.carte_pos_fb;
        snap.carte_pos_cmd_ok = self.carte_pos_cmd_ok;
        snap.carte_pos_fb_ok = self.carte_pos_fb_ok;

        let ps = self.planner.status();
        snap.queue_depth = ps.depth as u16;
        snap.active_depth = ps.active_depth as u16;
        snap.queue_full = ps.queue_full;
        snap.exec_id = ps.exec_id;
        snap.motion_type = ps.motion_type as u8;
        snap.current_vel = ps.current_vel;
        snap.requested_vel = ps.requested_vel;
        snap.distance_to_go = ps.distance_to_go;
        snap.dtg = ps.dtg;
        snap.spindle_synced = ps.spindle_synced;
        snap.spindle_pos_cmd = ps.spindle_pos_cmd;

        snap.spindle_revs = self.io.machine.spindle_revs;
        snap.spindle_speed_cmd = self.io.machine.spindle_speed_out;
        snap.spindle_is_atspeed = self.io.machine.spindle_is_atspeed;
        snap.spindle_css_error = self.spindle.css_error;

        snap.probe_state = match (self.probe.is_probing(), self.probe.tripped) {
            (false, _) => {
                if self.probe.tripped {
                    ProbeSnapState::Tripped
                } else {
                    ProbeSnapState::Idle
                }
            }
            (true, true) => ProbeSnapState::Tripped,
            (true, false) => ProbeSnapState::Probing,
        };
        snap.probe_tripped = self.probe.tripped;

        snap.homing_active = homing_active;
        snap.homing_sequence_state = self.sequencer.state as u8;
        snap.on_soft_limit = self.on_soft_limit;
        snap.override_limit_mask = self.override_limit_mask;
        snap.net_feed_scale = self.net_feed_scale;
        snap.net_spindle_scale = self.net_spindle_scale;
        snap.overruns = self.stats.overruns;

        for (i, joint) in self.joints.iter().enumerate().take(self.num_joints) {
            let js = &mut snap.joints[i];
            js.flags = joint.flags.bits();
            js.home_state = joint.home_state.code();
            js.pos_cmd = joint.pos_cmd;
            js.pos_fb = joint.pos_fb;
            js.vel_cmd = joint.vel_cmd;
            js.ferror = joint.ferror;
            js.ferror_high_mark = joint.ferror_high_mark;
            js.min_pos_limit = joint.cfg.min_limit;
            js.max_pos_limit = joint.cfg.max_limit;
            js.home_offset = joint.cfg.home_offset;
        }
        snap.synch_di = self.io.machine.synch_di;
        snap.synch_do = self.io.machine.synch_do;
        snap.analog_in = self.io.machine.analog_in;
        snap.analog_out = self.io.machine.analog_out;

        // Single-stepping: pause again once the stepped motion id has
        // passed.
        if self.stepping && self.id_for_step != ps.exec_id {
            self.planner.pause();
            self.stepping = false;
        }
    }
}

// ─── RT Setup ───────────────────────────────────────────────────────

/// Errors during RT setup.
#[derive(Debug, thiserror::Error)]
pub enum RtSetupError {
    #[error("RT setup: {0}")]
    Failed(String),
}

/// Lock all current and future pages. No-op without the `rt` feature.
#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), RtSetupError> {
    use nix::sys::mman::{MlockAllFlags, mlockall};
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
        .map_err(|e| RtSetupError::Failed(format!("mlockall: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), RtSetupError> {
    Ok(())
}

/// Prefault stack pages so the loop never page-faults.
fn prefault_stack() {
    let mut buf = [0u8; 256 * 1024];
    for byte in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

/// Pin the thread to one CPU. No-op without the `rt` feature.
#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), RtSetupError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;
    let mut set = CpuSet::new();
    set.set(cpu)
        .map_err(|e| RtSetupError::Failed(format!("CpuSet::set({cpu}): {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|e| RtSetupError::Failed(format!("sched_setaffinity: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), RtSetupError> {
    Ok(())
}

/// SCHED_FIFO at the given priority. No-op without the `rt` feature.
#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), RtSetupError> {
    let param = libc::sched_param { sched_priority: priority };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(RtSetupError::Failed(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}): {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), RtSetupError> {
    Ok(())
}

/// Full RT setup sequence; call before entering the loop.
pub fn rt_setup(cpu_core: usize, rt_priority: i32) -> Result<(), RtSetupError> {
    rt_mlockall()?;
    prefault_stack();
    rt_set_affinity(cpu_core)?;
    rt_set_scheduler(rt_priority)?;
    Ok(())
}

/// Drive the controller for `max_cycles` cycles (0 = forever) with
/// wall-clock pacing. Production uses `clock_nanosleep` absolute-time
/// pacing behind the `rt` feature; this simulation loop sleeps
/// relative and accepts drift.
pub fn run_sim_loop(controller: &mut ServoController, max_cycles: u64) {
    use std::time::{Duration, Instant};
    let period = Duration::from_secs_f64(controller.period());
    let epoch = Instant::now();
    let mut count = 0u64;
    info!(period_s = controller.period(), "entering simulation servo loop");
    loop {
        let start = Instant::now();
        controller.run_cycle((start - epoch).as_nanos() as i64);
        controller.stats.record(start.elapsed().as_nanos() as i64);
        count += 1;
        if max_cycles != 0 && count >= max_cycles {
            return;
        }
        if let Some(remaining) = period.checked_sub(start.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
