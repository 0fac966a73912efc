//! Homing: per-joint state machines and the multi-joint sequencer.
//!
//! Each joint homes independently through a state machine rooted at
//! `Idle`. The exact path depends on configuration: optional rotary
//! unlock, initial backoff when starting on the switch, a fast search
//! at `home_search_vel`, a coarse coordinate set at the trip, a final
//! backoff, a slow latch pass at `home_latch_vel` (rising or falling
//! edge depending on whether the two velocities agree in sign), an
//! optional index-pulse capture with encoder reset, the final move to
//! the configured `home` coordinate, and an optional rotary relock.
//!
//! Waiting is expressed by remaining in the same state across cycles;
//! nothing here blocks. Offset arithmetic moves the joint coordinate
//! system without moving the motor: `pos_cmd`, `pos_fb` and the free
//! planner shift together while `motor_offset` absorbs the
//! difference.

use cmc_common::consts::HOME_SETTLE_DELAY;
use cmc_common::flags::JointFlags;
use tracing::error;

use crate::joint::JointRuntime;

// ─── States ─────────────────────────────────────────────────────────

/// Per-joint homing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HomeState {
    #[default]
    Idle = 0,
    Start,
    Unlock,
    UnlockWait,
    InitialBackoffStart,
    InitialBackoffWait,
    InitialSearchStart,
    InitialSearchWait,
    SetCoarsePosition,
    FinalBackoffStart,
    FinalBackoffWait,
    RiseSearchStart,
    RiseSearchWait,
    FallSearchStart,
    FallSearchWait,
    SetSwitchPosition,
    IndexOnlyStart,
    IndexSearchStart,
    IndexSearchWait,
    SetIndexPosition,
    FinalMoveStart,
    FinalMoveWait,
    Lock,
    LockWait,
    Finished,
    Abort,
}

impl HomeState {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Switch and handshake inputs for one joint's homing update.
#[derive(Debug, Clone, Copy, Default)]
pub struct HomingInputs {
    pub home_sw: bool,
    pub on_pos_limit: bool,
    pub on_neg_limit: bool,
    pub rotary_is_unlocked: bool,
}

// ─── Helpers ────────────────────────────────────────────────────────

/// Start a homing move at `vel`. The length is twice the joint's
/// range; a switch or index event stops it long before that.
fn home_start_move(joint: &mut JointRuntime, vel: f64) {
    let range = 2.0 * (joint.cfg.max_limit - joint.cfg.min_limit);
    joint.free.pos_cmd = joint.pos_cmd + range * vel.signum();
    joint.free.max_vel = vel.abs();
    joint.free.enable = true;
}

/// Shift the joint coordinate system so the current feedback reads
/// `anchor`. The motor does not move.
fn shift_coordinates(joint: &mut JointRuntime, anchor: f64, at_pos: f64) {
    let offset = anchor - at_pos;
    joint.pos_cmd += offset;
    joint.pos_fb += offset;
    joint.free.curr_pos += offset;
    joint.free.pos_cmd += offset;
    joint.motor_offset -= offset;
}

/// Limit and end-of-move supervision during homing motion. Returns
/// false when the homing attempt must abort.
fn moving_checks(joint: &mut JointRuntime, input: &HomingInputs, joint_num: usize) -> bool {
    if (input.on_pos_limit || input.on_neg_limit) && !joint.cfg.home_ignore_limits {
        error!(joint = joint_num, state = ?joint.home_state, "hit limit during homing move");
        return false;
    }
    if !joint.free.active {
        error!(
            joint = joint_num,
            state = ?joint.home_state,
            "homing move ended without the expected event"
        );
        return false;
    }
    true
}

// ─── Per-Joint State Machine ────────────────────────────────────────

/// Advance one joint's homing machine by one cycle.
///
/// `servo_freq` is 1/period, for the settle-delay countdowns.
pub fn update_joint(
    joint: &mut JointRuntime,
    input: &HomingInputs,
    joint_num: usize,
    servo_freq: f64,
) {
    let settle_cycles = (HOME_SETTLE_DELAY * servo_freq) as u64;

    // States that complete instantly chain within the same cycle.
    let mut immediate = true;
    while immediate {
        immediate = false;
        match joint.home_state {
            HomeState::Idle => {}

            HomeState::Start => {
                joint.flags.insert(JointFlags::HOMING);
                joint.flags.remove(JointFlags::HOMED | JointFlags::AT_HOME);
                joint.free.enable = false;
                joint.home_pause_timer = 0;
                if joint.cfg.home_unlock_first {
                    joint.home_state = HomeState::Unlock;
                } else {
                    joint.home_state = HomeState::UnlockWait;
                }
                immediate = true;
            }

            HomeState::Unlock => {
                joint.unlock_request = true;
                joint.home_state = HomeState::UnlockWait;
            }

            HomeState::UnlockWait => {
                if joint.cfg.home_unlock_first && !input.rotary_is_unlocked {
                    break;
                }
                if joint.cfg.home_search_vel == 0.0 {
                    if joint.cfg.home_latch_vel == 0.0 {
                        // Home at the current position.
                        joint.switch_latch_pos = joint.pos_fb;
                        joint.home_state = HomeState::SetSwitchPosition;
                        immediate = true;
                    } else if joint.cfg.home_use_index {
                        joint.home_state = HomeState::IndexOnlyStart;
                        immediate = true;
                    } else {
                        error!(
                            joint = joint_num,
                            "invalid homing config: latch velocity needs a search or an index"
                        );
                        joint.home_state = HomeState::Abort;
                        immediate = true;
                    }
                } else if joint.cfg.home_latch_vel != 0.0 {
                    joint.home_state = HomeState::InitialSearchStart;
                    immediate = true;
                } else {
                    error!(
                        joint = joint_num,
                        "invalid homing config: search velocity needs a latch velocity"
                    );
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                }
            }

            HomeState::InitialBackoffStart => {
                home_start_move(joint, -joint.cfg.home_search_vel);
                joint.home_state = HomeState::InitialBackoffWait;
            }

            HomeState::InitialBackoffWait => {
                if !input.home_sw {
                    joint.free.enable = false;
                    joint.home_state = HomeState::InitialSearchStart;
                    immediate = true;
                } else if !moving_checks(joint, input, joint_num) {
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                }
            }

            HomeState::InitialSearchStart => {
                if input.home_sw {
                    // Already on the switch: back off first.
                    joint.home_state = HomeState::InitialBackoffStart;
                    immediate = true;
                } else {
                    home_start_move(joint, joint.cfg.home_search_vel);
                    joint.home_state = HomeState::InitialSearchWait;
                }
            }

            HomeState::InitialSearchWait => {
                if input.home_sw {
                    joint.switch_latch_pos = joint.pos_fb;
                    joint.home_state = HomeState::SetCoarsePosition;
                    immediate = true;
                } else if !moving_checks(joint, input, joint_num) {
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                }
            }

            HomeState::SetCoarsePosition => {
                // Approximately home: anchor the coordinate system so
                // screw compensation works from here on.
                shift_coordinates(joint, joint.cfg.home_offset, joint.switch_latch_pos);
                if joint.cfg.home_search_vel * joint.cfg.home_latch_vel > 0.0 {
                    // Same direction: back off and relatch on the
                    // rising edge.
                    joint.home_state = HomeState::FinalBackoffStart;
                } else {
                    // Opposite: latch on the falling edge directly.
                    joint.home_state = HomeState::FallSearchStart;
                }
                immediate = true;
            }

            HomeState::FinalBackoffStart => {
                if !input.home_sw {
                    error!(joint = joint_num, "home switch inactive before backoff move");
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                } else {
                    home_start_move(joint, -joint.cfg.home_search_vel);
                    joint.home_state = HomeState::FinalBackoffWait;
                }
            }

            HomeState::FinalBackoffWait => {
                if !input.home_sw {
                    joint.free.enable = false;
                    joint.home_state = HomeState::RiseSearchStart;
                    immediate = true;
                } else if !moving_checks(joint, input, joint_num) {
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                }
            }

            HomeState::RiseSearchStart => {
                if input.home_sw {
                    error!(joint = joint_num, "home switch active before latch move");
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                } else {
                    home_start_move(joint, joint.cfg.home_latch_vel);
                    joint.home_state = HomeState::RiseSearchWait;
                }
            }

            HomeState::RiseSearchWait => {
                if input.home_sw {
                    joint.switch_latch_pos = joint.pos_fb;
                    joint.home_state = if joint.cfg.home_use_index {
                        HomeState::IndexSearchStart
                    } else {
                        HomeState::SetSwitchPosition
                    };
                    immediate = true;
                } else if !moving_checks(joint, input, joint_num) {
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                }
            }

            HomeState::FallSearchStart => {
                if !input.home_sw {
                    error!(joint = joint_num, "home switch inactive before latch move");
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                } else {
                    home_start_move(joint, joint.cfg.home_latch_vel);
                    joint.home_state = HomeState::FallSearchWait;
                }
            }

            HomeState::FallSearchWait => {
                if !input.home_sw {
                    joint.switch_latch_pos = joint.pos_fb;
                    joint.home_state = if joint.cfg.home_use_index {
                        HomeState::IndexSearchStart
                    } else {
                        HomeState::SetSwitchPosition
                    };
                    immediate = true;
                } else if !moving_checks(joint, input, joint_num) {
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                }
            }

            HomeState::SetSwitchPosition => {
                shift_coordinates(joint, joint.cfg.home_offset, joint.switch_latch_pos);
                joint.home_state = HomeState::FinalMoveStart;
                immediate = true;
            }

            HomeState::IndexOnlyStart => {
                // Pre-positioned near home; only the index is needed.
                if joint.free.active {
                    joint.home_pause_timer = 0;
                    break;
                }
                if joint.home_pause_timer < settle_cycles {
                    joint.home_pause_timer += 1;
                    break;
                }
                joint.home_pause_timer = 0;
                shift_coordinates(joint, joint.cfg.home_offset, joint.pos_fb);
                joint.index_enable = true;
                home_start_move(joint, joint.cfg.home_latch_vel);
                joint.home_state = HomeState::IndexSearchWait;
            }

            HomeState::IndexSearchStart => {
                // Arm the encoder: it zeroes its counter and clears
                // the handshake at the next index pulse.
                joint.index_enable = true;
                joint.home_state = HomeState::IndexSearchWait;
                immediate = true;
            }

            HomeState::IndexSearchWait => {
                if !joint.index_enable {
                    joint.free.enable = false;
                    joint.home_state = HomeState::SetIndexPosition;
                    immediate = true;
                } else if !moving_checks(joint, input, joint_num) {
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                }
            }

            HomeState::SetIndexPosition => {
                // The encoder count is now zero at the index pulse:
                // make that point read `home_offset`.
                joint.motor_offset = -joint.cfg.home_offset;
                joint.pos_fb = joint.motor_pos_fb - (joint.backlash_filt + joint.motor_offset);
                joint.pos_cmd = joint.pos_fb;
                joint.free.curr_pos = joint.pos_fb;
                joint.free.pos_cmd = joint.pos_fb;
                joint.home_state = HomeState::FinalMoveStart;
                immediate = true;
            }

            HomeState::FinalMoveStart => {
                if joint.free.active {
                    joint.home_pause_timer = 0;
                    break;
                }
                if joint.home_pause_timer < settle_cycles {
                    joint.home_pause_timer += 1;
                    break;
                }
                joint.home_pause_timer = 0;
                joint.free.pos_cmd = joint.cfg.home;
                joint.free.max_vel = if joint.cfg.home_final_vel > 0.0 {
                    joint.cfg.home_final_vel.abs().min(joint.cfg.max_velocity)
                } else {
                    joint.cfg.max_velocity
                };
                joint.free.enable = true;
                joint.home_state = HomeState::FinalMoveWait;
            }

            HomeState::FinalMoveWait => {
                if !joint.free.active {
                    joint.free.enable = false;
                    joint.home_state = HomeState::Lock;
                    immediate = true;
                } else if (input.on_pos_limit || input.on_neg_limit)
                    && !joint.cfg.home_ignore_limits
                {
                    error!(joint = joint_num, "hit limit during final homing move");
                    joint.home_state = HomeState::Abort;
                    immediate = true;
                }
            }

            HomeState::Lock => {
                if joint.cfg.home_unlock_first {
                    joint.unlock_request = false;
                } else {
                    immediate = true;
                }
                joint.home_state = HomeState::LockWait;
            }

            HomeState::LockWait => {
                if joint.cfg.home_unlock_first && input.rotary_is_unlocked {
                    break;
                }
                joint.home_state = HomeState::Finished;
                immediate = true;
            }

            HomeState::Finished => {
                joint.flags.remove(JointFlags::HOMING);
                joint.flags.insert(JointFlags::HOMED | JointFlags::AT_HOME);
                joint.home_state = HomeState::Idle;
            }

            HomeState::Abort => {
                joint.flags.remove(JointFlags::HOMING | JointFlags::HOMED | JointFlags::AT_HOME);
                joint.free.enable = false;
                joint.index_enable = false;
                joint.unlock_request = false;
                joint.home_state = HomeState::Idle;
            }
        }
    }
}

// ─── Sequence Driver ────────────────────────────────────────────────

/// Multi-joint homing sequence state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SequenceState {
    #[default]
    Idle = 0,
    Start,
    StartJoints,
    WaitJoints,
}

/// Coordinates home-all: joints sharing a `home_sequence` value start
/// together; the driver advances to the next value once every joint
/// at the current one has finished. Any joint that stops homing
/// without reaching home aborts the whole sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct HomingSequencer {
    pub state: SequenceState,
    current_sequence: i32,
}

impl HomingSequencer {
    /// Request a home-all.
    pub fn start(&mut self) {
        self.state = SequenceState::Start;
    }

    pub fn abort(&mut self) {
        self.state = SequenceState::Idle;
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != SequenceState::Idle
    }

    /// Advance the sequencer one cycle.
    pub fn update(&mut self, joints: &mut [JointRuntime], num_joints: usize) {
        match self.state {
            SequenceState::Idle => {}

            SequenceState::Start => {
                for joint in joints.iter().take(num_joints) {
                    if joint.is_active() && joint.home_state != HomeState::Idle {
                        // A home is already in progress; refuse the
                        // home-all.
                        self.state = SequenceState::Idle;
                        return;
                    }
                }
                self.current_sequence = 0;
                self.state = SequenceState::StartJoints;
                self.update(joints, num_joints);
            }

            SequenceState::StartJoints => {
                let mut seen = 0;
                for joint in joints.iter_mut().take(num_joints) {
                    if joint.is_active() && joint.cfg.home_sequence == self.current_sequence {
                        joint.free.enable = false;
                        joint.home_state = HomeState::Start;
                        seen += 1;
                    }
                }
                self.state = if seen > 0 {
                    SequenceState::WaitJoints
                } else {
                    // No joints carry this sequence number: done.
                    SequenceState::Idle
                };
            }

            SequenceState::WaitJoints => {
                let mut busy = false;
                for joint in joints.iter().take(num_joints) {
                    if !joint.is_active() || joint.cfg.home_sequence != self.current_sequence {
                        continue;
                    }
                    if joint.home_state != HomeState::Idle {
                        busy = true;
                        continue;
                    }
                    if !joint.flags.contains(JointFlags::AT_HOME) {
                        // Finished homing but not at home: it failed.
                        // Abort the entire sequence.
                        error!(
                            sequence = self.current_sequence,
                            "joint failed to home; aborting home-all"
                        );
                        self.state = SequenceState::Idle;
                        return;
                    }
                }
                if !busy {
                    self.current_sequence += 1;
                    self.state = SequenceState::StartJoints;
                }
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cmc_common::config::{CompFileType, CompTable, JointConfig, JointType};

    const DT: f64 = 0.001;
    const FREQ: f64 = 1000.0;

    fn cfg() -> JointConfig {
        JointConfig {
            joint_type: JointType::Linear,
            min_limit: -100.0,
            max_limit: 100.0,
            max_velocity: 50.0,
            max_acceleration: 2000.0,
            max_jerk: 20000.0,
            ferror: 1.0,
            min_ferror: 0.1,
            backlash: 0.0,
            comp_file: None,
            comp_file_type: CompFileType::Triplet,
            home: 0.0,
            home_offset: 0.0,
            home_search_vel: 10.0,
            home_latch_vel: 1.0,
            home_final_vel: 0.0,
            home_sequence: 0,
            home_use_index: false,
            home_ignore_limits: false,
            home_is_shared: false,
            home_unlock_first: false,
            volatile_home: false,
            locking_indexer: false,
        }
    }

    /// Physical rig: the switch trips above `switch_pos` (in machine
    /// coordinates); the encoder zeroes at grid lines when armed.
    struct Rig {
        joint: JointRuntime,
        /// Machine-frame position.
        physical: f64,
        /// Encoder zero in the machine frame.
        encoder_zero: f64,
        switch_pos: f64,
        states: Vec<HomeState>,
    }

    impl Rig {
        fn new(cfg: JointConfig, start_physical: f64, switch_pos: f64) -> Self {
            let mut joint = JointRuntime::with_table(cfg, CompTable::default());
            joint.pos_cmd = start_physical;
            joint.pos_fb = start_physical;
            joint.free.curr_pos = start_physical;
            joint.motor_pos_fb = start_physical;
            Self { joint, physical: start_physical, encoder_zero: 0.0, switch_pos, states: Vec::new() }
        }

        fn on_switch(&self) -> bool {
            self.physical >= self.switch_pos
        }

        /// One full cycle: homing update, free planner, ideal
        /// following, encoder index emulation.
        fn cycle(&mut self) {
            let input = HomingInputs {
                home_sw: self.on_switch(),
                on_pos_limit: false,
                on_neg_limit: false,
                rotary_is_unlocked: false,
            };
            update_joint(&mut self.joint, &input, 0, FREQ);
            if self.states.last() != Some(&self.joint.home_state) {
                self.states.push(self.joint.home_state);
            }

            let before = self.joint.free.curr_pos;
            self.joint.free.update(DT);
            let delta = self.joint.free.curr_pos - before;
            self.physical += delta;

            // Index pulse: armed encoder zeroes at integer grid lines.
            if self.joint.index_enable {
                let prev = self.physical - delta;
                let crossed = prev.floor() != self.physical.floor()
                    || (self.physical - self.physical.floor()).abs() < 1e-12;
                if crossed && delta != 0.0 {
                    self.encoder_zero = self.physical.floor().max(prev.floor() + 1.0);
                    self.joint.index_enable = false;
                }
            }

            // Ideal following.
            self.joint.pos_cmd = self.joint.free.curr_pos;
            self.joint.pos_fb = self.joint.pos_cmd;
            self.joint.motor_pos_fb = self.physical - self.encoder_zero;
        }

        fn run_until_idle(&mut self, max: usize) {
            // Kick off.
            self.joint.home_state = HomeState::Start;
            for _ in 0..max {
                self.cycle();
                if self.joint.home_state == HomeState::Idle {
                    return;
                }
            }
            panic!("homing did not finish; states seen: {:?}", self.states);
        }
    }

    // ── Switch homing, off-switch start ──

    #[test]
    fn switch_homing_from_below() {
        let mut rig = Rig::new(cfg(), -5.0, 2.0);
        rig.run_until_idle(200_000);
        assert!(rig.joint.flags.contains(JointFlags::HOMED));
        assert!(rig.joint.flags.contains(JointFlags::AT_HOME));
        // Same-sign search and latch: rising-edge relatch.
        assert!(rig.states.contains(&HomeState::InitialSearchStart));
        assert!(rig.states.contains(&HomeState::SetCoarsePosition));
        assert!(rig.states.contains(&HomeState::FinalBackoffStart));
        assert!(rig.states.contains(&HomeState::RiseSearchWait));
        assert!(rig.states.contains(&HomeState::Finished));
        assert!(!rig.states.contains(&HomeState::FallSearchStart));
        // Finished at the home coordinate; switch trip reads
        // home_offset, so home (0) sits below the switch.
        assert!((rig.joint.pos_cmd - 0.0).abs() < 1e-6);
    }

    // ── Switch homing, on-switch start (scenario: initial backoff) ──

    #[test]
    fn switch_homing_starting_on_switch_backs_off_first() {
        let mut rig = Rig::new(cfg(), 5.0, 2.0);
        rig.run_until_idle(200_000);
        assert!(rig.joint.flags.contains(JointFlags::HOMED));
        let backoff_idx = rig
            .states
            .iter()
            .position(|s| *s == HomeState::InitialBackoffStart)
            .expect("no initial backoff");
        let search_idx = rig
            .states
            .iter()
            .position(|s| *s == HomeState::InitialSearchWait)
            .expect("no initial search");
        assert!(backoff_idx < search_idx);
    }

    // ── Opposite-sign latch: falling edge ──

    #[test]
    fn opposite_sign_latch_uses_falling_edge() {
        let mut c = cfg();
        c.home_latch_vel = -1.0;
        let mut rig = Rig::new(c, -5.0, 2.0);
        rig.run_until_idle(200_000);
        assert!(rig.joint.flags.contains(JointFlags::HOMED));
        assert!(rig.states.contains(&HomeState::FallSearchWait));
        assert!(!rig.states.contains(&HomeState::RiseSearchStart));
    }

    // ── Index homing (scenario 5) ──

    #[test]
    fn switch_and_index_homing_state_walk() {
        let mut c = cfg();
        c.home_use_index = true;
        c.home_offset = 1.5;
        c.home = 1.5;
        // Start on the switch to exercise the full walk.
        let mut rig = Rig::new(c, 5.0, 2.0);
        rig.run_until_idle(400_000);

        let expected_order = [
            HomeState::InitialBackoffStart,
            HomeState::InitialSearchWait,
            HomeState::SetCoarsePosition,
            HomeState::FinalBackoffStart,
            HomeState::RiseSearchWait,
            HomeState::IndexSearchWait,
            HomeState::SetIndexPosition,
            HomeState::FinalMoveWait,
            HomeState::Finished,
        ];
        let mut cursor = 0;
        for s in &rig.states {
            if cursor < expected_order.len() && *s == expected_order[cursor] {
                cursor += 1;
            }
        }
        assert_eq!(
            cursor,
            expected_order.len(),
            "state walk incomplete: {:?}",
            rig.states
        );

        // The index line reads home_offset; the joint parked at home.
        assert!(rig.joint.flags.contains(JointFlags::HOMED));
        assert!((rig.joint.pos_cmd - 1.5).abs() < 1e-6, "parked at {}", rig.joint.pos_cmd);
        // Joint frame anchored to the encoder index: motor_offset is
        // exactly -home_offset.
        assert!((rig.joint.motor_offset + 1.5).abs() < 1e-9);
    }

    // ── Home at current position ──

    #[test]
    fn zero_velocities_home_in_place() {
        let mut c = cfg();
        c.home_search_vel = 0.0;
        c.home_latch_vel = 0.0;
        c.home_offset = 7.0;
        c.home = 7.0;
        let mut rig = Rig::new(c, 3.0, 1e9);
        rig.run_until_idle(10_000);
        assert!(rig.joint.flags.contains(JointFlags::HOMED));
        // Current position now reads home_offset; no motion needed.
        assert!((rig.joint.pos_cmd - 7.0).abs() < 1e-6);
        assert!((rig.physical - 3.0).abs() < 1e-6, "machine moved while homing in place");
    }

    // ── Limit abort ──

    #[test]
    fn limit_trip_aborts_homing() {
        let mut rig = Rig::new(cfg(), -5.0, 1e9); // switch unreachable
        rig.joint.home_state = HomeState::Start;
        for _ in 0..100 {
            rig.cycle();
        }
        // Force a limit trip mid-search.
        let input = HomingInputs {
            home_sw: false,
            on_pos_limit: true,
            on_neg_limit: false,
            rotary_is_unlocked: false,
        };
        update_joint(&mut rig.joint, &input, 0, FREQ);
        assert_eq!(rig.joint.home_state, HomeState::Idle);
        assert!(!rig.joint.flags.contains(JointFlags::HOMED));
        assert!(!rig.joint.flags.contains(JointFlags::HOMING));
    }

    #[test]
    fn ignore_limits_keeps_searching() {
        let mut c = cfg();
        c.home_ignore_limits = true;
        let mut rig = Rig::new(c, -5.0, 2.0);
        rig.joint.home_state = HomeState::Start;
        rig.cycle();
        let input = HomingInputs {
            home_sw: false,
            on_pos_limit: true,
            on_neg_limit: false,
            rotary_is_unlocked: false,
        };
        update_joint(&mut rig.joint, &input, 0, FREQ);
        assert_ne!(rig.joint.home_state, HomeState::Idle);
    }

    // ── Rotary unlock path ──

    #[test]
    fn unlock_first_waits_for_confirmation() {
        let mut c = cfg();
        c.home_unlock_first = true;
        c.home_search_vel = 0.0;
        c.home_latch_vel = 0.0;
        let mut joint = JointRuntime::with_table(c, CompTable::default());
        joint.home_state = HomeState::Start;

        let locked = HomingInputs::default();
        update_joint(&mut joint, &locked, 0, FREQ);
        assert!(joint.unlock_request);
        assert_eq!(joint.home_state, HomeState::UnlockWait);

        // Stays waiting while locked.
        update_joint(&mut joint, &locked, 0, FREQ);
        assert_eq!(joint.home_state, HomeState::UnlockWait);

        // Unlock confirmed: homes in place, then relocks.
        let unlocked = HomingInputs { rotary_is_unlocked: true, ..Default::default() };
        for _ in 0..1_000 {
            update_joint(&mut joint, &unlocked, 0, FREQ);
            if joint.home_state == HomeState::LockWait {
                break;
            }
        }
        assert_eq!(joint.home_state, HomeState::LockWait);
        assert!(!joint.unlock_request);

        // Relock confirmed.
        update_joint(&mut joint, &locked, 0, FREQ);
        assert_eq!(joint.home_state, HomeState::Idle);
        assert!(joint.flags.contains(JointFlags::HOMED));
    }

    // ── Sequencer ──

    fn seq_joint(sequence: i32) -> JointRuntime {
        let mut c = cfg();
        c.home_sequence = sequence;
        c.home_search_vel = 0.0;
        c.home_latch_vel = 0.0;
        JointRuntime::with_table(c, CompTable::default())
    }

    fn drive(joints: &mut [JointRuntime], seq: &mut HomingSequencer, n: usize) {
        seq.update(joints, n);
        for j in joints.iter_mut().take(n) {
            let input = HomingInputs::default();
            update_joint(j, &input, 0, FREQ);
        }
    }

    #[test]
    fn sequence_runs_groups_in_order() {
        let mut joints = vec![seq_joint(0), seq_joint(1), seq_joint(0)];
        let mut seq = HomingSequencer::default();
        seq.start();

        let mut started_group1_before_group0_done = false;
        for _ in 0..1_000 {
            // Detect premature group-1 start.
            let g0_done = joints[0].is_homed() && joints[2].is_homed();
            if joints[1].is_homing() && !g0_done {
                started_group1_before_group0_done = true;
            }
            drive(&mut joints, &mut seq, 3);
            if !seq.is_active() {
                break;
            }
        }
        assert!(!seq.is_active());
        assert!(!started_group1_before_group0_done);
        for j in &joints {
            assert!(j.is_homed());
        }
    }

    #[test]
    fn sequence_aborts_when_a_joint_fails() {
        let mut good = seq_joint(0);
        // This joint will fail: invalid config caught at start.
        let mut bad_cfg = cfg();
        bad_cfg.home_sequence = 0;
        bad_cfg.home_search_vel = 10.0;
        bad_cfg.home_latch_vel = 0.0;
        let bad = JointRuntime::with_table(bad_cfg, CompTable::default());
        good.cfg.home_sequence = 0;

        let mut joints = vec![good, bad];
        let mut seq = HomingSequencer::default();
        seq.start();
        for _ in 0..1_000 {
            drive(&mut joints, &mut seq, 2);
            if !seq.is_active() {
                break;
            }
        }
        assert!(!seq.is_active());
        // The failing joint never reached home.
        assert!(!joints[1].is_homed());
    }

    #[test]
    fn sequence_refused_while_joint_homing() {
        let mut joints = vec![seq_joint(0)];
        joints[0].home_state = HomeState::InitialSearchWait;
        let mut seq = HomingSequencer::default();
        seq.start();
        seq.update(&mut joints, 1);
        assert!(!seq.is_active());
    }
}
