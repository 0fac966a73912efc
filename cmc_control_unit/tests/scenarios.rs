//! End-to-end scenarios driven through the full servo controller:
//! feedback in, motor commands out, with simulated switches, encoder
//! index pulses and a spindle where a scenario needs them.

use cmc_common::config::{AxisConfig, JointConfig, MachineConfig, TrajConfig};
use cmc_common::consts::MAX_JOINTS;
use cmc_common::flags::{FeedEnables, JointFlags, MotionFlags};
use cmc_common::pose::{Cartesian, Pose};
use cmc_control_unit::command::{Command, ModeRequest};
use cmc_control_unit::cycle::{MotionState, ServoController};
use cmc_control_unit::homing::HomeState;
use cmc_motion::kinematics::TrivialKins;
use cmc_motion::segment::{CanonMotionType, TermCond};

const DT: f64 = 0.001;

fn joint_cfg() -> JointConfig {
    JointConfig {
        joint_type: Default::default(),
        min_limit: -500.0,
        max_limit: 500.0,
        max_velocity: 50.0,
        max_acceleration: 500.0,
        max_jerk: 5000.0,
        ferror: 50.0,
        min_ferror: 10.0,
        backlash: 0.0,
        comp_file: None,
        comp_file_type: Default::default(),
        home: 0.0,
        home_offset: 0.0,
        home_search_vel: 0.0,
        home_latch_vel: 0.0,
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

fn machine_config() -> MachineConfig {
    MachineConfig {
        traj: TrajConfig {
            cycle_time: DT,
            default_velocity: 10.0,
            max_velocity: 100.0,
            max_acceleration: 1000.0,
            max_jerk: 10000.0,
            queue_size: 32,
            interpolation_rate: 1,
        },
        joints: vec![joint_cfg(); 4],
        axes: vec![AxisConfig::default(); 4],
    }
}

struct Rig {
    ctl: ServoController,
    clock_ns: i64,
}

impl Rig {
    fn new(config: MachineConfig) -> Self {
        let ctl = ServoController::new(config, Box::new(TrivialKins)).unwrap();
        Self { ctl, clock_ns: 0 }
    }

    /// One cycle with perfect motor following.
    fn cycle(&mut self) {
        for i in 0..MAX_JOINTS {
            self.ctl.io.joints[i].motor_pos_fb = self.ctl.io.joints[i].motor_pos_cmd;
        }
        self.clock_ns += 1_000_000;
        self.ctl.run_cycle(self.clock_ns);
    }

    fn enable_and_home(&mut self) {
        self.ctl.io.machine.enable = true;
        self.ctl.mailbox.submit(Command::Enable);
        self.cycle();
        self.cycle();
        assert_eq!(self.ctl.motion_state(), MotionState::Free);

        self.ctl.mailbox.submit(Command::Home { joint: None });
        for _ in 0..2_000 {
            self.cycle();
            if !self.ctl.status.homing_active && self.ctl.joints[0].is_homed() {
                break;
            }
        }
        assert!(self.ctl.joints.iter().take(4).all(|j| j.is_homed()));
    }

    fn to_coord(&mut self) {
        self.ctl.mailbox.submit(Command::SetMode(ModeRequest::Coord));
        self.cycle();
        self.cycle();
        assert_eq!(self.ctl.motion_state(), MotionState::Coord);
    }

    fn add_line(&mut self, end: Pose, vel: f64, acc: f64) {
        self.ctl
            .planner
            .add_line(
                end,
                CanonMotionType::Feed,
                vel,
                100.0,
                acc,
                FeedEnables::all(),
                false,
                None,
            )
            .unwrap();
    }

    fn in_position(&self) -> bool {
        self.ctl.planner.is_done()
            && self.ctl.status.motion_flags & MotionFlags::INPOS.bits() != 0
    }
}

fn pose(x: f64, y: f64, z: f64) -> Pose {
    Pose { tran: Cartesian::new(x, y, z), ..Pose::ZERO }
}

// ─── Scenario 1: single-line reach ──────────────────────────────────

#[test]
fn single_line_reach() {
    let mut rig = Rig::new(machine_config());
    rig.enable_and_home();
    rig.to_coord();

    rig.add_line(pose(100.0, 0.0, 0.0), 10.0, 100.0);

    let mut cycles = 0u64;
    while !rig.in_position() {
        rig.cycle();
        cycles += 1;
        assert!(cycles < 60_000, "line never completed");
    }
    // Endpoint exact.
    assert!((rig.ctl.status.carte_pos_cmd.tran.x - 100.0).abs() < 1e-6);
    assert!((rig.ctl.io.joints[0].motor_pos_cmd - 100.0).abs() < 1e-6);

    // Duration within 5% of the ideal jerk-limited profile: two
    // 0.2 s ramp pairs covering 1.0 unit each, 98 units of cruise at
    // 10 units/s.
    let ideal_s = 10.2;
    let t = cycles as f64 * DT;
    assert!(
        (t - ideal_s).abs() / ideal_s < 0.05,
        "took {t} s, expected about {ideal_s} s"
    );
}

// ─── Scenario 2: blended pair ───────────────────────────────────────

#[test]
fn blended_pair() {
    let mut rig = Rig::new(machine_config());
    rig.enable_and_home();
    rig.to_coord();

    let tol = 0.1;
    rig.ctl.planner.set_term_cond(TermCond::Blend, tol);
    rig.add_line(pose(10.0, 0.0, 0.0), 20.0, 200.0);
    rig.add_line(pose(10.0, 10.0, 0.0), 20.0, 200.0);

    let corner = Cartesian::new(10.0, 0.0, 0.0);
    let mut max_dev: f64 = 0.0;
    let mut peak_vel: f64 = 0.0;
    let mut cycles = 0;
    while !rig.in_position() {
        rig.cycle();
        peak_vel = peak_vel.max(rig.ctl.status.current_vel);
        let p = rig.ctl.status.carte_pos_cmd.tran;
        if p.sub(corner).magnitude() < 1.0 {
            // Distance from the sharp two-leg path.
            let d_leg1 = if p.x <= corner.x { p.y.abs() } else { f64::MAX };
            let d_leg2 = if p.y >= 0.0 { (p.x - corner.x).abs() } else { f64::MAX };
            max_dev = max_dev.max(d_leg1.min(d_leg2).min(p.sub(corner).magnitude()));
        }
        cycles += 1;
        assert!(cycles < 60_000, "blended pair never completed");
    }

    assert!(max_dev <= tol + 1e-6, "path deviation {max_dev} beyond tolerance");
    // Combined velocity stays below the per-move ceiling.
    assert!(peak_vel <= 100.0 + 1e-6, "peak velocity {peak_vel}");
    let p = rig.ctl.status.carte_pos_cmd.tran;
    assert!((p.x - 10.0).abs() < 1e-6 && (p.y - 10.0).abs() < 1e-6);
}

// ─── Scenario 3: abort during acceleration ──────────────────────────

#[test]
fn abort_during_acceleration() {
    let mut rig = Rig::new(machine_config());
    rig.enable_and_home();
    rig.to_coord();

    rig.add_line(pose(100.0, 0.0, 0.0), 10.0, 100.0);

    // Run until half the requested velocity.
    let mut cycles = 0;
    while rig.ctl.status.current_vel < 5.0 {
        rig.cycle();
        cycles += 1;
        assert!(cycles < 30_000, "never reached half speed");
    }

    rig.ctl.mailbox.submit(Command::Abort);
    let max_dv = 100.0 * DT; // accel ceiling per cycle
    let jerk_dv = 10_000.0 * DT * DT; // accel still ramping down
    let mut prev = rig.ctl.status.current_vel;
    let mut stop_cycles = 0;
    loop {
        rig.cycle();
        let v = rig.ctl.status.current_vel;
        // Jerk-limited: velocity may still rise briefly while accel
        // ramps to zero, never faster than the accel ceiling allows.
        assert!(v <= prev + max_dv + jerk_dv + 1e-9, "velocity jumped {prev} -> {v}");
        prev = v;
        stop_cycles += 1;
        assert!(stop_cycles < 10_000, "abort never stopped");
        if v == 0.0 && rig.ctl.planner.is_done() {
            break;
        }
    }
    assert_eq!(rig.ctl.planner.queue_depth(), 0);
    assert!(rig.ctl.status.carte_pos_cmd.tran.x < 100.0);
}

// ─── Scenario 4: rigid tap ──────────────────────────────────────────

#[test]
fn rigid_tap_returns_to_start() {
    let mut rig = Rig::new(machine_config());
    rig.enable_and_home();
    rig.to_coord();

    rig.ctl.planner.set_spindle_sync(1.0, false);
    rig.ctl
        .planner
        .add_rigid_tap(pose(0.0, 0.0, -10.0), 20.0, 50.0, 200.0, FeedEnables::all())
        .unwrap();

    // Simulated spindle with a slew-limited reversal, driven by the
    // sign the planner publishes.
    let mut spindle_vel: f64 = 8.0;
    let mut min_z: f64 = 0.0;
    let mut saw_tap_motion = false;
    let mut cycles = 0;
    rig.ctl.io.machine.spindle_is_atspeed = true;
    while !rig.in_position() {
        let want = 8.0 * rig.ctl.planner.status().spindle_speed_sign;
        let slew = 80.0 * DT;
        if (want - spindle_vel).abs() <= slew {
            spindle_vel = want;
        } else if want > spindle_vel {
            spindle_vel += slew;
        } else {
            spindle_vel -= slew;
        }
        if rig.ctl.io.machine.spindle_index_enable {
            rig.ctl.io.machine.spindle_revs = 0.0;
            rig.ctl.io.machine.spindle_index_enable = false;
        } else {
            rig.ctl.io.machine.spindle_revs += spindle_vel * DT;
        }

        rig.cycle();
        min_z = min_z.min(rig.ctl.status.carte_pos_cmd.tran.z);
        if rig.ctl.status.motion_type == CanonMotionType::RigidTap as u8 {
            saw_tap_motion = true;
        }
        cycles += 1;
        assert!(cycles < 200_000, "tap never completed");
    }

    assert!(saw_tap_motion);
    assert!(min_z <= -9.5, "tap never reached the bottom: {min_z}");
    assert!(
        rig.ctl.status.carte_pos_cmd.tran.z.abs() < 1e-6,
        "tap did not return to the start plane: {}",
        rig.ctl.status.carte_pos_cmd.tran.z
    );
}

// ─── Scenario 5: homing with switch and index ───────────────────────

#[test]
fn homing_with_switch_and_index() {
    let mut config = machine_config();
    config.joints[0].home_search_vel = 10.0;
    config.joints[0].home_latch_vel = 1.0;
    config.joints[0].home_use_index = true;
    config.joints[0].home_offset = 1.5;
    config.joints[0].home = 1.5;
    // Only joint 0 participates.
    for j in config.joints.iter_mut().skip(1) {
        j.home_sequence = -1;
    }

    let mut rig = Rig::new(machine_config());
    rig.ctl = ServoController::new(config, Box::new(TrivialKins)).unwrap();

    rig.ctl.io.machine.enable = true;
    rig.ctl.mailbox.submit(Command::Enable);
    rig.cycle();
    rig.cycle();

    // Physical rig for joint 0: the machine position lives in
    // encoder coordinates shifted by encoder_zero; the switch trips
    // above 2.0 machine units; the armed encoder re-zeros at integer
    // machine positions. Start on the switch.
    let mut encoder_zero: f64 = 0.0;
    let mut machine_pos: f64 = 5.0;
    rig.ctl.io.joints[0].motor_pos_fb = machine_pos - encoder_zero;
    // Let the controller see the starting feedback as its command.
    rig.ctl.joints[0].free.curr_pos = machine_pos;
    rig.ctl.joints[0].pos_cmd = machine_pos;

    rig.ctl.mailbox.submit(Command::Home { joint: Some(0) });

    let mut states = Vec::new();
    for _ in 0..400_000 {
        // Feedback and switches from the physical model.
        rig.ctl.io.joints[0].home_sw = machine_pos >= 2.0;
        rig.ctl.io.joints[0].motor_pos_fb = machine_pos - encoder_zero;
        for i in 1..MAX_JOINTS {
            rig.ctl.io.joints[i].motor_pos_fb = rig.ctl.io.joints[i].motor_pos_cmd;
        }

        rig.clock_ns += 1_000_000;
        rig.ctl.run_cycle(rig.clock_ns);

        let code = rig.ctl.status.joints[0].home_state;
        if states.last() != Some(&code) {
            states.push(code);
        }

        // The machine follows the motor command in encoder coords.
        let new_machine = rig.ctl.io.joints[0].motor_pos_cmd + encoder_zero;
        // Armed encoder: re-zero at the first integer grid crossing.
        if rig.ctl.io.joints[0].index_enable {
            let (lo, hi) = if new_machine > machine_pos {
                (machine_pos, new_machine)
            } else {
                (new_machine, machine_pos)
            };
            let line = lo.ceil();
            if line <= hi && new_machine != machine_pos {
                encoder_zero = line;
                rig.ctl.io.joints[0].index_enable = false;
            }
        }
        machine_pos = new_machine;

        if rig.ctl.joints[0].is_homed() {
            break;
        }
    }

    assert!(rig.ctl.joints[0].is_homed(), "states: {states:?}");

    // Key states in order: initial backoff (started on switch),
    // search, coarse set, final backoff, rising-edge latch, index
    // wait, index set, final move.
    let expected = [
        HomeState::InitialBackoffStart.code(),
        HomeState::InitialSearchWait.code(),
        HomeState::SetCoarsePosition.code(),
        HomeState::FinalBackoffStart.code(),
        HomeState::RiseSearchWait.code(),
        HomeState::IndexSearchWait.code(),
        HomeState::SetIndexPosition.code(),
        HomeState::FinalMoveWait.code(),
    ];
    let mut cursor = 0;
    for s in &states {
        if cursor < expected.len() && *s == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(cursor, expected.len(), "missing homing states; saw {states:?}");

    // The index line reads home_offset, and the joint parked at home.
    assert!((rig.ctl.joints[0].motor_offset + 1.5).abs() < 1e-9);
    assert!(
        (rig.ctl.status.joints[0].pos_cmd - 1.5).abs() < 1e-6,
        "parked at {}",
        rig.ctl.status.joints[0].pos_cmd
    );
    assert!(rig.ctl.status.joints[0].flags & JointFlags::AT_HOME.bits() != 0);
}

// ─── Scenario 6: soft-limit post-check on an arc interior ───────────

#[test]
fn soft_limit_trips_on_arc_interior() {
    let mut config = machine_config();
    // x travels ±8; y generously more. Arc endpoints stay inside x
    // limits, the interior does not.
    config.joints[0].min_limit = -8.0;
    config.joints[0].max_limit = 8.0;
    config.joints[1].min_limit = -20.0;
    config.joints[1].max_limit = 20.0;

    let mut rig = Rig::new(config);
    rig.enable_and_home();
    rig.to_coord();

    // Move to the arc start, inside all limits.
    rig.add_line(pose(0.0, 9.0, 0.0), 20.0, 200.0);
    let mut cycles = 0;
    while !rig.in_position() {
        rig.cycle();
        cycles += 1;
        assert!(cycles < 60_000);
    }
    assert!(!rig.ctl.status.on_soft_limit);

    // Half circle to (0, -9) through (-9, 0): the interior exceeds
    // the x joint's -8 limit while both endpoints are legal.
    rig.ctl
        .planner
        .add_arc(
            pose(0.0, -9.0, 0.0),
            Cartesian::new(0.0, 0.0, 0.0),
            Cartesian::new(0.0, 0.0, 1.0),
            0,
            CanonMotionType::Arc,
            20.0,
            100.0,
            200.0,
            FeedEnables::all(),
            false,
        )
        .unwrap();

    let mut tripped_cycle = None;
    let mut first_violation_cycle = None;
    for cycle_no in 0..120_000 {
        rig.cycle();
        let x_cmd = rig.ctl.status.joints[0].pos_cmd;
        if first_violation_cycle.is_none() && x_cmd < -8.0 {
            first_violation_cycle = Some(cycle_no);
        }
        if tripped_cycle.is_none() && rig.ctl.status.on_soft_limit {
            tripped_cycle = Some(cycle_no);
        }
        if first_violation_cycle.is_some() && tripped_cycle.is_some() {
            break;
        }
    }

    let violated = first_violation_cycle.expect("arc interior never left the limits");
    let tripped = tripped_cycle.expect("soft limit never tripped");
    // Trips on the very cycle the violating point is commanded.
    assert_eq!(tripped, violated);
    assert!(rig.ctl.status.motion_flags & MotionFlags::ERROR.bits() != 0);
}
