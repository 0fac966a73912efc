//! Status snapshot published once per servo cycle.
//!
//! The snapshot is a plain `Copy` block guarded by a head/tail counter
//! pair: the writer bumps `head` before touching any field and sets
//! `tail = head` after the last one. A reader that copies the block
//! and sees `head == tail` holds a self-consistent observation of one
//! cycle; otherwise it retries.

use crate::consts::{MAX_AIO, MAX_DIO, MAX_JOINTS};
use crate::pose::Pose;
use static_assertions::assert_impl_all;

// ─── Per-Joint Snapshot ─────────────────────────────────────────────

/// Per-joint fields copied out each cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct JointStatusSnap {
    /// `JointFlags` bits.
    pub flags: u16,
    /// Homing FSM state code.
    pub home_state: u8,
    pub pos_cmd: f64,
    pub pos_fb: f64,
    pub vel_cmd: f64,
    /// Following error and its high-water mark [user units].
    pub ferror: f64,
    pub ferror_high_mark: f64,
    pub min_pos_limit: f64,
    pub max_pos_limit: f64,
    pub home_offset: f64,
}

// ─── Motion Snapshot ────────────────────────────────────────────────

/// Probe interaction state code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ProbeSnapState {
    #[default]
    Idle = 0,
    Probing = 1,
    Tripped = 2,
}

/// The complete per-cycle status snapshot.
#[derive(Debug, Clone, Copy)]
pub struct MotionStatusSnap {
    /// Bumped before the writer touches any other field.
    pub head: u64,

    /// `MotionFlags` bits.
    pub motion_flags: u16,
    /// Operating state code (disabled/free/teleop/coord).
    pub motion_state: u8,

    // ── Trajectory ──
    pub carte_pos_cmd: Pose,
    pub carte_pos_fb: Pose,
    pub carte_pos_cmd_ok: bool,
    pub carte_pos_fb_ok: bool,
    /// Segment queue depth and whether the producer should back off.
    pub queue_depth: u16,
    pub active_depth: u16,
    pub queue_full: bool,
    /// Id of the executing segment (program line for the UI).
    pub exec_id: i32,
    /// Canonical motion type of the executing segment.
    pub motion_type: u8,
    pub current_vel: f64,
    pub requested_vel: f64,
    pub distance_to_go: f64,
    pub dtg: Pose,

    // ── Spindle ──
    pub spindle_revs: f64,
    pub spindle_speed_cmd: f64,
    pub spindle_is_atspeed: bool,
    pub spindle_synced: bool,
    pub spindle_pos_cmd: f64,
    pub spindle_css_error: f64,

    // ── Probe ──
    pub probe_state: ProbeSnapState,
    pub probe_tripped: bool,
    pub probed_pos: Pose,

    // ── Homing ──
    pub homing_active: bool,
    pub homing_sequence_state: u8,

    // ── Faults / scaling ──
    pub on_soft_limit: bool,
    pub override_limit_mask: u32,
    pub net_feed_scale: f64,
    pub net_spindle_scale: f64,
    pub overruns: u64,

    // ── Arrays ──
    pub joints: [JointStatusSnap; MAX_JOINTS],
    pub synch_di: [bool; MAX_DIO],
    pub synch_do: [bool; MAX_DIO],
    pub analog_in: [f64; MAX_AIO],
    pub analog_out: [f64; MAX_AIO],

    /// Set equal to `head` after the last field write.
    pub tail: u64,
}

assert_impl_all!(MotionStatusSnap: Copy, Send);

impl Default for MotionStatusSnap {
    fn default() -> Self {
        Self {
            head: 0,
            motion_flags: 0,
            motion_state: 0,
            carte_pos_cmd: Pose::ZERO,
            carte_pos_fb: Pose::ZERO,
            carte_pos_cmd_ok: false,
            carte_pos_fb_ok: false,
            queue_depth: 0,
            active_depth: 0,
            queue_full: false,
            exec_id: 0,
            motion_type: 0,
            current_vel: 0.0,
            requested_vel: 0.0,
            distance_to_go: 0.0,
            dtg: Pose::ZERO,
            spindle_revs: 0.0,
            spindle_speed_cmd: 0.0,
            spindle_is_atspeed: false,
            spindle_synced: false,
            spindle_pos_cmd: 0.0,
            spindle_css_error: 0.0,
            probe_state: ProbeSnapState::Idle,
            probe_tripped: false,
            probed_pos: Pose::ZERO,
            homing_active: false,
            homing_sequence_state: 0,
            on_soft_limit: false,
            override_limit_mask: 0,
            net_feed_scale: 1.0,
            net_spindle_scale: 1.0,
            overruns: 0,
            joints: [JointStatusSnap::default(); MAX_JOINTS],
            synch_di: [false; MAX_DIO],
            synch_do: [false; MAX_DIO],
            analog_in: [0.0; MAX_AIO],
            analog_out: [0.0; MAX_AIO],
            tail: 0,
        }
    }
}

impl MotionStatusSnap {
    /// Writer side: open the snapshot for this cycle's update.
    #[inline]
    pub fn begin_update(&mut self) {
        self.head = self.head.wrapping_add(1);
    }

    /// Writer side: publish; after this a copy with `head == tail` is
    /// consistent.
    #[inline]
    pub fn end_update(&mut self) {
        self.tail = self.head;
    }

    /// Reader side: whether a copied snapshot is self-consistent.
    #[inline]
    pub fn is_consistent(&self) -> bool {
        self.head == self.tail
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
