//! Motion segments: one queued unit of motion per G-code block.
//!
//! A segment couples a tagged geometry payload with the kinematic
//! constraints and dynamic state the profiler advances every cycle.
//! All constraints are pre-scaled into per-cycle units at admission
//! (velocity × dt, acceleration × dt², jerk × dt³), so the profiler
//! works in plain adds.

use cmc_common::flags::FeedEnables;
use cmc_common::pose::{Cartesian, Pose};
use heapless::Vec as FixedVec;

use crate::geom::{Circle9, Line3, Line9, NurbsCurve};

// ─── Enums ──────────────────────────────────────────────────────────

/// Canonical motion type, as reported in status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CanonMotionType {
    #[default]
    None = 0,
    Traverse = 1,
    Feed = 2,
    Arc = 3,
    Probe = 4,
    RigidTap = 5,
}

/// S-curve profile phase.
///
/// S0 accel ramp-up, S1 constant accel, S2 accel ramp-down, S3 cruise,
/// S4 decel ramp-up, S5 constant decel, S6 decel ramp-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccelPhase {
    #[default]
    S0,
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
}

/// Rigid-tap sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapPhase {
    /// Feeding toward the bottom of the hole, spindle forward.
    #[default]
    Tapping,
    /// Reversal commanded, waiting for the spindle to actually stop
    /// and change direction.
    Reversing,
    /// Feeding back out, tracking the reversed spindle.
    Retraction,
    /// Second reversal commanded at the top, waiting for forward
    /// rotation again.
    FinalReversal,
    /// Unsynchronized positioning move back to the exact start point.
    FinalPlacement,
}

/// Termination condition for queued moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TermCond {
    /// Come to a stop before the following move begins.
    Stop,
    /// Blend into the following move during final deceleration.
    #[default]
    Blend,
}

// ─── Attached Side-Effects ──────────────────────────────────────────

/// How a synchronized-input wait terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWaitType {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DioChange {
    pub index: u8,
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AioChange {
    pub index: u8,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncInputWait {
    pub index: u8,
    pub wait_type: SyncWaitType,
    /// Wait ceiling [s]; expiry releases the segment with a warning.
    pub timeout: f64,
}

/// Output changes and the optional input wait attached to a segment,
/// applied exactly once when the segment first becomes active.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DioChangeSet {
    pub dios: FixedVec<DioChange, 16>,
    pub aios: FixedVec<AioChange, 8>,
    pub sync_input: Option<SyncInputWait>,
}

impl DioChangeSet {
    #[inline]
    pub fn any_changed(&self) -> bool {
        !self.dios.is_empty() || !self.aios.is_empty() || self.sync_input.is_some()
    }

    pub fn clear(&mut self) {
        self.dios.clear();
        self.aios.clear();
        self.sync_input = None;
    }
}

// ─── Rigid-Tap Geometry ─────────────────────────────────────────────

/// Geometry and sub-state of a rigid tapping cycle.
///
/// `xyz` is the active line: the original (elongated) plunge during
/// Tapping/Reversing, rebuilt in place at each reversal to point back
/// at the start. abc/uvw are frozen for the whole cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TapMotion {
    pub xyz: Line3,
    /// Hole-top position the cycle must return to.
    pub start: Cartesian,
    pub abc: Cartesian,
    pub uvw: Cartesian,
    pub phase: TapPhase,
    /// Progress at which the current direction commands a reversal.
    pub reversal_target: f64,
    /// Spindle position when the segment started.
    pub spindle_start_pos: f64,
    /// Commanded spindle travel direction (+1 / −1).
    pub spindle_dir: f64,
    /// Spindle revolutions latched at the retraction reversal.
    pub revs_at_reversal: f64,
}

// ─── Geometry Variant ───────────────────────────────────────────────

/// Tagged geometry payload. Each variant owns its data; NURBS owns
/// heap arrays released through the queue reclaim bin.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentGeometry {
    Line(Line9),
    Arc(Circle9),
    Nurbs(NurbsCurve),
    RigidTap(TapMotion),
}

impl SegmentGeometry {
    /// Whether this variant owns heap allocations that must not be
    /// dropped on the servo thread.
    #[inline]
    pub fn owns_heap(&self) -> bool {
        matches!(self, SegmentGeometry::Nurbs(_))
    }
}

// ─── Segment ────────────────────────────────────────────────────────

/// Result of evaluating a segment at its current progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub pose: Pose,
    /// Spindle position command, produced by synced rigid taps.
    pub spindle_pos_cmd: Option<f64>,
}

/// One queued motion block.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Serial number, monotone per program.
    pub id: i32,
    pub canon_type: CanonMotionType,
    pub geometry: SegmentGeometry,

    /// Segment length in progress units.
    pub target: f64,
    /// Position along the segment, `0 ..= target`.
    pub progress: f64,

    // ── Constraints, per-cycle units ──
    /// Velocity requested by the F word.
    pub req_vel: f64,
    /// Velocity ceiling (feed override stops here).
    pub max_vel: f64,
    pub max_accel: f64,
    pub jerk: f64,
    /// Net feed override applied this cycle.
    pub feed_override: f64,

    // ── Dynamic state ──
    pub cur_vel: f64,
    pub cur_accel: f64,
    pub phase: AccelPhase,
    /// Latched when the final deceleration begins; never cleared until
    /// the segment ends.
    pub on_final_decel: bool,
    pub active: bool,
    pub blending: bool,
    pub vel_at_blend_start: f64,

    // ── Termination ──
    pub blend_with_next: bool,
    pub tolerance: f64,

    // ── Spindle synchronization ──
    pub synchronized: bool,
    pub velocity_mode: bool,
    /// User units of travel per spindle revolution.
    pub uu_per_rev: f64,
    /// Feed-forward progress command for velocity-synced motion.
    pub css_progress_cmd: f64,
    /// Catch-up cycle counter; non-zero while accelerating up to
    /// spindle speed after the index pulse.
    pub sync_accel: u64,

    // ── Gating ──
    /// Wait for spindle-at-speed before this segment starts.
    pub atspeed: bool,
    /// Rotary joint to unlock for this segment.
    pub indexrotary: Option<usize>,
    pub enables: FeedEnables,
    pub dio: DioChangeSet,
}

impl Segment {
    #[inline]
    pub fn distance_to_go(&self) -> f64 {
        self.target - self.progress
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.progress >= self.target
    }

    /// Pose at the current progress.
    ///
    /// NURBS evaluation additionally derives a curvature-limited
    /// request velocity (`sqrt(max_accel · D)`) that replaces
    /// `req_vel` for this cycle, and picks up the span's programmed
    /// feed.
    pub fn current_pose(&mut self) -> EvalResult {
        let progress = self.progress;
        self.pose_at(progress, false)
    }

    /// Pose at `progress == target`, for distance-to-go displays.
    pub fn endpoint(&mut self) -> Pose {
        let target = self.target;
        self.pose_at(target, true).pose
    }

    fn pose_at(&mut self, progress: f64, of_endpoint: bool) -> EvalResult {
        match &mut self.geometry {
            SegmentGeometry::Line(line) => EvalResult {
                pose: line.pose_at(progress, self.target),
                spindle_pos_cmd: None,
            },
            SegmentGeometry::Arc(circle) => EvalResult {
                pose: circle.pose_at(progress, self.target),
                spindle_pos_cmd: None,
            },
            SegmentGeometry::RigidTap(tap) => {
                // Rotary and auxiliary axes are frozen while tapping.
                // Progress is line distance directly; the line
                // extrapolates while the spindle overshoots the
                // reversal point.
                let mut pose = Pose::ZERO;
                pose.tran = tap.xyz.point_at(progress);
                pose.set_abc(tap.abc);
                pose.set_uvw(tap.uvw);
                let spindle_pos_cmd = if of_endpoint {
                    None
                } else {
                    Some(tap.spindle_start_pos + tap.spindle_dir * progress)
                };
                EvalResult { pose, spindle_pos_cmd }
            }
            SegmentGeometry::Nurbs(curve) => {
                let u = if self.target > 0.0 { progress / self.target } else { 1.0 };
                let pt = curve.point_at(u);
                if !of_endpoint && u < 1.0 {
                    // Curvature-limited velocity in per-cycle units:
                    // accel and D are already scaled, so the product
                    // keeps velocity units consistent.
                    self.req_vel = pt.feed;
                    if pt.curvature_radius > 0.0 {
                        let curve_accel =
                            (self.cur_vel * self.cur_vel) / pt.curvature_radius;
                        if curve_accel > self.max_accel {
                            self.req_vel = (self.max_accel * pt.curvature_radius).sqrt();
                        }
                    }
                }
                EvalResult { pose: pt.pose, spindle_pos_cmd: None }
            }
        }
    }

    /// Unit tangent at the segment start, in xyz.
    pub fn starting_unit_vector(&self) -> Cartesian {
        match &self.geometry {
            SegmentGeometry::Line(l) => l.xyz.uvec,
            SegmentGeometry::RigidTap(t) => t.xyz.uvec,
            SegmentGeometry::Arc(c) => {
                let tan = c.xyz.normal.cross(c.xyz.r_tan);
                tan.unit().unwrap_or(Cartesian::ZERO)
            }
            SegmentGeometry::Nurbs(_) => Cartesian::ZERO,
        }
    }

    /// Unit tangent at the segment end, in xyz. A rigid tap comes back
    /// out the way it went in.
    pub fn ending_unit_vector(&self) -> Cartesian {
        match &self.geometry {
            SegmentGeometry::Line(l) => l.xyz.uvec,
            SegmentGeometry::RigidTap(t) => t.xyz.uvec.scale(-1.0),
            SegmentGeometry::Arc(c) => {
                let end_radius = c
                    .xyz
                    .point_at(c.xyz.angle)
                    .sub(c.xyz.center);
                let tan = c.xyz.normal.cross(end_radius);
                tan.unit().unwrap_or(Cartesian::ZERO)
            }
            SegmentGeometry::Nurbs(_) => Cartesian::ZERO,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
