//! Trajectory planner: segment admission, per-cycle execution,
//! blending, and spindle synchronization.
//!
//! The task thread admits segments (`add_line` / `add_arc` /
//! `add_rigid_tap` / NURBS admission) and adjusts parameters; the
//! servo thread calls [`TrajPlanner::run_cycle`] once per period.
//! Admission pre-scales every constraint into per-cycle units so the
//! cycle path is free of divisions by the period.
//!
//! ## Per-cycle order
//!
//! 1. Retire the finished head segment (relocking its rotary indexer
//!    and folding its revolutions into the spindle offset first).
//! 2. Select the blend candidate.
//! 3. Drain on abort once velocities are zero or gating is pending.
//! 4. Gate activation: spindle at-speed, synchronized-input wait,
//!    rotary unlock, spindle index latch.
//! 5. Run the rigid-tap reversal machine.
//! 6. Govern velocity: feed override, CSS feed-forward, or spindle
//!    position tracking.
//! 7. Advance the head (and, while blending, the next segment) through
//!    the S-curve profiler and accumulate the displacements.

use cmc_common::consts::MAX_DIO;
use cmc_common::flags::FeedEnables;
use cmc_common::io::MachineIo;
use cmc_common::pose::{Cartesian, Pose};
use tracing::warn;

use crate::geom::{Circle9, ControlPoint, Line3, Line9, NurbsBuilder, NurbsCurve};
use crate::profile;
use crate::queue::{QueueError, SegmentQueue};
use crate::segment::{
    AccelPhase, CanonMotionType, DioChangeSet, Segment, SegmentGeometry, SyncInputWait,
    SyncWaitType, TapMotion, TapPhase, TermCond,
};

// ─── Errors ─────────────────────────────────────────────────────────

/// Admission or parameter failure. The producer must back off and
/// retry (queue full) or fix its arguments.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlannerError {
    #[error("planner is aborting; admission refused")]
    Aborting,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),
    #[error("rigid tap requires spindle-synchronized mode")]
    NotSynchronized,
    #[error("NURBS admission: {0}")]
    Nurbs(#[from] crate::geom::nurbs::NurbsBuildError),
    #[error("no NURBS admission in progress")]
    NoNurbsInProgress,
}

// ─── Published Status ───────────────────────────────────────────────

/// Planner-side status, copied into the shared snapshot by the
/// controller after each cycle. Velocities are per-second.
#[derive(Debug, Clone, Copy)]
pub struct PlannerStatus {
    pub current_vel: f64,
    pub requested_vel: f64,
    pub distance_to_go: f64,
    pub dtg: Pose,
    pub exec_id: i32,
    pub motion_type: CanonMotionType,
    pub depth: usize,
    pub active_depth: usize,
    pub queue_full: bool,
    pub done: bool,
    pub paused: bool,
    /// Position-sync established (index pulse observed).
    pub spindle_synced: bool,
    /// Spindle position command from a synced rigid tap.
    pub spindle_pos_cmd: f64,
    /// Commanded spindle direction; rigid-tap reversals flip it.
    pub spindle_speed_sign: f64,
    /// Enable bits of the executing segment.
    pub enables_queued: FeedEnables,
    pub waiting_for_index: bool,
    pub waiting_for_atspeed: bool,
    /// The last synchronized-input wait expired without the input.
    pub sync_input_timed_out: bool,
}

impl Default for PlannerStatus {
    fn default() -> Self {
        Self {
            current_vel: 0.0,
            requested_vel: 0.0,
            distance_to_go: 0.0,
            dtg: Pose::ZERO,
            exec_id: 0,
            motion_type: CanonMotionType::None,
            depth: 0,
            active_depth: 0,
            queue_full: false,
            done: true,
            paused: false,
            spindle_synced: false,
            spindle_pos_cmd: 0.0,
            spindle_speed_sign: 1.0,
            enables_queued: FeedEnables::default(),
            waiting_for_index: false,
            waiting_for_atspeed: false,
            sync_input_timed_out: false,
        }
    }
}

// ─── Planner ────────────────────────────────────────────────────────

/// The coordinated-motion trajectory planner.
#[derive(Debug)]
pub struct TrajPlanner {
    cycle_time: f64,
    queue: SegmentQueue,

    current_pos: Pose,
    /// End pose of the last admitted segment; start of the next one.
    goal_pos: Pose,

    next_id: i32,
    term_cond: TermCond,
    tolerance: f64,

    // Admission ceilings [user units/s, /s², /s³].
    vmax: f64,
    ini_maxvel: f64,
    vlimit: f64,
    amax: f64,
    jerk_limit: f64,

    aborting: bool,
    pausing: bool,

    // Spindle-sync context for subsequently admitted segments.
    synchronized: bool,
    velocity_mode: bool,
    uu_per_rev: f64,

    /// DIO/AIO changes accumulated for the next admitted segment.
    pending_dio: DioChangeSet,
    nurbs_in_progress: Option<PendingNurbs>,

    // ── Per-cycle sync state ──
    /// Spindle revolutions consumed by completed synced segments.
    spindle_offset_revs: f64,
    waiting_for_index: Option<i32>,
    waiting_for_atspeed: Option<i32>,
    /// Cycles spent in the current synchronized-input wait.
    sync_wait_cycles: u64,
    /// Spindle revolutions sampled last cycle (position tracking).
    prev_revs: f64,
    /// Spindle revolutions sampled last cycle (tap reversal edges).
    old_spindle_revs: f64,

    status: PlannerStatus,
}

#[derive(Debug)]
struct PendingNurbs {
    builder: NurbsBuilder,
    req_vel: f64,
    max_vel: f64,
    max_accel: f64,
    enables: FeedEnables,
}

impl TrajPlanner {
    /// Allocate a planner. `jerk_limit` must be strictly positive;
    /// admission rejects segments otherwise.
    pub fn new(cycle_time: f64, queue_size: usize) -> Self {
        Self {
            cycle_time,
            queue: SegmentQueue::new(queue_size),
            current_pos: Pose::ZERO,
            goal_pos: Pose::ZERO,
            next_id: 0,
            term_cond: TermCond::Blend,
            tolerance: 0.0,
            vmax: 0.0,
            ini_maxvel: 0.0,
            vlimit: 0.0,
            amax: 0.0,
            jerk_limit: 0.0,
            aborting: false,
            pausing: false,
            synchronized: false,
            velocity_mode: false,
            uu_per_rev: 0.0,
            pending_dio: DioChangeSet::default(),
            nurbs_in_progress: None,
            spindle_offset_revs: 0.0,
            waiting_for_index: None,
            waiting_for_atspeed: None,
            sync_wait_cycles: 0,
            prev_revs: 0.0,
            old_spindle_revs: 0.0,
            status: PlannerStatus::default(),
        }
    }

    // ─── Configuration Surface ──────────────────────────────────────

    pub fn set_cycle_time(&mut self, secs: f64) -> Result<(), PlannerError> {
        if secs <= 0.0 {
            return Err(PlannerError::BadParameter("cycle time must be positive"));
        }
        self.cycle_time = secs;
        Ok(())
    }

    /// `vmax` is the velocity requested by the F word; `ini_maxvel`
    /// the machine ceiling the feed override may push up to.
    pub fn set_vmax(&mut self, vmax: f64, ini_maxvel: f64) -> Result<(), PlannerError> {
        if vmax <= 0.0 || ini_maxvel <= 0.0 {
            return Err(PlannerError::BadParameter("vmax must be positive"));
        }
        self.vmax = vmax;
        self.ini_maxvel = ini_maxvel;
        Ok(())
    }

    /// Tool-tip velocity limit.
    pub fn set_vlimit(&mut self, vlimit: f64) {
        self.vlimit = vlimit.max(0.0);
    }

    pub fn set_amax(&mut self, amax: f64) -> Result<(), PlannerError> {
        if amax <= 0.0 {
            return Err(PlannerError::BadParameter("amax must be positive"));
        }
        self.amax = amax;
        Ok(())
    }

    pub fn set_jerk_limit(&mut self, jerk: f64) -> Result<(), PlannerError> {
        if jerk <= 0.0 {
            return Err(PlannerError::BadParameter("jerk must be strictly positive"));
        }
        self.jerk_limit = jerk;
        Ok(())
    }

    /// Id used for the next admitted segment.
    pub fn set_id(&mut self, id: i32) {
        self.next_id = id;
    }

    pub fn set_term_cond(&mut self, cond: TermCond, tolerance: f64) {
        self.term_cond = cond;
        self.tolerance = tolerance.max(0.0);
    }

    /// Preset both current and goal position. Init/mode switches only.
    pub fn set_pos(&mut self, pos: Pose) {
        self.current_pos = pos;
        self.goal_pos = pos;
    }

    pub fn set_spindle_sync(&mut self, uu_per_rev: f64, velocity_mode: bool) {
        if uu_per_rev != 0.0 {
            self.synchronized = true;
            self.uu_per_rev = uu_per_rev;
            self.velocity_mode = velocity_mode;
        } else {
            self.synchronized = false;
        }
    }

    pub fn set_dout(&mut self, index: u8, on: bool) -> Result<(), PlannerError> {
        if index as usize >= MAX_DIO {
            return Err(PlannerError::BadParameter("digital output index out of range"));
        }
        self.pending_dio
            .dios
            .push(crate::segment::DioChange { index, on })
            .map_err(|_| PlannerError::BadParameter("too many queued digital changes"))
    }

    pub fn set_aout(&mut self, index: u8, value: f64) -> Result<(), PlannerError> {
        self.pending_dio
            .aios
            .push(crate::segment::AioChange { index, value })
            .map_err(|_| PlannerError::BadParameter("too many queued analog changes"))
    }

    pub fn set_sync_input(
        &mut self,
        index: u8,
        timeout: f64,
        wait_type: SyncWaitType,
    ) -> Result<(), PlannerError> {
        if index as usize >= MAX_DIO {
            return Err(PlannerError::BadParameter("sync input index out of range"));
        }
        self.pending_dio.sync_input = Some(SyncInputWait { index, wait_type, timeout });
        Ok(())
    }

    pub fn pause(&mut self) {
        self.pausing = true;
    }

    pub fn resume(&mut self) {
        self.pausing = false;
    }

    /// Cooperative abort: velocities are driven to zero, then the
    /// queue drains.
    pub fn abort(&mut self) {
        if !self.aborting {
            self.pausing = true;
            self.aborting = true;
        }
        self.pending_dio.clear();
    }

    /// Soft init: configuration stays, the queue and flags reset, and
    /// the goal collapses onto the current position.
    pub fn clear(&mut self) {
        self.queue.init();
        self.goal_pos = self.current_pos;
        self.next_id = 0;
        self.term_cond = TermCond::Blend;
        self.tolerance = 0.0;
        self.aborting = false;
        self.pausing = false;
        self.synchronized = false;
        self.velocity_mode = false;
        self.uu_per_rev = 0.0;
        self.waiting_for_index = None;
        self.waiting_for_atspeed = None;
        self.nurbs_in_progress = None;
        self.pending_dio.clear();
        self.status = PlannerStatus {
            spindle_speed_sign: self.status.spindle_speed_sign,
            ..PlannerStatus::default()
        };
    }

    // ─── Accessors ──────────────────────────────────────────────────

    #[inline]
    pub fn status(&self) -> &PlannerStatus {
        &self.status
    }

    #[inline]
    pub fn current_pos(&self) -> Pose {
        self.current_pos
    }

    #[inline]
    pub fn goal_pos(&self) -> Pose {
        self.goal_pos
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.status.done
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.pausing
    }

    #[inline]
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn queue_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Task-side reclamation of NURBS buffers parked by removal.
    pub fn drain_reclaim(&mut self) -> usize {
        self.queue.drain_reclaim()
    }

    // ─── Admission ──────────────────────────────────────────────────

    fn check_admission(&self, vel: f64, acc: f64) -> Result<(), PlannerError> {
        if self.aborting {
            return Err(PlannerError::Aborting);
        }
        if vel <= 0.0 {
            return Err(PlannerError::BadParameter("velocity must be positive"));
        }
        if acc <= 0.0 {
            return Err(PlannerError::BadParameter("acceleration must be positive"));
        }
        if self.jerk_limit <= 0.0 {
            return Err(PlannerError::BadParameter("jerk must be strictly positive"));
        }
        Ok(())
    }

    /// Build the common segment scaffold in per-cycle units.
    #[allow(clippy::too_many_arguments)]
    fn base_segment(
        &mut self,
        geometry: SegmentGeometry,
        target: f64,
        canon_type: CanonMotionType,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
        enables: FeedEnables,
        atspeed: bool,
    ) -> Segment {
        let dt = self.cycle_time;
        let vel = if self.vmax > 0.0 { vel.min(self.vmax) } else { vel };
        let acc = if self.amax > 0.0 { acc.min(self.amax) } else { acc };
        let ini_maxvel = if self.ini_maxvel > 0.0 {
            ini_maxvel.min(self.ini_maxvel)
        } else {
            ini_maxvel
        };
        let dio = if self.pending_dio.any_changed() {
            std::mem::take(&mut self.pending_dio)
        } else {
            DioChangeSet::default()
        };
        Segment {
            id: self.next_id,
            canon_type,
            geometry,
            target,
            progress: 0.0,
            req_vel: vel * dt,
            max_vel: ini_maxvel * dt,
            max_accel: acc * dt * dt,
            jerk: self.jerk_limit * dt * dt * dt,
            feed_override: 0.0,
            cur_vel: 0.0,
            cur_accel: 0.0,
            phase: AccelPhase::S0,
            on_final_decel: false,
            active: false,
            blending: false,
            vel_at_blend_start: 0.0,
            blend_with_next: self.term_cond == TermCond::Blend,
            tolerance: self.tolerance,
            synchronized: self.synchronized,
            velocity_mode: self.velocity_mode,
            uu_per_rev: self.uu_per_rev,
            css_progress_cmd: 0.0,
            sync_accel: 0,
            atspeed,
            indexrotary: None,
            enables,
            dio,
        }
    }

    fn push_segment(&mut self, seg: Segment, end: Option<Pose>) -> Result<(), PlannerError> {
        self.queue.push(seg)?;
        if let Some(end) = end {
            self.goal_pos = end;
        }
        self.status.done = false;
        self.status.depth = self.queue.len();
        self.next_id += 1;
        Ok(())
    }

    /// Straight move from the current goal position to `end`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_line(
        &mut self,
        end: Pose,
        canon_type: CanonMotionType,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
        enables: FeedEnables,
        atspeed: bool,
        indexrotary: Option<usize>,
    ) -> Result<(), PlannerError> {
        self.check_admission(vel, acc)?;
        let line = Line9::new(&self.goal_pos, &end);
        let target = line.target_length();
        let mut seg = self.base_segment(
            SegmentGeometry::Line(line),
            target,
            canon_type,
            vel,
            ini_maxvel,
            acc,
            enables,
            atspeed,
        );
        seg.indexrotary = indexrotary;
        self.push_segment(seg, Some(end))
    }

    /// Circular / helical move.
    #[allow(clippy::too_many_arguments)]
    pub fn add_arc(
        &mut self,
        end: Pose,
        center: Cartesian,
        normal: Cartesian,
        turn: i32,
        canon_type: CanonMotionType,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
        enables: FeedEnables,
        atspeed: bool,
    ) -> Result<(), PlannerError> {
        self.check_admission(vel, acc)?;
        let circle = Circle9::new(&self.goal_pos, &end, center, normal, turn)
            .ok_or(PlannerError::BadParameter("degenerate arc"))?;
        let target = circle.target_length();
        let seg = self.base_segment(
            SegmentGeometry::Arc(circle),
            target,
            canon_type,
            vel,
            ini_maxvel,
            acc,
            enables,
            atspeed,
        );
        self.push_segment(seg, Some(end))
    }

    /// Rigid tapping cycle to `end` (xyz) and back. The goal position
    /// is left untouched: the cycle ends where it started.
    pub fn add_rigid_tap(
        &mut self,
        end: Pose,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
        enables: FeedEnables,
    ) -> Result<(), PlannerError> {
        self.check_admission(vel, acc)?;
        if !self.synchronized || self.velocity_mode {
            return Err(PlannerError::NotSynchronized);
        }
        let xyz = Line3::new(self.goal_pos.tran, end.tran);
        if xyz.is_degenerate() {
            return Err(PlannerError::BadParameter("zero-length rigid tap"));
        }
        let tap = TapMotion {
            xyz,
            start: self.goal_pos.tran,
            abc: self.goal_pos.abc(),
            uvw: self.goal_pos.uvw(),
            phase: TapPhase::Tapping,
            reversal_target: xyz.mag,
            spindle_start_pos: self.status.spindle_pos_cmd,
            spindle_dir: 1.0,
            revs_at_reversal: 0.0,
        };
        // Leave room for the spindle to stop: ten revolutions past
        // the reversal point.
        let target = xyz.mag + 10.0 * self.uu_per_rev.abs();
        let mut seg = self.base_segment(
            SegmentGeometry::RigidTap(tap),
            target,
            CanonMotionType::RigidTap,
            vel,
            ini_maxvel,
            acc,
            enables,
            true,
        );
        seg.blend_with_next = false;
        self.push_segment(seg, None)
    }

    // ── NURBS admission (incremental) ──

    /// Open a NURBS block. Control points and knots follow, one per
    /// call; consuming the last knot finalizes and queues the segment.
    pub fn start_nurbs(
        &mut self,
        nr_of_ctrl_pts: usize,
        order: usize,
        curve_len: f64,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
        enables: FeedEnables,
    ) -> Result<(), PlannerError> {
        self.check_admission(vel, acc)?;
        if curve_len <= 0.0 {
            return Err(PlannerError::BadParameter("NURBS curve length must be positive"));
        }
        let builder = NurbsBuilder::new(nr_of_ctrl_pts, order, curve_len)?;
        self.nurbs_in_progress = Some(PendingNurbs {
            builder,
            req_vel: vel,
            max_vel: ini_maxvel,
            max_accel: acc,
            enables,
        });
        Ok(())
    }

    pub fn add_nurbs_control_point(&mut self, cp: ControlPoint) -> Result<(), PlannerError> {
        let pending = self
            .nurbs_in_progress
            .as_mut()
            .ok_or(PlannerError::NoNurbsInProgress)?;
        pending.builder.push_control_point(cp)?;
        Ok(())
    }

    /// Returns `true` when the knot completed the block and the
    /// segment was queued.
    pub fn add_nurbs_knot(&mut self, knot: f64) -> Result<bool, PlannerError> {
        let pending = self
            .nurbs_in_progress
            .as_mut()
            .ok_or(PlannerError::NoNurbsInProgress)?;
        pending.builder.push_knot(knot)?;
        if !pending.builder.is_complete() {
            return Ok(false);
        }
        let pending = self.nurbs_in_progress.take().expect("checked above");
        let curve: NurbsCurve = pending.builder.build()?;
        let target = curve.curve_len();
        let end = {
            let mut probe = curve.clone();
            probe.point_at(1.0).pose
        };
        let seg = self.base_segment(
            SegmentGeometry::Nurbs(curve),
            target,
            CanonMotionType::Feed,
            pending.req_vel,
            pending.max_vel,
            pending.max_accel,
            pending.enables,
            false,
        );
        self.push_segment(seg, Some(end))?;
        Ok(true)
    }

    // ─── Per-Cycle Execution ────────────────────────────────────────

    /// Run one trajectory cycle. Reads spindle and synchronized-input
    /// state from `io`, writes synchronized outputs and the index /
    /// rotary-unlock handshakes back into it.
    pub fn run_cycle(&mut self, io: &mut MachineIo, net_feed_scale: f64, stepping: bool) {
        self.status.depth = self.queue.len();
        self.status.queue_full = self.queue.is_full();
        self.status.requested_vel = 0.0;

        if self.queue.is_empty() {
            self.reset_empty();
            return;
        }

        // ── Step 1-2: retire the finished head ──
        if self.head_finished_and_clear() && !self.retire_head(io) {
            return;
        }
        if self.queue.is_empty() {
            self.reset_empty();
            return;
        }

        // ── Step 3: blend candidate selection ──
        let head_sync_pos = {
            let head = self.queue.item(0).expect("non-empty");
            head.synchronized && !head.velocity_mode
        };
        let mut use_next = !stepping && self.queue.item(0).expect("non-empty").blend_with_next;
        if use_next {
            if let Some(next) = self.queue.item(1) {
                let next_sync_pos = next.synchronized && !next.velocity_mode;
                if !head_sync_pos && next_sync_pos {
                    // A position-synced move must start at the index;
                    // stop at the boundary instead of blending.
                    use_next = false;
                    self.queue.item_mut(0).expect("non-empty").blend_with_next = false;
                }
                if let Some(next) = self.queue.item(1) {
                    // A gated successor (at-speed, input wait, rotary
                    // unlock) must pass activation as the head; do not
                    // blend into it.
                    if next.atspeed
                        || next.dio.sync_input.is_some()
                        || next.indexrotary.is_some()
                    {
                        use_next = false;
                    }
                }
            } else {
                use_next = false;
            }
        }
        {
            // Velocity-synced motion never blends into its successor.
            let head = self.queue.item(0).expect("non-empty");
            if head.synchronized && head.velocity_mode {
                use_next = false;
            }
        }

        // ── Step 4: abort drain ──
        if self.aborting {
            let gated = self.waiting_for_index.is_some() || self.waiting_for_atspeed.is_some();
            let stopped = {
                let head = self.queue.item(0).expect("non-empty");
                let next_stopped =
                    self.queue.item(1).map(|n| n.cur_vel == 0.0).unwrap_or(true);
                head.cur_vel == 0.0 && (!use_next || next_stopped)
            };
            if gated || stopped {
                self.drain_abort();
                return;
            }
            self.queue.item_mut(0).expect("non-empty").req_vel = 0.0;
            if let Some(next) = self.queue.item_mut(1) {
                next.req_vel = 0.0;
            }
        }

        // ── Step 5: gating ──
        if !self.gate_head(io) {
            self.publish_hold();
            return;
        }

        // ── Step 6: rigid-tap reversal machine ──
        self.run_tap_state_machine(io);

        // ── Initialize the upcoming segment once ──
        if use_next {
            let head_blend = self.queue.item(0).expect("non-empty").blend_with_next;
            if let Some(next) = self.queue.item_mut(1) {
                if !next.active {
                    next.active = true;
                    next.cur_vel = 0.0;
                    // An acute corner splits the acceleration budget
                    // between the two overlapping segments.
                    if head_blend || next.blend_with_next {
                        next.max_accel /= 2.0;
                    }
                }
            }
        }

        // ── Step 7: velocity governance ──
        self.govern_velocity(io, net_feed_scale, use_next);

        // ── Step 8: blend peak velocity ──
        let blend_vel = if use_next { self.compute_blend_vel() } else { 0.0 };

        // ── Step 9-10: advance ──
        self.advance_segments(io, use_next, blend_vel);
    }

    // ── Step helpers ──

    fn head_finished_and_clear(&mut self) -> bool {
        match self.queue.item(0) {
            Some(head) => {
                head.is_finished() && self.waiting_for_atspeed != Some(head.id)
            }
            None => false,
        }
    }

    /// Retire the finished head. Returns false when retirement is
    /// itself waiting (rotary relock confirmation).
    fn retire_head(&mut self, io: &mut MachineIo) -> bool {
        let (indexrotary, synchronized, target, uu_per_rev) = {
            let head = self.queue.item(0).expect("non-empty");
            (head.indexrotary, head.synchronized, head.target, head.uu_per_rev)
        };

        if let Some(jnt) = indexrotary {
            if io.rotary_unlock[jnt] {
                // Relock and wait for the confirmation to drop.
                io.rotary_unlock[jnt] = false;
            }
            if io.rotary_is_unlocked[jnt] {
                self.publish_hold();
                return false;
            }
        }

        // Fold this segment's revolutions into the offset so the next
        // synced move continues the same thread.
        if synchronized && uu_per_rev != 0.0 {
            self.spindle_offset_revs += target / uu_per_rev;
        } else {
            self.spindle_offset_revs = 0.0;
        }

        let _ = self.queue.remove(1);
        self.status.depth = self.queue.len();
        true
    }

    fn reset_empty(&mut self) {
        self.queue.init();
        self.goal_pos = self.current_pos;
        self.aborting = false;
        self.pausing = false;
        self.waiting_for_index = None;
        self.waiting_for_atspeed = None;
        self.status.done = true;
        self.status.depth = 0;
        self.status.active_depth = 0;
        self.status.exec_id = 0;
        self.status.motion_type = CanonMotionType::None;
        self.status.current_vel = 0.0;
        self.status.requested_vel = 0.0;
        self.status.distance_to_go = 0.0;
        self.status.dtg = Pose::ZERO;
        self.status.waiting_for_index = false;
        self.status.waiting_for_atspeed = false;
    }

    fn drain_abort(&mut self) {
        self.queue.init();
        self.goal_pos = self.current_pos;
        self.aborting = false;
        self.pausing = false;
        self.synchronized = false;
        self.waiting_for_index = None;
        self.waiting_for_atspeed = None;
        self.status.spindle_synced = false;
        self.reset_empty();
    }

    fn publish_hold(&mut self) {
        self.status.current_vel = 0.0;
        self.status.requested_vel = 0.0;
        self.status.waiting_for_index = self.waiting_for_index.is_some();
        self.status.waiting_for_atspeed = self.waiting_for_atspeed.is_some();
    }

    /// All activation gates. Returns true when the head may advance
    /// this cycle.
    fn gate_head(&mut self, io: &mut MachineIo) -> bool {
        // Stale gate bookkeeping: the segment we were waiting on is
        // gone (program stepped past it).
        let head_id = self.queue.item(0).expect("non-empty").id;
        if let Some(id) = self.waiting_for_index {
            if id != head_id {
                warn!(waiting = id, reached = head_id, "index wait outlived its segment");
                self.waiting_for_index = None;
            }
        }
        if let Some(id) = self.waiting_for_atspeed {
            if id != head_id {
                warn!(waiting = id, reached = head_id, "at-speed wait outlived its segment");
                self.waiting_for_atspeed = None;
            }
        }

        if self.waiting_for_atspeed.is_some() {
            if !io.spindle_is_atspeed {
                return false;
            }
            self.waiting_for_atspeed = None;
        }

        // First time this segment is seen.
        let needs_activation = !self.queue.item(0).expect("non-empty").active;
        if needs_activation {
            let (atspeed, synchronized, velocity_mode, indexrotary, sync_input) = {
                let head = self.queue.item(0).expect("non-empty");
                (
                    head.atspeed,
                    head.synchronized,
                    head.velocity_mode,
                    head.indexrotary,
                    head.dio.sync_input,
                )
            };

            if (atspeed || (synchronized && !velocity_mode && !self.status.spindle_synced))
                && !io.spindle_is_atspeed
            {
                self.waiting_for_atspeed = Some(head_id);
                return false;
            }

            if let Some(wait) = sync_input {
                let level = io.synch_di[wait.index as usize];
                let met = match wait.wait_type {
                    SyncWaitType::High => level,
                    SyncWaitType::Low => !level,
                };
                if !met {
                    self.sync_wait_cycles += 1;
                    let limit = (wait.timeout / self.cycle_time).ceil() as u64;
                    if wait.timeout > 0.0 && self.sync_wait_cycles > limit {
                        warn!(input = wait.index, "synchronized input wait timed out");
                        self.status.sync_input_timed_out = true;
                        self.queue.item_mut(0).expect("non-empty").dio.sync_input = None;
                        self.sync_wait_cycles = 0;
                        // fall through: the move proceeds
                    } else {
                        return false;
                    }
                } else {
                    self.queue.item_mut(0).expect("non-empty").dio.sync_input = None;
                    self.sync_wait_cycles = 0;
                }
            }

            if let Some(jnt) = indexrotary {
                if !io.rotary_is_unlocked[jnt] {
                    io.rotary_unlock[jnt] = true;
                    return false;
                }
            }

            // Activate: the segment advances this cycle.
            {
                let head = self.queue.item_mut(0).expect("non-empty");
                head.active = true;
                head.cur_vel = 0.0;
                if head.blend_with_next {
                    head.max_accel /= 2.0;
                }
            }
            self.status.active_depth = 1;
            self.apply_dio_changes(0, io);

            if synchronized && !velocity_mode && !self.status.spindle_synced {
                // Latch the spindle zero at the next index pulse.
                self.waiting_for_index = Some(head_id);
                io.spindle_index_enable = true;
                self.spindle_offset_revs = 0.0;
                return false;
            }
        }

        if self.waiting_for_index.is_some() {
            if io.spindle_index_enable {
                return false;
            }
            // Index observed: the encoder zeroed itself and dropped
            // the handshake.
            self.status.spindle_synced = true;
            self.waiting_for_index = None;
            let head = self.queue.item_mut(0).expect("non-empty");
            head.sync_accel = 1;
            self.prev_revs = 0.0;
        }

        let head = self.queue.item(0).expect("non-empty");
        if !head.synchronized {
            self.status.spindle_synced = false;
        }
        self.status.waiting_for_index = false;
        self.status.waiting_for_atspeed = false;
        true
    }

    /// Fire the change-set of queue item `n` exactly once.
    fn apply_dio_changes(&mut self, n: usize, io: &mut MachineIo) {
        let Some(seg) = self.queue.item_mut(n) else { return };
        if !seg.dio.any_changed() {
            return;
        }
        for d in seg.dio.dios.iter() {
            io.synch_do[d.index as usize] = d.on;
        }
        for a in seg.dio.aios.iter() {
            if (a.index as usize) < io.analog_out.len() {
                io.analog_out[a.index as usize] = a.value;
            }
        }
        seg.dio.dios.clear();
        seg.dio.aios.clear();
    }

    fn run_tap_state_machine(&mut self, io: &MachineIo) {
        let new_revs = io.spindle_revs;
        let old_revs = self.old_spindle_revs;
        self.old_spindle_revs = new_revs;
        let spindle_offset = self.spindle_offset_revs;

        let Some(head) = self.queue.item_mut(0) else { return };
        let (progress, max_vel) = (head.progress, head.max_vel);
        let mut new_target = None;
        let mut flip_spindle = false;
        let mut desync = false;

        if let SegmentGeometry::RigidTap(tap) = &mut head.geometry {
            match tap.phase {
                TapPhase::Tapping => {
                    if progress >= tap.reversal_target {
                        flip_spindle = true;
                        tap.phase = TapPhase::Reversing;
                    }
                }
                TapPhase::Reversing => {
                    if new_revs < old_revs {
                        // The spindle has actually reversed; retract
                        // from wherever the tap ended up.
                        tap.revs_at_reversal = new_revs + spindle_offset;
                        let here = tap.xyz.point_at(progress);
                        tap.xyz = Line3::new(here, tap.start);
                        tap.reversal_target = tap.xyz.mag;
                        new_target = Some(tap.xyz.mag + 10.0 * head.uu_per_rev.abs());
                        tap.spindle_start_pos += tap.spindle_dir * progress;
                        tap.spindle_dir = -tap.spindle_dir;
                        tap.phase = TapPhase::Retraction;
                    }
                }
                TapPhase::Retraction => {
                    if progress >= tap.reversal_target {
                        flip_spindle = true;
                        tap.phase = TapPhase::FinalReversal;
                    }
                }
                TapPhase::FinalReversal => {
                    if new_revs > old_revs {
                        let here = tap.xyz.point_at(progress);
                        tap.xyz = Line3::new(here, tap.start);
                        new_target = Some(tap.xyz.mag);
                        tap.spindle_start_pos += tap.spindle_dir * progress;
                        tap.spindle_dir = -tap.spindle_dir;
                        tap.reversal_target = tap.xyz.mag;
                        tap.phase = TapPhase::FinalPlacement;
                        desync = true;
                    }
                }
                TapPhase::FinalPlacement => {
                    // Ordinary move now; it stops at target.
                }
            }
        } else {
            return;
        }

        if let Some(t) = new_target {
            head.target = t;
            head.progress = 0.0;
            head.cur_vel = 0.0;
            head.cur_accel = 0.0;
            head.phase = AccelPhase::S0;
            head.on_final_decel = false;
        }
        if desync {
            head.synchronized = false;
            head.req_vel = max_vel;
            head.feed_override = 1.0;
        }
        if flip_spindle {
            self.status.spindle_speed_sign = -self.status.spindle_speed_sign;
        }
    }

    fn govern_velocity(&mut self, io: &MachineIo, net_feed_scale: f64, use_next: bool) {
        let next_progress = if use_next {
            self.queue.item(1).map(|n| n.progress).unwrap_or(0.0)
        } else {
            0.0
        };
        let aborting = self.aborting;
        let spindle_offset = self.spindle_offset_revs;
        let prev_revs = self.prev_revs;

        let head = self.queue.item_mut(0).expect("non-empty");
        if head.synchronized {
            if head.velocity_mode {
                // CSS / threading without position lock: feed-forward
                // progress command from the accumulated revolutions,
                // with the position error folded in but bounded to one
                // jerk quantum per cycle.
                let css_cmd = (io.spindle_revs - spindle_offset) * head.uu_per_rev.abs();
                let delta = css_cmd - head.css_progress_cmd;
                head.css_progress_cmd = css_cmd;
                let pos_error =
                    (css_cmd - (head.progress + next_progress)).clamp(-head.jerk, head.jerk);
                if !aborting {
                    head.feed_override = net_feed_scale;
                    head.req_vel = (delta + pos_error).max(0.0);
                }
            } else {
                // Position sync: track spindle revolutions.
                let revs = match &head.geometry {
                    SegmentGeometry::RigidTap(tap)
                        if matches!(
                            tap.phase,
                            TapPhase::Retraction | TapPhase::FinalReversal
                        ) =>
                    {
                        tap.revs_at_reversal - io.spindle_revs
                    }
                    _ => io.spindle_revs,
                };
                self.prev_revs = revs;

                let pos_error = (revs - spindle_offset) * head.uu_per_rev.abs()
                    - head.progress
                    - next_progress;

                if head.sync_accel > 0 {
                    // Catch-up: accelerate until the spindle's pace is
                    // matched, then shift the offset so the error
                    // zeroes out.
                    let cycles = head.sync_accel as f64;
                    let spindle_vel_pc = revs / cycles;
                    let target_vel = spindle_vel_pc * head.uu_per_rev.abs();
                    if head.cur_vel >= target_vel {
                        self.spindle_offset_revs =
                            revs - head.progress / head.uu_per_rev.abs();
                        head.sync_accel = 0;
                        head.req_vel = target_vel;
                    } else {
                        head.req_vel = head.max_vel;
                        head.sync_accel += 1;
                    }
                } else {
                    let spindle_vel_pc = revs - prev_revs;
                    let target_vel = spindle_vel_pc * head.uu_per_rev.abs();
                    let mut errorvel = (pos_error.abs() * head.max_accel).sqrt();
                    if pos_error < 0.0 {
                        errorvel = -errorvel;
                    }
                    head.req_vel = target_vel + errorvel;
                }
                head.feed_override = 1.0;
            }
            if head.req_vel < 0.0 {
                head.req_vel = 0.0;
            }
            let (head_req, head_sync) = (head.req_vel, head.synchronized && !head.velocity_mode);
            if use_next {
                if let Some(next) = self.queue.item_mut(1) {
                    if next.synchronized && head_sync {
                        next.req_vel = head_req;
                        next.feed_override = 1.0;
                    } else {
                        next.feed_override = net_feed_scale;
                    }
                }
            }
        } else {
            head.feed_override = net_feed_scale;
            if use_next {
                if let Some(next) = self.queue.item_mut(1) {
                    next.feed_override = net_feed_scale;
                }
            }
        }

        // Pause forces the override to zero; position-synced motion
        // ignores it (stopping mid-thread would scrap the part).
        if self.pausing {
            let head = self.queue.item_mut(0).expect("non-empty");
            if !head.synchronized || head.velocity_mode {
                head.feed_override = 0.0;
                if use_next {
                    if let Some(next) = self.queue.item_mut(1) {
                        next.feed_override = 0.0;
                    }
                }
            }
        }
    }

    /// Peak velocity the next segment will reach, used as the blend
    /// threshold for the current one.
    fn compute_blend_vel(&mut self) -> f64 {
        let (head_maxaccel, head_jerk, head_tol, ending) = {
            let head = self.queue.item(0).expect("non-empty");
            (head.max_accel, head.jerk, head.tolerance, head.ending_unit_vector())
        };
        let Some(next) = self.queue.item(1) else { return 0.0 };
        if next.max_accel <= 0.0 || next.jerk <= 0.0 {
            return 0.0;
        }

        // Velocity the next segment gains over one full accel ramp
        // pair, reduced when the segment is too short for it.
        let mut blend_vel = next.max_accel * next.max_accel / next.jerk;
        if blend_vel * 2.0 * next.max_accel / next.jerk > next.target {
            blend_vel = 0.5 * next.target * next.jerk / next.max_accel;
        }
        if blend_vel > next.max_vel {
            blend_vel = next.max_vel;
        }
        if blend_vel > next.req_vel * next.feed_override {
            // The next segment has a cruise phase: blend over its
            // whole acceleration period.
            blend_vel = next.req_vel * next.feed_override;
        }
        if head_maxaccel < next.max_accel && next.jerk > 0.0 && head_jerk > 0.0 {
            let acc_ratio = head_maxaccel / next.max_accel;
            let jerk_ratio = head_jerk / next.jerk;
            blend_vel *= acc_ratio * acc_ratio / jerk_ratio;
        }

        if head_tol > 0.0 {
            // Corner cap: decelerating from v to a stop covers
            // d = v²/(2a); the corner deviation permits d up to
            // 2·tol/cos(θ/2), where θ is the half-angle between the
            // outgoing and incoming tangents.
            let starting = next.starting_unit_vector();
            let dot = ending.dot(starting);
            let theta = (-dot).clamp(-1.0, 1.0).acos() / 2.0;
            if theta.cos() > 0.001 {
                let tblend = 2.0 * (head_maxaccel * head_tol / theta.cos()).sqrt();
                if tblend < blend_vel {
                    blend_vel = tblend;
                }
            }
        }
        blend_vel
    }

    fn vlimit_for(&self, seg: &Segment) -> Option<f64> {
        if self.vlimit <= 0.0 {
            return None;
        }
        // Spindle-position-tracked moves must not be capped, and a
        // pure rotary move is in angular units the tool-tip limit
        // does not apply to.
        if seg.synchronized && !seg.velocity_mode {
            return None;
        }
        if let SegmentGeometry::Line(l) = &seg.geometry {
            if l.xyz.is_degenerate() && l.uvw.is_degenerate() {
                return None;
            }
        }
        Some(self.vlimit * self.cycle_time)
    }

    fn advance_segments(&mut self, io: &mut MachineIo, use_next: bool, blend_vel: f64) {
        let dt = self.cycle_time;

        // A segment pre-activated as a blend candidate and reached
        // without blending still owes its output changes here, on its
        // first advance as the head.
        self.apply_dio_changes(0, io);

        // ── Primary segment ──
        let head_vlimit = self.vlimit_for(self.queue.item(0).expect("non-empty"));
        let (primary_disp, primary_vel, head_spindle_cmd) = {
            let head = self.queue.item_mut(0).expect("non-empty");
            let before = head.current_pose();
            profile::advance(head, head_vlimit);
            let after = head.current_pose();
            (
                after.pose.displacement(&before.pose),
                head.cur_vel,
                after.spindle_pos_cmd,
            )
        };
        if let Some(s) = head_spindle_cmd {
            self.status.spindle_pos_cmd = s;
        }

        // ── Blend decision ──
        let blending = use_next && {
            let head = self.queue.item(0).expect("non-empty");
            head.blending || (head.on_final_decel && head.cur_vel < blend_vel)
        };

        if blending {
            let vel_at_blend_start = {
                let head = self.queue.item_mut(0).expect("non-empty");
                if !head.blending {
                    head.blending = true;
                    head.vel_at_blend_start = head.cur_vel;
                }
                head.vel_at_blend_start
            };

            // The next segment first advances now: its attached
            // output changes fire here, exactly once.
            self.apply_dio_changes(1, io);

            let next_vlimit = self.vlimit_for(self.queue.item(1).expect("blend candidate"));
            let (secondary_disp, secondary_vel) = {
                let next = self.queue.item_mut(1).expect("blend candidate");
                let before = next.current_pose();
                // Hand the next segment the velocity the primary is
                // shedding, decaying linearly as the primary slows.
                let save_vel = next.req_vel;
                next.req_vel = if next.feed_override > 0.0 {
                    ((vel_at_blend_start - primary_vel) / next.feed_override).max(0.0)
                } else {
                    0.0
                };
                profile::advance(next, next_vlimit);
                next.req_vel = save_vel;
                let after = next.current_pose();
                (after.pose.displacement(&before.pose), next.cur_vel)
            };

            self.current_pos.accumulate(&primary_disp);
            self.current_pos.accumulate(&secondary_disp);
            self.status.current_vel = (primary_vel + secondary_vel) / dt;

            // Report whichever segment dominates the motion.
            let report = if primary_vel > secondary_vel { 0 } else { 1 };
            let (id, canon, dtg_scalar, req_vel, enables, endpoint) = {
                let seg = self.queue.item_mut(report).expect("reported segment");
                (
                    seg.id,
                    seg.canon_type,
                    seg.distance_to_go(),
                    seg.req_vel,
                    seg.enables,
                    seg.endpoint(),
                )
            };
            self.status.exec_id = id;
            self.status.motion_type = canon;
            self.status.distance_to_go = dtg_scalar;
            self.status.requested_vel = req_vel / dt;
            self.status.enables_queued = enables;
            self.status.dtg = endpoint.displacement(&self.current_pos);
        } else {
            self.current_pos.accumulate(&primary_disp);
            let (id, canon, dtg_scalar, req_vel, enables, endpoint) = {
                let head = self.queue.item_mut(0).expect("non-empty");
                (
                    head.id,
                    head.canon_type,
                    head.distance_to_go(),
                    head.req_vel,
                    head.enables,
                    head.endpoint(),
                )
            };
            self.status.exec_id = id;
            self.status.motion_type = canon;
            self.status.distance_to_go = dtg_scalar;
            self.status.current_vel = primary_vel / dt;
            self.status.requested_vel = req_vel / dt;
            self.status.enables_queued = enables;
            self.status.dtg = endpoint.displacement(&self.current_pos);
        }

        self.status.paused = self.pausing;
        self.status.active_depth = 1;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
