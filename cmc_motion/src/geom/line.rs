//! Straight-line geometry in 3-space and the 9-axis line bundle.

use cmc_common::pose::{Cartesian, Pose};

// ─── 3-Space Line ───────────────────────────────────────────────────

/// Directed line segment with cached unit vector and magnitude.
///
/// Degenerate (zero-length) lines are allowed; they evaluate to their
/// start point everywhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line3 {
    pub start: Cartesian,
    pub end: Cartesian,
    /// Unit direction; zero vector when degenerate.
    pub uvec: Cartesian,
    /// Segment magnitude.
    pub mag: f64,
}

impl Line3 {
    pub fn new(start: Cartesian, end: Cartesian) -> Self {
        let d = end.sub(start);
        let mag = d.magnitude();
        let uvec = d.unit().unwrap_or(Cartesian::ZERO);
        Self { start, end, uvec, mag }
    }

    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.mag < f64::EPSILON
    }

    /// Point a distance `len` from the start, along the line.
    ///
    /// Extrapolates past the end for `len > mag`; rigid tapping relies
    /// on this while the spindle overshoots the reversal point.
    #[inline]
    pub fn point_at(&self, len: f64) -> Cartesian {
        if self.is_degenerate() {
            self.start
        } else {
            self.start.add(self.uvec.scale(len))
        }
    }
}

// ─── 9-Axis Line Bundle ─────────────────────────────────────────────

/// A coordinated straight move across the xyz, uvw and abc bundles.
///
/// Progress rides the dominant bundle (the first with non-zero
/// magnitude in the order xyz → uvw → abc); the other bundles scale
/// by their magnitude ratio so all three finish together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line9 {
    pub xyz: Line3,
    pub uvw: Line3,
    pub abc: Line3,
}

impl Line9 {
    pub fn new(start: &Pose, end: &Pose) -> Self {
        Self {
            xyz: Line3::new(start.tran, end.tran),
            uvw: Line3::new(start.uvw(), end.uvw()),
            abc: Line3::new(start.abc(), end.abc()),
        }
    }

    /// Scalar length carrying the progress parameter.
    pub fn target_length(&self) -> f64 {
        if !self.xyz.is_degenerate() {
            self.xyz.mag
        } else if !self.uvw.is_degenerate() {
            self.uvw.mag
        } else {
            self.abc.mag
        }
    }

    /// Pose at `progress` along the dominant bundle, `target` being
    /// the value returned by [`Line9::target_length`].
    pub fn pose_at(&self, progress: f64, target: f64) -> Pose {
        let mut pose = Pose::ZERO;
        let ratio = if target > 0.0 { progress / target } else { 0.0 };
        if !self.xyz.is_degenerate() {
            pose.tran = self.xyz.point_at(progress);
            pose.set_uvw(self.uvw.point_at(ratio * self.uvw.mag));
            pose.set_abc(self.abc.point_at(ratio * self.abc.mag));
        } else if !self.uvw.is_degenerate() {
            pose.tran = self.xyz.start;
            pose.set_uvw(self.uvw.point_at(progress));
            pose.set_abc(self.abc.point_at(ratio * self.abc.mag));
        } else {
            pose.tran = self.xyz.start;
            pose.set_uvw(self.uvw.start);
            pose.set_abc(self.abc.point_at(progress));
        }
        pose
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
