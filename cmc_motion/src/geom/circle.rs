//! Circle / helix / spiral geometry and the 9-axis arc bundle.

use cmc_common::pose::{Cartesian, Pose};

use super::line::Line3;

// ─── 3-Space Circle ─────────────────────────────────────────────────

/// Circular arc in xyz, possibly helical (axial displacement along the
/// plane normal) and spiral (end radius differing from start radius).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle3 {
    pub center: Cartesian,
    /// Unit plane normal.
    pub normal: Cartesian,
    /// Vector from center to start, projected into the plane.
    pub r_tan: Cartesian,
    /// `normal × r_tan`; with `r_tan` spans the plane.
    pub r_perp: Cartesian,
    /// Axial displacement from start to end along the normal.
    pub r_helix: Cartesian,
    pub radius: f64,
    /// Total included angle [rad]; always positive, full turns added.
    pub angle: f64,
    /// End-radius minus start-radius, swept linearly over the angle.
    pub spiral: f64,
}

impl Circle3 {
    /// Build an arc from endpoints, center, plane normal and extra
    /// full turns. Returns `None` for degenerate input (zero radius or
    /// zero normal): the interpreter never emits those.
    pub fn new(
        start: Cartesian,
        end: Cartesian,
        center: Cartesian,
        normal: Cartesian,
        turn: i32,
    ) -> Option<Self> {
        let n = normal.unit()?;

        let rs = start.sub(center);
        let r_tan = rs.sub(n.scale(rs.dot(n)));
        let radius = r_tan.magnitude();
        if radius < f64::EPSILON {
            return None;
        }
        let r_perp = n.cross(r_tan);

        let re = end.sub(center);
        let re_planar = re.sub(n.scale(re.dot(n)));
        let r_helix = n.scale(re.dot(n) - rs.dot(n));

        // Included angle, measured in the arc's direction of travel.
        let mut angle = f64::atan2(r_tan.cross(re_planar).dot(n), r_tan.dot(re_planar));
        if angle <= 0.0 {
            angle += 2.0 * std::f64::consts::PI;
        }
        if turn > 0 {
            angle += turn as f64 * 2.0 * std::f64::consts::PI;
        }

        let spiral = re_planar.magnitude() - radius;

        Some(Self { center, normal: n, r_tan, r_perp, r_helix, radius, angle, spiral })
    }

    /// Point at circle parameter `theta` in `[0, angle]`.
    ///
    /// `r_tan` and `r_perp` both have magnitude `radius`, so rotating
    /// between them sweeps the circle; the spiral term rescales the
    /// radius linearly over the included angle.
    pub fn point_at(&self, theta: f64) -> Cartesian {
        let frac = if self.angle > 0.0 { theta / self.angle } else { 0.0 };
        let scale = (self.radius + self.spiral * frac) / self.radius;
        self.center
            .add(self.r_tan.scale(scale * theta.cos()))
            .add(self.r_perp.scale(scale * theta.sin()))
            .add(self.r_helix.scale(frac))
    }

    /// Arc length including the helical component.
    pub fn arc_length(&self) -> f64 {
        let planar = self.angle * self.radius;
        let axial = self.r_helix.magnitude();
        (planar * planar + axial * axial).sqrt()
    }
}

// ─── 9-Axis Arc Bundle ──────────────────────────────────────────────

/// Arc in xyz with proportional straight moves in abc and uvw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle9 {
    pub xyz: Circle3,
    pub abc: Line3,
    pub uvw: Line3,
}

impl Circle9 {
    pub fn new(
        start: &Pose,
        end: &Pose,
        center: Cartesian,
        normal: Cartesian,
        turn: i32,
    ) -> Option<Self> {
        Some(Self {
            xyz: Circle3::new(start.tran, end.tran, center, normal, turn)?,
            abc: Line3::new(start.abc(), end.abc()),
            uvw: Line3::new(start.uvw(), end.uvw()),
        })
    }

    /// Scalar length carrying the progress parameter (helix-aware).
    #[inline]
    pub fn target_length(&self) -> f64 {
        self.xyz.arc_length()
    }

    /// Pose at `progress ∈ [0, target]`. Progress always rides the
    /// xyz circle; abc and uvw scale to finish simultaneously.
    pub fn pose_at(&self, progress: f64, target: f64) -> Pose {
        let ratio = if target > 0.0 { progress / target } else { 0.0 };
        let mut pose = Pose::ZERO;
        pose.tran = self.xyz.point_at(ratio * self.xyz.angle);
        pose.set_abc(self.abc.point_at(ratio * self.abc.mag));
        pose.set_uvw(self.uvw.point_at(ratio * self.uvw.mag));
        pose
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
