//! Kinematics trait and reference implementations.
//!
//! The controller consumes kinematics abstractly: `forward` maps
//! joint positions to a Cartesian pose, `inverse` maps a pose to
//! joints. The `kind` classification drives the feedback policy:
//! identity kinematics work unhomed, `Both` kinematics need all
//! joints homed and use the previous solution as the initial guess,
//! inverse-only kinematics fake feedback from the command in
//! coordinated modes.

use cmc_common::consts::MAX_JOINTS;
use cmc_common::pose::{Cartesian, Pose, Quaternion};

/// How much of the kinematic model is available, and what it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KinematicsKind {
    /// Forward and inverse, no initial guess, works unhomed.
    Identity,
    /// Forward and inverse; forward needs a guess and homed joints.
    Both,
    /// Inverse only; forward feedback must be faked.
    InverseOnly,
}

/// Kinematic solver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KinematicsError {
    #[error("forward kinematics did not converge")]
    ForwardNotConverged,
    #[error("pose not reachable")]
    NotReachable,
}

/// Abstract kinematic model.
pub trait Kinematics: Send {
    fn kind(&self) -> KinematicsKind;

    /// Joint positions → Cartesian pose. `prev` is the previous
    /// solution, used as the initial guess by iterative models.
    fn forward(
        &self,
        joints: &[f64; MAX_JOINTS],
        prev: &Pose,
    ) -> Result<Pose, KinematicsError>;

    /// Cartesian pose → joint positions.
    fn inverse(&self, pose: &Pose) -> Result<[f64; MAX_JOINTS], KinematicsError>;
}

// ─── Trivial (Identity) Kinematics ──────────────────────────────────

/// Joint i maps directly to pose axis i (x y z a b c u v w).
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialKins;

impl Kinematics for TrivialKins {
    fn kind(&self) -> KinematicsKind {
        KinematicsKind::Identity
    }

    fn forward(
        &self,
        joints: &[f64; MAX_JOINTS],
        _prev: &Pose,
    ) -> Result<Pose, KinematicsError> {
        Ok(Pose {
            tran: Cartesian::new(joints[0], joints[1], joints[2]),
            a: joints[3],
            b: joints[4],
            c: joints[5],
            u: joints[6],
            v: joints[7],
            w: joints[8],
            s: 0.0,
        })
    }

    fn inverse(&self, pose: &Pose) -> Result<[f64; MAX_JOINTS], KinematicsError> {
        Ok([
            pose.tran.x,
            pose.tran.y,
            pose.tran.z,
            pose.a,
            pose.b,
            pose.c,
            pose.u,
            pose.v,
            pose.w,
        ])
    }
}

// ─── Alignment Kinematics ───────────────────────────────────────────

/// xy plane rotated by a fixed skew angle about a rotation center:
/// workpiece-alignment kinematics for machines that square a part in
/// software instead of mechanically.
///
/// Joint space is the machine table; Cartesian space is the aligned
/// part frame. z and the remaining axes pass straight through.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentKins {
    /// Rotation as a unit quaternion about +z.
    rot: Quaternion,
    inv_rot: Quaternion,
    /// Rotation center in the xy plane.
    center: Cartesian,
    /// Offset added on the joint side.
    offset: Cartesian,
}

impl AlignmentKins {
    pub fn new(theta_rad: f64, center: Cartesian, offset: Cartesian) -> Self {
        let half = 0.5 * theta_rad;
        let rot = Quaternion { s: half.cos(), x: 0.0, y: 0.0, z: half.sin() };
        let inv_rot = Quaternion { s: rot.s, x: 0.0, y: 0.0, z: -rot.z };
        Self { rot, inv_rot, center, offset }
    }
}

impl Kinematics for AlignmentKins {
    fn kind(&self) -> KinematicsKind {
        KinematicsKind::Both
    }

    fn forward(
        &self,
        joints: &[f64; MAX_JOINTS],
        _prev: &Pose,
    ) -> Result<Pose, KinematicsError> {
        let table = Cartesian::new(joints[0], joints[1], joints[2])
            .sub(self.offset)
            .sub(self.center);
        let aligned = self.inv_rot.rotate(table).add(self.center);
        Ok(Pose {
            tran: aligned,
            a: joints[3],
            b: joints[4],
            c: joints[5],
            u: joints[6],
            v: joints[7],
            w: joints[8],
            s: 0.0,
        })
    }

    fn inverse(&self, pose: &Pose) -> Result<[f64; MAX_JOINTS], KinematicsError> {
        let rel = pose.tran.sub(self.center);
        let table = self.rot.rotate(rel).add(self.center).add(self.offset);
        Ok([
            table.x, table.y, table.z, pose.a, pose.b, pose.c, pose.u, pose.v, pose.w,
        ])
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn pose(x: f64, y: f64, z: f64) -> Pose {
        Pose { tran: Cartesian::new(x, y, z), ..Pose::ZERO }
    }

    #[test]
    fn trivial_roundtrip() {
        let k = TrivialKins;
        let joints = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let p = k.forward(&joints, &Pose::ZERO).unwrap();
        let back = k.inverse(&p).unwrap();
        for i in 0..MAX_JOINTS {
            assert!((back[i] - joints[i]).abs() < EPS);
        }
    }

    #[test]
    fn alignment_identity_when_theta_zero() {
        let k = AlignmentKins::new(0.0, Cartesian::ZERO, Cartesian::ZERO);
        let joints = k.inverse(&pose(3.0, 4.0, 5.0)).unwrap();
        assert!((joints[0] - 3.0).abs() < EPS);
        assert!((joints[1] - 4.0).abs() < EPS);
        assert!((joints[2] - 5.0).abs() < EPS);
    }

    #[test]
    fn alignment_roundtrip() {
        let k = AlignmentKins::new(
            0.3,
            Cartesian::new(10.0, -5.0, 0.0),
            Cartesian::new(1.0, 2.0, 0.0),
        );
        let want = pose(7.0, 11.0, -2.0);
        let joints = k.inverse(&want).unwrap();
        let got = k.forward(&joints, &Pose::ZERO).unwrap();
        assert!((got.tran.x - want.tran.x).abs() < EPS);
        assert!((got.tran.y - want.tran.y).abs() < EPS);
        assert!((got.tran.z - want.tran.z).abs() < EPS);
    }

    #[test]
    fn alignment_rotates_about_center() {
        // 90° about the origin: part x maps to table y.
        let k = AlignmentKins::new(
            std::f64::consts::FRAC_PI_2,
            Cartesian::ZERO,
            Cartesian::ZERO,
        );
        let joints = k.inverse(&pose(1.0, 0.0, 0.0)).unwrap();
        assert!(joints[0].abs() < EPS);
        assert!((joints[1] - 1.0).abs() < EPS);
    }

    #[test]
    fn kinds() {
        assert_eq!(TrivialKins.kind(), KinematicsKind::Identity);
        let k = AlignmentKins::new(0.1, Cartesian::ZERO, Cartesian::ZERO);
        assert_eq!(k.kind(), KinematicsKind::Both);
    }
}
