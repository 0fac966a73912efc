//! 9-axis pose math: 3-vectors, unit quaternions, and the full
//! Cartesian pose carried through the trajectory pipeline.
//!
//! A pose has three translation axes (x y z), three rotary axes
//! (a b c), three auxiliary linear axes (u v w), and a scalar spindle
//! coordinate `s`. All values are in user units.

use serde::{Deserialize, Serialize};

// ─── Cartesian 3-Vector ─────────────────────────────────────────────

/// A point or direction in 3-space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cartesian {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Cartesian {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    #[inline]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn add(self, o: Self) -> Self {
        Self::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }

    #[inline]
    pub fn sub(self, o: Self) -> Self {
        Self::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }

    #[inline]
    pub fn scale(self, k: f64) -> Self {
        Self::new(self.x * k, self.y * k, self.z * k)
    }

    #[inline]
    pub fn dot(self, o: Self) -> f64 {
        self.x * o.x + self.y * o.y + self.z * o.z
    }

    #[inline]
    pub fn cross(self, o: Self) -> Self {
        Self::new(
            self.y * o.z - self.z * o.y,
            self.z * o.x - self.x * o.z,
            self.x * o.y - self.y * o.x,
        )
    }

    #[inline]
    pub fn magnitude(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Unit vector, or `None` for a (near-)zero vector.
    pub fn unit(self) -> Option<Self> {
        let mag = self.magnitude();
        if mag < f64::EPSILON {
            None
        } else {
            Some(self.scale(1.0 / mag))
        }
    }
}

// ─── Quaternion ─────────────────────────────────────────────────────

/// Unit quaternion (s, x, y, z).
///
/// Used where a rotation is composed rather than swept: alignment
/// kinematics rotate the xy plane through one, and orientation-aware
/// models interpolate between endpoint quaternions with `nlerp`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub s: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Self = Self { s: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    #[inline]
    pub fn norm(self) -> f64 {
        (self.s * self.s + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Normalize to a unit quaternion; identity when degenerate.
    pub fn unit(self) -> Self {
        let n = self.norm();
        if n < f64::EPSILON {
            Self::IDENTITY
        } else {
            Self {
                s: self.s / n,
                x: self.x / n,
                y: self.y / n,
                z: self.z / n,
            }
        }
    }

    /// Normalized linear interpolation from `self` toward `to`.
    pub fn nlerp(self, to: Self, t: f64) -> Self {
        // Take the short arc.
        let dot = self.s * to.s + self.x * to.x + self.y * to.y + self.z * to.z;
        let sign = if dot < 0.0 { -1.0 } else { 1.0 };
        Self {
            s: self.s + (sign * to.s - self.s) * t,
            x: self.x + (sign * to.x - self.x) * t,
            y: self.y + (sign * to.y - self.y) * t,
            z: self.z + (sign * to.z - self.z) * t,
        }
        .unit()
    }

    /// Rotate a vector by this quaternion.
    pub fn rotate(self, v: Cartesian) -> Cartesian {
        let u = Cartesian::new(self.x, self.y, self.z);
        let uv = u.cross(v);
        let uuv = u.cross(uv);
        v.add(uv.scale(2.0 * self.s)).add(uuv.scale(2.0))
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ─── 9-Axis Pose ────────────────────────────────────────────────────

/// Full machine pose: translation, rotary, auxiliary linear axes, and
/// the spindle coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    /// Translation (x, y, z).
    pub tran: Cartesian,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub u: f64,
    pub v: f64,
    pub w: f64,
    /// Spindle coordinate.
    pub s: f64,
}

impl Pose {
    pub const ZERO: Self = Self {
        tran: Cartesian::ZERO,
        a: 0.0,
        b: 0.0,
        c: 0.0,
        u: 0.0,
        v: 0.0,
        w: 0.0,
        s: 0.0,
    };

    /// The rotary bundle (a, b, c) as a 3-vector.
    #[inline]
    pub fn abc(&self) -> Cartesian {
        Cartesian::new(self.a, self.b, self.c)
    }

    /// The auxiliary linear bundle (u, v, w) as a 3-vector.
    #[inline]
    pub fn uvw(&self) -> Cartesian {
        Cartesian::new(self.u, self.v, self.w)
    }

    pub fn set_abc(&mut self, v: Cartesian) {
        self.a = v.x;
        self.b = v.y;
        self.c = v.z;
    }

    pub fn set_uvw(&mut self, v: Cartesian) {
        self.u = v.x;
        self.v = v.y;
        self.w = v.z;
    }

    /// Per-axis displacement `self - other`; `s` is excluded (the
    /// spindle coordinate is not a motion axis).
    pub fn displacement(&self, other: &Pose) -> Pose {
        Pose {
            tran: self.tran.sub(other.tran),
            a: self.a - other.a,
            b: self.b - other.b,
            c: self.c - other.c,
            u: self.u - other.u,
            v: self.v - other.v,
            w: self.w - other.w,
            s: 0.0,
        }
    }

    /// Per-axis accumulate; `s` is left alone.
    pub fn accumulate(&mut self, d: &Pose) {
        self.tran = self.tran.add(d.tran);
        self.a += d.a;
        self.b += d.b;
        self.c += d.c;
        self.u += d.u;
        self.v += d.v;
        self.w += d.w;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
