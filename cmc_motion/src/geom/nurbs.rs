//! Rational B-spline (NURBS) curves in 9-axis space.
//!
//! Control points carry the nine pose axes, a weight `r`, a per-point
//! feed `f`, and a curvature radius `d`. Evaluation uses the standard
//! basis-function recurrence (left/right temporaries of size
//! degree + 1) over a clamped knot vector; at `u >= 1` the evaluator
//! returns the last control point exactly.
//!
//! The curve owns its control-point array, knot vector and basis
//! scratch buffer; ownership transfers into the segment queue on
//! admission and is released through the queue's reclaim bin.

use cmc_common::pose::Pose;

// ─── Control Point ──────────────────────────────────────────────────

/// One NURBS control point.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub u: f64,
    pub v: f64,
    pub w: f64,
    /// Rational weight.
    pub r: f64,
    /// Feed rate taking effect at this point's span [user units/s].
    pub f: f64,
    /// Curvature radius, for the curvature-limited velocity cap.
    pub d: f64,
}

// ─── Evaluation Result ──────────────────────────────────────────────

/// Pose plus the blended per-point attributes at an interior parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NurbsPoint {
    pub pose: Pose,
    /// Feed of the span's first control point.
    pub feed: f64,
    /// Weighted curvature radius at the parameter.
    pub curvature_radius: f64,
}

// ─── Curve ──────────────────────────────────────────────────────────

/// An owned, ready-to-evaluate NURBS curve.
#[derive(Debug, Clone, PartialEq)]
pub struct NurbsCurve {
    control_points: Vec<ControlPoint>,
    knots: Vec<f64>,
    /// Basis scratch, `order` wide. Allocated once at admission.
    basis: Vec<f64>,
    order: usize,
    /// Arc length reported by the interpreter; the segment target.
    curve_len: f64,
}

/// Find the knot span containing `u`.
///
/// Linear scan; knot vectors are short and the span moves forward
/// monotonically during execution.
fn find_span(n: i32, u: f64, knots: &[f64]) -> usize {
    let mut ret: i32 = 0;
    while ret < n && knots[(ret + 1) as usize] <= u {
        ret += 1;
    }
    ret as usize
}

/// Basis functions for knot span `i` at parameter `u`, degree `p`.
///
/// Writes `p + 1` values into `basis`. `left` and `right` temporaries
/// live in the same scratch storage convention as the classic
/// recurrence; they are small enough to keep on the stack.
fn basis_functions(i: usize, u: f64, p: usize, knots: &[f64], basis: &mut [f64]) {
    let mut left = [0.0f64; MAX_ORDER];
    let mut right = [0.0f64; MAX_ORDER];

    basis[0] = 1.0;
    for j in 1..=p {
        left[j] = u - knots[i + 1 - j];
        right[j] = knots[i + j] - u;
        let mut saved = 0.0;
        for r in 0..j {
            let temp = basis[r] / (right[r + 1] + left[j - r]);
            basis[r] = saved + right[r + 1] * temp;
            saved = left[j - r] * temp;
        }
        basis[j] = saved;
    }
}

/// Highest supported order (degree + 1).
pub const MAX_ORDER: usize = 8;

impl NurbsCurve {
    /// Last control point as a pose (the `u >= 1` clamp target).
    fn last_point_pose(&self) -> Pose {
        let cp = self.control_points[self.control_points.len() - 1];
        control_point_pose(&cp)
    }

    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    #[inline]
    pub fn curve_len(&self) -> f64 {
        self.curve_len
    }

    #[inline]
    pub fn num_control_points(&self) -> usize {
        self.control_points.len()
    }

    /// Evaluate at parameter `u ∈ [0, 1]`.
    ///
    /// Interior points come from the weighted basis blend; `u >= 1`
    /// clamps to the last control point (feed and curvature of the
    /// final span).
    pub fn point_at(&mut self, u: f64) -> NurbsPoint {
        if u >= 1.0 {
            let last = self.control_points[self.control_points.len() - 1];
            return NurbsPoint {
                pose: self.last_point_pose(),
                feed: last.f,
                curvature_radius: last.d,
            };
        }

        let p = self.order - 1;
        let span = find_span(self.control_points.len() as i32 - 1, u, &self.knots);
        basis_functions(span, u, p, &self.knots, &mut self.basis);

        // First control point of the span.
        let base = span - p;

        let mut r_sum = 0.0;
        for k in 0..self.order {
            r_sum += self.basis[k] * self.control_points[base + k].r;
        }

        let mut pose = Pose::ZERO;
        let mut d_sum = 0.0;
        macro_rules! blend {
            ($field:ident) => {{
                let mut acc = 0.0;
                for k in 0..self.order {
                    acc += self.basis[k] * self.control_points[base + k].$field;
                }
                acc / r_sum
            }};
        }
        pose.tran.x = blend!(x);
        pose.tran.y = blend!(y);
        pose.tran.z = blend!(z);
        pose.a = blend!(a);
        pose.b = blend!(b);
        pose.c = blend!(c);
        pose.u = blend!(u);
        pose.v = blend!(v);
        pose.w = blend!(w);
        for k in 0..self.order {
            d_sum += self.basis[k] * self.control_points[base + k].d;
        }

        NurbsPoint {
            pose,
            feed: self.control_points[base].f,
            curvature_radius: d_sum / r_sum,
        }
    }
}

#[inline]
fn control_point_pose(cp: &ControlPoint) -> Pose {
    let mut pose = Pose::ZERO;
    pose.tran.x = cp.x;
    pose.tran.y = cp.y;
    pose.tran.z = cp.z;
    pose.a = cp.a;
    pose.b = cp.b;
    pose.c = cp.c;
    pose.u = cp.u;
    pose.v = cp.v;
    pose.w = cp.w;
    pose
}

// ─── Incremental Builder ────────────────────────────────────────────

/// Builder error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NurbsBuildError {
    #[error("order {0} out of range [2, {MAX_ORDER}]")]
    BadOrder(usize),
    #[error("declared {declared} control points, too few for order {order}")]
    TooFewControlPoints { declared: usize, order: usize },
    #[error("more control points than the {0} declared")]
    TooManyControlPoints(usize),
    #[error("more knots than the {0} declared")]
    TooManyKnots(usize),
    #[error("knot vector not non-decreasing")]
    KnotsNotSorted,
    #[error("curve incomplete: {got_pts} of {want_pts} points, {got_knots} of {want_knots} knots")]
    Incomplete { got_pts: usize, want_pts: usize, got_knots: usize, want_knots: usize },
}

/// Accumulates one control point or knot per admission call and
/// finalizes into a [`NurbsCurve`] when the last knot is consumed.
#[derive(Debug, Clone)]
pub struct NurbsBuilder {
    control_points: Vec<ControlPoint>,
    knots: Vec<f64>,
    nr_of_ctrl_pts: usize,
    nr_of_knots: usize,
    order: usize,
    curve_len: f64,
}

impl NurbsBuilder {
    pub fn new(
        nr_of_ctrl_pts: usize,
        order: usize,
        curve_len: f64,
    ) -> Result<Self, NurbsBuildError> {
        if !(2..=MAX_ORDER).contains(&order) {
            return Err(NurbsBuildError::BadOrder(order));
        }
        if nr_of_ctrl_pts < order {
            return Err(NurbsBuildError::TooFewControlPoints { declared: nr_of_ctrl_pts, order });
        }
        Ok(Self {
            control_points: Vec::with_capacity(nr_of_ctrl_pts),
            knots: Vec::with_capacity(nr_of_ctrl_pts + order),
            nr_of_ctrl_pts,
            nr_of_knots: nr_of_ctrl_pts + order,
            order,
            curve_len,
        })
    }

    pub fn push_control_point(&mut self, cp: ControlPoint) -> Result<(), NurbsBuildError> {
        if self.control_points.len() >= self.nr_of_ctrl_pts {
            return Err(NurbsBuildError::TooManyControlPoints(self.nr_of_ctrl_pts));
        }
        self.control_points.push(cp);
        Ok(())
    }

    pub fn push_knot(&mut self, knot: f64) -> Result<(), NurbsBuildError> {
        if self.knots.len() >= self.nr_of_knots {
            return Err(NurbsBuildError::TooManyKnots(self.nr_of_knots));
        }
        if let Some(&last) = self.knots.last() {
            if knot < last {
                return Err(NurbsBuildError::KnotsNotSorted);
            }
        }
        self.knots.push(knot);
        Ok(())
    }

    /// Whether the declared point and knot counts have been reached.
    pub fn is_complete(&self) -> bool {
        self.control_points.len() == self.nr_of_ctrl_pts && self.knots.len() == self.nr_of_knots
    }

    pub fn build(self) -> Result<NurbsCurve, NurbsBuildError> {
        if !self.is_complete() {
            return Err(NurbsBuildError::Incomplete {
                got_pts: self.control_points.len(),
                want_pts: self.nr_of_ctrl_pts,
                got_knots: self.knots.len(),
                want_knots: self.nr_of_knots,
            });
        }
        Ok(NurbsCurve {
            control_points: self.control_points,
            knots: self.knots,
            basis: vec![0.0; self.order],
            order: self.order,
            curve_len: self.curve_len,
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn cp(x: f64, y: f64) -> ControlPoint {
        ControlPoint { x, y, r: 1.0, f: 10.0, d: 100.0, ..Default::default() }
    }

    /// Clamped cubic (order 4) with 4 control points: a Bezier curve.
    fn bezier() -> NurbsCurve {
        let mut b = NurbsBuilder::new(4, 4, 3.0).unwrap();
        for p in [cp(0.0, 0.0), cp(1.0, 2.0), cp(2.0, 2.0), cp(3.0, 0.0)] {
            b.push_control_point(p).unwrap();
        }
        for k in [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0] {
            b.push_knot(k).unwrap();
        }
        b.build().unwrap()
    }

    #[test]
    fn builder_incremental_completion() {
        let mut b = NurbsBuilder::new(4, 4, 3.0).unwrap();
        assert!(!b.is_complete());
        for p in [cp(0.0, 0.0), cp(1.0, 2.0), cp(2.0, 2.0), cp(3.0, 0.0)] {
            b.push_control_point(p).unwrap();
        }
        assert!(!b.is_complete());
        for k in [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0] {
            b.push_knot(k).unwrap();
        }
        assert!(b.is_complete());
        assert!(b.build().is_ok());
    }

    #[test]
    fn builder_rejects_bad_input() {
        assert!(NurbsBuilder::new(4, 1, 1.0).is_err());
        assert!(NurbsBuilder::new(2, 4, 1.0).is_err());

        let mut b = NurbsBuilder::new(4, 4, 3.0).unwrap();
        b.push_knot(1.0).unwrap();
        assert_eq!(b.push_knot(0.5), Err(NurbsBuildError::KnotsNotSorted));

        let b2 = NurbsBuilder::new(4, 4, 3.0).unwrap();
        assert!(matches!(b2.build(), Err(NurbsBuildError::Incomplete { .. })));
    }

    #[test]
    fn endpoints_equal_first_and_last_control_points() {
        let mut c = bezier();
        let p0 = c.point_at(0.0);
        assert!((p0.pose.tran.x).abs() < EPS);
        assert!((p0.pose.tran.y).abs() < EPS);

        let p1 = c.point_at(1.0);
        assert!((p1.pose.tran.x - 3.0).abs() < EPS);
        assert!((p1.pose.tran.y).abs() < EPS);
    }

    #[test]
    fn midpoint_matches_bezier_closed_form() {
        // Uniform-weight clamped cubic == Bezier; at u=0.5 the de
        // Casteljau value is (1.5, 1.5) for these control points.
        let mut c = bezier();
        let m = c.point_at(0.5);
        assert!((m.pose.tran.x - 1.5).abs() < EPS);
        assert!((m.pose.tran.y - 1.5).abs() < EPS);
    }

    #[test]
    fn basis_partition_of_unity() {
        let c = bezier();
        let mut basis = vec![0.0; c.order];
        for i in 0..=10 {
            let u = 0.999 * (i as f64) / 10.0;
            let span = find_span(c.control_points.len() as i32 - 1, u, &c.knots);
            basis_functions(span, u, c.order - 1, &c.knots, &mut basis);
            let sum: f64 = basis.iter().sum();
            assert!((sum - 1.0).abs() < EPS, "basis sum {sum} at u {u}");
        }
    }

    #[test]
    fn weights_pull_curve_toward_point() {
        let mut b = NurbsBuilder::new(4, 4, 3.0).unwrap();
        let mut heavy = cp(1.0, 2.0);
        heavy.r = 10.0;
        for p in [cp(0.0, 0.0), heavy, cp(2.0, 2.0), cp(3.0, 0.0)] {
            b.push_control_point(p).unwrap();
        }
        for k in [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0] {
            b.push_knot(k).unwrap();
        }
        let mut weighted = b.build().unwrap();
        let mut plain = bezier();
        let wm = weighted.point_at(0.5);
        let pm = plain.point_at(0.5);
        // Heavier second point drags the midpoint toward (1, 2).
        assert!(wm.pose.tran.x < pm.pose.tran.x);
        assert!(wm.pose.tran.y > pm.pose.tran.y);
    }

    #[test]
    fn curvature_and_feed_carried() {
        let mut c = bezier();
        let m = c.point_at(0.25);
        assert!((m.feed - 10.0).abs() < EPS);
        assert!((m.curvature_radius - 100.0).abs() < EPS);
    }

    #[test]
    fn progress_monotone_eval_is_pure() {
        // Evaluating the same parameters in one pass or many gives the
        // same sequence.
        let mut c1 = bezier();
        let mut c2 = bezier();
        let params: Vec<f64> = (0..=20).map(|i| i as f64 / 20.0).collect();
        let one: Vec<_> = params.iter().map(|&u| c1.point_at(u).pose).collect();
        let mut many = Vec::new();
        for &u in &params {
            many.push(c2.point_at(u).pose);
        }
        assert_eq!(one, many);
    }
}
