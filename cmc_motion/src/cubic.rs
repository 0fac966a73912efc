//! Cubic interpolator: resamples trajectory-rate coarse positions to
//! the servo rate.
//!
//! Coordinated and teleop modes produce one coarse point per
//! trajectory period; the interpolator fits a Hermite cubic over the
//! most recent coarse interval (end velocities from finite
//! differences) and emits `interp_rate` smooth samples per interval.
//! With an interpolation rate of 1 the interpolator is an exact
//! pass-through.

/// Per-joint cubic interpolator.
#[derive(Debug, Clone, Copy)]
pub struct CubicInterpolator {
    /// Coarse (trajectory) period [s].
    segment_time: f64,
    /// Servo samples per coarse period.
    interp_rate: usize,
    /// Sliding window of coarse points, newest last.
    x: [f64; 3],
    filled: usize,
    /// Sample index within the current interval.
    segment_index: usize,
}

impl CubicInterpolator {
    pub fn new(segment_time: f64, interp_rate: usize) -> Self {
        Self {
            segment_time,
            interp_rate: interp_rate.max(1),
            x: [0.0; 3],
            filled: 0,
            segment_index: 0,
        }
    }

    /// Discard buffered points; the next `add_point` restarts priming.
    pub fn drain(&mut self) {
        self.filled = 0;
        self.segment_index = 0;
    }

    /// Whether the current interval is exhausted and a new coarse
    /// point must be added before interpolating again.
    #[inline]
    pub fn need_next_point(&self) -> bool {
        self.filled == 0 || self.segment_index >= self.interp_rate
    }

    /// Append the next coarse point.
    pub fn add_point(&mut self, point: f64) {
        self.x[0] = self.x[1];
        self.x[1] = self.x[2];
        self.x[2] = point;
        if self.filled < 3 {
            // Prime the whole window so startup interpolates flat.
            if self.filled == 0 {
                self.x = [point; 3];
            }
            self.filled += 1;
        }
        self.segment_index = 0;
    }

    /// Produce the next servo sample: position, velocity and
    /// acceleration of the fitted cubic.
    pub fn interpolate(&mut self) -> (f64, f64, f64) {
        let tt = self.segment_time;
        self.segment_index += 1;
        let t = self.segment_index as f64 / self.interp_rate as f64;

        // Span runs from x[1] to x[2]; end velocities by central and
        // backward differences.
        let v1 = (self.x[2] - self.x[0]) / (2.0 * tt);
        let v2 = (self.x[2] - self.x[1]) / tt;
        let (p1, p2) = (self.x[1], self.x[2]);

        let t2 = t * t;
        let t3 = t2 * t;
        let pos = (2.0 * t3 - 3.0 * t2 + 1.0) * p1
            + (t3 - 2.0 * t2 + t) * tt * v1
            + (-2.0 * t3 + 3.0 * t2) * p2
            + (t3 - t2) * tt * v2;
        let vel = ((6.0 * t2 - 6.0 * t) * p1
            + (3.0 * t2 - 4.0 * t + 1.0) * tt * v1
            + (-6.0 * t2 + 6.0 * t) * p2
            + (3.0 * t2 - 2.0 * t) * tt * v2)
            / tt;
        let acc = ((12.0 * t - 6.0) * p1
            + (6.0 * t - 4.0) * tt * v1
            + (-12.0 * t + 6.0) * p2
            + (6.0 * t - 2.0) * tt * v2)
            / (tt * tt);

        (pos, vel, acc)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const T: f64 = 0.001;

    #[test]
    fn rate_one_is_pass_through() {
        let mut c = CubicInterpolator::new(T, 1);
        for (i, p) in [0.0, 1.0, 2.5, 2.5, -1.0].iter().enumerate() {
            assert!(c.need_next_point(), "point {i}");
            c.add_point(*p);
            let (pos, _, _) = c.interpolate();
            assert!((pos - p).abs() < 1e-12, "sample {i}: {pos} != {p}");
        }
    }

    #[test]
    fn linear_ramp_interpolates_linearly() {
        let mut c = CubicInterpolator::new(T, 4);
        // Prime with a unit-step-per-period ramp.
        c.add_point(0.0);
        for _ in 0..4 {
            c.interpolate();
        }
        c.add_point(1.0);
        for _ in 0..4 {
            c.interpolate();
        }
        c.add_point(2.0);
        // Interval [1, 2]; samples at t = 0.25, 0.5, 0.75, 1.0.
        for k in 1..=4 {
            let (pos, vel, _) = c.interpolate();
            let want = 1.0 + 0.25 * k as f64;
            assert!((pos - want).abs() < 1e-9, "sample {k}: {pos} != {want}");
            assert!((vel - 1.0 / T).abs() < 1e-6);
        }
        assert!(c.need_next_point());
    }

    #[test]
    fn need_next_point_handshake() {
        let mut c = CubicInterpolator::new(T, 2);
        assert!(c.need_next_point());
        c.add_point(1.0);
        assert!(!c.need_next_point());
        c.interpolate();
        assert!(!c.need_next_point());
        c.interpolate();
        assert!(c.need_next_point());
    }

    #[test]
    fn endpoint_hits_coarse_point() {
        let mut c = CubicInterpolator::new(T, 8);
        for p in [0.0, 0.3, 1.7, 4.0] {
            c.add_point(p);
            let mut last = 0.0;
            for _ in 0..8 {
                let (pos, _, _) = c.interpolate();
                last = pos;
            }
            assert!((last - p).abs() < 1e-12, "interval end {last} != {p}");
        }
    }

    #[test]
    fn drain_resets_priming() {
        let mut c = CubicInterpolator::new(T, 1);
        c.add_point(5.0);
        c.interpolate();
        c.drain();
        assert!(c.need_next_point());
        c.add_point(-2.0);
        let (pos, _, _) = c.interpolate();
        assert!((pos + 2.0).abs() < 1e-12);
    }
}
