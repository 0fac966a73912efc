//! Seven-phase jerk-limited velocity profiler.
//!
//! Advances one segment's `(progress, cur_vel, cur_accel)` by one
//! servo cycle. All quantities are in per-cycle units (velocity × dt,
//! acceleration × dt², jerk × dt³), so the discrete updates are plain
//! sums: with jerk applied at sign `s`,
//!
//! ```text
//! a ← a + s·j
//! v ← v + a + s·j/2
//! p ← p + v + a/2 + s·j/6
//! ```
//!
//! (right-hand sides use the pre-update values).
//!
//! ## Phases
//!
//! | Phase | Jerk | Accel trend |
//! |-------|------|-------------------------|
//! | S0    | +j   | ramp up to +a_max       |
//! | S1    | 0    | hold +a_max             |
//! | S2    | −j   | ramp down to 0          |
//! | S3    | 0    | cruise                  |
//! | S4    | −j   | ramp down to −a_max     |
//! | S5    | 0    | hold −a_max             |
//! | S6    | +j   | ramp back to 0          |
//!
//! The final deceleration latch (`on_final_decel`) is set when the
//! look-ahead stopping distance meets the distance to go and is never
//! cleared until the segment completes. Near the end, velocity is
//! floored at `j/2` so the target is actually reached instead of
//! asymptotically approached.

use crate::segment::{AccelPhase, Segment};

/// Closed-form stopping distance from cruise velocity `v` (accel 0),
/// decelerating at the jerk-limited profile S4 (+ optional S5) + S6.
///
/// The decel is triangular when `v <= a_max²/j` (peak decel below
/// `a_max`), trapezoidal otherwise.
pub fn stopping_distance(v: f64, a_max: f64, j: f64) -> f64 {
    if v <= 0.0 {
        return 0.0;
    }
    let vt = a_max * a_max / j;
    if v > vt {
        let t1 = a_max / j;
        let t2 = (v - vt) / a_max;
        let d4 = v * t1 - j * t1 * t1 * t1 / 6.0;
        let v4 = v - 0.5 * j * t1 * t1;
        let d5 = v4 * t2 - 0.5 * a_max * t2 * t2;
        let v5 = v4 - a_max * t2;
        let d6 = v5 * t1 - 0.5 * a_max * t1 * t1 + j * t1 * t1 * t1 / 6.0;
        d4 + d5 + d6
    } else {
        v * (v / j).sqrt()
    }
}

/// Advance `tc` by one cycle.
///
/// `vlimit` is the tool-tip velocity ceiling in per-cycle units; pass
/// `None` for segments that track the spindle position and must not
/// be capped.
pub fn advance(tc: &mut Segment, vlimit: Option<f64>) {
    let j = tc.jerk;
    let a_max = tc.max_accel;

    if tc.target <= 0.0 || tc.is_finished() {
        tc.progress = tc.target;
        tc.cur_vel = 0.0;
        tc.cur_accel = 0.0;
        return;
    }

    // Effective target velocity for this cycle.
    let mut tv = tc.req_vel * tc.feed_override;
    if tv > tc.max_vel {
        tv = tc.max_vel;
    }
    if let Some(vl) = vlimit {
        if tv > vl {
            tv = vl;
        }
    }
    if tv < 0.0 {
        tv = 0.0;
    }

    let v0 = tc.cur_vel;
    let a0 = tc.cur_accel;
    let dtg = tc.distance_to_go();

    // ── Phase transitions evaluated before the kinematic update ──
    // A transition may cascade once (S3 → S4 re-evaluates S4's exit).
    for _ in 0..3 {
        let next = match tc.phase {
            AccelPhase::S0 | AccelPhase::S1 => {
                // Velocity gained if the accel ramp-down started now,
                // including the cycle in flight.
                let gain = a0 + a0 * a0 / (2.0 * j);
                // Distance consumed by that ramp-down.
                let ramp_cycles = a0 / j;
                let ramp_dist = (v0 + 0.5 * gain) * ramp_cycles;
                if v0 + gain >= tv {
                    Some(AccelPhase::S2)
                } else if dtg <= ramp_dist + stopping_distance(v0 + gain, a_max, j) + v0 {
                    Some(AccelPhase::S2)
                } else {
                    None
                }
            }
            AccelPhase::S2 => None,
            AccelPhase::S3 => {
                if tv - v0 > 1.5 * j {
                    Some(AccelPhase::S0)
                } else if v0 - tv > 1.5 * j {
                    Some(AccelPhase::S4)
                } else if dtg <= stopping_distance(v0, a_max, j) {
                    tc.on_final_decel = true;
                    Some(AccelPhase::S4)
                } else {
                    None
                }
            }
            AccelPhase::S4 | AccelPhase::S5 => {
                let tv_eff = if tc.on_final_decel { 0.0 } else { tv };
                // Velocity still lost during the S6 ramp back to zero
                // accel.
                if v0 - a0 * a0 / (2.0 * j) <= tv_eff {
                    Some(AccelPhase::S6)
                } else {
                    None
                }
            }
            AccelPhase::S6 => None,
        };
        match next {
            Some(p) if p != tc.phase => tc.phase = p,
            _ => break,
        }
    }

    // ── Kinematic update for the resolved phase ──
    let (mut v1, mut a1, mut p1);
    match tc.phase {
        AccelPhase::S0 => {
            if a0 + j >= a_max {
                let je = (a_max - a0).max(0.0);
                a1 = a_max;
                v1 = v0 + a0 + je * 0.5;
                p1 = tc.progress + v0 + a0 * 0.5 + je / 6.0;
                tc.phase = AccelPhase::S1;
            } else {
                a1 = a0 + j;
                v1 = v0 + a0 + j * 0.5;
                p1 = tc.progress + v0 + a0 * 0.5 + j / 6.0;
            }
        }
        AccelPhase::S1 => {
            a1 = a_max;
            v1 = v0 + a_max;
            p1 = tc.progress + v0 + a_max * 0.5;
        }
        AccelPhase::S2 => {
            if a0 - j <= 0.0 {
                let je = a0.max(0.0);
                a1 = 0.0;
                v1 = v0 + a0 - je * 0.5;
                p1 = tc.progress + v0 + a0 * 0.5 - je / 6.0;
                tc.phase = AccelPhase::S3;
            } else {
                a1 = a0 - j;
                v1 = v0 + a0 - j * 0.5;
                p1 = tc.progress + v0 + a0 * 0.5 - j / 6.0;
            }
        }
        AccelPhase::S3 => {
            a1 = 0.0;
            // Snap to the target velocity inside the jerk deadband so
            // cruise and spindle tracking hold it exactly.
            v1 = if (tv - v0).abs() <= 1.5 * j { tv } else { v0 };
            p1 = tc.progress + v1;
        }
        AccelPhase::S4 => {
            if a0 - j <= -a_max {
                let je = (a0 + a_max).max(0.0);
                a1 = -a_max;
                v1 = v0 + a0 - je * 0.5;
                p1 = tc.progress + v0 + a0 * 0.5 - je / 6.0;
                tc.phase = AccelPhase::S5;
            } else {
                a1 = a0 - j;
                v1 = v0 + a0 - j * 0.5;
                p1 = tc.progress + v0 + a0 * 0.5 - j / 6.0;
            }
        }
        AccelPhase::S5 => {
            a1 = -a_max;
            v1 = v0 - a_max;
            p1 = tc.progress + v0 - a_max * 0.5;
        }
        AccelPhase::S6 => {
            if a0 + j >= 0.0 {
                let je = (-a0).max(0.0);
                a1 = 0.0;
                v1 = v0 + a0 + je * 0.5;
                p1 = tc.progress + v0 + a0 * 0.5 + je / 6.0;
                if !tc.on_final_decel {
                    tc.phase = AccelPhase::S3;
                }
            } else {
                a1 = a0 + j;
                v1 = v0 + a0 + j * 0.5;
                p1 = tc.progress + v0 + a0 * 0.5 + j / 6.0;
            }
        }
    }

    // ── Post-conditions ──
    if v1 <= 0.0 {
        if tc.on_final_decel {
            // Minimal creep so the segment actually reaches target.
            v1 = 0.5 * j;
            a1 = 0.0;
            tc.phase = AccelPhase::S6;
        } else {
            // Stopped short (abort or feed override to zero).
            v1 = 0.0;
            a1 = 0.0;
            tc.phase = AccelPhase::S3;
        }
    }
    if p1 >= tc.target {
        p1 = tc.target;
        v1 = 0.0;
        a1 = 0.0;
    }

    tc.progress = p1;
    tc.cur_vel = v1;
    tc.cur_accel = a1;
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Line9;
    use crate::segment::{CanonMotionType, DioChangeSet, SegmentGeometry};
    use cmc_common::flags::FeedEnables;
    use cmc_common::pose::{Cartesian, Pose};

    const DT: f64 = 0.001;

    /// Straight-line segment with constraints scaled to per-cycle
    /// units, the way planner admission does it.
    fn seg(dist: f64, req_vel: f64, max_accel: f64, jerk: f64) -> Segment {
        let to = Pose { tran: Cartesian::new(dist, 0.0, 0.0), ..Pose::ZERO };
        let line = Line9::new(&Pose::ZERO, &to);
        Segment {
            id: 0,
            canon_type: CanonMotionType::Feed,
            geometry: SegmentGeometry::Line(line),
            target: dist,
            progress: 0.0,
            req_vel: req_vel * DT,
            max_vel: 2.0 * req_vel * DT,
            max_accel: max_accel * DT * DT,
            jerk: jerk * DT * DT * DT,
            feed_override: 1.0,
            cur_vel: 0.0,
            cur_accel: 0.0,
            phase: AccelPhase::S0,
            on_final_decel: false,
            active: true,
            blending: false,
            vel_at_blend_start: 0.0,
            blend_with_next: false,
            tolerance: 0.0,
            synchronized: false,
            velocity_mode: false,
            uu_per_rev: 0.0,
            css_progress_cmd: 0.0,
            sync_accel: 0,
            atspeed: false,
            indexrotary: None,
            enables: FeedEnables::default(),
            dio: DioChangeSet::default(),
        }
    }

    /// Run to completion, checking the kinematic invariants on every
    /// cycle. Returns the number of cycles taken.
    fn run_checked(tc: &mut Segment, max_cycles: usize) -> usize {
        let a_bound = tc.max_accel * (1.0 + 1e-9) + 1e-15;
        let j_bound = tc.jerk * (1.0 + 1e-9) + 1e-15;
        let mut prev_a = tc.cur_accel;
        for cycle in 0..max_cycles {
            advance(tc, None);
            assert!(tc.progress >= -1e-15 && tc.progress <= tc.target + 1e-12,
                "progress {} out of [0, {}]", tc.progress, tc.target);
            assert!(tc.cur_vel >= 0.0, "negative velocity {}", tc.cur_vel);
            assert!(tc.cur_accel.abs() <= a_bound,
                "accel {} beyond bound {}", tc.cur_accel, a_bound);
            let da = (tc.cur_accel - prev_a).abs();
            // The clamp at target zeroes accel in one step; every
            // other cycle obeys the jerk bound.
            if !tc.is_finished() {
                assert!(da <= j_bound, "jerk {} beyond bound {}", da, j_bound);
            }
            prev_a = tc.cur_accel;
            if tc.is_finished() {
                return cycle + 1;
            }
        }
        panic!("segment did not complete in {max_cycles} cycles");
    }

    // ── Completion and invariants ──

    #[test]
    fn single_line_reaches_target() {
        let mut tc = seg(100.0, 10.0, 100.0, 1000.0);
        let cycles = run_checked(&mut tc, 30_000);
        assert_eq!(tc.progress, tc.target);
        assert_eq!(tc.cur_vel, 0.0);

        // Ideal duration: symmetric S-curve ramps (amax/j = 0.1 s
        // each, gaining amax²/j = 10 = req_vel) plus cruise. Accel
        // and decel each cover 1.0 unit, cruise covers 98 at 10/s:
        // 0.4 s ramps + 9.8 s cruise = 10.2 s.
        let t = cycles as f64 * DT;
        assert!((t - 10.2).abs() / 10.2 < 0.05, "duration {t} s, expected ~10.2 s");
    }

    #[test]
    fn velocity_ceiling_respected() {
        let mut tc = seg(50.0, 10.0, 100.0, 1000.0);
        let vmax = tc.req_vel * tc.feed_override;
        let mut peak: f64 = 0.0;
        while !tc.is_finished() {
            advance(&mut tc, None);
            peak = peak.max(tc.cur_vel);
        }
        // Discrete overshoot stays within one accel quantum.
        assert!(peak <= vmax + tc.max_accel, "peak {peak} vs limit {vmax}");
        // And the cruise actually gets near the request.
        assert!(peak >= 0.95 * vmax);
    }

    #[test]
    fn short_segment_triangular_profile() {
        // Too short to reach cruise; still completes cleanly.
        let mut tc = seg(0.5, 10.0, 100.0, 1000.0);
        run_checked(&mut tc, 10_000);
        assert_eq!(tc.progress, tc.target);
    }

    #[test]
    fn tiny_segment_completes() {
        let mut tc = seg(0.001, 10.0, 100.0, 1000.0);
        run_checked(&mut tc, 10_000);
        assert_eq!(tc.progress, tc.target);
    }

    #[test]
    fn zero_length_segment_is_immediately_done() {
        let mut tc = seg(0.0, 10.0, 100.0, 1000.0);
        advance(&mut tc, None);
        assert!(tc.is_finished());
        assert_eq!(tc.cur_vel, 0.0);
    }

    // ── Abort / feed override ──

    #[test]
    fn abort_decays_monotonically() {
        let mut tc = seg(100.0, 10.0, 100.0, 1000.0);
        // Accelerate until half the requested velocity.
        let half = 0.5 * tc.req_vel;
        while tc.cur_vel < half {
            advance(&mut tc, None);
        }
        // Abort: request velocity zero.
        tc.req_vel = 0.0;
        let mut prev = tc.cur_vel;
        let mut cycles = 0;
        while tc.cur_vel > 0.0 {
            advance(&mut tc, None);
            assert!(
                tc.cur_vel <= prev + tc.max_accel + 1e-15,
                "velocity rose during abort"
            );
            prev = tc.cur_vel;
            cycles += 1;
            assert!(cycles < 10_000, "abort did not stop");
        }
        assert!(!tc.is_finished());
        assert_eq!(tc.cur_accel, 0.0);
    }

    #[test]
    fn feed_override_zero_pauses() {
        let mut tc = seg(100.0, 10.0, 100.0, 1000.0);
        for _ in 0..500 {
            advance(&mut tc, None);
        }
        tc.feed_override = 0.0;
        for _ in 0..5_000 {
            advance(&mut tc, None);
        }
        assert_eq!(tc.cur_vel, 0.0);
        let frozen = tc.progress;
        for _ in 0..100 {
            advance(&mut tc, None);
        }
        assert_eq!(tc.progress, frozen);

        // Resume completes the move.
        tc.feed_override = 1.0;
        run_checked(&mut tc, 30_000);
        assert_eq!(tc.progress, tc.target);
    }

    #[test]
    fn feed_override_scales_cruise() {
        let mut tc = seg(200.0, 10.0, 100.0, 1000.0);
        tc.feed_override = 0.5;
        let mut peak: f64 = 0.0;
        for _ in 0..10_000 {
            advance(&mut tc, None);
            peak = peak.max(tc.cur_vel);
        }
        let want = 0.5 * tc.req_vel;
        assert!((peak - want).abs() <= tc.max_accel, "peak {peak} vs {want}");
    }

    #[test]
    fn vlimit_caps_velocity() {
        let mut tc = seg(100.0, 10.0, 100.0, 1000.0);
        let vl = 0.004; // 4 units/s in per-cycle units
        let mut peak: f64 = 0.0;
        for _ in 0..40_000 {
            advance(&mut tc, Some(vl));
            peak = peak.max(tc.cur_vel);
            if tc.is_finished() {
                break;
            }
        }
        assert!(tc.is_finished());
        assert!(peak <= vl + tc.max_accel);
    }

    // ── Final decel latch ──

    #[test]
    fn final_decel_latch_sticks() {
        let mut tc = seg(5.0, 10.0, 100.0, 1000.0);
        let mut latched = false;
        while !tc.is_finished() {
            advance(&mut tc, None);
            if tc.on_final_decel {
                latched = true;
            }
            if latched {
                assert!(tc.on_final_decel, "final decel latch cleared early");
            }
        }
        assert!(latched);
    }

    #[test]
    fn stopping_distance_closed_form() {
        // Triangular/trapezoidal split is continuous at v = a²/j.
        let (a, j) = (1.0, 1.0);
        let vt = a * a / j;
        let below = stopping_distance(vt * 0.999999, a, j);
        let above = stopping_distance(vt * 1.000001, a, j);
        assert!((below - above).abs() < 1e-4);
        assert_eq!(stopping_distance(0.0, a, j), 0.0);
        // Monotone in v.
        assert!(stopping_distance(2.0, a, j) > stopping_distance(1.0, a, j));
    }

    #[test]
    fn request_below_jerk_band_still_completes() {
        // Request velocity so small the profile lives in the jerk
        // deadband.
        let mut tc = seg(1.0, 0.001, 100.0, 1000.0);
        run_checked(&mut tc, 2_000_000);
        assert_eq!(tc.progress, tc.target);
    }
}
