//! Backlash and leadscrew compensation.
//!
//! Two stages each cycle. First the raw correction is looked up: a
//! table interpolation (forward or reverse trim + slope, selected by
//! the sign of the commanded velocity) or, with no table, ±half the
//! configured backlash. The raw value steps on direction reversals,
//! so a second stage ramps the applied correction toward it with a
//! look-ahead velocity profile, capped at half the joint's velocity
//! and acceleration limits so compensation added on top of normal
//! motion cannot push the total past 150% of either.

use crate::joint::JointRuntime;

/// Stage one: compute `backlash_corr` from the table or the plain
/// backlash value. Leaves the correction untouched while the joint is
/// stationary.
pub fn compute_correction(joint: &mut JointRuntime) {
    if !joint.comp.is_empty() {
        // Walk the cursor to the span containing pos_cmd.
        let entries = &joint.comp.entries;
        while joint.comp_cursor > 0 && joint.pos_cmd < entries[joint.comp_cursor].nominal {
            joint.comp_cursor -= 1;
        }
        while joint.comp_cursor + 1 < entries.len()
            && joint.pos_cmd >= entries[joint.comp_cursor + 1].nominal
        {
            joint.comp_cursor += 1;
        }
        let e = &entries[joint.comp_cursor];
        let dpos = joint.pos_cmd - e.nominal;
        if joint.vel_cmd > 0.0 {
            joint.backlash_corr = e.fwd_trim + e.fwd_slope * dpos;
        } else if joint.vel_cmd < 0.0 {
            joint.backlash_corr = e.rev_trim + e.rev_slope * dpos;
        }
    } else {
        if joint.vel_cmd > 0.0 {
            joint.backlash_corr = 0.5 * joint.cfg.backlash;
        } else if joint.vel_cmd < 0.0 {
            joint.backlash_corr = -0.5 * joint.cfg.backlash;
        }
    }
}

/// Stage two: ramp `backlash_filt` toward `backlash_corr`.
///
/// The ramp looks ahead one period: depending on the distance still
/// to cover it accelerates, cruises, or decelerates, and lands on the
/// target exactly instead of oscillating around it.
pub fn ramp_filter(joint: &mut JointRuntime, period: f64, net_feed_scale: f64) {
    let v_max = 0.5 * joint.cfg.max_velocity * net_feed_scale;
    let a_max = 0.5 * joint.cfg.max_acceleration;
    if a_max <= 0.0 || period <= 0.0 {
        joint.backlash_filt = joint.backlash_corr;
        joint.backlash_vel = 0.0;
        return;
    }
    let v = joint.backlash_vel;

    if joint.backlash_corr >= joint.backlash_filt {
        let s_to_go = joint.backlash_corr - joint.backlash_filt;
        if s_to_go > 0.0 {
            let ds_vel = v * period;
            let mut dv_acc = a_max * period;
            let ds_stop = 0.5 * (v + dv_acc) * (v + dv_acc) / a_max;
            if s_to_go <= ds_stop + ds_vel {
                // Ramp down.
                if v > dv_acc {
                    let ds_acc = 0.5 * dv_acc * period;
                    joint.backlash_vel -= dv_acc;
                    joint.backlash_filt += ds_vel - ds_acc;
                } else {
                    // Last step to target.
                    joint.backlash_vel = 0.0;
                    joint.backlash_filt = joint.backlash_corr;
                }
            } else {
                if v + dv_acc > v_max {
                    dv_acc = (v_max - v).max(0.0);
                }
                let ds_acc = 0.5 * dv_acc * period;
                let ds_stop = 0.5 * (v + dv_acc) * (v + dv_acc) / a_max;
                if s_to_go > ds_stop + ds_vel + ds_acc {
                    // Ramp up.
                    joint.backlash_vel += dv_acc;
                    joint.backlash_filt += ds_vel + ds_acc;
                } else {
                    // Constant velocity.
                    joint.backlash_filt += ds_vel;
                }
            }
        }
    } else {
        let s_to_go = joint.backlash_filt - joint.backlash_corr;
        if s_to_go > 0.0 {
            let ds_vel = -v * period;
            let mut dv_acc = a_max * period;
            let ds_stop = 0.5 * (v - dv_acc) * (v - dv_acc) / a_max;
            if s_to_go <= ds_stop + ds_vel {
                if -v > dv_acc {
                    let ds_acc = 0.5 * dv_acc * period;
                    joint.backlash_vel += dv_acc;
                    joint.backlash_filt -= ds_vel - ds_acc;
                } else {
                    joint.backlash_vel = 0.0;
                    joint.backlash_filt = joint.backlash_corr;
                }
            } else {
                if -v + dv_acc > v_max {
                    dv_acc = (v_max + v).max(0.0);
                }
                let ds_acc = 0.5 * dv_acc * period;
                let ds_stop = 0.5 * (v - dv_acc) * (v - dv_acc) / a_max;
                if s_to_go > ds_stop + ds_vel + ds_acc {
                    joint.backlash_vel -= dv_acc;
                    joint.backlash_filt -= ds_vel + ds_acc;
                } else {
                    joint.backlash_filt -= ds_vel;
                }
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cmc_common::config::{CompEntry, CompFileType, CompTable, JointConfig};

    const DT: f64 = 0.001;

    fn joint_with_backlash(backlash: f64) -> JointRuntime {
        let cfg = JointConfig {
            joint_type: Default::default(),
            min_limit: -100.0,
            max_limit: 100.0,
            max_velocity: 20.0,
            max_acceleration: 200.0,
            max_jerk: 2000.0,
            ferror: 1.0,
            min_ferror: 0.1,
            backlash,
            comp_file: None,
            comp_file_type: CompFileType::Triplet,
            home: 0.0,
            home_offset: 0.0,
            home_search_vel: 0.0,
            home_latch_vel: 0.0,
            home_final_vel: 0.0,
            home_sequence: -1,
            home_use_index: false,
            home_ignore_limits: false,
            home_is_shared: false,
            home_unlock_first: false,
            volatile_home: false,
            locking_indexer: false,
        };
        JointRuntime::with_table(cfg, CompTable::default())
    }

    fn table() -> CompTable {
        CompTable {
            entries: vec![
                CompEntry { nominal: 0.0, fwd_trim: 0.01, fwd_slope: 0.0, rev_trim: -0.01, rev_slope: 0.0 },
                CompEntry { nominal: 10.0, fwd_trim: 0.02, fwd_slope: 0.001, rev_trim: -0.02, rev_slope: 0.001 },
                CompEntry { nominal: 20.0, fwd_trim: 0.03, fwd_slope: 0.0, rev_trim: -0.03, rev_slope: 0.0 },
            ],
        }
    }

    #[test]
    fn plain_backlash_sign_follows_direction() {
        let mut j = joint_with_backlash(0.1);
        j.vel_cmd = 1.0;
        compute_correction(&mut j);
        assert_eq!(j.backlash_corr, 0.05);

        j.vel_cmd = -1.0;
        compute_correction(&mut j);
        assert_eq!(j.backlash_corr, -0.05);

        // Stationary: hold the previous value.
        j.vel_cmd = 0.0;
        compute_correction(&mut j);
        assert_eq!(j.backlash_corr, -0.05);
    }

    #[test]
    fn table_interpolation_and_cursor_walk() {
        let mut j = joint_with_backlash(0.0);
        j.comp = table();
        j.vel_cmd = 1.0;

        j.pos_cmd = 12.0;
        compute_correction(&mut j);
        assert_eq!(j.comp_cursor, 1);
        assert!((j.backlash_corr - (0.02 + 0.001 * 2.0)).abs() < 1e-12);

        // Move back below the first span boundary.
        j.pos_cmd = 3.0;
        j.vel_cmd = -1.0;
        compute_correction(&mut j);
        assert_eq!(j.comp_cursor, 0);
        assert!((j.backlash_corr + 0.01).abs() < 1e-12);

        // And forward past the last boundary.
        j.pos_cmd = 25.0;
        j.vel_cmd = 1.0;
        compute_correction(&mut j);
        assert_eq!(j.comp_cursor, 2);
        assert!((j.backlash_corr - 0.03).abs() < 1e-12);
    }

    #[test]
    fn filter_converges_without_overshoot() {
        let mut j = joint_with_backlash(0.1);
        j.vel_cmd = 1.0;
        compute_correction(&mut j);

        let mut peak: f64 = f64::MIN;
        for _ in 0..10_000 {
            ramp_filter(&mut j, DT, 1.0);
            peak = peak.max(j.backlash_filt);
        }
        assert!((j.backlash_filt - 0.05).abs() < 1e-12);
        assert_eq!(j.backlash_vel, 0.0);
        assert!(peak <= 0.05 + 1e-12, "overshoot to {peak}");
    }

    #[test]
    fn filter_symmetric_on_reversal() {
        let mut j = joint_with_backlash(0.1);
        j.vel_cmd = 1.0;
        compute_correction(&mut j);
        for _ in 0..10_000 {
            ramp_filter(&mut j, DT, 1.0);
        }
        assert!((j.backlash_filt - 0.05).abs() < 1e-12);

        j.vel_cmd = -1.0;
        compute_correction(&mut j);
        let mut low: f64 = f64::MAX;
        for _ in 0..10_000 {
            ramp_filter(&mut j, DT, 1.0);
            low = low.min(j.backlash_filt);
        }
        assert!((j.backlash_filt + 0.05).abs() < 1e-12);
        assert!(low >= -0.05 - 1e-12);
    }

    #[test]
    fn filter_velocity_respects_half_limits() {
        let mut j = joint_with_backlash(10.0); // huge step to observe cruise
        j.vel_cmd = 1.0;
        compute_correction(&mut j);
        let mut max_vel: f64 = 0.0;
        let mut prev_filt = j.backlash_filt;
        for _ in 0..20_000 {
            ramp_filter(&mut j, DT, 1.0);
            let v = (j.backlash_filt - prev_filt) / DT;
            max_vel = max_vel.max(v.abs());
            prev_filt = j.backlash_filt;
        }
        // Cap is half of max_velocity (plus one accel quantum of
        // discretization).
        assert!(max_vel <= 0.5 * 20.0 + 0.5 * 200.0 * DT + 1e-9, "vel {max_vel}");
    }

    #[test]
    fn feed_scale_lowers_ramp_speed() {
        let mut fast = joint_with_backlash(1.0);
        let mut slow = joint_with_backlash(1.0);
        fast.vel_cmd = 1.0;
        slow.vel_cmd = 1.0;
        compute_correction(&mut fast);
        compute_correction(&mut slow);
        for _ in 0..200 {
            ramp_filter(&mut fast, DT, 1.0);
            ramp_filter(&mut slow, DT, 0.25);
        }
        assert!(fast.backlash_filt > slow.backlash_filt);
    }
}
