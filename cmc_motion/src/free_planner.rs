//! Single-DOF trapezoidal position planner.
//!
//! Plans one joint independently toward `pos_cmd`: each cycle a
//! velocity request is derived from the acceleration-limited stopping
//! distance to the target, then slewed at the acceleration limit.
//! Used for free-mode jogs, homing moves, and anywhere a lone joint
//! needs to reach a point without the coordinated queue.

/// Per-joint free planner state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreePlanner {
    /// Commanded target position [user units].
    pub pos_cmd: f64,
    pub curr_pos: f64,
    /// Current velocity [user units/s].
    pub curr_vel: f64,
    /// Limits [user units/s, /s²].
    pub max_vel: f64,
    pub max_acc: f64,
    /// Planner runs only while enabled; disabling mid-move stops at
    /// the acceleration limit.
    pub enable: bool,
    /// True while in motion.
    pub active: bool,
}

impl FreePlanner {
    /// Advance one servo period of `dt` seconds.
    pub fn update(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let max_dv = self.max_acc * dt;
        let tiny_dp = max_dv * dt * 0.001;

        let vel_req = if self.enable {
            let pos_err = self.pos_cmd - self.curr_pos;
            if pos_err > tiny_dp {
                -max_dv + (2.0 * self.max_acc * pos_err + max_dv * max_dv).sqrt()
            } else if pos_err < -tiny_dp {
                max_dv - (-2.0 * self.max_acc * pos_err + max_dv * max_dv).sqrt()
            } else {
                // Within one increment of target: land exactly.
                self.active = false;
                pos_err / dt
            }
        } else {
            0.0
        };

        let vel_req = vel_req.clamp(-self.max_vel, self.max_vel);

        // Accel-limited slew toward the request.
        if vel_req > self.curr_vel + max_dv {
            self.curr_vel += max_dv;
        } else if vel_req < self.curr_vel - max_dv {
            self.curr_vel -= max_dv;
        } else {
            self.curr_vel = vel_req;
        }
        if self.curr_vel != 0.0 {
            self.active = true;
        }
        self.curr_pos += self.curr_vel * dt;
    }

    /// Hard stop: zero velocity, hold position, drop the target onto
    /// the current position.
    pub fn stop_here(&mut self) {
        self.curr_vel = 0.0;
        self.pos_cmd = self.curr_pos;
        self.active = false;
        self.enable = false;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
