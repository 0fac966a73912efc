//! Per-cycle I/O pin image.
//!
//! The low-level I/O layer is an external collaborator; each servo
//! cycle it fills the input half of these structs before the cycle
//! body runs and applies the output half afterwards. One logical slot
//! per signal, plain data throughout.

use crate::consts::{MAX_AIO, MAX_DIO, MAX_JOINTS};

// ─── Per-Joint Pins ─────────────────────────────────────────────────

/// Pin image for one joint.
#[derive(Debug, Clone, Copy, Default)]
pub struct JointIo {
    // ── Inputs ──
    /// Absolute motor position feedback [motor units].
    pub motor_pos_fb: f64,
    /// Positive / negative hard limit switches.
    pub pos_lim_sw: bool,
    pub neg_lim_sw: bool,
    /// Home switch input.
    pub home_sw: bool,
    /// Amplifier fault input.
    pub amp_fault: bool,
    /// Jogwheel count accumulator.
    pub jog_counts: i32,
    /// Distance per jogwheel count [user units].
    pub jog_scale: f64,
    /// Jogwheel routed to this joint.
    pub jog_enable: bool,
    /// Index-pulse handshake: the controller raises it, the encoder
    /// driver clears it (and zeroes its counter) at the next index.
    pub index_enable: bool,
    /// Motor position latched by the probe/homing capture hardware.
    pub probed_pos: f64,

    // ── Outputs ──
    /// Motor position command [motor units].
    pub motor_pos_cmd: f64,
    /// Amplifier enable.
    pub amp_enable: bool,
}

// ─── Machine-Level Pins ─────────────────────────────────────────────

/// Pin image for machine-wide signals.
#[derive(Debug, Clone, Copy)]
pub struct MachineIo {
    // ── Inputs ──
    /// External enable (estop chain closed).
    pub enable: bool,
    /// Feed hold input.
    pub feed_hold: bool,
    /// Adaptive feed input, clamped to [0, 1] on read.
    pub adaptive_feed: f64,
    /// Probe contact input.
    pub probe_input: bool,
    /// Accumulated spindle revolutions from the encoder.
    pub spindle_revs: f64,
    /// Measured spindle speed [rev/s].
    pub spindle_speed_in: f64,
    /// Spindle has reached its commanded speed.
    pub spindle_is_atspeed: bool,
    /// Spindle index handshake, same protocol as the joint one.
    pub spindle_index_enable: bool,
    /// Per-joint locking-indexer unlocked confirmations.
    pub rotary_is_unlocked: [bool; MAX_JOINTS],
    /// Motion-synchronized digital inputs.
    pub synch_di: [bool; MAX_DIO],
    /// Analog inputs.
    pub analog_in: [f64; MAX_AIO],

    // ── Outputs ──
    /// Spindle speed command [rev/s], signed.
    pub spindle_speed_out: f64,
    /// Per-joint locking-indexer unlock requests.
    pub rotary_unlock: [bool; MAX_JOINTS],
    /// Motion-synchronized digital outputs.
    pub synch_do: [bool; MAX_DIO],
    /// Analog outputs.
    pub analog_out: [f64; MAX_AIO],
}

impl Default for MachineIo {
    fn default() -> Self {
        Self {
            enable: false,
            feed_hold: false,
            adaptive_feed: 1.0,
            probe_input: false,
            spindle_revs: 0.0,
            spindle_speed_in: 0.0,
            spindle_is_atspeed: false,
            spindle_index_enable: false,
            rotary_is_unlocked: [false; MAX_JOINTS],
            synch_di: [false; MAX_DIO],
            analog_in: [0.0; MAX_AIO],
            spindle_speed_out: 0.0,
            rotary_unlock: [false; MAX_JOINTS],
            synch_do: [false; MAX_DIO],
            analog_out: [0.0; MAX_AIO],
        }
    }
}
