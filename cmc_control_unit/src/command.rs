//! Command mailbox between the task thread and the servo cycle.
//!
//! Single-slot with a sequence-number handshake: the producer fills
//! the slot and bumps `serial`; the consumer processes when `serial`
//! differs from its `echo`, then publishes `echo = serial` together
//! with an acknowledge status. A later command overwrites an
//! unconsumed earlier one, which is the intended last-writer-wins
//! semantics for operator input.

use cmc_common::consts::MAX_AXES;
use cmc_common::flags::FeedEnables;

/// Operating-mode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    Free,
    Coord,
    Teleop,
}

/// Commands the task thread may issue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Enable / disable all motion.
    Enable,
    Disable,
    SetMode(ModeRequest),

    // ── Overrides ──
    SetFeedScale(f64),
    SetSpindleScale(f64),
    /// Which override inputs apply to subsequent moves.
    SetEnables(FeedEnables),

    // ── Program flow ──
    Pause,
    Resume,
    /// Resume for a single motion id, then pause again.
    Step,
    Abort,

    // ── Jogging (free mode) ──
    JogCont { joint: usize, vel: f64 },
    JogIncr { joint: usize, dist: f64, vel: f64 },
    JogAbort { joint: usize },

    // ── Homing ──
    /// Home one joint, or all (sequence driver) with `joint = None`.
    Home { joint: Option<usize> },
    HomeAbort,

    // ── Teleop ──
    SetTeleopVector { vel: [f64; MAX_AXES] },

    // ── Probe ──
    StartProbe { probe_type: u8 },
    ClearProbe,

    // ── Spindle ──
    SpindleOn { speed_rps: f64, css_factor: f64, css_xoffset: f64 },
    SpindleOff,
    SetSpindleSpeed(f64),

    /// Clear a latched hard-limit override mask.
    OverrideLimits,
}

/// Acknowledge state published back to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandAck {
    #[default]
    None,
    Done,
    /// Command could not be executed in the current state.
    Rejected,
}

/// The single-slot mailbox.
#[derive(Debug, Default)]
pub struct CommandMailbox {
    slot: Option<Command>,
    serial: u32,
    echo: u32,
    ack: CommandAck,
}

impl CommandMailbox {
    /// Producer: submit a command, returning its serial number.
    pub fn submit(&mut self, command: Command) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.slot = Some(command);
        self.serial
    }

    /// Consumer: take the pending command, if any is unprocessed.
    pub fn take(&mut self) -> Option<Command> {
        if self.serial == self.echo {
            return None;
        }
        self.echo = self.serial;
        self.slot.take()
    }

    /// Consumer: publish the outcome of the last taken command.
    pub fn acknowledge(&mut self, ack: CommandAck) {
        self.ack = ack;
    }

    /// Producer: poll completion of a submitted command.
    pub fn echo(&self) -> (u32, CommandAck) {
        (self.echo, self.ack)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
