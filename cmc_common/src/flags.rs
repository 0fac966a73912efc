//! Flag words for joints, the motion controller, and per-move enables.
//!
//! All flag types use the `bitflags` crate. The joint flag word is
//! copied verbatim into the status snapshot each cycle.

use bitflags::bitflags;

bitflags! {
    /// Per-joint status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct JointFlags: u16 {
        /// Joint exists in this configuration.
        const ACTIVE      = 0x0001;
        /// Amplifier enabled.
        const ENABLED     = 0x0002;
        /// Joint has stopped at its commanded position.
        const INPOS       = 0x0004;
        /// Joint-level error latched.
        const ERROR       = 0x0008;
        /// Positive hard limit switch tripped.
        const POS_LIMIT   = 0x0010;
        /// Negative hard limit switch tripped.
        const NEG_LIMIT   = 0x0020;
        /// Home switch input currently active.
        const HOME_SW     = 0x0040;
        /// Homing procedure in progress.
        const HOMING      = 0x0080;
        /// Joint has been homed since startup (or since VOLATILE_HOME
        /// cleared it).
        const HOMED       = 0x0100;
        /// Joint is at its home position and has not moved since.
        const AT_HOME     = 0x0200;
        /// Following error exceeded its limit.
        const FERROR      = 0x0400;
        /// Amplifier fault input active.
        const AMP_FAULT   = 0x0800;
    }
}

impl Default for JointFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Motion-controller-level status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MotionFlags: u16 {
        /// Motion (all amplifiers) enabled.
        const ENABLE = 0x0001;
        /// All commanded motion has completed.
        const INPOS  = 0x0002;
        /// Coordinated (queued trajectory) mode.
        const COORD  = 0x0004;
        /// Motion-level error latched.
        const ERROR  = 0x0008;
        /// Teleoperation (Cartesian jog) mode.
        const TELEOP = 0x0010;
    }
}

impl Default for MotionFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Enable bits queued with each move: which override inputs may
    /// scale the feed and spindle while that move executes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FeedEnables: u8 {
        /// Feed override slider applies.
        const FEED_SCALE    = 0x01;
        /// Adaptive feed input applies.
        const ADAPTIVE_FEED = 0x02;
        /// Feed hold input applies.
        const FEED_HOLD     = 0x04;
        /// Spindle override slider applies.
        const SPINDLE_SCALE = 0x08;
    }
}

impl Default for FeedEnables {
    fn default() -> Self {
        Self::empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joint_flags_roundtrip() {
        for flag in [
            JointFlags::ACTIVE,
            JointFlags::ENABLED,
            JointFlags::INPOS,
            JointFlags::ERROR,
            JointFlags::POS_LIMIT,
            JointFlags::NEG_LIMIT,
            JointFlags::HOME_SW,
            JointFlags::HOMING,
            JointFlags::HOMED,
            JointFlags::AT_HOME,
            JointFlags::FERROR,
            JointFlags::AMP_FAULT,
        ] {
            let bits = flag.bits();
            assert_eq!(JointFlags::from_bits(bits).unwrap(), flag);
        }
    }

    #[test]
    fn defaults_are_empty() {
        assert!(JointFlags::default().is_empty());
        assert!(MotionFlags::default().is_empty());
        assert!(FeedEnables::default().is_empty());
    }

    #[test]
    fn insert_remove() {
        let mut f = JointFlags::default();
        f.insert(JointFlags::HOMED | JointFlags::AT_HOME);
        assert!(f.contains(JointFlags::HOMED));
        f.remove(JointFlags::AT_HOME);
        assert!(f.contains(JointFlags::HOMED));
        assert!(!f.contains(JointFlags::AT_HOME));
    }
}
