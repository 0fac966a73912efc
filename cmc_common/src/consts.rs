//! Compile-time capacity bounds used to size fixed arrays.
//!
//! All runtime state is pre-allocated against these limits during
//! startup; the servo cycle never grows a collection past them.

/// Maximum number of joints (motor channels).
pub const MAX_JOINTS: usize = 9;

/// Maximum number of Cartesian axes (x y z a b c u v w).
pub const MAX_AXES: usize = 9;

/// Number of motion-synchronized digital I/O channels.
pub const MAX_DIO: usize = 64;

/// Number of motion-synchronized analog I/O channels.
pub const MAX_AIO: usize = 16;

/// Default segment queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 32;

/// Slots held back at the tail of the segment queue so the producer
/// sees "full" before the ring is physically exhausted.
pub const QUEUE_MARGIN: usize = 10;

/// Servo cycle time bounds [s].
pub const CYCLE_TIME_MIN: f64 = 50e-6;
pub const CYCLE_TIME_MAX: f64 = 0.1;

/// Number of cycle-period samples kept for overrun detection.
pub const CYCLE_HISTORY: usize = 5;

/// A period longer than this multiple of every sample in the history
/// window is reported as a realtime overrun.
pub const OVERRUN_RATIO: f64 = 1.2;

/// Settle delay between homing moves [s], so motion has ceased and
/// switch bouncing has ended before the next move starts.
pub const HOME_SETTLE_DELAY: f64 = 0.100;
