//! Configuration constants for the transceiver.
//!
//! All timing numbers are expressed in CPU cycles at the 80 MHz reference
//! clock and are scaled at setup time by `F_CPU / 80 MHz` (see
//! [`crate::timing::BitClock`]). The bit-timing tables are empirical: they
//! were measured on a live bus, not derived from the nominal bit time, and
//! are grouped here so they can be retuned without touching the state
//! machine.

use const_env::from_env;

/// VAN bus bit rate in bits per second.
pub const BIT_RATE: u32 = 125_000;

/// Reference CPU frequency the cycle tables below were measured at.
pub const REF_CPU_HZ: u32 = 80_000_000;

/// Nominal bit time in CPU cycles at [`REF_CPU_HZ`] (8 us).
pub const NOMINAL_BIT_CYCLES: u32 = 640;

/// Nominal bit time in nanoseconds.
pub const BIT_TIME_NS: u32 = 1_000_000_000 / BIT_RATE;

/// Swaps the dominant/recessive pin levels for boards wired through an
/// inverting transceiver stage. Set the `VAN_BIT_INVERTED_WIRING`
/// environment variable at build time to override.
#[from_env]
pub const VAN_BIT_INVERTED_WIRING: bool = false;

/// Number of slots in the receive queue.
#[from_env]
pub const VAN_RX_QUEUE_SIZE: usize = 15;

/// Number of slots in the transmit queue.
#[from_env]
pub const VAN_TX_QUEUE_SIZE: usize = 5;

/// Bit-timing estimator tables (cycles at [`REF_CPU_HZ`]).
pub mod timing {
    /// Upper bounds of the 0..=5 bit classes, half-open intervals.
    ///
    /// An interval below `CLASS_BOUNDS[n]` (and at or above
    /// `CLASS_BOUNDS[n - 1]`) counts as `n` bits. Longer intervals fall
    /// through to the linear formula below. Measured bits run slightly
    /// long on a real bus, which is why the bounds sit well above
    /// `n * 640`.
    pub const CLASS_BOUNDS: [u32; 6] = [482, 1293, 1893, 2470, 3164, 3795];

    /// Carry floors per class. The part of an interval above the floor is
    /// treated as interrupt latency and carried into the next
    /// classification, so a stretched interval followed by a compressed one
    /// cancels out instead of compounding.
    pub const CARRY_FLOORS: [u32; 6] = [160, 717, 1384, 2051, 2718, 3385];

    /// Effective bit time used by the linear formula for runs of 6+ bits.
    pub const LONG_RUN_BIT_CYCLES: u32 = 667;

    /// Rounding offset of the linear formula:
    /// `n = (interval + LONG_RUN_OFFSET) / LONG_RUN_BIT_CYCLES`.
    pub const LONG_RUN_OFFSET: u32 = 200;

    /// Carry floor slack above `n * LONG_RUN_BIT_CYCLES` for long runs.
    pub const LONG_RUN_FLOOR_SLACK: u32 = 50;

    /// Replacement 3-to-4-bit class bound while matching the SOF. The two
    /// 4-bit runs at the start of a frame arrive measurably short.
    pub const SOF_CLASS_BOUND_3: u32 = 2326;

    /// Replacement 4-to-5-bit class bound while matching the SOF.
    pub const SOF_CLASS_BOUND_4: u32 = 3044;

    /// Leftover carry above which a missed-transition correction also flips
    /// the final bit of the block (the arrival was too late to trust it).
    pub const FLIP_LAST_BIT_CARRY: u32 = 318;
}

/// Frame layout constants.
pub mod frame {
    /// Start-of-frame 10-bit symbol: `00 0011 1101`.
    pub const SOF_SYMBOL: u16 = 0x03D;

    /// The SOF symbol after Manchester stripping, i.e. the first in-memory
    /// byte of every packet.
    pub const SOF_BYTE: u8 = 0x0E;

    /// Near-patterns accepted as SOF. Each encodes a common single-bit
    /// corruption of [`SOF_SYMBOL`] caused by a missed or late edge; the
    /// symbol is normalized to the canonical pattern before loading.
    pub const SOF_NEAR_PATTERNS: [u16; 12] = [
        0x01D, 0x07D, 0x03C, 0x039, 0x03B, 0x01E, 0x00D, 0x005, 0x001, 0x03F, 0x3FD, 0x13D,
    ];

    /// Maximum packet length in bytes, excluding ACK and EOF.
    pub const MAX_PACKET_LEN: usize = 33;

    /// Minimum packet length in bytes (SOF + IDEN/COM + CRC).
    pub const MIN_PACKET_LEN: usize = 5;

    /// Maximum payload length in bytes.
    pub const MAX_DATA_LEN: usize = 28;

    /// Maximum number of equal consecutive bits the decoder tolerates. The
    /// wire never carries more than five (six across an EOD), but a missed
    /// edge can merge two runs; eleven or more is unrecoverable.
    pub const MAX_EQUAL_BITS: u32 = 10;

    /// Minimum length, in bits, of the final dominant run of a valid EOD.
    pub const EOD_MIN_LAST_RUN_BITS: u32 = 2;
}

/// Acknowledgement-slot timing (cycles at [`REF_CPU_HZ`]).
pub mod ack {
    /// Shortest dominant pulse accepted as an in-frame ACK.
    pub const ACK_MIN_CYCLES: u32 = 650;

    /// Longest dominant pulse accepted as an in-frame ACK.
    pub const ACK_MAX_CYCLES: u32 = 1000;

    /// One-shot timeout after EOD before the packet is committed without an
    /// ACK: three time-slots (24 us).
    pub const ACK_TIMEOUT_CYCLES: u32 = 3 * super::NOMINAL_BIT_CYCLES;
}

/// Transmit scheduling constants.
pub mod tx {
    /// Inter-frame space: required bus quiescence before transmitting.
    pub const IFS_BIT_TIMES: u32 = 13;

    /// Collisions after which a frame is dropped.
    pub const MAX_COLLISIONS: u8 = 10;

    /// Resolution of the periodic transmit timer.
    pub const TIMER_TICK_NS: u32 = 200;

    /// Compensation added to the nominal bit period, in timer ticks. The
    /// integer division `BIT_TIME_NS / TIMER_TICK_NS` plus the interrupt
    /// dispatch overhead leaves the schedule running slightly fast; one
    /// extra tick re-centres the edges over a 33-byte frame. Retune per
    /// platform together with [`TIMER_TICK_NS`].
    pub const TIMER_COMPENSATION_TICKS: u32 = 1;

    /// Period of the transmit timer in nanoseconds: one bit time plus the
    /// platform compensation.
    pub const TIMER_PERIOD_NS: u32 =
        (super::BIT_TIME_NS / TIMER_TICK_NS + TIMER_COMPENSATION_TICKS) * TIMER_TICK_NS;
}
