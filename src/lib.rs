//! Software-defined VAN bus transceiver.
//!
//! A 125 kbit/s Vehicle Area Network transceiver for 32-bit
//! microcontrollers that have GPIO and hardware timers but no dedicated
//! VAN/CAN peripheral. Frames are recovered from a single pin-change
//! interrupt by measuring inter-edge CPU-cycle intervals, compensating for
//! interrupt latency, and walking a byte-level state machine through
//! start-of-frame, data, end-of-data and acknowledgement. Transmission
//! emits one Enhanced-Manchester bit per timer tick with wired-AND
//! collision detection and inter-frame-space arbitration.
//!
//! The crate is `no_std`; hardware access goes through the
//! [`hal::Platform`] trait supplied by the integrating firmware, which also
//! wires its interrupts to [`on_rx_pin_change`], [`on_ack_timer`] and
//! [`on_tx_timer_tick`]. The test suite runs on the host against a mock
//! platform.
//!
//! ```ignore
//! vanbus::setup(&PLATFORM, 2, Some(4));
//! let mut pkt = vanbus::RxPacket::new();
//! loop {
//!     if vanbus::receive(&mut pkt, None) && pkt.check_crc() {
//!         handle(pkt.iden(), pkt.data());
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

pub mod config;
pub mod hal;

mod bus;
#[cfg(feature = "debug-capture")]
mod capture;
mod crc;
mod error;
mod frame;
mod packet;
mod queue;
mod rx;
mod stats;
#[cfg(test)]
mod test_support;
mod timing;
mod tx;

pub use bus::{
    VanBus, available, bus, dump_stats, max_queued, on_ack_timer, on_rx_pin_change,
    on_tx_timer_tick, queue_size, queued, receive, rx_count, send_async, send_sync,
    set_drop_policy, setup, tx_count,
};
#[cfg(feature = "debug-capture")]
pub use capture::{IfsSample, IsrSample};
pub use crc::RepairStats;
pub use error::{VanError, VanResult};
pub use hal::Platform;
pub use packet::{Ack, CommandFlags, PacketPredicate, RxPacket, RxResult, RxState};
pub use queue::DropPolicy;
pub use timing::BitClock;
