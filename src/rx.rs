//! Receive pin-edge ISR state machine.
//!
//! Every edge on the receive pin lands here with a CPU-cycle timestamp.
//! The interval since the previous edge, corrected by the latency carry,
//! tells how many equal bits just went by; the bits are shifted into a
//! 10-bit symbol register and published one byte per full symbol. The
//! machine walks the head descriptor of the receive queue through
//! SEARCHING (SOF match), LOADING (data bytes) and WAITING_ACK (one-shot
//! timeout), then commits it for the consumer.
//!
//! Everything here runs on the per-edge time budget: no locks, no
//! allocation, no logging.

use crate::bus::VanBus;
use crate::config::frame::{
    EOD_MIN_LAST_RUN_BITS, MAX_EQUAL_BITS, MIN_PACKET_LEN, SOF_BYTE,
};
use crate::frame;
use crate::hal;
use crate::packet::{Ack, RxPacket, RxResult, RxState};

/// Decoder state owned exclusively by the pin-change ISR (and the ACK
/// timeout it arms).
pub(crate) struct RxIsr {
    /// Cycle counter at the previous accepted edge.
    prev_cycles: u32,
    /// Logical pin level sampled at the previous edge; the level the line
    /// held during the interval that just ended.
    prev_level: bool,
    /// The pin flipped between ISR entry and return last time; the edge for
    /// that flip may have been merged into this call.
    level_changed_during_isr: bool,
    /// Latency carry for the bit-timing estimator.
    jitter: u32,
    /// Bit position within the current 10-bit symbol, 0..10.
    at_bit: u32,
    /// Shift register; bits above `at_bit` belong to published symbols.
    shift_reg: u32,
}

impl RxIsr {
    pub(crate) const fn new() -> Self {
        RxIsr {
            prev_cycles: 0,
            prev_level: true,
            level_changed_during_isr: false,
            jitter: 0,
            at_bit: 0,
            shift_reg: 0,
        }
    }

    fn reset_bits(&mut self) {
        self.at_bit = 0;
        self.shift_reg = 0;
        self.jitter = 0;
    }

    /// 1-indexed ordinal of the bit at `self.at_bit`, counting only
    /// non-Manchester bits from the start of the packet.
    fn uncertain_ordinal(&self, pkt: &RxPacket) -> u16 {
        let mut data_bits = 0u32;
        for p in 1..=self.at_bit {
            // Manchester bits sit at symbol positions 5 and 0, which the
            // shift counter reaches at 5 and 10 (modulo one symbol).
            if p % 10 != 5 && p % 10 != 0 {
                data_bits += 1;
            }
        }
        (pkt.len() as u32 * 8 + data_bits) as u16
    }

    /// Pin-change interrupt entry.
    pub(crate) fn pin_change(&mut self, bus: &VanBus) {
        let platform = bus.platform();
        let level = hal::rx_level(platform);
        let now = platform.cycle_count();
        let n_cycles = now.wrapping_sub(self.prev_cycles);

        // A same-level edge shorter than one bit is electrical noise,
        // unless the pin flipped while the previous call was still running
        // (then the intermediate edge was merged into this one).
        if level == self.prev_level
            && !self.level_changed_during_isr
            && n_cycles.saturating_add(self.jitter) < bus.clock().one_bit_min()
        {
            return;
        }

        let same_level = level == self.prev_level;
        let series_one = self.prev_level;
        self.prev_cycles = now;
        self.prev_level = level;
        self.level_changed_during_isr = false;

        // Every edge is media activity; the transmit IFS counts from here.
        bus.touch_media_access(now);

        let queue = bus.rx_queue();
        if queue.is_full() {
            // The head descriptor is still DONE: the consumer is behind.
            queue.note_overrun();
            self.exit(bus, level);
            return;
        }

        // Safety: producer context; the queue is not full.
        let pkt = unsafe { queue.head_packet() };
        match pkt.state() {
            RxState::Vacant => {
                let n_bits = bus.clock().bits_sof(n_cycles, &mut self.jitter);
                if !level {
                    // Falling edge out of idle: a frame may be starting.
                    pkt.begin();
                    self.at_bit = 0;
                    self.shift_reg = 0;
                } else if (3..=5).contains(&n_bits) {
                    // Late detection: the falling edge was missed and the
                    // dominant SOF run already elapsed. Start mid-symbol
                    // with the zeros implied.
                    pkt.begin();
                    self.at_bit = n_bits;
                    self.shift_reg = 0;
                }
            }
            RxState::Searching | RxState::Loading => {
                self.load_bits(bus, pkt, n_cycles, same_level, series_one);
            }
            RxState::WaitingAck => {
                let _ = bus.clock().bits(n_cycles, &mut self.jitter);
                if pkt.ack() == Ack::Ack {
                    // Already acknowledged; edges until the timeout commits
                    // are the tail of the ACK pulse.
                } else if (bus.timing().ack_min..=bus.timing().ack_max).contains(&n_cycles) {
                    pkt.set_ack(Ack::Ack);
                } else {
                    // Not an ACK: the EOD detection fired early and this is
                    // the first "1" of the next byte. Resume loading the
                    // same descriptor.
                    platform.cancel_ack_timer();
                    pkt.set_state(RxState::Loading);
                    self.at_bit = 1;
                    self.shift_reg = 1;
                }
            }
            // Unreachable: a DONE head slot is the queue-full case above.
            RxState::Done => {}
        }
        self.exit(bus, level);
    }

    /// One-shot ACK timer expiry: commit the packet waiting for its ACK.
    pub(crate) fn ack_timeout(&mut self, bus: &VanBus) {
        let queue = bus.rx_queue();
        if queue.is_full() {
            return;
        }
        // Safety: producer context (the timer is armed by the pin ISR).
        let pkt = unsafe { queue.head_packet() };
        if pkt.state() == RxState::WaitingAck {
            self.commit(bus);
        }
    }

    /// Shifts a run of `n_bits` equal bits into the symbol register and
    /// publishes completed symbols.
    fn load_bits(
        &mut self,
        bus: &VanBus,
        pkt: &mut RxPacket,
        n_cycles: u32,
        same_level: bool,
        series_one: bool,
    ) {
        let searching = pkt.state() == RxState::Searching;
        let mut n_bits = if searching {
            bus.clock().bits_sof(n_cycles, &mut self.jitter)
        } else {
            bus.clock().bits(n_cycles, &mut self.jitter)
        };
        if searching && n_bits == 0 {
            // While hunting for the SOF, take the minimum interpretation.
            n_bits = 1;
        }

        if n_bits == 0 {
            // Sub-bit interval: the previous classification over-counted by
            // one. Rewrite the last recorded bit with this run's level.
            if series_one {
                self.shift_reg |= 1;
            } else {
                self.shift_reg &= !1;
            }
            return;
        }

        if n_bits > MAX_EQUAL_BITS {
            if searching {
                pkt.reset();
                self.reset_bits();
            } else {
                pkt.set_result(RxResult::NBitsErr);
                self.commit(bus);
            }
            return;
        }

        self.shift_reg = (self.shift_reg << n_bits) & 0xF_FFFF;
        if series_one {
            self.shift_reg |= (1 << n_bits) - 1;
        }
        let mut flipped_last = false;
        if same_level {
            // The transition ending this run was never seen: the run holds
            // two merged series. Flipping the middle recovers the usual
            // Manchester-legal patterns.
            let mut mask = ((1u32 << n_bits) - 1) & !(1 << (n_bits - 1)) & !1;
            if self.jitter > bus.timing().flip_last_bit_carry {
                mask |= 1;
                flipped_last = true;
            }
            self.shift_reg ^= mask;
        }
        self.at_bit += n_bits;

        if !searching {
            // Low-confidence positions for the CRC repair: an ambiguous
            // final-bit flip, or a 3-bit run ending exactly on a
            // Manchester slot.
            if flipped_last || (n_bits == 3 && (self.at_bit == 5 || self.at_bit == 10)) {
                pkt.set_uncertain_bit1(self.uncertain_ordinal(pkt));
            }
        }

        while self.at_bit >= 10 {
            let sym = ((self.shift_reg >> (self.at_bit - 10)) & 0x3FF) as u16;
            self.at_bit -= 10;
            if pkt.state() == RxState::Searching {
                if frame::is_sof(sym) {
                    // Near-patterns are normalized: the stored byte is
                    // always the canonical SOF.
                    pkt.push_byte(SOF_BYTE);
                    pkt.set_state(RxState::Loading);
                } else {
                    pkt.reset();
                    self.reset_bits();
                    return;
                }
            } else {
                #[cfg(feature = "strict-manchester")]
                if !frame::manchester_ok(sym) {
                    pkt.set_result(RxResult::ManchesterErr);
                    self.commit(bus);
                    return;
                }
                if !pkt.push_byte(frame::byte_from_symbol(sym)) {
                    pkt.set_result(RxResult::MaxPacketErr);
                    self.commit(bus);
                    return;
                }
                if self.at_bit == 0
                    && sym & 0x003 == 0
                    && pkt.len() >= MIN_PACKET_LEN
                    && n_bits >= EOD_MIN_LAST_RUN_BITS
                {
                    pkt.set_state(RxState::WaitingAck);
                    bus.platform().arm_ack_timer(bus.timing().ack_timeout);
                    return;
                }
            }
        }
    }

    /// Commits the head descriptor and returns the decoder to idle.
    fn commit(&mut self, bus: &VanBus) {
        bus.rx_queue().commit_head(bus.platform().millis());
        self.reset_bits();
    }

    /// ISR epilogue: remember whether the line moved while we were busy.
    fn exit(&mut self, bus: &VanBus, entry_level: bool) {
        let exit_level = hal::rx_level(bus.platform());
        if exit_level != entry_level {
            self.level_changed_during_isr = true;
            self.prev_level = exit_level;
        }
        bus.record_isr_sample(self, entry_level);
    }

    #[cfg(feature = "debug-capture")]
    pub(crate) fn sample_fields(&self) -> (u32, u32, u32, u16) {
        (self.prev_cycles, self.jitter, self.at_bit, self.shift_reg as u16)
    }

    /// Test hook: pretend an edge was seen at `cycles` leaving the line at
    /// `level`.
    #[cfg(test)]
    pub(crate) fn force_edge_history(&mut self, cycles: u32, level: bool) {
        self.prev_cycles = cycles;
        self.prev_level = level;
    }
}
