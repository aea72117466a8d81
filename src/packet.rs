//! Receive packet descriptors.
//!
//! One descriptor lives in each receive queue slot. The pin-change ISR is
//! the only writer while the slot is the producer head; once the state
//! reaches [`RxState::Done`] the descriptor is read-only until the consumer
//! copies it out and returns the slot to [`RxState::Vacant`].

use core::fmt;

use crate::config::frame::{MAX_PACKET_LEN, MIN_PACKET_LEN};
use crate::crc::{self, RepairStats};

/// Lifecycle of a receive descriptor, driven by the pin-change ISR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// No packet in progress in this slot.
    Vacant,
    /// Assembling the first ten bits, expecting the SOF pattern.
    Searching,
    /// Appending data bytes until the EOD.
    Loading,
    /// EOD seen; waiting for the ACK slot or the ACK timeout.
    WaitingAck,
    /// Committed; readable by the consumer.
    Done,
}

/// Outcome recorded in a committed descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxResult {
    /// The frame was assembled normally. The CRC may still be wrong.
    Ok,
    /// More than ten equal consecutive bits while loading.
    NBitsErr,
    /// A Manchester bit did not complement its neighbour.
    ManchesterErr,
    /// The frame exceeded the 33-byte maximum.
    MaxPacketErr,
}

impl RxResult {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            RxResult::Ok => "OK",
            RxResult::NBitsErr => "NBITS_ERR",
            RxResult::ManchesterErr => "MANCHESTER_ERR",
            RxResult::MaxPacketErr => "MAX_PACKET_ERR",
        }
    }
}

/// Whether a dominant pulse was seen in the ACK slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    NoAck,
}

impl Ack {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Ack::Ack => "ACK",
            Ack::NoAck => "NO_ACK",
        }
    }
}

bitflags::bitflags! {
    /// The four COM bits of a frame. EXT is fixed to 1 on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        const EXT  = 0x08;
        const RAK  = 0x04;
        const READ = 0x02;
        const RTR  = 0x01;
    }
}

/// Predicate over a packet, supplied by the consumer. Runs inside the ISR
/// for the drop policy, so it must be bounded-time and free of
/// synchronization.
pub type PacketPredicate = fn(&RxPacket) -> bool;

/// A received frame plus its reception metadata.
#[derive(Clone, Copy)]
pub struct RxPacket {
    bytes: [u8; MAX_PACKET_LEN],
    len: u8,
    state: RxState,
    result: RxResult,
    ack: Ack,
    seq_no: u32,
    millis: u32,
    slot: u8,
    uncertain_bit1: u16,
}

impl RxPacket {
    pub const fn new() -> Self {
        RxPacket {
            bytes: [0; MAX_PACKET_LEN],
            len: 0,
            state: RxState::Vacant,
            result: RxResult::Ok,
            ack: Ack::NoAck,
            seq_no: 0,
            millis: 0,
            slot: 0,
            uncertain_bit1: 0,
        }
    }

    /// Raw frame bytes, SOF through check sequence.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn result(&self) -> RxResult {
        self.result
    }

    pub fn ack(&self) -> Ack {
        self.ack
    }

    /// Commit sequence number; strictly increasing modulo rollover.
    pub fn seq_no(&self) -> u32 {
        self.seq_no
    }

    /// Millisecond timestamp taken when the descriptor was committed.
    pub fn millis(&self) -> u32 {
        self.millis
    }

    /// Queue slot this descriptor was committed in.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    /// 1-indexed ordinal of the low-confidence bit flagged by the decoder,
    /// counting only non-Manchester bits; 0 when none.
    pub fn uncertain_bit1(&self) -> u16 {
        self.uncertain_bit1
    }

    /// The 12-bit packet identifier.
    pub fn iden(&self) -> u16 {
        (self.bytes[1] as u16) << 4 | (self.bytes[2] >> 4) as u16
    }

    /// The four COM bits.
    pub fn command_flags(&self) -> CommandFlags {
        CommandFlags::from_bits_truncate(self.bytes[2] & 0x0F)
    }

    /// Payload bytes, between the COM byte and the check sequence.
    pub fn data(&self) -> &[u8] {
        if (self.len as usize) < MIN_PACKET_LEN {
            return &[];
        }
        &self.bytes[3..self.len as usize - 2]
    }

    /// Payload length in bytes.
    pub fn data_len(&self) -> usize {
        (self.len as usize).saturating_sub(MIN_PACKET_LEN)
    }

    /// Verifies the frame check sequence.
    pub fn check_crc(&self) -> bool {
        crc::check(self.bytes())
    }

    /// Verifies the frame check sequence and, on failure, attempts the
    /// bit-flip repair passes. Counters in `stats` are updated only when
    /// `accept` (if supplied) returns true for the packet.
    pub fn check_crc_and_repair(
        &mut self,
        stats: &RepairStats,
        accept: Option<PacketPredicate>,
    ) -> bool {
        if self.check_crc() {
            return true;
        }
        let len = self.len as usize;
        if len < MIN_PACKET_LEN {
            return false;
        }
        let repaired = crc::repair(&mut self.bytes[..len], self.uncertain_bit1);
        let counted = accept.is_none_or(|f| f(self));
        if counted {
            stats.note_corrupt();
        }
        match repaired {
            Ok(kind) => {
                if counted {
                    stats.note_repaired(kind);
                }
                true
            }
            Err(()) => false,
        }
    }

    /// Renders the packet as one line: sequence number, slot, length,
    /// identifier, flags, payload and check sequence.
    pub fn dump_raw(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        write!(
            w,
            "#{:04} ({:2}) {:2} ",
            self.seq_no % 10_000,
            self.slot,
            self.len,
        )?;
        if (self.len as usize) < MIN_PACKET_LEN {
            for b in self.bytes() {
                write!(w, "{b:02X} ")?;
            }
            return write!(w, "{}", self.result.as_str());
        }
        write!(w, "{:02X} {:03X} {:X} ", self.bytes[0], self.iden(), self.bytes[2] & 0x0F)?;
        for (i, b) in self.data().iter().enumerate() {
            let sep = if i == 0 { "" } else { "-" };
            write!(w, "{sep}{b:02X}")?;
        }
        write!(
            w,
            ":{:02X}-{:02X} {} {} {}",
            self.bytes[self.len as usize - 2],
            self.bytes[self.len as usize - 1],
            self.ack.as_str(),
            self.result.as_str(),
            if self.check_crc() { "CRC_OK" } else { "CRC_ERROR" },
        )
    }

    // ------------------------------------------------------------------
    // Producer-side mutators, called from the Rx ISR only.
    // ------------------------------------------------------------------

    /// Returns the slot to its vacant state.
    pub(crate) fn reset(&mut self) {
        *self = RxPacket::new();
    }

    /// Starts assembling a new frame in this slot.
    pub(crate) fn begin(&mut self) {
        self.reset();
        self.state = RxState::Searching;
    }

    pub(crate) fn set_state(&mut self, state: RxState) {
        self.state = state;
    }

    pub(crate) fn set_result(&mut self, result: RxResult) {
        self.result = result;
    }

    pub(crate) fn set_ack(&mut self, ack: Ack) {
        self.ack = ack;
    }

    pub(crate) fn set_uncertain_bit1(&mut self, ordinal: u16) {
        self.uncertain_bit1 = ordinal;
    }

    /// Appends a decoded byte. Returns false when the frame is full.
    pub(crate) fn push_byte(&mut self, b: u8) -> bool {
        if self.len as usize >= MAX_PACKET_LEN {
            return false;
        }
        self.bytes[self.len as usize] = b;
        self.len += 1;
        true
    }

    /// Stamps the commit metadata and marks the descriptor readable.
    pub(crate) fn commit(&mut self, seq_no: u32, millis: u32, slot: usize) {
        self.seq_no = seq_no;
        self.millis = millis;
        self.slot = slot as u8;
        self.state = RxState::Done;
    }
}

impl Default for RxPacket {
    fn default() -> Self {
        RxPacket::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn packet(iden: u16, flags: u8, data: &[u8]) -> RxPacket {
        let mut raw = [0u8; MAX_PACKET_LEN];
        let len = frame::build_raw(iden, flags, data, &mut raw).unwrap();
        let mut pkt = RxPacket::new();
        for &b in &raw[..len] {
            assert!(pkt.push_byte(b));
        }
        pkt
    }

    #[test]
    fn accessors_reproduce_the_encoded_fields() {
        let data = [0x0F, 0x07, 0x00, 0x00, 0x00, 0x00, 0x70];
        let pkt = packet(0x8A4, 0x08, &data);
        assert_eq!(pkt.len(), 12);
        assert_eq!(pkt.iden(), 0x8A4);
        assert_eq!(pkt.command_flags(), CommandFlags::EXT);
        assert_eq!(pkt.data(), &data);
        assert_eq!(pkt.data_len(), 7);
        assert!(pkt.check_crc());
    }

    #[test]
    fn command_flags_carry_rak_rw_rtr() {
        let pkt = packet(0x4D2, 0x07, &[1, 2, 3]);
        let flags = pkt.command_flags();
        assert!(flags.contains(CommandFlags::EXT));
        assert!(flags.contains(CommandFlags::RAK));
        assert!(flags.contains(CommandFlags::READ));
        assert!(flags.contains(CommandFlags::RTR));
    }

    #[test]
    fn crc_round_trip_over_payload_sizes() {
        for n in [0usize, 1, 2, 7, 15, 28] {
            let data: Vec<u8> = (0..n as u8).map(|i| i.wrapping_mul(37)).collect();
            let pkt = packet(0x5A5, 0x00, &data);
            assert_eq!(pkt.len(), n + 5, "payload {n}");
            assert!(pkt.check_crc(), "payload {n}");
            assert_eq!(pkt.data(), &data[..], "payload {n}");
            assert_eq!(pkt.bytes()[pkt.len() - 1] & 1, 0, "payload {n}");
        }
    }

    #[test]
    fn repair_updates_counters_once() {
        let stats = RepairStats::new();
        let mut pkt = packet(0x8A4, 0x08, &[0x0F, 0x07, 0x00, 0x00, 0x00, 0x00, 0x70]);
        let good = *pkt.bytes().first_chunk::<12>().unwrap();

        let mut corrupted = pkt;
        corrupted.bytes[5] ^= 0x10;
        assert!(!corrupted.check_crc());
        assert!(corrupted.check_crc_and_repair(&stats, None));
        assert_eq!(corrupted.bytes(), &good);
        assert_eq!(stats.n_repaired(), 1);
        assert_eq!(stats.n_one_bit_errors(), 1);

        let mut corrupted = pkt;
        corrupted.bytes[4] ^= 0x03;
        assert!(corrupted.check_crc_and_repair(&stats, None));
        assert_eq!(stats.n_two_consecutive_bit_errors(), 1);
        assert_eq!(stats.n_repaired(), 2);

        let mut corrupted = pkt;
        corrupted.bytes[3] ^= 0xFF;
        assert!(!corrupted.check_crc_and_repair(&stats, None));
        assert_eq!(stats.n_corrupt(), 3);
        assert_eq!(stats.n_repaired(), 2);

        // A valid packet touches nothing.
        assert!(pkt.check_crc_and_repair(&stats, None));
        assert_eq!(stats.n_corrupt(), 3);
    }

    #[test]
    fn repair_counters_respect_the_predicate() {
        let stats = RepairStats::new();
        let mut pkt = packet(0x8A4, 0x08, &[0x0F, 0x07, 0x00, 0x00, 0x00, 0x00, 0x70]);
        pkt.bytes[5] ^= 0x10;
        // The predicate rejects this identifier: repair still succeeds but
        // nothing is counted.
        assert!(pkt.check_crc_and_repair(&stats, Some(|p| p.iden() == 0x123)));
        assert_eq!(stats.n_corrupt(), 0);
        assert_eq!(stats.n_repaired(), 0);
    }

    #[test]
    fn dump_raw_renders_one_line() {
        let mut pkt = packet(0x8A4, 0x08, &[0x0F, 0x07]);
        pkt.commit(42, 1000, 3);
        let mut line = String::new();
        pkt.dump_raw(&mut line).unwrap();
        assert!(line.contains("8A4"), "{line}");
        assert!(line.contains("0F-07"), "{line}");
        assert!(line.contains("NO_ACK"), "{line}");
        assert!(line.contains("CRC_OK"), "{line}");
    }
}
