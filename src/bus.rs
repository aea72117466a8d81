//! The transceiver instance and the module-level facade.
//!
//! Firmware normally goes through [`setup`] and the free functions, which
//! operate on a registered singleton (the interrupt entry points need a
//! `'static` instance to dispatch to). [`VanBus`] itself is an ordinary
//! owned value, which is how the test suite drives it.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use lazyinit::LazyInit;

use crate::config::{self, VAN_RX_QUEUE_SIZE};
use crate::crc::RepairStats;
use crate::error::{VanError, VanResult};
use crate::frame;
use crate::hal::{self, Platform};
use crate::packet::{PacketPredicate, RxPacket};
use crate::queue::RxQueue;
use crate::rx::RxIsr;
use crate::timing::BitClock;
use crate::tx::{TxQueue, TxScheduler};

/// Cycle figures from [`crate::config`] scaled to the platform's CPU
/// frequency once at construction, so the ISRs never rescale.
pub(crate) struct ScaledTiming {
    pub ack_min: u32,
    pub ack_max: u32,
    pub ack_timeout: u32,
    pub ifs_cycles: u32,
    pub flip_last_bit_carry: u32,
}

/// A software-defined VAN bus transceiver bound to one [`Platform`].
pub struct VanBus {
    platform: &'static dyn Platform,
    clock: BitClock,
    timing: ScaledTiming,
    rx_queue: RxQueue,
    tx_queue: TxQueue,
    rx_isr: UnsafeCell<RxIsr>,
    tx_sched: UnsafeCell<TxScheduler>,
    /// Cycle stamp of the last observed bus activity, written by the Rx
    /// ISR and read by the Tx scheduler for the IFS rule.
    last_media_access: AtomicU32,
    repair_stats: RepairStats,
    tx_enabled: bool,
    #[cfg(feature = "debug-capture")]
    capture: crate::capture::CaptureRing,
}

// The UnsafeCells hold state owned exclusively by one interrupt context
// (pin-change ISR for `rx_isr`, timer ISR for `tx_sched`); everything the
// main context touches is atomic or lock-protected.
unsafe impl Sync for VanBus {}

impl VanBus {
    /// Builds a transceiver for the given platform. `tx_enabled` is false
    /// for listen-only wiring without a transmit pin.
    pub fn new(platform: &'static dyn Platform, tx_enabled: bool) -> Self {
        let clock = BitClock::new(platform.cpu_hz());
        let timing = ScaledTiming {
            ack_min: clock.scale_cycles(config::ack::ACK_MIN_CYCLES),
            ack_max: clock.scale_cycles(config::ack::ACK_MAX_CYCLES),
            ack_timeout: clock.scale_cycles(config::ack::ACK_TIMEOUT_CYCLES),
            ifs_cycles: config::tx::IFS_BIT_TIMES * clock.bit_cycles(),
            flip_last_bit_carry: clock.scale_cycles(config::timing::FLIP_LAST_BIT_CARRY),
        };
        VanBus {
            platform,
            clock,
            timing,
            rx_queue: RxQueue::new(),
            tx_queue: TxQueue::new(),
            rx_isr: UnsafeCell::new(RxIsr::new()),
            tx_sched: UnsafeCell::new(TxScheduler::new()),
            last_media_access: AtomicU32::new(0),
            repair_stats: RepairStats::new(),
            tx_enabled,
            #[cfg(feature = "debug-capture")]
            capture: crate::capture::CaptureRing::new(),
        }
    }

    // ------------------------------------------------------------------
    // Interrupt entry points. The platform wires its pin-change and timer
    // interrupts to these.
    // ------------------------------------------------------------------

    /// Receive pin edge. Pin-change interrupt context.
    pub fn on_rx_pin_change(&self) {
        // Safety: this is the only context touching the Rx decoder state.
        let isr = unsafe { &mut *self.rx_isr.get() };
        isr.pin_change(self);
    }

    /// ACK one-shot timer expiry. Same priority as the pin-change ISR.
    pub fn on_ack_timer(&self) {
        // Safety: as above; the ACK timer never races the pin ISR.
        let isr = unsafe { &mut *self.rx_isr.get() };
        isr.ack_timeout(self);
    }

    /// Periodic transmit timer tick. Timer interrupt context.
    pub fn on_tx_timer_tick(&self) {
        // Safety: this is the only context touching the Tx bit cursor.
        let sched = unsafe { &mut *self.tx_sched.get() };
        sched.tick(self);
    }

    // ------------------------------------------------------------------
    // Consumer surface.
    // ------------------------------------------------------------------

    /// Copies the oldest committed packet into `out`. Non-blocking. When
    /// `overrun` is supplied, the sticky overrun flag is reported into it
    /// and cleared.
    pub fn receive(&self, out: &mut RxPacket, overrun: Option<&mut bool>) -> bool {
        self.rx_queue.receive(out, overrun)
    }

    /// Whether a committed packet is waiting.
    pub fn available(&self) -> bool {
        self.rx_queue.available()
    }

    /// Verifies and, on failure, repairs a received packet against its
    /// CRC. Repair counters honour the `accept` predicate.
    pub fn check_crc_and_repair(
        &self,
        pkt: &mut RxPacket,
        accept: Option<PacketPredicate>,
    ) -> bool {
        pkt.check_crc_and_repair(&self.repair_stats, accept)
    }

    /// The CRC repair counters.
    pub fn repair_stats(&self) -> &RepairStats {
        &self.repair_stats
    }

    /// Packets above `threshold` in the queue are discarded at commit time
    /// unless `is_essential` accepts them. The predicate runs inside the
    /// ISR: bounded-time, no synchronization.
    pub fn set_drop_policy(&self, threshold: usize, is_essential: Option<PacketPredicate>) {
        debug!("van rx: drop policy threshold {threshold}");
        self.rx_queue.set_drop_policy(threshold, is_essential);
    }

    /// Enqueues a frame and returns without waiting for transmission.
    /// Blocks up to `timeout_ms` for a free queue slot.
    pub fn send_async(&self, iden: u16, flags: u8, data: &[u8], timeout_ms: u32) -> bool {
        match self.enqueue_frame(iden, flags, data, timeout_ms) {
            Ok((_, _)) => true,
            Err(e) => {
                warn!("van tx: {e}");
                false
            }
        }
    }

    /// Enqueues a frame and waits until it left the wire (or was dropped
    /// after too many collisions). `timeout_ms` bounds the whole call.
    pub fn send_sync(&self, iden: u16, flags: u8, data: &[u8], timeout_ms: u32) -> bool {
        match self.send_sync_inner(iden, flags, data, timeout_ms) {
            Ok(()) => true,
            Err(e) => {
                warn!("van tx: {e}");
                false
            }
        }
    }

    fn send_sync_inner(
        &self,
        iden: u16,
        flags: u8,
        data: &[u8],
        timeout_ms: u32,
    ) -> VanResult<()> {
        let (slot, mut waited) = self.enqueue_frame(iden, flags, data, timeout_ms)?;
        loop {
            match self.tx_queue.slot_outcome(slot) {
                Some(true) => return Ok(()),
                Some(false) => return Err(VanError::TxDropped(config::tx::MAX_COLLISIONS)),
                None => {}
            }
            if waited >= timeout_ms {
                // The slot stays queued and may still transmit later.
                return Err(VanError::TxTimeout(timeout_ms));
            }
            self.platform.delay_ms(1);
            waited += 1;
        }
    }

    /// Lays out the frame and claims a transmit slot, polling for up to
    /// `timeout_ms`. Returns the slot index and the milliseconds spent.
    fn enqueue_frame(
        &self,
        iden: u16,
        flags: u8,
        data: &[u8],
        timeout_ms: u32,
    ) -> VanResult<(usize, u32)> {
        if !self.tx_enabled {
            return Err(VanError::TxDisabled);
        }
        let mut raw = [0u8; config::frame::MAX_PACKET_LEN];
        let len = frame::build_raw(iden, flags, data, &mut raw)?;
        let mut waited = 0;
        loop {
            if let Some(slot) = self.tx_queue.try_enqueue(&raw[..len]) {
                if self.tx_queue.claim_timer() {
                    self.platform.start_tx_timer(config::tx::TIMER_PERIOD_NS);
                }
                return Ok((slot, waited));
            }
            if waited >= timeout_ms {
                return Err(VanError::TxQueueFull);
            }
            self.platform.delay_ms(1);
            waited += 1;
        }
    }

    // ------------------------------------------------------------------
    // Statistics.
    // ------------------------------------------------------------------

    /// Capacity of the receive queue.
    pub fn queue_size(&self) -> usize {
        VAN_RX_QUEUE_SIZE
    }

    /// Packets currently waiting for the consumer.
    pub fn queued(&self) -> usize {
        self.rx_queue.queued()
    }

    /// High-water mark of [`queued`](VanBus::queued).
    pub fn max_queued(&self) -> usize {
        self.rx_queue.max_queued()
    }

    /// Frames committed by the receiver, including policy-dropped ones.
    pub fn rx_count(&self) -> u32 {
        self.rx_queue.rx_count()
    }

    /// Frames fully transmitted.
    pub fn tx_count(&self) -> u32 {
        self.tx_queue.tx_count()
    }

    // ------------------------------------------------------------------
    // Crate-internal plumbing.
    // ------------------------------------------------------------------

    pub(crate) fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    pub(crate) fn clock(&self) -> &BitClock {
        &self.clock
    }

    pub(crate) fn timing(&self) -> &ScaledTiming {
        &self.timing
    }

    pub(crate) fn rx_queue(&self) -> &RxQueue {
        &self.rx_queue
    }

    pub(crate) fn tx_queue(&self) -> &TxQueue {
        &self.tx_queue
    }

    pub(crate) fn last_media_access(&self) -> u32 {
        self.last_media_access.load(Ordering::Relaxed)
    }

    pub(crate) fn touch_media_access(&self, cycles: u32) {
        self.last_media_access.store(cycles, Ordering::Relaxed);
    }

    #[cfg(feature = "debug-capture")]
    pub(crate) fn record_isr_sample(&self, isr: &RxIsr, pin_level: bool) {
        use crate::packet::RxState;

        let (cycles, jitter, at_bit, shift_reg) = isr.sample_fields();
        let slot = self.rx_queue.head_index();
        let state = if self.rx_queue.is_full() {
            RxState::Done
        } else {
            // Safety: producer context.
            unsafe { self.rx_queue.head_packet() }.state()
        };
        self.capture.record_isr(crate::capture::IsrSample {
            cycles,
            pin_level,
            jitter,
            at_bit: at_bit as u8,
            shift_reg,
            state,
            slot: slot as u8,
        });
    }

    #[cfg(not(feature = "debug-capture"))]
    #[inline]
    pub(crate) fn record_isr_sample(&self, _isr: &RxIsr, _pin_level: bool) {}

    #[cfg(feature = "debug-capture")]
    pub(crate) fn record_ifs_sample(&self, ifs_cycles: u32) {
        self.capture.record_ifs(crate::capture::IfsSample {
            ifs_cycles,
            at_millis: self.platform.millis(),
        });
    }

    #[cfg(not(feature = "debug-capture"))]
    #[inline]
    pub(crate) fn record_ifs_sample(&self, _ifs_cycles: u32) {}

    /// Renders and drains the debug capture rings.
    #[cfg(feature = "debug-capture")]
    pub fn dump_capture(&self, w: &mut dyn core::fmt::Write) -> core::fmt::Result {
        self.capture.dump(w)
    }

    #[cfg(test)]
    pub(crate) fn rx_isr_mut(&self) -> &mut RxIsr {
        unsafe { &mut *self.rx_isr.get() }
    }
}

// ----------------------------------------------------------------------
// Module-level facade over the registered singleton.
// ----------------------------------------------------------------------

static BUS: LazyInit<VanBus> = LazyInit::new();

/// Brings the transceiver up on the given platform. Idempotent: returns
/// false if it was already set up.
///
/// The pin numbers are forwarded to
/// [`Platform::configure_pins`]; pass `None` for `tx_pin` on listen-only
/// wiring. After this returns, the platform must deliver pin-change and
/// timer interrupts to [`on_rx_pin_change`], [`on_ack_timer`] and
/// [`on_tx_timer_tick`].
pub fn setup(platform: &'static dyn Platform, rx_pin: u8, tx_pin: Option<u8>) -> bool {
    match try_setup(platform, rx_pin, tx_pin) {
        Ok(()) => true,
        Err(e) => {
            warn!("van: {e}");
            false
        }
    }
}

fn try_setup(platform: &'static dyn Platform, rx_pin: u8, tx_pin: Option<u8>) -> VanResult<()> {
    if BUS.is_inited() {
        return Err(VanError::AlreadySetup);
    }
    hal::register_platform(platform);
    platform.configure_pins(rx_pin, tx_pin);
    BUS.init_once(VanBus::new(platform, tx_pin.is_some()));
    platform.attach_rx_isr();
    info!(
        "van: up at {} MHz, rx pin {}, tx pin {:?}, {} rx slots",
        platform.cpu_hz() / 1_000_000,
        rx_pin,
        tx_pin,
        VAN_RX_QUEUE_SIZE,
    );
    Ok(())
}

/// The registered transceiver, or [`VanError::NotSetup`].
fn registered() -> VanResult<&'static VanBus> {
    if BUS.is_inited() {
        Ok(&BUS)
    } else {
        Err(VanError::NotSetup)
    }
}

/// The registered transceiver, if [`setup`] ran.
pub fn bus() -> Option<&'static VanBus> {
    registered().ok()
}

/// Pin-change interrupt entry for the registered transceiver.
pub fn on_rx_pin_change() {
    if let Ok(bus) = registered() {
        bus.on_rx_pin_change();
    }
}

/// ACK timer interrupt entry for the registered transceiver.
pub fn on_ack_timer() {
    if let Ok(bus) = registered() {
        bus.on_ack_timer();
    }
}

/// Transmit timer interrupt entry for the registered transceiver.
pub fn on_tx_timer_tick() {
    if let Ok(bus) = registered() {
        bus.on_tx_timer_tick();
    }
}

/// See [`VanBus::receive`]. False before [`setup`].
pub fn receive(out: &mut RxPacket, overrun: Option<&mut bool>) -> bool {
    registered().is_ok_and(|b| b.receive(out, overrun))
}

/// See [`VanBus::available`]. False before [`setup`].
pub fn available() -> bool {
    registered().is_ok_and(|b| b.available())
}

/// See [`VanBus::send_async`].
pub fn send_async(iden: u16, flags: u8, data: &[u8], timeout_ms: u32) -> bool {
    match registered() {
        Ok(bus) => bus.send_async(iden, flags, data, timeout_ms),
        Err(e) => {
            warn!("van tx: {e}");
            false
        }
    }
}

/// See [`VanBus::send_sync`].
pub fn send_sync(iden: u16, flags: u8, data: &[u8], timeout_ms: u32) -> bool {
    match registered() {
        Ok(bus) => bus.send_sync(iden, flags, data, timeout_ms),
        Err(e) => {
            warn!("van tx: {e}");
            false
        }
    }
}

/// See [`VanBus::set_drop_policy`].
pub fn set_drop_policy(threshold: usize, is_essential: Option<PacketPredicate>) {
    match registered() {
        Ok(bus) => bus.set_drop_policy(threshold, is_essential),
        Err(e) => warn!("van rx: {e}"),
    }
}

/// See [`VanBus::queue_size`].
pub fn queue_size() -> usize {
    VAN_RX_QUEUE_SIZE
}

/// See [`VanBus::queued`]. Zero before [`setup`].
pub fn queued() -> usize {
    registered().map_or(0, |b| b.queued())
}

/// See [`VanBus::max_queued`]. Zero before [`setup`].
pub fn max_queued() -> usize {
    registered().map_or(0, |b| b.max_queued())
}

/// See [`VanBus::rx_count`]. Zero before [`setup`].
pub fn rx_count() -> u32 {
    registered().map_or(0, |b| b.rx_count())
}

/// See [`VanBus::tx_count`]. Zero before [`setup`].
pub fn tx_count() -> u32 {
    registered().map_or(0, |b| b.tx_count())
}

/// See [`VanBus::dump_stats`].
pub fn dump_stats(w: &mut dyn core::fmt::Write, long_form: bool) -> core::fmt::Result {
    match registered() {
        Ok(bus) => bus.dump_stats(w, long_form),
        Err(e) => writeln!(w, "van: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Ack, RxResult};
    use crate::test_support::{MockPlatform, TEST_START_CYCLES, feed_frame, new_bus};

    #[test]
    fn setup_is_idempotent() {
        let mock = MockPlatform::leak();
        assert!(setup(mock, 2, Some(4)));
        assert!(mock.rx_isr_attached.load(core::sync::atomic::Ordering::Relaxed));
        assert_eq!(queue_size(), crate::config::VAN_RX_QUEUE_SIZE);
        // Second setup is refused; the registered instance stays.
        assert!(!setup(mock, 2, Some(4)));
        assert!(bus().is_some());
        assert!(!available());
    }

    #[test]
    fn repair_counters_live_on_the_bus() {
        let (bus, mock) = new_bus();
        feed_frame(bus, mock, 0x8A4, 0x08, &[0x0F, 0x07], TEST_START_CYCLES);
        let mut pkt = crate::packet::RxPacket::new();
        assert!(bus.receive(&mut pkt, None));
        assert_eq!(pkt.result(), RxResult::Ok);
        assert_eq!(pkt.ack(), Ack::NoAck);

        // Pristine packet: no counters move.
        assert!(bus.check_crc_and_repair(&mut pkt, None));
        assert_eq!(bus.repair_stats().n_corrupt(), 0);
    }

    #[test]
    fn dump_stats_renders_counters() {
        let (bus, mock) = new_bus();
        feed_frame(bus, mock, 0x8A4, 0x08, &[1], TEST_START_CYCLES);

        let mut out = String::new();
        bus.dump_stats(&mut out, false).unwrap();
        assert!(out.contains("rx: 1 frames"), "{out}");
        assert!(!out.contains("repairs:"), "{out}");

        let mut out = String::new();
        bus.dump_stats(&mut out, true).unwrap();
        assert!(out.contains("repairs: 1-bit 0"), "{out}");
        assert!(out.contains("last ifs"), "{out}");
    }

    #[test]
    fn listen_only_bus_refuses_to_send() {
        let mock = MockPlatform::leak();
        let bus: &'static VanBus = Box::leak(Box::new(VanBus::new(mock, false)));
        assert!(!bus.send_async(0x100, 0x00, &[], 0));
        assert!(!bus.send_sync(0x100, 0x00, &[], 0));
        assert_eq!(bus.tx_count(), 0);
    }
}
