//! Shared helpers for the host-run test suite: a mock platform and a wire
//! edge synthesizer.
//!
//! The synthesizer turns transmit symbols back into the edge sequence an
//! external transceiver chip would produce, using the empirical ~667-cycle
//! bit time the classification tables are tuned for (670 here, comfortably
//! inside every class).

use std::sync::Mutex;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::bus::VanBus;
use crate::config::frame::MAX_PACKET_LEN;
use crate::frame;
use crate::hal::Platform;

/// Cycles per bit used by the synthesizer.
pub(crate) const TEST_BIT_CYCLES: u32 = 670;

/// Idle cycles inserted before the first edge of a synthesized frame.
pub(crate) const TEST_START_CYCLES: u32 = 20_000;

pub(crate) struct MockPlatform {
    pub cycles: AtomicU32,
    pub ms: AtomicU32,
    pub rx: AtomicBool,
    pub tx: AtomicBool,
    /// Another device driving the wired-AND bus dominant.
    pub bus_dominant: AtomicBool,
    pub rx_isr_attached: AtomicBool,
    pub ack_armed: AtomicBool,
    pub tx_timer_running: AtomicBool,
    pub tx_timer_period_ns: AtomicU32,
    pub watchdog_feeds: AtomicU32,
    /// Every transmit pin write as (cycles, electrical level).
    pub writes: Mutex<Vec<(u32, bool)>>,
}

impl MockPlatform {
    pub(crate) fn new() -> Self {
        MockPlatform {
            cycles: AtomicU32::new(TEST_START_CYCLES),
            ms: AtomicU32::new(0),
            rx: AtomicBool::new(true),
            tx: AtomicBool::new(true),
            bus_dominant: AtomicBool::new(false),
            rx_isr_attached: AtomicBool::new(false),
            ack_armed: AtomicBool::new(false),
            tx_timer_running: AtomicBool::new(false),
            tx_timer_period_ns: AtomicU32::new(0),
            watchdog_feeds: AtomicU32::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn leak() -> &'static MockPlatform {
        Box::leak(Box::new(MockPlatform::new()))
    }

    pub(crate) fn advance_cycles(&self, cycles: u32) -> u32 {
        self.cycles.fetch_add(cycles, Ordering::Relaxed) + cycles
    }
}

impl Platform for MockPlatform {
    fn cycle_count(&self) -> u32 {
        self.cycles.load(Ordering::Relaxed)
    }

    fn cpu_hz(&self) -> u32 {
        crate::config::REF_CPU_HZ
    }

    fn millis(&self) -> u32 {
        self.ms.load(Ordering::Relaxed)
    }

    fn rx_pin(&self) -> bool {
        self.rx.load(Ordering::Relaxed)
    }

    fn set_tx_pin(&self, high: bool) {
        self.tx.store(high, Ordering::Relaxed);
        self.writes
            .lock()
            .unwrap()
            .push((self.cycle_count(), high));
    }

    fn tx_pin(&self) -> bool {
        // Wired-AND bus: dominant (low) wins over our own level.
        self.tx.load(Ordering::Relaxed) && !self.bus_dominant.load(Ordering::Relaxed)
    }

    fn attach_rx_isr(&self) {
        self.rx_isr_attached.store(true, Ordering::Relaxed);
    }

    fn detach_rx_isr(&self) {
        self.rx_isr_attached.store(false, Ordering::Relaxed);
    }

    fn arm_ack_timer(&self, _cycles: u32) {
        self.ack_armed.store(true, Ordering::Relaxed);
    }

    fn cancel_ack_timer(&self) {
        self.ack_armed.store(false, Ordering::Relaxed);
    }

    fn start_tx_timer(&self, period_ns: u32) {
        self.tx_timer_period_ns.store(period_ns, Ordering::Relaxed);
        self.tx_timer_running.store(true, Ordering::Relaxed);
    }

    fn stop_tx_timer(&self) {
        self.tx_timer_running.store(false, Ordering::Relaxed);
    }

    fn delay_ms(&self, ms: u32) {
        self.ms.fetch_add(ms, Ordering::Relaxed);
        self.cycles
            .fetch_add(ms * (self.cpu_hz() / 1000), Ordering::Relaxed);
        std::thread::yield_now();
    }

    fn feed_watchdog(&self) {
        self.watchdog_feeds.fetch_add(1, Ordering::Relaxed);
    }
}

/// A transceiver on a fresh mock platform, both leaked to `'static`.
pub(crate) fn new_bus() -> (&'static VanBus, &'static MockPlatform) {
    let mock = MockPlatform::leak();
    let bus = Box::leak(Box::new(VanBus::new(mock, true)));
    (bus, mock)
}

/// Raw frame bytes and the receive-side symbols (EOD applied, no trailing
/// ACK/EOF symbol: the line simply returns to recessive).
pub(crate) fn encode(iden: u16, flags: u8, data: &[u8]) -> (Vec<u8>, Vec<u16>) {
    let mut raw = [0u8; MAX_PACKET_LEN];
    let len = frame::build_raw(iden, flags, data, &mut raw).unwrap();
    let mut syms = [0u16; frame::MAX_SYMBOLS];
    let (n, _) = frame::build_symbols(&raw[..len], &mut syms);
    (raw[..len].to_vec(), syms[..n - 1].to_vec())
}

/// The edge sequence a transceiver chip would produce for `symbols`:
/// `(logical level after the edge, absolute cycle count)`, plus the cycle
/// count at which the line returned to recessive.
pub(crate) fn edges_for_symbols(symbols: &[u16], start: u32) -> (Vec<(bool, u32)>, u32) {
    let mut bits = Vec::new();
    for &sym in symbols {
        for i in (0..10).rev() {
            bits.push((sym >> i) & 1 != 0);
        }
    }
    let mut edges = Vec::new();
    let mut level = true; // idle recessive
    let mut t = start;
    for bit in bits {
        if bit != level {
            edges.push((bit, t));
            level = bit;
        }
        t += TEST_BIT_CYCLES;
    }
    if !level {
        edges.push((true, t));
    }
    (edges, t)
}

/// Drives the synthesized edges through the pin-change entry point.
pub(crate) fn feed_edges(bus: &VanBus, mock: &MockPlatform, edges: &[(bool, u32)]) {
    for &(level, t) in edges {
        mock.rx.store(level, Ordering::Relaxed);
        mock.cycles.store(t, Ordering::Relaxed);
        bus.on_rx_pin_change();
    }
}

/// Feeds one whole frame and commits it through the ACK timeout. Returns
/// the cycle count at the end of the frame.
pub(crate) fn feed_frame(
    bus: &'static VanBus,
    mock: &'static MockPlatform,
    iden: u16,
    flags: u8,
    data: &[u8],
    start: u32,
) -> u32 {
    let (_, syms) = encode(iden, flags, data);
    let (edges, end) = edges_for_symbols(&syms, start);
    feed_edges(bus, mock, &edges);
    if mock.ack_armed.swap(false, Ordering::Relaxed) {
        bus.on_ack_timer();
    }
    end
}
