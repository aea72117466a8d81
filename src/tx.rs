//! Transmit queue and bit scheduler.
//!
//! Frames are laid out as 10-bit symbols at enqueue time; a periodic timer
//! then emits one bit per tick. The bus is wired-AND, so before writing a
//! bit the scheduler samples the pin it drives: reading dominant after
//! writing recessive means a stronger device is transmitting and we lost
//! arbitration. Losing puts the frame back into the IFS wait; after ten
//! collisions it is dropped.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use crate::bus::VanBus;
use crate::config::VAN_TX_QUEUE_SIZE;
use crate::config::tx::MAX_COLLISIONS;
use crate::frame::{self, MAX_SYMBOLS};
use crate::hal::{self, IsrShared};

/// Lifecycle of a transmit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TxState {
    /// Enqueued; waiting for the inter-frame space.
    Waiting = 0,
    /// Bits are going out on the wire.
    Sending = 1,
    /// Transmitted or dropped; the slot is free.
    Done = 2,
}

/// A frame prepared for transmission.
pub(crate) struct TxFrame {
    symbols: [u16; MAX_SYMBOLS],
    n_symbols: u8,
    /// Index of the symbol carrying the EOD.
    eod_index: u8,
    /// Polled cross-context by `send_sync`; everything else in this struct
    /// is only touched by one context at a time.
    state: AtomicU8,
    n_collisions: u8,
    first_collision_bit: i16,
    bit_ok: bool,
    bit_error: bool,
    ifs_cycles: u32,
}

impl TxFrame {
    const fn new() -> Self {
        TxFrame {
            symbols: [0; MAX_SYMBOLS],
            n_symbols: 0,
            eod_index: 0,
            state: AtomicU8::new(TxState::Done as u8),
            n_collisions: 0,
            first_collision_bit: -1,
            bit_ok: false,
            bit_error: false,
            ifs_cycles: 0,
        }
    }

    pub(crate) fn state(&self) -> TxState {
        match self.state.load(Ordering::Acquire) {
            0 => TxState::Waiting,
            1 => TxState::Sending,
            _ => TxState::Done,
        }
    }

    fn set_state(&self, state: TxState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Prepares the slot for a new frame. Main context, before publishing.
    fn load(&mut self, raw: &[u8]) {
        let (n, eod) = frame::build_symbols(raw, &mut self.symbols);
        self.n_symbols = n as u8;
        self.eod_index = eod as u8;
        self.n_collisions = 0;
        self.first_collision_bit = -1;
        self.bit_ok = false;
        self.bit_error = false;
        self.ifs_cycles = 0;
        self.set_state(TxState::Waiting);
    }
}

pub(crate) struct TxQueue {
    slots: [UnsafeCell<TxFrame>; VAN_TX_QUEUE_SIZE],
    /// Producer index, advanced by `send` under the enqueue lock.
    head: AtomicUsize,
    /// Consumer index, advanced by the timer ISR on completion.
    tail: AtomicUsize,
    n_queued: AtomicUsize,
    tx_count: AtomicU32,
    timer_running: AtomicBool,
    /// Serializes senders claiming the head slot.
    enqueue_guard: IsrShared<()>,
    n_collisions: AtomicU32,
    n_max_collision_errors: AtomicU32,
    n_bit_errors: AtomicU32,
    n_bus_occupied: AtomicU32,
    last_ifs_cycles: AtomicU32,
}

// Slot handover follows the same single-writer protocol as the Rx queue,
// with `n_queued` as the release/acquire pair.
unsafe impl Sync for TxQueue {}

impl TxQueue {
    pub(crate) const fn new() -> Self {
        TxQueue {
            slots: [const { UnsafeCell::new(TxFrame::new()) }; VAN_TX_QUEUE_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            n_queued: AtomicUsize::new(0),
            tx_count: AtomicU32::new(0),
            timer_running: AtomicBool::new(false),
            enqueue_guard: IsrShared::new(()),
            n_collisions: AtomicU32::new(0),
            n_max_collision_errors: AtomicU32::new(0),
            n_bit_errors: AtomicU32::new(0),
            n_bus_occupied: AtomicU32::new(0),
            last_ifs_cycles: AtomicU32::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        VAN_TX_QUEUE_SIZE
    }

    pub(crate) fn queued(&self) -> usize {
        self.n_queued.load(Ordering::Acquire)
    }

    pub(crate) fn tx_count(&self) -> u32 {
        self.tx_count.load(Ordering::Relaxed)
    }

    pub(crate) fn n_collisions(&self) -> u32 {
        self.n_collisions.load(Ordering::Relaxed)
    }

    pub(crate) fn n_max_collision_errors(&self) -> u32 {
        self.n_max_collision_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn n_bit_errors(&self) -> u32 {
        self.n_bit_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn n_bus_occupied(&self) -> u32 {
        self.n_bus_occupied.load(Ordering::Relaxed)
    }

    pub(crate) fn last_ifs_cycles(&self) -> u32 {
        self.last_ifs_cycles.load(Ordering::Relaxed)
    }

    /// Claims a free slot, lays the frame out and publishes it. Returns the
    /// slot index for completion polling, or `None` when the queue is full.
    pub(crate) fn try_enqueue(&self, raw: &[u8]) -> Option<usize> {
        self.enqueue_guard.with(|_| {
            if self.n_queued.load(Ordering::Acquire) >= VAN_TX_QUEUE_SIZE {
                return None;
            }
            let head = self.head.load(Ordering::Relaxed);
            // Safety: inside the enqueue section, and not visible to the
            // ISR until n_queued is bumped.
            let slot = unsafe { &mut *self.slots[head].get() };
            slot.load(raw);
            self.head.store((head + 1) % VAN_TX_QUEUE_SIZE, Ordering::Relaxed);
            self.n_queued.fetch_add(1, Ordering::AcqRel);
            Some(head)
        })
    }

    /// Completion outcome of a slot: `None` while pending, `Some(true)`
    /// once transmitted, `Some(false)` when dropped after too many
    /// collisions.
    pub(crate) fn slot_outcome(&self, slot: usize) -> Option<bool> {
        // Safety: the atomic state gates the read; after Done the ISR has
        // released the slot.
        let frame = unsafe { &*self.slots[slot].get() };
        match frame.state() {
            TxState::Done => Some(frame.n_collisions < MAX_COLLISIONS),
            _ => None,
        }
    }

    /// Marks the periodic timer as running. Returns true when the caller
    /// must actually start it.
    pub(crate) fn claim_timer(&self) -> bool {
        !self.timer_running.swap(true, Ordering::AcqRel)
    }

    fn release_timer(&self) {
        self.timer_running.store(false, Ordering::Release);
    }

    fn advance_tail(&self, transmitted: bool) {
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store((tail + 1) % VAN_TX_QUEUE_SIZE, Ordering::Relaxed);
        self.n_queued.fetch_sub(1, Ordering::AcqRel);
        if transmitted {
            self.tx_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Bit cursor of the frame going out. Touched only by the timer ISR.
pub(crate) struct TxScheduler {
    sym_idx: usize,
    bit_idx: u32,
    /// Logical level written on the previous tick; recessive when idle.
    last_written: bool,
}

impl TxScheduler {
    pub(crate) const fn new() -> Self {
        TxScheduler {
            sym_idx: 0,
            bit_idx: 0,
            last_written: true,
        }
    }

    fn rewind(&mut self) {
        self.sym_idx = 0;
        self.bit_idx = 0;
        self.last_written = true;
    }

    /// One timer tick: IFS gating in WAITING, one bit in SENDING.
    pub(crate) fn tick(&mut self, bus: &VanBus) {
        let queue = bus.tx_queue();
        let platform = bus.platform();

        if queue.n_queued.load(Ordering::Acquire) == 0 {
            platform.stop_tx_timer();
            queue.release_timer();
            return;
        }
        let tail = queue.tail.load(Ordering::Relaxed);
        // Safety: timer ISR context; the slot was published by try_enqueue.
        let frame = unsafe { &mut *queue.slots[tail].get() };

        match frame.state() {
            TxState::Waiting => {
                let now = platform.cycle_count();
                let elapsed = now.wrapping_sub(bus.last_media_access());
                if elapsed < bus.timing().ifs_cycles {
                    queue.n_bus_occupied.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // The bus is ours. Our own edges must not feed the decoder.
                platform.detach_rx_isr();
                frame.ifs_cycles = elapsed;
                queue.last_ifs_cycles.store(elapsed, Ordering::Relaxed);
                self.rewind();
                frame.set_state(TxState::Sending);
                bus.record_ifs_sample(elapsed);
            }
            TxState::Sending => {
                // Past the EOD symbol only the ACK slot and the EOF remain;
                // a dominant level there is a listener acknowledging, not a
                // collision.
                if self.sym_idx <= frame.eod_index as usize {
                    let sampled = hal::tx_level(platform);
                    if self.last_written && !sampled {
                        // We wrote recessive, the wire is dominant: collision.
                        self.on_collision(bus, queue, frame);
                        return;
                    }
                    if !self.last_written && sampled {
                        frame.bit_error = true;
                        queue.n_bit_errors.fetch_add(1, Ordering::Relaxed);
                    } else {
                        frame.bit_ok = true;
                    }
                }

                let bit = (frame.symbols[self.sym_idx] >> (9 - self.bit_idx)) & 1 != 0;
                hal::set_tx_level(platform, bit);
                self.last_written = bit;
                self.bit_idx += 1;
                if self.bit_idx == 10 {
                    self.bit_idx = 0;
                    self.sym_idx += 1;
                }
                if self.sym_idx == frame.n_symbols as usize {
                    self.finish(bus, queue, frame);
                }
            }
            TxState::Done => {
                // A dropped frame left in the slot; skip it.
                queue.advance_tail(false);
            }
        }
    }

    fn on_collision(&mut self, bus: &VanBus, queue: &TxQueue, frame: &mut TxFrame) {
        let platform = bus.platform();
        hal::set_tx_level(platform, true);
        platform.attach_rx_isr();

        frame.n_collisions += 1;
        queue.n_collisions.fetch_add(1, Ordering::Relaxed);
        if frame.first_collision_bit < 0 {
            frame.first_collision_bit = (self.sym_idx * 10 + self.bit_idx as usize) as i16;
        }
        if frame.n_collisions >= MAX_COLLISIONS {
            queue.n_max_collision_errors.fetch_add(1, Ordering::Relaxed);
            frame.set_state(TxState::Done);
            queue.advance_tail(false);
        } else {
            frame.set_state(TxState::Waiting);
        }
    }

    fn finish(&mut self, bus: &VanBus, queue: &TxQueue, frame: &mut TxFrame) {
        let platform = bus.platform();
        // Our frame occupied the media: the IFS rule applies to us too.
        bus.touch_media_access(platform.cycle_count());
        platform.attach_rx_isr();
        frame.set_state(TxState::Done);
        queue.advance_tail(true);
        if queue.n_queued.load(Ordering::Acquire) == 0 {
            platform.stop_tx_timer();
            queue.release_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;

    use crate::bus::VanBus;
    use crate::config::NOMINAL_BIT_CYCLES;
    use crate::config::frame::MAX_PACKET_LEN;
    use crate::config::tx::{IFS_BIT_TIMES, TIMER_PERIOD_NS};
    use crate::frame;
    use crate::hal::Platform;
    use crate::test_support::{MockPlatform, new_bus};

    const IFS_CYCLES: u32 = IFS_BIT_TIMES * NOMINAL_BIT_CYCLES;

    /// Every logical level the scheduler should put on the wire for a
    /// frame, one entry per tick.
    fn expected_bits(iden: u16, flags: u8, data: &[u8]) -> Vec<bool> {
        let mut raw = [0u8; MAX_PACKET_LEN];
        let len = frame::build_raw(iden, flags, data, &mut raw).unwrap();
        let mut syms = [0u16; frame::MAX_SYMBOLS];
        let (n, _) = frame::build_symbols(&raw[..len], &mut syms);
        let mut bits = Vec::new();
        for &sym in &syms[..n] {
            for i in (0..10).rev() {
                bits.push((sym >> i) & 1 != 0);
            }
        }
        bits
    }

    /// Ticks the scheduler until the timer stops, advancing one bit time
    /// per tick.
    fn run_to_completion(bus: &VanBus, mock: &MockPlatform) {
        let mut ticks = 0;
        while mock.tx_timer_running.load(Ordering::Relaxed) {
            bus.on_tx_timer_tick();
            mock.advance_cycles(NOMINAL_BIT_CYCLES);
            ticks += 1;
            assert!(ticks < 10_000, "scheduler never finished");
        }
    }

    #[test]
    fn ifs_gates_the_first_bit() {
        let (bus, mock) = new_bus();
        // The bus was busy just now.
        bus.touch_media_access(mock.cycle_count());

        assert!(bus.send_async(0x123, 0x00, &[1, 2], 0));
        assert!(mock.tx_timer_running.load(Ordering::Relaxed));
        assert_eq!(
            mock.tx_timer_period_ns.load(Ordering::Relaxed),
            TIMER_PERIOD_NS
        );

        bus.on_tx_timer_tick();
        assert!(mock.writes.lock().unwrap().is_empty());
        assert_eq!(bus.tx_queue().n_bus_occupied(), 1);

        mock.advance_cycles(IFS_CYCLES + 5);
        bus.on_tx_timer_tick();
        assert!(!mock.rx_isr_attached.load(Ordering::Relaxed));

        let media = bus.last_media_access();
        run_to_completion(bus, mock);

        let writes = mock.writes.lock().unwrap();
        let first_dominant = writes.iter().find(|(_, level)| !*level).unwrap();
        assert!(first_dominant.0.wrapping_sub(media) >= IFS_CYCLES);
    }

    #[test]
    fn transmits_the_exact_bit_sequence() {
        let (bus, mock) = new_bus();
        let data = [0x0F, 0x07, 0x00, 0x00, 0x00, 0x00, 0x70];
        assert!(bus.send_async(0x8A4, 0x08, &data, 0));
        run_to_completion(bus, mock);

        let writes = mock.writes.lock().unwrap();
        let levels: Vec<bool> = writes.iter().map(|&(_, level)| level).collect();
        assert_eq!(levels, expected_bits(0x8A4, 0x08, &data));
        assert_eq!(bus.tx_count(), 1);
        assert!(mock.rx_isr_attached.load(Ordering::Relaxed));
        assert!(!mock.tx_timer_running.load(Ordering::Relaxed));
    }

    #[test]
    fn collision_backs_off_and_retries() {
        let (bus, mock) = new_bus();
        assert!(bus.send_async(0x100, 0x00, &[], 0));

        bus.on_tx_timer_tick(); // WAITING -> SENDING
        mock.bus_dominant.store(true, Ordering::Relaxed);
        bus.on_tx_timer_tick(); // sample sees a stronger transmitter
        assert_eq!(bus.tx_queue().n_collisions(), 1);
        assert!(mock.rx_isr_attached.load(Ordering::Relaxed));
        assert_eq!(bus.tx_count(), 0);
        // The bus was released to recessive.
        assert_eq!(*mock.writes.lock().unwrap().last().unwrap(), (mock.cycle_count(), true));

        mock.bus_dominant.store(false, Ordering::Relaxed);
        mock.writes.lock().unwrap().clear();
        run_to_completion(bus, mock);
        assert_eq!(bus.tx_count(), 1);
        assert_eq!(bus.tx_queue().n_max_collision_errors(), 0);
    }

    #[test]
    fn ten_collisions_drop_the_frame() {
        let (bus, mock) = new_bus();
        assert!(bus.send_async(0x100, 0x00, &[], 0));
        mock.bus_dominant.store(true, Ordering::Relaxed);

        let mut ticks = 0;
        while mock.tx_timer_running.load(Ordering::Relaxed) && ticks < 50 {
            bus.on_tx_timer_tick();
            ticks += 1;
        }
        assert_eq!(bus.tx_queue().n_collisions(), 10);
        assert_eq!(bus.tx_queue().n_max_collision_errors(), 1);
        assert_eq!(bus.tx_count(), 0);
        assert_eq!(bus.tx_queue().queued(), 0);
    }

    #[test]
    fn dominant_ack_slot_is_not_a_collision() {
        let (bus, mock) = new_bus();
        assert!(bus.send_async(0x100, 0x00, &[7], 0));
        bus.on_tx_timer_tick(); // WAITING -> SENDING

        // 6 data symbols; the seventh covers the ACK slot and EOF.
        let data_bits = 6 * 10;
        for _ in 0..data_bits {
            bus.on_tx_timer_tick();
            mock.advance_cycles(NOMINAL_BIT_CYCLES);
        }
        // A listener acknowledges while the EOF goes out.
        mock.bus_dominant.store(true, Ordering::Relaxed);
        run_to_completion(bus, mock);

        assert_eq!(bus.tx_queue().n_collisions(), 0);
        assert_eq!(bus.tx_count(), 1);
    }

    #[test]
    fn send_async_times_out_when_the_queue_is_full() {
        let (bus, _mock) = new_bus();
        for i in 0..crate::config::VAN_TX_QUEUE_SIZE as u16 {
            assert!(bus.send_async(0x100 + i, 0x00, &[], 0));
        }
        assert!(!bus.send_async(0x999, 0x00, &[], 3));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let (bus, _mock) = new_bus();
        let data = [0u8; 29];
        assert!(!bus.send_async(0x100, 0x00, &data, 0));
        assert_eq!(bus.tx_queue().queued(), 0);
    }

    #[test]
    fn send_sync_times_out_when_nothing_ticks() {
        let (bus, _mock) = new_bus();
        assert!(!bus.send_sync(0x321, 0x00, &[9], 5));
        // The frame stays queued and may still go out later.
        assert_eq!(bus.tx_queue().queued(), 1);
    }

    #[test]
    fn send_sync_completes_once_the_frame_is_out() {
        let (bus, mock) = new_bus();
        let sender = std::thread::spawn(move || bus.send_sync(0x321, 0x00, &[9], 5_000));

        let mut spins = 0u32;
        while !mock.tx_timer_running.load(Ordering::Relaxed) {
            std::thread::yield_now();
            spins += 1;
            assert!(spins < 100_000_000, "send never started");
        }
        let mut ticks = 0;
        while bus.tx_count() == 0 && ticks < 100_000 {
            bus.on_tx_timer_tick();
            mock.advance_cycles(NOMINAL_BIT_CYCLES);
            ticks += 1;
        }
        assert_eq!(bus.tx_count(), 1);
        assert!(sender.join().unwrap());
    }
}
