//! Bounded receive queue.
//!
//! An arena of packet descriptors with a producer index owned by the
//! pin-change ISR and a consumer index owned by the caller of `receive`.
//! The only cross-context state is `n_queued` (release on publish, acquire
//! on consume) and the sticky overrun flag; the hot path takes no locks.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::config::VAN_RX_QUEUE_SIZE;
use crate::hal::IsrShared;
use crate::packet::{PacketPredicate, RxPacket, RxState};

/// When and what the producer may discard instead of queueing.
///
/// Once more than `threshold` packets are waiting, freshly committed
/// packets are discarded in place unless `is_essential` accepts them. The
/// predicate runs inside the ISR: it must be bounded-time and must not
/// synchronize.
pub struct DropPolicy {
    pub threshold: usize,
    pub is_essential: Option<PacketPredicate>,
}

impl DropPolicy {
    /// Never discard; rely on the overrun flag when the queue fills up.
    pub const fn disabled() -> Self {
        DropPolicy {
            threshold: VAN_RX_QUEUE_SIZE,
            is_essential: None,
        }
    }
}

pub(crate) struct RxQueue {
    slots: [UnsafeCell<RxPacket>; VAN_RX_QUEUE_SIZE],
    /// Producer index; the ISR assembles into this slot.
    head: AtomicUsize,
    /// Consumer index; `receive` copies out of this slot.
    tail: AtomicUsize,
    n_queued: AtomicUsize,
    max_queued: AtomicUsize,
    overrun: AtomicBool,
    n_overruns: AtomicU32,
    n_dropped: AtomicU32,
    rx_count: AtomicU32,
    next_seq: AtomicU32,
    policy: IsrShared<DropPolicy>,
}

// The slot arena is partitioned by the head/tail protocol: the ISR only
// writes the head slot, the consumer only reads slots it observed behind
// `n_queued`'s release/acquire pair.
unsafe impl Sync for RxQueue {}

impl RxQueue {
    pub(crate) const fn new() -> Self {
        RxQueue {
            slots: [const { UnsafeCell::new(RxPacket::new()) }; VAN_RX_QUEUE_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            n_queued: AtomicUsize::new(0),
            max_queued: AtomicUsize::new(0),
            overrun: AtomicBool::new(false),
            n_overruns: AtomicU32::new(0),
            n_dropped: AtomicU32::new(0),
            rx_count: AtomicU32::new(0),
            next_seq: AtomicU32::new(0),
            policy: IsrShared::new(DropPolicy::disabled()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        VAN_RX_QUEUE_SIZE
    }

    /// All slots committed and waiting for the consumer.
    pub(crate) fn is_full(&self) -> bool {
        self.n_queued.load(Ordering::Acquire) >= VAN_RX_QUEUE_SIZE
    }

    /// Index of the producer slot.
    #[allow(dead_code)]
    pub(crate) fn head_index(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }

    /// The descriptor the ISR is currently assembling into.
    ///
    /// # Safety
    ///
    /// Only the producer (the Rx ISR and the ACK timeout it arms) may call
    /// this, and only while the queue is not full.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn head_packet(&self) -> &mut RxPacket {
        unsafe { &mut *self.slots[self.head.load(Ordering::Relaxed)].get() }
    }

    /// Stamps and publishes the head descriptor, or discards it in place
    /// per the drop policy. Producer context only.
    pub(crate) fn commit_head(&self, millis: u32) {
        let head = self.head.load(Ordering::Relaxed);
        // Safety: producer context, queue not full (the head slot was
        // being assembled, so it cannot be a committed slot).
        let pkt = unsafe { &mut *self.slots[head].get() };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        pkt.commit(seq, millis, head);
        self.rx_count.fetch_add(1, Ordering::Relaxed);

        let n_after = self.n_queued.load(Ordering::Relaxed) + 1;
        let keep = self
            .policy
            .with(|p| n_after <= p.threshold || p.is_essential.is_some_and(|f| f(pkt)));

        if keep {
            self.head.store((head + 1) % VAN_RX_QUEUE_SIZE, Ordering::Relaxed);
            let n = self.n_queued.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_queued.fetch_max(n, Ordering::Relaxed);
        } else {
            pkt.reset();
            self.n_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an edge that arrived while the queue had no vacant head
    /// slot. Sticky until a `receive` call reports it.
    pub(crate) fn note_overrun(&self) {
        if !self.overrun.swap(true, Ordering::Relaxed) {
            self.n_overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Non-blocking test-and-copy of the oldest committed descriptor.
    pub(crate) fn receive(&self, out: &mut RxPacket, overrun: Option<&mut bool>) -> bool {
        if self.n_queued.load(Ordering::Acquire) == 0 {
            return false;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        // Safety: n_queued > 0, so the tail slot is committed and the
        // producer is no longer touching it.
        let pkt = unsafe { &mut *self.slots[tail].get() };
        if pkt.state() != RxState::Done {
            return false;
        }
        *out = *pkt;
        pkt.reset();
        self.tail.store((tail + 1) % VAN_RX_QUEUE_SIZE, Ordering::Relaxed);
        self.n_queued.fetch_sub(1, Ordering::AcqRel);
        if let Some(overrun) = overrun {
            *overrun = self.overrun.swap(false, Ordering::AcqRel);
        }
        true
    }

    pub(crate) fn available(&self) -> bool {
        self.n_queued.load(Ordering::Acquire) > 0
    }

    pub(crate) fn queued(&self) -> usize {
        self.n_queued.load(Ordering::Relaxed)
    }

    pub(crate) fn max_queued(&self) -> usize {
        self.max_queued.load(Ordering::Relaxed)
    }

    pub(crate) fn rx_count(&self) -> u32 {
        self.rx_count.load(Ordering::Relaxed)
    }

    pub(crate) fn n_dropped(&self) -> u32 {
        self.n_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn n_overruns(&self) -> u32 {
        self.n_overruns.load(Ordering::Relaxed)
    }

    pub(crate) fn set_drop_policy(&self, threshold: usize, is_essential: Option<PacketPredicate>) {
        self.policy.with(|p| {
            p.threshold = threshold;
            p.is_essential = is_essential;
        });
    }
}
