//! Debug capture rings (feature `debug-capture`).
//!
//! Bounded buffers of per-ISR and per-IFS samples for offline rendering of
//! bus captures. The Rx ISR appends one sample per edge into the buffer
//! currently open for writing; a reader locks one buffer at a time while
//! dumping it, and the writer silently skips locked buffers instead of
//! blocking, so capture never stretches the ISR.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::packet::RxState;

const ISR_BUFFERS: usize = 4;
const ISR_SAMPLES_PER_BUFFER: usize = 64;
const IFS_SAMPLES: usize = 16;

/// One pin-change ISR invocation.
#[derive(Clone, Copy)]
pub struct IsrSample {
    /// Cycle counter at the edge.
    pub cycles: u32,
    /// Logical pin level after the edge.
    pub pin_level: bool,
    /// Latency carry left behind.
    pub jitter: u32,
    /// Bit position within the current symbol after the edge.
    pub at_bit: u8,
    /// Low bits of the shift register.
    pub shift_reg: u16,
    /// Head descriptor state after the edge.
    pub state: RxState,
    /// Head slot index.
    pub slot: u8,
}

impl IsrSample {
    const EMPTY: IsrSample = IsrSample {
        cycles: 0,
        pin_level: true,
        jitter: 0,
        at_bit: 0,
        shift_reg: 0,
        state: RxState::Vacant,
        slot: 0,
    };
}

/// One measured inter-frame space before a transmission.
#[derive(Clone, Copy)]
pub struct IfsSample {
    pub ifs_cycles: u32,
    pub at_millis: u32,
}

impl IfsSample {
    const EMPTY: IfsSample = IfsSample {
        ifs_cycles: 0,
        at_millis: 0,
    };
}

struct IsrBuffer {
    /// Held by a reader while dumping; the writer skips the buffer.
    locked: AtomicBool,
    len: AtomicUsize,
    samples: UnsafeCell<[IsrSample; ISR_SAMPLES_PER_BUFFER]>,
}

impl IsrBuffer {
    const fn new() -> Self {
        IsrBuffer {
            locked: AtomicBool::new(false),
            len: AtomicUsize::new(0),
            samples: UnsafeCell::new([IsrSample::EMPTY; ISR_SAMPLES_PER_BUFFER]),
        }
    }
}

struct IfsBuffer {
    locked: AtomicBool,
    len: AtomicUsize,
    samples: UnsafeCell<[IfsSample; IFS_SAMPLES]>,
}

pub(crate) struct CaptureRing {
    bufs: [IsrBuffer; ISR_BUFFERS],
    /// Buffer currently open for writing.
    write: AtomicUsize,
    skipped: AtomicUsize,
    ifs: IfsBuffer,
}

// Writers only touch the unlocked write buffer; readers only touch buffers
// they hold the lock on.
unsafe impl Sync for CaptureRing {}

impl CaptureRing {
    pub(crate) const fn new() -> Self {
        CaptureRing {
            bufs: [const { IsrBuffer::new() }; ISR_BUFFERS],
            write: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            ifs: IfsBuffer {
                locked: AtomicBool::new(false),
                len: AtomicUsize::new(0),
                samples: UnsafeCell::new([IfsSample::EMPTY; IFS_SAMPLES]),
            },
        }
    }

    /// Appends one ISR sample. Interrupt context; never blocks.
    pub(crate) fn record_isr(&self, sample: IsrSample) {
        let idx = self.write.load(Ordering::Relaxed) % ISR_BUFFERS;
        let buf = &self.bufs[idx];
        if buf.locked.load(Ordering::Acquire) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let len = buf.len.load(Ordering::Relaxed);
        if len < ISR_SAMPLES_PER_BUFFER {
            // Safety: the writer is single-context and the buffer is not
            // locked by a reader.
            unsafe { (*buf.samples.get())[len] = sample };
            buf.len.store(len + 1, Ordering::Release);
        }
        if len + 1 >= ISR_SAMPLES_PER_BUFFER {
            let next = (idx + 1) % ISR_BUFFERS;
            if !self.bufs[next].locked.load(Ordering::Acquire) {
                self.bufs[next].len.store(0, Ordering::Relaxed);
            }
            self.write.store(next, Ordering::Relaxed);
        }
    }

    /// Appends one IFS sample. Timer interrupt context.
    pub(crate) fn record_ifs(&self, sample: IfsSample) {
        if self.ifs.locked.load(Ordering::Acquire) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let len = self.ifs.len.load(Ordering::Relaxed);
        let at = len % IFS_SAMPLES;
        // Safety: single writer, reader excluded by the lock.
        unsafe { (*self.ifs.samples.get())[at] = sample };
        self.ifs.len.store(len + 1, Ordering::Release);
    }

    /// Renders and drains all unlocked buffers. Main context.
    pub(crate) fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        for (i, buf) in self.bufs.iter().enumerate() {
            if buf.locked.swap(true, Ordering::Acquire) {
                continue;
            }
            let len = buf.len.load(Ordering::Acquire).min(ISR_SAMPLES_PER_BUFFER);
            // Safety: the lock excludes the writer.
            let samples = unsafe { &*buf.samples.get() };
            let mut result = writeln!(w, "isr buffer {i}: {len} samples");
            for s in &samples[..len] {
                if result.is_err() {
                    break;
                }
                result = writeln!(
                    w,
                    "  {:>10} {} j{:<4} b{:<2} {:03X} {:?} slot {}",
                    s.cycles,
                    if s.pin_level { '1' } else { '0' },
                    s.jitter,
                    s.at_bit,
                    s.shift_reg,
                    s.state,
                    s.slot,
                );
            }
            buf.len.store(0, Ordering::Relaxed);
            buf.locked.store(false, Ordering::Release);
            result?;
        }

        if !self.ifs.locked.swap(true, Ordering::Acquire) {
            let len = self.ifs.len.load(Ordering::Acquire);
            let n = len.min(IFS_SAMPLES);
            // Safety: the lock excludes the writer.
            let samples = unsafe { &*self.ifs.samples.get() };
            let mut result = writeln!(w, "ifs: {n} samples");
            for s in &samples[..n] {
                if result.is_err() {
                    break;
                }
                result = writeln!(w, "  {} cycles at {} ms", s.ifs_cycles, s.at_millis);
            }
            self.ifs.len.store(0, Ordering::Relaxed);
            self.ifs.locked.store(false, Ordering::Release);
            result?;
        }

        let skipped = self.skipped.swap(0, Ordering::Relaxed);
        if skipped > 0 {
            writeln!(w, "capture: {skipped} samples skipped while locked")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cycles: u32) -> IsrSample {
        IsrSample {
            cycles,
            ..IsrSample::EMPTY
        }
    }

    #[test]
    fn records_and_drains_samples() {
        let ring = CaptureRing::new();
        for i in 0..10 {
            ring.record_isr(sample(i));
        }
        let mut out = String::new();
        ring.dump(&mut out).unwrap();
        assert!(out.contains("10 samples"), "{out}");
        // Drained: a second dump is empty.
        let mut out = String::new();
        ring.dump(&mut out).unwrap();
        assert!(out.contains("0 samples"), "{out}");
    }

    #[test]
    fn writer_skips_a_locked_buffer() {
        let ring = CaptureRing::new();
        ring.bufs[0].locked.store(true, Ordering::Release);
        ring.record_isr(sample(1));
        assert_eq!(ring.bufs[0].len.load(Ordering::Relaxed), 0);
        assert_eq!(ring.skipped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn full_buffer_rolls_to_the_next() {
        let ring = CaptureRing::new();
        for i in 0..(ISR_SAMPLES_PER_BUFFER + 3) as u32 {
            ring.record_isr(sample(i));
        }
        assert_eq!(ring.write.load(Ordering::Relaxed), 1);
        assert_eq!(ring.bufs[1].len.load(Ordering::Relaxed), 3);
    }
}
