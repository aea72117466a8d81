//! Textual statistics rendering.

use core::fmt;

use crate::bus::VanBus;

impl VanBus {
    /// Renders the transceiver counters into `w`. The long form adds the
    /// per-bit-error-class repair tallies and the transmit diagnostics.
    pub fn dump_stats(&self, w: &mut dyn fmt::Write, long_form: bool) -> fmt::Result {
        let rx = self.rx_queue();
        let tx = self.tx_queue();
        let repair = self.repair_stats();

        writeln!(
            w,
            "rx: {} frames, queued {}/{} (max {}), overruns {}",
            rx.rx_count(),
            rx.queued(),
            rx.capacity(),
            rx.max_queued(),
            rx.n_overruns(),
        )?;
        writeln!(
            w,
            "tx: {} frames, queued {}/{}, collisions {}, gave up {}",
            tx.tx_count(),
            tx.queued(),
            tx.capacity(),
            tx.n_collisions(),
            tx.n_max_collision_errors(),
        )?;
        writeln!(
            w,
            "crc: corrupt {}, repaired {}",
            repair.n_corrupt(),
            repair.n_repaired(),
        )?;
        if !long_form {
            return Ok(());
        }
        writeln!(
            w,
            "  repairs: 1-bit {}, 2-consecutive {}, 2-separate {}, uncertain {}",
            repair.n_one_bit_errors(),
            repair.n_two_consecutive_bit_errors(),
            repair.n_two_separate_bit_errors(),
            repair.n_uncertain_bit_errors(),
        )?;
        writeln!(w, "  rx dropped by policy: {}", rx.n_dropped())?;
        let ifs_us = tx.last_ifs_cycles() / (self.platform().cpu_hz() / 1_000_000);
        writeln!(
            w,
            "  tx bit errors {}, bus occupied {}, last ifs {} us",
            tx.n_bit_errors(),
            tx.n_bus_occupied(),
            ifs_us,
        )
    }
}
