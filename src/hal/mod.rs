//! HAL (Hardware Abstraction Layer) module.
//!
//! The transceiver runs on top of a [`Platform`] implementation supplied by
//! the integrating firmware: a cycle counter, the two bus pins, the ACK
//! one-shot timer and the transmit bit timer. The firmware wires its
//! pin-change and timer interrupts to the `on_*` entry points of the crate
//! root during its platform-specific interrupt registration.

pub mod sync;

use lazyinit::LazyInit;

pub use sync::IsrShared;

use crate::config;

/// Hardware services the transceiver needs from the integrating firmware.
///
/// All methods are called from interrupt context except [`delay_ms`],
/// [`feed_watchdog`] and the timer management calls, so implementations must
/// be bounded-time and must not allocate.
///
/// [`delay_ms`]: Platform::delay_ms
/// [`feed_watchdog`]: Platform::feed_watchdog
pub trait Platform: Sync {
    /// Current value of the free-running CPU cycle counter. Wraps.
    fn cycle_count(&self) -> u32;

    /// CPU frequency in Hz. The bit-timing tables scale by
    /// `cpu_hz / 80 MHz`.
    fn cpu_hz(&self) -> u32;

    /// Milliseconds since boot. Wraps.
    fn millis(&self) -> u32;

    /// Binds the transceiver's pins. Called once from `setup`, before any
    /// interrupt is attached; `tx_pin` is `None` on listen-only wiring.
    fn configure_pins(&self, _rx_pin: u8, _tx_pin: Option<u8>) {}

    /// Electrical level of the receive pin.
    fn rx_pin(&self) -> bool;

    /// Drive the transmit pin to the given electrical level.
    fn set_tx_pin(&self, high: bool);

    /// Electrical level read back from the transmit pin. The bus is
    /// wired-AND, so this differs from the last written level when a
    /// stronger (dominant) device is driving.
    fn tx_pin(&self) -> bool;

    /// Enable delivery of receive-pin edge interrupts to
    /// [`crate::on_rx_pin_change`].
    fn attach_rx_isr(&self);

    /// Suppress receive-pin edge interrupts (used while transmitting, when
    /// the transceiver would otherwise see its own edges).
    fn detach_rx_isr(&self);

    /// Arm the one-shot ACK timer to fire [`crate::on_ack_timer`] after the
    /// given number of CPU cycles. Re-arming replaces the previous deadline.
    fn arm_ack_timer(&self, cycles: u32);

    /// Cancel a pending ACK timer without firing it.
    fn cancel_ack_timer(&self);

    /// Start the periodic transmit timer firing [`crate::on_tx_timer_tick`]
    /// every `period_ns` nanoseconds.
    fn start_tx_timer(&self, period_ns: u32);

    /// Stop the periodic transmit timer.
    fn stop_tx_timer(&self);

    /// Sleep for the given number of milliseconds. Main context only.
    fn delay_ms(&self, ms: u32);

    /// Pet the hardware watchdog. Called from long-running repair loops.
    fn feed_watchdog(&self) {}

    /// Mask interrupts on the current core. Used by [`IsrShared`]; the
    /// default no-op is only suitable for host builds.
    fn disable_irqs(&self) {}

    /// Unmask interrupts on the current core.
    fn enable_irqs(&self) {}

    /// Whether interrupts are currently masked.
    fn irqs_disabled(&self) -> bool {
        true
    }
}

/// The platform registered at setup time. Lock-free: read-only after
/// `init_once`.
static PLATFORM: LazyInit<&'static dyn Platform> = LazyInit::new();

/// Registers the platform for the interrupt-masking hooks of [`IsrShared`].
///
/// Called once from `setup`. Before registration the hooks are no-ops,
/// which leaves [`IsrShared`] with only its flag (fine on the host, where
/// there are no interrupts to mask).
pub(crate) fn register_platform(platform: &'static dyn Platform) {
    if !PLATFORM.is_inited() {
        PLATFORM.init_once(platform);
    }
}

#[inline]
pub(crate) fn disable_irqs() {
    if PLATFORM.is_inited() {
        PLATFORM.disable_irqs();
    }
}

#[inline]
pub(crate) fn enable_irqs() {
    if PLATFORM.is_inited() {
        PLATFORM.enable_irqs();
    }
}

#[inline]
pub(crate) fn irqs_disabled() -> bool {
    if PLATFORM.is_inited() {
        PLATFORM.irqs_disabled()
    } else {
        true
    }
}

/// Pets the watchdog through the registered platform, if any.
#[inline]
pub(crate) fn feed_watchdog() {
    if PLATFORM.is_inited() {
        PLATFORM.feed_watchdog();
    }
}

/// Logical level of the receive pin: `true` is recessive (logical 1).
#[inline]
pub(crate) fn rx_level(platform: &dyn Platform) -> bool {
    platform.rx_pin() ^ config::VAN_BIT_INVERTED_WIRING
}

/// Logical level read back from the transmit pin.
#[inline]
pub(crate) fn tx_level(platform: &dyn Platform) -> bool {
    platform.tx_pin() ^ config::VAN_BIT_INVERTED_WIRING
}

/// Drive the transmit pin to a logical level: `true` is recessive.
#[inline]
pub(crate) fn set_tx_level(platform: &dyn Platform, level: bool) {
    platform.set_tx_pin(level ^ config::VAN_BIT_INVERTED_WIRING);
}
