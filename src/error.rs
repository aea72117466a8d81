//! Unified error types for the VAN bus transceiver.

/// Unified error type for the transceiver.
///
/// This enum contains all possible error variants from the different
/// subsystems. Using a flat error structure simplifies error handling and
/// propagation across module boundaries in a no_std environment.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VanError {
    // ============================================================================
    // Setup Related Errors
    // ============================================================================
    /// The transceiver singleton has already been set up
    #[error("transceiver already set up")]
    AlreadySetup,

    /// An operation was attempted before `setup` was called
    #[error("transceiver not set up")]
    NotSetup,

    // ============================================================================
    // Transmit Related Errors
    // ============================================================================
    /// The payload exceeds the 28-byte maximum of a VAN frame
    #[error("payload of {0} bytes exceeds the 28-byte maximum")]
    PayloadTooLong(usize),

    /// No transmit pin was configured at setup time
    #[error("transmit path disabled: no tx pin configured")]
    TxDisabled,

    /// No transmit queue slot became free within the timeout
    #[error("transmit queue full")]
    TxQueueFull,

    /// The frame lost arbitration too many times and was dropped
    #[error("frame dropped after {0} collisions")]
    TxDropped(u8),

    /// The frame was not transmitted within the timeout
    #[error("transmission timed out after {0} ms")]
    TxTimeout(u32),
}

/// Type alias for Result with VanError as the error type.
///
/// Example: `fn enqueue() -> VanResult<()>`
pub type VanResult<T> = core::result::Result<T, VanError>;
