//! Unified error type for the mesh OTA subsystem.
//!
//! Every fallible operation across the Downloader, Version Gate,
//! Distributor, Receiver, Reboot Coordinator, and Rollback Engine funnels
//! into this one type, keeping error handling uniform the way the
//! firmware's top-level `Error` does for sensors/actuators/comms.
//! All variants are `Copy` so they cross thread boundaries (distribution
//! worker, rollback watchdog) without allocation.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    /// Malformed input: bad URL scheme, out-of-range wire field.
    InvalidArg,
    /// Operation not permitted in the current state (already downloading,
    /// not root, distribution busy, reboot already coordinating).
    InvalidState,
    /// Length mismatch: content-length vs. bytes read, block size vs.
    /// frame length, firmware vs. partition capacity.
    InvalidSize,
    /// Downgrade detected by the version gate.
    InvalidVersion,
    /// No partition available, no target nodes, empty routing table.
    NotFound,
    /// Allocation failure (bitmap, node list).
    OutOfMemory,
    /// Network/server-side transient failure (5xx, connection reset).
    /// Retryable by the downloader.
    TransportTransient,
    /// Deadline exceeded (HTTP, ACK wait, reboot prepare, leaf inactivity).
    Timeout,
    /// Unclassified collaborator I/O failure.
    Fatal,
}

impl OtaError {
    /// Whether the downloader should re-attempt after this error.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransportTransient | Self::Timeout | Self::Fatal)
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg => write!(f, "invalid argument"),
            Self::InvalidState => write!(f, "invalid state for this operation"),
            Self::InvalidSize => write!(f, "size mismatch"),
            Self::InvalidVersion => write!(f, "downgrade rejected"),
            Self::NotFound => write!(f, "not found"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::TransportTransient => write!(f, "transient transport failure"),
            Self::Timeout => write!(f, "timed out"),
            Self::Fatal => write!(f, "unclassified I/O failure"),
        }
    }
}

impl std::error::Error for OtaError {}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, OtaError>;
