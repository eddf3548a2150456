//! Build-time constants for the mesh OTA subsystem.
//!
//! These are compiled into wire-format assumptions (block header fields,
//! bitmap sizing) and therefore live as `const`s rather than a runtime-
//! loaded config: a build and the image it produces must always agree on
//! them. Network-tunable behaviour (thresholds, intervals) has no place
//! here — see `spec.md` §3 for the rationale.

/// Size of a firmware block, in bytes. Power of two by design.
pub const BLOCK_SIZE: usize = 1024;

/// Hard cap on `total_blocks` for a single OTA session (bounds a 4 MiB image).
pub const MAX_BLOCKS: usize = 4096;

/// Hard cap on firmware size derived from `MAX_BLOCKS * BLOCK_SIZE`.
pub const MAX_FIRMWARE_SIZE: u32 = (MAX_BLOCKS * BLOCK_SIZE) as u32;

/// Maximum number of mesh nodes (excluding root) in a single distribution session.
pub const MAX_NODES: usize = 64;

/// Re-attempts for the downloader before giving up.
pub const MAX_RETRIES: u8 = 3;

/// Fixed delay between downloader retry attempts.
pub const RETRY_DELAY_MS: u32 = 2_000;

/// Per-block retry budget during distribution (in addition to the first attempt).
pub const MAX_RETRIES_PER_BLOCK: u8 = 5;

/// How long the distributor waits for ACKs on a single block attempt.
pub const ACK_TIMEOUT_MS: u32 = 3_000;

/// Sleep between non-final per-block retries, to avoid saturating the mesh.
pub const BLOCK_RETRY_BACKOFF_MS: u32 = 100;

/// Inactivity timeout on a leaf mid-reception: no BLOCK seen for this long aborts.
pub const LEAF_BLOCK_TIMEOUT_MS: u32 = 30_000;

/// HTTP(S) request timeout.
pub const HTTP_TIMEOUT_MS: u32 = 30_000;

/// Rollback watchdog: how long a freshly-armed node waits before checking
/// mesh connectivity.
pub const ROLLBACK_TIMEOUT_MS: u32 = 5 * 60 * 1000;

/// Rollback attempt ceiling; at or above this the engine self-clears.
pub const MAX_ATTEMPTS: u8 = 3;

/// Maximum length of a null-padded version string on the wire, including
/// the terminator.
pub const VERSION_FIELD_LEN: usize = 16;
