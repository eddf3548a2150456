//! Port traits — the hexagonal boundary between domain logic and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ domain (downloader / distributor / receiver / ...)
//! ```
//!
//! Driven adapters (mesh transport, flash partitions, HTTP client, KV
//! store, clock) live in `src/adapters/` and implement these traits. The
//! domain modules consume them via generics, so none of the core OTA
//! logic touches ESP-IDF directly — it compiles and is testable on a
//! plain host target.

use crate::error::OtaError;
use crate::wire::VersionField;

/// Six-byte mesh node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
}

/// Identifies a flash partition a caller wants to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSlot {
    Running,
    Inactive,
}

/// Opaque handle returned by `PartitionPort::open_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteHandle(pub u32);

/// Metadata read from a partition's embedded app descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub version: VersionField,
    /// Length of the firmware image in bytes, as recorded by the build
    /// tooling — distinct from the partition's raw flash capacity.
    pub image_len: u32,
}

/// Result of re-validating a partition after a write completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionValidity {
    Valid,
    Invalid,
}

/// Flash partition access: running/inactive enumeration, streaming
/// writes, boot-target selection, and app-descriptor reads.
pub trait PartitionPort {
    /// Address/length identity of a partition, used for the pre-flight
    /// "boot partition differs from inactive partition" check.
    fn identity(&self, slot: PartitionSlot) -> Result<(u32, u32), OtaError>;

    fn read(&self, slot: PartitionSlot, offset: u32, buf: &mut [u8]) -> Result<(), OtaError>;

    /// Begin a streaming write of `size` bytes to the inactive partition.
    fn open_write(&mut self, size: u32) -> Result<WriteHandle, OtaError>;

    fn write(&mut self, handle: WriteHandle, buf: &[u8]) -> Result<(), OtaError>;

    /// Finalise a write, making the image available for validation.
    fn finish(&mut self, handle: WriteHandle) -> Result<(), OtaError>;

    /// Abort an in-progress write, discarding partial data.
    fn abort(&mut self, handle: WriteHandle);

    /// Set the next boot target. Implementations must make this
    /// observable to a subsequent `identity()`/`validate_state` call.
    fn set_boot(&mut self, slot: PartitionSlot) -> Result<(), OtaError>;

    /// Which partition is currently selected as the boot target.
    fn boot_target(&self) -> Result<PartitionSlot, OtaError>;

    fn validate_state(&self, slot: PartitionSlot) -> Result<PartitionValidity, OtaError>;

    fn read_descriptor(&self, slot: PartitionSlot) -> Result<PartitionDescriptor, OtaError>;

    /// Restart the device. Never returns on success.
    fn restart(&mut self);
}

/// Mesh transport: routing-table enumeration and unicast send/recv.
pub trait MeshTransportPort {
    fn is_root(&self) -> bool;

    /// Mesh nodes excluding this device's own address.
    fn routing_table(&self) -> Vec<MacAddr>;

    fn send(&mut self, to: MacAddr, bytes: &[u8]) -> Result<(), OtaError>;

    /// Address of the parent toward the root, if currently reachable.
    /// Leaves fall back to [`MacAddr::BROADCAST`] when this is `None`;
    /// see the "leaf ACK destination fallback" contract.
    fn parent_address(&self) -> Option<MacAddr>;
}

/// Streaming byte source behind an HTTP or HTTPS fetch — unifies the two
/// transports behind one reader so retry/progress/finalise logic has
/// exactly one implementation.
pub trait HttpClientPort {
    /// Open `url` with the given timeout; fetch response headers.
    fn open(&mut self, url: &str, timeout_ms: u32) -> Result<HttpResponseInfo, OtaError>;

    /// Read up to `buf.len()` bytes; `Ok(0)` signals EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OtaError>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpResponseInfo {
    pub status: u16,
    /// `None` when the server did not send `Content-Length`.
    pub content_length: Option<u32>,
}

/// Persistent key-value storage, scoped to the rollback namespace.
pub trait KvStorePort {
    fn get_u8(&self, namespace: &str, key: &str) -> Result<Option<u8>, OtaError>;

    fn set_u8(&mut self, namespace: &str, key: &str, value: u8) -> Result<(), OtaError>;

    fn erase_key(&mut self, namespace: &str, key: &str) -> Result<(), OtaError>;

    fn commit(&mut self) -> Result<(), OtaError>;
}

/// Monotonic clock and sleep primitive.
pub trait ClockPort {
    fn now_ms(&self) -> u64;

    fn sleep_ms(&self, ms: u32);
}
