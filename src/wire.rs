//! On-wire message codec for mesh OTA frames.
//!
//! Every multi-byte field is big-endian. Centralising the byte-swaps here
//! means the state machines in `distributor.rs`/`receiver.rs`/`reboot.rs`
//! never touch a raw offset — a frame is rejected right here if any field
//! is out of range, rather than deep inside a state transition.

use crate::error::{OtaError, Result};

/// Maximum payload carried by a single `Block` message.
pub const MAX_PAYLOAD: usize = crate::config::BLOCK_SIZE;

/// Null-padded ASCII version field width, including the terminator.
pub const VERSION_FIELD_LEN: usize = crate::config::VERSION_FIELD_LEN;

pub type VersionField = [u8; VERSION_FIELD_LEN];

/// Command byte discriminants. Allocated from a reserved range distinct
/// from the heartbeat/RGB/plugin command ranges used elsewhere on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    OtaRequest = 0x50,
    OtaStart = 0x51,
    OtaBlock = 0x52,
    OtaAck = 0x53,
    OtaStatus = 0x54,
    OtaPrepareReboot = 0x55,
    OtaReboot = 0x56,
}

impl Cmd {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x50 => Some(Self::OtaRequest),
            0x51 => Some(Self::OtaStart),
            0x52 => Some(Self::OtaBlock),
            0x53 => Some(Self::OtaAck),
            0x54 => Some(Self::OtaStatus),
            0x55 => Some(Self::OtaPrepareReboot),
            0x56 => Some(Self::OtaReboot),
            _ => None,
        }
    }
}

/// Encode a version string into a null-padded fixed-width field.
/// Truncated (not rejected) at `VERSION_FIELD_LEN - 1` bytes, which is
/// generous for any real semver string.
pub fn encode_version(version: &str) -> VersionField {
    let mut field = [0u8; VERSION_FIELD_LEN];
    let bytes = version.as_bytes();
    let n = bytes.len().min(VERSION_FIELD_LEN - 1);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

/// Decode a null-padded version field back to a `&str`. Rejects anything
/// that is not valid UTF-8 up to the first NUL.
pub fn decode_version(field: &VersionField) -> Result<&str> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).map_err(|_| OtaError::InvalidArg)
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn require_len(buf: &[u8], min: usize) -> Result<()> {
    if buf.len() < min {
        Err(OtaError::InvalidSize)
    } else {
        Ok(())
    }
}

// ── OTA_START ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Start {
    pub total_blocks: u16,
    pub firmware_size: u32,
    pub version: VersionField,
}

impl Start {
    pub const WIRE_LEN: usize = 1 + 2 + 4 + VERSION_FIELD_LEN;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        require_len(out, Self::WIRE_LEN)?;
        out[0] = Cmd::OtaStart as u8;
        out[1..3].copy_from_slice(&self.total_blocks.to_be_bytes());
        out[3..7].copy_from_slice(&self.firmware_size.to_be_bytes());
        out[7..7 + VERSION_FIELD_LEN].copy_from_slice(&self.version);
        Ok(Self::WIRE_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require_len(buf, Self::WIRE_LEN)?;
        if Cmd::from_byte(buf[0]) != Some(Cmd::OtaStart) {
            return Err(OtaError::InvalidArg);
        }
        let mut version = [0u8; VERSION_FIELD_LEN];
        version.copy_from_slice(&buf[7..7 + VERSION_FIELD_LEN]);
        Ok(Self {
            total_blocks: read_u16(buf, 1),
            firmware_size: read_u32(buf, 3),
            version,
        })
    }
}

// ── OTA_BLOCK ────────────────────────────────────────────────

/// Fixed header of a `Block` message; the payload trails it in the same
/// buffer and is handled separately so callers can avoid copying it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_no: u16,
    pub total_blocks: u16,
    pub block_size: u16,
    pub crc32: u32,
}

impl BlockHeader {
    pub const WIRE_LEN: usize = 1 + 2 + 2 + 2 + 4;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        require_len(out, Self::WIRE_LEN)?;
        out[0] = Cmd::OtaBlock as u8;
        out[1..3].copy_from_slice(&self.block_no.to_be_bytes());
        out[3..5].copy_from_slice(&self.total_blocks.to_be_bytes());
        out[5..7].copy_from_slice(&self.block_size.to_be_bytes());
        out[7..11].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(Self::WIRE_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require_len(buf, Self::WIRE_LEN)?;
        if Cmd::from_byte(buf[0]) != Some(Cmd::OtaBlock) {
            return Err(OtaError::InvalidArg);
        }
        Ok(Self {
            block_no: read_u16(buf, 1),
            total_blocks: read_u16(buf, 3),
            block_size: read_u16(buf, 5),
            crc32: read_u32(buf, 7),
        })
    }
}

/// Encode a full `Block` message (header + payload) into `out`.
pub fn encode_block(header: &BlockHeader, payload: &[u8], out: &mut [u8]) -> Result<usize> {
    require_len(out, BlockHeader::WIRE_LEN + payload.len())?;
    let n = header.encode(out)?;
    out[n..n + payload.len()].copy_from_slice(payload);
    Ok(n + payload.len())
}

/// Decode a full `Block` message, returning the header and a slice over
/// the trailing bytes borrowed from `buf`. Does **not** check the trailing
/// slice's length against `header.block_size` — a declared-size mismatch
/// is a NAK-worthy protocol violation, not a decode failure, so the
/// receiver checks it itself and owns the resulting ACK (spec §4.5 step 5).
pub fn decode_block(buf: &[u8]) -> Result<(BlockHeader, &[u8])> {
    let header = BlockHeader::decode(buf)?;
    let payload = &buf[BlockHeader::WIRE_LEN..];
    Ok((header, payload))
}

/// Best-effort `block_no` extraction from a frame too short to fully
/// decode, so a NAK can still reference the attempted index. `0` if even
/// the command byte and block number are missing.
pub fn block_no_hint(buf: &[u8]) -> u16 {
    if buf.len() >= 3 { read_u16(buf, 1) } else { 0 }
}

// ── OTA_ACK ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub block_no: u16,
    pub status: u8,
}

impl Ack {
    pub const WIRE_LEN: usize = 1 + 2 + 1;

    pub fn ok(block_no: u16) -> Self {
        Self {
            block_no,
            status: 0,
        }
    }

    pub fn err(block_no: u16) -> Self {
        Self {
            block_no,
            status: 1,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        require_len(out, Self::WIRE_LEN)?;
        out[0] = Cmd::OtaAck as u8;
        out[1..3].copy_from_slice(&self.block_no.to_be_bytes());
        out[3] = self.status;
        Ok(Self::WIRE_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require_len(buf, Self::WIRE_LEN)?;
        if Cmd::from_byte(buf[0]) != Some(Cmd::OtaAck) {
            return Err(OtaError::InvalidArg);
        }
        Ok(Self {
            block_no: read_u16(buf, 1),
            status: buf[3],
        })
    }
}

// ── OTA_PREPARE_REBOOT ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareReboot {
    pub timeout_seconds: u16,
    pub version: VersionField,
}

impl PrepareReboot {
    pub const WIRE_LEN: usize = 1 + 2 + VERSION_FIELD_LEN;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        require_len(out, Self::WIRE_LEN)?;
        out[0] = Cmd::OtaPrepareReboot as u8;
        out[1..3].copy_from_slice(&self.timeout_seconds.to_be_bytes());
        out[3..3 + VERSION_FIELD_LEN].copy_from_slice(&self.version);
        Ok(Self::WIRE_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require_len(buf, Self::WIRE_LEN)?;
        if Cmd::from_byte(buf[0]) != Some(Cmd::OtaPrepareReboot) {
            return Err(OtaError::InvalidArg);
        }
        let mut version = [0u8; VERSION_FIELD_LEN];
        version.copy_from_slice(&buf[3..3 + VERSION_FIELD_LEN]);
        Ok(Self {
            timeout_seconds: read_u16(buf, 1),
            version,
        })
    }
}

// ── OTA_REBOOT ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reboot {
    pub delay_ms: u16,
}

impl Reboot {
    pub const WIRE_LEN: usize = 1 + 2;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        require_len(out, Self::WIRE_LEN)?;
        out[0] = Cmd::OtaReboot as u8;
        out[1..3].copy_from_slice(&self.delay_ms.to_be_bytes());
        Ok(Self::WIRE_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require_len(buf, Self::WIRE_LEN)?;
        if Cmd::from_byte(buf[0]) != Some(Cmd::OtaReboot) {
            return Err(OtaError::InvalidArg);
        }
        Ok(Self {
            delay_ms: read_u16(buf, 1),
        })
    }
}

// ── OTA_REQUEST / OTA_STATUS ─────────────────────────────────
// Both carry nothing but the command byte for this subsystem's purposes;
// any trailing bytes are left to the upper-layer status payload and are
// not interpreted here.

pub fn encode_request(out: &mut [u8]) -> Result<usize> {
    require_len(out, 1)?;
    out[0] = Cmd::OtaRequest as u8;
    Ok(1)
}
