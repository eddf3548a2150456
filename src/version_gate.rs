//! Version Gate (component B).
//!
//! Reads a partition's embedded app descriptor, parses its semantic
//! version, and compares it against the running firmware's compile-time
//! version. Fails closed: anything that cannot be parsed is rejected
//! rather than let through.

use crate::error::{OtaError, Result};
use crate::ports::{PartitionDescriptor, PartitionPort, PartitionSlot};
use crate::wire::decode_version;

/// Parsed `major.minor.patch` triplet, field-by-field comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, '.');
        let major = parts.next().ok_or(OtaError::InvalidArg)?;
        let minor = parts.next().ok_or(OtaError::InvalidArg)?;
        let patch = parts.next().ok_or(OtaError::InvalidArg)?;
        Ok(Self {
            major: major.parse().map_err(|_| OtaError::InvalidArg)?,
            minor: minor.parse().map_err(|_| OtaError::InvalidArg)?,
            patch: patch.parse().map_err(|_| OtaError::InvalidArg)?,
        })
    }
}

/// Compare a candidate partition's declared version against the running
/// firmware's version string. `Ok(())` for same-or-newer; `InvalidVersion`
/// for strictly older; `InvalidArg` if either version fails to parse.
pub fn check<P: PartitionPort>(
    partition: &P,
    slot: PartitionSlot,
    running_version: &str,
) -> Result<()> {
    let descriptor = partition.read_descriptor(slot)?;
    check_descriptor(&descriptor, running_version)
}

/// As [`check`], but operating on an already-read descriptor — used by
/// callers (the downloader) that have just finalised the partition and
/// already hold the descriptor.
pub fn check_descriptor(descriptor: &PartitionDescriptor, running_version: &str) -> Result<()> {
    let candidate_str = decode_version(&descriptor.version)?;
    let candidate = SemVer::parse(candidate_str)?;
    let running = SemVer::parse(running_version)?;

    if candidate < running {
        Err(OtaError::InvalidVersion)
    } else {
        Ok(())
    }
}
