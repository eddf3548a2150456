//! CRC32 over block payloads: the standard reflected polynomial
//! `0xEDB88320`, init `0xFFFFFFFF`, final XOR `0xFFFFFFFF` (CRC-32/ISO-HDLC).
//!
//! Delegated to `crc32fast`, which picks a hardware-accelerated
//! implementation when available and falls back to a table-driven one
//! otherwise — no reason to hand-roll this on a platform that already has
//! it.

pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}
