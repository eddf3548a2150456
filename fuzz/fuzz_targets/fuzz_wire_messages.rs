//! Fuzz target: wire message decoders.
//!
//! Every `decode` must either return a valid value or an `OtaError` — never
//! panic on truncated input, a length field that disagrees with the actual
//! buffer, or a garbage command byte.
//!
//! cargo fuzz run fuzz_wire_messages

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_ota::wire::{self, Ack, BlockHeader, PrepareReboot, Reboot, Start};

fuzz_target!(|data: &[u8]| {
    let _ = Start::decode(data);
    let _ = BlockHeader::decode(data);
    let _ = wire::decode_block(data);
    let _ = Ack::decode(data);
    let _ = PrepareReboot::decode(data);
    let _ = Reboot::decode(data);
});
