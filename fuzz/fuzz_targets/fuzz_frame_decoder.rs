//! Fuzz target: `router::route`
//!
//! Drives arbitrary byte sequences through the message router's frame
//! classification for both mesh roles and asserts it never panics —
//! an unrecognised command byte or truncated frame must be dropped or
//! rejected, never misclassified into an out-of-bounds decode downstream.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_ota::router::{self, Role};

fuzz_target!(|data: &[u8]| {
    let _ = router::route(Role::Root, data);
    let _ = router::route(Role::Leaf, data);
});
