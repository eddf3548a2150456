//! Message Router (component G).
//!
//! Stateless dispatch of inbound mesh frames to the owning component by
//! `(role, command byte)`. Invalid role/command combinations are dropped
//! with a warning rather than surfaced as an error — a leaf receiving
//! `OTA_ACK`, for instance, is a protocol violation from elsewhere on the
//! mesh, not a local fault.

use log::warn;

use crate::error::{OtaError, Result};
use crate::wire::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Root,
    Leaf,
}

/// Which component should handle a frame, or that it was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Distributor,
    RebootCoordinator,
    Receiver,
    Dropped,
}

/// Classify an inbound frame's first byte for `role`. Returns `InvalidSize`
/// without classifying (and without any state mutation elsewhere) for an
/// empty frame — callers must check this before touching the byte.
pub fn route(role: Role, frame: &[u8]) -> Result<Route> {
    let Some(&cmd_byte) = frame.first() else {
        return Err(OtaError::InvalidSize);
    };
    let Some(cmd) = Cmd::from_byte(cmd_byte) else {
        warn!("router: unknown command byte 0x{cmd_byte:02x}, dropping");
        return Ok(Route::Dropped);
    };

    let route = match (role, cmd) {
        (Role::Root, Cmd::OtaRequest) => Route::Distributor,
        (Role::Root, Cmd::OtaAck) => Route::Distributor,
        (Role::Root, Cmd::OtaStatus) => Route::Distributor,
        (Role::Leaf, Cmd::OtaStart) => Route::Receiver,
        (Role::Leaf, Cmd::OtaBlock) => Route::Receiver,
        (Role::Leaf, Cmd::OtaPrepareReboot) => Route::RebootCoordinator,
        (Role::Leaf, Cmd::OtaReboot) => Route::RebootCoordinator,
        _ => {
            warn!("router: {cmd:?} is not valid for role {role:?}, dropping");
            Route::Dropped
        }
    };
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    #[test]
    fn root_routes_ack_to_distributor() {
        let mut frame = [0u8; wire::Ack::WIRE_LEN];
        wire::Ack::ok(3).encode(&mut frame).unwrap();
        assert_eq!(route(Role::Root, &frame).unwrap(), Route::Distributor);
    }

    #[test]
    fn leaf_routes_block_to_receiver() {
        let header = wire::BlockHeader {
            block_no: 0,
            total_blocks: 1,
            block_size: 0,
            crc32: 0,
        };
        let mut frame = [0u8; wire::BlockHeader::WIRE_LEN];
        header.encode(&mut frame).unwrap();
        assert_eq!(route(Role::Leaf, &frame).unwrap(), Route::Receiver);
    }

    #[test]
    fn leaf_routes_prepare_reboot_and_reboot_to_coordinator() {
        let mut prepare = [0u8; wire::PrepareReboot::WIRE_LEN];
        wire::PrepareReboot {
            timeout_seconds: 5,
            version: wire::encode_version("1.0.0"),
        }
        .encode(&mut prepare)
        .unwrap();
        assert_eq!(route(Role::Leaf, &prepare).unwrap(), Route::RebootCoordinator);

        let mut reboot = [0u8; wire::Reboot::WIRE_LEN];
        wire::Reboot { delay_ms: 10 }.encode(&mut reboot).unwrap();
        assert_eq!(route(Role::Leaf, &reboot).unwrap(), Route::RebootCoordinator);
    }

    #[test]
    fn leaf_receiving_ack_is_dropped() {
        let mut frame = [0u8; wire::Ack::WIRE_LEN];
        wire::Ack::ok(0).encode(&mut frame).unwrap();
        assert_eq!(route(Role::Leaf, &frame).unwrap(), Route::Dropped);
    }

    #[test]
    fn unknown_command_byte_is_dropped_not_errored() {
        let frame = [0xFFu8, 0, 0];
        assert_eq!(route(Role::Root, &frame).unwrap(), Route::Dropped);
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert_eq!(route(Role::Root, &[]), Err(OtaError::InvalidSize));
    }
}
