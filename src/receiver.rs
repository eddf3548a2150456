//! Receiver (component D) — leaf side.
//!
//! Accepts `OTA_START`, validates and writes `OTA_BLOCK`s, finalises and
//! validates the partition, then participates in the two-phase reboot
//! handshake. State is a data-carrying enum rather than a table-driven
//! state machine: the in-progress reception state carries a partition
//! handle, a bitmap, and byte counters that don't fit a fixed shape.

use log::{info, warn};

use crate::bitmap::ReceptionBitmap;
use crate::config::{LEAF_BLOCK_TIMEOUT_MS, MAX_FIRMWARE_SIZE};
use crate::crc;
use crate::error::{OtaError, Result};
use crate::ports::{
    ClockPort, KvStorePort, MacAddr, MeshTransportPort, PartitionPort, PartitionSlot,
    PartitionValidity, WriteHandle,
};
use crate::rollback;
use crate::version_gate;
use crate::wire::{Ack, BlockHeader, VersionField};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Receiving,
    Complete,
    Aborted,
}

struct ReceivingSession {
    total_blocks: u16,
    version: VersionField,
    bitmap: ReceptionBitmap,
    bytes_written: u32,
    last_block_ms: u64,
    handle: WriteHandle,
}

pub struct Receiver {
    session: Option<ReceivingSession>,
    complete_version: Option<VersionField>,
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            session: None,
            complete_version: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        match (&self.session, &self.complete_version) {
            (Some(_), _) => ReceiverState::Receiving,
            (None, Some(_)) => ReceiverState::Complete,
            (None, None) => ReceiverState::Idle,
        }
    }

    /// `OTA_START`: the previous session, if any, is aborted — the later
    /// START always wins.
    pub fn on_start<P: PartitionPort>(
        &mut self,
        partition: &mut P,
        total_blocks: u16,
        firmware_size: u32,
        version: VersionField,
    ) -> Result<()> {
        if firmware_size == 0 || firmware_size > MAX_FIRMWARE_SIZE {
            return Err(OtaError::InvalidSize);
        }
        self.abort(partition);

        let handle = partition.open_write(firmware_size)?;
        self.session = Some(ReceivingSession {
            total_blocks,
            version,
            bitmap: ReceptionBitmap::new(1, total_blocks as usize),
            bytes_written: 0,
            last_block_ms: 0,
            handle,
        });
        info!("receiver: START accepted, {total_blocks} blocks, {firmware_size} bytes");
        Ok(())
    }

    /// `OTA_BLOCK`. Returns the ACK to send back to the root.
    pub fn on_block<P: PartitionPort, C: ClockPort>(
        &mut self,
        partition: &mut P,
        clock: &C,
        header: BlockHeader,
        payload: &[u8],
    ) -> Ack {
        let Some(session) = self.session.as_mut() else {
            return Ack::err(header.block_no);
        };

        if header.total_blocks != session.total_blocks {
            return Ack::err(header.block_no);
        }
        if header.block_no >= session.total_blocks {
            return Ack::err(header.block_no);
        }
        if session.bitmap.get(0, header.block_no as usize) {
            // Idempotent replay of an already-acked block.
            return Ack::ok(header.block_no);
        }
        if payload.len() != header.block_size as usize {
            return Ack::err(header.block_no);
        }
        if crc::checksum(payload) != header.crc32 {
            return Ack::err(header.block_no);
        }

        if let Err(e) = partition.write(session.handle, payload) {
            warn!("receiver: write failed for block {}: {e}", header.block_no);
            if matches!(e, OtaError::InvalidSize | OtaError::Fatal) {
                self.abort(partition);
            }
            return Ack::err(header.block_no);
        }

        session.bitmap.set(0, header.block_no as usize);
        session.bytes_written += payload.len() as u32;
        session.last_block_ms = clock.now_ms();
        let total_blocks = session.total_blocks;
        let handle = session.handle;

        let ack = Ack::ok(header.block_no);

        if session.bitmap.row_full(0, total_blocks as usize) {
            match partition.finish(handle) {
                Ok(()) => match partition.validate_state(PartitionSlot::Inactive) {
                    Ok(PartitionValidity::Valid) => {
                        let version = session.version;
                        self.session = None;
                        self.complete_version = Some(version);
                        info!("receiver: image complete and valid");
                    }
                    _ => {
                        warn!("receiver: finalised image failed validation");
                        self.session = None;
                    }
                },
                Err(e) => {
                    warn!("receiver: finish failed: {e}");
                    self.session = None;
                }
            }
        }

        ack
    }

    /// Inactivity watchdog: call opportunistically (e.g. on every inbound
    /// frame, or from a dedicated timer). Aborts a stalled reception.
    pub fn check_inactivity<P: PartitionPort, C: ClockPort>(&mut self, partition: &mut P, clock: &C) {
        let Some(session) = &self.session else {
            return;
        };
        let elapsed = clock.now_ms().saturating_sub(session.last_block_ms);
        if elapsed > LEAF_BLOCK_TIMEOUT_MS as u64 {
            warn!("receiver: inactivity timeout, aborting reception");
            self.abort(partition);
        }
    }

    /// `OTA_PREPARE_REBOOT`: report readiness without committing anything.
    pub fn on_prepare_reboot<P: PartitionPort>(&self, partition: &P) -> Ack {
        if self.complete_version.is_none() {
            return Ack::err(0);
        }
        match partition.validate_state(PartitionSlot::Inactive) {
            Ok(PartitionValidity::Valid) => Ack::ok(0),
            _ => Ack::err(0),
        }
    }

    /// `OTA_REBOOT`: commit the new partition as the boot target and arm
    /// rollback. Returns an error ACK (without side effects beyond what
    /// is documented) on downgrade or a boot-target verification failure.
    pub fn on_reboot<P: PartitionPort, K: KvStorePort>(
        &mut self,
        partition: &mut P,
        kv: &mut K,
        running_version: &str,
    ) -> Result<()> {
        if self.complete_version.is_none() {
            return Err(OtaError::InvalidState);
        }

        version_gate::check(partition, PartitionSlot::Inactive, running_version)?;

        rollback::arm(kv)?;

        partition.set_boot(PartitionSlot::Inactive)?;
        let target = partition.boot_target()?;
        if target != PartitionSlot::Inactive {
            return Err(OtaError::Fatal);
        }

        info!("receiver: committed reboot into inactive partition");
        Ok(())
    }

    /// Resolve the ACK destination for a reply: the mesh parent if
    /// reachable, else broadcast. Documented contract, not an accident.
    pub fn ack_destination<T: MeshTransportPort>(transport: &T) -> MacAddr {
        transport.parent_address().unwrap_or(MacAddr::BROADCAST)
    }

    /// Mesh disconnection: discard any partial image.
    pub fn on_disconnect<P: PartitionPort>(&mut self, partition: &mut P) {
        if self.session.is_some() {
            self.abort(partition);
        }
    }

    fn abort<P: PartitionPort>(&mut self, partition: &mut P) {
        if let Some(session) = self.session.take() {
            partition.abort(session.handle);
        }
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}
