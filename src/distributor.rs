//! Distributor (component C) — root side.
//!
//! Chunks the inactive partition and pushes it block by block to every
//! mesh leaf, tracking per-node per-block acknowledgement in a
//! [`ReceptionBitmap`]. A single distribution session exists at a time;
//! per-node failures are not fatal — the session completes with some
//! nodes marked failed rather than aborting the whole fleet.
//!
//! State lives behind a mutex rather than `&mut self`: the distribution
//! loop and the router's `on_ack` both need to reach the bitmap
//! concurrently (the loop while scheduling sends, the router while
//! recording an inbound ACK), synchronised through the wake signal rather
//! than a borrow the compiler can check.

use log::{info, warn};
use std::sync::Mutex;
use std::time::Duration;

use crate::bitmap::ReceptionBitmap;
use crate::config::{
    ACK_TIMEOUT_MS, BLOCK_RETRY_BACKOFF_MS, BLOCK_SIZE, MAX_BLOCKS, MAX_RETRIES_PER_BLOCK,
};
use crate::crc;
use crate::error::{OtaError, Result};
use crate::ports::{ClockPort, MacAddr, MeshTransportPort, PartitionPort, PartitionSlot};
use crate::signal::WakeSignal;
use crate::version_gate;
use crate::wire::{self, BlockHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Cancelling,
    Complete,
    Failed,
}

struct SessionData {
    status: SessionStatus,
    nodes: Vec<MacAddr>,
    total_blocks: u16,
    firmware_size: u32,
    bitmap: Option<ReceptionBitmap>,
}

pub struct DistributionSession {
    data: Mutex<SessionData>,
    ack_signal: WakeSignal,
}

impl DistributionSession {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(SessionData {
                status: SessionStatus::Idle,
                nodes: Vec::new(),
                total_blocks: 0,
                firmware_size: 0,
                bitmap: None,
            }),
            ack_signal: WakeSignal::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.data.lock().unwrap().status
    }

    pub fn nodes_complete(&self) -> usize {
        let data = self.data.lock().unwrap();
        data.bitmap.as_ref().map(|b| b.nodes_complete()).unwrap_or(0)
    }

    pub fn nodes_failed(&self) -> usize {
        let data = self.data.lock().unwrap();
        let complete = data.bitmap.as_ref().map(|b| b.nodes_complete()).unwrap_or(0);
        data.nodes.len().saturating_sub(complete)
    }

    /// Target list of the most recent (or in-progress) session. Consumed
    /// by the reboot coordinator to know who to address without repeating
    /// the routing-table lookup.
    pub fn nodes(&self) -> Vec<MacAddr> {
        self.data.lock().unwrap().nodes.clone()
    }

    /// Handle an inbound `OTA_ACK` while a session is running. Unknown
    /// senders or malformed fields are dropped silently.
    pub fn on_ack(&self, from: MacAddr, ack: wire::Ack) {
        let mut data = self.data.lock().unwrap();
        if data.status != SessionStatus::Running {
            return;
        }
        let total_blocks = data.total_blocks;
        let Some(node_index) = data.nodes.iter().position(|&n| n == from) else {
            return;
        };
        if !ack.is_ok() || ack.block_no as usize >= total_blocks as usize {
            return;
        }
        if let Some(bitmap) = data.bitmap.as_mut() {
            bitmap.set(node_index, ack.block_no as usize);
        }
        drop(data);
        self.ack_signal.raise();
    }

    pub fn cancel(&self) {
        let mut data = self.data.lock().unwrap();
        if data.status == SessionStatus::Running {
            data.status = SessionStatus::Cancelling;
        }
    }

    /// Run a full distribution session to completion. Root-only.
    pub fn distribute<P, T, C>(
        &self,
        partition: &P,
        transport: &mut T,
        clock: &C,
        running_version: &str,
        mut on_progress: impl FnMut(f32),
    ) -> Result<()>
    where
        P: PartitionPort,
        T: MeshTransportPort,
        C: ClockPort,
    {
        {
            let data = self.data.lock().unwrap();
            if data.status == SessionStatus::Running {
                return Err(OtaError::InvalidState);
            }
        }
        if !transport.is_root() {
            return Err(OtaError::InvalidState);
        }

        version_gate::check(partition, PartitionSlot::Inactive, running_version)?;

        let nodes = transport.routing_table();
        if nodes.is_empty() {
            return Err(OtaError::NotFound);
        }

        let descriptor = partition.read_descriptor(PartitionSlot::Inactive)?;
        let firmware_size = descriptor.image_len;
        if firmware_size == 0 {
            return Err(OtaError::InvalidSize);
        }
        let total_blocks = firmware_size.div_ceil(BLOCK_SIZE as u32);
        if total_blocks as usize > MAX_BLOCKS {
            return Err(OtaError::InvalidSize);
        }

        {
            let mut data = self.data.lock().unwrap();
            data.nodes = nodes;
            data.total_blocks = total_blocks as u16;
            data.firmware_size = firmware_size;
            data.bitmap = Some(ReceptionBitmap::new(data.nodes.len(), total_blocks as usize));
            data.status = SessionStatus::Running;
        }
        self.ack_signal.clear();

        info!(
            "distributor: starting session, {} nodes, {} blocks",
            self.data.lock().unwrap().nodes.len(),
            total_blocks
        );

        let result = self.run_loop(partition, transport, clock, &mut on_progress);

        let mut data = self.data.lock().unwrap();
        match &result {
            Ok(()) => {
                data.status = SessionStatus::Complete;
            }
            Err(_) => data.status = SessionStatus::Failed,
        }
        drop(data);
        info!(
            "distributor: session ended, {} nodes complete, {} failed",
            self.nodes_complete(),
            self.nodes_failed()
        );
        result
    }

    fn run_loop<P, T, C>(
        &self,
        partition: &P,
        transport: &mut T,
        clock: &C,
        on_progress: &mut impl FnMut(f32),
    ) -> Result<()>
    where
        P: PartitionPort,
        T: MeshTransportPort,
        C: ClockPort,
    {
        let mut scratch = vec![0u8; BLOCK_SIZE];
        let (total_blocks, firmware_size) = {
            let data = self.data.lock().unwrap();
            (data.total_blocks, data.firmware_size)
        };

        for block_no in 0..total_blocks {
            if self.status() == SessionStatus::Cancelling {
                break;
            }

            let block_size = block_size_for(block_no, total_blocks, firmware_size);
            let offset = block_no as u32 * BLOCK_SIZE as u32;
            if partition
                .read(PartitionSlot::Inactive, offset, &mut scratch[..block_size])
                .is_err()
            {
                return Err(OtaError::Fatal);
            }

            let payload = &scratch[..block_size];
            let checksum = crc::checksum(payload);
            let header = BlockHeader {
                block_no,
                total_blocks,
                block_size: block_size as u16,
                crc32: checksum,
            };

            self.send_block_with_retry(&header, payload, transport, clock)?;

            on_progress(((block_no + 1) as f32 / total_blocks.max(1) as f32).min(1.0));

            if self.status() == SessionStatus::Cancelling {
                break;
            }
        }

        Ok(())
    }

    fn send_block_with_retry<T, C>(
        &self,
        header: &BlockHeader,
        payload: &[u8],
        transport: &mut T,
        clock: &C,
    ) -> Result<()>
    where
        T: MeshTransportPort,
        C: ClockPort,
    {
        let mut frame = vec![0u8; BlockHeader::WIRE_LEN + payload.len()];

        for attempt in 0..=MAX_RETRIES_PER_BLOCK {
            self.ack_signal.clear();

            let (nodes, pending) = {
                let data = self.data.lock().unwrap();
                let bitmap = data.bitmap.as_ref().unwrap();
                let pending: Vec<usize> = (0..data.nodes.len())
                    .filter(|&n| !bitmap.get(n, header.block_no as usize))
                    .collect();
                (data.nodes.clone(), pending)
            };

            if pending.is_empty() {
                return Ok(());
            }

            wire::encode_block(header, payload, &mut frame)?;
            for &node_index in &pending {
                let addr = nodes[node_index];
                if let Err(e) = transport.send(addr, &frame) {
                    warn!("distributor: send to node {node_index} failed: {e}");
                }
            }

            self.ack_signal
                .wait_timeout(Duration::from_millis(ACK_TIMEOUT_MS as u64));

            let all_acked = {
                let data = self.data.lock().unwrap();
                let bitmap = data.bitmap.as_ref().unwrap();
                (0..data.nodes.len()).all(|n| bitmap.get(n, header.block_no as usize))
            };
            if all_acked {
                return Ok(());
            }

            if attempt < MAX_RETRIES_PER_BLOCK {
                clock.sleep_ms(BLOCK_RETRY_BACKOFF_MS);
            }
        }

        warn!(
            "distributor: block {} not universally acked after retries",
            header.block_no
        );
        Ok(())
    }

    /// Construct a session already in a given terminal state, with the
    /// given nodes marked ready at block 0. Used by the reboot
    /// coordinator's tests to exercise its "all nodes complete"
    /// precondition without running a full distribution first.
    #[cfg(test)]
    pub(crate) fn test_with_session(status: SessionStatus, nodes: Vec<MacAddr>, ready: &[usize]) -> Self {
        let mut bitmap = ReceptionBitmap::new(nodes.len(), 1);
        for &i in ready {
            bitmap.set(i, 0);
        }
        Self {
            data: Mutex::new(SessionData {
                status,
                nodes,
                total_blocks: 1,
                firmware_size: 0,
                bitmap: Some(bitmap),
            }),
            ack_signal: WakeSignal::new(),
        }
    }

    /// Tear down session resources; returns to `Idle`.
    pub fn teardown(&self) {
        let mut data = self.data.lock().unwrap();
        data.bitmap = None;
        data.nodes.clear();
        data.status = SessionStatus::Idle;
    }
}

impl Default for DistributionSession {
    fn default() -> Self {
        Self::new()
    }
}

fn block_size_for(block_no: u16, total_blocks: u16, firmware_size: u32) -> usize {
    if block_no as u32 + 1 == total_blocks as u32 {
        let remainder = firmware_size as usize % BLOCK_SIZE;
        if remainder == 0 {
            BLOCK_SIZE
        } else {
            remainder
        }
    } else {
        BLOCK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PartitionDescriptor, PartitionValidity, WriteHandle};
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MockClock;
    impl ClockPort for MockClock {
        fn now_ms(&self) -> u64 {
            0
        }
        fn sleep_ms(&self, _ms: u32) {}
    }

    struct MockPartition {
        data: Vec<u8>,
        version: String,
    }

    impl PartitionPort for MockPartition {
        fn identity(&self, _slot: PartitionSlot) -> Result<(u32, u32)> {
            Ok((0, self.data.len() as u32))
        }
        fn read(&self, _slot: PartitionSlot, offset: u32, buf: &mut [u8]) -> Result<()> {
            let start = offset as usize;
            let end = (start + buf.len()).min(self.data.len());
            buf[..end - start].copy_from_slice(&self.data[start..end]);
            Ok(())
        }
        fn open_write(&mut self, _size: u32) -> Result<WriteHandle> {
            Ok(WriteHandle(0))
        }
        fn write(&mut self, _h: WriteHandle, _buf: &[u8]) -> Result<()> {
            Ok(())
        }
        fn finish(&mut self, _h: WriteHandle) -> Result<()> {
            Ok(())
        }
        fn abort(&mut self, _h: WriteHandle) {}
        fn set_boot(&mut self, _slot: PartitionSlot) -> Result<()> {
            Ok(())
        }
        fn boot_target(&self) -> Result<PartitionSlot> {
            Ok(PartitionSlot::Running)
        }
        fn validate_state(&self, _slot: PartitionSlot) -> Result<PartitionValidity> {
            Ok(PartitionValidity::Valid)
        }
        fn read_descriptor(&self, _slot: PartitionSlot) -> Result<PartitionDescriptor> {
            Ok(PartitionDescriptor {
                version: crate::wire::encode_version(&self.version),
                image_len: self.data.len() as u32,
            })
        }
        fn restart(&mut self) {}
    }

    /// Mesh transport stub: delivers the ACK synchronously from inside
    /// `send`, except for scripted one-shot drops, standing in for the
    /// router on a leaf that replies instantly.
    struct MockTransport<'a> {
        nodes: Vec<MacAddr>,
        drop_once: RefCell<HashMap<(usize, u16), u8>>,
        session: &'a DistributionSession,
    }

    impl MeshTransportPort for MockTransport<'_> {
        fn is_root(&self) -> bool {
            true
        }
        fn routing_table(&self) -> Vec<MacAddr> {
            self.nodes.clone()
        }
        fn send(&mut self, to: MacAddr, bytes: &[u8]) -> Result<()> {
            let header = BlockHeader::decode(bytes).unwrap();
            let node_index = self.nodes.iter().position(|&n| n == to).unwrap();
            let key = (node_index, header.block_no);
            let mut drops = self.drop_once.borrow_mut();
            if let Some(remaining) = drops.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(());
                }
            }
            self.session.on_ack(to, wire::Ack::ok(header.block_no));
            Ok(())
        }
        fn parent_address(&self) -> Option<MacAddr> {
            None
        }
    }

    fn node(n: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, n])
    }

    #[test]
    fn happy_path_two_nodes_three_blocks() {
        let partition = MockPartition {
            data: vec![0x42u8; 2560],
            version: "1.4.0".to_string(),
        };
        let session = DistributionSession::new();
        let mut transport = MockTransport {
            nodes: vec![node(1), node(2)],
            drop_once: RefCell::new(HashMap::new()),
            session: &session,
        };
        let clock = MockClock;
        let mut last_progress = 0.0;

        session
            .distribute(&partition, &mut transport, &clock, "1.3.0", |p| {
                last_progress = p;
            })
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Complete);
        assert_eq!(session.nodes_complete(), 2);
        assert_eq!(session.nodes_failed(), 0);
        assert_eq!(last_progress, 1.0);
    }

    #[test]
    fn block_retry_recovers_after_one_drop() {
        let partition = MockPartition {
            data: vec![0x11u8; 2048],
            version: "1.0.0".to_string(),
        };
        let session = DistributionSession::new();
        let mut drops = HashMap::new();
        drops.insert((1usize, 0u16), 1u8);
        drops.insert((1usize, 1u16), 1u8);
        let mut transport = MockTransport {
            nodes: vec![node(1), node(2)],
            drop_once: RefCell::new(drops),
            session: &session,
        };
        let clock = MockClock;

        session
            .distribute(&partition, &mut transport, &clock, "1.0.0", |_| {})
            .unwrap();

        assert_eq!(session.nodes_complete(), 2);
        assert_eq!(session.nodes_failed(), 0);
    }

    #[test]
    fn partial_completion_leaves_one_node_failed() {
        let partition = MockPartition {
            data: vec![0x77u8; 3 * BLOCK_SIZE],
            version: "1.0.0".to_string(),
        };
        let session = DistributionSession::new();
        let mut drops = HashMap::new();
        // node index 1 never acks block 2.
        drops.insert((1usize, 2u16), u8::MAX);
        let mut transport = MockTransport {
            nodes: vec![node(1), node(2)],
            drop_once: RefCell::new(drops),
            session: &session,
        };
        let clock = MockClock;

        session
            .distribute(&partition, &mut transport, &clock, "1.0.0", |_| {})
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Complete);
        assert_eq!(session.nodes_complete(), 1);
        assert_eq!(session.nodes_failed(), 1);
    }

    #[test]
    fn empty_routing_table_is_not_found() {
        let partition = MockPartition {
            data: vec![0u8; 100],
            version: "1.0.0".to_string(),
        };
        let session = DistributionSession::new();
        let mut transport = MockTransport {
            nodes: vec![],
            drop_once: RefCell::new(HashMap::new()),
            session: &session,
        };
        let clock = MockClock;
        assert_eq!(
            session
                .distribute(&partition, &mut transport, &clock, "1.0.0", |_| {})
                .unwrap_err(),
            OtaError::NotFound
        );
    }

    #[test]
    fn rejects_concurrent_session() {
        let session = DistributionSession::new();
        session.data.lock().unwrap().status = SessionStatus::Running;
        let partition = MockPartition {
            data: vec![0u8; 100],
            version: "1.0.0".to_string(),
        };
        let mut transport = MockTransport {
            nodes: vec![node(1)],
            drop_once: RefCell::new(HashMap::new()),
            session: &session,
        };
        let clock = MockClock;
        assert_eq!(
            session
                .distribute(&partition, &mut transport, &clock, "1.0.0", |_| {})
                .unwrap_err(),
            OtaError::InvalidState
        );
    }

    #[test]
    fn rejects_descriptor_image_len_over_max_blocks() {
        let partition = MockPartition {
            data: vec![0u8; (MAX_BLOCKS + 1) * BLOCK_SIZE],
            version: "1.0.0".to_string(),
        };
        let session = DistributionSession::new();
        let mut transport = MockTransport {
            nodes: vec![node(1)],
            drop_once: RefCell::new(HashMap::new()),
            session: &session,
        };
        let clock = MockClock;
        assert_eq!(
            session
                .distribute(&partition, &mut transport, &clock, "1.0.0", |_| {})
                .unwrap_err(),
            OtaError::InvalidSize
        );
    }
}
