//! Reboot Coordinator (component E) — root side.
//!
//! Two-phase handshake: PREPARE_REBOOT broadcast, wait for every node to
//! ack readiness, then commit by arming rollback and broadcasting REBOOT.
//! Shares the distributor's concurrency shape — `on_ack` can arrive from
//! the router while `initiate` is mid-wait — so state lives behind a
//! mutex and a wake signal rather than behind `&mut self`.

use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};

use crate::bitmap::ReceptionBitmap;
use crate::distributor::{DistributionSession, SessionStatus};
use crate::error::{OtaError, Result};
use crate::ports::{ClockPort, KvStorePort, MacAddr, MeshTransportPort, PartitionPort, PartitionSlot};
use crate::rollback;
use crate::signal::WakeSignal;
use crate::wire::{self, Ack, PrepareReboot, Reboot};

struct CoordData {
    coordinating: bool,
    nodes: Vec<MacAddr>,
    ready: Option<ReceptionBitmap>,
}

pub struct RebootCoordinator {
    data: Mutex<CoordData>,
    ready_signal: WakeSignal,
}

impl RebootCoordinator {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(CoordData {
                coordinating: false,
                nodes: Vec::new(),
                ready: None,
            }),
            ready_signal: WakeSignal::new(),
        }
    }

    pub fn is_coordinating(&self) -> bool {
        self.data.lock().unwrap().coordinating
    }

    pub fn nodes_ready(&self) -> usize {
        let data = self.data.lock().unwrap();
        data.ready.as_ref().map(|b| b.nodes_complete()).unwrap_or(0)
    }

    /// Handle an inbound `OTA_ACK` while `coordinating`. Ignored outside
    /// that window, ignored for unknown senders, and idempotent for
    /// repeat acks from the same node.
    pub fn on_ack(&self, from: MacAddr, ack: Ack) {
        let mut data = self.data.lock().unwrap();
        if !data.coordinating {
            return;
        }
        let Some(node_index) = data.nodes.iter().position(|&n| n == from) else {
            return;
        };
        if !ack.is_ok() {
            warn!("reboot: node {node_index} reported not-ready");
            return;
        }
        let already_ready = data.ready.as_ref().map(|b| b.get(node_index, 0)).unwrap_or(false);
        if let Some(ready) = data.ready.as_mut() {
            ready.set(node_index, 0);
        }
        drop(data);
        if !already_ready {
            self.ready_signal.raise();
        }
    }

    /// Run the full two-phase handshake to completion. Root-only.
    ///
    /// Preconditions: root role, no distribution in progress, the given
    /// `distribution` session's target nodes are non-empty and every one
    /// of them has completed reception. Any failure here has no side
    /// effects.
    pub fn initiate<P, T, K, C>(
        &self,
        distribution: &DistributionSession,
        partition: &mut P,
        transport: &mut T,
        kv: &mut K,
        clock: &C,
        timeout_seconds: u16,
        reboot_delay_ms: u16,
    ) -> Result<()>
    where
        P: PartitionPort,
        T: MeshTransportPort,
        K: KvStorePort,
        C: ClockPort,
    {
        if !transport.is_root() {
            return Err(OtaError::InvalidState);
        }
        if self.is_coordinating() {
            return Err(OtaError::InvalidState);
        }
        if distribution.status() == SessionStatus::Running {
            return Err(OtaError::InvalidState);
        }
        let nodes = distribution.nodes();
        if nodes.is_empty() {
            return Err(OtaError::NotFound);
        }
        if distribution.nodes_complete() != nodes.len() {
            return Err(OtaError::InvalidState);
        }

        let descriptor = partition.read_descriptor(PartitionSlot::Inactive)?;

        {
            let mut data = self.data.lock().unwrap();
            data.ready = Some(ReceptionBitmap::new(nodes.len(), 1));
            data.nodes = nodes.clone();
            data.coordinating = true;
        }
        self.ready_signal.clear();

        let mut frame = [0u8; PrepareReboot::WIRE_LEN];
        PrepareReboot {
            timeout_seconds,
            version: descriptor.version,
        }
        .encode(&mut frame)?;
        for &addr in &nodes {
            if let Err(e) = transport.send(addr, &frame) {
                warn!("reboot: PREPARE_REBOOT send to node failed: {e}");
            }
        }
        info!("reboot: prepare phase started, {} node(s)", nodes.len());

        let wait_result = self.wait_for_ready(clock, nodes.len(), timeout_seconds);
        if wait_result.is_err() {
            self.teardown();
            return wait_result;
        }

        self.commit(partition, transport, kv, clock, &nodes, reboot_delay_ms)
    }

    fn wait_for_ready<C: ClockPort>(&self, clock: &C, nodes_total: usize, timeout_seconds: u16) -> Result<()> {
        let deadline = clock.now_ms() + timeout_seconds as u64 * 1000;
        loop {
            if self.nodes_ready() >= nodes_total {
                return Ok(());
            }
            let now = clock.now_ms();
            if now >= deadline {
                warn!("reboot: prepare phase timed out");
                return Err(OtaError::Timeout);
            }
            self.ready_signal.wait_timeout(Duration::from_millis(deadline - now));
        }
    }

    fn commit<P, T, K, C>(
        &self,
        partition: &mut P,
        transport: &mut T,
        kv: &mut K,
        clock: &C,
        nodes: &[MacAddr],
        reboot_delay_ms: u16,
    ) -> Result<()>
    where
        P: PartitionPort,
        T: MeshTransportPort,
        K: KvStorePort,
        C: ClockPort,
    {
        rollback::arm(kv)?;

        let running = partition.identity(PartitionSlot::Running)?;
        let inactive = partition.identity(PartitionSlot::Inactive)?;
        if running.0 == inactive.0 {
            warn!("reboot: boot partition does not differ from inactive, aborting commit");
            self.teardown();
            return Err(OtaError::InvalidState);
        }

        let mut frame = [0u8; Reboot::WIRE_LEN];
        Reboot {
            delay_ms: reboot_delay_ms,
        }
        .encode(&mut frame)?;
        for &addr in nodes {
            if let Err(e) = transport.send(addr, &frame) {
                warn!("reboot: REBOOT send to node failed: {e}");
            }
        }
        self.teardown();

        partition.set_boot(PartitionSlot::Inactive)?;
        let target = partition.boot_target()?;
        if target != PartitionSlot::Inactive {
            return Err(OtaError::Fatal);
        }

        info!("reboot: committing, restarting in {reboot_delay_ms}ms");
        clock.sleep_ms(reboot_delay_ms as u32);
        partition.restart();
        Ok(())
    }

    fn teardown(&self) {
        let mut data = self.data.lock().unwrap();
        data.coordinating = false;
        data.ready = None;
        data.nodes.clear();
    }
}

impl Default for RebootCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PartitionDescriptor, PartitionValidity, WriteHandle};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    struct MockClock {
        now: Cell<u64>,
    }
    impl ClockPort for MockClock {
        fn now_ms(&self) -> u64 {
            self.now.get()
        }
        fn sleep_ms(&self, ms: u32) {
            self.now.set(self.now.get() + ms as u64);
        }
    }

    struct MockPartition {
        boot: PartitionSlot,
        restarted: bool,
        same_address: bool,
    }
    impl MockPartition {
        fn new() -> Self {
            Self {
                boot: PartitionSlot::Running,
                restarted: false,
                same_address: false,
            }
        }
    }
    impl PartitionPort for MockPartition {
        fn identity(&self, slot: PartitionSlot) -> Result<(u32, u32)> {
            if self.same_address {
                Ok((0x1000, 0x1000))
            } else {
                match slot {
                    PartitionSlot::Running => Ok((0x1000, 0x1000)),
                    PartitionSlot::Inactive => Ok((0x2000, 0x1000)),
                }
            }
        }
        fn read(&self, _slot: PartitionSlot, _offset: u32, _buf: &mut [u8]) -> Result<()> {
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
        fn set_boot(&mut self, slot: PartitionSlot) -> Result<()> {
            self.boot = slot;
            Ok(())
        }
        fn boot_target(&self) -> Result<PartitionSlot> {
            Ok(self.boot)
        }
        fn validate_state(&self, _slot: PartitionSlot) -> Result<PartitionValidity> {
            Ok(PartitionValidity::Valid)
        }
        fn read_descriptor(&self, _slot: PartitionSlot) -> Result<PartitionDescriptor> {
            Ok(PartitionDescriptor {
                version: crate::wire::encode_version("1.4.0"),
                image_len: 10,
            })
        }
        fn restart(&mut self) {
            self.restarted = true;
        }
    }

    struct MockKv {
        values: HashMap<(String, String), u8>,
    }
    impl MockKv {
        fn new() -> Self {
            Self {
                values: HashMap::new(),
            }
        }
    }
    impl KvStorePort for MockKv {
        fn get_u8(&self, ns: &str, key: &str) -> Result<Option<u8>> {
            Ok(self.values.get(&(ns.to_string(), key.to_string())).copied())
        }
        fn set_u8(&mut self, ns: &str, key: &str, value: u8) -> Result<()> {
            self.values.insert((ns.to_string(), key.to_string()), value);
            Ok(())
        }
        fn erase_key(&mut self, ns: &str, key: &str) -> Result<()> {
            self.values.remove(&(ns.to_string(), key.to_string()));
            Ok(())
        }
        fn commit(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn node(n: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, n])
    }

    /// Acks every `PREPARE_REBOOT` synchronously from inside `send`,
    /// standing in for leaves that reply immediately, except nodes listed
    /// in `silent` which never reply.
    struct MockTransport<'a> {
        nodes: Vec<MacAddr>,
        silent: RefCell<Vec<MacAddr>>,
        coordinator: &'a RebootCoordinator,
        reboots_seen: RefCell<Vec<MacAddr>>,
    }
    impl MeshTransportPort for MockTransport<'_> {
        fn is_root(&self) -> bool {
            true
        }
        fn routing_table(&self) -> Vec<MacAddr> {
            self.nodes.clone()
        }
        fn send(&mut self, to: MacAddr, bytes: &[u8]) -> Result<()> {
            match wire::Cmd::from_byte(bytes[0]) {
                Some(wire::Cmd::OtaPrepareReboot) => {
                    if !self.silent.borrow().contains(&to) {
                        self.coordinator.on_ack(to, Ack::ok(0));
                    }
                }
                Some(wire::Cmd::OtaReboot) => {
                    self.reboots_seen.borrow_mut().push(to);
                }
                _ => {}
            }
            Ok(())
        }
        fn parent_address(&self) -> Option<MacAddr> {
            None
        }
    }

    fn fully_complete_session(nodes: &[MacAddr]) -> DistributionSession {
        let ready: Vec<usize> = (0..nodes.len()).collect();
        DistributionSession::test_with_session(SessionStatus::Complete, nodes.to_vec(), &ready)
    }

    #[test]
    fn happy_path_commits_and_restarts() {
        let nodes = vec![node(1), node(2)];
        let distribution = fully_complete_session(&nodes);
        let coordinator = RebootCoordinator::new();
        let mut partition = MockPartition::new();
        let mut kv = MockKv::new();
        let clock = MockClock { now: Cell::new(0) };
        let mut transport = MockTransport {
            nodes: nodes.clone(),
            silent: RefCell::new(Vec::new()),
            coordinator: &coordinator,
            reboots_seen: RefCell::new(Vec::new()),
        };

        coordinator
            .initiate(&distribution, &mut partition, &mut transport, &mut kv, &clock, 30, 500)
            .unwrap();

        assert!(partition.restarted);
        assert_eq!(partition.boot_target().unwrap(), PartitionSlot::Inactive);
        assert_eq!(transport.reboots_seen.borrow().len(), 2);
        assert!(!coordinator.is_coordinating());
        assert_eq!(
            kv.get_u8(rollback::NAMESPACE, rollback::KEY_ARMED).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn rejects_when_not_all_nodes_complete() {
        let nodes = vec![node(1), node(2)];
        let distribution = DistributionSession::test_with_session(SessionStatus::Complete, nodes.clone(), &[]);
        let coordinator = RebootCoordinator::new();
        let mut partition = MockPartition::new();
        let mut kv = MockKv::new();
        let clock = MockClock { now: Cell::new(0) };
        let mut transport = MockTransport {
            nodes: nodes.clone(),
            silent: RefCell::new(Vec::new()),
            coordinator: &coordinator,
            reboots_seen: RefCell::new(Vec::new()),
        };

        let err = coordinator
            .initiate(&distribution, &mut partition, &mut transport, &mut kv, &clock, 30, 500)
            .unwrap_err();
        assert_eq!(err, OtaError::InvalidState);
    }

    #[test]
    fn times_out_when_a_node_never_acks() {
        let nodes = vec![node(1), node(2)];
        let distribution = fully_complete_session(&nodes);
        let coordinator = RebootCoordinator::new();
        let mut partition = MockPartition::new();
        let mut kv = MockKv::new();
        let clock = MockClock { now: Cell::new(0) };
        let mut transport = MockTransport {
            nodes: nodes.clone(),
            silent: RefCell::new(vec![node(2)]),
            coordinator: &coordinator,
            reboots_seen: RefCell::new(Vec::new()),
        };

        // Zero-second window: the deadline has already passed on the first
        // check, so this resolves without blocking the test thread.
        let err = coordinator
            .initiate(&distribution, &mut partition, &mut transport, &mut kv, &clock, 0, 500)
            .unwrap_err();
        assert_eq!(err, OtaError::Timeout);
        assert!(!coordinator.is_coordinating());
    }

    #[test]
    fn rejects_identical_boot_and_inactive_address() {
        let nodes = vec![node(1)];
        let distribution = fully_complete_session(&nodes);
        let coordinator = RebootCoordinator::new();
        let mut partition = MockPartition::new();
        partition.same_address = true;
        let mut kv = MockKv::new();
        let clock = MockClock { now: Cell::new(0) };
        let mut transport = MockTransport {
            nodes: nodes.clone(),
            silent: RefCell::new(Vec::new()),
            coordinator: &coordinator,
            reboots_seen: RefCell::new(Vec::new()),
        };

        let err = coordinator
            .initiate(&distribution, &mut partition, &mut transport, &mut kv, &clock, 30, 500)
            .unwrap_err();
        assert_eq!(err, OtaError::InvalidState);
        assert!(transport.reboots_seen.borrow().is_empty());
        assert!(!partition.restarted);
    }

    #[test]
    fn rejects_empty_node_list() {
        let distribution = DistributionSession::new();
        let coordinator = RebootCoordinator::new();
        let mut partition = MockPartition::new();
        let mut kv = MockKv::new();
        let clock = MockClock { now: Cell::new(0) };
        let mut transport = MockTransport {
            nodes: vec![],
            silent: RefCell::new(Vec::new()),
            coordinator: &coordinator,
            reboots_seen: RefCell::new(Vec::new()),
        };

        let err = coordinator
            .initiate(&distribution, &mut partition, &mut transport, &mut kv, &clock, 30, 500)
            .unwrap_err();
        assert_eq!(err, OtaError::NotFound);
    }

    #[test]
    fn duplicate_acks_do_not_overcount_readiness() {
        let nodes = vec![node(1)];
        let coordinator = RebootCoordinator::new();
        {
            let mut data = coordinator.data.lock().unwrap();
            data.coordinating = true;
            data.nodes = nodes.clone();
            data.ready = Some(ReceptionBitmap::new(1, 1));
        }
        coordinator.on_ack(node(1), Ack::ok(0));
        coordinator.on_ack(node(1), Ack::ok(0));
        assert_eq!(coordinator.nodes_ready(), 1);
    }
}
