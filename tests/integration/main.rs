//! End-to-end exercise of the mesh OTA facade across real OS threads: one
//! root plus two leaves, talking over the in-process mesh simulation, each
//! side running its own `OtaService` the way `src/main.rs` structures a
//! real device — a receive loop dispatching inbound frames, and (root only)
//! a second thread driving the blocking download/distribute/reboot
//! sequence. `distribute`/`initiate_reboot` block on acks that only the
//! receive-loop thread can supply, so this is also the test that would
//! hang forever if that concurrency split were ever broken.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mesh_ota::adapters::mesh::sim::SimMeshFabric;
use mesh_ota::adapters::nvs::NvsAdapter;
use mesh_ota::adapters::partition::SimPartitionAdapter;
use mesh_ota::config::BLOCK_SIZE;
use mesh_ota::distributor::SessionStatus;
use mesh_ota::ports::MacAddr;
use mesh_ota::router::Role;
use mesh_ota::service::OtaService;

struct WallClock {
    start: Instant,
}

impl WallClock {
    fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl mesh_ota::ports::ClockPort for WallClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

/// Poll interval for the test's receive loops. Real mesh recv blocks; the
/// simulation's is non-blocking, so loops poll-and-backoff instead.
const POLL_BACKOFF: Duration = Duration::from_millis(2);

#[test]
fn root_distributes_and_reboots_a_two_leaf_mesh() {
    let fabric = SimMeshFabric::new();
    let root_addr = MacAddr([1, 0, 0, 0, 0, 0]);
    let leaf_addrs = [MacAddr([2, 0, 0, 0, 0, 0]), MacAddr([2, 0, 0, 0, 0, 1])];

    // Register every mailbox up front, before any thread starts sending.
    let mut distribute_transport = fabric.handle(root_addr, true, None);
    distribute_transport.set_routing_table(leaf_addrs.to_vec());
    let recv_transport = fabric.handle(root_addr, true, None);
    let leaf_transports: Vec<_> = leaf_addrs
        .iter()
        .map(|&addr| fabric.handle(addr, false, Some(root_addr)))
        .collect();

    let root_service = OtaService::new("1.0.0");
    let mut root_partition = SimPartitionAdapter::new("1.0.0");
    root_partition.stage_inactive("1.1.0", vec![0xABu8; 2 * BLOCK_SIZE]);
    let mut root_kv = NvsAdapter::new().expect("nvs init");
    let root_clock = WallClock::new();

    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let root_service_ref = &root_service;
        let stop_ref = &stop;
        scope.spawn(move || {
            let mut transport = recv_transport;
            while !stop_ref.load(Ordering::Relaxed) {
                match transport.recv() {
                    Some((from, bytes)) => {
                        root_service_ref.dispatch_root_frame(from, &bytes).unwrap();
                    }
                    None => std::thread::sleep(POLL_BACKOFF),
                }
            }
        });

        for mut transport in leaf_transports {
            let stop_ref = &stop;
            scope.spawn(move || {
                let mut service = OtaService::new("1.0.0");
                let mut partition = SimPartitionAdapter::new("1.0.0");
                let mut kv = NvsAdapter::new().expect("nvs init");
                let clock = WallClock::new();
                while !stop_ref.load(Ordering::Relaxed) {
                    match transport.recv() {
                        Some((from, bytes)) => {
                            service
                                .dispatch_frame(Role::Leaf, from, &bytes, &mut partition, &mut transport, &mut kv, &clock)
                                .unwrap();
                        }
                        None => std::thread::sleep(POLL_BACKOFF),
                    }
                    service.tick(&mut partition, &clock);
                }
            });
        }

        root_service
            .start_distribution(&root_partition, &mut distribute_transport, &root_clock, |_| {})
            .expect("distribution should complete");
        assert_eq!(root_service.distribution().status(), SessionStatus::Complete);
        assert_eq!(root_service.distribution().nodes_complete(), leaf_addrs.len());

        root_service
            .initiate_reboot(&mut root_partition, &mut distribute_transport, &mut root_kv, &root_clock, 5, 5)
            .expect("reboot coordination should complete");

        stop.store(true, Ordering::Relaxed);
    });

    assert!(root_partition.was_restarted());
}
