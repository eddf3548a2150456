//! Mesh OTA Firmware — Main Entry Point
//!
//! Hexagonal architecture: the same binary image runs on the mesh root and
//! every leaf node, differing only in which branch below actually does
//! anything (`MeshTransportPort::is_root`).
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  Esp32PartitionAdapter  EspMeshAdapter  EspHttpAdapter         │
//! │  (PartitionPort)        (MeshTransportPort) (HttpClientPort)   │
//! │  NvsAdapter (KvStorePort)      Esp32TimeAdapter (ClockPort)    │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │               OtaService (pure logic)                  │    │
//! │  │  Downloader · Distributor · Receiver · RebootCoordinator│    │
//! │  │  · RollbackEngine · MessageRouter                       │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A root device is two threads-of-control sharing one [`OtaService`] by
//! shared reference: [`mesh_receive_loop`] feeds inbound ACKs into whichever
//! root session is waiting on them, while [`trigger_loop`] drives the
//! blocking download/distribute/reboot sequence on an operator trigger.
//! Neither thread ever needs `&mut OtaService`, since every root-only method
//! takes `&self` and pushes its mutable state behind the component's own
//! `Mutex`. A leaf never has two threads contending for the service, so it
//! keeps the simpler single-loop, `&mut OtaService` shape.
#![deny(unused_must_use)]

pub mod adapters;
pub mod bitmap;
pub mod config;
pub mod crc;
pub mod distributor;
pub mod downloader;
pub mod error;
pub mod ports;
pub mod reboot;
pub mod receiver;
pub mod rollback;
pub mod router;
pub mod service;
pub mod signal;
pub mod version_gate;
pub mod wire;

use anyhow::Result;
use log::{info, warn};

use adapters::http::EspHttpAdapter;
use adapters::mesh::EspMeshAdapter;
use adapters::nvs::NvsAdapter;
use adapters::partition::Esp32PartitionAdapter;
use adapters::time::Esp32TimeAdapter;
use config::VERSION_FIELD_LEN;
use error::OtaError;
use ports::ClockPort;
use router::Role;
use service::OtaService;

/// NVS key an upper-layer management surface (mesh command or HTTP handler,
/// neither of which is part of this crate) writes to trigger a root-side
/// update cycle. Cleared once consumed.
const TRIGGER_NAMESPACE: &str = "ota_trigger";
const TRIGGER_KEY_ARMED: &str = "armed";

/// How often the root polls for an operator-triggered update cycle.
const TRIGGER_POLL_MS: u32 = 5_000;

/// How long each receive loop waits for mesh traffic before looping again.
const RECV_POLL_TIMEOUT_MS: u32 = 250;

const RECV_BUF_LEN: usize = config::BLOCK_SIZE + wire::BlockHeader::WIRE_LEN + 1;

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  mesh-ota v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    let running_version = running_version_string();
    info!("running firmware version: {running_version}");

    // ── Boot-time rollback decision (component F) ─────────────
    {
        let mut boot_partition = Esp32PartitionAdapter::new();
        let boot_mesh = EspMeshAdapter::new();
        let boot_kv = match NvsAdapter::new() {
            Ok(kv) => kv,
            Err(e) => {
                warn!("NVS init failed ({e}), rollback bookkeeping degraded this boot");
                NvsAdapter::default()
            }
        };
        let boot_clock = Esp32TimeAdapter::new();
        match service::run_boot_rollback_check(&mut boot_partition, boot_mesh, boot_kv, boot_clock) {
            Ok(rollback::BootAction::SwapAndRestart) => {
                // `check_rollback` has already flipped the boot partition
                // and called `partition.restart()`; this arm is reached
                // only if the restart call returns, which should not happen
                // on real hardware.
                warn!("rollback: swap-and-restart requested but device did not reset");
            }
            Ok(action) => info!("rollback: boot action = {action:?}"),
            Err(e) => warn!("rollback: boot check failed ({e}), proceeding as normal boot"),
        }
    }

    let role = if EspMeshAdapter::new().is_root() { Role::Root } else { Role::Leaf };
    info!("mesh role: {role:?}");

    let mut service = OtaService::new(running_version);

    match role {
        Role::Root => {
            info!("entering root event loop (receive thread + trigger thread)");
            let svc = &service;
            std::thread::scope(|scope| {
                scope.spawn(move || mesh_receive_loop(svc));
                scope.spawn(move || trigger_loop(svc));
            });
        }
        Role::Leaf => {
            info!("entering leaf event loop");
            run_leaf(&mut service);
        }
    }

    Ok(())
}

/// Root-side mesh receive loop. Everything a root ever routes frames to is
/// [`Route::Distributor`](router::Route::Distributor), so this never needs
/// `partition`/`kv`/a reply transport — only [`OtaService::dispatch_root_frame`].
fn mesh_receive_loop(service: &OtaService) {
    let mut mesh = EspMeshAdapter::new();
    let mut recv_buf = [0u8; RECV_BUF_LEN];
    loop {
        match mesh.recv(&mut recv_buf, RECV_POLL_TIMEOUT_MS) {
            Ok((from, len)) => {
                if let Err(e) = service.dispatch_root_frame(from, &recv_buf[..len]) {
                    warn!("dispatch from {:02x?} failed: {e}", from.0);
                }
            }
            Err(OtaError::Timeout) => {}
            Err(e) => warn!("mesh recv error: {e}"),
        }
    }
}

/// Root-side operator-trigger loop: polls NVS for an armed update cycle and,
/// when one is staged, runs download → distribute → reboot end to end. Owns
/// its own adapter instances so it never contends with the receive thread,
/// which touches none of them.
fn trigger_loop(service: &OtaService) {
    let mut partition = Esp32PartitionAdapter::new();
    let mut mesh = EspMeshAdapter::new();
    let mut http = EspHttpAdapter::new();
    let mut nvs = match NvsAdapter::new() {
        Ok(n) => n,
        Err(e) => {
            warn!("NVS init failed ({e}), running with defaults and no persistence");
            NvsAdapter::default()
        }
    };
    let clock = Esp32TimeAdapter::new();

    loop {
        poll_update_trigger(service, &mut partition, &mut mesh, &mut http, &mut nvs, &clock);
        clock.sleep_ms(TRIGGER_POLL_MS);
    }
}

/// Leaf-side single-threaded loop: one thread ever touches this device's
/// `OtaService`, so it keeps the simpler `&mut self` shape.
fn run_leaf(service: &mut OtaService) {
    let mut partition = Esp32PartitionAdapter::new();
    let mut mesh = EspMeshAdapter::new();
    let mut nvs = match NvsAdapter::new() {
        Ok(n) => n,
        Err(e) => {
            warn!("NVS init failed ({e}), running with defaults and no persistence");
            NvsAdapter::default()
        }
    };
    let clock = Esp32TimeAdapter::new();
    let mut recv_buf = [0u8; RECV_BUF_LEN];

    loop {
        match mesh.recv(&mut recv_buf, RECV_POLL_TIMEOUT_MS) {
            Ok((from, len)) => {
                if let Err(e) =
                    service.dispatch_frame(Role::Leaf, from, &recv_buf[..len], &mut partition, &mut mesh, &mut nvs, &clock)
                {
                    warn!("dispatch from {:02x?} failed: {e}", from.0);
                }
            }
            Err(OtaError::Timeout) => {}
            Err(e) => warn!("mesh recv error: {e}"),
        }
        service.tick(&mut partition, &clock);
    }
}

/// Checks for an operator-armed update cycle and, if present, runs it.
/// Anything less than full success leaves the armed flag in place so the
/// next poll retries.
fn poll_update_trigger(
    service: &OtaService,
    partition: &mut Esp32PartitionAdapter,
    mesh: &mut EspMeshAdapter,
    http: &mut EspHttpAdapter,
    nvs: &mut NvsAdapter,
    clock: &Esp32TimeAdapter,
) {
    use ports::KvStorePort;

    let armed = match nvs.get_u8(TRIGGER_NAMESPACE, TRIGGER_KEY_ARMED) {
        Ok(Some(1)) => true,
        Ok(_) => false,
        Err(e) => {
            warn!("trigger poll: NVS read failed ({e})");
            false
        }
    };
    if !armed {
        return;
    }

    let url = match nvs_read_trigger_url(nvs) {
        Some(url) => url,
        None => {
            warn!("trigger armed but no URL staged, clearing");
            let _ = nvs.erase_key(TRIGGER_NAMESPACE, TRIGGER_KEY_ARMED);
            let _ = nvs.commit();
            return;
        }
    };

    info!("update trigger fired: {url}");
    if let Err(e) = run_update_cycle(service, partition, mesh, http, nvs, clock, &url) {
        warn!("update cycle failed ({e}), leaving trigger armed for retry");
        return;
    }

    let _ = nvs.erase_key(TRIGGER_NAMESPACE, TRIGGER_KEY_ARMED);
    let _ = nvs.commit();
}

fn run_update_cycle(
    service: &OtaService,
    partition: &mut Esp32PartitionAdapter,
    mesh: &mut EspMeshAdapter,
    http: &mut EspHttpAdapter,
    nvs: &mut NvsAdapter,
    clock: &Esp32TimeAdapter,
    url: &str,
) -> Result<(), error::OtaError> {
    service.start_download(url, partition, http, clock)?;
    info!("download complete, distributing to mesh");
    service.start_distribution(partition, mesh, clock, |p| {
        info!("distribution progress: {:.0}%", p * 100.0);
    })?;
    info!("distribution complete, coordinating reboot");
    service.initiate_reboot(partition, mesh, nvs, clock, 30, 2_000)?;
    partition.restart();
    Ok(())
}

/// `KvStorePort` only carries single bytes (the rollback engine's only
/// consumer needs no more than that); the URL a trigger is armed with has
/// to come from whatever wrote `TRIGGER_KEY_ARMED` through a side channel
/// this binary doesn't own. Left unresolved here rather than invented.
fn nvs_read_trigger_url(_nvs: &NvsAdapter) -> Option<String> {
    None
}

fn running_version_string() -> String {
    let raw = env!("CARGO_PKG_VERSION");
    if raw.len() >= VERSION_FIELD_LEN {
        raw[..VERSION_FIELD_LEN - 1].to_string()
    } else {
        raw.to_string()
    }
}
