//! Rollback Engine (component F).
//!
//! A two-key persistent record per node, plus the boot-time decision table
//! that reads it. `attempt_count == 0` means "first boot after an update,
//! still on probation" — only the *second* boot actually swaps partitions,
//! and only if the first boot never stabilised. `MAX_ATTEMPTS` bounds the
//! worst case regardless of how bad either image turns out to be.

use log::{info, warn};

use crate::config::{MAX_ATTEMPTS, ROLLBACK_TIMEOUT_MS};
use crate::error::Result;
use crate::ports::{ClockPort, KvStorePort, MeshTransportPort, PartitionPort, PartitionSlot};

pub const NAMESPACE: &str = "ota_rollback";
pub const KEY_ARMED: &str = "armed";
pub const KEY_ATTEMPTS: &str = "attempts";

/// What the boot-time decision table says to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    NormalBoot,
    NormalBootWithWatchdog,
    SwapAndRestart,
}

/// Arm rollback protection: the partition about to be booted into is
/// unproven. Called by the Receiver (on commit) and the Reboot Coordinator
/// (on its own commit phase).
pub fn arm<K: KvStorePort>(kv: &mut K) -> Result<()> {
    kv.set_u8(NAMESPACE, KEY_ARMED, 1)?;
    kv.set_u8(NAMESPACE, KEY_ATTEMPTS, 0)?;
    kv.commit()
}

/// Clear both keys — the image has proven itself, or the loop-escape hatch
/// has tripped.
pub fn clear<K: KvStorePort>(kv: &mut K) -> Result<()> {
    kv.erase_key(NAMESPACE, KEY_ARMED)?;
    kv.erase_key(NAMESPACE, KEY_ATTEMPTS)?;
    kv.commit()
}

/// Whether rollback is currently armed. Fails open: any read error reads
/// as "not armed", since the normal (non-rollback) boot path must never be
/// blocked by a storage hiccup.
pub fn is_armed<K: KvStorePort>(kv: &K) -> bool {
    kv.get_u8(NAMESPACE, KEY_ARMED).unwrap_or(None).unwrap_or(0) != 0
}

fn attempt_count<K: KvStorePort>(kv: &K) -> u8 {
    kv.get_u8(NAMESPACE, KEY_ATTEMPTS).unwrap_or(None).unwrap_or(0)
}

/// Run the boot-time decision table. Must run before the mesh stack starts.
/// Performs the partition swap and restart itself when that is the
/// decision; callers only need to act on `NormalBoot*`.
pub fn check_rollback<P: PartitionPort, K: KvStorePort>(
    partition: &mut P,
    kv: &mut K,
) -> Result<BootAction> {
    if !is_armed(kv) {
        return Ok(BootAction::NormalBoot);
    }

    let attempts = attempt_count(kv);

    if attempts >= MAX_ATTEMPTS {
        warn!("rollback: attempt ceiling reached, clearing and booting normally");
        clear(kv)?;
        return Ok(BootAction::NormalBoot);
    }

    if attempts == 0 {
        info!("rollback: first boot after update, starting connectivity watchdog");
        return Ok(BootAction::NormalBootWithWatchdog);
    }

    warn!("rollback: previous boot never stabilised, swapping partitions");
    kv.set_u8(NAMESPACE, KEY_ATTEMPTS, attempts.saturating_add(1))?;
    kv.commit()?;
    let other = match partition.boot_target()? {
        PartitionSlot::Running => PartitionSlot::Inactive,
        PartitionSlot::Inactive => PartitionSlot::Running,
    };
    partition.set_boot(other)?;
    partition.restart();
    Ok(BootAction::SwapAndRestart)
}

/// Blocks for `ROLLBACK_TIMEOUT_MS`, then resolves rollback based on mesh
/// connectivity. Intended to run on its own thread, spawned only in the
/// `attempts == 0` boot-action case.
pub fn run_connectivity_watchdog<T: MeshTransportPort, K: KvStorePort, C: ClockPort>(
    transport: &T,
    kv: &mut K,
    clock: &C,
) -> Result<()> {
    clock.sleep_ms(ROLLBACK_TIMEOUT_MS);

    if mesh_is_connected(transport) {
        info!("rollback: connectivity confirmed, clearing armed state");
        clear(kv)
    } else {
        warn!("rollback: no connectivity after grace period, marking attempt");
        let attempts = attempt_count(kv);
        kv.set_u8(NAMESPACE, KEY_ATTEMPTS, attempts.saturating_add(1))?;
        kv.commit()
    }
}

fn mesh_is_connected<T: MeshTransportPort>(transport: &T) -> bool {
    transport.is_root() || transport.parent_address().is_some()
}

/// Spawn the connectivity watchdog as its own thread. Only meaningful with
/// `'static` adapters (the real on-device adapters own their resources);
/// tests call [`run_connectivity_watchdog`] directly instead.
pub fn spawn_connectivity_watchdog<T, K, C>(transport: T, mut kv: K, clock: C) -> std::thread::JoinHandle<()>
where
    T: MeshTransportPort + Send + 'static,
    K: KvStorePort + Send + 'static,
    C: ClockPort + Send + 'static,
{
    std::thread::spawn(move || {
        if let Err(e) = run_connectivity_watchdog(&transport, &mut kv, &clock) {
            warn!("rollback: watchdog failed: {e}");
        }
    })
}
