//! ESP-MESH transport adapter (implements [`MeshTransportPort`]).
//!
//! - **`target_os = "espidf"`** — thin wrapper around `esp_mesh_send`/
//!   `esp_mesh_get_routing_table`/`esp_mesh_get_parent_bssid`, following the
//!   same `esp!()`-checked FFI style used for WiFi-mesh send/recv elsewhere
//!   in the fleet's firmware.
//! - **`not(target_os = "espidf"))`** — an in-process mesh simulation:
//!   nodes share a `Mutex`-guarded set of mailboxes, so distributor/receiver
//!   tests can run two or three simulated "devices" against real channels.

use log::warn;

use crate::error::{OtaError, Result};
use crate::ports::{MacAddr, MeshTransportPort};

#[cfg(target_os = "espidf")]
pub struct EspMeshAdapter;

#[cfg(target_os = "espidf")]
impl EspMeshAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "espidf")]
impl Default for EspMeshAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
impl MeshTransportPort for EspMeshAdapter {
    fn is_root(&self) -> bool {
        // SAFETY: read-only query against the mesh runtime state.
        unsafe { esp_idf_svc::sys::esp_mesh_is_root() }
    }

    fn routing_table(&self) -> Vec<MacAddr> {
        use esp_idf_svc::sys as sys;
        const MAX_TABLE_ENTRIES: usize = crate::config::MAX_NODES + 1;
        let mut raw = [sys::mesh_addr_t { addr: [0u8; 6] }; MAX_TABLE_ENTRIES];
        let mut table_size: i32 = 0;
        // SAFETY: `raw` has `MAX_TABLE_ENTRIES` capacity, matching the size
        // passed in; ESP-IDF writes at most that many entries and reports
        // the actual count in `table_size`.
        let rc = unsafe {
            sys::esp_mesh_get_routing_table(
                raw.as_mut_ptr(),
                (MAX_TABLE_ENTRIES * core::mem::size_of::<sys::mesh_addr_t>()) as i32,
                &mut table_size,
            )
        };
        if rc != sys::ESP_OK {
            warn!("mesh: routing table query failed");
            return Vec::new();
        }
        let self_addr = self_mac();
        raw[..table_size as usize]
            .iter()
            .map(|a| MacAddr(a.addr))
            .filter(|m| Some(*m) != self_addr)
            .collect()
    }

    fn send(&mut self, to: MacAddr, bytes: &[u8]) -> Result<()> {
        use esp_idf_svc::sys as sys;
        let dest = sys::mesh_addr_t { addr: to.0 };
        let mesh_data = sys::mesh_data_t {
            data: bytes.as_ptr().cast_mut(),
            size: bytes.len() as u16,
            proto: 0,
            tos: 0,
        };
        // SAFETY: `bytes` outlives the call; `mesh_data` borrows it only
        // for the duration of `esp_mesh_send`.
        let rc = unsafe { sys::esp_mesh_send(&dest, &mesh_data, 0, core::ptr::null(), 0) };
        if rc != sys::ESP_OK {
            warn!("mesh: send to {:02x?} failed: {rc}", to.0);
            return Err(OtaError::TransportTransient);
        }
        Ok(())
    }

    fn parent_address(&self) -> Option<MacAddr> {
        use esp_idf_svc::sys as sys;
        if self.is_root() {
            return None;
        }
        let mut parent = sys::mesh_addr_t { addr: [0u8; 6] };
        // SAFETY: `parent` is a valid out-param for the FFI call.
        let rc = unsafe { sys::esp_mesh_get_parent_bssid(&mut parent) };
        if rc != sys::ESP_OK {
            return None;
        }
        Some(MacAddr(parent.addr))
    }
}

#[cfg(target_os = "espidf")]
impl EspMeshAdapter {
    /// Blocking receive of the next inbound mesh packet, up to `timeout_ms`.
    /// Not part of [`MeshTransportPort`]: the domain modules never need to
    /// pull frames themselves, only the main event loop does.
    pub fn recv(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<(MacAddr, usize)> {
        use esp_idf_svc::sys as sys;
        let mut from = sys::mesh_addr_t { addr: [0u8; 6] };
        let mut mesh_data = sys::mesh_data_t {
            data: buf.as_mut_ptr(),
            size: buf.len() as u16,
            proto: 0,
            tos: 0,
        };
        let mut flags: i32 = 0;
        // SAFETY: `buf` outlives the call and has `buf.len()` capacity,
        // matching `mesh_data.size`; `from`/`flags` are valid out-params.
        let rc = unsafe {
            sys::esp_mesh_recv(&mut from, &mut mesh_data, timeout_ms as i32, &mut flags, core::ptr::null_mut(), 0)
        };
        if rc == sys::ESP_ERR_MESH_TIMEOUT {
            return Err(OtaError::Timeout);
        }
        if rc != sys::ESP_OK {
            warn!("mesh: recv failed: {rc}");
            return Err(OtaError::TransportTransient);
        }
        Ok((MacAddr(from.addr), mesh_data.size as usize))
    }
}

#[cfg(target_os = "espidf")]
fn self_mac() -> Option<MacAddr> {
    use esp_idf_svc::sys as sys;
    let mut mac = [0u8; 6];
    // SAFETY: `mac` is a 6-byte out-param matching `esp_read_mac`'s contract.
    let rc = unsafe { sys::esp_read_mac(mac.as_mut_ptr(), sys::esp_mac_type_t_ESP_MAC_WIFI_STA) };
    (rc == sys::ESP_OK).then_some(MacAddr(mac))
}

/// In-process mesh simulation used by host-side tests. Each simulated node
/// gets its own [`SimMeshHandle`] over a shared [`SimMeshFabric`]; `send`
/// delivers directly into the destination's mailbox (or every mailbox but
/// the sender's, for broadcast).
#[cfg(not(target_os = "espidf"))]
pub mod sim {
    use super::{MacAddr, MeshTransportPort, OtaError, Result};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Fabric {
        mailboxes: HashMap<MacAddr, VecDeque<(MacAddr, Vec<u8>)>>,
    }

    /// Shared mesh fabric. Construct one per test/simulation and hand out
    /// a [`SimMeshHandle`] per simulated device.
    #[derive(Clone, Default)]
    pub struct SimMeshFabric(Arc<Mutex<Fabric>>);

    impl SimMeshFabric {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn handle(&self, addr: MacAddr, is_root: bool, parent: Option<MacAddr>) -> SimMeshHandle {
            self.0.lock().unwrap().mailboxes.entry(addr).or_default();
            SimMeshHandle {
                fabric: self.clone(),
                addr,
                is_root,
                parent,
                routing_table: Vec::new(),
            }
        }
    }

    pub struct SimMeshHandle {
        fabric: SimMeshFabric,
        addr: MacAddr,
        is_root: bool,
        parent: Option<MacAddr>,
        routing_table: Vec<MacAddr>,
    }

    impl SimMeshHandle {
        pub fn set_routing_table(&mut self, nodes: Vec<MacAddr>) {
            self.routing_table = nodes;
        }

        /// Deliver the next queued frame addressed to this node, if any.
        pub fn poll_inbox(&self) -> Option<Vec<u8>> {
            self.recv().map(|(_, bytes)| bytes)
        }

        /// Like [`Self::poll_inbox`] but keeps the sender's address, mirroring
        /// the `(from, bytes)` shape [`EspMeshAdapter::recv`] reports on real
        /// hardware. Used by receive-loop-style tests.
        pub fn recv(&self) -> Option<(MacAddr, Vec<u8>)> {
            self.fabric.0.lock().unwrap().mailboxes.get_mut(&self.addr)?.pop_front()
        }
    }

    impl MeshTransportPort for SimMeshHandle {
        fn is_root(&self) -> bool {
            self.is_root
        }

        fn routing_table(&self) -> Vec<MacAddr> {
            self.routing_table.clone()
        }

        fn send(&mut self, to: MacAddr, bytes: &[u8]) -> Result<()> {
            let mut fabric = self.fabric.0.lock().unwrap();
            if to == MacAddr::BROADCAST {
                let targets: Vec<MacAddr> = fabric.mailboxes.keys().copied().filter(|a| *a != self.addr).collect();
                for addr in targets {
                    fabric.mailboxes.entry(addr).or_default().push_back((self.addr, bytes.to_vec()));
                }
                return Ok(());
            }
            let Some(mailbox) = fabric.mailboxes.get_mut(&to) else {
                return Err(OtaError::NotFound);
            };
            mailbox.push_back((self.addr, bytes.to_vec()));
            Ok(())
        }

        fn parent_address(&self) -> Option<MacAddr> {
            self.parent
        }
    }
}
