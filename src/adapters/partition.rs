//! Flash partition adapter (component implementing [`PartitionPort`]).
//!
//! - **`target_os = "espidf"`** — the running/inactive partitions are the
//!   two OTA app slots managed by the ESP-IDF bootloader. Streaming writes
//!   go through the `esp-ota` crate (matching the teacher's phone-RPC OTA
//!   path); partition identity, descriptor reads, and boot-target queries
//!   fall through to the raw `esp_idf_sys` OTA partition API, since
//!   `esp-ota` only wraps the write path.
//! - **`not(target_os = "espidf"))`** — an in-memory pair of partitions for
//!   host-side tests and simulation.

use log::warn;

use crate::error::{OtaError, Result};
use crate::ports::{PartitionDescriptor, PartitionPort, PartitionSlot, PartitionValidity, WriteHandle};
use crate::wire::{self, VersionField};

#[cfg(target_os = "espidf")]
pub struct Esp32PartitionAdapter {
    pending: Option<esp_ota::OtaUpdate>,
    next_handle: u32,
    open_handle: Option<u32>,
}

#[cfg(target_os = "espidf")]
impl Esp32PartitionAdapter {
    pub fn new() -> Self {
        Self {
            pending: None,
            next_handle: 0,
            open_handle: None,
        }
    }

    fn partition_for(slot: PartitionSlot) -> Result<*const esp_idf_svc::sys::esp_partition_t> {
        use esp_idf_svc::sys as sys;
        // SAFETY: both calls are read-only queries against the bootloader's
        // partition table, valid for the lifetime of the process.
        let p = unsafe {
            match slot {
                PartitionSlot::Running => sys::esp_ota_get_running_partition(),
                PartitionSlot::Inactive => sys::esp_ota_get_next_update_partition(core::ptr::null()),
            }
        };
        if p.is_null() {
            return Err(OtaError::NotFound);
        }
        Ok(p)
    }
}

#[cfg(target_os = "espidf")]
impl Default for Esp32PartitionAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
impl PartitionPort for Esp32PartitionAdapter {
    fn identity(&self, slot: PartitionSlot) -> Result<(u32, u32)> {
        let p = Self::partition_for(slot)?;
        // SAFETY: `p` was just validated non-null by `partition_for`.
        let part = unsafe { *p };
        Ok((part.address, part.size))
    }

    fn read(&self, slot: PartitionSlot, offset: u32, buf: &mut [u8]) -> Result<()> {
        use esp_idf_svc::sys as sys;
        let p = Self::partition_for(slot)?;
        // SAFETY: `buf` is valid for `buf.len()` bytes for the duration of
        // the call; `p` was validated non-null above.
        let rc = unsafe {
            sys::esp_partition_read(p, offset as usize, buf.as_mut_ptr().cast(), buf.len())
        };
        if rc != sys::ESP_OK {
            return Err(OtaError::Fatal);
        }
        Ok(())
    }

    fn open_write(&mut self, _size: u32) -> Result<WriteHandle> {
        if self.pending.is_some() {
            return Err(OtaError::InvalidState);
        }
        let update = esp_ota::OtaUpdate::begin().map_err(|e| {
            warn!("partition: esp-ota begin failed: {e:?}");
            OtaError::Fatal
        })?;
        self.pending = Some(update);
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.open_handle = Some(handle);
        Ok(WriteHandle(handle))
    }

    fn write(&mut self, handle: WriteHandle, buf: &[u8]) -> Result<()> {
        if self.open_handle != Some(handle.0) {
            return Err(OtaError::InvalidState);
        }
        let Some(update) = self.pending.as_mut() else {
            return Err(OtaError::InvalidState);
        };
        update.write(buf).map_err(|e| {
            warn!("partition: esp-ota write failed: {e:?}");
            OtaError::Fatal
        })
    }

    fn finish(&mut self, handle: WriteHandle) -> Result<()> {
        if self.open_handle != Some(handle.0) {
            return Err(OtaError::InvalidState);
        }
        let Some(update) = self.pending.take() else {
            return Err(OtaError::InvalidState);
        };
        self.open_handle = None;
        let mut completed = update.finalize().map_err(|e| {
            warn!("partition: esp-ota finalize failed: {e:?}");
            OtaError::Fatal
        })?;
        completed.set_as_boot_partition().map_err(|e| {
            warn!("partition: set_as_boot_partition failed: {e:?}");
            OtaError::Fatal
        })
    }

    fn abort(&mut self, handle: WriteHandle) {
        if self.open_handle == Some(handle.0) {
            self.open_handle = None;
            self.pending = None;
        }
    }

    fn set_boot(&mut self, slot: PartitionSlot) -> Result<()> {
        use esp_idf_svc::sys as sys;
        let p = Self::partition_for(slot)?;
        // SAFETY: `p` is a validated partition pointer from the table.
        let rc = unsafe { sys::esp_ota_set_boot_partition(p) };
        if rc != sys::ESP_OK {
            return Err(OtaError::Fatal);
        }
        Ok(())
    }

    fn boot_target(&self) -> Result<PartitionSlot> {
        use esp_idf_svc::sys as sys;
        // SAFETY: read-only query against the bootloader's OTA data partition.
        let boot = unsafe { sys::esp_ota_get_boot_partition() };
        let running = Self::partition_for(PartitionSlot::Running)?;
        if boot == running {
            Ok(PartitionSlot::Running)
        } else {
            Ok(PartitionSlot::Inactive)
        }
    }

    fn validate_state(&self, slot: PartitionSlot) -> Result<PartitionValidity> {
        use esp_idf_svc::sys as sys;
        let p = Self::partition_for(slot)?;
        let mut state: sys::esp_ota_img_states_t = 0;
        // SAFETY: `p` validated non-null, `state` is a valid out-param.
        let rc = unsafe { sys::esp_ota_get_state_partition(p, &mut state) };
        if rc != sys::ESP_OK {
            return Ok(PartitionValidity::Invalid);
        }
        if state == sys::esp_ota_img_states_t_ESP_OTA_IMG_INVALID
            || state == sys::esp_ota_img_states_t_ESP_OTA_IMG_ABORTED
        {
            return Ok(PartitionValidity::Invalid);
        }
        Ok(PartitionValidity::Valid)
    }

    fn read_descriptor(&self, slot: PartitionSlot) -> Result<PartitionDescriptor> {
        use esp_idf_svc::sys as sys;
        let p = Self::partition_for(slot)?;
        let mut desc: sys::esp_app_desc_t = unsafe { core::mem::zeroed() };
        // SAFETY: `p` validated non-null, `desc` is a valid out-param sized
        // to the struct ESP-IDF expects.
        let rc = unsafe { sys::esp_ota_get_partition_description(p, &mut desc) };
        if rc != sys::ESP_OK {
            return Err(OtaError::Fatal);
        }
        let version_str = core::str::from_utf8(&desc.version)
            .unwrap_or("")
            .trim_end_matches('\0');
        Ok(PartitionDescriptor {
            version: wire::encode_version(version_str),
            image_len: self.identity(slot)?.1,
        })
    }

    fn restart(&mut self) {
        esp_ota::restart();
    }
}

/// In-memory partition pair for host-side tests and simulation.
#[cfg(not(target_os = "espidf"))]
pub struct SimPartitionAdapter {
    running: SimSlot,
    inactive: SimSlot,
    boot: PartitionSlot,
    next_handle: u32,
    open_handle: Option<(u32, Vec<u8>, u32)>,
    restarted: bool,
}

#[cfg(not(target_os = "espidf"))]
struct SimSlot {
    data: Vec<u8>,
    version: VersionField,
    valid: PartitionValidity,
}

#[cfg(not(target_os = "espidf"))]
impl SimPartitionAdapter {
    pub fn new(running_version: &str) -> Self {
        Self {
            running: SimSlot {
                data: Vec::new(),
                version: wire::encode_version(running_version),
                valid: PartitionValidity::Valid,
            },
            inactive: SimSlot {
                data: Vec::new(),
                version: [0u8; crate::config::VERSION_FIELD_LEN],
                valid: PartitionValidity::Invalid,
            },
            boot: PartitionSlot::Running,
            next_handle: 0,
            open_handle: None,
            restarted: false,
        }
    }

    /// Test/simulation seam: stage a firmware image into the inactive slot
    /// without going through `open_write`/`write`/`finish`.
    pub fn stage_inactive(&mut self, version: &str, data: Vec<u8>) {
        self.inactive.version = wire::encode_version(version);
        self.inactive.data = data;
        self.inactive.valid = PartitionValidity::Valid;
    }

    pub fn was_restarted(&self) -> bool {
        self.restarted
    }

    fn slot(&self, slot: PartitionSlot) -> &SimSlot {
        match slot {
            PartitionSlot::Running => &self.running,
            PartitionSlot::Inactive => &self.inactive,
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl PartitionPort for SimPartitionAdapter {
    fn identity(&self, slot: PartitionSlot) -> Result<(u32, u32)> {
        let base = match slot {
            PartitionSlot::Running => 0x10000,
            PartitionSlot::Inactive => 0x110000,
        };
        Ok((base, self.slot(slot).data.len() as u32))
    }

    fn read(&self, slot: PartitionSlot, offset: u32, buf: &mut [u8]) -> Result<()> {
        let data = &self.slot(slot).data;
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(OtaError::InvalidSize);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn open_write(&mut self, _size: u32) -> Result<WriteHandle> {
        if self.open_handle.is_some() {
            return Err(OtaError::InvalidState);
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.open_handle = Some((handle, Vec::new(), 0));
        Ok(WriteHandle(handle))
    }

    fn write(&mut self, handle: WriteHandle, buf: &[u8]) -> Result<()> {
        let Some((open, data, _)) = self.open_handle.as_mut() else {
            return Err(OtaError::InvalidState);
        };
        if *open != handle.0 {
            return Err(OtaError::InvalidState);
        }
        data.extend_from_slice(buf);
        Ok(())
    }

    fn finish(&mut self, handle: WriteHandle) -> Result<()> {
        let Some((open, data, _)) = self.open_handle.take() else {
            return Err(OtaError::InvalidState);
        };
        if open != handle.0 {
            self.open_handle = Some((open, data, 0));
            return Err(OtaError::InvalidState);
        }
        self.inactive.data = data;
        self.inactive.valid = PartitionValidity::Valid;
        Ok(())
    }

    fn abort(&mut self, handle: WriteHandle) {
        if let Some((open, _, _)) = &self.open_handle {
            if *open == handle.0 {
                self.open_handle = None;
            }
        }
    }

    fn set_boot(&mut self, slot: PartitionSlot) -> Result<()> {
        self.boot = slot;
        Ok(())
    }

    fn boot_target(&self) -> Result<PartitionSlot> {
        Ok(self.boot)
    }

    fn validate_state(&self, slot: PartitionSlot) -> Result<PartitionValidity> {
        Ok(self.slot(slot).valid)
    }

    fn read_descriptor(&self, slot: PartitionSlot) -> Result<PartitionDescriptor> {
        let s = self.slot(slot);
        Ok(PartitionDescriptor {
            version: s.version,
            image_len: s.data.len() as u32,
        })
    }

    fn restart(&mut self) {
        self.restarted = true;
    }
}
