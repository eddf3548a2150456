//! NVS (Non-Volatile Storage) adapter.
//!
//! Implements [`KvStorePort`] for the rollback engine's persistent state.
//!
//! - Namespace isolation: each caller-supplied namespace maps to its own
//!   NVS namespace, so the rollback `"ota_rollback"` keys never collide
//!   with anything else sharing the partition.
//! - Atomic writes: ESP-IDF NVS commits are atomic per `nvs_commit()`.

use crate::error::{OtaError, Result};
use crate::ports::KvStorePort;
use log::{info, warn};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

pub struct NvsAdapter {
    #[cfg(not(target_os = "espidf"))]
    store: std::cell::RefCell<HashMap<(String, String), u8>>,
}

impl NvsAdapter {
    /// Create a new `NvsAdapter` and initialise NVS flash.
    ///
    /// Returns `Err(OtaError::Fatal)` if flash initialisation fails
    /// unrecoverably. On first boot or after a version mismatch the NVS
    /// partition is erased and re-initialised automatically.
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: nvs_flash_init / nvs_flash_erase are called from the
            // single main-task context before any concurrent NVS access.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("NVS: erasing and re-initialising flash partition");
                let ret2 = unsafe { nvs_flash_erase() };
                if ret2 != ESP_OK {
                    return Err(OtaError::Fatal);
                }
                let ret3 = unsafe { nvs_flash_init() };
                if ret3 != ESP_OK {
                    return Err(OtaError::Fatal);
                }
            } else if ret != ESP_OK {
                return Err(OtaError::Fatal);
            }
            info!("NvsAdapter: ESP-IDF NVS initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("NvsAdapter: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::cell::RefCell::new(HashMap::new()),
        })
    }

    /// Open an NVS namespace, execute a closure with the handle, then close.
    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T>
    where
        F: FnOnce(nvs_handle_t) -> Result<T>,
    {
        let mut ns_buf = [0u8; 16];
        let ns_bytes = namespace.as_bytes();
        let len = ns_bytes.len().min(15);
        ns_buf[..len].copy_from_slice(&ns_bytes[..len]);

        let mut handle: nvs_handle_t = 0;
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        // SAFETY: `ns_buf` is a valid NUL-terminated (zero-padded) C string
        // for the duration of the call; `handle` is a valid out-param.
        let ret = unsafe { nvs_open(ns_buf.as_ptr().cast(), mode, &mut handle) };
        if ret != ESP_OK {
            return Err(OtaError::Fatal);
        }

        let result = f(handle);
        // SAFETY: `handle` was just opened above and is closed exactly once.
        unsafe {
            nvs_close(handle);
        }
        result
    }
}

impl KvStorePort for NvsAdapter {
    fn get_u8(&self, namespace: &str, key: &str) -> Result<Option<u8>> {
        #[cfg(not(target_os = "espidf"))]
        {
            Ok(self.store.borrow().get(&(namespace.to_string(), key.to_string())).copied())
        }

        #[cfg(target_os = "espidf")]
        {
            let mut key_buf = [0u8; 16];
            let kb = key.as_bytes();
            let kl = kb.len().min(15);
            key_buf[..kl].copy_from_slice(&kb[..kl]);

            let result = Self::with_nvs_handle(namespace, false, |handle| {
                let mut value: u8 = 0;
                // SAFETY: `value` is a valid out-param; `key_buf` is a
                // zero-padded C string.
                let ret = unsafe { nvs_get_u8(handle, key_buf.as_ptr().cast(), &mut value) };
                if ret == ESP_ERR_NVS_NOT_FOUND {
                    return Ok(None);
                }
                if ret != ESP_OK {
                    return Err(OtaError::Fatal);
                }
                Ok(Some(value))
            });
            result
        }
    }

    fn set_u8(&mut self, namespace: &str, key: &str, value: u8) -> Result<()> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.store
                .borrow_mut()
                .insert((namespace.to_string(), key.to_string()), value);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let mut key_buf = [0u8; 16];
            let kb = key.as_bytes();
            let kl = kb.len().min(15);
            key_buf[..kl].copy_from_slice(&kb[..kl]);

            Self::with_nvs_handle(namespace, true, |handle| {
                // SAFETY: `key_buf` is a zero-padded C string valid for the call.
                let ret = unsafe { nvs_set_u8(handle, key_buf.as_ptr().cast(), value) };
                if ret != ESP_OK {
                    return Err(OtaError::Fatal);
                }
                // SAFETY: `handle` is open for the duration of this closure.
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(OtaError::Fatal);
                }
                Ok(())
            })
        }
    }

    fn erase_key(&mut self, namespace: &str, key: &str) -> Result<()> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.store.borrow_mut().remove(&(namespace.to_string(), key.to_string()));
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let mut key_buf = [0u8; 16];
            let kb = key.as_bytes();
            let kl = kb.len().min(15);
            key_buf[..kl].copy_from_slice(&kb[..kl]);

            Self::with_nvs_handle(namespace, true, |handle| {
                // SAFETY: `key_buf` is a zero-padded C string valid for the call.
                let ret = unsafe { nvs_erase_key(handle, key_buf.as_ptr().cast()) };
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    return Err(OtaError::Fatal);
                }
                // SAFETY: `handle` is open for the duration of this closure.
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(OtaError::Fatal);
                }
                Ok(())
            })
        }
    }

    /// Each write above already commits through its own handle; kept as a
    /// no-op seam so callers (and tests against the host simulation) have
    /// one place to flush if that ever stops being true.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Default for NvsAdapter {
    fn default() -> Self {
        // Panics if NVS is unavailable — only use as a last-resort fallback.
        Self::new().unwrap_or_else(|_| Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::cell::RefCell::new(HashMap::new()),
        })
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;

    #[test]
    fn round_trip_set_get_erase() {
        let mut nvs = NvsAdapter::new().unwrap();
        assert_eq!(nvs.get_u8("ota_rollback", "armed").unwrap(), None);
        nvs.set_u8("ota_rollback", "armed", 1).unwrap();
        assert_eq!(nvs.get_u8("ota_rollback", "armed").unwrap(), Some(1));
        nvs.erase_key("ota_rollback", "armed").unwrap();
        assert_eq!(nvs.get_u8("ota_rollback", "armed").unwrap(), None);
    }

    #[test]
    fn namespace_isolation() {
        let mut nvs = NvsAdapter::new().unwrap();
        nvs.set_u8("ns_a", "key", 1).unwrap();
        nvs.set_u8("ns_b", "key", 2).unwrap();
        assert_eq!(nvs.get_u8("ns_a", "key").unwrap(), Some(1));
        assert_eq!(nvs.get_u8("ns_b", "key").unwrap(), Some(2));
    }
}
