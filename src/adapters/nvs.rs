//! NVS (Non-Volatile Storage) adapter.
//!
//! The flash tier of [`crate::persistent::Storage`].  Values are opaque
//! blobs under `(namespace, key)`; both are limited to 15 printable ASCII
//! bytes.
//!
//! - ESP32: raw `nvs_*` calls, one open/commit/close per operation.  NVS
//!   commits are atomic per key.
//! - Host: a shared in-memory map.  Clones share the map so a test can
//!   keep a handle after moving the adapter into `Storage`, and can
//!   rebuild a fresh runtime on top of the same "flash".

use crate::app::ports::{PersistentBackend, StorageError, validate_key};
use log::info;

#[cfg(not(target_os = "espidf"))]
use std::cell::{Cell, RefCell};
#[cfg(not(target_os = "espidf"))]
use std::collections::BTreeMap;
#[cfg(not(target_os = "espidf"))]
use std::rc::Rc;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;
#[cfg(target_os = "espidf")]
use log::warn;

#[cfg_attr(not(target_os = "espidf"), derive(Clone, Default))]
pub struct NvsAdapter {
    #[cfg(not(target_os = "espidf"))]
    store: Rc<RefCell<BTreeMap<String, Vec<u8>>>>,
    #[cfg(not(target_os = "espidf"))]
    writes: Rc<Cell<usize>>,
    #[cfg(not(target_os = "espidf"))]
    fail_writes: Rc<Cell<bool>>,
}

impl NvsAdapter {
    /// Initialise NVS flash.
    ///
    /// On first boot or after a version mismatch the partition is erased
    /// and re-initialised.
    pub fn new() -> Result<Self, StorageError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: called once from the main task before any NVS access.
            let ret = unsafe { nvs_flash_init() };
            if ret == code::NO_FREE_PAGES || ret == code::NEW_VERSION_FOUND {
                warn!("NVS: erasing and re-initialising flash partition");
                if unsafe { nvs_flash_erase() } != code::OK {
                    return Err(StorageError::IoError);
                }
                if unsafe { nvs_flash_init() } != code::OK {
                    return Err(StorageError::IoError);
                }
            } else if ret != code::OK {
                return Err(StorageError::IoError);
            }
            info!("NvsAdapter: ESP-IDF NVS initialised");
            Ok(Self {})
        }

        #[cfg(not(target_os = "espidf"))]
        {
            info!("NvsAdapter: simulation backend");
            Ok(Self::default())
        }
    }

    /// Open a namespace, run `f` with the handle, then close.
    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T, esp_err_t>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, esp_err_t>,
    {
        let ns = c_name(namespace).map_err(|_| code::INVALID_NAME)?;
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        let mut handle: nvs_handle_t = 0;
        let ret = unsafe { nvs_open(ns.as_ptr() as *const _, mode, &mut handle) };
        if ret != code::OK {
            return Err(ret);
        }

        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }
}

/// NUL-terminated copy of a validated namespace or key.
#[cfg(target_os = "espidf")]
fn c_name(name: &str) -> Result<[u8; 16], StorageError> {
    validate_key(name)?;
    let mut buf = [0u8; 16];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    Ok(buf)
}

// Bindgen exposes the NVS codes with varying integer types; normalise
// them once so they can be used as match patterns.
#[cfg(target_os = "espidf")]
#[allow(clippy::unnecessary_cast)]
mod code {
    use esp_idf_svc::sys::*;
    pub const NOT_FOUND: esp_err_t = ESP_ERR_NVS_NOT_FOUND as esp_err_t;
    pub const NOT_ENOUGH_SPACE: esp_err_t = ESP_ERR_NVS_NOT_ENOUGH_SPACE as esp_err_t;
    pub const NO_FREE_PAGES: esp_err_t = ESP_ERR_NVS_NO_FREE_PAGES as esp_err_t;
    pub const NEW_VERSION_FOUND: esp_err_t = ESP_ERR_NVS_NEW_VERSION_FOUND as esp_err_t;
    pub const INVALID_NAME: esp_err_t = ESP_ERR_NVS_INVALID_NAME as esp_err_t;
    pub const KEY_TOO_LONG: esp_err_t = ESP_ERR_NVS_KEY_TOO_LONG as esp_err_t;
    pub const OK: esp_err_t = ESP_OK as esp_err_t;
}

#[cfg(target_os = "espidf")]
fn map_err(ret: esp_err_t) -> StorageError {
    match ret {
        code::NOT_FOUND => StorageError::NotFound,
        code::NOT_ENOUGH_SPACE | code::NO_FREE_PAGES => StorageError::Full,
        code::INVALID_NAME | code::KEY_TOO_LONG => StorageError::InvalidKey,
        _ => StorageError::IoError,
    }
}

#[cfg(target_os = "espidf")]
impl PersistentBackend for NvsAdapter {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let key = c_name(key)?;
        Self::with_nvs_handle(namespace, false, |handle| {
            let mut size = buf.len();
            let ret = unsafe {
                nvs_get_blob(
                    handle,
                    key.as_ptr() as *const _,
                    buf.as_mut_ptr() as *mut _,
                    &mut size,
                )
            };
            if ret != code::OK {
                return Err(ret);
            }
            Ok(size)
        })
        .map_err(map_err)
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let ckey = c_name(key)?;
        Self::with_nvs_handle(namespace, true, |handle| {
            let ret = unsafe {
                nvs_set_blob(
                    handle,
                    ckey.as_ptr() as *const _,
                    data.as_ptr() as *const _,
                    data.len(),
                )
            };
            if ret != code::OK {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != code::OK {
                return Err(ret);
            }
            Ok(())
        })
        .map_err(|e| {
            warn!("NvsAdapter: write {}/{} failed: {}", namespace, key, e);
            map_err(e)
        })
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let key = c_name(key)?;
        Self::with_nvs_handle(namespace, true, |handle| {
            let ret = unsafe { nvs_erase_key(handle, key.as_ptr() as *const _) };
            if ret != code::OK && ret != code::NOT_FOUND {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != code::OK {
                return Err(ret);
            }
            Ok(())
        })
        .or_else(|e| match e {
            // Namespace never written: nothing to delete.
            code::NOT_FOUND => Ok(()),
            e => Err(map_err(e)),
        })
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        let Ok(key) = c_name(key) else {
            return false;
        };
        Self::with_nvs_handle(namespace, false, |handle| {
            let ret =
                unsafe { nvs_find_key(handle, key.as_ptr() as *const _, core::ptr::null_mut()) };
            Ok(ret == code::OK)
        })
        .unwrap_or(false)
    }
}

#[cfg(not(target_os = "espidf"))]
impl NvsAdapter {
    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }

    /// Copy of every stored entry, keyed `namespace::key`.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.store.borrow().clone()
    }

    /// Successful writes and deletes since creation.
    pub fn write_count(&self) -> usize {
        self.writes.get()
    }

    /// Make every subsequent write fail with `IoError`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    fn check(&self, namespace: &str, key: &str) -> Result<String, StorageError> {
        validate_key(namespace)?;
        validate_key(key)?;
        Ok(Self::composite_key(namespace, key))
    }
}

#[cfg(not(target_os = "espidf"))]
impl PersistentBackend for NvsAdapter {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let composite = self.check(namespace, key)?;
        let store = self.store.borrow();
        let data = store.get(&composite).ok_or(StorageError::NotFound)?;
        // Same contract as nvs_get_blob: a short buffer is an error.
        let dst = buf.get_mut(..data.len()).ok_or(StorageError::IoError)?;
        dst.copy_from_slice(data);
        Ok(data.len())
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let composite = self.check(namespace, key)?;
        if self.fail_writes.get() {
            return Err(StorageError::IoError);
        }
        self.store.borrow_mut().insert(composite, data.to_vec());
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let composite = self.check(namespace, key)?;
        if self.fail_writes.get() {
            return Err(StorageError::IoError);
        }
        if self.store.borrow_mut().remove(&composite).is_some() {
            self.writes.set(self.writes.get() + 1);
        }
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.check(namespace, key)
            .is_ok_and(|composite| self.store.borrow().contains_key(&composite))
    }
}
