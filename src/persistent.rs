//! Typed values that survive deep sleep or a reset.
//!
//! ```text
//!   PersistentCell<T> ──init──▶ Tier::FastMemory ──▶ RTC slot table
//!                          └──▶ Tier::Flash      ──▶ NVS (namespace, key)
//!                          └──▶ Tier::None       (default only, writes dropped)
//! ```
//!
//! A cell is declared once at process start with a compile-time default,
//! then bound to a storage tier in an explicit [`PersistentCell::init`]
//! step that consults the global [`StoragePreference`].  After `init`
//! reads come from the in-memory cache and never touch storage.  Writes
//! of an unchanged value are no-ops so that flash is not worn by
//! redundant commits.
//!
//! Values are encoded as a postcard-serialised [`StoredValue`], so a key
//! written as one type and read back as another is detected rather than
//! reinterpreted.

use core::fmt;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{PersistentBackend, StorageError, validate_key};

/// Upper bound on an encoded value.  Device tokens are the largest
/// strings stored.
pub const MAX_ENCODED_LEN: usize = 512;

// ── Encoding ──────────────────────────────────────────────────

/// Closed set of persisted representations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    I32(i32),
    I64(i64),
    Bool(bool),
    Str(String),
    /// Two strings committed by one write.
    Pair(String, String),
}

impl StoredValue {
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let bytes = postcard::to_allocvec(self).map_err(|_| StorageError::Corrupted)?;
        if bytes.len() > MAX_ENCODED_LEN {
            return Err(StorageError::Full);
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        postcard::from_bytes(bytes).map_err(|_| StorageError::Corrupted)
    }
}

/// Types a [`PersistentCell`] can hold.
pub trait Persistable: Clone + PartialEq + fmt::Debug {
    fn to_stored(&self) -> StoredValue;

    /// `None` if `value` has a different representation.
    fn from_stored(value: StoredValue) -> Option<Self>;
}

impl Persistable for i32 {
    fn to_stored(&self) -> StoredValue {
        StoredValue::I32(*self)
    }

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::I32(v) => Some(v),
            _ => None,
        }
    }
}

impl Persistable for i64 {
    fn to_stored(&self) -> StoredValue {
        StoredValue::I64(*self)
    }

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::I64(v) => Some(v),
            _ => None,
        }
    }
}

// Unsigned counters ride in the 64-bit slot.
impl Persistable for u32 {
    fn to_stored(&self) -> StoredValue {
        StoredValue::I64(i64::from(*self))
    }

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::I64(v) => u32::try_from(v).ok(),
            _ => None,
        }
    }
}

impl Persistable for bool {
    fn to_stored(&self) -> StoredValue {
        StoredValue::Bool(*self)
    }

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl Persistable for String {
    fn to_stored(&self) -> StoredValue {
        StoredValue::Str(self.clone())
    }

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

// ── Storage context ───────────────────────────────────────────

/// Where a cell's value physically lives after [`PersistentCell::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// No usable location: reads return the default, writes are dropped.
    None,
    FastMemory,
    Flash,
}

/// Global tier preference for fast-memory capable cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoragePreference {
    #[default]
    FastMemory,
    /// Force every cell onto flash (e.g. on boards whose RTC domain is
    /// powered down during sleep).
    Flash,
}

/// Whether flash writes happen on every `set` or only on [`PersistentCell::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashMode {
    #[default]
    Implicit,
    Explicit,
}

/// The two persistence backends plus the global preference.
///
/// Passed by `&mut` to every writer, which serialises access: only one
/// storage session is ever open at a time.
pub struct Storage {
    fast: Box<dyn PersistentBackend>,
    flash: Box<dyn PersistentBackend>,
    preference: StoragePreference,
}

impl Storage {
    pub fn new(fast: Box<dyn PersistentBackend>, flash: Box<dyn PersistentBackend>) -> Self {
        Self {
            fast,
            flash,
            preference: StoragePreference::default(),
        }
    }

    pub fn with_preference(mut self, preference: StoragePreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn preference(&self) -> StoragePreference {
        self.preference
    }

    pub fn set_preference(&mut self, preference: StoragePreference) {
        self.preference = preference;
    }

    pub fn flash(&self) -> &dyn PersistentBackend {
        self.flash.as_ref()
    }

    pub fn flash_mut(&mut self) -> &mut dyn PersistentBackend {
        self.flash.as_mut()
    }

    fn backend(&self, tier: Tier) -> Option<&dyn PersistentBackend> {
        match tier {
            Tier::None => None,
            Tier::FastMemory => Some(self.fast.as_ref()),
            Tier::Flash => Some(self.flash.as_ref()),
        }
    }

    fn backend_mut(&mut self, tier: Tier) -> Option<&mut dyn PersistentBackend> {
        match tier {
            Tier::None => None,
            Tier::FastMemory => Some(self.fast.as_mut()),
            Tier::Flash => Some(self.flash.as_mut()),
        }
    }

    /// Read and decode a value.  An absent key is `Ok(None)`.
    pub fn load(
        &self,
        tier: Tier,
        namespace: &str,
        key: &str,
    ) -> Result<Option<StoredValue>, StorageError> {
        let Some(backend) = self.backend(tier) else {
            return Ok(None);
        };
        let mut buf = [0u8; MAX_ENCODED_LEN];
        match backend.read(namespace, key, &mut buf) {
            Ok(len) => StoredValue::decode(&buf[..len]).map(Some),
            Err(StorageError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Encode and write a value.
    pub fn store(
        &mut self,
        tier: Tier,
        namespace: &str,
        key: &str,
        value: &StoredValue,
    ) -> Result<(), StorageError> {
        let bytes = value.encode()?;
        let Some(backend) = self.backend_mut(tier) else {
            return Err(StorageError::InvalidKey);
        };
        backend.write(namespace, key, &bytes)
    }

    /// Shorthand for flash-tier reads of the registry and API client.
    pub fn load_flash(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<StoredValue>, StorageError> {
        self.load(Tier::Flash, namespace, key)
    }

    pub fn store_flash(
        &mut self,
        namespace: &str,
        key: &str,
        value: &StoredValue,
    ) -> Result<(), StorageError> {
        self.store(Tier::Flash, namespace, key, value)
    }

    /// Flash string helper; absent, mistyped or unreadable keys yield `""`.
    pub fn flash_string(&self, namespace: &str, key: &str) -> String {
        match self.load_flash(namespace, key) {
            Ok(Some(StoredValue::Str(s))) => s,
            Ok(_) => String::new(),
            Err(e) => {
                warn!("Storage: read {}/{} failed: {}", namespace, key, e);
                String::new()
            }
        }
    }

    /// Write a flash string only if it differs from what is stored.
    /// Returns whether a write happened.
    pub fn put_flash_string(
        &mut self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, StorageError> {
        if let Ok(Some(StoredValue::Str(current))) = self.load_flash(namespace, key) {
            if current == value {
                return Ok(false);
            }
        }
        self.store_flash(namespace, key, &StoredValue::Str(value.to_owned()))?;
        Ok(true)
    }
}

// ── PersistentCell ────────────────────────────────────────────

pub struct PersistentCell<T: Persistable> {
    namespace: &'static str,
    key: &'static str,
    fast_capable: bool,
    mode: FlashMode,
    tier: Tier,
    default: T,
    value: T,
    dirty: bool,
}

impl<T: Persistable> PersistentCell<T> {
    /// A cell that lives in RTC memory unless the global preference
    /// forces flash, in which case `(namespace, key)` is used on NVS.
    pub fn fast_memory(namespace: &'static str, key: &'static str, default: T) -> Self {
        Self::build(namespace, key, default, true)
    }

    /// A cell that always lives on NVS flash.
    pub fn flash(namespace: &'static str, key: &'static str, default: T) -> Self {
        Self::build(namespace, key, default, false)
    }

    fn build(namespace: &'static str, key: &'static str, default: T, fast_capable: bool) -> Self {
        Self {
            namespace,
            key,
            fast_capable,
            mode: FlashMode::Implicit,
            tier: Tier::None,
            value: default.clone(),
            default,
            dirty: false,
        }
    }

    /// Defer flash writes until [`flush`](Self::flush).
    pub fn with_mode(mut self, mode: FlashMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    fn resolve_tier(&self, preference: StoragePreference) -> Tier {
        if self.namespace.is_empty() || self.key.is_empty() {
            return Tier::None;
        }
        if validate_key(self.namespace).is_err() || validate_key(self.key).is_err() {
            return Tier::None;
        }
        if self.fast_capable && preference == StoragePreference::FastMemory {
            Tier::FastMemory
        } else {
            Tier::Flash
        }
    }

    /// Bind to a tier and load the persisted value.
    ///
    /// Storage errors are logged and leave the default in place.
    pub fn init(&mut self, storage: &Storage) {
        self.tier = self.resolve_tier(storage.preference());
        self.value = self.default.clone();
        self.dirty = false;

        match self.tier {
            Tier::None => {
                error!(
                    "PersistentCell '{}/{}': no usable storage location, value will not persist",
                    self.namespace, self.key
                );
            }
            Tier::Flash if self.mode == FlashMode::Explicit => {
                debug!(
                    "PersistentCell '{}/{}': explicit mode, load deferred",
                    self.namespace, self.key
                );
            }
            _ => self.load(storage),
        }
    }

    fn load(&mut self, storage: &Storage) {
        match storage.load(self.tier, self.namespace, self.key) {
            Ok(Some(stored)) => match T::from_stored(stored) {
                Some(v) => self.value = v,
                None => warn!(
                    "PersistentCell '{}/{}': stored type mismatch, using default",
                    self.namespace, self.key
                ),
            },
            Ok(None) => {}
            Err(e) => warn!(
                "PersistentCell '{}/{}': load failed ({}), using default",
                self.namespace, self.key, e
            ),
        }
    }

    /// Cached value.
    pub fn get(&self) -> T {
        self.value.clone()
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Persist `value` and update the cache.
    ///
    /// Returns `Ok(false)` when nothing was written: the value equals the
    /// cache, or the cell has no tier.  On error the cache is unchanged.
    pub fn set(&mut self, storage: &mut Storage, value: T) -> Result<bool, StorageError> {
        if value == self.value {
            return Ok(false);
        }
        match self.tier {
            Tier::None => {
                warn!(
                    "PersistentCell '{}/{}': write dropped, no storage location",
                    self.namespace, self.key
                );
                Ok(false)
            }
            Tier::Flash if self.mode == FlashMode::Explicit => {
                self.value = value;
                self.dirty = true;
                Ok(true)
            }
            tier => {
                storage.store(tier, self.namespace, self.key, &value.to_stored())?;
                self.value = value;
                Ok(true)
            }
        }
    }

    /// Explicit mode: re-read the flash value, discarding unflushed writes.
    pub fn reload(&mut self, storage: &Storage) {
        if self.tier == Tier::None {
            return;
        }
        self.value = self.default.clone();
        self.dirty = false;
        self.load(storage);
    }

    /// Explicit mode: write the cached value if it changed since the last
    /// load or flush.
    pub fn flush(&mut self, storage: &mut Storage) -> Result<bool, StorageError> {
        if !self.dirty || self.tier == Tier::None {
            return Ok(false);
        }
        storage.store(self.tier, self.namespace, self.key, &self.value.to_stored())?;
        self.dirty = false;
        Ok(true)
    }
}

impl<T: Persistable> fmt::Debug for PersistentCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCell")
            .field("namespace", &self.namespace)
            .field("key", &self.key)
            .field("tier", &self.tier)
            .field("value", &self.value)
            .finish()
    }
}
