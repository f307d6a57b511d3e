//! Remotely updatable configuration.
//!
//! ```text
//!   server  ──GET config.json (If-None-Match / If-Modified-Since)──▶ 304: done
//!                                                                  200: reconcile
//!
//!   reconcile(document, token)
//!     for field in document:
//!       unknown key        → log, skip
//!       wire type mismatch → log, skip field
//!       differs from NVS   → write storage key
//!     no transient failure → write freshness token (last write)
//!     reload every registered cell from NVS
//! ```
//!
//! A [`ConfigCell`] owns its slot; the [`ConfigRegistry`] only keeps a
//! weak lookup by server-facing key.  Values are persisted on NVS in the
//! registry namespace under the cell's storage key, using the same
//! encoding as [`crate::persistent`].  A cell whose storage key is not a
//! valid NVS key lives in RAM only.
//!
//! The pass is not transactional against power loss.  Because the token
//! is written last, an interrupted pass leaves the old token in place and
//! the next fetch repeats it; every field write is idempotent.

use core::fmt;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::api::{ApiClient, ApiError};
use crate::app::ports::{StorageError, validate_key};
use crate::persistent::{Storage, StoredValue};

/// NVS key holding the config freshness token.
pub const DEFAULT_TOKEN_KEY: &str = "iotCfgToken";

// ── Values ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Int32,
    Bool,
    Str,
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32 => write!(f, "int32"),
            Self::Bool => write!(f, "bool"),
            Self::Str => write!(f, "string"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Int32(i32),
    Bool(bool),
    Str(String),
}

impl ConfigValue {
    pub fn kind(&self) -> ConfigKind {
        match self {
            Self::Int32(_) => ConfigKind::Int32,
            Self::Bool(_) => ConfigKind::Bool,
            Self::Str(_) => ConfigKind::Str,
        }
    }

    /// Exact wire-type match.  Floats, out-of-range integers, arrays,
    /// objects and null are rejected, never coerced.
    pub fn from_json(wire: &Value, kind: ConfigKind) -> Option<Self> {
        match (kind, wire) {
            (ConfigKind::Int32, Value::Number(n)) => {
                n.as_i64().and_then(|v| i32::try_from(v).ok()).map(Self::Int32)
            }
            (ConfigKind::Bool, Value::Bool(b)) => Some(Self::Bool(*b)),
            (ConfigKind::Str, Value::String(s)) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    fn to_stored(&self) -> StoredValue {
        match self {
            Self::Int32(v) => StoredValue::I32(*v),
            Self::Bool(v) => StoredValue::Bool(*v),
            Self::Str(v) => StoredValue::Str(v.clone()),
        }
    }

    fn from_stored(stored: StoredValue, kind: ConfigKind) -> Option<Self> {
        match (kind, stored) {
            (ConfigKind::Int32, StoredValue::I32(v)) => Some(Self::Int32(v)),
            (ConfigKind::Bool, StoredValue::Bool(v)) => Some(Self::Bool(v)),
            (ConfigKind::Str, StoredValue::Str(v)) => Some(Self::Str(v)),
            _ => None,
        }
    }
}

/// Rust types a [`ConfigCell`] can hold.
pub trait ConfigType: Clone + PartialEq + fmt::Debug {
    fn into_value(self) -> ConfigValue;

    fn from_value(value: &ConfigValue) -> Option<Self>;
}

impl ConfigType for i32 {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Int32(self)
    }

    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Int32(v) => Some(*v),
            _ => None,
        }
    }
}

impl ConfigType for bool {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Bool(self)
    }

    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl ConfigType for String {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Str(self)
    }

    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

// ── Freshness token ───────────────────────────────────────────

/// `(ETag, Last-Modified)` pair round-tripped as
/// `If-None-Match` / `If-Modified-Since`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreshnessToken {
    pub etag: String,
    pub last_modified: String,
}

impl FreshnessToken {
    pub fn new(etag: impl Into<String>, last_modified: impl Into<String>) -> Self {
        Self {
            etag: etag.into(),
            last_modified: last_modified.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_empty() && self.last_modified.is_empty()
    }

    /// Absent, mistyped or unreadable tokens load as empty.
    pub(crate) fn load(storage: &Storage, namespace: &str, key: &str) -> Self {
        match storage.load_flash(namespace, key) {
            Ok(Some(StoredValue::Pair(etag, last_modified))) => Self { etag, last_modified },
            Ok(_) => Self::default(),
            Err(e) => {
                warn!("Freshness token {}/{}: read failed: {}", namespace, key, e);
                Self::default()
            }
        }
    }

    /// Both halves go out in one write.  Returns whether a write happened.
    pub(crate) fn store(
        &self,
        storage: &mut Storage,
        namespace: &str,
        key: &str,
    ) -> Result<bool, StorageError> {
        if Self::load(storage, namespace, key) == *self {
            return Ok(false);
        }
        let pair = StoredValue::Pair(self.etag.clone(), self.last_modified.clone());
        storage.store_flash(namespace, key, &pair)?;
        Ok(true)
    }
}

// ── Cells ─────────────────────────────────────────────────────

#[derive(Debug)]
struct ConfigSlot {
    config_key: &'static str,
    storage_key: &'static str,
    namespace: &'static str,
    /// False when the storage key is unusable; the value is RAM-only.
    persistent: bool,
    default: ConfigValue,
    current: ConfigValue,
}

impl ConfigSlot {
    fn kind(&self) -> ConfigKind {
        self.default.kind()
    }

    fn load(&mut self, storage: &Storage) {
        if !self.persistent {
            return;
        }
        self.current = match storage.load_flash(self.namespace, self.storage_key) {
            Ok(Some(stored)) => match ConfigValue::from_stored(stored, self.kind()) {
                Some(v) => v,
                None => {
                    warn!(
                        "Config '{}': stored value under '{}' is not {}, using default",
                        self.config_key,
                        self.storage_key,
                        self.kind()
                    );
                    self.default.clone()
                }
            },
            Ok(None) => self.default.clone(),
            Err(e) => {
                warn!("Config '{}': load failed ({}), using default", self.config_key, e);
                self.default.clone()
            }
        };
    }
}

/// A named, typed, remotely updatable value with a default.
pub struct ConfigCell<T: ConfigType> {
    slot: Rc<RefCell<ConfigSlot>>,
    default: T,
}

impl<T: ConfigType> ConfigCell<T> {
    /// Register a cell whose server-facing name differs from its NVS key.
    pub fn new(
        registry: &mut ConfigRegistry,
        config_key: &'static str,
        storage_key: &'static str,
        default: T,
    ) -> Self {
        let value = default.clone().into_value();
        let persistent =
            validate_key(registry.namespace).is_ok() && validate_key(storage_key).is_ok();
        if !persistent {
            error!(
                "Config '{}': '{}/{}' is not a usable NVS key, value will not persist",
                config_key, registry.namespace, storage_key
            );
        }
        let slot = Rc::new(RefCell::new(ConfigSlot {
            config_key,
            storage_key,
            namespace: registry.namespace,
            persistent,
            default: value.clone(),
            current: value,
        }));
        registry.register(config_key, &slot);
        Self { slot, default }
    }

    /// Register a cell that uses the same name on the server and in NVS.
    pub fn with_key(registry: &mut ConfigRegistry, key: &'static str, default: T) -> Self {
        Self::new(registry, key, key, default)
    }

    pub fn get(&self) -> T {
        T::from_value(&self.slot.borrow().current).unwrap_or_else(|| self.default.clone())
    }

    pub fn config_key(&self) -> &'static str {
        self.slot.borrow().config_key
    }

    pub fn storage_key(&self) -> &'static str {
        self.slot.borrow().storage_key
    }

    /// Whether the value is backed by NVS.
    pub fn is_persistent(&self) -> bool {
        self.slot.borrow().persistent
    }

    /// Re-read this cell from NVS.
    pub fn load(&self, storage: &Storage) {
        self.slot.borrow_mut().load(storage);
    }

    /// Persist a local override.  Unchanged values are not written.
    pub fn set(&self, storage: &mut Storage, value: T) -> Result<bool, StorageError> {
        let value = value.into_value();
        let mut slot = self.slot.borrow_mut();
        if slot.current == value {
            return Ok(false);
        }
        if slot.persistent {
            storage.store_flash(slot.namespace, slot.storage_key, &value.to_stored())?;
        }
        slot.current = value;
        Ok(true)
    }
}

impl<T: ConfigType> fmt::Debug for ConfigCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.borrow();
        f.debug_struct("ConfigCell")
            .field("config_key", &slot.config_key)
            .field("storage_key", &slot.storage_key)
            .field("current", &slot.current)
            .finish()
    }
}

// ── Registry ──────────────────────────────────────────────────

/// Outcome of one reconciliation pass, by server-facing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub unknown: Vec<String>,
    pub mismatched: Vec<String>,
    /// Field writes the backend refused.
    pub failed: Vec<String>,
    /// Whether the freshness token was advanced.
    pub token_committed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigUpdate {
    /// Server answered 304; nothing was touched.
    NotModified,
    Updated(ReconcileReport),
}

pub struct ConfigRegistry {
    namespace: &'static str,
    token_key: &'static str,
    api_path: String,
    cells: BTreeMap<&'static str, Weak<RefCell<ConfigSlot>>>,
}

impl ConfigRegistry {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            namespace,
            token_key: DEFAULT_TOKEN_KEY,
            api_path: String::new(),
            cells: BTreeMap::new(),
        }
    }

    /// Override the NVS key that holds the freshness token.
    pub fn with_token_key(mut self, token_key: &'static str) -> Self {
        self.token_key = token_key;
        self
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn api_path(&self) -> &str {
        &self.api_path
    }

    /// Number of live registered cells.
    pub fn len(&self) -> usize {
        self.cells.values().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, config_key: &str) -> bool {
        self.cells
            .get(config_key)
            .is_some_and(|w| w.strong_count() > 0)
    }

    fn register(&mut self, config_key: &'static str, slot: &Rc<RefCell<ConfigSlot>>) {
        if let Some(prev) = self.cells.insert(config_key, Rc::downgrade(slot)) {
            if prev.strong_count() > 0 {
                warn!(
                    "Config: key '{}' registered twice, the later cell replaces the earlier one",
                    config_key
                );
            }
        }
    }

    /// Record the API path and load every cell from NVS.
    pub fn begin(&mut self, storage: &Storage, api_path: &str) {
        self.api_path = api_path.to_owned();
        self.load_all(storage);
        debug!("Config: {} cells loaded, api path '{}'", self.len(), self.api_path);
    }

    /// Push every cell's persisted value into its slot.  Dropped cells
    /// are pruned.
    pub fn load_all(&mut self, storage: &Storage) {
        self.cells.retain(|_, weak| match weak.upgrade() {
            Some(slot) => {
                slot.borrow_mut().load(storage);
                true
            }
            None => false,
        });
    }

    pub fn freshness_token(&self, storage: &Storage) -> FreshnessToken {
        FreshnessToken::load(storage, self.namespace, self.token_key)
    }

    /// Apply a downloaded config document.
    ///
    /// A document that is not valid JSON, or not an object, is rejected
    /// before any write.  Per-field problems skip only that field.  The
    /// token is written last, unless a field write hit a transient backend
    /// failure; then the next fetch repeats the document.
    pub fn reconcile_document(
        &mut self,
        storage: &mut Storage,
        document: &str,
        token: &FreshnessToken,
    ) -> Result<ReconcileReport, ConfigError> {
        let doc: Value = serde_json::from_str(document).map_err(|e| {
            warn!("Config: document rejected, JSON decode failed: {}", e);
            ConfigError::Malformed
        })?;
        let Value::Object(fields) = doc else {
            warn!("Config: document rejected, top level is not an object");
            return Err(ConfigError::NotAnObject);
        };

        let mut report = ReconcileReport::default();
        let mut retry = false;
        for (name, wire) in &fields {
            let Some(slot) = self.cells.get(name.as_str()).and_then(Weak::upgrade) else {
                info!("Config: ignoring unknown key '{}'", name);
                report.unknown.push(name.clone());
                continue;
            };
            let (kind, storage_key, persistent) = {
                let s = slot.borrow();
                (s.kind(), s.storage_key, s.persistent)
            };

            let Some(value) = ConfigValue::from_json(wire, kind) else {
                warn!("Config: '{}' expects {}, got {}, skipped", name, kind, wire);
                report.mismatched.push(name.clone());
                continue;
            };

            if !persistent {
                let mut s = slot.borrow_mut();
                if s.current == value {
                    report.unchanged.push(name.clone());
                } else {
                    info!("Config: '{}' = {:?} (RAM only)", name, value);
                    s.current = value;
                    report.updated.push(name.clone());
                }
                continue;
            }

            let stored = match storage.load_flash(self.namespace, storage_key) {
                Ok(v) => v.and_then(|v| ConfigValue::from_stored(v, kind)),
                Err(e) => {
                    warn!("Config: reading '{}' failed ({}), rewriting", storage_key, e);
                    None
                }
            };
            if stored.as_ref() == Some(&value) {
                report.unchanged.push(name.clone());
                continue;
            }

            let encoded = value.to_stored();
            if let Err(e) = encoded.encode() {
                warn!("Config: '{}' cannot be stored ({}), skipped", name, e);
                report.failed.push(name.clone());
                continue;
            }
            match storage.store_flash(self.namespace, storage_key, &encoded) {
                Ok(()) => {
                    info!("Config: '{}' = {:?}", name, value);
                    report.updated.push(name.clone());
                }
                Err(e) => {
                    warn!("Config: writing '{}' failed: {}", storage_key, e);
                    retry |= e.is_transient();
                    report.failed.push(name.clone());
                }
            }
        }

        if retry {
            warn!("Config: field writes failed, freshness token not advanced");
        } else {
            match token.store(storage, self.namespace, self.token_key) {
                Ok(_) => report.token_committed = true,
                Err(e) => warn!("Config: storing freshness token failed: {}", e),
            }
        }

        self.load_all(storage);
        Ok(report)
    }

    /// Conditional fetch of the config document.  A 304 short-circuits
    /// without touching storage.
    pub fn update_config(
        &mut self,
        storage: &mut Storage,
        api: &mut ApiClient,
    ) -> Result<ConfigUpdate, ConfigError> {
        if self.api_path.is_empty() {
            return Err(ConfigError::NotConfigured);
        }
        let token = self.freshness_token(storage);
        let path = self.api_path.clone();
        let response = api.conditional_get(storage, &path, &token)?;

        match response.status {
            304 => {
                info!("Config: not modified (etag '{}')", token.etag);
                Ok(ConfigUpdate::NotModified)
            }
            _ if response.is_success() => {
                let fresh = response.freshness_token();
                let report = self.reconcile_document(storage, response.body_str(), &fresh)?;
                Ok(ConfigUpdate::Updated(report))
            }
            status => Err(ConfigError::Api(ApiError::Status(status))),
        }
    }

    // ── Raw accessors by storage key ──────────────────────────

    pub fn get_int(&self, storage: &Storage, key: &str, default: i32) -> i32 {
        match storage.load_flash(self.namespace, key) {
            Ok(Some(StoredValue::I32(v))) => v,
            _ => default,
        }
    }

    pub fn set_int(
        &self,
        storage: &mut Storage,
        key: &str,
        value: i32,
    ) -> Result<bool, StorageError> {
        self.put_raw(storage, key, StoredValue::I32(value))
    }

    pub fn get_bool(&self, storage: &Storage, key: &str, default: bool) -> bool {
        match storage.load_flash(self.namespace, key) {
            Ok(Some(StoredValue::Bool(v))) => v,
            _ => default,
        }
    }

    pub fn set_bool(
        &self,
        storage: &mut Storage,
        key: &str,
        value: bool,
    ) -> Result<bool, StorageError> {
        self.put_raw(storage, key, StoredValue::Bool(value))
    }

    pub fn get_string(&self, storage: &Storage, key: &str, default: &str) -> String {
        match storage.load_flash(self.namespace, key) {
            Ok(Some(StoredValue::Str(v))) => v,
            _ => default.to_owned(),
        }
    }

    pub fn set_string(
        &self,
        storage: &mut Storage,
        key: &str,
        value: &str,
    ) -> Result<bool, StorageError> {
        self.put_raw(storage, key, StoredValue::Str(value.to_owned()))
    }

    fn put_raw(
        &self,
        storage: &mut Storage,
        key: &str,
        value: StoredValue,
    ) -> Result<bool, StorageError> {
        if storage.load_flash(self.namespace, key).ok().flatten().as_ref() == Some(&value) {
            return Ok(false);
        }
        storage.store_flash(self.namespace, key, &value)?;
        Ok(true)
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Document is not valid JSON.
    Malformed,
    /// Document is valid JSON but not a flat object.
    NotAnObject,
    /// `update_config` called before `begin` set an API path.
    NotConfigured,
    Storage(StorageError),
    Api(ApiError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "config document is not valid JSON"),
            Self::NotAnObject => write!(f, "config document is not a JSON object"),
            Self::NotConfigured => write!(f, "config registry has no API path"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Api(e) => write!(f, "api: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<StorageError> for ConfigError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ApiError> for ConfigError {
    fn from(e: ApiError) -> Self {
        Self::Api(e)
    }
}
