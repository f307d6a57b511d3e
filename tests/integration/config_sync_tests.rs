//! Config registry reconciliation and conditional fetch.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use iotnode::adapters::nvs::NvsAdapter;
use iotnode::adapters::rtc::RtcMemory;
use iotnode::api::{ApiClient, ApiError};
use iotnode::app::ports::{PersistentBackend, StorageError, TransportError};
use iotnode::persistent::{Storage, StoredValue};
use iotnode::remote_config::{
    ConfigCell, ConfigError, ConfigRegistry, ConfigUpdate, DEFAULT_TOKEN_KEY, FreshnessToken,
    ReconcileReport,
};

use crate::mock_platform::ScriptedTransport;

const API_BASE: &str = "https://iot.example.com/api";
const CONFIG_PATH: &str = "file/{project}/{device}/config.json";
const OLD_DATE: &str = "Mon, 01 Jan 2024 00:00:00 GMT";
const NEW_DATE: &str = "Tue, 02 Jan 2024 00:00:00 GMT";

/// NVS that records the key of every successful write, in order.
#[derive(Clone, Default)]
struct RecordingFlash {
    inner: NvsAdapter,
    writes: Rc<RefCell<Vec<String>>>,
}

impl RecordingFlash {
    fn writes(&self) -> Vec<String> {
        self.writes.borrow().clone()
    }

    fn clear(&self) {
        self.writes.borrow_mut().clear();
    }
}

impl PersistentBackend for RecordingFlash {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.inner.read(namespace, key, buf)
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.inner.write(namespace, key, data)?;
        self.writes.borrow_mut().push(key.to_owned());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.inner.delete(namespace, key)
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.inner.exists(namespace, key)
    }
}

struct Fixture {
    flash: RecordingFlash,
    transport: ScriptedTransport,
    storage: Storage,
    registry: ConfigRegistry,
    api: ApiClient,
    a: ConfigCell<i32>,
    b: ConfigCell<String>,
    enabled: ConfigCell<bool>,
}

impl Fixture {
    fn new() -> Self {
        let flash = RecordingFlash::default();
        let transport = ScriptedTransport::connected();
        let storage = Storage::new(Box::new(RtcMemory::new()), Box::new(flash.clone()));

        let mut registry = ConfigRegistry::new("iot");
        let a = ConfigCell::with_key(&mut registry, "a", 0);
        let b = ConfigCell::with_key(&mut registry, "b", String::from("init"));
        let enabled = ConfigCell::new(&mut registry, "enabled", "enabledFlg", false);
        registry.begin(&storage, CONFIG_PATH);

        let mut api = ApiClient::new(API_BASE, "garden", Box::new(transport.clone()));
        api.set_device_name("e32-0001");

        Self { flash, transport, storage, registry, api, a, b, enabled }
    }

    fn reconcile(
        &mut self,
        document: &str,
        token: &FreshnessToken,
    ) -> Result<ReconcileReport, ConfigError> {
        self.registry.reconcile_document(&mut self.storage, document, token)
    }

    fn update(&mut self) -> Result<ConfigUpdate, ConfigError> {
        self.registry.update_config(&mut self.storage, &mut self.api)
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.flash.inner.snapshot()
    }
}

fn token(etag: &str, date: &str) -> FreshnessToken {
    FreshnessToken::new(etag, date)
}

// ── Reconciliation ────────────────────────────────────────────

#[test]
fn known_fields_update_and_unknown_are_ignored() {
    let mut f = Fixture::new();
    let report = f.reconcile(r#"{"a":1,"b":"x","unknown":5}"#, &token("\"v1\"", "")).unwrap();

    assert_eq!(report.updated, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(report.unknown, vec!["unknown".to_owned()]);
    assert!(report.token_committed);
    assert_eq!(f.a.get(), 1);
    assert_eq!(f.b.get(), "x");
    assert_eq!(f.registry.freshness_token(&f.storage).etag, "\"v1\"");
}

#[test]
fn mismatched_field_is_skipped_alone() {
    let mut f = Fixture::new();
    f.reconcile(r#"{"a":7}"#, &token("\"v1\"", "")).unwrap();

    let report = f
        .reconcile(r#"{"a":"notanint","b":"still applies"}"#, &token("\"v2\"", ""))
        .unwrap();
    assert_eq!(report.mismatched, vec!["a".to_owned()]);
    assert_eq!(report.updated, vec!["b".to_owned()]);
    assert_eq!(f.a.get(), 7);
    assert_eq!(f.b.get(), "still applies");
}

#[test]
fn wire_types_are_matched_strictly() {
    let mut f = Fixture::new();
    let report = f
        .reconcile(r#"{"a":4294967296,"enabled":1,"b":true}"#, &token("", ""))
        .unwrap();

    assert_eq!(report.mismatched, vec!["a".to_owned(), "b".to_owned(), "enabled".to_owned()]);
    assert!(report.updated.is_empty());
    assert_eq!(f.a.get(), 0);
    assert!(!f.enabled.get());
}

#[test]
fn server_name_maps_to_storage_key() {
    let mut f = Fixture::new();
    f.reconcile(r#"{"enabled":true}"#, &token("", "")).unwrap();

    assert!(f.enabled.get());
    assert!(f.flash.writes().contains(&"enabledFlg".to_owned()));
    assert_eq!(f.storage.load_flash("iot", "enabledFlg"), Ok(Some(StoredValue::Bool(true))));
}

#[test]
fn unchanged_values_are_not_rewritten() {
    let mut f = Fixture::new();
    f.reconcile(r#"{"a":3,"b":"y"}"#, &token("\"v1\"", OLD_DATE)).unwrap();
    f.flash.clear();

    let report = f.reconcile(r#"{"a":3,"b":"y"}"#, &token("\"v1\"", OLD_DATE)).unwrap();
    assert_eq!(report.unchanged, vec!["a".to_owned(), "b".to_owned()]);
    assert!(f.flash.writes().is_empty());
}

#[test]
fn malformed_document_writes_nothing() {
    let mut f = Fixture::new();
    f.reconcile(r#"{"a":1}"#, &token("\"v1\"", "")).unwrap();
    let before = f.snapshot();

    assert_eq!(f.reconcile(r#"{"a":2,"#, &token("\"v2\"", "")), Err(ConfigError::Malformed));
    assert_eq!(f.reconcile("[1,2,3]", &token("\"v2\"", "")), Err(ConfigError::NotAnObject));
    assert_eq!(f.snapshot(), before);
    assert_eq!(f.a.get(), 1);
}

#[test]
fn failed_field_write_keeps_old_token() {
    let mut f = Fixture::new();
    f.reconcile(r#"{"a":1}"#, &token("\"v1\"", "")).unwrap();

    f.flash.inner.set_fail_writes(true);
    let report = f.reconcile(r#"{"a":2}"#, &token("\"v2\"", "")).unwrap();
    f.flash.inner.set_fail_writes(false);

    assert_eq!(report.failed, vec!["a".to_owned()]);
    assert!(!report.token_committed);
    assert_eq!(f.a.get(), 1);
    assert_eq!(f.registry.freshness_token(&f.storage).etag, "\"v1\"");
}

#[test]
fn dropped_cells_stop_receiving_updates() {
    let mut f = Fixture::new();
    let extra = ConfigCell::with_key(&mut f.registry, "extra", 5);
    assert!(f.registry.is_registered("extra"));
    drop(extra);

    let report = f.reconcile(r#"{"extra":9}"#, &token("", "")).unwrap();
    assert_eq!(report.unknown, vec!["extra".to_owned()]);
}

// ── Conditional fetch ─────────────────────────────────────────

#[test]
fn not_modified_leaves_storage_byte_identical() {
    let mut f = Fixture::new();
    f.reconcile(r#"{"a":1,"b":"x"}"#, &token("\"v1\"", OLD_DATE)).unwrap();
    let before = f.snapshot();

    f.transport.reply(304, &[], "");
    assert_eq!(f.update(), Ok(ConfigUpdate::NotModified));
    assert_eq!(f.snapshot(), before);

    let sent = f.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].url, "https://iot.example.com/api/file/garden/e32-0001/config.json");
    assert_eq!(sent[0].header("If-None-Match"), Some("\"v1\""));
    assert_eq!(sent[0].header("If-Modified-Since"), Some(OLD_DATE));
}

#[test]
fn new_document_writes_token_last() {
    let mut f = Fixture::new();
    f.reconcile(r#"{"a":1,"b":"x"}"#, &token("\"v1\"", OLD_DATE)).unwrap();
    f.flash.clear();

    f.transport.reply(
        200,
        &[("ETag", "\"v2\""), ("Last-Modified", NEW_DATE)],
        r#"{"a":2,"b":"z"}"#,
    );
    let Ok(ConfigUpdate::Updated(report)) = f.update() else {
        panic!("expected an update");
    };
    assert!(report.token_committed);
    assert_eq!(f.a.get(), 2);
    assert_eq!(f.b.get(), "z");

    let writes = f.flash.writes();
    assert_eq!(writes, vec!["a", "b", DEFAULT_TOKEN_KEY]);
    assert_eq!(f.registry.freshness_token(&f.storage), token("\"v2\"", NEW_DATE));
}

#[test]
fn ram_only_cell_does_not_block_not_modified() {
    let mut f = Fixture::new();
    let long = ConfigCell::new(&mut f.registry, "long", "storage_key_too_long", 0);
    assert!(!long.is_persistent());

    f.transport.reply(200, &[("ETag", "\"v1\"")], r#"{"a":5,"long":1}"#);
    let Ok(ConfigUpdate::Updated(report)) = f.update() else {
        panic!("expected an update");
    };
    assert!(report.token_committed);
    assert_eq!(report.updated, vec!["a".to_owned(), "long".to_owned()]);
    assert_eq!(long.get(), 1);
    assert!(!f.flash.writes().contains(&"storage_key_too_long".to_owned()));

    f.transport.reply(304, &[], "");
    assert_eq!(f.update(), Ok(ConfigUpdate::NotModified));
    assert_eq!(f.transport.sent()[1].header("If-None-Match"), Some("\"v1\""));
}

#[test]
fn server_error_is_reported_without_writes() {
    let mut f = Fixture::new();
    f.transport.reply(500, &[], "oops");
    assert_eq!(f.update(), Err(ConfigError::Api(ApiError::Status(500))));
    assert!(f.flash.writes().is_empty());
}

#[test]
fn transport_failure_is_reported() {
    let mut f = Fixture::new();
    f.transport.fail(TransportError::Timeout);
    assert_eq!(
        f.update(),
        Err(ConfigError::Api(ApiError::Transport(TransportError::Timeout)))
    );
}

#[test]
fn garbage_body_keeps_old_config() {
    let mut f = Fixture::new();
    f.reconcile(r#"{"a":1}"#, &token("\"v1\"", "")).unwrap();
    f.flash.clear();

    f.transport.reply(200, &[("ETag", "\"v2\"")], "<html>proxy error</html>");
    assert_eq!(f.update(), Err(ConfigError::Malformed));
    assert!(f.flash.writes().is_empty());
    assert_eq!(f.registry.freshness_token(&f.storage).etag, "\"v1\"");
}

#[test]
fn fetch_before_begin_is_rejected() {
    let transport = ScriptedTransport::connected();
    let mut storage =
        Storage::new(Box::new(RtcMemory::new()), Box::new(NvsAdapter::default()));
    let mut registry = ConfigRegistry::new("iot");
    let mut api = ApiClient::new(API_BASE, "garden", Box::new(transport.clone()));

    assert_eq!(
        registry.update_config(&mut storage, &mut api),
        Err(ConfigError::NotConfigured)
    );
    assert!(transport.sent().is_empty());
}
