//! Fuzz target: `ConfigRegistry::reconcile_document`
//!
//! Feeds arbitrary bytes as a downloaded config document and checks:
//! - No panics under any input
//! - A rejected document performs no NVS write
//! - Cells only ever hold their default or a value of their own type
//!
//! cargo fuzz run fuzz_config_document

#![no_main]

use iotnode::adapters::nvs::NvsAdapter;
use iotnode::adapters::rtc::RtcMemory;
use iotnode::persistent::Storage;
use iotnode::remote_config::{ConfigCell, ConfigRegistry, FreshnessToken};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };

    let nvs = NvsAdapter::default();
    let mut storage = Storage::new(Box::new(RtcMemory::new()), Box::new(nvs.clone()));
    let mut registry = ConfigRegistry::new("fuzz");
    let sleep = ConfigCell::with_key(&mut registry, "sleep_s", 300);
    let enabled = ConfigCell::with_key(&mut registry, "enabled", true);
    let label = ConfigCell::with_key(&mut registry, "label", String::from("node"));
    registry.begin(&storage, "cfg");

    let token = FreshnessToken::new("\"fuzz\"", "");
    match registry.reconcile_document(&mut storage, text, &token) {
        Ok(report) => {
            // Only oversized strings fail, and those never hold back the token.
            assert!(report.token_committed);
        }
        Err(_) => assert_eq!(nvs.write_count(), 0, "rejected document must not write"),
    }

    // Reading back through a fresh registry sees exactly what the cells hold.
    let mut again = ConfigRegistry::new("fuzz");
    let sleep2 = ConfigCell::with_key(&mut again, "sleep_s", 300);
    let enabled2 = ConfigCell::with_key(&mut again, "enabled", true);
    let label2 = ConfigCell::with_key(&mut again, "label", String::from("node"));
    again.begin(&storage, "cfg");
    assert_eq!(sleep.get(), sleep2.get());
    assert_eq!(enabled.get(), enabled2.get());
    assert_eq!(label.get(), label2.get());
});
