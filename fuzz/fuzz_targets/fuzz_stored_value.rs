//! Fuzz target: persisted value decoding and the RTC slot table
//!
//! Arbitrary bytes are decoded as a `StoredValue` and written into RTC
//! memory under keys derived from the input.  Checks:
//! - `StoredValue::decode` never panics
//! - A value that decodes re-encodes to bytes that decode to the same value
//! - The RTC table never reports more slots than it has
//!
//! cargo fuzz run fuzz_stored_value

#![no_main]

use iotnode::adapters::rtc::{RTC_SLOTS, RtcMemory};
use iotnode::app::ports::PersistentBackend;
use iotnode::persistent::StoredValue;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = StoredValue::decode(data) {
        if let Ok(bytes) = value.encode() {
            assert_eq!(StoredValue::decode(&bytes), Ok(value));
        }
    }

    let mut rtc = RtcMemory::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let key = format!("k{}", i % 40);
        let _ = rtc.write("fuzz", &key, chunk);
        let mut buf = [0u8; 64];
        if let Ok(len) = rtc.read("fuzz", &key, &mut buf) {
            assert_eq!(&buf[..len], chunk);
        }
    }
    assert!(rtc.used_slots() <= RTC_SLOTS);
});
