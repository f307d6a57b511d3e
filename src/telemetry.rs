//! System telemetry payload.
//!
//! Posted to `telemetry/{project}/{device}/{kind}` once per cycle.  Field
//! names are part of the server contract, hence the renames.

use chrono::DateTime;
use serde::Serialize;

use crate::util::round2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemTelemetry {
    /// Volts, two decimals.  `null` when no battery pin is configured.
    #[serde(rename = "battery_V")]
    pub battery_v: Option<f64>,
    pub wifi_rssi: Option<i8>,
    pub boot_count: u32,
    pub active_ms: i64,
    #[serde(rename = "lastSleep_s")]
    pub last_sleep_s: i64,
    pub time: String,
    pub firmware_version: String,
    pub firmware_sha256: String,
}

impl SystemTelemetry {
    pub fn battery_from_millivolts(mv: Option<i32>) -> Option<f64> {
        mv.map(|mv| round2(f64::from(mv) / 1000.0))
    }

    pub fn to_json(&self) -> String {
        // Only plain numbers and strings: serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// `YYYY-MM-DDTHH:MM:SSZ` for a Unix timestamp in seconds.
pub fn iso_time(unix_secs: i64) -> String {
    DateTime::from_timestamp(unix_secs, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}
