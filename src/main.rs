//! iotnode firmware: one measurement cycle per wakeup.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Adapters (outer ring)                    │
//! │                                                              │
//! │  Esp32Clock   EspSystem        EspHttpTransport  EspFirmware │
//! │  (Clock)      (System+Power)   (HttpTransport)   (Firmware)  │
//! │  NvsAdapter + RtcMemory (Storage)     WifiAdapter            │
//! │                                                              │
//! │  ──────────────── Port Trait Boundary ─────────────────      │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ DeviceRuntime: cells · config registry · backoff · API │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! boot → begin → WiFi → NTP → provisioning → config → firmware →
//! telemetry → deep sleep.  Anything fatal ends the cycle through the
//! runtime's panic path, which sleeps with an escalating backoff.

#![deny(unused_must_use)]

use core::ops::ControlFlow;
use core::time::Duration;

use anyhow::{Result, anyhow};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::peripherals::Peripherals;
use log::{info, warn};

use iotnode::adapters::firmware::EspFirmware;
use iotnode::adapters::hardware::EspSystem;
use iotnode::adapters::http::EspHttpTransport;
use iotnode::adapters::nvs::NvsAdapter;
use iotnode::adapters::rtc::RtcMemory;
use iotnode::adapters::time::Esp32Clock;
use iotnode::adapters::wifi::WifiAdapter;
use iotnode::config::RuntimeOptions;
use iotnode::logger::LogLevel;
use iotnode::persistent::Storage;
use iotnode::runtime::{CycleEnd, DeviceRuntime, FirmwareUpdate, Platform};

const WIFI_SSID: &str = build_env(option_env!("IOTNODE_WIFI_SSID"));
const WIFI_PASSWORD: &str = build_env(option_env!("IOTNODE_WIFI_PASSWORD"));
const API_BASE_URL: &str = build_env(option_env!("IOTNODE_API_URL"));
const PROJECT: &str = build_env(option_env!("IOTNODE_PROJECT"));
const PROVISIONING_TOKEN: Option<&str> = option_env!("IOTNODE_PROVISIONING_TOKEN");

const WIFI_TIMEOUT: Duration = Duration::from_secs(10);

/// Build-time setting, empty when unset.
const fn build_env(value: Option<&'static str>) -> &'static str {
    match value {
        Some(v) => v,
        None => "",
    }
}

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;
    info!("iotnode v{}", env!("CARGO_PKG_VERSION"));
    EspFirmware::mark_running_valid();

    // ── 2. Storage tiers ──────────────────────────────────────
    let nvs = NvsAdapter::new().map_err(|e| anyhow!("NVS init failed: {e}"))?;
    let rtc = RtcMemory::take().ok_or_else(|| anyhow!("RTC region already claimed"))?;
    let storage = Storage::new(Box::new(rtc), Box::new(nvs));

    // ── 3. Runtime ────────────────────────────────────────────
    let options = RuntimeOptions {
        api_base_url: API_BASE_URL.to_owned(),
        project: PROJECT.to_owned(),
        provisioning_token: PROVISIONING_TOKEN.map(str::to_owned),
        ..RuntimeOptions::default()
    };
    let platform = Platform {
        clock: Box::new(Esp32Clock::new()),
        system: Box::new(EspSystem::new()),
        power: Box::new(EspSystem::new()),
        firmware: Box::new(EspFirmware::new()),
    };
    let mut rt = DeviceRuntime::new(platform, storage, Box::new(EspHttpTransport::new()), options);
    if let ControlFlow::Break(end) = rt.begin() {
        info!("Cycle ended during startup: {}", end);
        return Ok(());
    }

    // ── 4. Network ────────────────────────────────────────────
    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let mut wifi = WifiAdapter::new(peripherals.modem, sys_loop, None)?;
    let hostname = rt.device_id().to_owned();
    if let Err(e) = wifi.connect(WIFI_SSID, WIFI_PASSWORD, &hostname, WIFI_TIMEOUT) {
        let end = rt.panic(format_args!("WiFi unavailable: {}", e));
        info!("Cycle ended: {}", end);
        return Ok(());
    }

    // ── 5. Cycle ──────────────────────────────────────────────
    let end = run_cycle(&mut rt);
    info!("Cycle ended: {}", end);
    Ok(())
}

fn run_cycle(rt: &mut DeviceRuntime) -> CycleEnd {
    if !rt.sync_time() {
        warn!("Continuing without wall-clock time");
    }
    rt.feed_watchdog();

    match rt.update_provisioning(false) {
        Ok(true) => info!("Device provisioned"),
        Ok(false) => {}
        Err(e) => return rt.panic(format_args!("provisioning failed: {}", e)),
    }

    if let Err(e) = rt.update_config() {
        rt.log(LogLevel::Warning, "main", format_args!("config update failed: {}", e));
    }
    rt.feed_watchdog();

    match rt.update_firmware() {
        Ok(FirmwareUpdate::Installed) => return rt.restart(false),
        Ok(FirmwareUpdate::UpToDate) => {}
        Err(e) => return rt.panic(format_args!("firmware update failed: {}", e)),
    }

    match rt.post_system_telemetry("system") {
        Ok(status) if (200..300).contains(&status) => {}
        Ok(status) => {
            rt.log(LogLevel::Warning, "main", format_args!("telemetry status {}", status));
        }
        Err(e) => return rt.panic(format_args!("telemetry failed: {}", e)),
    }

    rt.sleep()
}
