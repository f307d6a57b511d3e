//! DeviceRuntime boot cycles against mock ports.

use std::ops::ControlFlow;
use std::time::Duration;

use iotnode::app::ports::{FirmwareError, Method};
use iotnode::backoff::BackoffState;
use iotnode::drivers::watchdog::Watchdog;
use iotnode::logger::LogLevel;
use iotnode::remote_config::ConfigUpdate;
use iotnode::runtime::boot::ResetReason;
use iotnode::runtime::{CycleEnd, FirmwareUpdate, Lifecycle, PanicAction};
use iotnode::Error;

use crate::mock_platform::{PowerCall, Rig, SYNCED_EPOCH};

const DEVICE: &str = "e32-246f28aabb01";

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn panic_sleep(s: u64) -> CycleEnd {
    CycleEnd::DeepSleep { duration: secs(s), panic: true }
}

// ── First boot ────────────────────────────────────────────────

#[test]
fn first_boot_counts_one_and_reports_it() {
    let rig = Rig::new();
    let mut rt = rig.boot();

    assert_eq!(rt.boot_count(), 1);
    assert_eq!(rt.backoff_state(), BackoffState::Normal);
    assert_eq!(rt.device_id(), DEVICE);
    assert_eq!(rt.begin(), ControlFlow::Continue(()));
    assert_eq!(rt.lifecycle(), Lifecycle::Active);

    assert_eq!(rt.post_system_telemetry("system"), Ok(200));
    let sent = rig.transport.sent();
    let post = sent.last().expect("telemetry request");
    assert_eq!(post.method, Method::Post);
    assert_eq!(
        post.url,
        format!("https://iot.example.com/api/telemetry/garden/{DEVICE}/system")
    );

    let json: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
    assert_eq!(json["boot_count"], 1);
    assert_eq!(json["battery_V"], 4.0);
    assert_eq!(json["wifi_rssi"], -58);
    assert_eq!(json["active_ms"], 0);
    assert_eq!(json["lastSleep_s"], 0);
    assert_eq!(json["firmware_sha256"], "ab".repeat(32));
}

#[test]
fn boot_count_survives_sleep_but_not_power_loss() {
    let rig = Rig::new();
    for expected in 1..=3 {
        let mut rt = rig.boot();
        assert_eq!(rt.boot_count(), expected);
        let _ = rt.sleep();
    }

    rig.rtc.power_cycle();
    assert_eq!(rig.boot().boot_count(), 1);
}

#[test]
fn cycle_accounting_is_reported_next_cycle() {
    let rig = Rig::new();
    rig.clock.advance(500);
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    rig.clock.advance(1234);
    assert_eq!(
        rt.deep_sleep(secs(120), false),
        CycleEnd::DeepSleep { duration: secs(120), panic: false }
    );
    assert_eq!(rig.power.calls(), vec![PowerCall::DeepSleep(secs(120))]);

    let mut rt = rig.boot();
    assert_eq!(rt.boot_count(), 2);
    assert_eq!(rt.last_active_ms(), 1234);
    assert_eq!(rt.last_sleep_s(), 120);

    assert!(rt.begin().is_continue());
    let t = rt.system_telemetry();
    assert_eq!(t.active_ms, 1234);
    assert_eq!(t.last_sleep_s, 120);
}

// ── Battery gate ──────────────────────────────────────────────

#[test]
fn low_battery_shuts_down_without_network() {
    let rig = Rig::new();
    rig.preset_config("batMinMv", 3300);
    rig.system.set_adc_millivolts(Some(1550)); // ×2 = 3100 mV

    let mut rt = rig.boot();
    assert_eq!(rt.begin(), ControlFlow::Break(CycleEnd::Shutdown { panic: false }));

    assert!(rig.transport.sent().is_empty());
    assert_eq!(rig.power.calls(), vec![PowerCall::PowerOff]);
    assert_eq!(rt.lifecycle(), Lifecycle::Ended(CycleEnd::Shutdown { panic: false }));
    assert_eq!(rig.boot().backoff_state(), BackoffState::Normal);
}

#[test]
fn sufficient_battery_passes_gate() {
    let rig = Rig::new();
    rig.preset_config("batMinMv", 3300);
    rig.system.set_adc_millivolts(Some(1700)); // ×2 = 3400 mV

    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    assert_eq!(rt.battery_millivolts(), Some(3400));
    assert!(rig.power.calls().is_empty());
}

#[test]
fn battery_reading_is_cached_per_cycle() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    assert_eq!(rt.battery_millivolts(), Some(4000));
    rig.system.set_adc_millivolts(Some(1000));
    assert_eq!(rt.battery_millivolts(), Some(4000));
    assert_eq!(rig.system.adc_reads(), 1);

    rt.invalidate_battery_cache();
    assert_eq!(rt.battery_millivolts(), Some(2000));
}

// ── Panic and backoff ─────────────────────────────────────────

#[test]
fn repeated_panics_escalate_until_a_clean_cycle() {
    let rig = Rig::new();
    rig.preset_config("panicSlpInit", 60);
    rig.preset_config("panicSlpFac", 2);
    rig.preset_config("panicSlpMax", 500);

    for expected in [60, 120, 240, 480, 500] {
        let mut rt = rig.boot();
        assert!(rt.begin().is_continue());
        assert_eq!(rt.panic(format_args!("server unreachable")), panic_sleep(expected));
    }
    assert_eq!(rig.boot().backoff_state(), BackoffState::Panicking(secs(500)));

    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    assert_eq!(rt.sleep(), CycleEnd::DeepSleep { duration: secs(300), panic: false });

    let mut rt = rig.boot();
    assert_eq!(rt.backoff_state(), BackoffState::Normal);
    assert!(rt.begin().is_continue());
    assert_eq!(rt.panic(format_args!("again")), panic_sleep(60));
}

#[test]
fn fault_reset_panics_during_construction() {
    let rig = Rig::new();
    rig.system.set_reset_reason(ResetReason::TaskWatchdog);

    let mut rt = rig.boot();
    assert_eq!(rt.cycle_end(), Some(panic_sleep(60)));
    assert_eq!(rt.begin(), ControlFlow::Break(panic_sleep(60)));
    assert!(rig.transport.sent().is_empty());
    assert_eq!(rig.power.calls(), vec![PowerCall::DeepSleep(secs(60))]);

    rig.system.set_reset_reason(ResetReason::Brownout);
    assert_eq!(rig.boot().cycle_end(), Some(panic_sleep(120)));

    rig.system.set_reset_reason(ResetReason::DeepSleep);
    assert_eq!(rig.boot().cycle_end(), None);
}

#[test]
fn panic_action_can_be_replaced() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    assert_eq!(rt.set_panic_action(PanicAction::Restart), PanicAction::EscalatingSleep);
    assert_eq!(rt.panic(format_args!("bad sensor")), CycleEnd::Restart { panic: true });
    assert_eq!(rig.power.calls(), vec![PowerCall::Restart]);
    assert_eq!(rig.boot().backoff_state(), BackoffState::Normal);
}

#[test]
fn terminal_calls_after_the_first_are_ignored() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    let first = rt.restart(false);
    assert_eq!(rt.sleep(), first);
    assert_eq!(rt.shutdown(true), first);
    assert_eq!(rt.panic(format_args!("late")), first);
    assert_eq!(rig.power.calls(), vec![PowerCall::Restart]);
    assert_eq!(rt.begin(), ControlFlow::Break(first));
}

#[test]
fn terminal_actions_wait_for_the_log_to_drain() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    let _ = rt.panic(format_args!("boom"));
    // panic flush, then the sleep flush
    assert_eq!(rig.clock.delays(), vec![50, 50]);
}

// ── Time ──────────────────────────────────────────────────────

#[test]
fn ntp_sync_records_timestamp() {
    let rig = Rig::new();
    rig.clock.set_sync_latency(Some(200));
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    assert!(rt.sync_time());
    assert!(rt.last_ntp_sync() >= SYNCED_EPOCH);
    assert!(rt.time_iso().starts_with("2023-11-14T22:13"));
    assert_eq!(rig.boot().last_ntp_sync(), rt.last_ntp_sync());
}

#[test]
fn ntp_sync_times_out() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    assert!(!rt.sync_time());
    assert_eq!(rt.last_ntp_sync(), 0);
    assert!(rt.active_duration_ms() >= 2000);
}

// ── Remote logging ────────────────────────────────────────────

#[test]
fn log_lines_are_forwarded_once_active() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    rt.log(LogLevel::Info, "app", format_args!("before begin"));
    assert!(rig.transport.sent().is_empty());

    assert!(rt.begin().is_continue());
    rig.clock.advance(42);
    rt.log(LogLevel::Info, "app", format_args!("moisture {}", 41));

    let sent = rig.transport.sent();
    let post = sent.last().expect("log request");
    assert_eq!(post.url, format!("https://iot.example.com/api/log/garden/{DEVICE}"));
    assert_eq!(post.header("content-type"), Some("text/plain"));
    assert_eq!(post.body, b"I (42) app: moisture 41");
}

#[test]
fn log_threshold_comes_from_config() {
    let rig = Rig::new();
    rig.preset_config("logLevel", LogLevel::Warning as i32);
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    rt.log(LogLevel::Info, "app", format_args!("chatty"));
    assert!(rig.transport.sent().is_empty());
    rt.log(LogLevel::Error, "app", format_args!("important"));
    assert_eq!(rig.transport.sent().len(), 1);
}

#[test]
fn disconnected_transport_keeps_logs_local() {
    let rig = Rig::new();
    rig.transport.set_connected(false);
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    rt.log(LogLevel::Error, "app", format_args!("offline"));
    assert!(rig.transport.sent().is_empty());
}

// ── Provisioning ──────────────────────────────────────────────

#[test]
fn provisioning_exchanges_secret_for_token() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    rig.transport.reply(200, &[], r#"{"accessToken":"abc123","tokenType":"Bearer"}"#);
    assert_eq!(rt.update_provisioning(false), Ok(true));
    assert_eq!(rt.api().device_token(), "Bearer abc123");

    let sent = rig.transport.sent();
    let req = &sent[0];
    assert_eq!(req.url, "https://iot.example.com/api/provision");
    assert_eq!(req.header("authorization"), None);
    let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
    assert_eq!(body["projectName"], "garden");
    assert_eq!(body["deviceName"], DEVICE);
    assert_eq!(body["provisioningToken"], "factory-secret");

    // Already provisioned: no request.
    assert_eq!(rt.update_provisioning(false), Ok(false));
    assert_eq!(rig.transport.sent().len(), 1);

    // The token persists and authorises later cycles.
    let _ = rt.sleep();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    assert!(rt.api().is_provisioned());
    let _ = rt.post_telemetry("soil", r#"{"moisture":41}"#);
    let sent = rig.transport.sent();
    assert_eq!(sent.last().and_then(|r| r.header("Authorization")), Some("Bearer abc123"));
}

#[test]
fn forced_provisioning_replaces_token() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    rig.transport.reply(200, &[], r#"{"accessToken":"one","tokenType":"Bearer"}"#);
    assert_eq!(rt.update_provisioning(false), Ok(true));

    rig.transport.reply(200, &[], r#"{"accessToken":"two","tokenType":"Bearer"}"#);
    assert_eq!(rt.update_provisioning(true), Ok(true));
    assert_eq!(rt.api().device_token(), "Bearer two");
}

#[test]
fn forbidden_response_clears_device_token() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    rig.transport.reply(200, &[], r#"{"accessToken":"abc","tokenType":"Bearer"}"#);
    assert_eq!(rt.update_provisioning(false), Ok(true));

    rig.transport.reply(403, &[], "");
    assert_eq!(rt.post_system_telemetry("system"), Ok(403));
    assert!(!rt.api().is_provisioned());

    let _ = rt.sleep();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    assert!(!rt.api().is_provisioned());
}

// ── Config and firmware ───────────────────────────────────────

#[test]
fn config_update_applies_to_runtime_settings() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    rig.transport.reply(200, &[("ETag", "\"v1\"")], r#"{"sleep_s":600,"log_level":0}"#);
    let ConfigUpdate::Updated(report) = rt.update_config().unwrap() else {
        panic!("expected an update");
    };
    assert_eq!(report.updated, vec!["log_level".to_owned(), "sleep_s".to_owned()]);
    assert!(report.token_committed);

    let req = &rig.transport.sent()[0];
    assert_eq!(req.url, format!("https://iot.example.com/api/file/garden/{DEVICE}/config.json"));

    // Threshold is now Error: warnings stay local.
    rig.transport.clear_sent();
    rt.log(LogLevel::Warning, "app", format_args!("quiet"));
    assert!(rig.transport.sent().is_empty());

    assert_eq!(rt.sleep(), CycleEnd::DeepSleep { duration: secs(600), panic: false });
}

#[test]
fn firmware_update_installs_and_remembers_etag() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());

    rig.transport.reply(304, &[], "");
    assert_eq!(rt.update_firmware(), Ok(FirmwareUpdate::UpToDate));
    assert!(rig.firmware.installs().is_empty());

    rig.transport.reply(200, &[], "");
    assert_eq!(rt.update_firmware(), Ok(FirmwareUpdate::Installed));
    let installs = rig.firmware.installs();
    assert_eq!(installs.len(), 1);
    assert_eq!(
        installs[0].url,
        format!("https://iot.example.com/api/file/garden/{DEVICE}/firmware.bin")
    );
    assert_eq!(installs[0].header("accept"), Some("application/octet-stream"));

    rig.transport.clear_sent();
    rig.transport.reply(304, &[], "");
    assert_eq!(rt.update_firmware(), Ok(FirmwareUpdate::UpToDate));
    let head = &rig.transport.sent()[0];
    assert_eq!(head.method, Method::Head);
    assert_eq!(head.header("If-None-Match"), Some("\"fw-2\""));
}

#[test]
fn firmware_download_feeds_watchdog_per_chunk() {
    let rig = Rig::new();
    rig.firmware.set_chunks(5);
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    let before = rt.watchdog().map(Watchdog::feed_count).unwrap();

    rig.transport.reply(200, &[], "");
    assert_eq!(rt.update_firmware(), Ok(FirmwareUpdate::Installed));

    // One feed before the download starts, then one per chunk.
    let after = rt.watchdog().map(Watchdog::feed_count).unwrap();
    assert_eq!(after - before, 6);
}

#[test]
fn failed_install_does_not_advance_firmware_etag() {
    let rig = Rig::new();
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    rig.firmware.set_result(Err(FirmwareError::ValidationFailed));

    rig.transport.reply(200, &[], "");
    assert_eq!(
        rt.update_firmware(),
        Err(Error::Firmware(FirmwareError::ValidationFailed))
    );

    rig.transport.clear_sent();
    rig.transport.reply(304, &[], "");
    let _ = rt.update_firmware();
    assert_eq!(rig.transport.sent()[0].header("If-None-Match"), None);
}

// ── Watchdog ──────────────────────────────────────────────────

#[test]
fn watchdog_is_armed_by_begin() {
    let rig = Rig::new();
    rig.preset_config("wdtSecs", 45);
    let mut rt = rig.boot();
    assert!(rt.watchdog().is_none());

    assert!(rt.begin().is_continue());
    assert_eq!(rt.watchdog().map(Watchdog::timeout), Some(secs(45)));

    rt.feed_watchdog();
    assert_eq!(rt.watchdog().map(Watchdog::feed_count), Some(1));
}

#[test]
fn zero_watchdog_seconds_leaves_it_disabled() {
    let rig = Rig::new();
    rig.preset_config("wdtSecs", 0);
    let mut rt = rig.boot();
    assert!(rt.begin().is_continue());
    assert!(rt.watchdog().is_none());

    rt.feed_watchdog();
    rig.transport.reply(200, &[], "");
    assert_eq!(rt.update_firmware(), Ok(FirmwareUpdate::Installed));
}
