//! Device runtime: one boot cycle of a battery-powered node.
//!
//! ```text
//!   new() ──▶ Constructed ──begin()──▶ Configured ──▶ Active
//!     │                                  │             │
//!     │ fault reset                      │ battery low │ sleep / restart /
//!     ▼                                  ▼             ▼ shutdown / panic
//!   panic_early ───────────────────────▶ Ended(CycleEnd)
//! ```
//!
//! A cycle always ends in exactly one [`CycleEnd`].  On the chip the power
//! port never returns; on the host the runtime records the end, refuses
//! further transitions and hands the same [`CycleEnd`] back to every
//! later terminal call.
//!
//! Every piece of state that must outlive the cycle lives in a
//! [`PersistentCell`](crate::persistent::PersistentCell) or a
//! [`ConfigCell`](crate::remote_config::ConfigCell): boot accounting and
//! the panic backoff in RTC memory, tunables and tokens on NVS.

pub mod battery;
pub mod boot;

use core::fmt;
use core::ops::ControlFlow;
use core::time::Duration;

use log::{debug, error, info, warn};

use crate::adapters::device_id::{DeviceIdString, device_id};
use crate::api::{ApiClient, ApiError, PROVISIONING_PATH};
use crate::app::ports::{ClockPort, FirmwarePort, HttpTransport, PowerPort, SystemPort};
use crate::backoff::{BackoffState, EscalatingBackoffPolicy};
use crate::config::{
    CONFIG_NAMESPACE, FIRMWARE_TOKEN_KEY, PANIC_SLEEP_KEY, RuntimeOptions, RuntimeSettings,
    SYSTEM_NAMESPACE,
};
use crate::drivers::watchdog::Watchdog;
use crate::error::Result;
use crate::logger::{LogLevel, RemoteLogger};
use crate::persistent::Storage;
use crate::remote_config::{ConfigError, ConfigRegistry, ConfigUpdate, FreshnessToken};
use crate::telemetry::{SystemTelemetry, iso_time};
use crate::util::{POLL_INTERVAL_MS, wait_until};

use battery::{BatteryCalibration, BatteryGauge};
use boot::{BootAccounting, ResetReason, WakeupCause};

const TAG: &str = "iot";

/// Pause before a terminal action so the UART and the log POST drain.
pub const FLUSH_DELAY_MS: u32 = 50;

/// Anything earlier than ~2010 means SNTP has not set the clock yet.
pub const PLAUSIBLE_UNIX_TIME: i64 = 40 * 365 * 24 * 3600;

/// The chip-facing ports a runtime drives.
pub struct Platform {
    pub clock: Box<dyn ClockPort>,
    pub system: Box<dyn SystemPort>,
    pub power: Box<dyn PowerPort>,
    pub firmware: Box<dyn FirmwarePort>,
}

/// What [`DeviceRuntime::panic`] does after logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicAction {
    /// Deep sleep for the next escalating backoff duration.
    #[default]
    EscalatingSleep,
    Restart,
    Shutdown,
}

/// How a boot cycle ended.  `panic` marks cycles that did not reset the
/// backoff episode.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    DeepSleep { duration: Duration, panic: bool },
    Restart { panic: bool },
    Shutdown { panic: bool },
}

impl CycleEnd {
    pub fn is_panic(&self) -> bool {
        match *self {
            Self::DeepSleep { panic, .. }
            | Self::Restart { panic }
            | Self::Shutdown { panic } => panic,
        }
    }

    /// Sleep length recorded for the next cycle, `0` unless deep sleeping.
    pub fn sleep_secs(&self) -> i64 {
        match self {
            Self::DeepSleep { duration, .. } => {
                i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
            }
            _ => 0,
        }
    }
}

impl fmt::Display for CycleEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.is_panic() { " (panic)" } else { "" };
        match self {
            Self::DeepSleep { duration, .. } => {
                write!(f, "deep sleep {} s{tag}", duration.as_secs())
            }
            Self::Restart { .. } => write!(f, "restart{tag}"),
            Self::Shutdown { .. } => write!(f, "shutdown{tag}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    /// Config cells loaded.
    Configured,
    /// Battery gate passed, API client ready.
    Active,
    Ended(CycleEnd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareUpdate {
    UpToDate,
    /// A new image is bootable; restart to run it.
    Installed,
}

#[derive(Debug, Clone)]
struct FirmwareIdentity {
    version: String,
    sha256: String,
}

pub struct DeviceRuntime {
    platform: Platform,
    storage: Storage,
    registry: ConfigRegistry,
    settings: RuntimeSettings,
    api: ApiClient,
    boot: BootAccounting,
    backoff: EscalatingBackoffPolicy,
    battery: BatteryGauge,
    logger: RemoteLogger,
    watchdog: Option<Watchdog>,
    options: RuntimeOptions,

    boot_timestamp_ms: u64,
    reset_reason: ResetReason,
    wakeup_cause: WakeupCause,
    device_id: DeviceIdString,
    firmware: Option<FirmwareIdentity>,
    panic_action: PanicAction,
    lifecycle: Lifecycle,
}

impl DeviceRuntime {
    /// Count the boot and load the persisted runtime state.
    ///
    /// After a crash, watchdog or brownout reset the runtime ends the
    /// cycle immediately with an escalating panic sleep; check
    /// [`cycle_end`](Self::cycle_end) or let [`begin`](Self::begin) report it.
    pub fn new(
        platform: Platform,
        storage: Storage,
        transport: Box<dyn HttpTransport>,
        options: RuntimeOptions,
    ) -> Self {
        let boot_timestamp_ms = platform.clock.uptime_ms();
        let reset_reason = platform.system.reset_reason();
        let wakeup_cause = platform.system.wakeup_cause();
        let device_id = device_id(&platform.system.mac_address());

        let mut registry = ConfigRegistry::new(CONFIG_NAMESPACE);
        let settings = RuntimeSettings::register(&mut registry);
        let mut api = ApiClient::new(&options.api_base_url, &options.project, transport);
        api.set_timeout(options.http_timeout);

        let mut rt = Self {
            platform,
            storage,
            registry,
            settings,
            api,
            boot: BootAccounting::new(SYSTEM_NAMESPACE),
            backoff: EscalatingBackoffPolicy::new(SYSTEM_NAMESPACE, PANIC_SLEEP_KEY),
            battery: BatteryGauge::default(),
            logger: RemoteLogger::default(),
            watchdog: None,
            options,
            boot_timestamp_ms,
            reset_reason,
            wakeup_cause,
            device_id,
            firmware: None,
            panic_action: PanicAction::default(),
            lifecycle: Lifecycle::Constructed,
        };

        rt.boot.init(&rt.storage);
        rt.backoff.init(&rt.storage);
        let count = match rt.boot.count_boot(&mut rt.storage) {
            Ok(n) => n,
            Err(e) => {
                warn!("Runtime: boot counter not persisted: {}", e);
                rt.boot.boot_count.get()
            }
        };
        info!(
            "--- Bootup #{}, reset {}, wakeup {} after {} s, panic sleep {} s",
            count,
            rt.reset_reason,
            rt.wakeup_cause,
            rt.boot.last_sleep_s.get(),
            rt.backoff.raw()
        );
        if rt.backoff.is_panicking() {
            info!("*** LAST CYCLE ENDED IN A PANIC");
        }

        // The API client reads the secret back in begin().
        if let Some(secret) = rt.options.provisioning_token.clone() {
            rt.api.begin(&rt.storage);
            if let Err(e) = rt.api.set_provisioning_token_if_empty(&mut rt.storage, &secret) {
                warn!("Runtime: storing provisioning token failed: {}", e);
            }
        }

        if rt.reset_reason.is_fault() {
            // Backoff parameters are config cells; load them for the panic.
            rt.registry.load_all(&rt.storage);
            let reason = rt.reset_reason;
            let _ = rt.panic_early(format_args!("previous cycle died: reset reason {}", reason));
        }
        rt
    }

    /// Load config, arm the watchdog, run the battery gate and prepare
    /// the API client.  `Break` means the cycle is over.
    pub fn begin(&mut self) -> ControlFlow<CycleEnd> {
        match self.lifecycle {
            Lifecycle::Ended(end) => return ControlFlow::Break(end),
            Lifecycle::Active => return ControlFlow::Continue(()),
            _ => {}
        }

        let path = self.options.config_path.clone();
        self.registry.begin(&self.storage, &path);
        self.lifecycle = Lifecycle::Configured;

        self.logger.set_threshold(LogLevel::from_i32(self.settings.log_level.get()));
        if let Some(timeout) = self.settings.watchdog_timeout() {
            if self.watchdog.is_none() {
                self.watchdog = Some(Watchdog::new(timeout));
            }
        }

        let min_mv = self.settings.battery_min_mv.get();
        if self.settings.battery_pin.get() >= 0 && min_mv > 0 {
            match self.battery_millivolts() {
                Some(mv) if mv < min_mv => {
                    error!("Runtime: battery voltage too low: {} mV < {} mV", mv, min_mv);
                    return ControlFlow::Break(self.shutdown(false));
                }
                Some(_) => {}
                None => warn!("Runtime: battery gate skipped, no reading"),
            }
        }

        self.api.set_device_name(&self.device_id);
        self.api.begin(&self.storage);
        self.lifecycle = Lifecycle::Active;
        ControlFlow::Continue(())
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn cycle_end(&self) -> Option<CycleEnd> {
        match self.lifecycle {
            Lifecycle::Ended(end) => Some(end),
            _ => None,
        }
    }

    pub fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }

    pub fn wakeup_cause(&self) -> WakeupCause {
        self.wakeup_cause
    }

    pub fn boot_count(&self) -> u32 {
        self.boot.boot_count.get()
    }

    /// Awake time of the previous cycle.
    pub fn last_active_ms(&self) -> i64 {
        self.boot.active_ms.get()
    }

    pub fn last_sleep_s(&self) -> i64 {
        self.boot.last_sleep_s.get()
    }

    /// Unix time of the last successful NTP sync, `0` if never.
    pub fn last_ntp_sync(&self) -> i64 {
        self.boot.last_ntp_sync.get()
    }

    /// Milliseconds since this runtime was constructed.
    pub fn active_duration_ms(&self) -> u64 {
        self.platform.clock.uptime_ms().saturating_sub(self.boot_timestamp_ms)
    }

    pub fn backoff_state(&self) -> BackoffState {
        self.backoff.state()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Register application cells here before [`begin`](Self::begin).
    pub fn registry_mut(&mut self) -> &mut ConfigRegistry {
        &mut self.registry
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut ApiClient {
        &mut self.api
    }

    pub fn panic_action(&self) -> PanicAction {
        self.panic_action
    }

    /// Install `action` and return the previous one.
    pub fn set_panic_action(&mut self, action: PanicAction) -> PanicAction {
        core::mem::replace(&mut self.panic_action, action)
    }

    /// The task watchdog, once `begin` has armed it.
    pub fn watchdog(&self) -> Option<&Watchdog> {
        self.watchdog.as_ref()
    }

    pub fn feed_watchdog(&self) {
        if let Some(wdt) = &self.watchdog {
            wdt.feed();
        }
    }

    // ── Battery ───────────────────────────────────────────────

    pub fn battery_calibration(&self) -> BatteryCalibration {
        BatteryCalibration {
            pin: self.settings.battery_pin.get(),
            factor: self.settings.battery_factor.get(),
            divider: self.settings.battery_divider.get(),
            offset_mv: self.settings.battery_offset_mv.get(),
        }
    }

    /// Battery voltage, measured once per cycle.  `None` when no pin is
    /// configured or the ADC read failed.
    pub fn battery_millivolts(&mut self) -> Option<i32> {
        let cal = self.battery_calibration();
        self.battery.read(self.platform.system.as_mut(), &cal)
    }

    pub fn invalidate_battery_cache(&mut self) {
        self.battery.invalidate();
    }

    // ── Time ──────────────────────────────────────────────────

    /// Start SNTP and wait until the wall clock is plausible.
    pub fn sync_time(&mut self) -> bool {
        info!("Runtime: waiting for NTP time sync");
        if !self.platform.clock.start_time_sync(&self.options.ntp_servers) {
            warn!("Runtime: SNTP could not be started");
            return false;
        }
        let synced = wait_until(
            self.platform.clock.as_mut(),
            self.options.ntp_timeout,
            POLL_INTERVAL_MS,
            |c| c.unix_time_secs() > PLAUSIBLE_UNIX_TIME,
        );
        if !synced {
            warn!("Runtime: NTP time sync failed: {}", self.time_iso());
            return false;
        }

        let now = self.platform.clock.unix_time_secs();
        if let Err(e) = self.boot.last_ntp_sync.set(&mut self.storage, now) {
            warn!("Runtime: recording NTP sync failed: {}", e);
        }
        info!("Runtime: NTP time sync success, time={}", self.time_iso());
        true
    }

    pub fn time_iso(&self) -> String {
        iso_time(self.platform.clock.unix_time_secs())
    }

    // ── Firmware identity ─────────────────────────────────────

    fn firmware_identity(&mut self) -> &FirmwareIdentity {
        let firmware = &self.platform.firmware;
        self.firmware.get_or_insert_with(|| FirmwareIdentity {
            version: firmware.version().unwrap_or_default(),
            sha256: firmware.sha256_hex().unwrap_or_default(),
        })
    }

    /// Running image identity, `""` if the image header is unreadable.
    pub fn firmware_version(&mut self) -> String {
        self.firmware_identity().version.clone()
    }

    pub fn firmware_sha256(&mut self) -> String {
        self.firmware_identity().sha256.clone()
    }

    // ── Remote logging ────────────────────────────────────────

    /// Log locally and, once the API client is ready and the link is up,
    /// forward the line to the server.
    pub fn log(&mut self, level: LogLevel, tag: &str, args: fmt::Arguments<'_>) {
        let uptime = self.platform.clock.uptime_ms();
        let Some(line) = self.logger.emit(level, uptime, tag, args) else {
            return;
        };
        if self.lifecycle != Lifecycle::Active || !self.api.is_connected() {
            return;
        }
        if let Err(e) = self.api.post_log(&mut self.storage, &line) {
            debug!("Runtime: log line not forwarded: {}", e);
        }
    }

    // ── API operations ────────────────────────────────────────

    pub fn post_telemetry(
        &mut self,
        kind: &str,
        json: &str,
    ) -> core::result::Result<u16, ApiError> {
        self.api.post_telemetry(&mut self.storage, kind, json)
    }

    pub fn system_telemetry(&mut self) -> SystemTelemetry {
        let battery = if self.settings.battery_pin.get() >= 0 {
            self.battery_millivolts()
        } else {
            None
        };
        let identity = self.firmware_identity().clone();
        SystemTelemetry {
            battery_v: SystemTelemetry::battery_from_millivolts(battery),
            wifi_rssi: self.platform.system.wifi_rssi(),
            boot_count: self.boot.boot_count.get(),
            active_ms: self.boot.active_ms.get(),
            last_sleep_s: self.boot.last_sleep_s.get(),
            time: self.time_iso(),
            firmware_version: identity.version,
            firmware_sha256: identity.sha256,
        }
    }

    pub fn post_system_telemetry(&mut self, kind: &str) -> core::result::Result<u16, ApiError> {
        let json = self.system_telemetry().to_json();
        self.post_telemetry(kind, &json)
    }

    /// Fetch the config document if it changed and apply it.
    pub fn update_config(&mut self) -> core::result::Result<ConfigUpdate, ConfigError> {
        let update = self.registry.update_config(&mut self.storage, &mut self.api)?;
        if matches!(update, ConfigUpdate::Updated(_)) {
            self.logger.set_threshold(LogLevel::from_i32(self.settings.log_level.get()));
        }
        Ok(update)
    }

    /// Exchange the provisioning secret for a device token.  `force`
    /// discards the current token first.
    pub fn update_provisioning(&mut self, force: bool) -> core::result::Result<bool, ApiError> {
        if force {
            info!("Runtime: forced re-provisioning");
            self.api.clear_device_token(&mut self.storage)?;
        }
        self.api.update_provisioning(&mut self.storage, PROVISIONING_PATH)
    }

    /// Install a newer image if the server has one.  The firmware
    /// freshness token is persisted only after the image is bootable.
    pub fn update_firmware(&mut self) -> Result<FirmwareUpdate> {
        let path = self.options.firmware_path.clone();
        let token = FreshnessToken::load(&self.storage, CONFIG_NAMESPACE, FIRMWARE_TOKEN_KEY);
        if !self.api.check_for_update(&mut self.storage, &path, &token)? {
            info!("Runtime: firmware up to date (etag '{}')", token.etag);
            return Ok(FirmwareUpdate::UpToDate);
        }

        let request = self.api.download_request(&path);
        self.feed_watchdog();
        info!("Runtime: installing firmware from {}", request.url);
        let watchdog = self.watchdog.as_ref();
        let mut feed = || {
            if let Some(wdt) = watchdog {
                wdt.feed();
            }
        };
        let fresh = self.platform.firmware.install(&request, &mut feed)?;
        fresh.store(&mut self.storage, CONFIG_NAMESPACE, FIRMWARE_TOKEN_KEY)?;
        info!("Runtime: firmware installed, restart to activate");
        Ok(FirmwareUpdate::Installed)
    }

    // ── Cycle termination ─────────────────────────────────────

    /// Log through the remote logger, then run the panic action.
    pub fn panic(&mut self, args: fmt::Arguments<'_>) -> CycleEnd {
        if let Some(end) = self.cycle_end() {
            return end;
        }
        self.log(LogLevel::Error, TAG, args);
        self.platform.clock.delay_ms(FLUSH_DELAY_MS);
        self.run_panic_action()
    }

    /// Serial-only panic for failures before the API client is usable.
    pub fn panic_early(&mut self, args: fmt::Arguments<'_>) -> CycleEnd {
        if let Some(end) = self.cycle_end() {
            return end;
        }
        error!("{}", args);
        self.platform.clock.delay_ms(FLUSH_DELAY_MS);
        self.run_panic_action()
    }

    fn run_panic_action(&mut self) -> CycleEnd {
        match self.panic_action {
            PanicAction::EscalatingSleep => {
                let settings = self.settings.backoff();
                let duration = self.backoff.on_failure(&mut self.storage, &settings);
                self.deep_sleep(duration, true)
            }
            PanicAction::Restart => self.restart(true),
            PanicAction::Shutdown => self.shutdown(true),
        }
    }

    /// Deep sleep for the configured `sleep_s`.
    pub fn sleep(&mut self) -> CycleEnd {
        let duration = self.settings.sleep_duration();
        self.deep_sleep(duration, false)
    }

    pub fn deep_sleep(&mut self, duration: Duration, panic: bool) -> CycleEnd {
        self.end_cycle(CycleEnd::DeepSleep { duration, panic })
    }

    pub fn restart(&mut self, panic: bool) -> CycleEnd {
        self.end_cycle(CycleEnd::Restart { panic })
    }

    /// Deep sleep with no wakeup source.
    pub fn shutdown(&mut self, panic: bool) -> CycleEnd {
        self.end_cycle(CycleEnd::Shutdown { panic })
    }

    fn end_cycle(&mut self, end: CycleEnd) -> CycleEnd {
        if let Some(first) = self.cycle_end() {
            debug!("Runtime: cycle already ended ({}), ignoring {}", first, end);
            return first;
        }

        let active_ms = i64::try_from(self.active_duration_ms()).unwrap_or(i64::MAX);
        if let Err(e) = self.boot.record_cycle_end(&mut self.storage, active_ms, end.sleep_secs()) {
            warn!("Runtime: cycle accounting not persisted: {}", e);
        }
        if !end.is_panic() {
            if let Err(e) = self.backoff.on_success(&mut self.storage) {
                warn!("Runtime: clearing panic state failed: {}", e);
            }
        }
        self.lifecycle = Lifecycle::Ended(end);

        info!("Runtime: active for {} ms, {}", active_ms, end);
        self.platform.clock.delay_ms(FLUSH_DELAY_MS);
        match end {
            CycleEnd::DeepSleep { duration, .. } => self.platform.power.deep_sleep(duration),
            CycleEnd::Restart { .. } => self.platform.power.restart(),
            CycleEnd::Shutdown { .. } => self.platform.power.power_off(),
        }
        end
    }
}
