//! Runtime configuration.
//!
//! Two layers:
//!
//! - [`RuntimeOptions`]: compile-time wiring (API endpoint, project, NTP
//!   servers, paths).  Built by `main` and handed to the runtime.
//! - [`RuntimeSettings`]: the runtime's own tunables as config cells.  The
//!   defaults below apply until the server sends an override, after which
//!   the persisted value wins.

use core::time::Duration;

use crate::backoff::BackoffSettings;
use crate::remote_config::{ConfigCell, ConfigRegistry};

/// Fast-memory cells owned by the runtime.
pub const SYSTEM_NAMESPACE: &str = "iotsys";
/// Config cells, API tokens and freshness tokens.
pub const CONFIG_NAMESPACE: &str = "iot";

pub const PANIC_SLEEP_KEY: &str = "panicSleepS";
pub const FIRMWARE_TOKEN_KEY: &str = "firmwareToken";

pub const CONFIG_PATH: &str = "file/{project}/{device}/config.json";
pub const FIRMWARE_PATH: &str = "file/{project}/{device}/firmware.bin";

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub api_base_url: String,
    pub project: String,
    /// Factory provisioning secret.  Stored only if none is stored yet.
    pub provisioning_token: Option<String>,
    pub ntp_servers: Vec<&'static str>,
    pub config_path: String,
    pub firmware_path: String,
    pub http_timeout: Duration,
    pub ntp_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            project: String::new(),
            provisioning_token: None,
            ntp_servers: vec!["pool.ntp.org", "time.nist.gov"],
            config_path: CONFIG_PATH.to_owned(),
            firmware_path: FIRMWARE_PATH.to_owned(),
            http_timeout: Duration::from_secs(10),
            ntp_timeout: Duration::from_secs(10),
        }
    }
}

/// Remotely tunable runtime settings.
///
/// | field | config key | storage key | default |
/// |---|---|---|---|
/// | `log_level` | `log_level` | `logLevel` | 5 (not set) |
/// | `sleep_s` | `sleep_s` | `sleepFor` | 300 |
/// | `battery_offset_mv` | `battery_offset_mV` | `batOffs` | 0 |
/// | `battery_divider` | `battery_divider` | `batDiv` | 1 |
/// | `battery_factor` | `battery_factor` | `batMul` | 2 |
/// | `battery_pin` | `battery_pin` | `batPin` | 34 |
/// | `battery_min_mv` | `battery_min_mV` | `batMinMv` | -1 |
/// | `panic_sleep_init_s` | `panic_sleep_init_s` | `panicSlpInit` | 60 |
/// | `panic_sleep_max_s` | `panic_sleep_max_s` | `panicSlpMax` | 86400 |
/// | `panic_sleep_factor` | `panic_sleep_factor` | `panicSlpFac` | 2 |
/// | `watchdog_s` | `watchdog_s` | `wdtSecs` | 30 |
pub struct RuntimeSettings {
    pub log_level: ConfigCell<i32>,
    pub sleep_s: ConfigCell<i32>,
    pub battery_offset_mv: ConfigCell<i32>,
    pub battery_divider: ConfigCell<i32>,
    pub battery_factor: ConfigCell<i32>,
    pub battery_pin: ConfigCell<i32>,
    pub battery_min_mv: ConfigCell<i32>,
    pub panic_sleep_init_s: ConfigCell<i32>,
    pub panic_sleep_max_s: ConfigCell<i32>,
    pub panic_sleep_factor: ConfigCell<i32>,
    pub watchdog_s: ConfigCell<i32>,
}

impl RuntimeSettings {
    pub fn register(registry: &mut ConfigRegistry) -> Self {
        Self {
            log_level: ConfigCell::new(registry, "log_level", "logLevel", 5),
            sleep_s: ConfigCell::new(registry, "sleep_s", "sleepFor", 5 * 60),
            battery_offset_mv: ConfigCell::new(registry, "battery_offset_mV", "batOffs", 0),
            battery_divider: ConfigCell::new(registry, "battery_divider", "batDiv", 1),
            battery_factor: ConfigCell::new(registry, "battery_factor", "batMul", 2),
            battery_pin: ConfigCell::new(registry, "battery_pin", "batPin", 34),
            battery_min_mv: ConfigCell::new(registry, "battery_min_mV", "batMinMv", -1),
            panic_sleep_init_s: ConfigCell::new(registry, "panic_sleep_init_s", "panicSlpInit", 60),
            panic_sleep_max_s: ConfigCell::new(
                registry,
                "panic_sleep_max_s",
                "panicSlpMax",
                24 * 60 * 60,
            ),
            panic_sleep_factor: ConfigCell::new(registry, "panic_sleep_factor", "panicSlpFac", 2),
            watchdog_s: ConfigCell::new(registry, "watchdog_s", "wdtSecs", 30),
        }
    }

    pub fn backoff(&self) -> BackoffSettings {
        BackoffSettings {
            initial_s: self.panic_sleep_init_s.get(),
            factor: self.panic_sleep_factor.get(),
            max_s: self.panic_sleep_max_s.get(),
        }
        .sanitized()
    }

    /// Regular sleep between cycles; negative values count as zero.
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.sleep_s.get().max(0) as u64)
    }

    /// `None` disables the watchdog.
    pub fn watchdog_timeout(&self) -> Option<Duration> {
        match self.watchdog_s.get() {
            s if s > 0 => Some(Duration::from_secs(s as u64)),
            _ => None,
        }
    }
}
