//! ESP32 clock adapter.
//!
//! Implements [`ClockPort`]:
//!
//! - **`target_os = "espidf"`**: `esp_timer_get_time()` for uptime,
//!   `gettimeofday()` for wall time, `EspSntp` for synchronisation and
//!   FreeRTOS delays.
//! - **`not(target_os = "espidf")`**: `std::time::Instant` for uptime.
//!   Wall time stays at uptime seconds (implausible, like an unsynced
//!   chip) until [`ClockPort::start_time_sync`] is called.

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use crate::app::ports::ClockPort;

#[cfg(target_os = "espidf")]
use esp_idf_svc::hal::delay::FreeRtos;
#[cfg(target_os = "espidf")]
use esp_idf_svc::sntp::{EspSntp, SntpConf};

/// Blocking delay on the host.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

#[cfg(not(target_os = "espidf"))]
impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(std::time::Duration::from_nanos(u64::from(ns)));
    }
}

pub struct Esp32Clock {
    #[cfg(target_os = "espidf")]
    sntp: Option<EspSntp<'static>>,
    #[cfg(target_os = "espidf")]
    delay: FreeRtos,

    #[cfg(not(target_os = "espidf"))]
    start: std::time::Instant,
    #[cfg(not(target_os = "espidf"))]
    synced: bool,
    #[cfg(not(target_os = "espidf"))]
    delay: StdDelay,
}

impl Default for Esp32Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Esp32Clock {
    pub fn new() -> Self {
        Self {
            #[cfg(target_os = "espidf")]
            sntp: None,
            #[cfg(target_os = "espidf")]
            delay: FreeRtos,
            #[cfg(not(target_os = "espidf"))]
            start: std::time::Instant::now(),
            #[cfg(not(target_os = "espidf"))]
            synced: false,
            #[cfg(not(target_os = "espidf"))]
            delay: StdDelay,
        }
    }
}

#[cfg(target_os = "espidf")]
impl ClockPort for Esp32Clock {
    fn uptime_ms(&self) -> u64 {
        (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64 / 1_000
    }

    fn unix_time_secs(&self) -> i64 {
        let mut tv = esp_idf_svc::sys::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        if unsafe { esp_idf_svc::sys::gettimeofday(&mut tv, core::ptr::null_mut()) } != 0 {
            return 0;
        }
        tv.tv_sec as i64
    }

    fn delay_ms(&mut self, ms: u32) {
        DelayNs::delay_ms(&mut self.delay, ms);
    }

    fn start_time_sync(&mut self, servers: &[&'static str]) -> bool {
        // Dropping the previous instance stops it; only one may exist.
        self.sntp = None;

        let mut conf = SntpConf::default();
        for (slot, server) in conf.servers.iter_mut().zip(servers) {
            *slot = *server;
        }
        if servers.len() > conf.servers.len() {
            warn!(
                "Clock: {} NTP servers given, SNTP accepts {}",
                servers.len(),
                conf.servers.len()
            );
        }

        match EspSntp::new(&conf) {
            Ok(sntp) => {
                info!("Clock: SNTP started ({:?})", servers);
                self.sntp = Some(sntp);
                true
            }
            Err(e) => {
                warn!("Clock: SNTP start failed: {:?}", e);
                false
            }
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl ClockPort for Esp32Clock {
    fn uptime_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn unix_time_secs(&self) -> i64 {
        if !self.synced {
            return (self.uptime_ms() / 1_000) as i64;
        }
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    fn start_time_sync(&mut self, servers: &[&'static str]) -> bool {
        if servers.is_empty() {
            warn!("Clock: no NTP servers given");
            return false;
        }
        info!("Clock: simulated SNTP sync ({:?})", servers);
        self.synced = true;
        true
    }
}
