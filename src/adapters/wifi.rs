//! WiFi station-mode adapter.
//!
//! Connects once per cycle with a bounded timeout; a battery device does
//! not reconnect in the background, it fails the cycle and sleeps.
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: `BlockingWifi<EspWifi>` from `esp_idf_svc::wifi`.
//! - **all other targets**: simulation stub for host-side tests.

use core::fmt;
use core::time::Duration;

use log::{info, warn};

#[cfg(target_os = "espidf")]
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::modem::Modem,
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityError {
    InvalidSsid,
    InvalidPassword,
    DriverFailed,
    Timeout,
}

impl fmt::Display for ConnectivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "SSID invalid (must be 1-32 printable ASCII bytes)"),
            Self::InvalidPassword => {
                write!(f, "password invalid (must be 8-64 bytes for WPA2, or empty for open)")
            }
            Self::DriverFailed => write!(f, "WiFi driver error"),
            Self::Timeout => write!(f, "WiFi connection timed out"),
        }
    }
}

impl std::error::Error for ConnectivityError {}

// ───────────────────────────────────────────────────────────────
// Validation
// ───────────────────────────────────────────────────────────────

fn is_printable_ascii(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

fn validate_ssid(ssid: &str) -> Result<(), ConnectivityError> {
    if ssid.is_empty() || ssid.len() > 32 || !is_printable_ascii(ssid) {
        return Err(ConnectivityError::InvalidSsid);
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), ConnectivityError> {
    if password.is_empty() {
        return Ok(());
    }
    if password.len() < 8 || password.len() > 64 {
        return Err(ConnectivityError::InvalidPassword);
    }
    Ok(())
}

/// Whether the station is associated with an AP.
#[cfg(target_os = "espidf")]
pub fn sta_connected() -> bool {
    use esp_idf_svc::sys::{ESP_OK, esp_wifi_sta_get_ap_info, wifi_ap_record_t};
    let mut ap_info: wifi_ap_record_t = unsafe { core::mem::zeroed() };
    unsafe { esp_wifi_sta_get_ap_info(&mut ap_info) == ESP_OK as i32 }
}

/// The host has no radio.
#[cfg(not(target_os = "espidf"))]
pub fn sta_connected() -> bool {
    false
}

// ───────────────────────────────────────────────────────────────
// WiFi adapter
// ───────────────────────────────────────────────────────────────

pub struct WifiAdapter {
    #[cfg(target_os = "espidf")]
    wifi: BlockingWifi<EspWifi<'static>>,
    #[cfg(not(target_os = "espidf"))]
    connected: bool,
}

#[cfg(target_os = "espidf")]
impl WifiAdapter {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> Result<Self, esp_idf_svc::sys::EspError> {
        let wifi = BlockingWifi::wrap(EspWifi::new(modem, sys_loop.clone(), nvs)?, sys_loop)?;
        Ok(Self { wifi })
    }

    pub fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    /// Join `ssid` and wait for an IP, retrying until `timeout` elapses.
    pub fn connect(
        &mut self,
        ssid: &str,
        password: &str,
        hostname: &str,
        timeout: Duration,
    ) -> Result<(), ConnectivityError> {
        if self.is_connected() {
            info!("WiFi: already connected");
            return Ok(());
        }
        validate_ssid(ssid)?;
        validate_password(password)?;

        let mut conf = ClientConfiguration::default();
        conf.ssid = ssid.try_into().map_err(|_| ConnectivityError::InvalidSsid)?;
        conf.password = password.try_into().map_err(|_| ConnectivityError::InvalidPassword)?;
        conf.auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let driver = |e: esp_idf_svc::sys::EspError| {
            warn!("WiFi: driver error {:?}", e);
            ConnectivityError::DriverFailed
        };
        self.wifi.set_configuration(&Configuration::Client(conf)).map_err(driver)?;
        if let Err(e) = self.wifi.wifi_mut().sta_netif_mut().set_hostname(hostname) {
            warn!("WiFi: setting hostname '{}' failed: {:?}", hostname, e);
        }
        self.wifi.start().map_err(driver)?;

        info!("WiFi: connecting to ssid={} timeout={:?}", ssid, timeout);
        let started = std::time::Instant::now();
        loop {
            match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
                Ok(()) => break,
                Err(e) if started.elapsed() < timeout => {
                    warn!("WiFi: attempt failed ({:?}), retrying", e);
                }
                Err(_) => {
                    warn!("WiFi: connection failed after {:?}", started.elapsed());
                    return Err(ConnectivityError::Timeout);
                }
            }
        }

        match self.wifi.wifi().sta_netif().get_ip_info() {
            Ok(ip) => info!("WiFi: connected ip={}", ip.ip),
            Err(_) => info!("WiFi: connected"),
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Err(e) = self.wifi.disconnect() {
            warn!("WiFi: disconnect failed: {:?}", e);
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl Default for WifiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "espidf"))]
impl WifiAdapter {
    pub fn new() -> Self {
        Self { connected: false }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect(
        &mut self,
        ssid: &str,
        password: &str,
        hostname: &str,
        timeout: Duration,
    ) -> Result<(), ConnectivityError> {
        if self.connected {
            info!("WiFi(sim): already connected");
            return Ok(());
        }
        validate_ssid(ssid)?;
        validate_password(password)?;
        info!("WiFi(sim): connected to ssid={} as {} (timeout {:?})", ssid, hostname, timeout);
        self.connected = true;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if !self.connected {
            warn!("WiFi(sim): disconnect while not connected");
        }
        self.connected = false;
    }
}
