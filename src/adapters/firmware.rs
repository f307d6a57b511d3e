//! Firmware identity and OTA installation.
//!
//! Implements [`FirmwarePort`]:
//!
//! - identity from the running image's `esp_app_desc_t`
//! - install: stream an HTTP download into the inactive OTA slot via
//!   `esp-ota`, validate, and mark it as the next boot partition
//!
//! The download is never buffered: chunks go straight from the socket to
//! flash.  Dropping an unfinished `OtaUpdate` aborts it.

use log::{info, warn};

use crate::app::ports::{FirmwareError, FirmwarePort, HttpRequest};
use crate::remote_config::FreshnessToken;

pub struct EspFirmware {
    #[cfg(not(target_os = "espidf"))]
    version: Option<String>,
    #[cfg(not(target_os = "espidf"))]
    sha256: Option<String>,
}

impl Default for EspFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl EspFirmware {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            version: Some(format!("iotnode {} (sim)", env!("CARGO_PKG_VERSION"))),
            #[cfg(not(target_os = "espidf"))]
            sha256: Some("0".repeat(64)),
        }
    }

    /// Cancel rollback for the running image.
    #[cfg(target_os = "espidf")]
    pub fn mark_running_valid() {
        match esp_ota::mark_app_valid() {
            Ok(()) => info!("Firmware: running image marked valid"),
            Err(e) => warn!("Firmware: mark_app_valid failed: {:?}", e),
        }
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn mark_running_valid() {
        info!("Firmware(sim): rollback check skipped");
    }
}

#[cfg(target_os = "espidf")]
fn c_field(field: &[core::ffi::c_char]) -> String {
    let bytes: Vec<u8> = field.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(target_os = "espidf")]
fn app_description() -> Option<&'static esp_idf_svc::sys::esp_app_desc_t> {
    // SAFETY: points into the flash-mapped image header, valid for the
    // program's lifetime.
    unsafe { esp_idf_svc::sys::esp_app_get_description().as_ref() }
}

#[cfg(target_os = "espidf")]
impl FirmwarePort for EspFirmware {
    fn version(&self) -> Option<String> {
        let d = app_description()?;
        Some(format!(
            "{} {} {} {} IDF {} sec {}",
            c_field(&d.project_name),
            c_field(&d.version),
            c_field(&d.date),
            c_field(&d.time),
            c_field(&d.idf_ver),
            d.secure_version
        ))
    }

    fn sha256_hex(&self) -> Option<String> {
        use core::fmt::Write as _;
        let d = app_description()?;
        let mut hex = String::with_capacity(64);
        for b in d.app_elf_sha256 {
            let _ = write!(hex, "{:02x}", b);
        }
        Some(hex)
    }

    fn install(
        &mut self,
        request: &HttpRequest,
        feed: &mut dyn FnMut(),
    ) -> Result<FreshnessToken, FirmwareError> {
        use crate::app::ports::TransportError;
        use embedded_svc::http::{Headers, Status};
        use embedded_svc::io::Read;

        let mut client = crate::adapters::http::client(request)?;
        let headers: Vec<(&str, &str)> =
            request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let req = client
            .request(crate::adapters::http::svc_method(request.method), &request.url, &headers)
            .map_err(|_| TransportError::ConnectFailed)?;
        let mut response = req.submit().map_err(|_| TransportError::Timeout)?;

        let status = response.status();
        if !(200..300).contains(&status) {
            warn!("Firmware: download {} -> status {}", request.url, status);
            return Err(FirmwareError::Status(status));
        }
        let token = FreshnessToken::new(
            response.header("ETag").unwrap_or_default(),
            response.header("Last-Modified").unwrap_or_default(),
        );

        let mut update = esp_ota::OtaUpdate::begin().map_err(|e| {
            warn!("Firmware: esp-ota begin failed: {:?}", e);
            FirmwareError::BeginFailed
        })?;

        let mut total = 0_usize;
        let mut chunk = [0_u8; 1024];
        loop {
            let n = response.read(&mut chunk).map_err(|_| TransportError::Io)?;
            if n == 0 {
                break;
            }
            update.write(&chunk[..n]).map_err(|e| {
                warn!("Firmware: esp-ota write failed at {} bytes: {:?}", total, e);
                FirmwareError::WriteFailed
            })?;
            total += n;
            feed();
        }
        if total == 0 {
            warn!("Firmware: empty download body");
            return Err(FirmwareError::ValidationFailed);
        }

        let mut completed = update.finalize().map_err(|e| {
            warn!("Firmware: esp-ota finalize failed: {:?}", e);
            FirmwareError::ValidationFailed
        })?;
        completed.set_as_boot_partition().map_err(|e| {
            warn!("Firmware: esp-ota set_as_boot_partition failed: {:?}", e);
            FirmwareError::BootSetFailed
        })?;

        info!("Firmware: {} bytes installed, etag '{}'", total, token.etag);
        Ok(token)
    }
}

// ── Host simulation ───────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
impl EspFirmware {
    pub fn with_identity(version: Option<&str>, sha256: Option<&str>) -> Self {
        Self {
            version: version.map(str::to_owned),
            sha256: sha256.map(str::to_owned),
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl FirmwarePort for EspFirmware {
    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    fn sha256_hex(&self) -> Option<String> {
        self.sha256.clone()
    }

    fn install(
        &mut self,
        request: &HttpRequest,
        _feed: &mut dyn FnMut(),
    ) -> Result<FreshnessToken, FirmwareError> {
        warn!("Firmware(sim): cannot install from {}", request.url);
        Err(FirmwareError::Transport(crate::app::ports::TransportError::NotConnected))
    }
}
