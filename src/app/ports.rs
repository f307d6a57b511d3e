//! Port traits: the hexagonal boundary between the runtime and the chip.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ DeviceRuntime / cells / registry
//! ```
//!
//! Every vendor primitive the runtime depends on (NVS flash, RTC memory,
//! the high-resolution timer, deep sleep, the HTTP client, the OTA
//! partitions) is reached through one of these traits.  The adapters in
//! [`crate::adapters`] implement them for ESP-IDF and for host simulation;
//! integration tests substitute recorders.

use core::fmt;
use core::time::Duration;

use crate::remote_config::FreshnessToken;
use crate::runtime::boot::{ResetReason, WakeupCause};

/// NVS limits keys and namespaces to 15 bytes plus the terminator.
pub const MAX_KEY_LEN: usize = 15;

// ───────────────────────────────────────────────────────────────
// Persistent backend (driven adapter: cells ↔ RTC memory / NVS)
// ───────────────────────────────────────────────────────────────

/// Byte-level key-value store under `(namespace, key)`.
///
/// Two implementations exist on the device: the battery-backed RTC region
/// (survives deep sleep, lost on power loss) and NVS flash (durable,
/// wear-limited).  Values are opaque to the backend; encoding lives in
/// [`crate::persistent`].
pub trait PersistentBackend {
    /// Read a value.  Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

/// Reject keys that NVS would refuse: empty, longer than
/// [`MAX_KEY_LEN`], or containing non-printable / non-ASCII bytes.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey);
    }
    if !key.bytes().all(|b| (0x21..=0x7E).contains(&b)) {
        return Err(StorageError::InvalidKey);
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic uptime, wall-clock time and blocking delays.
pub trait ClockPort {
    /// Milliseconds since boot (monotonic).
    fn uptime_ms(&self) -> u64;

    /// Seconds since the Unix epoch.  Implausibly small until the first
    /// NTP sync completes.
    fn unix_time_secs(&self) -> i64;

    /// Block the single execution context.
    fn delay_ms(&mut self, ms: u32);

    /// Start (or restart) background SNTP synchronisation.
    /// Returns `false` if the SNTP service could not be started.
    fn start_time_sync(&mut self, servers: &[&'static str]) -> bool;
}

// ───────────────────────────────────────────────────────────────
// System port (boot facts, identity, analog input)
// ───────────────────────────────────────────────────────────────

pub trait SystemPort {
    fn reset_reason(&self) -> ResetReason;

    fn wakeup_cause(&self) -> WakeupCause;

    /// WiFi station MAC address.
    fn mac_address(&self) -> [u8; 6];

    /// Read an analog pin in millivolts.  `None` if the pin has no ADC
    /// channel or the conversion failed.
    fn read_millivolts(&mut self, pin: i32) -> Option<u32>;

    /// Signal strength of the associated access point.
    fn wifi_rssi(&self) -> Option<i8>;
}

// ───────────────────────────────────────────────────────────────
// Power port (terminal hardware actions)
// ───────────────────────────────────────────────────────────────

/// The three ways a boot cycle ends.  On the device none of these
/// return; test doubles record the call and return normally.
pub trait PowerPort {
    fn deep_sleep(&mut self, duration: Duration);

    fn restart(&mut self);

    /// Deep sleep with no wakeup source armed.
    fn power_off(&mut self);
}

// ───────────────────────────────────────────────────────────────
// HTTP transport port
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved request: absolute URL, final header set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_str(&self) -> &str {
        core::str::from_utf8(&self.body).unwrap_or("")
    }

    /// Freshness token carried by `ETag` / `Last-Modified`.
    pub fn freshness_token(&self) -> FreshnessToken {
        FreshnessToken {
            etag: self.header("etag").unwrap_or_default().to_owned(),
            last_modified: self.header("last-modified").unwrap_or_default().to_owned(),
        }
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Blocking HTTP(S) client.  One request at a time; the caller-supplied
/// timeout bounds the whole exchange.
pub trait HttpTransport {
    /// Whether the network link is up.  Remote logging is skipped when not.
    fn is_connected(&self) -> bool;

    /// Execute a request.  Any HTTP status (including 4xx/5xx) is `Ok`;
    /// `Err` means no status was obtained.
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

// ───────────────────────────────────────────────────────────────
// Firmware port (running image identity + OTA install)
// ───────────────────────────────────────────────────────────────

pub trait FirmwarePort {
    /// Human-readable identity of the running image.
    fn version(&self) -> Option<String>;

    /// Lowercase hex SHA-256 of the running ELF.
    fn sha256_hex(&self) -> Option<String>;

    /// Download `request` into the inactive OTA partition, validate it and
    /// mark it bootable.  Returns the freshness token of the download.
    ///
    /// `feed` is called for every chunk written so a supervising watchdog
    /// stays quiet through a slow download.
    fn install(
        &mut self,
        request: &HttpRequest,
        feed: &mut dyn FnMut(),
    ) -> Result<FreshnessToken, FirmwareError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`PersistentBackend`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition (or the RTC slot table) is full.
    Full,
    /// Generic I/O error.
    IoError,
    /// Namespace or key violates the NVS naming rules.
    InvalidKey,
    /// Stored bytes failed to decode.
    Corrupted,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
            Self::InvalidKey => write!(f, "invalid namespace or key"),
            Self::Corrupted => write!(f, "stored value corrupted"),
        }
    }
}

impl std::error::Error for StorageError {}

impl StorageError {
    /// Backend conditions a later attempt may not hit again.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Full | Self::IoError)
    }
}

/// Errors from [`HttpTransport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No network link.
    NotConnected,
    /// TCP/TLS connection could not be established.
    ConnectFailed,
    Timeout,
    /// Reading or writing the body failed mid-exchange.
    Io,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "network not connected"),
            Self::ConnectFailed => write!(f, "connection failed"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Io => write!(f, "I/O error during exchange"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors from [`FirmwarePort::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareError {
    Transport(TransportError),
    /// Download answered with a non-2xx status.
    Status(u16),
    /// No inactive OTA partition / begin failed.
    BeginFailed,
    WriteFailed,
    /// Image failed verification after download.
    ValidationFailed,
    BootSetFailed,
}

impl fmt::Display for FirmwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "download failed: {e}"),
            Self::Status(s) => write!(f, "download answered status {s}"),
            Self::BeginFailed => write!(f, "OTA begin failed"),
            Self::WriteFailed => write!(f, "OTA write failed"),
            Self::ValidationFailed => write!(f, "image validation failed"),
            Self::BootSetFailed => write!(f, "set boot partition failed"),
        }
    }
}

impl std::error::Error for FirmwareError {}

impl From<TransportError> for FirmwareError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
