//! Crate-wide error type.
//!
//! Each concern keeps its own `Copy` error enum; operations that cross
//! concerns (firmware update talks to the API, then to the OTA
//! partitions, then to NVS) funnel them into [`Error`].

use core::fmt;

use crate::api::ApiError;
use crate::app::ports::{FirmwareError, StorageError, TransportError};
use crate::remote_config::ConfigError;

/// Every fallible runtime operation converts into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A persistent backend rejected a read or write.
    Storage(StorageError),
    /// The config document or registry failed.
    Config(ConfigError),
    /// The device API answered badly or not at all.
    Api(ApiError),
    /// Downloading or activating a firmware image failed.
    Firmware(FirmwareError),
    /// No HTTP status was obtained.
    Transport(TransportError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Api(e) => write!(f, "api: {e}"),
            Self::Firmware(e) => write!(f, "firmware: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ApiError> for Error {
    fn from(e: ApiError) -> Self {
        Self::Api(e)
    }
}

impl From<FirmwareError> for Error {
    fn from(e: FirmwareError) -> Self {
        Self::Firmware(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
