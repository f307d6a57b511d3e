//! Boot facts and per-cycle accounting.
//!
//! [`ResetReason`] and [`WakeupCause`] are read once at construction.
//! [`BootAccounting`] groups the fast-memory cells that the runtime writes
//! exactly once per cycle.

use core::fmt;

use crate::app::ports::StorageError;
use crate::persistent::{PersistentCell, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    PowerOn,
    ExternalPin,
    Software,
    ExceptionPanic,
    InterruptWatchdog,
    TaskWatchdog,
    OtherWatchdog,
    DeepSleep,
    Brownout,
    Sdio,
    Unknown,
}

impl ResetReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PowerOn => "POWER_ON",
            Self::ExternalPin => "EXTERNAL_PIN",
            Self::Software => "SOFTWARE",
            Self::ExceptionPanic => "EXCEPTION_PANIC",
            Self::InterruptWatchdog => "INTERRUPT_WATCHDOG",
            Self::TaskWatchdog => "TASK_WATCHDOG",
            Self::OtherWatchdog => "OTHER_WATCHDOG",
            Self::DeepSleep => "DEEP_SLEEP",
            Self::Brownout => "BROWNOUT",
            Self::Sdio => "SDIO",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// The previous cycle died: crash, any watchdog, or supply collapse.
    pub const fn is_fault(self) -> bool {
        matches!(
            self,
            Self::ExceptionPanic
                | Self::InterruptWatchdog
                | Self::TaskWatchdog
                | Self::OtherWatchdog
                | Self::Brownout
        )
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupCause {
    /// Not a deep-sleep wakeup (cold boot or reset).
    Undefined,
    All,
    Ext0,
    Ext1,
    Timer,
    Touchpad,
    Ulp,
    Gpio,
    Uart,
    Wifi,
    Cocpu,
    CocpuTrapTrig,
    Bt,
}

impl WakeupCause {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "UNDEFINED",
            Self::All => "ALL",
            Self::Ext0 => "EXT0",
            Self::Ext1 => "EXT1",
            Self::Timer => "TIMER",
            Self::Touchpad => "TOUCHPAD",
            Self::Ulp => "ULP",
            Self::Gpio => "GPIO",
            Self::Uart => "UART",
            Self::Wifi => "WIFI",
            Self::Cocpu => "COCPU",
            Self::CocpuTrapTrig => "COCPU_TRAP_TRIG",
            Self::Bt => "BT",
        }
    }
}

impl fmt::Display for WakeupCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const BOOT_COUNT_KEY: &str = "bootCount";
pub const ACTIVE_MS_KEY: &str = "activeMs";
pub const LAST_SLEEP_KEY: &str = "lastSleepS";
pub const NTP_SYNC_KEY: &str = "ntpSync";

/// Counters that describe the previous cycle until overwritten by this one.
pub struct BootAccounting {
    pub boot_count: PersistentCell<u32>,
    /// Awake time of the last completed cycle.
    pub active_ms: PersistentCell<i64>,
    pub last_sleep_s: PersistentCell<i64>,
    /// Unix time of the last successful NTP sync, `0` if never.
    pub last_ntp_sync: PersistentCell<i64>,
}

impl BootAccounting {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            boot_count: PersistentCell::fast_memory(namespace, BOOT_COUNT_KEY, 0),
            active_ms: PersistentCell::fast_memory(namespace, ACTIVE_MS_KEY, 0),
            last_sleep_s: PersistentCell::fast_memory(namespace, LAST_SLEEP_KEY, 0),
            last_ntp_sync: PersistentCell::fast_memory(namespace, NTP_SYNC_KEY, 0),
        }
    }

    pub fn init(&mut self, storage: &Storage) {
        self.boot_count.init(storage);
        self.active_ms.init(storage);
        self.last_sleep_s.init(storage);
        self.last_ntp_sync.init(storage);
    }

    /// Count this boot.  Returns the new count.
    pub fn count_boot(&mut self, storage: &mut Storage) -> Result<u32, StorageError> {
        let next = self.boot_count.get().wrapping_add(1);
        self.boot_count.set(storage, next)?;
        Ok(next)
    }

    /// Record how the cycle ends.
    pub fn record_cycle_end(
        &mut self,
        storage: &mut Storage,
        active_ms: i64,
        sleep_s: i64,
    ) -> Result<(), StorageError> {
        self.last_sleep_s.set(storage, sleep_s)?;
        self.active_ms.set(storage, active_ms)?;
        Ok(())
    }
}
