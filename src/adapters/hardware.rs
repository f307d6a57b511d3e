//! System adapter: boot facts, identity, ADC and power actions.
//!
//! Implements [`SystemPort`] and [`PowerPort`].  This is the only module
//! that touches reset/sleep registers and the ADC.  On non-espidf targets
//! a configurable simulation stands in.

use core::time::Duration;

use log::info;

use crate::adapters::device_id::{MacAddress, read_mac};
use crate::app::ports::{PowerPort, SystemPort};
use crate::runtime::boot::{ResetReason, WakeupCause};

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

// ── ESP32 ─────────────────────────────────────────────────────

/// Full-scale input at 12 dB attenuation, mV.
#[cfg(target_os = "espidf")]
const ADC_FULL_SCALE_MV: u32 = 3100;
#[cfg(target_os = "espidf")]
const ADC_MAX_RAW: u32 = 4095;

#[cfg(target_os = "espidf")]
pub struct EspSystem {
    adc_units: [adc_oneshot_unit_handle_t; 2],
}

#[cfg(target_os = "espidf")]
impl Default for EspSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
impl EspSystem {
    pub fn new() -> Self {
        Self {
            adc_units: [core::ptr::null_mut(); 2],
        }
    }

    /// Oneshot unit for `unit`, created on first use.
    fn adc_unit(&mut self, unit: adc_unit_t) -> Option<adc_oneshot_unit_handle_t> {
        let slot = self.adc_units.get_mut(unit as usize)?;
        if slot.is_null() {
            let init_cfg = adc_oneshot_unit_init_cfg_t {
                unit_id: unit,
                ulp_mode: adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
                ..Default::default()
            };
            // SAFETY: single-threaded; the handle is stored and never freed.
            let ret = unsafe { adc_oneshot_new_unit(&init_cfg, slot) };
            if ret != ESP_OK as i32 {
                log::warn!("ADC: unit {} init failed ({})", unit, ret);
                *slot = core::ptr::null_mut();
                return None;
            }
        }
        Some(*slot)
    }
}

#[cfg(target_os = "espidf")]
impl SystemPort for EspSystem {
    fn reset_reason(&self) -> ResetReason {
        match unsafe { esp_reset_reason() } {
            esp_reset_reason_t_ESP_RST_POWERON => ResetReason::PowerOn,
            esp_reset_reason_t_ESP_RST_EXT => ResetReason::ExternalPin,
            esp_reset_reason_t_ESP_RST_SW => ResetReason::Software,
            esp_reset_reason_t_ESP_RST_PANIC => ResetReason::ExceptionPanic,
            esp_reset_reason_t_ESP_RST_INT_WDT => ResetReason::InterruptWatchdog,
            esp_reset_reason_t_ESP_RST_TASK_WDT => ResetReason::TaskWatchdog,
            esp_reset_reason_t_ESP_RST_WDT => ResetReason::OtherWatchdog,
            esp_reset_reason_t_ESP_RST_DEEPSLEEP => ResetReason::DeepSleep,
            esp_reset_reason_t_ESP_RST_BROWNOUT => ResetReason::Brownout,
            esp_reset_reason_t_ESP_RST_SDIO => ResetReason::Sdio,
            _ => ResetReason::Unknown,
        }
    }

    fn wakeup_cause(&self) -> WakeupCause {
        match unsafe { esp_sleep_get_wakeup_cause() } {
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_ALL => WakeupCause::All,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0 => WakeupCause::Ext0,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT1 => WakeupCause::Ext1,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER => WakeupCause::Timer,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_TOUCHPAD => WakeupCause::Touchpad,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_ULP => WakeupCause::Ulp,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_GPIO => WakeupCause::Gpio,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_UART => WakeupCause::Uart,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_WIFI => WakeupCause::Wifi,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_COCPU => WakeupCause::Cocpu,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_COCPU_TRAP_TRIG => WakeupCause::CocpuTrapTrig,
            esp_sleep_source_t_ESP_SLEEP_WAKEUP_BT => WakeupCause::Bt,
            _ => WakeupCause::Undefined,
        }
    }

    fn mac_address(&self) -> MacAddress {
        read_mac()
    }

    fn read_millivolts(&mut self, pin: i32) -> Option<u32> {
        let mut unit: adc_unit_t = 0;
        let mut channel: adc_channel_t = 0;
        if unsafe { adc_oneshot_io_to_channel(pin, &mut unit, &mut channel) } != ESP_OK as i32 {
            log::warn!("ADC: GPIO {} is not an ADC pin", pin);
            return None;
        }
        let handle = self.adc_unit(unit)?;

        let chan_cfg = adc_oneshot_chan_cfg_t {
            atten: adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        if unsafe { adc_oneshot_config_channel(handle, channel, &chan_cfg) } != ESP_OK as i32 {
            return None;
        }

        let mut raw: i32 = 0;
        if unsafe { adc_oneshot_read(handle, channel, &mut raw) } != ESP_OK as i32 {
            return None;
        }
        Some(raw.max(0) as u32 * ADC_FULL_SCALE_MV / ADC_MAX_RAW)
    }

    fn wifi_rssi(&self) -> Option<i8> {
        let mut ap_info: wifi_ap_record_t = unsafe { core::mem::zeroed() };
        let ret = unsafe { esp_wifi_sta_get_ap_info(&mut ap_info) };
        (ret == ESP_OK as i32).then_some(ap_info.rssi)
    }
}

#[cfg(target_os = "espidf")]
impl PowerPort for EspSystem {
    fn deep_sleep(&mut self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        info!("Power: deep sleep for {} s", duration.as_secs());
        unsafe { esp_deep_sleep(us) };
    }

    fn restart(&mut self) {
        info!("Power: restart");
        unsafe { esp_restart() };
    }

    fn power_off(&mut self) {
        info!("Power: shutdown (deep sleep without wakeup sources)");
        unsafe {
            esp_sleep_disable_wakeup_source(esp_sleep_source_t_ESP_SLEEP_WAKEUP_ALL);
            esp_deep_sleep_start();
        }
    }
}

// ── Host simulation ───────────────────────────────────────────

/// What the simulated chip was last asked to do.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    DeepSleep(Duration),
    Restart,
    PowerOff,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone)]
pub struct EspSystem {
    reset_reason: ResetReason,
    wakeup_cause: WakeupCause,
    battery_adc_mv: Option<u32>,
    rssi: Option<i8>,
    last_action: Option<PowerAction>,
}

#[cfg(not(target_os = "espidf"))]
impl Default for EspSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "espidf"))]
impl EspSystem {
    pub fn new() -> Self {
        Self {
            reset_reason: ResetReason::PowerOn,
            wakeup_cause: WakeupCause::Undefined,
            battery_adc_mv: Some(2000),
            rssi: Some(-60),
            last_action: None,
        }
    }

    pub fn with_reset_reason(mut self, reason: ResetReason) -> Self {
        self.reset_reason = reason;
        self
    }

    pub fn with_wakeup_cause(mut self, cause: WakeupCause) -> Self {
        self.wakeup_cause = cause;
        self
    }

    /// Raw ADC reading returned for every pin; `None` fails the read.
    pub fn with_adc_millivolts(mut self, mv: Option<u32>) -> Self {
        self.battery_adc_mv = mv;
        self
    }

    pub fn with_rssi(mut self, rssi: Option<i8>) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn last_action(&self) -> Option<PowerAction> {
        self.last_action
    }
}

#[cfg(not(target_os = "espidf"))]
impl SystemPort for EspSystem {
    fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }

    fn wakeup_cause(&self) -> WakeupCause {
        self.wakeup_cause
    }

    fn mac_address(&self) -> MacAddress {
        read_mac()
    }

    fn read_millivolts(&mut self, _pin: i32) -> Option<u32> {
        self.battery_adc_mv
    }

    fn wifi_rssi(&self) -> Option<i8> {
        self.rssi
    }
}

#[cfg(not(target_os = "espidf"))]
impl PowerPort for EspSystem {
    fn deep_sleep(&mut self, duration: Duration) {
        info!("Power(sim): deep sleep for {} s", duration.as_secs());
        self.last_action = Some(PowerAction::DeepSleep(duration));
    }

    fn restart(&mut self) {
        info!("Power(sim): restart");
        self.last_action = Some(PowerAction::Restart);
    }

    fn power_off(&mut self) {
        info!("Power(sim): shutdown");
        self.last_action = Some(PowerAction::PowerOff);
    }
}
