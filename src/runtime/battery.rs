//! Battery voltage measurement.
//!
//! `battery_mV = adc_mV * factor / divider + offset`, measured once per
//! cycle.  A reading that is not positive is not cached, so the next call
//! measures again.

use log::{error, info, warn};

use crate::app::ports::SystemPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryCalibration {
    /// ADC-capable GPIO; negative disables measurement.
    pub pin: i32,
    pub factor: i32,
    pub divider: i32,
    pub offset_mv: i32,
}

impl BatteryCalibration {
    /// Scale a raw ADC reading.  A non-positive divider counts as 1.
    pub fn apply(&self, adc_mv: u32) -> i32 {
        let divider = if self.divider > 0 { i64::from(self.divider) } else { 1 };
        let mv = i64::from(adc_mv) * i64::from(self.factor) / divider + i64::from(self.offset_mv);
        mv.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }
}

#[derive(Debug, Default)]
pub struct BatteryGauge {
    cached_mv: Option<i32>,
}

impl BatteryGauge {
    pub fn read(&mut self, system: &mut dyn SystemPort, cal: &BatteryCalibration) -> Option<i32> {
        if cal.pin < 0 {
            error!("Battery: voltage measurement not configured");
            return None;
        }
        if let Some(mv) = self.cached_mv {
            return Some(mv);
        }
        if cal.divider <= 0 {
            warn!("Battery: divider {} invalid, using 1", cal.divider);
        }

        let Some(raw) = system.read_millivolts(cal.pin) else {
            warn!("Battery: ADC read on pin {} failed", cal.pin);
            return None;
        };
        let mv = cal.apply(raw);
        info!("Battery: pin={} raw={} mV battery={} mV", cal.pin, raw, mv);
        if mv > 0 {
            self.cached_mv = Some(mv);
        }
        Some(mv)
    }

    pub fn invalidate(&mut self) {
        self.cached_mv = None;
    }
}
