//! Device identity derived from the ESP32 WiFi station MAC.
//!
//! Format: `e32-` followed by the six MAC bytes as lowercase hex
//! (`e32-aabbccddeeff`).  Stable across reboots; used as the `{device}`
//! segment of every API path and as the provisioning device name.

use core::fmt::Write;

/// `e32-` + 12 hex digits.
pub type DeviceIdString = heapless::String<16>;

pub type MacAddress = [u8; 6];

/// Read the WiFi station MAC from eFuse.
#[cfg(target_os = "espidf")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        );
    }
    mac
}

/// Simulation: returns a deterministic fake MAC.
#[cfg(not(target_os = "espidf"))]
pub fn read_mac() -> MacAddress {
    [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]
}

pub fn device_id(mac: &MacAddress) -> DeviceIdString {
    let mut id = DeviceIdString::new();
    let _ = write!(id, "e32-");
    for b in mac {
        let _ = write!(id, "{:02x}", b);
    }
    id
}
