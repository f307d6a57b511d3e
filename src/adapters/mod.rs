//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter     | Implements          | Connects to                   |
//! |-------------|---------------------|-------------------------------|
//! | `nvs`       | PersistentBackend   | NVS flash / in-memory store   |
//! | `rtc`       | PersistentBackend   | `.rtc.data` slot table        |
//! | `time`      | ClockPort           | esp_timer, SNTP               |
//! | `hardware`  | SystemPort          | reset/wakeup registers, ADC   |
//! |             | PowerPort           | deep sleep, restart           |
//! | `http`      | HttpTransport       | esp_http_client + cert bundle |
//! | `firmware`  | FirmwarePort        | app descriptor, OTA slots     |
//! | `wifi`      | (none)              | ESP-IDF WiFi STA              |
//! | `device_id` | (none)              | WiFi STA MAC                  |

pub mod device_id;
pub mod firmware;
pub mod hardware;
pub mod http;
pub mod nvs;
pub mod rtc;
pub mod time;
pub mod wifi;
