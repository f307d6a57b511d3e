//! PersistentCell against the host NVS and RTC backends.

use iotnode::adapters::nvs::NvsAdapter;
use iotnode::adapters::rtc::RtcMemory;
use iotnode::persistent::{
    FlashMode, Persistable, PersistentCell, Storage, StoragePreference, Tier,
};

#[derive(Clone, Default)]
struct Device {
    nvs: NvsAdapter,
    rtc: RtcMemory,
}

impl Device {
    /// Storage as seen by a fresh boot of this device.
    fn storage(&self) -> Storage {
        Storage::new(Box::new(self.rtc.clone()), Box::new(self.nvs.clone()))
    }
}

fn bound<T: Persistable>(mut cell: PersistentCell<T>, storage: &Storage) -> PersistentCell<T> {
    cell.init(storage);
    cell
}

#[test]
fn flash_values_survive_reboot() {
    let dev = Device::default();
    {
        let mut st = dev.storage();
        let mut count = bound(PersistentCell::flash("app", "count", 0i32), &st);
        let mut enabled = bound(PersistentCell::flash("app", "enabled", false), &st);
        let mut name = bound(PersistentCell::flash("app", "name", String::from("unset")), &st);
        assert_eq!(count.tier(), Tier::Flash);

        assert_eq!(count.set(&mut st, -42), Ok(true));
        assert_eq!(enabled.set(&mut st, true), Ok(true));
        assert_eq!(name.set(&mut st, "greenhouse".to_owned()), Ok(true));
    }

    dev.rtc.power_cycle();
    let st = dev.storage();
    assert_eq!(bound(PersistentCell::flash("app", "count", 0i32), &st).get(), -42);
    assert!(bound(PersistentCell::flash("app", "enabled", false), &st).get());
    assert_eq!(bound(PersistentCell::flash("app", "name", String::new()), &st).get(), "greenhouse");
}

#[test]
fn unknown_key_reads_default() {
    let dev = Device::default();
    let st = dev.storage();
    let cell = bound(PersistentCell::flash("app", "neverSet", 17i64), &st);
    assert_eq!(cell.get(), 17);
}

#[test]
fn fast_memory_survives_sleep_not_power_loss() {
    let dev = Device::default();
    {
        let mut st = dev.storage();
        let mut cell = bound(PersistentCell::fast_memory("sys", "wakeups", 0u32), &st);
        assert_eq!(cell.tier(), Tier::FastMemory);
        cell.set(&mut st, 9).unwrap();
    }
    assert_eq!(dev.nvs.write_count(), 0);

    let st = dev.storage();
    assert_eq!(bound(PersistentCell::fast_memory("sys", "wakeups", 0u32), &st).get(), 9);

    dev.rtc.power_cycle();
    let st = dev.storage();
    assert_eq!(bound(PersistentCell::fast_memory("sys", "wakeups", 0u32), &st).get(), 0);
}

#[test]
fn repeated_writes_hit_flash_once() {
    let dev = Device::default();
    let mut st = dev.storage();
    let mut cell = bound(PersistentCell::flash("app", "interval", 60i32), &st);

    assert_eq!(cell.set(&mut st, 120), Ok(true));
    assert_eq!(cell.set(&mut st, 120), Ok(false));
    assert_eq!(dev.nvs.write_count(), 1);

    // Writing the default to a fresh cell is also a no-op.
    let mut other = bound(PersistentCell::flash("app", "other", 5i32), &st);
    assert_eq!(other.set(&mut st, 5), Ok(false));
    assert_eq!(dev.nvs.write_count(), 1);
}

#[test]
fn flash_preference_moves_fast_cells_to_nvs() {
    let dev = Device::default();
    let mut st = dev.storage().with_preference(StoragePreference::Flash);
    let mut cell = bound(PersistentCell::fast_memory("sys", "wakeups", 0u32), &st);
    assert_eq!(cell.tier(), Tier::Flash);
    cell.set(&mut st, 3).unwrap();

    dev.rtc.power_cycle();
    let st = dev.storage().with_preference(StoragePreference::Flash);
    assert_eq!(bound(PersistentCell::fast_memory("sys", "wakeups", 0u32), &st).get(), 3);
    assert_eq!(dev.rtc.used_slots(), 0);
}

#[test]
fn invalid_keys_disable_persistence() {
    let dev = Device::default();
    let mut st = dev.storage();

    for mut cell in [
        bound(PersistentCell::flash("app", "", 1i32), &st),
        bound(PersistentCell::flash("", "key", 1i32), &st),
        bound(PersistentCell::flash("app", "way_too_long_key", 1i32), &st),
        bound(PersistentCell::fast_memory("sys", "", 1i32), &st),
    ] {
        assert_eq!(cell.tier(), Tier::None);
        assert_eq!(cell.set(&mut st, 2), Ok(false));
        assert_eq!(cell.get(), 1);
    }
    assert_eq!(dev.nvs.write_count(), 0);
    assert_eq!(dev.rtc.used_slots(), 0);
}

#[test]
fn explicit_mode_writes_on_flush_only() {
    let dev = Device::default();
    let mut st = dev.storage();
    let total = PersistentCell::flash("app", "total", 0i64).with_mode(FlashMode::Explicit);
    let mut cell = bound(total, &st);

    for v in 1..=5 {
        assert_eq!(cell.set(&mut st, v), Ok(true));
    }
    assert_eq!(cell.get(), 5);
    assert_eq!(dev.nvs.write_count(), 0);

    assert_eq!(cell.flush(&mut st), Ok(true));
    assert_eq!(cell.flush(&mut st), Ok(false));
    assert_eq!(dev.nvs.write_count(), 1);

    cell.set(&mut st, 6).unwrap();
    cell.reload(&st);
    assert_eq!(cell.get(), 5);
}

#[test]
fn explicit_mode_defers_initial_load() {
    let dev = Device::default();
    {
        let mut st = dev.storage();
        let mut cell = bound(PersistentCell::flash("app", "total", 0i64), &st);
        cell.set(&mut st, 77).unwrap();
    }

    let st = dev.storage();
    let total = PersistentCell::flash("app", "total", 0i64).with_mode(FlashMode::Explicit);
    let mut cell = bound(total, &st);
    assert_eq!(cell.get(), 0);
    cell.reload(&st);
    assert_eq!(cell.get(), 77);
}

#[test]
fn failed_write_keeps_cached_value() {
    let dev = Device::default();
    let mut st = dev.storage();
    let mut cell = bound(PersistentCell::flash("app", "count", 1i32), &st);

    dev.nvs.set_fail_writes(true);
    assert!(cell.set(&mut st, 2).is_err());
    assert_eq!(cell.get(), 1);
}
