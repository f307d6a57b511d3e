//! RTC slow-memory adapter.
//!
//! The fast tier of [`crate::persistent::Storage`]: a fixed slot table in
//! the `.rtc.data` section.  It survives deep sleep and every reset other
//! than power-on, so a brownout or watchdog reset keeps it.  The image
//! initialises it on cold boot; a magic word tells a formatted table from
//! an uninitialised one.
//!
//! ```text
//!   RtcRegion { magic, slots[RTC_SLOTS] }
//!   Slot      { "namespace key", len, data[RTC_SLOT_DATA] }
//! ```
//!
//! Slot names are compared byte-wise; a full table reports
//! [`StorageError::Full`].

use crate::app::ports::{MAX_KEY_LEN, PersistentBackend, StorageError, validate_key};

pub const RTC_SLOTS: usize = 24;
pub const RTC_SLOT_DATA: usize = 64;

const RTC_MAGIC: u32 = 0x5254_4331;
const NAME_LEN: usize = 2 * MAX_KEY_LEN + 1;
// Never valid inside a key, so `namespace SEP key` is unambiguous.
const SEPARATOR: u8 = b' ';

#[derive(Clone, Copy)]
struct Slot {
    name_len: u8,
    name: [u8; NAME_LEN],
    data_len: u8,
    data: [u8; RTC_SLOT_DATA],
}

impl Slot {
    const EMPTY: Self = Self {
        name_len: 0,
        name: [0; NAME_LEN],
        data_len: 0,
        data: [0; RTC_SLOT_DATA],
    };

    fn name(&self) -> &[u8] {
        &self.name[..usize::from(self.name_len)]
    }

    fn is_free(&self) -> bool {
        self.name_len == 0
    }
}

/// Raw layout of the retained region.
#[derive(Clone)]
pub struct RtcRegion {
    magic: u32,
    slots: [Slot; RTC_SLOTS],
}

impl RtcRegion {
    pub const fn new() -> Self {
        Self {
            magic: 0,
            slots: [Slot::EMPTY; RTC_SLOTS],
        }
    }

    /// Format the table unless it already carries the magic word.
    fn validate(&mut self) -> bool {
        if self.magic == RTC_MAGIC {
            return true;
        }
        *self = Self::new();
        self.magic = RTC_MAGIC;
        false
    }

    fn find(&self, name: &[u8]) -> Option<usize> {
        self.slots.iter().position(|s| !s.is_free() && s.name() == name)
    }

    fn read(&self, name: &[u8], buf: &mut [u8]) -> Result<usize, StorageError> {
        let slot = &self.slots[self.find(name).ok_or(StorageError::NotFound)?];
        let len = usize::from(slot.data_len);
        let dst = buf.get_mut(..len).ok_or(StorageError::IoError)?;
        dst.copy_from_slice(&slot.data[..len]);
        Ok(len)
    }

    fn write(&mut self, name: &[u8], data: &[u8]) -> Result<(), StorageError> {
        if data.len() > RTC_SLOT_DATA {
            return Err(StorageError::Full);
        }
        let index = match self.find(name) {
            Some(i) => i,
            None => self.slots.iter().position(Slot::is_free).ok_or(StorageError::Full)?,
        };
        let slot = &mut self.slots[index];
        slot.name[..name.len()].copy_from_slice(name);
        slot.name_len = name.len() as u8;
        slot.data[..data.len()].copy_from_slice(data);
        slot.data_len = data.len() as u8;
        Ok(())
    }

    fn delete(&mut self, name: &[u8]) {
        if let Some(i) = self.find(name) {
            self.slots[i] = Slot::EMPTY;
        }
    }

    fn used(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }
}

impl Default for RtcRegion {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_name(namespace: &str, key: &str) -> Result<([u8; NAME_LEN], usize), StorageError> {
    validate_key(namespace)?;
    validate_key(key)?;
    let mut name = [0u8; NAME_LEN];
    let ns = namespace.len();
    name[..ns].copy_from_slice(namespace.as_bytes());
    name[ns] = SEPARATOR;
    name[ns + 1..ns + 1 + key.len()].copy_from_slice(key.as_bytes());
    Ok((name, ns + 1 + key.len()))
}

// ── ESP32 ─────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
#[unsafe(link_section = ".rtc.data")]
static mut REGION: RtcRegion = RtcRegion::new();

#[cfg(target_os = "espidf")]
static TAKEN: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

#[cfg(target_os = "espidf")]
pub struct RtcMemory {
    region: &'static mut RtcRegion,
}

#[cfg(target_os = "espidf")]
impl RtcMemory {
    /// Claim the retained region.  Returns `None` on the second call.
    pub fn take() -> Option<Self> {
        if TAKEN.swap(true, core::sync::atomic::Ordering::AcqRel) {
            return None;
        }
        // SAFETY: TAKEN guarantees this is the only reference ever created.
        let region = unsafe { &mut *core::ptr::addr_of_mut!(REGION) };
        if !region.validate() {
            log::info!("RtcMemory: retained region formatted (cold boot)");
        }
        Some(Self { region })
    }

    fn region(&self) -> &RtcRegion {
        &*self.region
    }

    fn region_mut(&mut self) -> &mut RtcRegion {
        &mut *self.region
    }
}

// ── Host simulation ───────────────────────────────────────────

/// Host stand-in.  Clones share one region, so a test can keep a handle
/// and simulate deep sleep (rebuild on the same region) or power loss
/// ([`RtcMemory::power_cycle`]).
#[cfg(not(target_os = "espidf"))]
#[derive(Clone)]
pub struct RtcMemory {
    region: std::rc::Rc<std::cell::RefCell<RtcRegion>>,
}

#[cfg(not(target_os = "espidf"))]
impl RtcMemory {
    pub fn new() -> Self {
        let mut region = RtcRegion::new();
        region.validate();
        Self {
            region: std::rc::Rc::new(std::cell::RefCell::new(region)),
        }
    }

    /// Lose the retained contents, as a power-on reset would.
    pub fn power_cycle(&self) {
        let mut region = self.region.borrow_mut();
        region.magic = 0;
        region.validate();
    }

    fn region(&self) -> std::cell::Ref<'_, RtcRegion> {
        self.region.borrow()
    }

    fn region_mut(&mut self) -> std::cell::RefMut<'_, RtcRegion> {
        self.region.borrow_mut()
    }
}

#[cfg(not(target_os = "espidf"))]
impl Default for RtcMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcMemory {
    /// Occupied slots.
    pub fn used_slots(&self) -> usize {
        self.region().used()
    }
}

impl PersistentBackend for RtcMemory {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let (name, len) = slot_name(namespace, key)?;
        self.region().read(&name[..len], buf)
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let (name, len) = slot_name(namespace, key)?;
        self.region_mut().write(&name[..len], data)
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let (name, len) = slot_name(namespace, key)?;
        self.region_mut().delete(&name[..len]);
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        slot_name(namespace, key)
            .is_ok_and(|(name, len)| self.region().find(&name[..len]).is_some())
    }
}
