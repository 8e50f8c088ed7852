//! Display subsystem boundary
//!
//! The subsystem is what graphics clients see: a set of visible devices they
//! can open sessions against. A device calls into it when it registers,
//! unregisters, raises a hotplug event and when its mode-setting surface is
//! built or torn down.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::device::{Session, UdrmDevice};
use crate::{Error, Result};

/// Callbacks a device makes into the display subsystem
pub trait DisplaySubsystem: Send + Sync {
    /// Make `device` visible to graphics clients
    fn add(&self, device: &Arc<UdrmDevice>) -> Result<()>;

    /// Hide `device` again; must not fail
    fn remove(&self, device: &UdrmDevice);

    /// Connection state of `device` changed
    fn notify_hotplug(&self, device: &UdrmDevice);

    /// Mode objects of `device` are about to be created
    fn init_mode_surface(&self, device: &UdrmDevice) -> Result<()>;

    /// Mode objects of `device` were destroyed
    fn cleanup_mode_surface(&self, device: &UdrmDevice);
}

/// Per-device event counters kept by [`SoftDisplay`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceStats {
    pub inits: u64,
    pub cleanups: u64,
    pub hotplugs: u64,
}

impl SurfaceStats {
    fn is_idle(&self) -> bool {
        self.inits == self.cleanups
    }
}

/// Counters of devices that are hidden and unbound that are kept around
pub const RETIRED_STATS: usize = 64;

#[derive(Default)]
struct StatsTable {
    counters: HashMap<String, SurfaceStats>,
    /// Idle devices, oldest first
    retired: VecDeque<String>,
}

/// In-memory display subsystem
#[derive(Default)]
pub struct SoftDisplay {
    /// Registered devices, by name
    visible: RwLock<BTreeMap<String, Arc<UdrmDevice>>>,
    /// Event counters; only the last [`RETIRED_STATS`] idle devices are kept
    stats: Mutex<StatsTable>,
}

impl SoftDisplay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Names of the visible devices, sorted
    pub fn devices(&self) -> Vec<String> {
        self.visible.read().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<UdrmDevice>> {
        self.visible.read().get(name).cloned()
    }

    pub fn is_visible(&self, name: &str) -> bool {
        self.visible.read().contains_key(name)
    }

    /// Start a graphics session on a visible device
    pub fn open(&self, name: &str) -> Result<Session> {
        let device = self.get(name).ok_or(Error::NotFound)?;
        device.open_session()
    }

    pub fn stats(&self, name: &str) -> SurfaceStats {
        self.stats
            .lock()
            .counters
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Number of devices with counters
    pub fn tracked_devices(&self) -> usize {
        self.stats.lock().counters.len()
    }

    fn record(&self, device: &UdrmDevice, f: impl FnOnce(&mut SurfaceStats)) {
        let mut stats = self.stats.lock();
        f(stats.counters.entry(device.name().to_string()).or_default());
    }

    /// Queue the counters of a hidden, unbound device for eviction
    fn retire(&self, device: &UdrmDevice) {
        let mut stats = self.stats.lock();
        let visible = self.visible.read();
        let name = device.name();

        let idle = stats.counters.get(name).is_some_and(SurfaceStats::is_idle);
        if !idle || visible.contains_key(name) || stats.retired.iter().any(|n| n == name) {
            return;
        }
        stats.retired.push_back(name.to_string());

        while stats.retired.len() > RETIRED_STATS {
            let Some(oldest) = stats.retired.pop_front() else {
                break;
            };
            // Rebound since; it is queued again on its next cleanup
            let still_idle = stats.counters.get(&oldest).is_some_and(SurfaceStats::is_idle);
            if still_idle && !visible.contains_key(&oldest) {
                stats.counters.remove(&oldest);
            }
        }
    }
}

impl DisplaySubsystem for SoftDisplay {
    fn add(&self, device: &Arc<UdrmDevice>) -> Result<()> {
        let mut visible = self.visible.write();
        if visible.contains_key(device.name()) {
            return Err(Error::AlreadyConnected);
        }
        visible.insert(device.name().to_string(), device.clone());
        Ok(())
    }

    fn remove(&self, device: &UdrmDevice) {
        if self.visible.write().remove(device.name()).is_none() {
            log::warn!("{}: removed while not visible", device.name());
        }
        self.retire(device);
    }

    fn notify_hotplug(&self, device: &UdrmDevice) {
        self.record(device, |s| s.hotplugs += 1);
    }

    fn init_mode_surface(&self, device: &UdrmDevice) -> Result<()> {
        self.record(device, |s| s.inits += 1);
        Ok(())
    }

    fn cleanup_mode_surface(&self, device: &UdrmDevice) {
        self.record(device, |s| s.cleanups += 1);
        self.retire(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UdrmConfig;
    use crate::gem::BufferStore;

    #[test]
    fn test_visible_set() {
        let display = SoftDisplay::new();
        let device = UdrmDevice::new(display.clone(), UdrmConfig::default(), BufferStore::new());

        display.add(&device).unwrap();
        assert!(display.is_visible(device.name()));
        assert_eq!(display.add(&device), Err(Error::AlreadyConnected));
        assert_eq!(display.devices(), vec![device.name().to_string()]);

        display.remove(&device);
        assert!(display.get(device.name()).is_none());
        assert_eq!(Arc::strong_count(&device), 1);
    }

    #[test]
    fn test_open_unknown_device() {
        let display = SoftDisplay::new();
        assert_eq!(display.open("udrm-0").err(), Some(Error::NotFound));
    }

    #[test]
    fn test_counters() {
        let display = SoftDisplay::new();
        let device = UdrmDevice::new(display.clone(), UdrmConfig::default(), BufferStore::new());

        display.init_mode_surface(&device).unwrap();
        display.notify_hotplug(&device);
        display.notify_hotplug(&device);
        display.cleanup_mode_surface(&device);

        assert_eq!(
            display.stats(device.name()),
            SurfaceStats {
                inits: 1,
                cleanups: 1,
                hotplugs: 2,
            }
        );
        assert_eq!(display.stats("missing"), SurfaceStats::default());
    }

    #[test]
    fn test_idle_counters_are_bounded() {
        let display = SoftDisplay::new();
        let new_device =
            || UdrmDevice::new(display.clone(), UdrmConfig::default(), BufferStore::new());

        let visible = new_device();
        display.add(&visible).unwrap();
        display.init_mode_surface(&visible).unwrap();

        let bound = new_device();
        display.init_mode_surface(&bound).unwrap();

        let devices: Vec<_> = (0..RETIRED_STATS + 10).map(|_| new_device()).collect();
        for device in &devices {
            display.init_mode_surface(device).unwrap();
            display.cleanup_mode_surface(device);
        }

        assert_eq!(display.tracked_devices(), RETIRED_STATS + 2);
        assert_eq!(display.stats(devices[0].name()), SurfaceStats::default());
        let last = devices.last().unwrap();
        assert_eq!(display.stats(last.name()).cleanups, 1);

        // Visible or bound devices keep their counters
        assert_eq!(display.stats(visible.name()).inits, 1);
        assert_eq!(display.stats(bound.name()).inits, 1);

        // Retiring the same device twice takes one slot
        display.init_mode_surface(last).unwrap();
        display.cleanup_mode_surface(last);
        assert_eq!(display.tracked_devices(), RETIRED_STATS + 2);
        assert_eq!(display.stats(last.name()).inits, 2);

        display.remove(&visible);
        display.cleanup_mode_surface(&visible);
        assert_eq!(display.tracked_devices(), RETIRED_STATS + 1);
        assert_eq!(display.stats(visible.name()).cleanups, 1);
    }
}
