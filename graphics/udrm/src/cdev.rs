//! Control node and control channels
//!
//! Every open of the control node yields a [`ControlChannel`] bound to a
//! fresh [`UdrmDevice`]. The channel drives the device through four
//! commands: REGISTER, UNREGISTER, PLUG and UNPLUG. Commands on one channel
//! are serialized; different channels never contend with each other.
//!
//! The channel's [`Controller`] is what the device sees as attached: it holds
//! the simulated monitor (plug state and EDID) and receives damage reports.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;

use crate::config::UdrmConfig;
use crate::device::{Lifecycle, UdrmDevice};
use crate::edid::{Edid, EDID_MAX_SIZE};
use crate::gem::BufferStore;
use crate::kms::DamageReport;
use crate::subsystem::DisplaySubsystem;
use crate::uaccess::UserMemory;
use crate::{Error, Result};

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Command magic
pub const UDRM_IOCTL_MAGIC: u8 = 0x99;

/// `_IOWR(ty, nr, size)`
pub const fn iowr(ty: u8, nr: u8, size: u32) -> u32 {
    ((IOC_READ | IOC_WRITE) << 30) | (size << 16) | ((ty as u32) << 8) | nr as u32
}

pub const UDRM_CMD_REGISTER: u32 = iowr(UDRM_IOCTL_MAGIC, 0x00, 8);
pub const UDRM_CMD_UNREGISTER: u32 = iowr(UDRM_IOCTL_MAGIC, 0x01, 8);
pub const UDRM_CMD_PLUG: u32 = iowr(UDRM_IOCTL_MAGIC, 0x02, PlugArgs::SIZE as u32);
pub const UDRM_CMD_UNPLUG: u32 = iowr(UDRM_IOCTL_MAGIC, 0x03, 8);

/// PLUG argument block, three little-endian u64s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlugArgs {
    /// Must be zero
    pub flags: u64,
    /// EDID length in bytes, 0 for a monitor without EDID
    pub n_edid: u64,
    /// Address of the EDID in caller memory
    pub ptr_edid: u64,
}

impl PlugArgs {
    pub const SIZE: usize = 24;

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };

        Self {
            flags: word(0),
            n_edid: word(1),
            ptr_edid: word(2),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.n_edid.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.ptr_edid.to_le_bytes());
        bytes
    }
}

/// Factory for control channels, shared by every device it creates
pub struct UdrmNode {
    subsystem: Arc<dyn DisplaySubsystem>,
    config: UdrmConfig,
    store: BufferStore,
}

impl UdrmNode {
    pub fn new(subsystem: Arc<dyn DisplaySubsystem>, config: UdrmConfig) -> Self {
        Self {
            subsystem,
            config,
            store: BufferStore::new(),
        }
    }

    pub fn config(&self) -> &UdrmConfig {
        &self.config
    }

    pub fn store(&self) -> &BufferStore {
        &self.store
    }

    /// Open a control channel on a new device
    pub fn open(&self) -> ControlChannel {
        let device = UdrmDevice::new(
            self.subsystem.clone(),
            self.config.clone(),
            self.store.clone(),
        );
        let controller = Arc::new(Controller::new(self.config.damage_queue_depth));

        ControlChannel {
            lock: Mutex::new(()),
            device,
            controller,
        }
    }
}

struct Monitor {
    plugged: bool,
    edid: Option<Arc<Edid>>,
}

/// The controller side of a channel, as seen by its device
pub struct Controller {
    open: AtomicBool,
    monitor: Mutex<Monitor>,
    damage: ArrayQueue<DamageReport>,
    dropped: AtomicU64,
}

impl Controller {
    pub(crate) fn new(damage_queue_depth: usize) -> Self {
        Self {
            open: AtomicBool::new(true),
            monitor: Mutex::new(Monitor {
                plugged: false,
                edid: None,
            }),
            damage: ArrayQueue::new(damage_queue_depth.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// False once the owning channel has been closed
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_plugged(&self) -> bool {
        self.monitor.lock().plugged
    }

    pub fn edid(&self) -> Option<Arc<Edid>> {
        self.monitor.lock().edid.clone()
    }

    pub(crate) fn monitor(&self) -> (bool, Option<Arc<Edid>>) {
        let monitor = self.monitor.lock();
        (monitor.plugged, monitor.edid.clone())
    }

    /// Queue a damage report; a full queue drops it
    pub fn deliver(&self, report: DamageReport) -> bool {
        if !self.is_open() {
            log::error!("udrm: damage delivered to a closed controller");
            return false;
        }

        match self.damage.push(report) {
            Ok(()) => true,
            Err(report) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("udrm: damage queue full, dropped fb {}", report.fb_id);
                false
            }
        }
    }

    pub fn pop_damage(&self) -> Option<DamageReport> {
        self.damage.pop()
    }

    pub fn pending_damage(&self) -> usize {
        self.damage.len()
    }

    pub fn dropped_damage(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn plug(&self, edid: Option<Edid>) -> Result<()> {
        let mut monitor = self.monitor.lock();
        if monitor.plugged {
            return Err(Error::AlreadyConnected);
        }
        if monitor.edid.is_some() {
            log::warn!("udrm: stale EDID on an unplugged controller");
        }
        monitor.edid = edid.map(Arc::new);
        monitor.plugged = true;
        Ok(())
    }

    fn unplug(&self) -> Result<()> {
        let mut monitor = self.monitor.lock();
        if !monitor.plugged {
            return Err(Error::Already);
        }
        monitor.plugged = false;
        monitor.edid = None;
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        let mut monitor = self.monitor.lock();
        monitor.plugged = false;
        monitor.edid = None;
        while self.damage.pop().is_some() {}
    }
}

/// One open handle on the control node
pub struct ControlChannel {
    /// Serializes commands issued on this handle
    lock: Mutex<()>,
    device: Arc<UdrmDevice>,
    controller: Arc<Controller>,
}

impl ControlChannel {
    pub fn device(&self) -> &Arc<UdrmDevice> {
        &self.device
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Dispatch a raw command code
    ///
    /// `arg` is zero for every command but PLUG, where it is the address of a
    /// [`PlugArgs`] block in `mem`.
    pub fn ioctl(&self, cmd: u32, arg: u64, mem: &dyn UserMemory) -> Result<()> {
        let _guard = self.lock.lock();

        #[cfg(feature = "debug-logging")]
        log::trace!("{}: ioctl {:#010x} arg {:#x}", self.device.name(), cmd, arg);

        match cmd {
            UDRM_CMD_REGISTER => self.register_locked(arg),
            UDRM_CMD_UNREGISTER => self.unregister_locked(arg),
            UDRM_CMD_PLUG => {
                self.require_registered()?;
                self.plug_from_user(arg, mem)
            }
            UDRM_CMD_UNPLUG => {
                self.require_registered()?;
                if arg != 0 {
                    return Err(Error::InvalidArgument);
                }
                self.unplug_locked()
            }
            _ => Err(Error::Unsupported),
        }
    }

    /// Attach this channel to its device and make the device visible
    pub fn register(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.register_locked(0)
    }

    /// Detach from the device; the device cannot be registered again
    pub fn unregister(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.unregister_locked(0)
    }

    /// Plug a monitor, optionally described by `edid`
    pub fn plug(&self, edid: Option<&[u8]>) -> Result<()> {
        let _guard = self.lock.lock();
        self.require_registered()?;

        let edid = match edid {
            Some(bytes) if !bytes.is_empty() => {
                if bytes.len() > EDID_MAX_SIZE {
                    return Err(Error::InvalidArgument);
                }
                if self.controller.is_plugged() {
                    return Err(Error::AlreadyConnected);
                }
                Some(Edid::parse(bytes)?)
            }
            _ => None,
        };

        self.plug_locked(edid)
    }

    pub fn unplug(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.require_registered()?;
        self.unplug_locked()
    }

    pub fn is_plugged(&self) -> bool {
        self.controller.is_plugged()
    }

    /// Oldest undelivered damage report
    pub fn read_damage(&self) -> Option<DamageReport> {
        self.controller.pop_damage()
    }

    /// Number of damage reports waiting to be read
    pub fn pending_damage(&self) -> usize {
        self.controller.pending_damage()
    }

    /// Damage reports dropped because the queue was full
    pub fn dropped_damage(&self) -> u64 {
        self.controller.dropped_damage()
    }

    /// Close the handle, unregistering the device first
    pub fn close(self) {}

    fn require_registered(&self) -> Result<()> {
        if self.device.is_registered() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn register_locked(&self, arg: u64) -> Result<()> {
        match self.device.lifecycle() {
            Lifecycle::Registered => return Err(Error::AlreadyConnected),
            Lifecycle::Unregistered => return Err(Error::Shutdown),
            Lifecycle::New => {}
        }
        if arg != 0 {
            return Err(Error::InvalidArgument);
        }

        self.device.register(self.controller.clone())
    }

    fn unregister_locked(&self, arg: u64) -> Result<()> {
        match self.device.lifecycle() {
            Lifecycle::New => return Err(Error::NotConnected),
            Lifecycle::Unregistered => return Err(Error::Shutdown),
            Lifecycle::Registered => {}
        }
        if arg != 0 {
            return Err(Error::InvalidArgument);
        }

        self.device.try_unregister()
    }

    fn plug_from_user(&self, arg: u64, mem: &dyn UserMemory) -> Result<()> {
        let mut raw = [0u8; PlugArgs::SIZE];
        mem.read(arg, &mut raw)?;
        let args = PlugArgs::from_bytes(&raw);

        if args.flags != 0 || args.n_edid > EDID_MAX_SIZE as u64 {
            return Err(Error::InvalidArgument);
        }

        if usize::try_from(args.ptr_edid).is_err() {
            return Err(Error::FaultyInput);
        }

        if self.controller.is_plugged() {
            return Err(Error::AlreadyConnected);
        }

        let edid = if args.n_edid == 0 {
            None
        } else {
            let mut bytes = Vec::new();
            bytes
                .try_reserve_exact(args.n_edid as usize)
                .map_err(|_| Error::OutOfMemory)?;
            bytes.resize(args.n_edid as usize, 0);
            mem.read(args.ptr_edid, &mut bytes)?;
            Some(Edid::parse(&bytes)?)
        };

        self.plug_locked(edid)
    }

    fn plug_locked(&self, edid: Option<Edid>) -> Result<()> {
        let name = edid
            .as_ref()
            .and_then(|e| e.monitor_name().map(str::to_string));
        let has_edid = edid.is_some();

        self.controller.plug(edid)?;
        self.device.notify_hotplug();

        log::info!(
            "{}: monitor plugged ({})",
            self.device.name(),
            match (&name, has_edid) {
                (Some(name), _) => name.as_str(),
                (None, true) => "unnamed",
                (None, false) => "no EDID",
            }
        );
        Ok(())
    }

    fn unplug_locked(&self) -> Result<()> {
        self.controller.unplug()?;
        self.device.notify_hotplug();
        log::info!("{}: monitor unplugged", self.device.name());
        Ok(())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let _guard = self.lock.lock();
        // Detach first so no damage reader can still reach the controller
        self.device.unregister();
        self.controller.close();
        log::debug!("{}: control channel closed", self.device.name());
    }
}
