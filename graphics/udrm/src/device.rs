//! Virtual display device
//!
//! A [`UdrmDevice`] is created for every open control channel. It becomes
//! visible to graphics clients once its channel registers, and it carries the
//! mode-setting surface ([`Kms`]) for as long as anything is bound to it:
//! the registration itself, plus one binding per open graphics [`Session`].
//!
//! # Locking
//!
//! `state` serializes register, unregister, bind and unbind. `controller`
//! guards the attached controller and is only ever written with `state`
//! held. Readers on the damage path take `controller` alone and never block
//! on it; see [`UdrmDevice::acquire_controller`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use crate::cdev::Controller;
use crate::config::UdrmConfig;
use crate::edid::{Edid, Mode};
use crate::gem::{BufferObject, BufferStore, GemTable, IdAllocator};
use crate::kms::{
    self, ClipRect, ConnectorInfo, ConnectorStatus, DamageReport, FbCommand, Framebuffer, Kms,
    ModeConfig, PixelFormat, VblankEvent, CONNECTOR_VIRTUAL,
};
use crate::subsystem::DisplaySubsystem;
use crate::{Error, Result};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

fn connector_status(plugged: bool) -> ConnectorStatus {
    if plugged {
        ConnectorStatus::Connected
    } else {
        ConnectorStatus::Disconnected
    }
}

/// Registration state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, never registered
    New,
    /// Visible to graphics clients
    Registered,
    /// Unregistered; cannot be registered again
    Unregistered,
}

struct DeviceState {
    lifecycle: Lifecycle,
    n_bindings: usize,
    kms: Option<Kms>,
}

/// Emulated display adapter
pub struct UdrmDevice {
    id: u64,
    name: String,
    config: UdrmConfig,
    subsystem: Arc<dyn DisplaySubsystem>,
    store: BufferStore,
    state: Mutex<DeviceState>,
    controller: RwLock<Option<Arc<Controller>>>,
    fb_ids: Mutex<IdAllocator>,
}

impl UdrmDevice {
    pub fn new(
        subsystem: Arc<dyn DisplaySubsystem>,
        config: UdrmConfig,
        store: BufferStore,
    ) -> Arc<Self> {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("udrm-{}", id);
        log::debug!("{}: created", name);

        Arc::new(Self {
            id,
            name,
            config,
            subsystem,
            store,
            state: Mutex::new(DeviceState {
                lifecycle: Lifecycle::New,
                n_bindings: 0,
                kms: None,
            }),
            controller: RwLock::new(None),
            fb_ids: Mutex::new(IdAllocator::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process-unique name, `udrm-<id>`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &UdrmConfig {
        &self.config
    }

    pub fn store(&self) -> &BufferStore {
        &self.store
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_new(&self) -> bool {
        self.lifecycle() == Lifecycle::New
    }

    pub fn is_registered(&self) -> bool {
        self.lifecycle() == Lifecycle::Registered
    }

    /// Number of active bindings (registration plus sessions)
    pub fn bind_count(&self) -> usize {
        self.state.lock().n_bindings
    }

    /// Whether the mode-setting surface currently exists
    pub fn is_bound(&self) -> bool {
        self.state.lock().kms.is_some()
    }

    pub fn has_controller(&self) -> bool {
        self.controller.read().is_some()
    }

    /// Attach `controller`, bind and make the device visible
    ///
    /// Rolls back every partial step when binding or the subsystem fails.
    pub fn register(self: &Arc<Self>, controller: Arc<Controller>) -> Result<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::New => {}
            Lifecycle::Registered => return Err(Error::AlreadyConnected),
            Lifecycle::Unregistered => return Err(Error::Shutdown),
        }

        *self.controller.write() = Some(controller);

        if let Err(err) = self.bind_locked(&mut state) {
            *self.controller.write() = None;
            return Err(err);
        }

        if let Err(err) = self.subsystem.add(self) {
            log::warn!("{}: display subsystem refused device: {}", self.name, err);
            self.unbind_locked(&mut state);
            *self.controller.write() = None;
            return Err(err);
        }

        state.lifecycle = Lifecycle::Registered;
        log::info!("{}: registered", self.name);
        Ok(())
    }

    /// Detach the controller, hide the device and drop its binding
    ///
    /// Does nothing unless the device is registered.
    pub fn unregister(&self) {
        // The only failures are "not registered", which is a no-op here
        let _ = self.try_unregister();
    }

    /// Like [`unregister`](Self::unregister), but reports why nothing happened
    pub(crate) fn try_unregister(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::New => return Err(Error::NotConnected),
            Lifecycle::Unregistered => return Err(Error::Shutdown),
            Lifecycle::Registered => {}
        }

        // Waits for in-flight damage readers to drop their guards
        let controller = self.controller.write().take();
        if controller.is_none() {
            log::error!("{}: registered without a controller", self.name);
        }

        self.subsystem.remove(self);
        self.unbind_locked(&mut state);
        state.lifecycle = Lifecycle::Unregistered;
        log::info!("{}: unregistered", self.name);
        Ok(())
    }

    fn bind_locked(&self, state: &mut DeviceState) -> Result<()> {
        if state.n_bindings == 0 {
            if state.kms.is_some() {
                log::error!("{}: mode objects exist while unbound", self.name);
                return Err(Error::Unrecoverable);
            }

            self.subsystem.init_mode_surface(self)?;
            state.kms = Some(Kms::new());
            log::debug!("{}: mode surface created", self.name);
        }

        state.n_bindings += 1;
        log::debug!("{}: bind ({} bindings)", self.name, state.n_bindings);
        Ok(())
    }

    fn unbind_locked(&self, state: &mut DeviceState) {
        if state.n_bindings == 0 {
            log::error!("{}: unbind without a binding", self.name);
            return;
        }

        state.n_bindings -= 1;
        log::debug!("{}: unbind ({} bindings)", self.name, state.n_bindings);

        if state.n_bindings == 0 {
            state.kms = None;
            self.subsystem.cleanup_mode_surface(self);
            log::debug!("{}: mode surface destroyed", self.name);
        }
    }

    /// Open a graphics client session, binding the device
    pub fn open_session(self: &Arc<Self>) -> Result<Session> {
        self.bind_locked(&mut self.state.lock())?;
        Ok(Session {
            device: self.clone(),
            objects: Mutex::new(GemTable::new()),
            framebuffers: Mutex::new(HashMap::new()),
        })
    }

    fn close_session(&self, framebuffers: &HashMap<u32, Arc<Framebuffer>>) {
        let mut state = self.state.lock();
        if let Some(kms) = state.kms.as_mut() {
            let scanned_out = kms.pipe().plane_fb().map(|fb| fb.id());
            if scanned_out.is_some_and(|id| framebuffers.contains_key(&id)) {
                kms.pipe_mut().disable();
            }
        }
        self.unbind_locked(&mut state);
    }

    /// Borrow the attached controller for damage delivery
    ///
    /// Returns `None` when no controller is attached or when an attach or
    /// detach is in progress; it never waits. The guard must not be held
    /// across anything that blocks.
    pub fn acquire_controller(&self) -> Option<MappedRwLockReadGuard<'_, Controller>> {
        let guard = self.controller.try_read()?;
        RwLockReadGuard::try_map(guard, |slot| slot.as_deref()).ok()
    }

    /// Counterpart of [`acquire_controller`](Self::acquire_controller)
    pub fn release_controller(&self, controller: MappedRwLockReadGuard<'_, Controller>) {
        drop(controller);
    }

    /// Hand a frame update to the controller, if one is attached
    pub fn forward_damage(&self, report: DamageReport) {
        match self.acquire_controller() {
            Some(controller) => {
                controller.deliver(report);
                self.release_controller(controller);
            }
            None => log::trace!("{}: no controller, damage dropped", self.name),
        }
    }

    /// Framebuffer ids stay reserved until the framebuffer is dropped
    pub(crate) fn release_fb_id(&self, id: u32) {
        self.fb_ids.lock().release(id);
    }

    pub(crate) fn notify_hotplug(&self) {
        self.subsystem.notify_hotplug(self);
    }

    /// Plug state and EDID of the attached controller
    fn monitor(&self) -> (bool, Option<Arc<Edid>>) {
        match self.controller.read().as_ref() {
            Some(controller) => controller.monitor(),
            None => (false, None),
        }
    }

    pub fn connector_status(&self) -> ConnectorStatus {
        connector_status(self.monitor().0)
    }

    /// Modes of the plugged monitor, or the default mode
    pub fn modes(&self) -> Vec<Mode> {
        let (plugged, edid) = self.monitor();
        self.modes_of(plugged, edid.as_deref())
    }

    fn modes_of(&self, plugged: bool, edid: Option<&Edid>) -> Vec<Mode> {
        kms::connector_modes(edid.filter(|_| plugged), &self.config)
    }

    pub fn mode_config(&self) -> ModeConfig {
        ModeConfig::from(&self.config)
    }

    fn with_kms<T>(&self, f: impl FnOnce(&mut Kms) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let kms = state.kms.as_mut().ok_or(Error::Unrecoverable)?;
        Ok(f(kms))
    }
}

impl Drop for UdrmDevice {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.lifecycle == Lifecycle::Registered {
            log::error!("{}: destroyed while registered", self.name);
        }
        if state.n_bindings > 0 || state.kms.is_some() {
            log::error!(
                "{}: destroyed with {} bindings",
                self.name,
                state.n_bindings
            );
        }
        if self.controller.get_mut().is_some() {
            log::error!("{}: destroyed with a controller attached", self.name);
        }
        log::debug!("{}: destroyed", self.name);
    }
}

impl core::fmt::Debug for UdrmDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UdrmDevice")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Dumb buffer created through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: usize,
}

/// Graphics client session, holding one binding on its device
pub struct Session {
    device: Arc<UdrmDevice>,
    objects: Mutex<GemTable>,
    framebuffers: Mutex<HashMap<u32, Arc<Framebuffer>>>,
}

impl Session {
    pub fn device(&self) -> &Arc<UdrmDevice> {
        &self.device
    }

    pub fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        let (bo, layout) = self.device.store.create_dumb(width, height, bpp)?;
        let handle = self.objects.lock().insert(bo)?;
        log::debug!(
            "{}: dumb buffer {} ({}x{}@{}, {} bytes)",
            self.device.name,
            handle,
            width,
            height,
            bpp,
            layout.size
        );

        Ok(DumbBuffer {
            handle,
            pitch: layout.pitch,
            size: layout.size,
        })
    }

    /// Fake mmap offset of a buffer handle
    pub fn map_dumb(&self, handle: u32) -> Result<u64> {
        Ok(self.buffer(handle)?.mmap_offset())
    }

    pub fn destroy_dumb(&self, handle: u32) -> Result<()> {
        self.objects
            .lock()
            .remove(handle)
            .map(drop)
            .ok_or(Error::NotFound)
    }

    pub fn buffer(&self, handle: u32) -> Result<Arc<BufferObject>> {
        self.objects.lock().get(handle).ok_or(Error::NotFound)
    }

    /// Wrap a buffer handle in a framebuffer, returning its id
    pub fn add_framebuffer(&self, cmd: &FbCommand) -> Result<u32> {
        let bo = self
            .objects
            .lock()
            .get(cmd.handle)
            .ok_or(Error::InvalidArgument)?;
        let formats = self.device.with_kms(|kms| kms.formats())?;

        let id = self.device.fb_ids.lock().alloc()?;
        let fb = match Framebuffer::new(
            id,
            bo,
            cmd,
            formats,
            &self.device.config,
            Arc::downgrade(&self.device),
        ) {
            Ok(fb) => fb,
            Err(err) => {
                self.device.release_fb_id(id);
                return Err(err);
            }
        };
        log::debug!("{}: framebuffer {} created: {:?}", self.device.name, id, fb);

        self.framebuffers.lock().insert(id, Arc::new(fb));
        Ok(id)
    }

    /// Drop a framebuffer, disabling the pipe if it was scanning it out
    pub fn remove_framebuffer(&self, fb_id: u32) -> Result<()> {
        let fb = self
            .framebuffers
            .lock()
            .remove(&fb_id)
            .ok_or(Error::NotFound)?;

        self.device.with_kms(|kms| {
            if kms.pipe().plane_fb().is_some_and(|f| Arc::ptr_eq(f, &fb)) {
                kms.pipe_mut().disable();
            }
        })?;

        Ok(())
    }

    pub fn framebuffer(&self, fb_id: u32) -> Result<Arc<Framebuffer>> {
        self.framebuffers
            .lock()
            .get(&fb_id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Report damaged regions of a framebuffer to the controller
    pub fn dirty_framebuffer(&self, fb_id: u32, clips: &[ClipRect]) -> Result<()> {
        self.framebuffer(fb_id)?.mark_dirty(clips)
    }

    /// Scan out a framebuffer and forward the full frame as damage
    pub fn page_flip(&self, fb_id: u32) -> Result<VblankEvent> {
        let fb = self.framebuffer(fb_id)?;
        let event = self.device.with_kms(|kms| kms.pipe_mut().update(fb.clone()))?;

        self.device.forward_damage(DamageReport {
            fb_id,
            clips: vec![ClipRect::full(fb.width(), fb.height())],
        });

        Ok(event)
    }

    /// Turn the display pipe off
    pub fn disable(&self) -> Result<()> {
        self.device.with_kms(|kms| {
            kms.pipe_mut().disable();
        })
    }

    /// Id of the framebuffer currently scanned out
    pub fn scanout(&self) -> Result<Option<u32>> {
        self.device
            .with_kms(|kms| kms.pipe().plane_fb().map(|fb| fb.id()))
    }

    pub fn connector(&self) -> Result<ConnectorInfo> {
        let (id, name) = self.device.with_kms(|kms| {
            (
                kms.connector().id(),
                kms.connector().name().to_string(),
            )
        })?;

        // One snapshot so a concurrent hotplug cannot mix two monitors
        let (plugged, edid) = self.device.monitor();
        let (width_mm, height_mm) = match (&edid, plugged) {
            (Some(edid), true) => edid.size_mm(),
            _ => (0, 0),
        };

        Ok(ConnectorInfo {
            id,
            connector_type: CONNECTOR_VIRTUAL,
            name,
            status: connector_status(plugged),
            modes: self.device.modes_of(plugged, edid.as_deref()),
            width_mm,
            height_mm,
        })
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.device.modes()
    }

    pub fn connector_status(&self) -> ConnectorStatus {
        self.device.connector_status()
    }

    pub fn formats(&self) -> Result<&'static [PixelFormat]> {
        self.device.with_kms(|kms| kms.formats())
    }

    pub fn mode_config(&self) -> ModeConfig {
        self.device.mode_config()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let framebuffers = std::mem::take(self.framebuffers.get_mut());
        self.device.close_session(&framebuffers);
        drop(framebuffers);
        self.objects.get_mut().clear();
    }
}
