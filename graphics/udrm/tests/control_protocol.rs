use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use udrm::cdev::{UDRM_CMD_PLUG, UDRM_CMD_REGISTER, UDRM_CMD_UNPLUG, UDRM_CMD_UNREGISTER};
use udrm::edid::{Aspect, EDID_LENGTH};
use udrm::{
    AddressSpace, ConnectorStatus, DisplaySubsystem, EdidBuilder, Error, FbCommand, FbFlags,
    Lifecycle, Mode, PixelFormat, PlugArgs, Result, SoftDisplay, SurfaceStats, UdrmConfig,
    UdrmDevice, UdrmNode,
};

fn node() -> (Arc<SoftDisplay>, UdrmNode) {
    let display = SoftDisplay::new();
    let node = UdrmNode::new(display.clone(), UdrmConfig::default());
    (display, node)
}

fn plug_args(mem: &mut AddressSpace, edid: &[u8]) -> u64 {
    let ptr_edid = mem.map(edid.to_vec());
    mem.map(
        PlugArgs {
            flags: 0,
            n_edid: edid.len() as u64,
            ptr_edid,
        }
        .to_bytes(),
    )
}

#[test]
fn test_register_lifecycle_sequence() {
    let (display, node) = node();
    let channel = node.open();
    let device = channel.device().clone();
    let mem = AddressSpace::new();

    assert_eq!(channel.ioctl(UDRM_CMD_UNREGISTER, 0, &mem), Err(Error::NotConnected));
    assert!(!device.has_controller());

    channel.ioctl(UDRM_CMD_REGISTER, 0, &mem).unwrap();
    assert!(device.is_registered() && device.has_controller());
    assert!(display.is_visible(device.name()));

    assert_eq!(channel.ioctl(UDRM_CMD_REGISTER, 0, &mem), Err(Error::AlreadyConnected));
    assert!(device.is_registered() && device.has_controller());
    assert_eq!(device.bind_count(), 1);

    channel.ioctl(UDRM_CMD_UNREGISTER, 0, &mem).unwrap();
    assert!(!device.is_registered() && !device.has_controller());

    assert_eq!(channel.ioctl(UDRM_CMD_UNREGISTER, 0, &mem), Err(Error::Shutdown));
    assert_eq!(channel.ioctl(UDRM_CMD_REGISTER, 0, &mem), Err(Error::Shutdown));

    // Errors map to stable errnos
    assert_eq!(Error::Shutdown.errno(), syscall::error::ESHUTDOWN);
}

#[test]
fn test_plug_bad_length_leaves_edid_unset() {
    let (_, node) = node();
    let channel = node.open();
    channel.register().unwrap();

    // Declares one extension but only the base block is supplied
    let mut edid = EdidBuilder::new().extensions(1).build();
    edid.truncate(EDID_LENGTH);
    let mut mem = AddressSpace::new();
    let args = plug_args(&mut mem, &edid);

    assert_eq!(channel.ioctl(UDRM_CMD_PLUG, args, &mem), Err(Error::InvalidArgument));
    assert!(!channel.is_plugged());
    assert!(channel.controller().edid().is_none());
    assert_eq!(channel.device().connector_status(), ConnectorStatus::Disconnected);

    // Base block plus one extension too many
    let mut edid = EdidBuilder::new().build();
    edid.extend_from_slice(&[0u8; EDID_LENGTH]);
    assert_eq!(channel.plug(Some(&edid)), Err(Error::InvalidArgument));
    assert!(channel.controller().edid().is_none());
}

#[test]
fn test_replug_reports_latest_edid() {
    let (display, node) = node();
    let channel = node.open();
    channel.register().unwrap();
    let device = channel.device().clone();

    assert_eq!(device.modes().len(), 1);
    assert_eq!(device.modes()[0].name, "800x600");

    let first = EdidBuilder::new()
        .mode(&Mode::cvt(1920, 1080, 60))
        .monitor_name("first")
        .build();
    let second = EdidBuilder::new()
        .mode(&Mode::cvt(1280, 1024, 60))
        .standard_timing(1024, Aspect::Ratio4x3, 75)
        .monitor_name("second")
        .build();

    let mut mem = AddressSpace::new();
    let first_args = plug_args(&mut mem, &first);
    let second_args = plug_args(&mut mem, &second);

    channel.ioctl(UDRM_CMD_PLUG, first_args, &mem).unwrap();
    assert_eq!(device.connector_status(), ConnectorStatus::Connected);
    assert_eq!(device.modes()[0].hdisplay, 1920);

    channel.ioctl(UDRM_CMD_UNPLUG, 0, &mem).unwrap();
    assert_eq!(device.connector_status(), ConnectorStatus::Disconnected);

    channel.ioctl(UDRM_CMD_PLUG, second_args, &mem).unwrap();
    let expected = udrm::Edid::parse(&second).unwrap();
    assert_eq!(device.modes(), expected.modes());
    assert_eq!(device.modes().len(), 2);
    assert!(device.modes().iter().all(|m| m.hdisplay != 1920));
    assert_eq!(
        channel.controller().edid().unwrap().monitor_name(),
        Some("second")
    );

    let session = display.open(device.name()).unwrap();
    let info = session.connector().unwrap();
    assert_eq!(info.status, ConnectorStatus::Connected);
    assert_eq!(info.modes, expected.modes());

    assert_eq!(display.stats(device.name()).hotplugs, 3);
}

#[test]
fn test_graphics_session_end_to_end() {
    let (display, node) = node();
    let channel = node.open();
    channel.register().unwrap();
    channel.plug(None).unwrap();

    let session = display.open(channel.device().name()).unwrap();
    assert_eq!(channel.device().bind_count(), 2);

    let dumb = session.create_dumb(1024, 768, 32).unwrap();
    session
        .buffer(dumb.handle)
        .unwrap()
        .write(0, &[0xff; 16])
        .unwrap();

    let fb = session
        .add_framebuffer(&FbCommand {
            width: 1024,
            height: 768,
            format: PixelFormat::ARGB8888,
            flags: FbFlags::empty(),
            handle: dumb.handle,
            pitch: dumb.pitch,
            offset: 0,
        })
        .unwrap();

    let first = session.page_flip(fb).unwrap();
    let second = session.page_flip(fb).unwrap();
    assert!(second.sequence > first.sequence);
    assert_eq!(channel.pending_damage(), 2);

    let report = channel.read_damage().unwrap();
    assert_eq!(report.fb_id, fb);
    assert_eq!(report.clips[0].x2, 1024);

    drop(session);
    channel.close();
    assert!(display.devices().is_empty());
    assert_eq!(node.store().live_objects(), 0);
}

/// Subsystem that can be told to refuse new devices or mode surfaces
struct FlakyDisplay {
    inner: Arc<SoftDisplay>,
    refuse: AtomicBool,
    refuse_surface: AtomicBool,
}

impl FlakyDisplay {
    fn new(inner: Arc<SoftDisplay>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            refuse: AtomicBool::new(false),
            refuse_surface: AtomicBool::new(false),
        })
    }
}

impl DisplaySubsystem for FlakyDisplay {
    fn add(&self, device: &Arc<UdrmDevice>) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::OutOfMemory);
        }
        self.inner.add(device)
    }

    fn remove(&self, device: &UdrmDevice) {
        self.inner.remove(device)
    }

    fn notify_hotplug(&self, device: &UdrmDevice) {
        self.inner.notify_hotplug(device)
    }

    fn init_mode_surface(&self, device: &UdrmDevice) -> Result<()> {
        if self.refuse_surface.load(Ordering::SeqCst) {
            return Err(Error::OutOfMemory);
        }
        self.inner.init_mode_surface(device)
    }

    fn cleanup_mode_surface(&self, device: &UdrmDevice) {
        self.inner.cleanup_mode_surface(device)
    }
}

#[test]
fn test_register_rolls_back_on_subsystem_failure() {
    let soft = SoftDisplay::new();
    let flaky = FlakyDisplay::new(soft.clone());
    flaky.refuse.store(true, Ordering::SeqCst);
    let node = UdrmNode::new(flaky.clone(), UdrmConfig::default());
    let channel = node.open();
    let device = channel.device().clone();

    assert_eq!(channel.register(), Err(Error::OutOfMemory));
    assert_eq!(device.lifecycle(), Lifecycle::New);
    assert!(!device.has_controller());
    assert_eq!(device.bind_count(), 0);
    assert!(!device.is_bound());
    let stats = soft.stats(device.name());
    assert_eq!((stats.inits, stats.cleanups), (1, 1));

    flaky.refuse.store(false, Ordering::SeqCst);
    channel.register().unwrap();
    assert!(soft.is_visible(device.name()));

    channel.close();
    let stats = soft.stats(device.name());
    assert_eq!((stats.inits, stats.cleanups), (2, 2));
    assert_eq!(Arc::strong_count(&device), 1);
}

#[test]
fn test_register_rolls_back_when_mode_surface_fails() {
    let soft = SoftDisplay::new();
    let flaky = FlakyDisplay::new(soft.clone());
    flaky.refuse_surface.store(true, Ordering::SeqCst);
    let node = UdrmNode::new(flaky.clone(), UdrmConfig::default());
    let channel = node.open();
    let device = channel.device().clone();
    let mem = AddressSpace::new();

    assert_eq!(channel.ioctl(UDRM_CMD_REGISTER, 0, &mem), Err(Error::OutOfMemory));
    assert_eq!(device.lifecycle(), Lifecycle::New);
    assert!(!device.has_controller());
    assert_eq!(device.bind_count(), 0);
    assert!(!device.is_bound());
    assert!(!soft.is_visible(device.name()));
    assert_eq!(soft.stats(device.name()), SurfaceStats::default());

    // Still unregistered, so the channel reports it that way
    assert_eq!(channel.ioctl(UDRM_CMD_UNREGISTER, 0, &mem), Err(Error::NotConnected));
    assert_eq!(device.open_session().err(), Some(Error::OutOfMemory));
    assert_eq!(device.bind_count(), 0);

    flaky.refuse_surface.store(false, Ordering::SeqCst);
    channel.ioctl(UDRM_CMD_REGISTER, 0, &mem).unwrap();
    assert!(soft.is_visible(device.name()));
    assert!(device.has_controller());

    channel.close();
    let stats = soft.stats(device.name());
    assert_eq!((stats.inits, stats.cleanups), (1, 1));
    assert_eq!(Arc::strong_count(&device), 1);
}

#[test]
fn test_connector_query_matches_monitor() {
    let (display, node) = node();
    let channel = node.open();
    channel.register().unwrap();
    let device = channel.device().clone();
    let session = display.open(device.name()).unwrap();

    let edid = EdidBuilder::new()
        .mode(&Mode::cvt(1280, 800, 60))
        .size_cm(30, 19)
        .build();
    channel.plug(Some(&edid)).unwrap();

    let info = session.connector().unwrap();
    assert_eq!(info.status, ConnectorStatus::Connected);
    assert_eq!(info.modes[0].name, "1280x800");
    assert_eq!((info.width_mm, info.height_mm), (300, 190));

    channel.unplug().unwrap();
    let info = session.connector().unwrap();
    assert_eq!(info.status, ConnectorStatus::Disconnected);
    assert_eq!(info.modes, vec![udrm::kms::default_mode(device.config())]);
    assert_eq!((info.width_mm, info.height_mm), (0, 0));

    // Plugged without an EDID: connected, default mode, no size
    channel.plug(None).unwrap();
    let info = session.connector().unwrap();
    assert_eq!(info.status, ConnectorStatus::Connected);
    assert_eq!(info.modes.len(), 1);
    assert_eq!((info.width_mm, info.height_mm), (0, 0));
}
