//! Mode-setting objects of a bound device
//!
//! A bound device owns exactly one virtual connector wired to one simple
//! display pipe (CRTC + primary plane). Framebuffers wrap buffer objects with
//! the geometry a client scans out; every update or dirty call on them is
//! forwarded to the device's controller as a [`DamageReport`].

use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::config::UdrmConfig;
use crate::device::UdrmDevice;
use crate::edid::{Edid, Mode, ModeType};
use crate::gem::BufferObject;
use crate::{Error, Result};

/// Connector type reported for the virtual output
pub const CONNECTOR_VIRTUAL: u32 = 15;

const CONNECTOR_ID: u32 = 1;

/// DRM fourcc pixel format
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const ARGB8888: Self = Self::fourcc(b'A', b'R', b'2', b'4');
    pub const XRGB8888: Self = Self::fourcc(b'X', b'R', b'2', b'4');

    pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(a as u32 | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24)
    }

    pub const fn from_code(code: u32) -> Self {
        Self(code)
    }

    pub fn code(self) -> u32 {
        self.0
    }

    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::ARGB8888 | Self::XRGB8888 => Some(4),
            _ => None,
        }
    }
}

impl core::fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            write!(
                f,
                "PixelFormat({}{}{}{})",
                bytes[0] as char, bytes[1] as char, bytes[2] as char, bytes[3] as char
            )
        } else {
            write!(f, "PixelFormat({:#010x})", self.0)
        }
    }
}

/// Formats the primary plane accepts
pub const FORMATS: [PixelFormat; 2] = [PixelFormat::ARGB8888, PixelFormat::XRGB8888];

bitflags! {
    /// Framebuffer creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FbFlags: u32 {
        const INTERLACED = 1 << 0;
        const MODIFIERS = 1 << 1;
    }
}

/// Framebuffer creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbCommand {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub flags: FbFlags,
    /// Buffer handle in the calling session
    pub handle: u32,
    pub pitch: u32,
    pub offset: u32,
}

/// Damaged rectangle, exclusive on the bottom-right edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl ClipRect {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Rectangle covering a whole `width` x `height` surface
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    fn fits(&self, width: u32, height: u32) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2 && self.x2 <= width && self.y2 <= height
    }
}

/// Frame update handed to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamageReport {
    pub fb_id: u32,
    pub clips: Vec<ClipRect>,
}

/// Completion of a simulated page flip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankEvent {
    pub sequence: u64,
}

/// Connection state of the virtual connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Connected,
    Disconnected,
}

/// Snapshot returned by a connector query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connector_type: u32,
    pub name: String,
    pub status: ConnectorStatus,
    pub modes: Vec<Mode>,
    pub width_mm: u32,
    pub height_mm: u32,
}

/// Mode-config limits advertised to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeConfig {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub preferred_depth: u32,
}

impl From<&UdrmConfig> for ModeConfig {
    fn from(config: &UdrmConfig) -> Self {
        Self {
            min_width: config.min_width,
            max_width: config.max_width,
            min_height: config.min_height,
            max_height: config.max_height,
            preferred_depth: config.preferred_depth,
        }
    }
}

/// Mode reported when no EDID describes the monitor
pub fn default_mode(config: &UdrmConfig) -> Mode {
    let spec = config.default_mode;
    let mut mode = Mode::cvt(spec.width, spec.height, spec.refresh);
    mode.mode_type = ModeType::DRIVER | ModeType::PREFERRED;
    mode
}

/// Modes the connector advertises for the given EDID
pub fn connector_modes(edid: Option<&Edid>, config: &UdrmConfig) -> Vec<Mode> {
    match edid {
        Some(edid) if !edid.modes().is_empty() => edid.modes().to_vec(),
        _ => vec![default_mode(config)],
    }
}

/// Virtual connector
#[derive(Debug)]
pub struct Connector {
    id: u32,
    name: String,
}

impl Connector {
    fn new() -> Self {
        Self {
            id: CONNECTOR_ID,
            name: format!("Virtual-{}", CONNECTOR_ID),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Simple display pipe: one CRTC scanning out one primary plane
#[derive(Debug, Default)]
pub struct DisplayPipe {
    plane_fb: Option<Arc<Framebuffer>>,
    vblank_sequence: u64,
}

impl DisplayPipe {
    /// Scan out `fb`, completing the flip immediately
    pub fn update(&mut self, fb: Arc<Framebuffer>) -> VblankEvent {
        self.plane_fb = Some(fb);
        self.vblank_sequence += 1;
        VblankEvent {
            sequence: self.vblank_sequence,
        }
    }

    /// Turn the pipe off, returning the framebuffer it was scanning out
    pub fn disable(&mut self) -> Option<Arc<Framebuffer>> {
        self.plane_fb.take()
    }

    pub fn plane_fb(&self) -> Option<&Arc<Framebuffer>> {
        self.plane_fb.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.plane_fb.is_some()
    }

    pub fn vblank_sequence(&self) -> u64 {
        self.vblank_sequence
    }
}

/// Mode objects that exist while a device is bound
#[derive(Debug)]
pub struct Kms {
    connector: Connector,
    pipe: DisplayPipe,
    formats: &'static [PixelFormat],
}

impl Default for Kms {
    fn default() -> Self {
        Self::new()
    }
}

impl Kms {
    pub fn new() -> Self {
        Self {
            connector: Connector::new(),
            pipe: DisplayPipe::default(),
            formats: &FORMATS,
        }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn pipe(&self) -> &DisplayPipe {
        &self.pipe
    }

    pub fn pipe_mut(&mut self) -> &mut DisplayPipe {
        &mut self.pipe
    }

    pub fn formats(&self) -> &'static [PixelFormat] {
        self.formats
    }

    pub fn supports(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// Buffer object plus scanout geometry
pub struct Framebuffer {
    id: u32,
    bo: Arc<BufferObject>,
    width: u32,
    height: u32,
    pitch: u32,
    offset: u32,
    format: PixelFormat,
    device: Weak<UdrmDevice>,
}

impl Framebuffer {
    /// Validate `cmd` against `bo` and the mode-config limits
    pub(crate) fn new(
        id: u32,
        bo: Arc<BufferObject>,
        cmd: &FbCommand,
        formats: &[PixelFormat],
        config: &UdrmConfig,
        device: Weak<UdrmDevice>,
    ) -> Result<Self> {
        if !cmd.flags.is_empty() {
            return Err(Error::InvalidArgument);
        }

        if !formats.contains(&cmd.format) {
            return Err(Error::InvalidArgument);
        }
        let cpp = cmd.format.bytes_per_pixel().ok_or(Error::InvalidArgument)?;

        if !config.fits(cmd.width, cmd.height) {
            return Err(Error::InvalidArgument);
        }

        let min_pitch = cmd.width.checked_mul(cpp).ok_or(Error::InvalidArgument)?;
        if cmd.pitch < min_pitch {
            return Err(Error::InvalidArgument);
        }

        let end = (cmd.pitch as u64) * (cmd.height as u64) + cmd.offset as u64;
        if end > bo.size() as u64 {
            return Err(Error::InvalidArgument);
        }

        Ok(Self {
            id,
            bo,
            width: cmd.width,
            height: cmd.height,
            pitch: cmd.pitch,
            offset: cmd.offset,
            format: cmd.format,
            device,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn buffer(&self) -> &Arc<BufferObject> {
        &self.bo
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Report `clips` as changed; an empty list damages the whole frame
    pub fn mark_dirty(&self, clips: &[ClipRect]) -> Result<()> {
        if let Some(bad) = clips.iter().find(|c| !c.fits(self.width, self.height)) {
            log::debug!("udrm: fb {} dirty clip {:?} out of bounds", self.id, bad);
            return Err(Error::InvalidArgument);
        }

        let clips = if clips.is_empty() {
            vec![ClipRect::full(self.width, self.height)]
        } else {
            clips.to_vec()
        };

        if let Some(device) = self.device.upgrade() {
            device.forward_damage(DamageReport {
                fb_id: self.id,
                clips,
            });
        }

        Ok(())
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        log::debug!(
            "udrm: destroy framebuffer {} (bo {})",
            self.id,
            self.bo.id()
        );
        if let Some(device) = self.device.upgrade() {
            device.release_fb_id(self.id);
        }
    }
}

impl core::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("bo", &self.bo.id())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pitch", &self.pitch)
            .field("format", &self.format)
            .finish()
    }
}
