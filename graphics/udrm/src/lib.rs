//! udrm: virtual display adapter
//!
//! This crate emulates a display adapter entirely in software. Graphics
//! clients see an ordinary mode-setting device (dumb buffers, framebuffers,
//! page flips, connector queries), while everything a real monitor would
//! provide is supplied by a privileged controller through a control channel:
//! whether a monitor is plugged, its EDID, and where frame updates go.
//!
//! # Architecture
//!
//! - [`UdrmNode`] is the control node. Each [`UdrmNode::open`] creates a
//!   [`UdrmDevice`] and the [`ControlChannel`] that drives it.
//! - The channel registers the device with a [`DisplaySubsystem`], which
//!   makes it visible to graphics clients, and plugs or unplugs a monitor.
//! - Graphics clients open [`Session`]s on the device. The mode-setting
//!   surface exists while the registration or any session holds a binding.
//! - Page flips and dirty framebuffers are forwarded to the attached
//!   controller as [`DamageReport`]s.
//!
//! # Usage
//!
//! ```ignore
//! use udrm::{SoftDisplay, UdrmConfig, UdrmNode};
//!
//! let display = SoftDisplay::new();
//! let node = UdrmNode::new(display.clone(), UdrmConfig::from_env());
//!
//! let channel = node.open();
//! channel.register()?;
//! channel.plug(Some(&edid))?;
//!
//! let session = display.open(channel.device().name())?;
//! let dumb = session.create_dumb(1024, 768, 32)?;
//! ```

pub mod cdev;
pub mod config;
pub mod device;
pub mod edid;
pub mod error;
pub mod gem;
pub mod kms;
pub mod subsystem;
pub mod uaccess;

// Re-exports
pub use cdev::{ControlChannel, Controller, PlugArgs, UdrmNode};
pub use config::{ModeSpec, UdrmConfig};
pub use device::{DumbBuffer, Lifecycle, Session, UdrmDevice};
pub use edid::{Edid, EdidBuilder, Mode, ModeFlags, ModeType};
pub use error::{Error, Result};
pub use gem::{BufferObject, BufferStore};
pub use kms::{
    ClipRect, ConnectorInfo, ConnectorStatus, DamageReport, FbCommand, FbFlags, Framebuffer,
    ModeConfig, PixelFormat, VblankEvent,
};
pub use subsystem::{DisplaySubsystem, SoftDisplay, SurfaceStats};
pub use uaccess::{AddressSpace, UserBuffer, UserMemory};
