//! EDID (Extended Display Identification Data) codec
//!
//! Validates EDID blobs handed in by a controller and extracts the display
//! modes the virtual connector advertises. Also synthesises CVT modes for
//! standard timings and for the fallback mode used when no EDID is plugged.
//!
//! # Block layout
//!
//! ```text
//! 0..8      header 00 FF FF FF FF FF FF 00
//! 18, 19    version, revision
//! 21, 22    max image size (cm)
//! 24        feature support (bit 1: first detailed timing is preferred)
//! 35..38    established timings bitmap (fixed VESA DMT modes)
//! 38..54    8 standard timings (2 bytes each, 01 01 = unused)
//! 54..126   4 descriptors of 18 bytes (detailed timing or display descriptor)
//! 126       extension block count
//! 127       checksum (block sums to 0 mod 256)
//! ```
//!
//! CEA-861 extension blocks (tag 0x02) carry further detailed timings from
//! the offset in their byte 2 up to byte 127.

use bitflags::bitflags;

use crate::{Error, Result};

/// Size of one EDID block
pub const EDID_LENGTH: usize = 128;

/// A base block plus at most 0xff extensions
pub const EDID_MAX_SIZE: usize = EDID_LENGTH * 0x100;

const EDID_HEADER: [u8; 8] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

const DESCRIPTOR_OFFSETS: [usize; 4] = [54, 72, 90, 108];
const DESCRIPTOR_LENGTH: usize = 18;
const DESCRIPTOR_MONITOR_NAME: u8 = 0xfc;
const DESCRIPTOR_DUMMY: u8 = 0x10;

const STANDARD_TIMINGS: core::ops::Range<usize> = 38..54;

const FEATURE_PREFERRED_TIMING: u8 = 1 << 1;

const CEA_EXTENSION: u8 = 0x02;
/// First byte of the detailed timings in a CEA block when there are no data blocks
const CEA_DTD_START: u8 = 4;

bitflags! {
    /// Sync polarity and scan flags of a mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeFlags: u32 {
        const PHSYNC = 1 << 0;
        const NHSYNC = 1 << 1;
        const PVSYNC = 1 << 2;
        const NVSYNC = 1 << 3;
        const INTERLACE = 1 << 4;
    }
}

bitflags! {
    /// Where a mode came from
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeType: u32 {
        const PREFERRED = 1 << 3;
        const DRIVER = 1 << 6;
    }
}

/// Display mode timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    /// Pixel clock in kHz
    pub clock: u32,
    pub hdisplay: u32,
    pub hsync_start: u32,
    pub hsync_end: u32,
    pub htotal: u32,
    pub vdisplay: u32,
    pub vsync_start: u32,
    pub vsync_end: u32,
    pub vtotal: u32,
    pub flags: ModeFlags,
    pub mode_type: ModeType,
    /// Mode name, e.g. "1920x1080"
    pub name: String,
}

impl Mode {
    /// Coordinated Video Timing (CVT 1.1, normal blanking) for the given size
    pub fn cvt(hdisplay: u32, vdisplay: u32, vrefresh: u32) -> Self {
        const H_GRANULARITY: i64 = 8;
        const MIN_V_PORCH: i64 = 3;
        // Minimum vsync + back porch time, in microseconds
        const MIN_VSYNC_BP: i64 = 550;
        const HSYNC_PERCENTAGE: i64 = 8;
        const HV_FACTOR: i64 = 1000;
        const M_PRIME: i64 = 600 * 128 / 256;
        const C_PRIME: i64 = (40 - 20) * 128 / 256 + 20;
        const CLOCK_STEP: i64 = 250;

        let vfieldrate = vrefresh.clamp(1, 240) as i64;
        let hdisplay = hdisplay as i64 - hdisplay as i64 % H_GRANULARITY;
        let vdisplay = vdisplay as i64;
        let vsync = cvt_vsync_width(hdisplay, vdisplay);

        // Estimated horizontal period, in nanoseconds
        let tmp1 = HV_FACTOR * 1_000_000 - MIN_VSYNC_BP * HV_FACTOR * vfieldrate;
        let tmp2 = (vdisplay + MIN_V_PORCH) * 2;
        let hperiod = (tmp1 * 2 / (tmp2 * vfieldrate).max(1)).max(1);

        let vsync_bp = (MIN_VSYNC_BP * HV_FACTOR / hperiod + 1).max(vsync + MIN_V_PORCH);
        let vtotal = vdisplay + vsync_bp + MIN_V_PORCH;

        let hblank_percentage =
            (C_PRIME * HV_FACTOR - M_PRIME * hperiod / 1000).max(20 * HV_FACTOR);
        let mut hblank = hdisplay * hblank_percentage / (100 * HV_FACTOR - hblank_percentage);
        hblank -= hblank % (2 * H_GRANULARITY);

        let htotal = hdisplay + hblank;
        let hsync_end = hdisplay + hblank / 2;
        let mut hsync_start = hsync_end - htotal * HSYNC_PERCENTAGE / 100;
        hsync_start += H_GRANULARITY - hsync_start % H_GRANULARITY;

        let vsync_start = vdisplay + MIN_V_PORCH;
        let vsync_end = vsync_start + vsync;

        let mut clock = htotal * HV_FACTOR * 1000 / hperiod;
        clock -= clock % CLOCK_STEP;

        let mut mode = Self {
            clock: clock as u32,
            hdisplay: hdisplay as u32,
            hsync_start: hsync_start as u32,
            hsync_end: hsync_end as u32,
            htotal: htotal as u32,
            vdisplay: vdisplay as u32,
            vsync_start: vsync_start as u32,
            vsync_end: vsync_end as u32,
            vtotal: vtotal as u32,
            flags: ModeFlags::NHSYNC | ModeFlags::PVSYNC,
            mode_type: ModeType::DRIVER,
            name: String::new(),
        };
        mode.set_name();
        mode
    }

    /// Refresh rate in Hz, rounded to nearest
    pub fn vrefresh(&self) -> u32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return 0;
        }

        let mut num = self.clock as u64 * 1000;
        let den = self.htotal as u64 * self.vtotal as u64;
        if self.flags.contains(ModeFlags::INTERLACE) {
            num *= 2;
        }

        ((num + den / 2) / den) as u32
    }

    pub fn is_preferred(&self) -> bool {
        self.mode_type.contains(ModeType::PREFERRED)
    }

    /// Whether two modes scan out identically, ignoring name and type
    pub fn same_timing(&self, other: &Mode) -> bool {
        self.clock == other.clock
            && self.hdisplay == other.hdisplay
            && self.hsync_start == other.hsync_start
            && self.hsync_end == other.hsync_end
            && self.htotal == other.htotal
            && self.vdisplay == other.vdisplay
            && self.vsync_start == other.vsync_start
            && self.vsync_end == other.vsync_end
            && self.vtotal == other.vtotal
            && self.flags == other.flags
    }

    fn set_name(&mut self) {
        let interlaced = if self.flags.contains(ModeFlags::INTERLACE) {
            "i"
        } else {
            ""
        };
        self.name = format!("{}x{}{}", self.hdisplay, self.vdisplay, interlaced);
    }
}

/// VSync width in lines, chosen by aspect ratio
fn cvt_vsync_width(hdisplay: i64, vdisplay: i64) -> i64 {
    if vdisplay % 3 == 0 && vdisplay * 4 / 3 == hdisplay {
        4
    } else if vdisplay % 9 == 0 && vdisplay * 16 / 9 == hdisplay {
        5
    } else if vdisplay % 10 == 0 && vdisplay * 16 / 10 == hdisplay {
        6
    } else if vdisplay % 4 == 0 && vdisplay * 5 / 4 == hdisplay {
        7
    } else if vdisplay % 9 == 0 && vdisplay * 15 / 9 == hdisplay {
        7
    } else {
        10
    }
}

/// Value of a descriptor field that is `bits` wide
fn field(value: u32, bits: u32) -> Option<u16> {
    (value < 1 << bits).then_some(value as u16)
}

const POSITIVE: ModeFlags = ModeFlags::PHSYNC.union(ModeFlags::PVSYNC);
const NEGATIVE: ModeFlags = ModeFlags::NHSYNC.union(ModeFlags::NVSYNC);
const NEGATIVE_H: ModeFlags = ModeFlags::NHSYNC.union(ModeFlags::PVSYNC);

/// VESA DMT timings behind the established timing bits, indexed by bit
/// number in `b[35] | b[36] << 8 | (b[37] & 0x80) << 9`
///
/// (clock, hdisplay, hsync_start, hsync_end, htotal,
///  vdisplay, vsync_start, vsync_end, vtotal, flags)
#[rustfmt::skip]
const ESTABLISHED_TIMINGS: [(u32, u32, u32, u32, u32, u32, u32, u32, u32, ModeFlags); 17] = [
    (40000, 800, 840, 968, 1056, 600, 601, 605, 628, POSITIVE),      // 800x600@60
    (36000, 800, 824, 896, 1024, 600, 601, 603, 625, POSITIVE),      // 800x600@56
    (31500, 640, 656, 720, 840, 480, 481, 484, 500, NEGATIVE),       // 640x480@75
    (31500, 640, 664, 704, 832, 480, 489, 492, 520, NEGATIVE),       // 640x480@72
    (30240, 640, 704, 768, 864, 480, 483, 486, 525, NEGATIVE),       // 640x480@67
    (25175, 640, 656, 752, 800, 480, 490, 492, 525, NEGATIVE),       // 640x480@60
    (35500, 720, 738, 846, 900, 400, 421, 423, 449, NEGATIVE),       // 720x400@88
    (28320, 720, 738, 846, 900, 400, 412, 414, 449, NEGATIVE_H),     // 720x400@70
    (135000, 1280, 1296, 1440, 1688, 1024, 1025, 1028, 1066, POSITIVE), // 1280x1024@75
    (78750, 1024, 1040, 1136, 1312, 768, 769, 772, 800, POSITIVE),   // 1024x768@75
    (75000, 1024, 1048, 1184, 1328, 768, 771, 777, 806, NEGATIVE),   // 1024x768@70
    (65000, 1024, 1048, 1184, 1344, 768, 771, 777, 806, NEGATIVE),   // 1024x768@60
    (44900, 1024, 1032, 1208, 1264, 768, 768, 776, 817, POSITIVE.union(ModeFlags::INTERLACE)), // 1024x768i@87
    (57284, 832, 864, 928, 1152, 624, 625, 628, 667, NEGATIVE),      // 832x624@75
    (49500, 800, 816, 896, 1056, 600, 601, 604, 625, POSITIVE),      // 800x600@75
    (50000, 800, 856, 976, 1040, 600, 637, 643, 666, POSITIVE),      // 800x600@72
    (108000, 1152, 1216, 1344, 1600, 864, 865, 868, 900, POSITIVE),  // 1152x864@75
];

fn established_modes(base: &[u8]) -> impl Iterator<Item = Mode> + '_ {
    let bits = base[35] as u32 | (base[36] as u32) << 8 | (base[37] as u32 & 0x80) << 9;
    ESTABLISHED_TIMINGS
        .iter()
        .enumerate()
        .filter(move |&(bit, _)| bits & (1 << bit) != 0)
        .map(|(_, t)| {
            let mut mode = Mode {
                clock: t.0,
                hdisplay: t.1,
                hsync_start: t.2,
                hsync_end: t.3,
                htotal: t.4,
                vdisplay: t.5,
                vsync_start: t.6,
                vsync_end: t.7,
                vtotal: t.8,
                flags: t.9,
                mode_type: ModeType::DRIVER,
                name: String::new(),
            };
            mode.set_name();
            mode
        })
}

/// Raw detailed timing descriptor fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetailedTiming {
    /// Pixel clock in kHz, stored with 10 kHz resolution
    pub pixel_clock: u32,
    pub hactive: u16,
    pub hblank: u16,
    pub hsync_offset: u16,
    pub hsync_width: u16,
    pub vactive: u16,
    pub vblank: u16,
    pub vsync_offset: u16,
    pub vsync_width: u16,
    pub width_mm: u16,
    pub height_mm: u16,
    pub hsync_positive: bool,
    pub vsync_positive: bool,
    pub interlaced: bool,
}

impl DetailedTiming {
    /// Descriptor for `mode`
    ///
    /// Returns `None` when the timing is inconsistent (a sync or blanking
    /// interval ending before it starts) or a field does not fit its width in
    /// the descriptor. Interlaced modes are stored as one field.
    pub fn from_mode(mode: &Mode) -> Option<Self> {
        if mode.clock < 10 || mode.clock / 10 > u16::MAX as u32 {
            return None;
        }

        let interlaced = mode.flags.contains(ModeFlags::INTERLACE);
        let fields = if interlaced { 2 } else { 1 };
        let vdisplay = mode.vdisplay / fields;
        let vsync_start = mode.vsync_start / fields;
        let vsync_end = mode.vsync_end / fields;
        let vtotal = mode.vtotal / fields;

        Some(Self {
            pixel_clock: mode.clock,
            hactive: field(mode.hdisplay, 12)?,
            hblank: field(mode.htotal.checked_sub(mode.hdisplay)?, 12)?,
            hsync_offset: field(mode.hsync_start.checked_sub(mode.hdisplay)?, 10)?,
            hsync_width: field(mode.hsync_end.checked_sub(mode.hsync_start)?, 10)?,
            vactive: field(vdisplay, 12)?,
            vblank: field(vtotal.checked_sub(vdisplay)?, 12)?,
            vsync_offset: field(vsync_start.checked_sub(vdisplay)?, 6)?,
            vsync_width: field(vsync_end.checked_sub(vsync_start)?, 6)?,
            width_mm: 0,
            height_mm: 0,
            hsync_positive: mode.flags.contains(ModeFlags::PHSYNC),
            vsync_positive: mode.flags.contains(ModeFlags::PVSYNC),
            interlaced,
        })
    }

    fn decode(d: &[u8]) -> Self {
        Self {
            pixel_clock: u16::from_le_bytes([d[0], d[1]]) as u32 * 10,
            hactive: d[2] as u16 | ((d[4] as u16 & 0xf0) << 4),
            hblank: d[3] as u16 | ((d[4] as u16 & 0x0f) << 8),
            vactive: d[5] as u16 | ((d[7] as u16 & 0xf0) << 4),
            vblank: d[6] as u16 | ((d[7] as u16 & 0x0f) << 8),
            hsync_offset: d[8] as u16 | ((d[11] as u16 & 0xc0) << 2),
            hsync_width: d[9] as u16 | ((d[11] as u16 & 0x30) << 4),
            vsync_offset: (d[10] as u16 >> 4) | ((d[11] as u16 & 0x0c) << 2),
            vsync_width: (d[10] as u16 & 0x0f) | ((d[11] as u16 & 0x03) << 4),
            width_mm: d[12] as u16 | ((d[14] as u16 & 0xf0) << 4),
            height_mm: d[13] as u16 | ((d[14] as u16 & 0x0f) << 8),
            interlaced: d[17] & 0x80 != 0,
            vsync_positive: d[17] & 0x04 != 0,
            hsync_positive: d[17] & 0x02 != 0,
        }
    }

    fn encode(&self) -> [u8; DESCRIPTOR_LENGTH] {
        let mut d = [0u8; DESCRIPTOR_LENGTH];
        let clock = ((self.pixel_clock / 10) as u16).to_le_bytes();
        d[0] = clock[0];
        d[1] = clock[1];
        d[2] = self.hactive as u8;
        d[3] = self.hblank as u8;
        d[4] = (((self.hactive >> 8) as u8 & 0x0f) << 4) | ((self.hblank >> 8) as u8 & 0x0f);
        d[5] = self.vactive as u8;
        d[6] = self.vblank as u8;
        d[7] = (((self.vactive >> 8) as u8 & 0x0f) << 4) | ((self.vblank >> 8) as u8 & 0x0f);
        d[8] = self.hsync_offset as u8;
        d[9] = self.hsync_width as u8;
        d[10] = ((self.vsync_offset as u8 & 0x0f) << 4) | (self.vsync_width as u8 & 0x0f);
        d[11] = (((self.hsync_offset >> 8) as u8 & 0x03) << 6)
            | (((self.hsync_width >> 8) as u8 & 0x03) << 4)
            | (((self.vsync_offset >> 4) as u8 & 0x03) << 2)
            | ((self.vsync_width >> 4) as u8 & 0x03);
        d[12] = self.width_mm as u8;
        d[13] = self.height_mm as u8;
        d[14] = (((self.width_mm >> 8) as u8 & 0x0f) << 4) | ((self.height_mm >> 8) as u8 & 0x0f);
        // Digital separate sync
        d[17] = 0x18;
        if self.interlaced {
            d[17] |= 0x80;
        }
        if self.vsync_positive {
            d[17] |= 0x04;
        }
        if self.hsync_positive {
            d[17] |= 0x02;
        }
        d
    }

    fn to_mode(&self) -> Option<Mode> {
        if self.hactive == 0 || self.vactive == 0 || self.hsync_width == 0 || self.vsync_width == 0
        {
            return None;
        }

        let hdisplay = self.hactive as u32;
        let hsync_start = hdisplay + self.hsync_offset as u32;
        let hsync_end = hsync_start + self.hsync_width as u32;
        let mut htotal = hdisplay + self.hblank as u32;

        let vdisplay = self.vactive as u32;
        let vsync_start = vdisplay + self.vsync_offset as u32;
        let vsync_end = vsync_start + self.vsync_width as u32;
        let mut vtotal = vdisplay + self.vblank as u32;

        // Some monitors report sync pulses past the blanking interval
        if hsync_end > htotal {
            htotal = hsync_end + 1;
        }
        if vsync_end > vtotal {
            vtotal = vsync_end + 1;
        }

        let mut flags = ModeFlags::empty();
        flags |= if self.hsync_positive {
            ModeFlags::PHSYNC
        } else {
            ModeFlags::NHSYNC
        };
        flags |= if self.vsync_positive {
            ModeFlags::PVSYNC
        } else {
            ModeFlags::NVSYNC
        };

        let mut mode = Mode {
            clock: self.pixel_clock,
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            flags,
            mode_type: ModeType::DRIVER,
            name: String::new(),
        };

        // Interlaced timings describe one field
        if self.interlaced {
            mode.flags |= ModeFlags::INTERLACE;
            mode.vdisplay *= 2;
            mode.vsync_start *= 2;
            mode.vsync_end *= 2;
            mode.vtotal = mode.vtotal * 2 | 1;
        }

        mode.set_name();
        Some(mode)
    }
}

/// Standard timing aspect ratio (EDID 1.3+ encoding)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aspect {
    Ratio16x10 = 0,
    Ratio4x3 = 1,
    Ratio5x4 = 2,
    Ratio16x9 = 3,
}

fn block_checksum(block: &[u8]) -> u8 {
    block.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// A validated EDID blob and the modes it describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edid {
    raw: Vec<u8>,
    modes: Vec<Mode>,
    monitor_name: Option<String>,
}

impl Edid {
    /// Validate `bytes` and extract its modes
    ///
    /// The length must match the extension count declared in the base block,
    /// the base block must carry the fixed header and version 1, and every
    /// block must checksum to zero.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EDID_LENGTH || bytes.len() > EDID_MAX_SIZE {
            return Err(Error::InvalidArgument);
        }

        let extensions = bytes[126] as usize;
        if bytes.len() != EDID_LENGTH * (extensions + 1) {
            return Err(Error::InvalidArgument);
        }

        if bytes[..8] != EDID_HEADER {
            return Err(Error::InvalidArgument);
        }

        if bytes[18] != 1 {
            return Err(Error::InvalidArgument);
        }

        if let Some(index) = bytes
            .chunks_exact(EDID_LENGTH)
            .position(|block| block_checksum(block) != 0)
        {
            log::debug!("udrm: EDID block {} has a bad checksum", index);
            return Err(Error::InvalidArgument);
        }

        let base = &bytes[..EDID_LENGTH];
        let mut modes = Vec::new();
        let mut monitor_name = None;

        for &offset in &DESCRIPTOR_OFFSETS {
            let d = &base[offset..offset + DESCRIPTOR_LENGTH];
            if d[0] != 0 || d[1] != 0 {
                if let Some(mode) = DetailedTiming::decode(d).to_mode() {
                    modes.push(mode);
                }
            } else if d[3] == DESCRIPTOR_MONITOR_NAME {
                monitor_name = Some(decode_text(&d[5..]));
            }
        }

        let preferred = base[24] & FEATURE_PREFERRED_TIMING != 0 || base[19] >= 4;
        if preferred {
            if let Some(first) = modes.first_mut() {
                first.mode_type |= ModeType::PREFERRED;
            }
        }

        for ext in bytes[EDID_LENGTH..].chunks_exact(EDID_LENGTH) {
            modes.extend(cea_detailed_modes(ext));
        }

        for pair in base[STANDARD_TIMINGS].chunks_exact(2) {
            if let Some(mode) = standard_timing(pair[0], pair[1], base[19]) {
                modes.push(mode);
            }
        }

        modes.extend(established_modes(base));

        Ok(Self {
            raw: bytes.to_vec(),
            modes,
            monitor_name,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Number of extension blocks after the base block
    pub fn extensions(&self) -> usize {
        self.raw[126] as usize
    }

    /// EDID version and revision, e.g. (1, 3)
    pub fn version(&self) -> (u8, u8) {
        (self.raw[18], self.raw[19])
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn monitor_name(&self) -> Option<&str> {
        self.monitor_name.as_deref()
    }

    /// Maximum image size in millimeters (0 when undefined)
    pub fn size_mm(&self) -> (u32, u32) {
        (self.raw[21] as u32 * 10, self.raw[22] as u32 * 10)
    }
}

fn decode_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0x0a).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

fn cea_detailed_modes(ext: &[u8]) -> impl Iterator<Item = Mode> + '_ {
    let start = if ext[0] == CEA_EXTENSION && ext[2] >= CEA_DTD_START {
        (ext[2] as usize).min(EDID_LENGTH - 1)
    } else {
        EDID_LENGTH - 1
    };

    // Byte 127 is the checksum; a zero pixel clock ends the list
    ext[start..EDID_LENGTH - 1]
        .chunks_exact(DESCRIPTOR_LENGTH)
        .take_while(|d| d[0] != 0 || d[1] != 0)
        .filter_map(|d| DetailedTiming::decode(d).to_mode())
}

fn standard_timing(b0: u8, b1: u8, revision: u8) -> Option<Mode> {
    if (b0 == 0x01 && b1 == 0x01) || b0 == 0x00 {
        return None;
    }

    let hsize = (b0 as u32 + 31) * 8;
    let vrefresh = (b1 & 0x3f) as u32 + 60;
    let vsize = match b1 >> 6 {
        // 1:1 before EDID 1.3
        0 if revision < 3 => hsize,
        0 => hsize * 10 / 16,
        1 => hsize * 3 / 4,
        2 => hsize * 4 / 5,
        _ => hsize * 9 / 16,
    };

    Some(Mode::cvt(hsize, vsize, vrefresh))
}

/// Builds well-formed EDID blobs
///
/// Used by tests and the self-test runner to hand realistic monitors to a
/// control channel.
#[derive(Debug, Clone, Default)]
pub struct EdidBuilder {
    monitor_name: Option<String>,
    timings: Vec<DetailedTiming>,
    standard: Vec<(u32, Aspect, u32)>,
    established: u32,
    cea_timings: Vec<DetailedTiming>,
    extensions: u8,
    size_cm: (u8, u8),
}

impl EdidBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monitor name, truncated to 13 characters
    pub fn monitor_name(mut self, name: &str) -> Self {
        self.monitor_name = Some(name.chars().take(13).collect());
        self
    }

    /// Append a detailed timing; the first is the preferred mode
    pub fn detailed_timing(mut self, timing: DetailedTiming) -> Self {
        self.timings.push(timing);
        self
    }

    /// Detailed timing for `mode`; modes a descriptor cannot hold are skipped
    pub fn mode(self, mode: &Mode) -> Self {
        match DetailedTiming::from_mode(mode) {
            Some(timing) => self.detailed_timing(timing),
            None => {
                log::warn!("udrm: mode {} does not fit a detailed timing", mode.name);
                self
            }
        }
    }

    /// Established timings bitmap, bit `n` selecting the DMT mode at index `n`
    pub fn established_timings(mut self, bits: u32) -> Self {
        self.established = bits;
        self
    }

    /// Append a detailed timing to the first CEA extension block
    ///
    /// At most 6 fit; at least one extension block is emitted.
    pub fn cea_detailed_timing(mut self, timing: DetailedTiming) -> Self {
        self.cea_timings.push(timing);
        self
    }

    /// Append a standard timing (width multiple of 8, 256..=2288)
    pub fn standard_timing(mut self, width: u32, aspect: Aspect, refresh: u32) -> Self {
        self.standard.push((width, aspect, refresh));
        self
    }

    /// Number of CEA extension blocks to append
    pub fn extensions(mut self, count: u8) -> Self {
        self.extensions = count;
        self
    }

    pub fn size_cm(mut self, width: u8, height: u8) -> Self {
        self.size_cm = (width, height);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut base = [0u8; EDID_LENGTH];
        base[..8].copy_from_slice(&EDID_HEADER);
        // Manufacturer "RDX", product 0x0001
        base[8] = 0x48;
        base[9] = 0x98;
        base[10] = 0x01;
        base[18] = 1;
        base[19] = 3;
        // Digital input
        base[20] = 0x80;
        base[21] = self.size_cm.0;
        base[22] = self.size_cm.1;
        base[23] = 120;
        base[24] = 0x0a;
        base[35] = self.established as u8;
        base[36] = (self.established >> 8) as u8;
        base[37] = ((self.established >> 9) & 0x80) as u8;

        for (i, slot) in base[STANDARD_TIMINGS].chunks_exact_mut(2).enumerate() {
            match self.standard.get(i) {
                Some(&(width, aspect, refresh)) => {
                    slot[0] = (width / 8).saturating_sub(31) as u8;
                    slot[1] = ((aspect as u8) << 6) | (refresh.saturating_sub(60) as u8 & 0x3f);
                }
                None => {
                    slot[0] = 0x01;
                    slot[1] = 0x01;
                }
            }
        }

        let mut descriptors: Vec<[u8; DESCRIPTOR_LENGTH]> =
            self.timings.iter().take(4).map(DetailedTiming::encode).collect();

        if let Some(name) = &self.monitor_name {
            if descriptors.len() < 4 {
                let mut d = [0u8; DESCRIPTOR_LENGTH];
                d[3] = DESCRIPTOR_MONITOR_NAME;
                let text = &mut d[5..];
                text.fill(0x20);
                let len = name.len().min(13);
                text[..len].copy_from_slice(&name.as_bytes()[..len]);
                if len < 13 {
                    text[len] = 0x0a;
                }
                descriptors.push(d);
            }
        }

        while descriptors.len() < 4 {
            let mut d = [0u8; DESCRIPTOR_LENGTH];
            d[3] = DESCRIPTOR_DUMMY;
            descriptors.push(d);
        }

        for (offset, d) in DESCRIPTOR_OFFSETS.iter().zip(&descriptors) {
            base[*offset..*offset + DESCRIPTOR_LENGTH].copy_from_slice(d);
        }

        let extensions = if self.cea_timings.is_empty() {
            self.extensions
        } else {
            self.extensions.max(1)
        };
        base[126] = extensions;
        base[127] = 0u8.wrapping_sub(block_checksum(&base[..127]));

        let mut out = base.to_vec();
        for index in 0..extensions {
            let mut ext = [0u8; EDID_LENGTH];
            // CEA-861 revision 3, no data blocks
            ext[0] = CEA_EXTENSION;
            ext[1] = 0x03;
            ext[2] = CEA_DTD_START;
            if index == 0 {
                let dtds = ext[CEA_DTD_START as usize..EDID_LENGTH - 1]
                    .chunks_exact_mut(DESCRIPTOR_LENGTH)
                    .zip(&self.cea_timings);
                for (slot, timing) in dtds {
                    slot.copy_from_slice(&timing.encode());
                }
            }
            ext[127] = 0u8.wrapping_sub(block_checksum(&ext[..127]));
            out.extend_from_slice(&ext);
        }

        out
    }
}
