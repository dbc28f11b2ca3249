//! Display timings.
//!
//! Timings follow the fbdev convention: the pixel clock is a period in
//! picoseconds, margins and sync lengths are in pixels or lines.

use serde::{Deserialize, Serialize};

use crate::error::DlfbError;
use crate::pixel::ChannelPolicy;

// ── VideoMode ────────────────────────────────────────────────────

/// One complete set of display timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoMode {
    pub xres: u32,
    pub yres: u32,
    /// Pixel period in picoseconds.
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    /// Nominal refresh rate in Hz (informational).
    pub refresh: u32,
}

impl VideoMode {
    /// 640x480@60 (VESA DMT).
    pub const VGA: VideoMode = VideoMode {
        xres: 640,
        yres: 480,
        pixclock: 39_721,
        left_margin: 48,
        right_margin: 16,
        upper_margin: 33,
        lower_margin: 10,
        hsync_len: 96,
        vsync_len: 2,
        refresh: 60,
    };

    /// 800x600@60 (VESA DMT).
    pub const SVGA: VideoMode = VideoMode {
        xres: 800,
        yres: 600,
        pixclock: 25_000,
        left_margin: 88,
        right_margin: 40,
        upper_margin: 23,
        lower_margin: 1,
        hsync_len: 128,
        vsync_len: 4,
        refresh: 60,
    };

    /// 1024x768@60 (VESA DMT).
    pub const XGA: VideoMode = VideoMode {
        xres: 1024,
        yres: 768,
        pixclock: 15_384,
        left_margin: 160,
        right_margin: 24,
        upper_margin: 29,
        lower_margin: 3,
        hsync_len: 136,
        vsync_len: 6,
        refresh: 60,
    };

    /// 1280x1024@60 (VESA DMT).
    pub const SXGA: VideoMode = VideoMode {
        xres: 1280,
        yres: 1024,
        pixclock: 9_259,
        left_margin: 248,
        right_margin: 48,
        upper_margin: 38,
        lower_margin: 1,
        hsync_len: 112,
        vsync_len: 3,
        refresh: 60,
    };

    /// 1920x1080@60 (CEA-861).
    pub const FHD: VideoMode = VideoMode {
        xres: 1920,
        yres: 1080,
        pixclock: 6_734,
        left_margin: 148,
        right_margin: 88,
        upper_margin: 36,
        lower_margin: 4,
        hsync_len: 44,
        vsync_len: 5,
        refresh: 60,
    };

    /// Look a preset up by `WIDTHxHEIGHT` name.
    pub fn preset(name: &str) -> Option<VideoMode> {
        match name {
            "640x480" => Some(Self::VGA),
            "800x600" => Some(Self::SVGA),
            "1024x768" => Some(Self::XGA),
            "1280x1024" => Some(Self::SXGA),
            "1920x1080" => Some(Self::FHD),
            _ => None,
        }
    }

    /// Visible pixels.
    pub fn pixels(&self) -> u64 {
        self.xres as u64 * self.yres as u64
    }

    /// Pixel clock as a multiple of 5 kHz.
    pub fn pixel_clock_5khz(&self) -> u32 {
        // 1e12 ps/s / 5e3 Hz
        200_000_000 / self.pixclock.max(1)
    }

    /// Check that every derived timing register fits in 16 bits and the
    /// mode fits within `pixel_limit`.
    pub fn validate(&self, pixel_limit: u64) -> Result<(), DlfbError> {
        if self.xres == 0 || self.yres == 0 {
            return Err(DlfbError::InvalidMode("zero resolution"));
        }
        if self.pixclock == 0 {
            return Err(DlfbError::InvalidMode("zero pixel clock"));
        }
        if self.pixel_clock_5khz() > u16::MAX as u32 {
            return Err(DlfbError::InvalidMode("pixel clock too fast"));
        }
        let htotal = self.left_margin as u64
            + self.hsync_len as u64
            + self.xres as u64
            + self.right_margin as u64;
        let vtotal = self.upper_margin as u64
            + self.vsync_len as u64
            + self.yres as u64
            + self.lower_margin as u64;
        if htotal > u16::MAX as u64 || vtotal > u16::MAX as u64 {
            return Err(DlfbError::InvalidMode("timings exceed 16-bit counters"));
        }
        if self.pixels() > pixel_limit {
            return Err(DlfbError::ModeTooLarge {
                pixels: self.pixels(),
                limit: pixel_limit,
            });
        }
        Ok(())
    }
}

impl Default for VideoMode {
    fn default() -> Self {
        Self::XGA
    }
}

// ── ColorDepth ───────────────────────────────────────────────────

/// Scan-out depth programmed into the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorDepth {
    /// RGB565 plane only.
    Bpp16,
    /// RGB565 plus the 8-bit residue plane.
    Bpp24,
}

impl ColorDepth {
    /// Register value selecting this depth.
    pub const fn register_value(self) -> u8 {
        match self {
            ColorDepth::Bpp16 => 0x00,
            ColorDepth::Bpp24 => 0x01,
        }
    }
}

impl From<ChannelPolicy> for ColorDepth {
    fn from(policy: ChannelPolicy) -> Self {
        match policy {
            ChannelPolicy::Split => ColorDepth::Bpp24,
            ChannelPolicy::Legacy => ColorDepth::Bpp16,
        }
    }
}

// ── BlankMode ────────────────────────────────────────────────────

/// Output blanking level, mirroring the fbdev blank states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlankMode {
    #[default]
    Unblank,
    Normal,
    VsyncSuspend,
    HsyncSuspend,
    Powerdown,
}

impl BlankMode {
    /// Value for the blanking register.
    pub const fn register_value(self) -> u8 {
        match self {
            BlankMode::Unblank => 0x00,
            BlankMode::Normal => 0x01,
            BlankMode::VsyncSuspend => 0x03,
            BlankMode::HsyncSuspend => 0x05,
            BlankMode::Powerdown => 0x07,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
