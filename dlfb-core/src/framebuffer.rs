//! Host framebuffer sources.
//!
//! The frame loop reads pixels through [`ScanlineSource`], which copies
//! one horizontal span at a time into scratch memory. [`FramebufferView`]
//! borrows a caller-owned framebuffer; [`SolidSource`] produces a single
//! colour and backs the session's fill operation.

use crate::error::DlfbError;
use crate::pixel::PixelDepth;

// ── ScanlineSource ───────────────────────────────────────────────

/// Anything the frame loop can pull scanlines from.
pub trait ScanlineSource {
    fn depth(&self) -> PixelDepth;
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Copy the pixels of line `y` starting at column `x` into `out`.
    ///
    /// `out.len()` is a whole number of pixels and the span lies inside
    /// the source; the session checks both before calling.
    fn copy_span(&self, y: u32, x: u32, out: &mut [u8]);
}

// ── FramebufferView ──────────────────────────────────────────────

/// Borrowed framebuffer memory.
///
/// `data` holds rows of `pitch` bytes; `pitch` may exceed the visible
/// width. With a non-zero offset the visible screen is a window into a
/// larger virtual framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferView<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    pitch: usize,
    depth: PixelDepth,
    xoffset: u32,
    yoffset: u32,
}

impl<'a> FramebufferView<'a> {
    /// Describe `data` as a `width` x `height` framebuffer.
    pub fn new(
        data: &'a [u8],
        width: u32,
        height: u32,
        pitch: usize,
        depth: PixelDepth,
    ) -> Result<Self, DlfbError> {
        let view = Self {
            data,
            width,
            height,
            pitch,
            depth,
            xoffset: 0,
            yoffset: 0,
        };
        view.check()?;
        Ok(view)
    }

    /// Tightly packed framebuffer (`pitch == width * bpp`).
    pub fn packed(
        data: &'a [u8],
        width: u32,
        height: u32,
        depth: PixelDepth,
    ) -> Result<Self, DlfbError> {
        Self::new(data, width, height, width as usize * depth.bytes_per_pixel(), depth)
    }

    /// Pan the visible window inside the virtual framebuffer.
    pub fn with_offset(mut self, xoffset: u32, yoffset: u32) -> Result<Self, DlfbError> {
        self.xoffset = xoffset;
        self.yoffset = yoffset;
        self.check()?;
        Ok(self)
    }

    fn check(&self) -> Result<(), DlfbError> {
        let bpp = self.depth.bytes_per_pixel();
        let row_bytes = (self.xoffset as usize + self.width as usize) * bpp;
        if self.pitch < row_bytes {
            return Err(DlfbError::FramebufferTooShort {
                needed: row_bytes,
                actual: self.pitch,
            });
        }
        let rows = self.yoffset as usize + self.height as usize;
        let needed = match rows {
            0 => 0,
            rows => (rows - 1) * self.pitch + row_bytes,
        };
        if self.data.len() < needed {
            return Err(DlfbError::FramebufferTooShort {
                needed,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// One visible row, without pitch padding.
    pub fn row(&self, y: u32) -> &'a [u8] {
        let bpp = self.depth.bytes_per_pixel();
        let start = (self.yoffset + y) as usize * self.pitch + self.xoffset as usize * bpp;
        &self.data[start..start + self.width as usize * bpp]
    }
}

impl ScanlineSource for FramebufferView<'_> {
    fn depth(&self) -> PixelDepth {
        self.depth
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn copy_span(&self, y: u32, x: u32, out: &mut [u8]) {
        let start = x as usize * self.depth.bytes_per_pixel();
        out.copy_from_slice(&self.row(y)[start..start + out.len()]);
    }
}

// ── SolidSource ──────────────────────────────────────────────────

/// A framebuffer of one colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolidSource {
    pub width: u32,
    pub height: u32,
    /// ARGB32.
    pub color: u32,
}

impl ScanlineSource for SolidSource {
    fn depth(&self) -> PixelDepth {
        PixelDepth::Argb8888
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn copy_span(&self, _y: u32, _x: u32, out: &mut [u8]) {
        let px = self.color.to_ne_bytes();
        for chunk in out.chunks_exact_mut(4) {
            chunk.copy_from_slice(&px);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
