//! Software cursor overlay.
//!
//! The controller has no cursor plane, so the cursor is blended into each
//! scanline it covers before that line is differenced. Compositing always
//! happens on a scratch copy; the caller's framebuffer is never written.

use crate::damage::Rect;
use crate::error::DlfbError;

// ── CursorState ──────────────────────────────────────────────────

/// Cursor image and placement. `x` and `y` may be negative, in which case
/// the cursor is clipped at the top or left edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
    width: u32,
    height: u32,
    visible: bool,
    /// ARGB32, row-major, `width * height` entries.
    pixels: Vec<u32>,
}

impl CursorState {
    /// Build a visible cursor from an ARGB image.
    ///
    /// Only 32-bit cursor images carry the alpha channel the blend needs.
    pub fn new(width: u32, height: u32, depth: u32, pixels: Vec<u32>) -> Result<Self, DlfbError> {
        if depth != 32 {
            return Err(DlfbError::UnsupportedDepth(depth));
        }
        let needed = width as usize * height as usize;
        if pixels.len() < needed {
            return Err(DlfbError::FramebufferTooShort {
                needed: needed * 4,
                actual: pixels.len() * 4,
            });
        }
        Ok(Self {
            x: 0,
            y: 0,
            width,
            height,
            visible: true,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn move_to(&mut self, x: i32, y: i32) {
        self.x = x;
        self.y = y;
    }

    /// Cursor row drawn on scanline `y`, if any.
    fn row(&self, y: u32) -> Option<&[u32]> {
        if !self.visible || self.width == 0 {
            return None;
        }
        let row = i64::from(y) - i64::from(self.y);
        if row < 0 || row >= i64::from(self.height) {
            return None;
        }
        let start = row as usize * self.width as usize;
        self.pixels.get(start..start + self.width as usize)
    }

    /// Columns `[first, last)` of the cursor inside the column window
    /// `[lo, hi)`, paired with the matching cursor column offset.
    fn columns(&self, lo: usize, hi: usize) -> Option<(usize, usize, usize)> {
        let left = i64::from(self.x);
        let right = left + i64::from(self.width);
        let first = left.max(lo as i64);
        let last = right.min(hi as i64);
        if first >= last {
            return None;
        }
        Some((first as usize, last as usize, (first - left) as usize))
    }

    /// On-screen area of the cursor, clipped to `xres` x `yres`. Empty
    /// when the cursor is hidden or entirely off screen.
    pub fn bounds(&self, xres: u32, yres: u32) -> Rect {
        if !self.visible {
            return Rect::default();
        }
        let clip = |pos: i32, len: u32, max: u32| {
            let start = i64::from(pos).clamp(0, i64::from(max));
            let end = (i64::from(pos) + i64::from(len)).clamp(0, i64::from(max));
            (start as u32, (end - start) as u32)
        };
        let (x, width) = clip(self.x, self.width, xres);
        let (y, height) = clip(self.y, self.height, yres);
        Rect::new(x, y, width, height)
    }

    /// `true` if compositing scanline `y` would change anything.
    pub fn touches_line(&self, y: u32, line_width: usize) -> bool {
        self.row(y).is_some() && self.columns(0, line_width).is_some()
    }

    /// Blend the cursor into one full scanline of ARGB pixels.
    pub fn composite_line(&self, y: u32, line: &mut [u32]) {
        let Some(row) = self.row(y) else { return };
        let Some((first, last, skip)) = self.columns(0, line.len()) else {
            return;
        };
        for (dst, &src) in line[first..last].iter_mut().zip(&row[skip..]) {
            *dst = blend(src, *dst);
        }
    }

    /// Blend the cursor into part of a scanline held as native-endian
    /// ARGB bytes. `span` starts at column `x0`; only covered pixels are
    /// touched.
    pub fn composite_bytes(&self, y: u32, x0: u32, span: &mut [u8]) {
        let Some(row) = self.row(y) else { return };
        let lo = x0 as usize;
        let Some((first, last, skip)) = self.columns(lo, lo + span.len() / 4) else {
            return;
        };
        let covered = span[(first - lo) * 4..(last - lo) * 4].chunks_exact_mut(4);
        for (px, &src) in covered.zip(&row[skip..]) {
            let dst = u32::from_ne_bytes([px[0], px[1], px[2], px[3]]);
            px.copy_from_slice(&blend(src, dst).to_ne_bytes());
        }
    }
}

/// `src` over `dst` using `src`'s alpha; the result is opaque.
fn blend(src: u32, dst: u32) -> u32 {
    let a = src >> 24;
    let channel = |shift: u32| {
        let s = (src >> shift) & 0xFF;
        let d = (dst >> shift) & 0xFF;
        ((s * a + d * (255 - a)) / 255) << shift
    };
    0xFF00_0000 | channel(16) | channel(8) | channel(0)
}

// ── Tests ────────────────────────────────────────────────────────
