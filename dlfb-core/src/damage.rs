//! Damage rectangles.
//!
//! Callers report which part of the framebuffer changed; the session
//! widens each rectangle so every scanline span starts and ends on a
//! machine-word boundary for the differencer.

use std::cmp;

use crate::diff::WORD;
use crate::error::DlfbError;

// ── Rect ─────────────────────────────────────────────────────────

/// A rectangle in framebuffer pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole `xres` x `yres` screen.
    pub const fn full(xres: u32, yres: u32) -> Self {
        Self::new(0, 0, xres, yres)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u64 {
        u64::from(self.x) + u64::from(self.width)
    }

    pub fn bottom(&self) -> u64 {
        u64::from(self.y) + u64::from(self.height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = cmp::min(self.x, other.x);
        let y = cmp::min(self.y, other.y);
        let right = cmp::max(self.right(), other.right());
        let bottom = cmp::max(self.bottom(), other.bottom());
        Rect::new(x, y, (right - u64::from(x)) as u32, (bottom - u64::from(y)) as u32)
    }

    /// Intersection with the `xres` x `yres` screen.
    pub fn clip(&self, xres: u32, yres: u32) -> Rect {
        let x = cmp::min(self.x, xres);
        let y = cmp::min(self.y, yres);
        let right = cmp::min(self.right(), u64::from(xres));
        let bottom = cmp::min(self.bottom(), u64::from(yres));
        Rect::new(x, y, (right - u64::from(x)) as u32, (bottom - u64::from(y)) as u32)
    }

    /// Reject rectangles that leave the `xres` x `yres` screen.
    pub fn validate(&self, xres: u32, yres: u32) -> Result<(), DlfbError> {
        if self.right() > u64::from(xres) || self.bottom() > u64::from(yres) {
            return Err(DlfbError::InvalidRect {
                x: self.x,
                y: self.y,
                width: self.width,
                height: self.height,
                xres,
                yres,
            });
        }
        Ok(())
    }

    /// Widen horizontally so the span covers whole words of a line with
    /// `bpp`-byte pixels. The result never extends past `xres`.
    pub fn align_to_words(&self, bpp: usize, xres: u32) -> Rect {
        let step = cmp::max(1, WORD / bpp) as u64;
        let x = u64::from(self.x) / step * step;
        let right = cmp::min(self.right().div_ceil(step) * step, u64::from(xres));
        Rect::new(x as u32, self.y, right.saturating_sub(x) as u32, self.height)
    }
}

// ── DamageTracker ────────────────────────────────────────────────

/// Accumulates reported damage into one bounding rectangle.
#[derive(Debug, Clone, Default)]
pub struct DamageTracker {
    pending: Option<Rect>,
    reports: u64,
}

impl DamageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `rect` into the pending damage. Empty rectangles are ignored.
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        self.reports += 1;
        self.pending = Some(match self.pending {
            Some(prev) => prev.union(&rect),
            None => rect,
        });
    }

    /// Pending damage, if any, leaving the tracker clean.
    pub fn take(&mut self) -> Option<Rect> {
        self.reports = 0;
        self.pending.take()
    }

    pub fn is_clean(&self) -> bool {
        self.pending.is_none()
    }

    /// Reports merged since the last [`take`](Self::take).
    pub fn reports(&self) -> u64 {
        self.reports
    }
}

// ── Tests ────────────────────────────────────────────────────────
