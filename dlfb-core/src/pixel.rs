//! Pixel channel splitting.
//!
//! The controller's framebuffer is two planes: a 16-bit RGB565 plane and
//! an optional 8-bit plane carrying the low-order bits RGB565 drops. An
//! ARGB32 pixel is split by fixed shifts and masks; nothing is rounded.

use serde::{Deserialize, Serialize};

use crate::error::DlfbError;

// ── PixelDepth ───────────────────────────────────────────────────

/// Layout of the host framebuffer handed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelDepth {
    /// 2 bytes per pixel, already in the device's 16-bit format.
    Rgb565,
    /// 4 bytes per pixel, `0xAARRGGBB` in native byte order.
    Argb8888,
}

impl PixelDepth {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelDepth::Rgb565 => 2,
            PixelDepth::Argb8888 => 4,
        }
    }

    /// Map a bits-per-pixel value onto a supported depth.
    pub fn from_bits(bits: u32) -> Result<Self, DlfbError> {
        match bits {
            16 => Ok(PixelDepth::Rgb565),
            32 => Ok(PixelDepth::Argb8888),
            other => Err(DlfbError::UnsupportedDepth(other)),
        }
    }
}

// ── ChannelPolicy ────────────────────────────────────────────────

/// Session-wide choice of which planes are transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPolicy {
    /// Send both the 16-bit and the 8-bit plane (24-bit colour on screen).
    Split,
    /// Send only the 16-bit plane.
    #[default]
    Legacy,
}

impl ChannelPolicy {
    /// Policy actually usable for a source of the given depth.
    ///
    /// An RGB565 source has no low-order bits, so it is always legacy.
    pub fn effective(self, depth: PixelDepth) -> Self {
        match depth {
            PixelDepth::Rgb565 => ChannelPolicy::Legacy,
            PixelDepth::Argb8888 => self,
        }
    }
}

// ── Splitting ────────────────────────────────────────────────────

/// High-order bits of an ARGB32 pixel as RGB565.
#[inline]
pub const fn rgb565(pixel: u32) -> u16 {
    let r = (pixel >> 16) & 0xFF;
    let g = (pixel >> 8) & 0xFF;
    let b = pixel & 0xFF;
    (((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3)) as u16
}

/// Low-order bits of an ARGB32 pixel that RGB565 discards (3:2:3 bits).
#[inline]
pub const fn residue8(pixel: u32) -> u8 {
    let r = (pixel >> 16) & 0x07;
    let g = (pixel >> 8) & 0x03;
    let b = pixel & 0x07;
    ((r << 5) | (g << 3) | b) as u8
}

/// Split one ARGB32 pixel into its 16-bit and 8-bit channel values.
#[inline]
pub const fn split_argb(pixel: u32) -> (u16, u8) {
    (rgb565(pixel), residue8(pixel))
}

/// Inverse of [`split_argb`] (alpha is returned as 0xFF).
pub const fn join_channels(hi: u16, lo: u8) -> u32 {
    let hi = hi as u32;
    let lo = lo as u32;
    let r = (((hi >> 11) & 0x1F) << 3) | ((lo >> 5) & 0x07);
    let g = (((hi >> 5) & 0x3F) << 2) | ((lo >> 3) & 0x03);
    let b = ((hi & 0x1F) << 3) | (lo & 0x07);
    0xFF00_0000 | (r << 16) | (g << 8) | b
}

/// Convert a run of source bytes into channel scratch buffers.
///
/// Returns the number of pixels written. `out8` is left untouched under
/// [`ChannelPolicy::Legacy`].
pub fn split_line(
    src: &[u8],
    depth: PixelDepth,
    policy: ChannelPolicy,
    out16: &mut [u16],
    out8: &mut [u8],
) -> usize {
    let bpp = depth.bytes_per_pixel();
    let count = src.len() / bpp;

    match depth {
        PixelDepth::Rgb565 => {
            for (dst, px) in out16.iter_mut().zip(src.chunks_exact(2)) {
                *dst = u16::from_ne_bytes([px[0], px[1]]);
            }
        }
        PixelDepth::Argb8888 => {
            let pixels = src
                .chunks_exact(4)
                .map(|px| u32::from_ne_bytes([px[0], px[1], px[2], px[3]]));
            if policy == ChannelPolicy::Split {
                for ((hi, lo), px) in out16.iter_mut().zip(out8.iter_mut()).zip(pixels) {
                    (*hi, *lo) = split_argb(px);
                }
            } else {
                for (hi, px) in out16.iter_mut().zip(pixels) {
                    *hi = rgb565(px);
                }
            }
        }
    }

    count
}

// ── Tests ────────────────────────────────────────────────────────
