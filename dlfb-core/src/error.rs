//! Error types for the display pipeline.
//!
//! Geometry and allocation problems surface synchronously from mode-set
//! and buffer setup. Slot starvation and transport rejection are absorbed
//! by the frame loop and only show up as the session's lost-pixels flag.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for `dlfb-core`.
#[derive(Debug, Error)]
pub enum DlfbError {
    // ── Geometry Errors ──────────────────────────────────────────
    /// A video mode field is out of range for the timing registers.
    #[error("invalid video mode: {0}")]
    InvalidMode(&'static str),

    /// The requested mode needs more pixels than the device can scan out.
    #[error("mode too large: {pixels} pixels (limit {limit})")]
    ModeTooLarge { pixels: u64, limit: u64 },

    /// A damage rectangle falls outside the current mode.
    #[error("rectangle {x},{y} {width}x{height} outside {xres}x{yres}")]
    InvalidRect {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        xres: u32,
        yres: u32,
    },

    /// The source framebuffer or cursor uses a depth the encoder cannot split.
    #[error("unsupported bit depth: {0}")]
    UnsupportedDepth(u32),

    /// The source framebuffer is smaller than its descriptor claims.
    #[error("framebuffer too short: need {needed} bytes, have {actual}")]
    FramebufferTooShort { needed: usize, actual: usize },

    // ── Resource Errors ──────────────────────────────────────────
    /// A buffer could not be allocated.
    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },

    /// No transfer slot became free within the deadline.
    #[error("no transfer slot free after {0:?}")]
    SlotTimeout(Duration),

    /// The slot pool has been drained and closed.
    #[error("slot pool closed")]
    PoolClosed,

    // ── Transport Errors ─────────────────────────────────────────
    /// The bulk transport refused or failed a transfer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // ── Stream Errors ────────────────────────────────────────────
    /// A command stream could not be parsed.
    #[error("malformed command stream at byte {offset}: {reason}")]
    Decode { offset: usize, reason: &'static str },

    // ── Host Errors ──────────────────────────────────────────────
    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The I/O layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ── TransportError ───────────────────────────────────────────────

/// Why the bulk transport did not carry a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint stalled.
    #[error("endpoint stalled")]
    Stall,

    /// The device went away.
    #[error("device disconnected")]
    Disconnected,

    /// The transport's own queue is full.
    #[error("transport queue full")]
    QueueFull,

    /// Anything else the host controller reported.
    #[error("{0}")]
    Other(String),
}
