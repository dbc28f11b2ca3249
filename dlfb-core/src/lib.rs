//! # dlfb-core
//!
//! Frame encoding and transfer scheduling for USB display controllers of
//! the DisplayLink family.
//!
//! This crate contains:
//! - **Pixels**: `split_argb` into the RGB565 and 8-bit residue channels
//! - **Differencing**: `trim_line` narrows a scanline against the backing copy
//! - **Encoding**: `compress_run` writes RLX commands through a `CommandWriter`
//! - **Registers**: mode-set, blanking and LFSR timing sequences
//! - **Slots**: `SlotPool`, a bounded recycling pool of bulk-transfer buffers
//! - **Session**: `DeviceSession`, which ties the pipeline to one device
//! - **Device**: `DeviceMemory` and `LoopbackTransport`, a simulated controller
//! - **Error**: `DlfbError`, a typed `thiserror`-based error hierarchy

pub mod command;
pub mod cursor;
pub mod damage;
pub mod device;
pub mod diff;
pub mod error;
pub mod framebuffer;
pub mod mode;
pub mod pixel;
pub mod registers;
pub mod rle;
pub mod session;
pub mod slots;
pub mod stats;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use command::CommandWriter;
pub use cursor::CursorState;
pub use damage::{DamageTracker, Rect};
pub use device::{DeviceMemory, LoopbackDevice, LoopbackTransport};
pub use diff::{Narrowed, trim_line};
pub use error::{DlfbError, TransportError};
pub use framebuffer::{FramebufferView, ScanlineSource, SolidSource};
pub use mode::{BlankMode, ColorDepth, VideoMode};
pub use pixel::{ChannelPolicy, PixelDepth, split_argb};
pub use rle::{RunStatus, compress_run};
pub use session::{DeviceSession, FrameReport, SessionConfig};
pub use slots::{BulkTransport, Rejected, SlotLease, SlotPool};
pub use stats::{RenderStats, StatsSnapshot};
