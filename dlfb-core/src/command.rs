//! Device command vocabulary and the slot writer.
//!
//! Every command starts with [`CMD_START`] followed by an opcode byte.
//! Unused space at the end of a transfer is filled with [`NOOP`], which is
//! the same byte as the command start; the device relies on framing, not
//! content, to tell padding from a new command.
//!
//! ```text
//! register write  AF 20 reg value
//! RLX16 / RLX8    AF 6B|63 a2 a1 a0 N  { R raw-pixels.. [P] }..
//! copy16          AF 6A s2 s1 s0 N d2 d1 d0
//! ```

// ── Constants ────────────────────────────────────────────────────

/// First byte of every command.
pub const CMD_START: u8 = 0xAF;
/// Padding byte for unused transfer space.
pub const NOOP: u8 = 0xAF;

/// Register write.
pub const OP_SET_REGISTER: u8 = 0x20;
/// Run-length-extended write into the 8-bit plane.
pub const OP_RLX8: u8 = 0x63;
/// Copy within the 16-bit plane.
pub const OP_COPY16: u8 = 0x6A;
/// Run-length-extended write into the 16-bit plane.
pub const OP_RLX16: u8 = 0x6B;

/// Most pixels a command may carry beyond the first.
pub const MAX_CMD_PIXELS: usize = 255;
/// `AF op a2 a1 a0 N R`.
pub const RLX_HEADER_BYTES: usize = 7;
/// Smallest useful pixel payload.
pub const MIN_RLX_PIX_BYTES: usize = 4;
/// A new command is only started when more than this many bytes remain.
pub const MIN_RLX_CMD_BYTES: usize = RLX_HEADER_BYTES + MIN_RLX_PIX_BYTES;

// ── ChannelPixel ─────────────────────────────────────────────────

/// A value in one of the device's two pixel planes.
pub trait ChannelPixel: Copy + PartialEq + std::fmt::Debug {
    /// RLX opcode addressing this plane.
    const OPCODE: u8;
    /// Bytes one pixel occupies on the wire and in device memory.
    const BYTES: usize;

    /// Append the pixel in wire order.
    fn put(self, out: &mut CommandWriter<'_>);

    /// Read a pixel back from wire order.
    fn read(bytes: &[u8]) -> Self;
}

impl ChannelPixel for u16 {
    const OPCODE: u8 = OP_RLX16;
    const BYTES: usize = 2;

    #[inline]
    fn put(self, out: &mut CommandWriter<'_>) {
        let [hi, lo] = self.to_be_bytes();
        out.put_u8(hi);
        out.put_u8(lo);
    }

    #[inline]
    fn read(bytes: &[u8]) -> Self {
        u16::from_be_bytes([bytes[0], bytes[1]])
    }
}

impl ChannelPixel for u8 {
    const OPCODE: u8 = OP_RLX8;
    const BYTES: usize = 1;

    #[inline]
    fn put(self, out: &mut CommandWriter<'_>) {
        out.put_u8(self);
    }

    #[inline]
    fn read(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

// ── CommandWriter ────────────────────────────────────────────────

/// Cursor over a transfer slot's bytes.
///
/// Tracks how much room is left so the encoder can stop before a command
/// would overrun the slot. Callers check [`remaining`](Self::remaining)
/// before writing; the put methods index the slice directly.
pub struct CommandWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> CommandWriter<'a> {
    /// Start writing at `pos` within `buf`.
    pub fn new(buf: &'a mut [u8], pos: usize) -> Self {
        debug_assert!(pos <= buf.len());
        Self { buf, pos }
    }

    /// Bytes written so far, including anything before the start position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Total size of the underlying slot.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes still free.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// `true` once the slot has been filled or padded to the end.
    pub fn is_full(&self) -> bool {
        self.pos == self.buf.len()
    }

    #[inline]
    pub fn put_u8(&mut self, byte: u8) {
        self.buf[self.pos] = byte;
        self.pos += 1;
    }

    /// Write a 24-bit big-endian device address.
    pub fn put_addr(&mut self, addr: u32) {
        self.put_u8((addr >> 16) as u8);
        self.put_u8((addr >> 8) as u8);
        self.put_u8(addr as u8);
    }

    /// Reserve one byte to be filled in later; returns its index.
    pub fn reserve(&mut self) -> usize {
        let at = self.pos;
        self.put_u8(0);
        at
    }

    /// Fill in a byte previously handed out by [`reserve`](Self::reserve).
    pub fn patch(&mut self, at: usize, byte: u8) {
        self.buf[at] = byte;
    }

    /// Drop the most recently written byte.
    pub fn unput(&mut self) {
        self.pos -= 1;
    }

    /// Fill the rest of the slot with no-ops.
    pub fn pad_noop(&mut self) {
        self.buf[self.pos..].fill(NOOP);
        self.pos = self.buf.len();
    }

    /// Append a run of bytes that is known to fit.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

// ── Tests ────────────────────────────────────────────────────────
