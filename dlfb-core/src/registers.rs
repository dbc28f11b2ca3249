//! Register-write command sequences.
//!
//! Mode-set, blanking and base-address programming are all built from the
//! single `AF 20 reg value` command. Writes are bracketed by a lock window
//! so the controller applies them together.
//!
//! The controller's timing counters are 16-bit LFSRs rather than binary
//! counters, so most timing registers take the LFSR state reached after
//! the desired number of steps, not the count itself. See [`lfsr16`].

use bytes::{BufMut, BytesMut};

use crate::command::{CMD_START, OP_COPY16, OP_SET_REGISTER};
use crate::mode::{BlankMode, ColorDepth, VideoMode};

// ── Register map ─────────────────────────────────────────────────

pub const REG_COLOR_DEPTH: u8 = 0x00;
pub const REG_XDISPLAY_START: u8 = 0x01;
pub const REG_XDISPLAY_END: u8 = 0x03;
pub const REG_YDISPLAY_START: u8 = 0x05;
pub const REG_YDISPLAY_END: u8 = 0x07;
pub const REG_XEND_COUNT: u8 = 0x09;
pub const REG_HSYNC_START: u8 = 0x0B;
pub const REG_HSYNC_END: u8 = 0x0D;
pub const REG_HPIXELS: u8 = 0x0F;
pub const REG_YEND_COUNT: u8 = 0x11;
pub const REG_VSYNC_START: u8 = 0x13;
pub const REG_VSYNC_END: u8 = 0x15;
pub const REG_VPIXELS: u8 = 0x17;
pub const REG_PIXEL_CLOCK_5K: u8 = 0x1B;
pub const REG_BLANK: u8 = 0x1F;
pub const REG_BASE16: u8 = 0x20;
pub const REG_BASE8: u8 = 0x26;
pub const REG_LOCK: u8 = 0xFF;

/// Longest sequence [`mode_sequence`] produces.
pub const MODE_SEQUENCE_MAX: usize = 4 * 40 + 9;

// ── LFSR ─────────────────────────────────────────────────────────

/// LFSR state the controller reaches after `count` steps from `0xFFFF`.
///
/// Taps at bits 15, 4, 2 and 1. There is no closed form; the sequence is
/// walked step by step.
pub fn lfsr16(count: u16) -> u16 {
    let mut lv: u32 = 0xFFFF;
    for _ in 0..count {
        let feedback = ((lv >> 15) ^ (lv >> 4) ^ (lv >> 2) ^ (lv >> 1)) & 1;
        lv = ((lv << 1) | feedback) & 0xFFFF;
    }
    lv as u16
}

// ── Primitive writers ────────────────────────────────────────────

/// `AF 20 reg value`.
pub fn set_register(buf: &mut impl BufMut, reg: u8, value: u8) {
    buf.put_slice(&[CMD_START, OP_SET_REGISTER, reg, value]);
}

/// 16-bit value into `reg` (high byte) and `reg + 1` (low byte).
pub fn set_register_16(buf: &mut impl BufMut, reg: u8, value: u16) {
    set_register(buf, reg, (value >> 8) as u8);
    set_register(buf, reg + 1, value as u8);
}

/// 16-bit value low byte first; the pixel clock register wants this order.
pub fn set_register_16be(buf: &mut impl BufMut, reg: u8, value: u16) {
    set_register(buf, reg, value as u8);
    set_register(buf, reg + 1, (value >> 8) as u8);
}

/// Count register programmed through [`lfsr16`].
pub fn set_register_lfsr16(buf: &mut impl BufMut, reg: u8, count: u16) {
    set_register_16(buf, reg, lfsr16(count));
}

/// Open the register lock window.
pub fn vidreg_lock(buf: &mut impl BufMut) {
    set_register(buf, REG_LOCK, 0x00);
}

/// Close the register lock window; the controller applies the writes.
pub fn vidreg_unlock(buf: &mut impl BufMut) {
    set_register(buf, REG_LOCK, 0xFF);
}

pub fn set_color_depth(buf: &mut impl BufMut, depth: ColorDepth) {
    set_register(buf, REG_COLOR_DEPTH, depth.register_value());
}

fn set_base(buf: &mut impl BufMut, reg: u8, addr: u32) {
    set_register(buf, reg, (addr >> 16) as u8);
    set_register(buf, reg + 1, (addr >> 8) as u8);
    set_register(buf, reg + 2, addr as u8);
}

/// Device address of the 16-bit plane.
pub fn set_base16bpp(buf: &mut impl BufMut, addr: u32) {
    set_base(buf, REG_BASE16, addr);
}

/// Device address of the 8-bit plane.
pub fn set_base8bpp(buf: &mut impl BufMut, addr: u32) {
    set_base(buf, REG_BASE8, addr);
}

pub fn blanking(buf: &mut impl BufMut, mode: BlankMode) {
    set_register(buf, REG_BLANK, mode.register_value());
}

/// Turn sync output on or off.
pub fn enable_hvsync(buf: &mut impl BufMut, enable: bool) {
    set_register(buf, REG_BLANK, if enable { 0x00 } else { 0x07 });
}

/// One-pixel copy onto itself. Register changes only take effect once the
/// controller has executed a render command.
pub fn dummy_render(buf: &mut impl BufMut) {
    buf.put_slice(&[CMD_START, OP_COPY16, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
}

// ── Timing ───────────────────────────────────────────────────────

/// Horizontal and vertical timing registers for `mode`.
///
/// Values are truncated to 16 bits; [`VideoMode::validate`] rejects modes
/// where that would lose information.
pub fn set_vid_cmds(buf: &mut impl BufMut, mode: &VideoMode) {
    let xds = (mode.left_margin + mode.hsync_len) as u16;
    set_register_lfsr16(buf, REG_XDISPLAY_START, xds);
    let xde = xds.wrapping_add(mode.xres as u16);
    set_register_lfsr16(buf, REG_XDISPLAY_END, xde);

    let yds = (mode.upper_margin + mode.vsync_len) as u16;
    set_register_lfsr16(buf, REG_YDISPLAY_START, yds);
    let yde = yds.wrapping_add(mode.yres as u16);
    set_register_lfsr16(buf, REG_YDISPLAY_END, yde);

    // active plus blanking, minus one
    let xec = xde.wrapping_add(mode.right_margin as u16).wrapping_sub(1);
    set_register_lfsr16(buf, REG_XEND_COUNT, xec);

    set_register_lfsr16(buf, REG_HSYNC_START, 1);
    set_register_lfsr16(buf, REG_HSYNC_END, (mode.hsync_len + 1) as u16);
    set_register_16(buf, REG_HPIXELS, mode.xres as u16);

    let yec = (mode.yres + mode.upper_margin + mode.lower_margin + mode.vsync_len) as u16;
    set_register_lfsr16(buf, REG_YEND_COUNT, yec);

    set_register_lfsr16(buf, REG_VSYNC_START, 0);
    set_register_lfsr16(buf, REG_VSYNC_END, mode.vsync_len as u16);
    set_register_16(buf, REG_VPIXELS, mode.yres as u16);

    set_register_16be(buf, REG_PIXEL_CLOCK_5K, mode.pixel_clock_5khz() as u16);
}

// ── Sequences ────────────────────────────────────────────────────

/// Full mode-set: depth, plane bases, timings, unblank, latched.
pub fn mode_sequence(mode: &VideoMode, depth: ColorDepth, base16: u32, base8: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MODE_SEQUENCE_MAX);
    vidreg_lock(&mut buf);
    set_color_depth(&mut buf, depth);
    set_base16bpp(&mut buf, base16);
    set_base8bpp(&mut buf, base8);
    set_vid_cmds(&mut buf, mode);
    blanking(&mut buf, BlankMode::Unblank);
    vidreg_unlock(&mut buf);
    dummy_render(&mut buf);
    buf
}

/// Change the blanking level.
pub fn blank_sequence(mode: BlankMode) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 * 3 + 9);
    vidreg_lock(&mut buf);
    blanking(&mut buf, mode);
    vidreg_unlock(&mut buf);
    dummy_render(&mut buf);
    buf
}

/// Switch the scan-out depth alone.
pub fn depth_sequence(depth: ColorDepth) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 * 3 + 9);
    vidreg_lock(&mut buf);
    set_color_depth(&mut buf, depth);
    vidreg_unlock(&mut buf);
    dummy_render(&mut buf);
    buf
}

/// Move the plane bases without touching timings (e.g. panning).
pub fn base_sequence(base16: u32, base8: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 * 8);
    vidreg_lock(&mut buf);
    set_base16bpp(&mut buf, base16);
    set_base8bpp(&mut buf, base8);
    vidreg_unlock(&mut buf);
    buf
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceMemory;

    #[test]
    fn lfsr_zero_is_all_ones() {
        assert_eq!(lfsr16(0), 0xFFFF);
    }

    #[test]
    fn lfsr_first_steps() {
        // taps on an all-ones register: 1^1^1^1 = 0
        assert_eq!(lfsr16(1), 0xFFFE);
        // 0xFFFE: bit15=1, bit4=1, bit2=1, bit1=1 -> 0
        assert_eq!(lfsr16(2), 0xFFFC);
    }

    #[test]
    fn lfsr_is_deterministic() {
        for n in [1u16, 17, 300, 1344, 65_535] {
            assert_eq!(lfsr16(n), lfsr16(n));
        }
    }

    #[test]
    fn lfsr_walks_distinct_states() {
        let mut seen = std::collections::HashSet::new();
        for n in 0..2000u16 {
            assert!(seen.insert(lfsr16(n)), "state repeated at step {n}");
        }
    }

    #[test]
    fn register_byte_orders() {
        let mut buf = BytesMut::new();
        set_register_16(&mut buf, 0x0F, 0x0400);
        set_register_16be(&mut buf, 0x1B, 0x32C8);
        assert_eq!(
            &buf[..],
            &[
                0xAF, 0x20, 0x0F, 0x04, 0xAF, 0x20, 0x10, 0x00, //
                0xAF, 0x20, 0x1B, 0xC8, 0xAF, 0x20, 0x1C, 0x32,
            ]
        );
    }

    #[test]
    fn lock_and_unlock_bytes() {
        let mut buf = BytesMut::new();
        vidreg_lock(&mut buf);
        vidreg_unlock(&mut buf);
        assert_eq!(&buf[..], &[0xAF, 0x20, 0xFF, 0x00, 0xAF, 0x20, 0xFF, 0xFF]);
    }

    #[test]
    fn mode_sequence_programs_device() {
        let mode = VideoMode::XGA;
        let seq = mode_sequence(&mode, ColorDepth::Bpp24, 0, 1024 * 768 * 2);
        assert!(seq.len() <= MODE_SEQUENCE_MAX);
        assert_eq!(&seq[..4], &[0xAF, 0x20, 0xFF, 0x00]);

        let mut dev = DeviceMemory::new(2);
        dev.apply(&seq).unwrap();
        assert!(!dev.is_locked());
        assert_eq!(dev.register(REG_COLOR_DEPTH), 0x01);
        assert_eq!(dev.base16(), 0);
        assert_eq!(dev.base8(), 1024 * 768 * 2);
        assert_eq!(dev.register16(REG_HPIXELS), 1024);
        assert_eq!(dev.register16(REG_VPIXELS), 768);
        assert_eq!(dev.register16(REG_XDISPLAY_START), lfsr16(160 + 136));
        assert_eq!(dev.register16(REG_YEND_COUNT), lfsr16(768 + 29 + 3 + 6));
        assert_eq!(dev.register16(REG_VSYNC_START), 0xFFFF);
        assert_eq!(dev.register(REG_BLANK), 0x00);
        // pixel clock is stored low byte first
        assert_eq!(dev.register(REG_PIXEL_CLOCK_5K), (13_000u16 & 0xFF) as u8);
        assert_eq!(dev.register(REG_PIXEL_CLOCK_5K + 1), (13_000u16 >> 8) as u8);
    }

    #[test]
    fn blank_sequence_sets_level() {
        let seq = blank_sequence(BlankMode::Powerdown);
        let mut dev = DeviceMemory::new(2);
        dev.apply(&seq).unwrap();
        assert_eq!(dev.register(REG_BLANK), 0x07);

        let mut buf = BytesMut::new();
        enable_hvsync(&mut buf, true);
        dev.apply(&buf).unwrap();
        assert_eq!(dev.register(REG_BLANK), 0x00);
    }

    #[test]
    fn depth_and_base_sequences() {
        let mut dev = DeviceMemory::new(2);
        dev.apply(&depth_sequence(ColorDepth::Bpp16)).unwrap();
        assert_eq!(dev.register(REG_COLOR_DEPTH), 0x00);

        dev.apply(&base_sequence(0x01_2345, 0x0A_BCDE)).unwrap();
        assert!(!dev.is_locked());
        assert_eq!(dev.base16(), 0x01_2345);
        assert_eq!(dev.base8(), 0x0A_BCDE);
    }
}
