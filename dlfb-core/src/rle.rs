//! Run encoder for the RLX pixel commands.
//!
//! A run of channel pixels becomes a series of RLX commands, each
//! addressing up to 256 pixels. Inside a command the pixels alternate
//! between raw spans, copied verbatim, and repeat counts that extend the
//! last raw pixel. The raw-span count byte is written before its pixels
//! are known, so it is reserved and backfilled.

use std::cmp;

use crate::command::{
    CMD_START, ChannelPixel, CommandWriter, MAX_CMD_PIXELS, MIN_RLX_CMD_BYTES,
};

// ── RunStatus ────────────────────────────────────────────────────

/// Why [`compress_run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every pixel of the run was encoded.
    Done,
    /// The slot is full (and padded); the run still has pixels left.
    SlotFull,
}

// ── Encoding ─────────────────────────────────────────────────────

/// Worst-case pixels that fit in `room` bytes after a command header.
///
/// One byte is held back for the span count that may follow the last
/// pixel. A repeat costs the repeat byte plus the next span's count byte
/// but covers at least two pixels, which matters for 1-byte pixels.
fn pixel_budget<P: ChannelPixel>(room: usize) -> usize {
    let cost_x2 = cmp::max(2 * P::BYTES, P::BYTES + 2);
    room.saturating_sub(1) * 2 / cost_x2
}

/// Encode as much of `run` as fits into `out`.
///
/// On return `run` starts at the first pixel not yet written and
/// `dev_addr` points at that pixel's device address. When fewer than
/// [`MIN_RLX_CMD_BYTES`] bytes remain the slot tail is padded with no-ops
/// and [`RunStatus::SlotFull`] is returned, even if the run happens to be
/// exhausted; the caller submits the slot either way.
pub fn compress_run<P: ChannelPixel>(
    run: &mut &[P],
    dev_addr: &mut u32,
    out: &mut CommandWriter<'_>,
) -> RunStatus {
    let mut pixels: &[P] = run;

    while !pixels.is_empty() && out.remaining() > MIN_RLX_CMD_BYTES {
        out.put_u8(CMD_START);
        out.put_u8(P::OPCODE);
        out.put_addr(*dev_addr);
        let cmd_count_at = out.reserve();
        let mut raw_count_at = out.reserve();

        let cmd_len = cmp::min(
            cmp::min(MAX_CMD_PIXELS + 1, pixels.len()),
            pixel_budget::<P>(out.remaining()),
        );
        let cmd = &pixels[..cmd_len];

        let mut i = 0;
        let mut raw_start = 0;
        while i < cmd_len {
            let value = cmd[i];
            let repeat_from = i;
            value.put(out);
            i += 1;

            if i < cmd_len && cmd[i] == value {
                out.patch(raw_count_at, (repeat_from - raw_start + 1) as u8);
                while i < cmd_len && cmd[i] == value {
                    i += 1;
                }
                // extra copies of the last raw pixel; at most 255
                out.put_u8((i - repeat_from - 1) as u8);

                raw_start = i;
                raw_count_at = out.reserve();
            }
        }

        if i > raw_start {
            out.patch(raw_count_at, (i - raw_start) as u8);
        } else {
            out.unput();
        }

        // 256 wraps to 0, which the device reads as 256
        out.patch(cmd_count_at, cmd_len as u8);
        *dev_addr += (cmd_len * P::BYTES) as u32;
        pixels = &pixels[cmd_len..];
    }

    *run = pixels;

    if out.remaining() <= MIN_RLX_CMD_BYTES {
        out.pad_noop();
        return RunStatus::SlotFull;
    }
    RunStatus::Done
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{NOOP, OP_RLX16};
    use crate::device::DeviceMemory;

    fn encode_all<P: ChannelPixel>(pixels: &[P], slot_size: usize, base: u32) -> Vec<Vec<u8>> {
        let mut slots = Vec::new();
        let mut run = pixels;
        let mut addr = base;
        while !run.is_empty() {
            let mut buf = vec![0u8; slot_size];
            let mut w = CommandWriter::new(&mut buf, 0);
            let status = compress_run(&mut run, &mut addr, &mut w);
            let len = w.position();
            if status == RunStatus::Done {
                buf.truncate(len);
            }
            slots.push(buf);
        }
        slots
    }

    fn pattern(len: usize, seed: u32) -> Vec<u16> {
        // short runs mixed with noise
        let mut state = seed;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let value = (state >> 16) as u16;
            let repeat = ((state >> 8) % 7) as usize;
            for _ in 0..=repeat {
                out.push(value);
            }
        }
        out.truncate(len);
        out
    }

    #[test]
    fn two_equal_pixels_become_raw_then_repeat() {
        let pixels = [0xF800u16, 0xF800];
        let mut run: &[u16] = &pixels;
        let mut addr = 0x10;
        let mut buf = [0u8; 64];
        let mut w = CommandWriter::new(&mut buf, 0);

        assert_eq!(compress_run(&mut run, &mut addr, &mut w), RunStatus::Done);
        let len = w.position();
        assert!(run.is_empty());
        assert_eq!(addr, 0x14);
        assert_eq!(
            &buf[..len],
            &[0xAF, OP_RLX16, 0x00, 0x00, 0x10, 0x02, 0x01, 0xF8, 0x00, 0x01]
        );
    }

    #[test]
    fn long_repeat_saturates_and_continues() {
        let pixels = vec![0x1234u16; 300];
        let slots = encode_all(&pixels, 4096, 0);
        assert_eq!(slots.len(), 1);
        let s = &slots[0];

        // first command: 256 pixels = 1 raw + 255 repeats
        assert_eq!(&s[..10], &[0xAF, 0x6B, 0, 0, 0, 0x00, 0x01, 0x12, 0x34, 0xFF]);
        // second command picks up at byte address 512 with the remaining 44
        assert_eq!(&s[10..20], &[0xAF, 0x6B, 0, 0x02, 0x00, 44, 0x01, 0x12, 0x34, 43]);
        assert_eq!(s.len(), 20);
    }

    #[test]
    fn distinct_pixels_are_one_raw_span() {
        let pixels: Vec<u16> = (0..10).collect();
        let slots = encode_all(&pixels, 4096, 0);
        let s = &slots[0];
        assert_eq!(s[5], 10);
        assert_eq!(s[6], 10);
        assert_eq!(s.len(), 7 + 20);
    }

    #[test]
    fn roundtrip_across_slot_boundaries() {
        let pixels = pattern(2000, 7);
        for slot_size in [24usize, 37, 64, 512, 4096] {
            let slots = encode_all(&pixels, slot_size, 0x100);
            let mut mem = DeviceMemory::new(0x100 + pixels.len() * 2);
            for s in &slots {
                assert!(s.len() <= slot_size);
                mem.apply(s).unwrap();
            }
            for (i, &p) in pixels.iter().enumerate() {
                assert_eq!(mem.read16(0x100 + 2 * i as u32), p, "slot {slot_size} pixel {i}");
            }
        }
    }

    #[test]
    fn roundtrip_8bit_channel() {
        let pixels: Vec<u8> = pattern(1500, 99).iter().map(|&p| (p & 0x3) as u8).collect();
        for slot_size in [20usize, 33, 1024] {
            let slots = encode_all(&pixels, slot_size, 0);
            let mut mem = DeviceMemory::new(pixels.len());
            for s in &slots {
                assert!(s.len() <= slot_size);
                mem.apply(s).unwrap();
            }
            assert_eq!(mem.bytes(), &pixels[..]);
        }
    }

    #[test]
    fn full_slot_is_padded_and_cursor_exact() {
        let pixels: Vec<u16> = (0..100).collect();
        let mut run: &[u16] = &pixels;
        let mut addr = 0;
        let mut buf = [0u8; 32];
        let mut w = CommandWriter::new(&mut buf, 0);

        assert_eq!(compress_run(&mut run, &mut addr, &mut w), RunStatus::SlotFull);
        assert!(w.is_full());
        let written = pixels.len() - run.len();
        assert_eq!(addr as usize, written * 2);
        assert_eq!(buf[5] as usize, written);
        assert!(buf[7 + written * 2..].iter().all(|&b| b == NOOP));
    }

    #[test]
    fn tight_slot_starts_no_command() {
        let pixels = [1u16, 2, 3];
        let mut run: &[u16] = &pixels;
        let mut addr = 0;
        let mut buf = [0u8; MIN_RLX_CMD_BYTES];
        let mut w = CommandWriter::new(&mut buf, 0);
        assert_eq!(compress_run(&mut run, &mut addr, &mut w), RunStatus::SlotFull);
        assert_eq!(run.len(), 3);
        assert!(buf.iter().all(|&b| b == NOOP));
    }
}
