//! Scanline differencing against the backing buffer.
//!
//! Compares one line of the new frame with the same line of the last
//! encoded frame, a machine word at a time, and narrows the line to the
//! span that actually changed. Unchanged words at both ends are elided.

use std::mem::size_of;

/// Width of the comparison unit in bytes.
pub const WORD: usize = size_of::<usize>();

// ── Narrowed ─────────────────────────────────────────────────────

/// Result of trimming a scanline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Narrowed {
    /// Byte offset of the first changed word within the line.
    pub offset: usize,
    /// Length in bytes of the span that must be re-sent.
    pub len: usize,
    /// Bytes elided at both ends because they match the backing buffer.
    pub identical: usize,
}

impl Narrowed {
    /// `true` when the line is byte-identical to the backing buffer.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The changed span as a range over the line.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

// ── Trimming ─────────────────────────────────────────────────────

/// Narrow `front` to the words that differ from `back`.
///
/// Both slices must have the same length. A trailing partial word is
/// compared as one short word. When nothing differs the result is empty
/// and the whole line counts as identical.
pub fn trim_line(back: &[u8], front: &[u8]) -> Narrowed {
    debug_assert_eq!(back.len(), front.len());
    let total = front.len().min(back.len());
    let words = total.div_ceil(WORD);

    let word = |i: usize| {
        let start = i * WORD;
        let end = (start + WORD).min(total);
        (&back[start..end], &front[start..end])
    };

    let Some(start) = (0..words).find(|&i| {
        let (b, f) = word(i);
        b != f
    }) else {
        return Narrowed {
            offset: total,
            len: 0,
            identical: total,
        };
    };

    let end = (start + 1..words)
        .rev()
        .find(|&k| {
            let (b, f) = word(k);
            b != f
        })
        .map_or(start + 1, |k| k + 1);

    let offset = start * WORD;
    let stop = (end * WORD).min(total);

    Narrowed {
        offset,
        len: stop - offset,
        identical: offset + (total - stop),
    }
}

// ── Tests ────────────────────────────────────────────────────────
