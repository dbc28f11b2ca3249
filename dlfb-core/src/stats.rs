//! Render counters.
//!
//! Counted per session with relaxed atomics so they can be read while a
//! frame is being encoded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Live counters owned by a session.
#[derive(Debug, Default)]
pub struct RenderStats {
    bytes_rendered: AtomicU64,
    bytes_identical: AtomicU64,
    bytes_sent: AtomicU64,
    cpu_nanos: AtomicU64,
    frames: AtomicU64,
    lost_frames: AtomicU64,
}

/// Point-in-time copy of [`RenderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Source bytes examined by the frame loop.
    pub bytes_rendered: u64,
    /// Source bytes skipped because they matched the backing buffer.
    pub bytes_identical: u64,
    /// Command bytes handed to the transport.
    pub bytes_sent: u64,
    /// Time spent encoding, in nanoseconds.
    pub cpu_nanos: u64,
    pub frames: u64,
    /// Frames cut short by slot starvation or transport failure.
    pub lost_frames: u64,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_rendered(&self, bytes: usize) {
        self.bytes_rendered.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_identical(&self, bytes: usize) {
        self.bytes_identical.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_cpu(&self, elapsed: Duration) {
        self.cpu_nanos
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_done(&self, complete: bool) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if !complete {
            self.lost_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_rendered: self.bytes_rendered.load(Ordering::Relaxed),
            bytes_identical: self.bytes_identical.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            cpu_nanos: self.cpu_nanos.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            lost_frames: self.lost_frames.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.bytes_rendered,
            &self.bytes_identical,
            &self.bytes_sent,
            &self.cpu_nanos,
            &self.frames,
            &self.lost_frames,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl StatsSnapshot {
    /// Fraction of examined bytes that did not need sending (0.0 – 1.0).
    pub fn identical_ratio(&self) -> f64 {
        if self.bytes_rendered == 0 {
            return 0.0;
        }
        self.bytes_identical as f64 / self.bytes_rendered as f64
    }

    /// Sent bytes per examined byte.
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_rendered == 0 {
            return 0.0;
        }
        self.bytes_sent as f64 / self.bytes_rendered as f64
    }
}

// ── Tests ────────────────────────────────────────────────────────
