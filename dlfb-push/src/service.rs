//! Frame pusher core logic.
//!
//! Opens a display session against the simulated controller, pushes a
//! sequence of frames through it and summarises what reached the device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use dlfb_core::pixel::{join_channels, rgb565};
use dlfb_core::{
    ChannelPolicy, DeviceSession, DlfbError, FramebufferView, LoopbackDevice, LoopbackTransport,
    PixelDepth, StatsSnapshot, VideoMode,
};

use crate::config::{PushConfig, PushSettings};

// ── FrameSource ──────────────────────────────────────────────────

/// Where frame pixels come from.
#[derive(Debug)]
enum FrameSource {
    /// Concatenated raw ARGB32 frames, replayed in a loop.
    File { data: Vec<u8>, frames: usize },
    Bars,
    Gradient,
    Noise,
}

impl FrameSource {
    async fn open(settings: &PushSettings, frame_len: usize) -> Result<Self, DlfbError> {
        if !settings.input.is_empty() {
            let data = tokio::fs::read(&settings.input).await?;
            if data.len() < frame_len {
                return Err(DlfbError::FramebufferTooShort {
                    needed: frame_len,
                    actual: data.len(),
                });
            }
            let frames = data.len() / frame_len;
            info!(path = %settings.input, frames, "replaying raw frames");
            return Ok(Self::File { data, frames });
        }

        match settings.pattern.as_str() {
            "bars" => Ok(Self::Bars),
            "gradient" => Ok(Self::Gradient),
            "noise" => Ok(Self::Noise),
            other => Err(DlfbError::Config(format!("unknown pattern {other:?}"))),
        }
    }

    /// Write frame `index` into `out` as native-endian ARGB32.
    fn render(&self, index: u64, mode: &VideoMode, out: &mut [u8]) {
        let (xres, yres) = (mode.xres as usize, mode.yres as usize);
        if let Self::File { data, frames } = self {
            let n = (index % *frames as u64) as usize;
            out.copy_from_slice(&data[n * out.len()..(n + 1) * out.len()]);
            return;
        }

        let mut seed = (index as u32).wrapping_mul(2_654_435_761) | 1;
        for y in 0..yres {
            for x in 0..xres {
                let px = match self {
                    Self::Bars => {
                        const BARS: [u32; 8] = [
                            0xFFFF_FFFF, 0xFFFF_FF00, 0xFF00_FFFF, 0xFF00_FF00,
                            0xFFFF_00FF, 0xFFFF_0000, 0xFF00_00FF, 0xFF00_0000,
                        ];
                        let shifted = (x + index as usize * 4) % xres;
                        BARS[shifted * BARS.len() / xres]
                    }
                    Self::Gradient => {
                        let r = (x * 255 / xres.max(1)) as u32;
                        let g = (y * 255 / yres.max(1)) as u32;
                        let b = (index & 0xFF) as u32;
                        0xFF00_0000 | r << 16 | g << 8 | b
                    }
                    _ => {
                        seed ^= seed << 13;
                        seed ^= seed >> 17;
                        seed ^= seed << 5;
                        0xFF00_0000 | (seed & 0x00FF_FFFF)
                    }
                };
                let at = (y * xres + x) * 4;
                out[at..at + 4].copy_from_slice(&px.to_ne_bytes());
            }
        }
    }
}

// ── PushSummary ──────────────────────────────────────────────────

/// What a run achieved, printed as JSON by the binary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PushSummary {
    pub frames: u64,
    pub complete_frames: u64,
    /// Transfers executed by the simulated device.
    pub transfers: u64,
    pub bytes_received: u64,
    /// Pixels of the last frame that differ on the device; `None` when
    /// verification was off.
    pub mismatched_pixels: Option<u64>,
    pub stats: StatsSnapshot,
}

// ── PushService ──────────────────────────────────────────────────

/// Runs one session from open to shutdown.
pub struct PushService {
    config: PushConfig,
    running: Arc<AtomicBool>,
}

impl PushService {
    pub fn new(config: PushConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that stops the frame loop from another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Push the configured frames, then drain and summarise.
    pub async fn run(&self) -> Result<PushSummary, DlfbError> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_session().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_session(&self) -> Result<PushSummary, DlfbError> {
        let session_config = self.config.to_session_config()?;
        let mode = session_config.mode;
        let policy = session_config.policy;
        let device_cfg = &self.config.device;
        let needed = mode.pixels() as usize * 3;
        if device_cfg.memory_size < needed {
            return Err(DlfbError::Config(format!(
                "device memory of {} bytes cannot hold a {}x{} mode ({needed} bytes)",
                device_cfg.memory_size, mode.xres, mode.yres
            )));
        }

        let settings = &self.config.push;
        let frame_len = mode.pixels() as usize * PixelDepth::Argb8888.bytes_per_pixel();
        let source = FrameSource::open(settings, frame_len).await?;

        let capture = !settings.output.is_empty();
        let (transport, device, device_task) =
            LoopbackTransport::spawn(device_cfg.memory_size, device_cfg.queue_depth, capture);
        let session = DeviceSession::open(Arc::new(transport), session_config).await?;

        let mut summary = PushSummary::default();
        let pushed = self.push_then_close(&session, &source, &mode, &mut summary).await;
        summary.stats = session.stats();

        // the device task ends once the session drops its transport
        drop(session);
        if let Err(e) = device_task.await {
            error!("device task ended abnormally: {e}");
        }
        let frame = pushed?;

        summary.transfers = device.transfers();
        summary.bytes_received = device.bytes_received();

        if capture {
            let stream = device.take_capture();
            tokio::fs::write(&settings.output, &stream).await?;
            info!(path = %settings.output, bytes = stream.len(), "command stream written");
        }
        if settings.verify && summary.frames > 0 {
            let mismatched = verify(&device, &frame, policy);
            if mismatched > 0 {
                warn!(mismatched, "device memory differs from the last frame");
            }
            summary.mismatched_pixels = Some(mismatched);
        }
        Ok(summary)
    }

    /// Push frames until done or stopped, then shut the session down
    /// whether or not pushing failed. Returns the last frame pushed.
    async fn push_then_close(
        &self,
        session: &DeviceSession,
        source: &FrameSource,
        mode: &VideoMode,
        summary: &mut PushSummary,
    ) -> Result<Vec<u8>, DlfbError> {
        let frame_len = mode.pixels() as usize * PixelDepth::Argb8888.bytes_per_pixel();
        let mut frame = vec![0u8; frame_len];
        let pushed = self.push_frames(session, source, mode, &mut frame, summary).await;
        let drained = session.shutdown().await;
        pushed.and(drained).map(|()| frame)
    }

    async fn push_frames(
        &self,
        session: &DeviceSession,
        source: &FrameSource,
        mode: &VideoMode,
        frame: &mut [u8],
        summary: &mut PushSummary,
    ) -> Result<(), DlfbError> {
        let settings = &self.config.push;
        let interval =
            (settings.fps > 0).then(|| Duration::from_secs_f64(1.0 / settings.fps as f64));

        for index in 0..settings.frames {
            if !self.running.load(Ordering::SeqCst) {
                info!(index, "stopped early");
                break;
            }
            let loop_start = Instant::now();

            source.render(index, mode, frame);
            let fb = FramebufferView::packed(frame, mode.xres, mode.yres, PixelDepth::Argb8888)?;
            let report = session.render_frame(&fb).await?;

            summary.frames += 1;
            if report.complete {
                summary.complete_frames += 1;
            } else {
                warn!(index, lines = report.lines, "frame incomplete");
            }
            debug!(index, bytes = report.bytes_sent, "frame pushed");

            if let Some(interval) = interval {
                Self::pace(loop_start, interval).await;
            }
        }
        Ok(())
    }

    /// Signal the frame loop to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Sleep for the remainder of the frame interval.
    async fn pace(loop_start: Instant, interval: Duration) {
        let elapsed = loop_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}

/// Count pixels of `frame` the device does not show.
fn verify(device: &LoopbackDevice, frame: &[u8], policy: ChannelPolicy) -> u64 {
    device.with_memory(|m| {
        let (base16, base8) = (m.base16(), m.base8());
        frame
            .chunks_exact(4)
            .enumerate()
            .filter(|&(i, px)| {
                let px = u32::from_ne_bytes([px[0], px[1], px[2], px[3]]);
                let hi = m.read16(base16 + 2 * i as u32);
                match policy {
                    ChannelPolicy::Split => {
                        let lo = m.read8(base8 + i as u32);
                        join_channels(hi, lo) & 0x00FF_FFFF != px & 0x00FF_FFFF
                    }
                    ChannelPolicy::Legacy => hi != rgb565(px),
                }
            })
            .count() as u64
    })
}

// ── Tests ────────────────────────────────────────────────────────
