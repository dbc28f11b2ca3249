//! Device session and frame loop.
//!
//! A [`DeviceSession`] owns everything one attached controller needs: the
//! transfer slot pool, the backing copy of the last encoded frame, scratch
//! scanline buffers, the cursor and the render counters. A frame runs the
//! pipeline below per scanline, filling slots and submitting each one as
//! soon as the encoder reports it full:
//!
//! 1. copy the damaged span out of the source framebuffer,
//! 2. blend the cursor into that copy,
//! 3. narrow the span against the backing buffer,
//! 4. split pixels into the 16-bit and 8-bit channels,
//! 5. encode each channel as RLX commands.
//!
//! Slot starvation and transport failure never surface as errors from a
//! frame. The frame is abandoned, the report says so, and the next frame
//! redraws from scratch.

use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::command::{CMD_START, ChannelPixel, CommandWriter};
use crate::cursor::CursorState;
use crate::damage::{DamageTracker, Rect};
use crate::diff::{Narrowed, trim_line};
use crate::error::DlfbError;
use crate::framebuffer::{ScanlineSource, SolidSource};
use crate::mode::{BlankMode, ColorDepth, VideoMode};
use crate::pixel::{ChannelPolicy, PixelDepth, split_line};
use crate::registers;
use crate::rle::{RunStatus, compress_run};
use crate::slots::{BulkTransport, MAX_TRANSFER, SlotLease, SlotPool, WRITES_IN_FLIGHT};
use crate::stats::{RenderStats, StatsSnapshot};

/// Largest mode accepted by default (2048x1152).
pub const DEFAULT_PIXEL_LIMIT: u64 = 2048 * 1152;

/// Device addresses are 24 bits wide.
const DEVICE_MEMORY: u64 = 1 << 24;

// ── SessionConfig ────────────────────────────────────────────────

/// Configuration for [`DeviceSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Mode programmed when the session opens.
    pub mode: VideoMode,
    /// Number of transfer slots.
    pub slots: usize,
    /// Requested slot size in bytes; may shrink if allocation fails.
    pub slot_size: usize,
    /// How long a frame waits for a free slot before giving up.
    pub acquire_timeout: Duration,
    /// How long shutdown waits for in-flight transfers.
    pub drain_timeout: Duration,
    /// Modes with more visible pixels are refused.
    pub pixel_limit: u64,
    pub policy: ChannelPolicy,
    /// Keep a backing copy of the last frame and only send what changed.
    pub backing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: VideoMode::default(),
            slots: WRITES_IN_FLIGHT,
            slot_size: MAX_TRANSFER,
            acquire_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(2),
            pixel_limit: DEFAULT_PIXEL_LIMIT,
            policy: ChannelPolicy::default(),
            backing: true,
        }
    }
}

// ── FrameReport ──────────────────────────────────────────────────

/// Outcome of one render call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    /// Scanlines examined.
    pub lines: u32,
    /// Command bytes handed to the transport.
    pub bytes_sent: u64,
    /// Source bytes skipped as unchanged.
    pub bytes_identical: u64,
    /// `false` if the frame was abandoned and pixels were lost.
    pub complete: bool,
}

impl FrameReport {
    fn idle() -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
    }
}

// ── RenderState ──────────────────────────────────────────────────

/// Everything the render lock protects.
#[derive(Debug)]
struct RenderState {
    mode: VideoMode,
    /// Scan-out depth the device is known to use; `None` after lost
    /// transfers, when a depth switch may not have arrived.
    depth: Option<ColorDepth>,
    base16: u32,
    base8: u32,
    /// Last encoded frame, `xres * bpp` bytes per line.
    backing: Vec<u8>,
    /// Source format the backing buffer currently holds.
    backing_depth: Option<PixelDepth>,
    /// Lines whose backing copy matches what the device shows.
    line_valid: Vec<bool>,
    line16: Vec<u16>,
    line8: Vec<u8>,
    scratch: Vec<u8>,
    cursor: CursorState,
    blank: BlankMode,
    damage: DamageTracker,
}

impl RenderState {
    /// Fresh state for `mode`, with every buffer allocated up front.
    fn prepare(mode: VideoMode, config: &SessionConfig) -> Result<Self, DlfbError> {
        mode.validate(config.pixel_limit)?;
        // both planes have to fit the device address space
        if mode.pixels() * 3 > DEVICE_MEMORY {
            return Err(DlfbError::ModeTooLarge {
                pixels: mode.pixels(),
                limit: DEVICE_MEMORY / 3,
            });
        }

        let xres = mode.xres as usize;
        let yres = mode.yres as usize;
        let backing = if config.backing {
            alloc_filled(xres * yres * PixelDepth::Argb8888.bytes_per_pixel(), 0u8)?
        } else {
            Vec::new()
        };

        Ok(Self {
            mode,
            depth: Some(ColorDepth::from(config.policy)),
            base16: 0,
            base8: (mode.pixels() * 2) as u32,
            backing,
            backing_depth: None,
            line_valid: alloc_filled(yres, false)?,
            line16: alloc_filled(xres, 0u16)?,
            line8: alloc_filled(xres, 0u8)?,
            scratch: alloc_filled(xres * PixelDepth::Argb8888.bytes_per_pixel(), 0u8)?,
            cursor: CursorState::default(),
            blank: BlankMode::Unblank,
            damage: DamageTracker::new(),
        })
    }

    /// Forget what the device shows; the next render sends every line.
    fn invalidate(&mut self) {
        self.line_valid.fill(false);
    }

    fn screen(&self) -> Rect {
        Rect::full(self.mode.xres, self.mode.yres)
    }
}

fn alloc_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, DlfbError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| DlfbError::Allocation {
        bytes: len * size_of::<T>(),
    })?;
    buf.resize(len, value);
    Ok(buf)
}

// ── FrameWriter ──────────────────────────────────────────────────

/// Fills slots for one frame, acquiring lazily and submitting each slot
/// as soon as it is full.
struct FrameWriter<'a> {
    pool: &'a SlotPool,
    transport: &'a dyn BulkTransport,
    timeout: Duration,
    lease: Option<SlotLease>,
    pos: usize,
    sent: u64,
    transfers: u32,
}

impl<'a> FrameWriter<'a> {
    fn new(pool: &'a SlotPool, transport: &'a dyn BulkTransport, timeout: Duration) -> Self {
        Self {
            pool,
            transport,
            timeout,
            lease: None,
            pos: 0,
            sent: 0,
            transfers: 0,
        }
    }

    async fn take_or_acquire(&mut self) -> Result<SlotLease, DlfbError> {
        match self.lease.take() {
            Some(lease) => Ok(lease),
            None => {
                let lease = self.pool.acquire(self.timeout).await?;
                self.pos = 0;
                Ok(lease)
            }
        }
    }

    fn submit(&mut self, lease: SlotLease) -> Result<(), DlfbError> {
        let len = std::mem::take(&mut self.pos);
        self.pool.submit(lease, len, self.transport)?;
        self.sent += len as u64;
        self.transfers += 1;
        Ok(())
    }

    /// Encode a channel run starting at device address `addr`.
    async fn encode<P: ChannelPixel>(&mut self, mut run: &[P], mut addr: u32) -> Result<(), DlfbError> {
        while !run.is_empty() {
            let mut lease = self.take_or_acquire().await?;
            let mut out = CommandWriter::new(lease.buffer_mut(), self.pos);
            let status = compress_run(&mut run, &mut addr, &mut out);
            self.pos = out.position();
            match status {
                RunStatus::Done => self.lease = Some(lease),
                RunStatus::SlotFull => self.submit(lease)?,
            }
        }
        Ok(())
    }

    /// Append prebuilt commands, moving to a fresh slot if they don't fit.
    async fn put_commands(&mut self, bytes: &[u8]) -> Result<(), DlfbError> {
        if bytes.len() > self.pool.slot_size() {
            return Err(DlfbError::Config(format!(
                "{} command bytes exceed the {}-byte slot",
                bytes.len(),
                self.pool.slot_size()
            )));
        }
        let mut lease = self.take_or_acquire().await?;
        if lease.capacity() - self.pos < bytes.len() {
            CommandWriter::new(lease.buffer_mut(), self.pos).pad_noop();
            self.pos = lease.capacity();
            self.submit(lease)?;
            lease = self.take_or_acquire().await?;
        }
        let end = self.pos + bytes.len();
        lease.buffer_mut()[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        self.lease = Some(lease);
        Ok(())
    }

    /// Submit whatever is buffered, closed with a sync byte when there is
    /// room. A slot with nothing in it goes straight back to the pool.
    fn finish(&mut self) -> Result<(), DlfbError> {
        let Some(mut lease) = self.lease.take() else {
            return Ok(());
        };
        if self.pos == 0 {
            return Ok(());
        }
        if self.pos < lease.capacity() {
            lease.buffer_mut()[self.pos] = CMD_START;
            self.pos += 1;
        }
        self.submit(lease)
    }
}

/// Errors that cost pixels but leave the session usable.
fn is_lost_pixels(err: &DlfbError) -> bool {
    matches!(
        err,
        DlfbError::SlotTimeout(_) | DlfbError::PoolClosed | DlfbError::Transport(_)
    )
}

// ── DeviceSession ────────────────────────────────────────────────

/// One attached display controller.
///
/// Rendering, mode changes and cursor updates are serialized by a single
/// render lock. Transfer completion runs wherever the transport completes
/// leases and only touches the slot pool.
pub struct DeviceSession {
    transport: Arc<dyn BulkTransport>,
    pool: SlotPool,
    config: SessionConfig,
    active: AtomicBool,
    stats: RenderStats,
    render: Mutex<RenderState>,
}

impl DeviceSession {
    /// Allocate the slot pool and buffers and program `config.mode`.
    pub async fn open(
        transport: Arc<dyn BulkTransport>,
        config: SessionConfig,
    ) -> Result<Self, DlfbError> {
        let state = RenderState::prepare(config.mode, &config)?;
        let pool = SlotPool::new(config.slots, config.slot_size)?;

        let session = Self {
            transport,
            pool,
            config,
            active: AtomicBool::new(true),
            stats: RenderStats::new(),
            render: Mutex::new(state),
        };

        {
            let st = session.render.lock().await;
            let depth = st.depth.unwrap_or(ColorDepth::from(session.config.policy));
            let seq = registers::mode_sequence(&st.mode, depth, st.base16, st.base8);
            session.send_commands(&seq).await?;
            info!(
                xres = st.mode.xres,
                yres = st.mode.yres,
                slots = session.pool.capacity(),
                slot_size = session.pool.slot_size(),
                "display session open"
            );
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn slot_pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Current video mode.
    pub async fn mode(&self) -> VideoMode {
        self.render.lock().await.mode
    }

    /// Current blanking level.
    pub async fn blank_mode(&self) -> BlankMode {
        self.render.lock().await.blank
    }

    // ── Device control ───────────────────────────────────────────

    async fn send_commands(&self, bytes: &[u8]) -> Result<(), DlfbError> {
        let mut out = FrameWriter::new(&self.pool, self.transport.as_ref(), self.config.acquire_timeout);
        out.put_commands(bytes).await?;
        out.finish()?;
        self.stats.add_sent(out.sent as usize);
        Ok(())
    }

    /// Switch to `mode`.
    ///
    /// New buffers are allocated before anything is sent; if allocation
    /// or the register transfer fails the old mode stays in place.
    pub async fn set_mode(&self, mode: VideoMode) -> Result<(), DlfbError> {
        let mut st = self.render.lock().await;
        let mut next = RenderState::prepare(mode, &self.config)?;
        let depth = st.depth.unwrap_or(ColorDepth::from(self.config.policy));
        next.depth = Some(depth);
        next.cursor = st.cursor.clone();

        let seq = registers::mode_sequence(&next.mode, depth, next.base16, next.base8);
        self.send_commands(&seq).await?;

        *st = next;
        info!(xres = mode.xres, yres = mode.yres, "mode set");
        Ok(())
    }

    /// Change the blanking level.
    pub async fn set_blank(&self, blank: BlankMode) -> Result<(), DlfbError> {
        let mut st = self.render.lock().await;
        self.send_commands(&registers::blank_sequence(blank)).await?;
        debug!(?blank, "blanking changed");
        st.blank = blank;
        Ok(())
    }

    /// Mark the device usable or not. Renders against an inactive device
    /// are skipped without error.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    // ── Cursor ───────────────────────────────────────────────────

    /// Replace the cursor image and placement. The areas under the old
    /// and new cursor are added to the pending damage.
    pub async fn set_cursor(&self, cursor: CursorState) {
        let mut st = self.render.lock().await;
        let (xres, yres) = (st.mode.xres, st.mode.yres);
        let old = st.cursor.bounds(xres, yres);
        st.damage.add(old);
        st.damage.add(cursor.bounds(xres, yres));
        st.cursor = cursor;
    }

    pub async fn move_cursor(&self, x: i32, y: i32) {
        let mut st = self.render.lock().await;
        let (xres, yres) = (st.mode.xres, st.mode.yres);
        let old = st.cursor.bounds(xres, yres);
        st.cursor.move_to(x, y);
        let new = st.cursor.bounds(xres, yres);
        st.damage.add(old);
        st.damage.add(new);
    }

    pub async fn show_cursor(&self, visible: bool) {
        let mut st = self.render.lock().await;
        let (xres, yres) = (st.mode.xres, st.mode.yres);
        st.cursor.set_visible(true);
        let area = st.cursor.bounds(xres, yres);
        st.cursor.set_visible(visible);
        st.damage.add(area);
    }

    // ── Rendering ────────────────────────────────────────────────

    /// Record a changed area for the next [`flush_damage`](Self::flush_damage).
    pub async fn report_damage(&self, rect: Rect) {
        let mut st = self.render.lock().await;
        let clipped = rect.clip(st.mode.xres, st.mode.yres);
        st.damage.add(clipped);
    }

    /// Render the accumulated damage, if any.
    pub async fn flush_damage<S>(&self, source: &S) -> Result<FrameReport, DlfbError>
    where
        S: ScanlineSource + Sync + ?Sized,
    {
        let mut st = self.render.lock().await;
        let Some(rect) = st.damage.take() else {
            return Ok(FrameReport::idle());
        };
        self.render_locked(&mut st, source, rect, false).await
    }

    /// Send the part of `source` inside `rect` to the device.
    pub async fn render_rect<S>(&self, source: &S, rect: Rect) -> Result<FrameReport, DlfbError>
    where
        S: ScanlineSource + Sync + ?Sized,
    {
        let mut st = self.render.lock().await;
        self.render_locked(&mut st, source, rect, false).await
    }

    /// Send the whole of `source`.
    pub async fn render_frame<S>(&self, source: &S) -> Result<FrameReport, DlfbError>
    where
        S: ScanlineSource + Sync + ?Sized,
    {
        let mut st = self.render.lock().await;
        let screen = st.screen();
        self.render_locked(&mut st, source, screen, false).await
    }

    /// Paint the whole screen one ARGB colour, ignoring the backing buffer
    /// but leaving it in step with the device.
    pub async fn fill(&self, color: u32) -> Result<FrameReport, DlfbError> {
        let mut st = self.render.lock().await;
        let screen = st.screen();
        let source = SolidSource {
            width: screen.width,
            height: screen.height,
            color,
        };
        self.render_locked(&mut st, &source, screen, true).await
    }

    async fn render_locked<S>(
        &self,
        st: &mut RenderState,
        source: &S,
        rect: Rect,
        force: bool,
    ) -> Result<FrameReport, DlfbError>
    where
        S: ScanlineSource + Sync + ?Sized,
    {
        if !self.is_active() {
            trace!("device inactive; render skipped");
            return Ok(FrameReport::idle());
        }

        let mode = st.mode;
        let bpp = source.depth().bytes_per_pixel();
        if source.width() < mode.xres || source.height() < mode.yres {
            return Err(DlfbError::FramebufferTooShort {
                needed: mode.pixels() as usize * bpp,
                actual: source.width() as usize * source.height() as usize * bpp,
            });
        }
        rect.validate(mode.xres, mode.yres)?;
        if rect.is_empty() {
            return Ok(FrameReport::idle());
        }

        if self.pool.take_lost_pixels() {
            warn!("pixels lost since the last frame; redrawing");
            st.depth = None;
            st.invalidate();
        }
        if st.backing_depth != Some(source.depth()) {
            st.invalidate();
            st.backing_depth = Some(source.depth());
        }

        let started = Instant::now();
        let mut out = FrameWriter::new(&self.pool, self.transport.as_ref(), self.config.acquire_timeout);
        let mut report = FrameReport::default();

        let outcome = match self.encode_rect(st, source, rect, force, &mut out, &mut report).await {
            Ok(()) => out.finish(),
            Err(e) => Err(e),
        };
        report.bytes_sent = out.sent;
        self.stats.add_sent(out.sent as usize);
        self.stats.add_cpu(started.elapsed());

        match outcome {
            Ok(()) => report.complete = true,
            Err(e) if is_lost_pixels(&e) => {
                warn!(lines = report.lines, "frame abandoned: {e}");
                self.pool.mark_lost_pixels();
            }
            Err(e) => return Err(e),
        }
        self.stats.frame_done(report.complete);

        debug!(
            lines = report.lines,
            bytes_sent = report.bytes_sent,
            bytes_identical = report.bytes_identical,
            transfers = out.transfers,
            "frame rendered"
        );
        Ok(report)
    }

    async fn encode_rect<S>(
        &self,
        st: &mut RenderState,
        source: &S,
        rect: Rect,
        force: bool,
        out: &mut FrameWriter<'_>,
        report: &mut FrameReport,
    ) -> Result<(), DlfbError>
    where
        S: ScanlineSource + Sync + ?Sized,
    {
        let depth = source.depth();
        let bpp = depth.bytes_per_pixel();
        let policy = self.config.policy.effective(depth);

        let wanted = ColorDepth::from(policy);
        if st.depth != Some(wanted) {
            out.put_commands(&registers::depth_sequence(wanted)).await?;
            st.depth = Some(wanted);
            st.invalidate();
        }

        let xres = st.mode.xres;
        let (base16, base8) = (st.base16, st.base8);
        let span = rect.align_to_words(bpp, xres);
        let span_len = span.width as usize * bpp;
        let full_width = span.x == 0 && span.width == xres;
        let stride = xres as usize * bpp;
        let overlay = depth == PixelDepth::Argb8888;
        let use_backing = self.config.backing;

        let RenderState {
            backing,
            line_valid,
            line16,
            line8,
            scratch,
            cursor,
            ..
        } = st;

        for y in span.y..span.y + span.height {
            let line = &mut scratch[..span_len];
            source.copy_span(y, span.x, line);
            if overlay {
                cursor.composite_bytes(y, span.x, line);
            }
            report.lines += 1;
            self.stats.add_rendered(span_len);

            let row = y as usize * stride + span.x as usize * bpp;
            let narrowed = if use_backing && !force && line_valid[y as usize] {
                trim_line(&backing[row..row + span_len], line)
            } else {
                Narrowed {
                    offset: 0,
                    len: span_len,
                    identical: 0,
                }
            };
            report.bytes_identical += narrowed.identical as u64;
            self.stats.add_identical(narrowed.identical);

            if use_backing {
                let changed = row + narrowed.offset..row + narrowed.offset + narrowed.len;
                backing[changed].copy_from_slice(&line[narrowed.range()]);
                if full_width {
                    line_valid[y as usize] = true;
                }
            }
            if narrowed.is_empty() {
                continue;
            }

            let changed = &line[narrowed.range()];
            let count = split_line(changed, depth, policy, &mut line16[..], &mut line8[..]);
            let pixel = y * xres + span.x + (narrowed.offset / bpp) as u32;

            out.encode(&line16[..count], base16 + pixel * 2).await?;
            if policy == ChannelPolicy::Split {
                out.encode(&line8[..count], base8 + pixel).await?;
            }
        }
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Whether pixels were lost since the last frame started.
    pub fn lost_pixels(&self) -> bool {
        self.pool.lost_pixels()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Stop rendering and wait for every in-flight transfer to finish.
    /// The slot pool is closed afterwards.
    pub async fn shutdown(&self) -> Result<(), DlfbError> {
        self.set_active(false);
        let _st = self.render.lock().await;
        self.pool.drain(self.config.drain_timeout).await?;
        info!("display session closed");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
