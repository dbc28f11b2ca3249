//! Integration tests: whole frames through a session into the simulated
//! controller, checked against device memory and the raw command stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dlfb_core::pixel::{join_channels, rgb565};
use dlfb_core::registers::{REG_BLANK, REG_COLOR_DEPTH};
use dlfb_core::slots::MIN_SLOT_SIZE;
use dlfb_core::{
    BlankMode, BulkTransport, ChannelPolicy, CursorState, DeviceSession, DlfbError,
    FramebufferView, LoopbackDevice, LoopbackTransport, PixelDepth, Rect, Rejected,
    SessionConfig, SlotLease, VideoMode,
};
use tokio_test::assert_ok;

// ── Helpers ──────────────────────────────────────────────────────

fn mode(xres: u32, yres: u32) -> VideoMode {
    VideoMode {
        xres,
        yres,
        ..VideoMode::VGA
    }
}

async fn loopback(mode: VideoMode, policy: ChannelPolicy) -> (DeviceSession, LoopbackDevice) {
    let (transport, device, _task) = LoopbackTransport::spawn(1 << 20, 16, true);
    let config = SessionConfig {
        mode,
        slot_size: MIN_SLOT_SIZE,
        policy,
        ..SessionConfig::default()
    };
    let session = DeviceSession::open(Arc::new(transport), config).await.unwrap();
    (session, device)
}

/// Wait until every slot is back from the device.
async fn settle(session: &DeviceSession) {
    let pool = session.slot_pool();
    for _ in 0..500 {
        if pool.available() == pool.capacity() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("transfers never completed");
}

fn noise(len: usize, seed: u32) -> Vec<u32> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            // runs of equal pixels every so often
            if state % 5 == 0 { 0xFF20_4060 } else { 0xFF00_0000 | (state >> 8) }
        })
        .collect()
}

fn bytes_of(pixels: &[u32]) -> Vec<u8> {
    pixels.iter().flat_map(|p| p.to_ne_bytes()).collect()
}

fn assert_plane16(device: &LoopbackDevice, pixels: &[u32]) {
    device.with_memory(|m| {
        for (i, &px) in pixels.iter().enumerate() {
            assert_eq!(m.read16(m.base16() + 2 * i as u32), rgb565(px), "pixel {i}");
        }
    });
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn test_single_changed_pair_encodes_one_command() {
    let (session, device) = loopback(mode(4, 1), ChannelPolicy::Legacy).await;
    let black = bytes_of(&[0xFF00_0000; 4]);
    let fb = FramebufferView::packed(&black, 4, 1, PixelDepth::Argb8888).unwrap();
    assert_ok!(session.render_frame(&fb).await);
    settle(&session).await;
    device.take_capture();

    let next = bytes_of(&[0xFF00_0000, 0xFF00_0000, 0xFFFF_0000, 0xFFFF_0000]);
    let fb = FramebufferView::packed(&next, 4, 1, PixelDepth::Argb8888).unwrap();
    let report = session.render_frame(&fb).await.unwrap();
    settle(&session).await;

    assert!(report.complete);
    assert_eq!(report.bytes_identical, 8);
    // two pixels at byte address 4: one raw pixel, one repeat, sync
    assert_eq!(
        device.take_capture(),
        [0xAF, 0x6B, 0x00, 0x00, 0x04, 0x02, 0x01, 0xF8, 0x00, 0x01, 0xAF]
    );
}

#[tokio::test]
async fn test_split_planes_reconstruct_frame() {
    let (session, device) = loopback(mode(64, 16), ChannelPolicy::Split).await;
    let pixels = noise(64 * 16, 3);
    let data = bytes_of(&pixels);
    let fb = FramebufferView::packed(&data, 64, 16, PixelDepth::Argb8888).unwrap();

    let report = session.render_frame(&fb).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.lines, 16);
    settle(&session).await;

    device.with_memory(|m| {
        assert_eq!(m.register(REG_COLOR_DEPTH), 0x01);
        for (i, &px) in pixels.iter().enumerate() {
            let hi = m.read16(m.base16() + 2 * i as u32);
            let lo = m.read8(m.base8() + i as u32);
            assert_eq!(join_channels(hi, lo) & 0x00FF_FFFF, px & 0x00FF_FFFF, "pixel {i}");
        }
    });
}

#[tokio::test]
async fn test_small_slots_split_frame_into_many_transfers() {
    let (session, device) = loopback(mode(256, 64), ChannelPolicy::Legacy).await;
    let before = device.transfers();
    let pixels = noise(256 * 64, 11);
    let data = bytes_of(&pixels);
    let fb = FramebufferView::packed(&data, 256, 64, PixelDepth::Argb8888).unwrap();

    let report = session.render_frame(&fb).await.unwrap();
    assert!(report.complete);
    settle(&session).await;

    assert!(device.transfers() - before > 4);
    assert!(report.bytes_sent > MIN_SLOT_SIZE as u64);
    assert_plane16(&device, &pixels);
}

#[tokio::test]
async fn test_damage_rect_updates_only_that_area() {
    let (session, device) = loopback(mode(32, 8), ChannelPolicy::Legacy).await;
    let mut pixels = vec![0xFF00_0000u32; 32 * 8];
    let data = bytes_of(&pixels);
    let fb = FramebufferView::packed(&data, 32, 8, PixelDepth::Argb8888).unwrap();
    assert_ok!(session.render_frame(&fb).await);
    settle(&session).await;

    for y in 2..4 {
        for x in 10..14 {
            pixels[y * 32 + x] = 0xFF00_FF00;
        }
    }
    // a pixel outside the reported damage must not be sent
    pixels[0] = 0xFFFF_FFFF;
    let data = bytes_of(&pixels);
    let fb = FramebufferView::packed(&data, 32, 8, PixelDepth::Argb8888).unwrap();

    session.report_damage(Rect::new(10, 2, 4, 2)).await;
    let report = session.flush_damage(&fb).await.unwrap();
    assert_eq!(report.lines, 2);
    settle(&session).await;

    device.with_memory(|m| {
        assert_eq!(m.read16(0), 0x0000);
        assert_eq!(m.read16(2 * (2 * 32 + 10)), rgb565(0xFF00_FF00));
        assert_eq!(m.read16(2 * (3 * 32 + 13)), rgb565(0xFF00_FF00));
    });

    // nothing pending now
    let report = session.flush_damage(&fb).await.unwrap();
    assert_eq!(report.lines, 0);
}

#[tokio::test]
async fn test_cursor_is_composited_and_removed() {
    let (session, device) = loopback(mode(16, 16), ChannelPolicy::Legacy).await;
    let data = bytes_of(&vec![0xFF00_0000u32; 16 * 16]);
    let fb = FramebufferView::packed(&data, 16, 16, PixelDepth::Argb8888).unwrap();

    let mut cursor = CursorState::new(2, 2, 32, vec![0xFFFF_FFFF; 4]).unwrap();
    cursor.move_to(4, 4);
    session.set_cursor(cursor).await;
    assert_ok!(session.render_frame(&fb).await);
    settle(&session).await;
    device.with_memory(|m| {
        assert_eq!(m.read16(2 * (4 * 16 + 4)), 0xFFFF);
        assert_eq!(m.read16(2 * (5 * 16 + 5)), 0xFFFF);
        assert_eq!(m.read16(2 * (4 * 16 + 6)), 0x0000);
    });

    // moving the cursor damages both positions
    session.move_cursor(-1, 10).await;
    assert_ok!(session.flush_damage(&fb).await);
    settle(&session).await;
    device.with_memory(|m| {
        assert_eq!(m.read16(2 * (4 * 16 + 4)), 0x0000);
        assert_eq!(m.read16(2 * (10 * 16)), 0xFFFF);
        assert_eq!(m.read16(2 * (10 * 16 + 1)), 0x0000);
    });

    session.show_cursor(false).await;
    assert_ok!(session.flush_damage(&fb).await);
    settle(&session).await;
    assert_eq!(device.with_memory(|m| m.read16(2 * (10 * 16))), 0x0000);
}

#[tokio::test]
async fn test_rgb565_source_switches_device_to_16bpp() {
    let (session, device) = loopback(mode(8, 2), ChannelPolicy::Split).await;
    settle(&session).await;
    assert_eq!(device.with_memory(|m| m.register(REG_COLOR_DEPTH)), 0x01);

    let pixels: Vec<u16> = (0..16).map(|i| i * 0x1111).collect();
    let data: Vec<u8> = pixels.iter().flat_map(|p| p.to_ne_bytes()).collect();
    let fb = FramebufferView::packed(&data, 8, 2, PixelDepth::Rgb565).unwrap();
    assert_ok!(session.render_frame(&fb).await);
    settle(&session).await;

    device.with_memory(|m| {
        assert_eq!(m.register(REG_COLOR_DEPTH), 0x00);
        for (i, &px) in pixels.iter().enumerate() {
            assert_eq!(m.read16(2 * i as u32), px);
        }
    });
}

#[tokio::test]
async fn test_lost_depth_switch_is_resent() {
    let (transport, device, _task) = LoopbackTransport::spawn(1 << 20, 16, false);
    let transport = Arc::new(transport);
    let config = SessionConfig {
        mode: mode(8, 2),
        slot_size: MIN_SLOT_SIZE,
        policy: ChannelPolicy::Split,
        ..SessionConfig::default()
    };
    let session = assert_ok!(DeviceSession::open(transport.clone(), config).await);

    let argb = bytes_of(&noise(16, 3));
    let fb = FramebufferView::packed(&argb, 8, 2, PixelDepth::Argb8888).unwrap();
    assert!(assert_ok!(session.render_frame(&fb).await).complete);
    settle(&session).await;
    assert_eq!(device.with_memory(|m| m.register(REG_COLOR_DEPTH)), 0x01);

    // the slot carrying the switch to 16bpp never reaches the device
    let pixels: Vec<u16> = (0..16).map(|i| 0x0841 * i).collect();
    let data: Vec<u8> = pixels.iter().flat_map(|p| p.to_ne_bytes()).collect();
    let fb = FramebufferView::packed(&data, 8, 2, PixelDepth::Rgb565).unwrap();
    transport.reject_next(1);
    assert!(!assert_ok!(session.render_frame(&fb).await).complete);
    settle(&session).await;
    assert_eq!(device.with_memory(|m| m.register(REG_COLOR_DEPTH)), 0x01);

    let report = assert_ok!(session.render_frame(&fb).await);
    assert!(report.complete);
    assert_eq!(report.bytes_identical, 0);
    settle(&session).await;
    device.with_memory(|m| {
        assert_eq!(m.register(REG_COLOR_DEPTH), 0x00);
        for (i, &px) in pixels.iter().enumerate() {
            assert_eq!(m.read16(2 * i as u32), px, "pixel {i}");
        }
    });

    // once delivered, the same frame needs nothing more
    let report = assert_ok!(session.render_frame(&fb).await);
    assert_eq!(report.bytes_sent, 0);
}

#[tokio::test]
async fn test_fill_ignores_backing_buffer() {
    let (session, device) = loopback(mode(8, 2), ChannelPolicy::Legacy).await;
    let first = session.fill(0xFF00_00FF).await.unwrap();
    let second = session.fill(0xFF00_00FF).await.unwrap();
    settle(&session).await;

    assert_eq!(first.bytes_sent, second.bytes_sent);
    assert_eq!(second.bytes_identical, 0);
    assert_eq!(device.with_memory(|m| m.read16(0)), 0x001F);

    // backing was refreshed, so a matching frame is elided
    let data = bytes_of(&[0xFF00_00FF; 16]);
    let fb = FramebufferView::packed(&data, 8, 2, PixelDepth::Argb8888).unwrap();
    let report = session.render_frame(&fb).await.unwrap();
    assert_eq!(report.bytes_sent, 0);
}

#[tokio::test]
async fn test_mode_change_and_blank() {
    let (session, device) = loopback(VideoMode::VGA, ChannelPolicy::Split).await;
    assert_ok!(session.set_mode(VideoMode::SVGA).await);
    assert_ok!(session.set_blank(BlankMode::VsyncSuspend).await);
    settle(&session).await;

    device.with_memory(|m| {
        assert_eq!(m.base8(), 800 * 600 * 2);
        assert_eq!(m.register(REG_BLANK), 0x03);
        assert!(!m.is_locked());
    });
    assert_eq!(session.mode().await, VideoMode::SVGA);
}

// ── Failure handling ─────────────────────────────────────────────

/// Holds every transfer until released, or completes at once when
/// `passthrough` is set.
#[derive(Default)]
struct Hoarder {
    held: Mutex<Vec<SlotLease>>,
    passthrough: AtomicBool,
}

impl Hoarder {
    fn release(&self) {
        self.held.lock().unwrap().clear();
    }
}

impl BulkTransport for Hoarder {
    fn submit(&self, lease: SlotLease) -> Result<(), Rejected> {
        if self.passthrough.load(Ordering::SeqCst) {
            lease.complete(Ok(()));
        } else {
            self.held.lock().unwrap().push(lease);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_slot_starvation_abandons_frame() {
    let hoarder = Arc::new(Hoarder::default());
    let config = SessionConfig {
        mode: mode(256, 64),
        slots: 2,
        slot_size: MIN_SLOT_SIZE,
        acquire_timeout: Duration::from_millis(20),
        ..SessionConfig::default()
    };
    let session = DeviceSession::open(hoarder.clone(), config).await.unwrap();
    hoarder.release();

    let data = bytes_of(&noise(256 * 64, 5));
    let fb = FramebufferView::packed(&data, 256, 64, PixelDepth::Argb8888).unwrap();

    let report = session.render_frame(&fb).await.unwrap();
    assert!(!report.complete);
    assert!(report.lines < 64);
    assert!(session.lost_pixels());
    assert_eq!(session.slot_pool().outstanding(), 2);

    hoarder.release();
    hoarder.passthrough.store(true, Ordering::SeqCst);

    // the lost frame forces a full redraw even though the backing matches
    let report = session.render_frame(&fb).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.lines, 64);
    assert_eq!(report.bytes_identical, 0);
    assert!(!session.lost_pixels());

    let stats = session.stats();
    assert_eq!((stats.frames, stats.lost_frames), (2, 1));
}

#[tokio::test]
async fn test_shutdown_waits_for_transfers() {
    let (session, _device) = loopback(mode(64, 16), ChannelPolicy::Split).await;
    let data = bytes_of(&noise(64 * 16, 9));
    let fb = FramebufferView::packed(&data, 64, 16, PixelDepth::Argb8888).unwrap();
    assert_ok!(session.render_frame(&fb).await);

    assert_ok!(session.shutdown().await);
    assert_eq!(session.slot_pool().available(), 0);
    // inactive now; renders are skipped
    let report = session.render_frame(&fb).await.unwrap();
    assert_eq!(report.lines, 0);
    assert!(matches!(
        session.slot_pool().acquire(Duration::from_millis(5)).await,
        Err(DlfbError::PoolClosed)
    ));
}
