//! Configuration for the frame pusher.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dlfb_core::session::DEFAULT_PIXEL_LIMIT;
use dlfb_core::slots::{MAX_TRANSFER, WRITES_IN_FLIGHT};
use dlfb_core::{ChannelPolicy, DlfbError, SessionConfig, VideoMode};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Transfer and simulated device settings.
    pub device: DeviceConfig,
    /// What the display is programmed to.
    pub display: DisplayConfig,
    /// Frame source and run length.
    pub push: PushSettings,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Transfer slots and the simulated controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bulk transfers kept in flight.
    pub slots: usize,
    /// Bytes per transfer slot.
    pub slot_size: usize,
    /// How long a frame waits for a free slot, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// How long shutdown waits for in-flight transfers, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Simulated device memory in bytes.
    pub memory_size: usize,
    /// Transfers the simulated device queues before refusing more.
    pub queue_depth: usize,
}

/// Display mode and encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Preset name, e.g. "1024x768".
    pub mode: String,
    /// "split" sends both colour planes, "legacy" only the 16-bit one.
    pub policy: ChannelPolicy,
    /// Send only what changed since the previous frame.
    pub backing: bool,
    /// Largest mode accepted, in pixels.
    pub pixel_limit: u64,
}

/// Frame source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Frames to push.
    pub frames: u64,
    /// Raw ARGB32 file of concatenated frames. Empty uses `pattern`.
    pub input: String,
    /// Generated pattern: "bars", "gradient" or "noise".
    pub pattern: String,
    /// Frame rate cap; 0 pushes as fast as slots allow.
    pub fps: u32,
    /// File receiving the raw command stream. Empty disables capture.
    pub output: String,
    /// Compare device memory with the last frame when done.
    pub verify: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            slots: WRITES_IN_FLIGHT,
            slot_size: MAX_TRANSFER,
            acquire_timeout_ms: 1000,
            drain_timeout_ms: 2000,
            memory_size: 16 * 1024 * 1024,
            queue_depth: WRITES_IN_FLIGHT * 2,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            mode: "1024x768".into(),
            policy: ChannelPolicy::Split,
            backing: true,
            pixel_limit: DEFAULT_PIXEL_LIMIT,
        }
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            frames: 60,
            input: String::new(),
            pattern: "bars".into(),
            fps: 0,
            output: String::new(),
            verify: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl PushConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Resolve the configured mode preset.
    pub fn video_mode(&self) -> Result<VideoMode, DlfbError> {
        VideoMode::preset(&self.display.mode)
            .ok_or_else(|| DlfbError::Config(format!("unknown mode {:?}", self.display.mode)))
    }

    /// Convert into a `SessionConfig`.
    pub fn to_session_config(&self) -> Result<SessionConfig, DlfbError> {
        Ok(SessionConfig {
            mode: self.video_mode()?,
            slots: self.device.slots.max(1),
            slot_size: self.device.slot_size,
            acquire_timeout: Duration::from_millis(self.device.acquire_timeout_ms.max(1)),
            drain_timeout: Duration::from_millis(self.device.drain_timeout_ms.max(1)),
            pixel_limit: self.display.pixel_limit,
            policy: self.display.policy,
            backing: self.display.backing,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
