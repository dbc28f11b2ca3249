//! dlfb-push: entry point.
//!
//! ```text
//! dlfb-push                      Push frames using dlfb-push.toml
//! dlfb-push --config <path>      Load a custom config TOML
//! dlfb-push --gen-config         Write default config to stdout
//! dlfb-push --input frames.raw   Replay raw ARGB32 frames
//! dlfb-push --output stream.bin  Capture the command stream
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dlfb_push::config::PushConfig;
use dlfb_push::service::PushService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "dlfb-push", about = "Push frames through the dlfb pipeline to a simulated device")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "dlfb-push.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Raw ARGB32 frame file (overrides the config).
    #[arg(short, long)]
    input: Option<String>,

    /// Number of frames to push (overrides the config).
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Video mode preset, e.g. 1280x1024 (overrides the config).
    #[arg(short, long)]
    mode: Option<String>,

    /// Write the command stream to this file (overrides the config).
    #[arg(short, long)]
    output: Option<String>,

    /// Skip comparing device memory with the last frame.
    #[arg(long)]
    no_verify: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&PushConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then apply command-line overrides.
    let mut config = PushConfig::load(&cli.config);
    if let Some(input) = cli.input {
        config.push.input = input;
    }
    if let Some(frames) = cli.frames {
        config.push.frames = frames;
    }
    if let Some(mode) = cli.mode {
        config.display.mode = mode;
    }
    if let Some(output) = cli.output {
        config.push.output = output;
    }
    if cli.no_verify {
        config.push.verify = false;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("dlfb-push v{}", env!("CARGO_PKG_VERSION"));
    info!("mode: {} ({:?})", config.display.mode, config.display.policy);
    info!("slots: {} x {} bytes", config.device.slots, config.device.slot_size);
    info!("frames: {}", config.push.frames);

    let service = PushService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; stopping after the current frame");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    let summary = service.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.mismatched_pixels.is_some_and(|n| n > 0) {
        std::process::exit(2);
    }
    Ok(())
}
