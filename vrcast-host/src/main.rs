//! vrcast host entry point.
//!
//! ```text
//! vrcast-host                   Stream the desktop to stdout
//! vrcast-host --config <path>   Load a custom config TOML
//! vrcast-host --frames <n>      Stop after n streamed frames
//! vrcast-host --inspect         Read a framed stream on stdin and log it
//! vrcast-host --gen-config      Write default config to stdout
//! ```
//!
//! stdout carries the binary stream, so logs go to stderr or to the
//! configured log file.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vrcast_core::CastError;
use vrcast_host::config::{HostConfig, LoggingSection};
use vrcast_host::service::{self, HostService};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vrcast-host", about = "Desktop capture to framed stdout stream")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vrcast-host.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Read a framed stream from stdin and log each message.
    #[arg(long)]
    inspect: bool,

    /// Stop after this many streamed frames (overrides the config).
    #[arg(long)]
    frames: Option<u64>,
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(frames) = cli.frames {
        config.pipeline.max_frames = frames;
    }
    init_tracing(&config.logging)?;

    info!("vrcast-host v{}", env!("CARGO_PKG_VERSION"));

    if cli.inspect {
        service::inspect(io::stdin().lock())?;
        return Ok(());
    }

    info!("capture backend: {:?}", config.capture.backend);
    info!("capture rate: {} fps", config.capture.rate_fps);
    info!("output mode: {:?}", config.encoder.mode);
    info!("encoder fps: {}", config.encoder.fps);

    let service = HostService::new(config);
    let stop = service.stop_handle();
    ctrlc::set_handler(move || {
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    })?;

    match service.run() {
        Ok(stats) => {
            info!(frames = stats.frames_emitted, bytes = stats.bytes_written, "done");
            Ok(())
        }
        Err(CastError::BrokenStream) => {
            info!("consumer closed the stream");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn init_tracing(logging: &LoggingSection) -> io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}
