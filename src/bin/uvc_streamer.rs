//! uvc_streamer - serve a UVC camera as an HTTP MJPEG stream
//!
//! This daemon:
//! 1. Loads configuration (file, environment, command line)
//! 2. Listens for HTTP clients on the configured port
//! 3. Captures MJPEG frames from the camera and fans them out to every client
//! 4. Re-opens the camera whenever it is unplugged, until interrupted

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uvc_streamer::{Streamer, StreamerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream a UVC camera to HTTP clients as MJPEG")]
struct Args {
    /// Configuration file (.toml, otherwise JSON).
    #[arg(long, env = "UVC_STREAMER_CONFIG")]
    config: Option<PathBuf>,

    /// Capture device, e.g. /dev/video0 or stub://test for a synthetic camera.
    #[arg(short, long)]
    device: Option<String>,

    /// HTTP port.
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Capture frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Number of capture buffers.
    #[arg(long)]
    buffers: Option<u32>,

    /// Maximum concurrent clients.
    #[arg(long)]
    max_clients: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = StreamerConfig::load_from(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.camera.device = device;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(width) = args.width {
        config.camera.width = width;
    }
    if let Some(height) = args.height {
        config.camera.height = height;
    }
    if let Some(fps) = args.fps {
        config.camera.fps = fps;
    }
    if let Some(buffers) = args.buffers {
        config.camera.buffers = buffers;
    }
    if let Some(max_clients) = args.max_clients {
        config.server.max_clients = max_clients;
    }
    config.validate()?;

    log::info!(
        "uvc_streamer {}: {} {}x{}@{} -> port {}",
        env!("CARGO_PKG_VERSION"),
        config.camera.device,
        config.camera.width,
        config.camera.height,
        config.camera.fps,
        config.server.port
    );

    let mut streamer = Streamer::new(&config)?;

    let exit = Arc::new(AtomicBool::new(false));
    let handler_exit = exit.clone();
    ctrlc::set_handler(move || {
        handler_exit.store(true, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    streamer.run(|| exit.load(Ordering::SeqCst));
    log::info!("uvc_streamer stopped");
    Ok(())
}
