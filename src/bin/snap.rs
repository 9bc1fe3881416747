//! snap - take one still picture and write it to a file.
//!
//! Runs against the synthetic camera graph; the file receives whatever the
//! encoder produced for the frame.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pipecam::{Camera, CameraConfig, Encoding, FileSink, SimulatedGraph};

#[derive(Parser, Debug)]
#[command(author, version, about = "Take a still picture")]
struct Args {
    /// Picture width in pixels.
    width: u32,

    /// Picture height in pixels.
    height: u32,

    /// Output file.
    file: PathBuf,

    /// Encoder quality factor (1-100).
    #[arg(long, env = "PICAM_QUALITY", default_value_t = 85)]
    quality: u32,

    /// Output encoding: jpeg, png, bmp or gif.
    #[arg(long, env = "PICAM_ENCODING")]
    encoding: Option<Encoding>,

    /// Milliseconds to wait for the picture; 0 waits forever.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Sensor settling time before triggering, in milliseconds.
    #[arg(long, env = "PICAM_DELAY_MS")]
    delay_ms: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = CameraConfig::load()?;
    config.width = args.width;
    config.height = args.height;
    config.quality = Some(args.quality);
    config.video_mode = false;
    if let Some(encoding) = args.encoding {
        config.encoding = encoding;
    }
    if let Some(delay_ms) = args.delay_ms {
        config.delay = Some(Duration::from_millis(delay_ms));
    }
    config.validate()?;

    let timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));

    let graph = Arc::new(SimulatedGraph::for_camera(&config));
    let camera = Camera::open(config, graph).context("open camera")?;

    let path = camera
        .take_picture_with_timeout(FileSink::new(&args.file), timeout)
        .map_err(|err| anyhow!("[{}] {}", err.code(), err))?;

    log::info!("picture written to {}", path.display());
    Ok(())
}
