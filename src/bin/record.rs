//! record - stream video frames from the camera to numbered files.
//!
//! Stops after `--frames` frames, or on Ctrl-C when `--frames` is 0.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pipecam::{Camera, CameraConfig, FileSequence, FpsCounter, PictureSink, SimulatedGraph};

#[derive(Parser, Debug)]
#[command(author, version, about = "Record video frames to numbered files")]
struct Args {
    /// Number of frames to record; 0 records until interrupted.
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// Directory for the frame files.
    #[arg(long, default_value = "frames")]
    out_dir: PathBuf,

    /// Frames per second requested from the camera.
    #[arg(long, env = "PICAM_FPS")]
    fps: Option<u32>,

    /// Frame width in pixels.
    #[arg(long, env = "PICAM_WIDTH")]
    width: Option<u32>,

    /// Frame height in pixels.
    #[arg(long, env = "PICAM_HEIGHT")]
    height: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = CameraConfig::load()?;
    config.video_mode = true;
    if let Some(fps) = args.fps {
        config.fps = fps;
    }
    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(height) = args.height {
        config.height = height;
    }
    config.validate()?;

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("create output directory {}", args.out_dir.display()))?;
    let pattern = args
        .out_dir
        .join(format!("image-{{n}}.{}", config.encoding.extension()));
    let mut files = FileSequence::new(pattern.to_string_lossy().into_owned());

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .context("install Ctrl-C handler")?;
    }

    let graph = Arc::new(SimulatedGraph::for_camera(&config));
    let camera = Camera::open(config, graph).context("open camera")?;

    let mut fps = FpsCounter::default();
    let mut written = 0u64;
    let mut write_error: Option<anyhow::Error> = None;

    let stats = camera
        .capture_video(|data: &[u8], frame_number: u64| {
            let mut sink = files.next_sink();
            let saved = sink
                .begin()
                .and_then(|_| sink.picture_data(data))
                .and_then(|_| sink.end());
            if let Err(err) = saved {
                write_error = Some(err.context(format!("save frame {}", frame_number)));
                return false;
            }
            written += 1;

            let rate = fps.update();
            log::info!(
                "frame {} -> {} ({} bytes, {:.1} fps)",
                frame_number,
                sink.result().display(),
                data.len(),
                rate
            );

            if stop.load(Ordering::SeqCst) {
                log::info!("interrupted");
                return false;
            }
            args.frames == 0 || written < args.frames
        })
        .map_err(|err| anyhow!("[{}] {}", err.code(), err))?;

    if let Some(err) = write_error {
        return Err(err);
    }

    log::info!(
        "recorded {} frames to {} ({} buffers skipped, {} transmission failures)",
        written,
        args.out_dir.display(),
        stats.buffers_skipped,
        stats.transmission_failures
    );
    Ok(())
}
