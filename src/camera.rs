//! Capture session orchestration.
//!
//! `Camera` owns one opened pipeline: the encoder output port, the pool that
//! feeds it and the assembler enabled on it. Still captures are admitted
//! through a single-permit gate, armed on the still assembler and awaited
//! with an optional deadline. Video captures poll the video assembler's
//! ready frame and hand each new one to the caller.

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::assembler::{FrameOutcome, StillFrameAssembler, VideoFrameAssembler, VideoStats};
use crate::buffer::BufferPool;
use crate::config::CameraConfig;
use crate::error::CaptureError;
use crate::graph::{CaptureTarget, ComponentGraph};
use crate::port::{BufferCallback, OutputPort};
use crate::sink::{PictureSink, VideoFrameHandler};

enum Assembler {
    Still(Arc<StillFrameAssembler>),
    Video(Arc<VideoFrameAssembler>),
}

/// An opened camera pipeline.
///
/// After any still-capture failure other than `Busy`, `WrongMode` or
/// `BeginFailed` the instance should be dropped and reopened; see
/// `CaptureError::requires_reopen`.
pub struct Camera {
    config: CameraConfig,
    graph: Arc<dyn ComponentGraph>,
    encoder_output: Arc<dyn OutputPort>,
    pool: BufferPool,
    assembler: Assembler,
    gate: Mutex<()>,
}

impl Camera {
    /// Create the pool, enable the encoder output with the assembler for the
    /// configured mode and hand every pooled buffer to the port.
    pub fn open(config: CameraConfig, graph: Arc<dyn ComponentGraph>) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::Setup)?;

        let encoder_output = graph.encoder_output();
        let pool = graph.create_pool().map_err(CaptureError::Setup)?;

        let (assembler, callback): (Assembler, Arc<dyn BufferCallback>) = if config.video_mode {
            let video = Arc::new(VideoFrameAssembler::new(pool.clone()));
            (Assembler::Video(Arc::clone(&video)), video)
        } else {
            let still = Arc::new(StillFrameAssembler::new(pool.clone()));
            (Assembler::Still(Arc::clone(&still)), still)
        };

        encoder_output
            .enable(callback)
            .with_context(|| format!("enable port {}", encoder_output.name()))
            .map_err(CaptureError::Setup)?;

        if let Err(err) = prime(&pool, encoder_output.as_ref()) {
            if let Err(disable_err) = encoder_output.disable() {
                log::warn!("Camera: failed to disable encoder output: {:#}", disable_err);
            }
            return Err(CaptureError::Setup(err));
        }

        log::info!(
            "Camera: opened {}x{} {:?} ({} mode, {} buffers of {} bytes)",
            config.width,
            config.height,
            config.encoding,
            if config.video_mode { "video" } else { "still" },
            pool.buffer_num(),
            pool.buffer_size()
        );

        Ok(Self {
            config,
            graph,
            encoder_output,
            pool,
            assembler,
            gate: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Stream counters, in video mode.
    pub fn video_stats(&self) -> Option<VideoStats> {
        match &self.assembler {
            Assembler::Video(video) => Some(video.stats()),
            Assembler::Still(_) => None,
        }
    }

    /// Take one still picture using the configured capture timeout.
    pub fn take_picture<S>(&self, sink: S) -> Result<S::Output, CaptureError>
    where
        S: PictureSink + 'static,
    {
        self.take_picture_with_timeout(sink, self.config.capture_timeout)
    }

    /// Take one still picture, waiting at most `timeout` for the frame
    /// (`None` waits forever).
    pub fn take_picture_with_timeout<S>(
        &self,
        sink: S,
        timeout: Option<Duration>,
    ) -> Result<S::Output, CaptureError>
    where
        S: PictureSink + 'static,
    {
        let still = match &self.assembler {
            Assembler::Still(still) => still,
            Assembler::Video(_) => {
                return Err(CaptureError::WrongMode(
                    "camera was opened in video mode, still pictures are unavailable",
                ))
            }
        };

        // Declared first so it is released last.
        let _gate = self.admit()?;
        log::info!(">>> Begin Take Picture >>>");

        self.settle();

        let sink = Arc::new(Mutex::new(sink));
        {
            // Dropped in reverse order: disarm, then end the sink.
            let _end = SinkEnd(&sink);
            lock(&sink).begin().map_err(|err| {
                log::error!("Camera: picture sink failed to begin: {:#}", err);
                CaptureError::BeginFailed(err)
            })?;

            let session = ArmedSession::new(still, &sink);
            self.graph
                .start_capture(CaptureTarget::Still)
                .map_err(CaptureError::TriggerFailed)?;
            wait_for_frame(&session.done, timeout)?;
        }

        let output = lock(&sink).result();
        Ok(output)
    }

    /// Deliver video frames to `handler` until it returns `false`.
    ///
    /// Fails with `Stalled` if no new frame is published within the
    /// configured capture timeout.
    pub fn capture_video<H>(&self, mut handler: H) -> Result<VideoStats, CaptureError>
    where
        H: VideoFrameHandler,
    {
        let video = match &self.assembler {
            Assembler::Video(video) => video,
            Assembler::Still(_) => {
                return Err(CaptureError::WrongMode(
                    "camera was not opened in video mode",
                ))
            }
        };

        let _gate = self.admit()?;
        log::info!(">>> Begin Video Capture >>>");

        self.settle();
        self.graph
            .start_capture(CaptureTarget::Video)
            .map_err(CaptureError::TriggerFailed)?;

        let window = self.config.capture_timeout;
        let mut last_delivered = 0;
        let mut last_change = Instant::now();

        loop {
            if video.has_pool_fault() {
                log::error!("Camera: encoder port could not be resupplied, stopping video");
                return Err(CaptureError::PoolExhausted);
            }

            if let Some(frame) = video.latest_frame() {
                if frame.frame_number() != last_delivered {
                    last_delivered = frame.frame_number();
                    let keep_going = handler.frame_ready(frame.data(), frame.frame_number());
                    last_change = Instant::now();
                    if !keep_going {
                        break;
                    }
                    continue;
                }
            }

            if let Some(window) = window {
                if last_change.elapsed() > window {
                    log::error!(
                        "Camera: no new frame after {:?} (last frame {})",
                        window,
                        last_delivered
                    );
                    return Err(CaptureError::Stalled(window));
                }
            }

            thread::sleep(self.config.poll_interval);
        }

        let stats = video.stats();
        log::info!(
            "<<< End Video Capture <<< ({} frames, {} buffers skipped)",
            stats.frames_completed,
            stats.buffers_skipped
        );
        Ok(stats)
    }

    /// Non-blocking admission: a gate, not a queue.
    fn admit(&self) -> Result<MutexGuard<'_, ()>, CaptureError> {
        match self.gate.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                log::warn!("Attempt to start a capture while camera is already busy");
                Err(CaptureError::Busy)
            }
        }
    }

    fn settle(&self) {
        if let Some(delay) = self.config.delay.filter(|delay| !delay.is_zero()) {
            log::debug!("Camera: waiting {:?} before capture", delay);
            thread::sleep(delay);
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if self.encoder_output.is_enabled() {
            if let Err(err) = self.encoder_output.disable() {
                log::warn!("Camera: failed to disable encoder output: {:#}", err);
            }
        }
        log::info!("Camera: closed");
    }
}

/// Hand every buffer currently in the pool to `port`.
fn prime(pool: &BufferPool, port: &dyn OutputPort) -> anyhow::Result<()> {
    let count = pool.available();
    for _ in 0..count {
        let buffer = pool
            .acquire()
            .context("buffer pool emptied while priming the encoder port")?;
        pool.submit(buffer, port)?;
    }
    log::debug!("Camera: primed {} with {} buffers", port.name(), count);
    Ok(())
}

fn wait_for_frame(
    done: &Receiver<FrameOutcome>,
    timeout: Option<Duration>,
) -> Result<(), CaptureError> {
    let outcome = match timeout {
        Some(timeout) => match done.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                log::error!("Camera: capture timed out after {:?}", timeout);
                return Err(CaptureError::Timeout(timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CaptureError::Faulted("completion signal dropped".to_string()))
            }
        },
        None => done
            .recv()
            .map_err(|_| CaptureError::Faulted("completion signal dropped".to_string()))?,
    };
    outcome.into_result()
}

fn lock<S>(sink: &Mutex<S>) -> MutexGuard<'_, S> {
    sink.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs the sink's `end` hook on every exit path once the sink is built.
struct SinkEnd<'a, S: PictureSink>(&'a Mutex<S>);

impl<S: PictureSink> Drop for SinkEnd<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = lock(self.0).end() {
            log::warn!("Camera: picture sink failed to end: {:#}", err);
        }
        log::info!("<<< End Take Picture <<<");
    }
}

/// Armed still session. Dropping it disarms the assembler.
struct ArmedSession<'a> {
    still: &'a StillFrameAssembler,
    done: Receiver<FrameOutcome>,
}

impl<'a> ArmedSession<'a> {
    fn new<S: PictureSink + 'static>(still: &'a StillFrameAssembler, sink: &Arc<Mutex<S>>) -> Self {
        let done = still.arm(Arc::clone(sink));
        Self { still, done }
    }
}

impl Drop for ArmedSession<'_> {
    fn drop(&mut self) {
        self.still.disarm();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CaptureBehaviour, PortFormat, SimulatedConfig, SimulatedGraph};
    use crate::sink::ByteArraySink;

    fn small_config(video_mode: bool) -> CameraConfig {
        CameraConfig {
            width: 32,
            height: 32,
            capture_timeout: Some(Duration::from_secs(2)),
            video_mode,
            fps: 200,
            poll_interval: Duration::from_millis(2),
            ..CameraConfig::default()
        }
    }

    fn graph_for(config: &CameraConfig) -> Arc<SimulatedGraph> {
        Arc::new(SimulatedGraph::new(SimulatedConfig {
            format: PortFormat {
                buffer_num_min: 2,
                buffer_num_recommended: 2,
                buffer_size_min: 100,
                buffer_size_recommended: 100,
            },
            ..SimulatedConfig::for_camera(config)
        }))
    }

    #[test]
    fn open_primes_every_buffer() -> Result<(), CaptureError> {
        let config = small_config(false);
        let graph = graph_for(&config);
        let camera = Camera::open(config, graph.clone())?;
        assert_eq!(camera.pool().available(), 0);
        assert_eq!(graph.encoder_port().held(), camera.pool().buffer_num());
        Ok(())
    }

    #[test]
    fn drop_disables_encoder_output() -> Result<(), CaptureError> {
        let config = small_config(false);
        let graph = graph_for(&config);
        let camera = Camera::open(config, graph.clone())?;
        assert!(graph.encoder_port().is_enabled());
        drop(camera);
        assert!(!graph.encoder_port().is_enabled());
        Ok(())
    }

    #[test]
    fn still_capture_returns_frame_bytes() -> Result<(), CaptureError> {
        let config = small_config(false);
        let graph = graph_for(&config);
        let camera = Camera::open(config, graph.clone())?;
        let bytes = camera.take_picture(ByteArraySink::new())?;
        assert_eq!(bytes, graph.frame_bytes(1));
        Ok(())
    }

    #[test]
    fn modes_are_enforced() -> Result<(), CaptureError> {
        let still = small_config(false);
        let camera = Camera::open(still.clone(), graph_for(&still))?;
        let err = camera.capture_video(|_: &[u8], _: u64| false).unwrap_err();
        assert_eq!(err.code(), "CAPTURE_WRONG_MODE");
        assert!(camera.video_stats().is_none());

        let video = small_config(true);
        let camera = Camera::open(video.clone(), graph_for(&video))?;
        let err = camera.take_picture(ByteArraySink::new()).unwrap_err();
        assert_eq!(err.code(), "CAPTURE_WRONG_MODE");
        assert!(!err.requires_reopen());
        Ok(())
    }

    #[test]
    fn trigger_failure_disarms_and_frees_gate() -> Result<(), CaptureError> {
        let config = small_config(false);
        let graph = graph_for(&config);
        let camera = Camera::open(config, graph.clone())?;
        graph.queue_behaviour(CaptureBehaviour::RejectTrigger);

        let err = camera.take_picture(ByteArraySink::new()).unwrap_err();
        assert!(matches!(err, CaptureError::TriggerFailed(_)));
        match &camera.assembler {
            Assembler::Still(still) => assert!(!still.is_armed()),
            Assembler::Video(_) => unreachable!(),
        }
        assert!(camera.take_picture(ByteArraySink::new()).is_ok());
        Ok(())
    }
}
