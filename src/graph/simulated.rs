//! Synthetic camera/encoder graph.
//!
//! Stands in for the hardware graph: a producer thread plays the encoder,
//! taking buffers queued on the output port, filling them with a synthetic
//! encoded frame and invoking the enabled callback, exactly as the hardware
//! callback thread would.
//!
//! Each capture request consumes the next queued `CaptureBehaviour`
//! (default `Frames`), which lets tests drive stalls, scripted buffer
//! sequences and trigger failures.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{CaptureTarget, ComponentGraph, PortFormat};
use crate::buffer::{BufferFlags, BufferHeader, BufferPool};
use crate::config::{CameraConfig, Encoding};
use crate::port::{BufferCallback, OutputPort, SendError};

/// Settings for the synthetic encoder.
#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    pub encoding: Encoding,
    /// Size in bytes of each synthetic encoded frame.
    pub frame_len: usize,
    pub fps: u32,
    pub streaming: bool,
    pub format: PortFormat,
}

impl SimulatedConfig {
    pub fn for_camera(config: &CameraConfig) -> Self {
        let pixels = config.width as usize * config.height as usize;
        Self {
            encoding: config.encoding,
            frame_len: (pixels / 8).max(256),
            fps: config.fps,
            streaming: config.video_mode,
            format: PortFormat::default(),
        }
    }
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self::for_camera(&CameraConfig::default())
    }
}

/// One buffer's worth of scripted encoder output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub flags: BufferFlags,
}

impl Chunk {
    pub fn new(data: impl Into<Vec<u8>>, flags: BufferFlags) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// A mid-frame buffer.
    pub fn part(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, BufferFlags::empty())
    }

    /// The last buffer of a frame.
    pub fn end(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, BufferFlags::FRAME_END)
    }
}

/// What the synthetic encoder does in response to one capture request.
#[derive(Clone, Debug)]
pub enum CaptureBehaviour {
    /// One frame for a still capture, a continuous stream for video.
    Frames,
    /// Emit this many frames, then go silent.
    Burst(u64),
    /// Emit exactly these buffers.
    Script(Vec<Chunk>),
    /// Accept the request and never produce anything.
    Stall,
    /// Fail the capture-start parameter.
    RejectTrigger,
}

// ----------------------------------------------------------------------------
// SimulatedPort
// ----------------------------------------------------------------------------

/// Output port whose buffers are filled by the simulated producer.
pub struct SimulatedPort {
    name: String,
    enabled: AtomicBool,
    callback: Mutex<Option<Arc<dyn BufferCallback>>>,
    held: Mutex<VecDeque<BufferHeader>>,
}

impl SimulatedPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(false),
            callback: Mutex::new(None),
            held: Mutex::new(VecDeque::new()),
        }
    }

    /// Buffers queued on the port, waiting to be written.
    pub fn held(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn emit(&self, chunk: &Chunk) -> Result<()> {
        self.emit_bytes(&chunk.data, chunk.flags)
    }

    /// Fill the oldest queued buffer and hand it to the callback on this thread.
    pub fn emit_bytes(&self, payload: &[u8], flags: BufferFlags) -> Result<()> {
        if !self.is_enabled() {
            bail!("port {} is disabled", self.name);
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .with_context(|| format!("port {} has no callback", self.name))?;
        let mut buffer = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| anyhow!("port {} has no buffer queued, encoder starved", self.name))?;
        if let Err(err) = buffer.fill(payload, flags) {
            self.held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_front(buffer);
            return Err(err);
        }
        callback.on_buffer(self, buffer);
        Ok(())
    }
}

impl OutputPort for SimulatedPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn enable(&self, callback: Arc<dyn BufferCallback>) -> Result<()> {
        if self.enabled.swap(true, Ordering::SeqCst) {
            bail!("port {} is already enabled", self.name);
        }
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
        log::debug!("SimulatedPort: {} enabled", self.name);
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        log::debug!("SimulatedPort: {} disabled", self.name);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn send_buffer(&self, buffer: BufferHeader) -> std::result::Result<(), SendError> {
        if !self.is_enabled() {
            return Err(SendError {
                buffer,
                reason: format!("port {} is disabled", self.name),
            });
        }
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(buffer);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// SimulatedGraph
// ----------------------------------------------------------------------------

#[derive(Default)]
struct ProducerState {
    shutdown: AtomicBool,
    streaming: AtomicBool,
    frames_emitted: AtomicU64,
}

/// Camera + encoder graph backed by producer threads instead of hardware.
pub struct SimulatedGraph {
    config: SimulatedConfig,
    encoder: Arc<SimulatedPort>,
    behaviours: Mutex<VecDeque<CaptureBehaviour>>,
    state: Arc<ProducerState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SimulatedGraph {
    pub fn new(config: SimulatedConfig) -> Self {
        log::info!(
            "SimulatedGraph: {:?} frames of {} bytes, streaming={}",
            config.encoding,
            config.frame_len,
            config.streaming
        );
        Self {
            config,
            encoder: Arc::new(SimulatedPort::new("encoder:out0")),
            behaviours: Mutex::new(VecDeque::new()),
            state: Arc::new(ProducerState::default()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn for_camera(config: &CameraConfig) -> Self {
        Self::new(SimulatedConfig::for_camera(config))
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    pub fn encoder_port(&self) -> Arc<SimulatedPort> {
        Arc::clone(&self.encoder)
    }

    /// Use `behaviour` for the next capture request instead of `Frames`.
    pub fn queue_behaviour(&self, behaviour: CaptureBehaviour) {
        self.behaviours
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(behaviour);
    }

    pub fn frames_emitted(&self) -> u64 {
        self.state.frames_emitted.load(Ordering::SeqCst)
    }

    /// The bytes of the `sequence`-th synthetic frame.
    pub fn frame_bytes(&self, sequence: u64) -> Vec<u8> {
        synthetic_frame(self.config.encoding, sequence, self.config.frame_len)
    }

    fn spawn_producer<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&SimulatedPort, &ProducerState, &SimulatedConfig) -> Result<()> + Send + 'static,
    {
        let port = Arc::clone(&self.encoder);
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("simulated-encoder".to_string())
            .spawn(move || {
                if let Err(err) = work(&port, &state, &config) {
                    log::warn!("SimulatedGraph: producer stopped: {:#}", err);
                }
            })
            .context("spawn simulated encoder thread")?;
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
        Ok(())
    }

    fn spawn_frames(&self, count: u64) -> Result<()> {
        self.spawn_producer(move |port, state, config| {
            for _ in 0..count {
                let sequence = state.frames_emitted.fetch_add(1, Ordering::SeqCst) + 1;
                emit_frame(port, config, sequence)?;
            }
            Ok(())
        })
    }

    fn spawn_stream(&self, limit: Option<u64>) -> Result<()> {
        if self.state.streaming.swap(true, Ordering::SeqCst) {
            log::debug!("SimulatedGraph: stream already running");
            return Ok(());
        }
        self.spawn_producer(move |port, state, config| {
            let interval = Duration::from_secs(1) / config.fps.max(1);
            let mut emitted = 0u64;
            while !state.shutdown.load(Ordering::SeqCst) && port.is_enabled() {
                if limit.is_some_and(|limit| emitted >= limit) {
                    log::warn!("SimulatedGraph: stream went silent after {} frames", emitted);
                    break;
                }
                let sequence = state.frames_emitted.fetch_add(1, Ordering::SeqCst) + 1;
                if let Err(err) = emit_frame(port, config, sequence) {
                    if !port.is_enabled() {
                        break;
                    }
                    log::warn!("SimulatedGraph: dropped frame {}: {:#}", sequence, err);
                }
                emitted += 1;
                thread::sleep(interval);
            }
            state.streaming.store(false, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl ComponentGraph for SimulatedGraph {
    fn encoder_output(&self) -> Arc<dyn OutputPort> {
        self.encoder.clone()
    }

    fn create_pool(&self) -> Result<BufferPool> {
        let (buffer_num, buffer_size) = self.config.format.negotiate(self.config.streaming);
        BufferPool::new(buffer_num, buffer_size).context("create encoder picture pool")
    }

    fn start_capture(&self, target: CaptureTarget) -> Result<()> {
        let behaviour = self
            .behaviours
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(CaptureBehaviour::Frames);
        log::debug!("SimulatedGraph: capture on {:?} port: {:?}", target, behaviour);

        match behaviour {
            CaptureBehaviour::RejectTrigger => {
                bail!("camera {:?} port rejected the capture parameter", target)
            }
            CaptureBehaviour::Stall => {
                log::warn!("SimulatedGraph: stalling, no frames will be produced");
                Ok(())
            }
            CaptureBehaviour::Script(chunks) => self.spawn_producer(move |port, _, _| {
                for chunk in &chunks {
                    port.emit(chunk)?;
                }
                Ok(())
            }),
            CaptureBehaviour::Frames if target == CaptureTarget::Video => self.spawn_stream(None),
            CaptureBehaviour::Burst(count) if target == CaptureTarget::Video => {
                self.spawn_stream(Some(count))
            }
            CaptureBehaviour::Frames => self.spawn_frames(1),
            CaptureBehaviour::Burst(count) => self.spawn_frames(count),
        }
    }
}

impl Drop for SimulatedGraph {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let _ = worker.join();
        }
    }
}

/// Split one synthetic frame across as many port buffers as it needs.
fn emit_frame(port: &SimulatedPort, config: &SimulatedConfig, sequence: u64) -> Result<()> {
    let frame = synthetic_frame(config.encoding, sequence, config.frame_len);
    let (_, buffer_size) = config.format.negotiate(config.streaming);
    let mut chunks = frame.chunks(buffer_size).peekable();
    while let Some(chunk) = chunks.next() {
        let flags = if chunks.peek().is_none() {
            BufferFlags::FRAME_END
        } else {
            BufferFlags::empty()
        };
        port.emit_bytes(chunk, flags)
            .with_context(|| format!("emit frame {}", sequence))?;
    }
    Ok(())
}

/// Deterministic stand-in for an encoded picture: format magic, the sequence
/// number, a filler pattern and the format trailer.
pub fn synthetic_frame(encoding: Encoding, sequence: u64, len: usize) -> Vec<u8> {
    let (header, trailer): (&[u8], &[u8]) = match encoding {
        Encoding::Jpeg => (&[0xFF, 0xD8, 0xFF, 0xE0], &[0xFF, 0xD9]),
        Encoding::Png => (b"\x89PNG\r\n\x1a\n", b"IEND\xaeB`\x82"),
        Encoding::Bmp => (b"BM", &[]),
        Encoding::Gif => (b"GIF89a", &[0x3B]),
    };
    let len = len.max(header.len() + 8 + trailer.len());
    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(header);
    frame.extend_from_slice(&sequence.to_be_bytes());
    let filler = len - frame.len() - trailer.len();
    frame.extend((0..filler).map(|i| ((i as u64 + sequence) % 251) as u8));
    frame.extend_from_slice(trailer);
    frame
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
