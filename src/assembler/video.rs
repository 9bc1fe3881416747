//! Video frame assembler.
//!
//! Accumulates encoder output continuously. Each frame boundary publishes the
//! accumulated bytes as the new ready frame with the next sequence number.
//! A buffer that failed in transit or cannot be read contributes nothing;
//! the rest of its frame is still published.
//! The ready frame is swapped in whole, so a reader on another thread only
//! ever sees a complete frame.

use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::recycle;
use crate::buffer::{BufferHeader, BufferPool};
use crate::error::CaptureError;
use crate::port::{BufferCallback, OutputPort};

/// A completed video frame.
#[derive(Debug)]
pub struct VideoFrame {
    data: Vec<u8>,
    frame_number: u64,
}

impl VideoFrame {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Sequence number, starting at 1 for the first published frame.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }
}

/// Counters for a video stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VideoStats {
    pub frames_completed: u64,
    /// Buffers whose payload was left out of their frame.
    pub buffers_skipped: u64,
    pub transmission_failures: u64,
}

/// Buffer callback for the streaming pipeline.
pub struct VideoFrameAssembler {
    pool: BufferPool,
    working: Mutex<Vec<u8>>,
    ready: ArcSwapOption<VideoFrame>,
    buffers_skipped: AtomicU64,
    transmission_failures: AtomicU64,
    pool_fault: AtomicBool,
}

impl VideoFrameAssembler {
    pub fn new(pool: BufferPool) -> Self {
        log::info!("VideoFrameAssembler: created");
        Self {
            pool,
            working: Mutex::new(Vec::new()),
            ready: ArcSwapOption::empty(),
            buffers_skipped: AtomicU64::new(0),
            transmission_failures: AtomicU64::new(0),
            pool_fault: AtomicBool::new(false),
        }
    }

    /// Most recently completed frame, if any.
    pub fn latest_frame(&self) -> Option<Arc<VideoFrame>> {
        self.ready.load_full()
    }

    /// Sequence number of the ready frame, 0 before the first frame.
    pub fn frame_number(&self) -> u64 {
        self.ready
            .load()
            .as_ref()
            .map(|frame| frame.frame_number)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> VideoStats {
        VideoStats {
            frames_completed: self.frame_number(),
            buffers_skipped: self.buffers_skipped.load(Ordering::Relaxed),
            transmission_failures: self.transmission_failures.load(Ordering::Relaxed),
        }
    }

    /// True once a replacement buffer could not be sent back to the port.
    pub fn has_pool_fault(&self) -> bool {
        self.pool_fault.load(Ordering::Acquire)
    }

    fn consume(&self, buffer: &mut BufferHeader) {
        let mapped = buffer.lock();
        let length = mapped.length();
        let flags = mapped.flags();
        log::trace!("VideoFrameAssembler: length={} flags={:#x}", length, flags.bits());

        let mut working = self.working.lock().unwrap_or_else(PoisonError::into_inner);

        if flags.is_transmission_failed() {
            // Payload skipped; a frame end on the same buffer still completes the frame.
            log::warn!("VideoFrameAssembler: buffer transmission failed, skipping {} bytes", length);
            self.transmission_failures.fetch_add(1, Ordering::Relaxed);
            self.buffers_skipped.fetch_add(1, Ordering::Relaxed);
        } else if length > 0 {
            match mapped.payload() {
                Ok(data) => working.extend_from_slice(data),
                Err(err) => {
                    log::error!("VideoFrameAssembler: error reading frame data: {:#}", err);
                    self.buffers_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if flags.is_frame_end() {
            let capacity = working.len();
            let bytes = std::mem::replace(&mut *working, Vec::with_capacity(capacity));
            self.publish(bytes);
        }
    }

    /// Swap in a completed frame. Called with the working lock held, so
    /// sequence numbers advance by exactly one per publish.
    fn publish(&self, data: Vec<u8>) {
        let frame_number = self.frame_number() + 1;
        log::debug!(
            "VideoFrameAssembler: frame {} ready ({} bytes)",
            frame_number,
            data.len()
        );
        self.ready.store(Some(Arc::new(VideoFrame { data, frame_number })));
    }
}

impl BufferCallback for VideoFrameAssembler {
    fn on_buffer(&self, port: &dyn OutputPort, mut buffer: BufferHeader) {
        self.consume(&mut buffer);

        if let Err(err) = recycle(&self.pool, port, buffer) {
            log::error!("VideoFrameAssembler: failed to recycle buffer: {}", err);
            if matches!(err, CaptureError::PoolExhausted) {
                self.pool_fault.store(true, Ordering::Release);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
