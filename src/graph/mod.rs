//! Component graph seen by the capture engine.
//!
//! Building the camera/encoder graph, negotiating formats and connecting
//! ports happens once, before any capture. The engine then needs three
//! things from it:
//! - the encoder output port, where filled buffers come back
//! - a buffer pool sized from that port's negotiated format
//! - a way to tell the camera to start producing frames
//!
//! `SimulatedGraph` implements this with synthetic frames for tests and demos.

pub mod simulated;

pub use simulated::{CaptureBehaviour, Chunk, SimulatedConfig, SimulatedGraph, SimulatedPort};

use anyhow::Result;
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::port::OutputPort;

/// Minimum buffers kept in flight on a streaming port so frames are not dropped.
pub const VIDEO_OUTPUT_BUFFERS_NUM: usize = 3;

/// Which camera port the capture-start parameter is set on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureTarget {
    Still,
    Video,
}

pub trait ComponentGraph: Send + Sync {
    fn encoder_output(&self) -> Arc<dyn OutputPort>;

    /// Create the pool of buffers the encoder output writes into.
    fn create_pool(&self) -> Result<BufferPool>;

    /// Set the capture-start parameter on the camera port for `target`.
    fn start_capture(&self, target: CaptureTarget) -> Result<()>;
}

/// Buffer requirements reported by a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortFormat {
    pub buffer_num_min: usize,
    pub buffer_num_recommended: usize,
    pub buffer_size_min: usize,
    pub buffer_size_recommended: usize,
}

impl PortFormat {
    /// Buffer count and size to commit: the larger of recommended and minimum,
    /// with at least `VIDEO_OUTPUT_BUFFERS_NUM` buffers when streaming.
    pub fn negotiate(&self, streaming: bool) -> (usize, usize) {
        let mut buffer_num = self.buffer_num_recommended.max(self.buffer_num_min);
        if streaming && buffer_num < VIDEO_OUTPUT_BUFFERS_NUM {
            log::info!(
                "enlarge video buffer count from {} to {}",
                buffer_num,
                VIDEO_OUTPUT_BUFFERS_NUM
            );
            buffer_num = VIDEO_OUTPUT_BUFFERS_NUM;
        }
        let buffer_size = self.buffer_size_recommended.max(self.buffer_size_min);
        (buffer_num, buffer_size)
    }
}

impl Default for PortFormat {
    fn default() -> Self {
        Self {
            buffer_num_min: 1,
            buffer_num_recommended: 2,
            buffer_size_min: 2048,
            buffer_size_recommended: 81_920,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_prefers_larger_values() {
        let format = PortFormat {
            buffer_num_min: 4,
            buffer_num_recommended: 2,
            buffer_size_min: 1024,
            buffer_size_recommended: 4096,
        };
        assert_eq!(format.negotiate(false), (4, 4096));
    }

    #[test]
    fn streaming_keeps_three_buffers_in_flight() {
        let format = PortFormat {
            buffer_num_min: 1,
            buffer_num_recommended: 1,
            ..PortFormat::default()
        };
        assert_eq!(format.negotiate(false).0, 1);
        assert_eq!(format.negotiate(true).0, VIDEO_OUTPUT_BUFFERS_NUM);
    }
}
