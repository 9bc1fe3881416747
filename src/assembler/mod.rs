//! Frame assemblers: the callbacks enabled on the encoder output port.
//!
//! Both assemblers follow the same recycling discipline. Whatever happens
//! while reading a buffer, it is released to the pool before the callback
//! returns and, while the port is still enabled, a fresh buffer is sent back
//! to the port so the encoder never runs dry.

pub mod still;
pub mod video;

pub use still::{FrameOutcome, StillFrameAssembler};
pub use video::{VideoFrame, VideoFrameAssembler, VideoStats};

use crate::buffer::{BufferHeader, BufferPool};
use crate::error::CaptureError;
use crate::port::OutputPort;

/// Release `buffer` and keep `port` supplied with one replacement.
pub(crate) fn recycle(
    pool: &BufferPool,
    port: &dyn OutputPort,
    buffer: BufferHeader,
) -> Result<(), CaptureError> {
    pool.release(buffer);
    if port.is_enabled() {
        pool.send_next(port)
    } else {
        log::debug!("port {} disabled, not resubmitting", port.name());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A port double that records what the assemblers send back to it.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::Result;

    use crate::buffer::{BufferFlags, BufferHeader, BufferPool};
    use crate::port::{BufferCallback, OutputPort, SendError};

    pub struct RecordingPort {
        enabled: AtomicBool,
        held: Mutex<Vec<BufferHeader>>,
        reject: AtomicBool,
    }

    impl RecordingPort {
        pub fn new() -> Self {
            Self {
                enabled: AtomicBool::new(true),
                held: Mutex::new(Vec::new()),
                reject: AtomicBool::new(false),
            }
        }

        pub fn held(&self) -> usize {
            self.held.lock().unwrap().len()
        }

        pub fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        pub fn set_reject(&self, reject: bool) {
            self.reject.store(reject, Ordering::SeqCst);
        }

        /// Prime the port with every pooled buffer.
        pub fn prime(&self, pool: &BufferPool) {
            while let Some(buffer) = pool.acquire() {
                self.held.lock().unwrap().push(buffer);
            }
        }

        /// Play the hardware: fill a held buffer and run `callback` with it.
        pub fn deliver(
            &self,
            callback: &dyn BufferCallback,
            payload: &[u8],
            flags: BufferFlags,
        ) -> Result<()> {
            let mut buffer = self.take()?;
            buffer.fill(payload, flags)?;
            callback.on_buffer(self, buffer);
            Ok(())
        }

        /// Deliver a buffer whose reported data window lies outside its memory.
        pub fn deliver_corrupt(&self, callback: &dyn BufferCallback, flags: BufferFlags) -> Result<()> {
            let mut buffer = self.take()?;
            buffer.set_region(buffer.capacity(), 8);
            buffer.set_flags(flags);
            callback.on_buffer(self, buffer);
            Ok(())
        }

        fn take(&self) -> Result<BufferHeader> {
            self.held
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no buffer held by port"))
        }
    }

    impl OutputPort for RecordingPort {
        fn name(&self) -> &str {
            "recording"
        }

        fn enable(&self, _callback: Arc<dyn BufferCallback>) -> Result<()> {
            self.set_enabled(true);
            Ok(())
        }

        fn disable(&self) -> Result<()> {
            self.set_enabled(false);
            Ok(())
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn send_buffer(&self, buffer: BufferHeader) -> Result<(), SendError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(SendError {
                    buffer,
                    reason: "rejected by test".to_string(),
                });
            }
            self.held.lock().unwrap().push(buffer);
            Ok(())
        }
    }
}
