//! Hardware port contract consumed by the capture engine.
//!
//! Ports belong to the component graph, which is built and connected before
//! any capture runs. The engine only needs to enable a port with a callback,
//! check whether it is still enabled, and hand it buffers to fill.

use anyhow::Result;
use std::sync::Arc;

use crate::buffer::BufferHeader;

/// Invoked from the hardware callback context each time a port returns a filled buffer.
///
/// Implementations take ownership of `buffer` and must give it back to the pool
/// before returning. They must not block on application-side work and must not panic.
pub trait BufferCallback: Send + Sync {
    fn on_buffer(&self, port: &dyn OutputPort, buffer: BufferHeader);
}

/// A port rejected a buffer. The buffer is handed back so it can be pooled again.
#[derive(Debug)]
pub struct SendError {
    pub buffer: BufferHeader,
    pub reason: String,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer {} rejected: {}", self.buffer.id(), self.reason)
    }
}

/// An output port on a hardware component (e.g. encoder output).
pub trait OutputPort: Send + Sync {
    fn name(&self) -> &str;

    /// Start delivering filled buffers to `callback`.
    fn enable(&self, callback: Arc<dyn BufferCallback>) -> Result<()>;

    /// Stop delivering buffers. Buffers still held by the port are returned
    /// through the callback or kept until the port is torn down.
    fn disable(&self) -> Result<()>;

    fn is_enabled(&self) -> bool;

    /// Queue `buffer` on the port for the hardware to write into.
    fn send_buffer(&self, buffer: BufferHeader) -> std::result::Result<(), SendError>;
}
