//! pipecam: buffer lifecycle and capture synchronization for a
//! camera -> encoder pipeline.
//!
//! The encoder writes each picture into fixed-size buffers it takes from a
//! pool and returns them, one at a time, to a callback running on a hardware
//! thread. This crate owns what happens from there:
//!
//! - `buffer`: buffers, their flags and the pool that keeps the encoder supplied
//! - `assembler`: callbacks that stitch buffers into still or video frames
//! - `camera`: capture sessions (admission gate, arming, deadlines, video polling)
//! - `sink`: consumers of still pictures and video frames
//!
//! Building and connecting the hardware components is abstracted behind
//! `graph::ComponentGraph`; `graph::SimulatedGraph` provides a synthetic one.

pub mod assembler;
pub mod buffer;
pub mod camera;
pub mod config;
pub mod error;
pub mod fps;
pub mod graph;
pub mod port;
pub mod sink;

pub use assembler::{FrameOutcome, StillFrameAssembler, VideoFrame, VideoFrameAssembler, VideoStats};
pub use buffer::{BufferFlags, BufferHeader, BufferPool, MappedBuffer};
pub use camera::Camera;
pub use config::{CameraConfig, Encoding};
pub use error::CaptureError;
pub use fps::FpsCounter;
pub use graph::{
    CaptureBehaviour, CaptureTarget, Chunk, ComponentGraph, PortFormat, SimulatedConfig,
    SimulatedGraph, SimulatedPort,
};
pub use port::{BufferCallback, OutputPort, SendError};
pub use sink::{ByteArraySink, FileSequence, FileSink, PictureSink, VideoFrameHandler};
