//! Consumers of captured picture bytes.
//!
//! A `PictureSink` receives the bytes of one still frame, in delivery order,
//! from the hardware callback thread. `VideoFrameHandler` receives whole
//! video frames on the thread that called `Camera::capture_video`.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Write buffer for file sinks. Encoder buffers are typically tens of KB.
const FILE_BUFFER_SIZE: usize = 32 * 1024;

/// Receives the encoded bytes of one still capture.
///
/// `begin` runs on the caller's thread before hardware is triggered; a failure
/// aborts the capture. `picture_data` runs on the callback thread. `end` always
/// runs once the capture finishes, whatever the outcome; its errors are logged.
pub trait PictureSink: Send {
    type Output;

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn picture_data(&mut self, data: &[u8]) -> Result<()>;

    fn end(&mut self) -> Result<()> {
        Ok(())
    }

    fn result(&mut self) -> Self::Output;
}

/// Object-safe view of a sink, used while it is armed on the still assembler.
pub(crate) trait FrameSink: Send {
    fn write_frame_data(&mut self, data: &[u8]) -> Result<()>;
}

impl<S: PictureSink> FrameSink for S {
    fn write_frame_data(&mut self, data: &[u8]) -> Result<()> {
        self.picture_data(data)
    }
}

/// Receives each completed video frame with its sequence number.
///
/// Returning `false` stops the capture loop.
pub trait VideoFrameHandler {
    fn frame_ready(&mut self, data: &[u8], frame_number: u64) -> bool;
}

impl<F> VideoFrameHandler for F
where
    F: FnMut(&[u8], u64) -> bool,
{
    fn frame_ready(&mut self, data: &[u8], frame_number: u64) -> bool {
        self(data, frame_number)
    }
}

// ----------------------------------------------------------------------------
// ByteArraySink
// ----------------------------------------------------------------------------

/// Collects the picture in memory.
#[derive(Debug, Default)]
pub struct ByteArraySink {
    initial_capacity: Option<usize>,
    out: Vec<u8>,
}

impl ByteArraySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial_capacity: usize) -> Self {
        Self {
            initial_capacity: Some(initial_capacity),
            out: Vec::new(),
        }
    }
}

impl PictureSink for ByteArraySink {
    type Output = Vec<u8>;

    fn begin(&mut self) -> Result<()> {
        self.out = match self.initial_capacity {
            Some(capacity) => Vec::with_capacity(capacity),
            None => Vec::new(),
        };
        Ok(())
    }

    fn picture_data(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("ByteArraySink: {} bytes", data.len());
        self.out.extend_from_slice(data);
        Ok(())
    }

    fn result(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

// ----------------------------------------------------------------------------
// FileSink
// ----------------------------------------------------------------------------

/// Streams the picture straight to a file.
pub struct FileSink {
    path: PathBuf,
    out: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            out: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PictureSink for FileSink {
    type Output = PathBuf;

    fn begin(&mut self) -> Result<()> {
        log::debug!("FileSink: opening {}", self.path.display());
        let file = File::create(&self.path)
            .with_context(|| format!("create picture file {}", self.path.display()))?;
        self.out = Some(BufWriter::with_capacity(FILE_BUFFER_SIZE, file));
        Ok(())
    }

    fn picture_data(&mut self, data: &[u8]) -> Result<()> {
        let out = self.out.as_mut().context("picture file is not open")?;
        out.write_all(data)
            .with_context(|| format!("write picture file {}", self.path.display()))
    }

    fn end(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()
                .with_context(|| format!("flush picture file {}", self.path.display()))?;
        }
        Ok(())
    }

    fn result(&mut self) -> PathBuf {
        self.path.clone()
    }
}

// ----------------------------------------------------------------------------
// FileSequence
// ----------------------------------------------------------------------------

/// Hands out `FileSink`s with consecutive numbered names.
///
/// The `{n}` placeholder in the pattern is replaced by the zero-padded
/// (four digit) sequence number, e.g. `shots/image-{n}.jpg`.
#[derive(Clone, Debug)]
pub struct FileSequence {
    pattern: String,
    next: u32,
}

impl FileSequence {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self::starting_at(pattern, 1)
    }

    pub fn starting_at(pattern: impl Into<String>, initial: u32) -> Self {
        Self {
            pattern: pattern.into(),
            next: initial,
        }
    }

    pub fn file_name(&self, number: u32) -> PathBuf {
        PathBuf::from(self.pattern.replace("{n}", &format!("{:04}", number)))
    }

    pub fn next_sink(&mut self) -> FileSink {
        let sink = FileSink::new(self.file_name(self.next));
        self.next += 1;
        sink
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_array_sink_restarts_on_begin() -> Result<()> {
        let mut sink = ByteArraySink::with_capacity(16);
        sink.begin()?;
        sink.picture_data(b"old")?;
        sink.begin()?;
        sink.picture_data(b"AB")?;
        sink.picture_data(b"C")?;
        sink.end()?;
        assert_eq!(sink.result(), b"ABC");
        Ok(())
    }

    #[test]
    fn file_sink_writes_and_flushes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("still.jpg");
        let mut sink = FileSink::new(&path);
        sink.begin()?;
        sink.picture_data(&[0xFF, 0xD8])?;
        sink.picture_data(&[0xFF, 0xD9])?;
        sink.end()?;
        assert_eq!(sink.result(), path);
        assert_eq!(std::fs::read(&path)?, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        Ok(())
    }

    #[test]
    fn file_sink_rejects_data_before_begin() {
        let mut sink = FileSink::new("never-created.jpg");
        assert!(sink.picture_data(b"x").is_err());
        assert!(sink.end().is_ok());
    }

    #[test]
    fn file_sequence_numbers_consecutively() {
        let mut sequence = FileSequence::starting_at("out/image-{n}.jpg", 7);
        assert_eq!(sequence.next_sink().path(), Path::new("out/image-0007.jpg"));
        assert_eq!(sequence.next_sink().path(), Path::new("out/image-0008.jpg"));
    }

    #[test]
    fn closures_are_video_handlers() {
        let mut seen = Vec::new();
        let mut handler = |data: &[u8], frame_number: u64| {
            seen.push((data.len(), frame_number));
            frame_number < 2
        };
        assert!(handler.frame_ready(b"abc", 1));
        assert!(!handler.frame_ready(b"de", 2));
        assert_eq!(seen, vec![(3, 1), (2, 2)]);
    }
}
