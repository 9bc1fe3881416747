//! Capture outcomes surfaced to application code.
//!
//! Everything that goes wrong on the hardware callback thread is converted
//! into one of these variants before it reaches the caller. Nothing raised in
//! the callback context is allowed to unwind out of it.

use std::time::Duration;

/// Why a capture request did not produce a picture or a video session ended early.
#[derive(Debug)]
pub enum CaptureError {
    /// Another capture currently holds the admission gate.
    Busy,
    /// The operation does not match the mode the pipeline was built in.
    WrongMode(&'static str),
    /// The picture sink failed to begin; hardware was never triggered.
    BeginFailed(anyhow::Error),
    /// The capture-start parameter was rejected by the capture port.
    TriggerFailed(anyhow::Error),
    /// No frame boundary arrived before the still-capture deadline.
    Timeout(Duration),
    /// No new video frame was published within the staleness window.
    Stalled(Duration),
    /// The encoder flagged a buffer transmission failure mid-frame.
    TransmissionFailed,
    /// The assembler hit an error while copying or forwarding frame data.
    Faulted(String),
    /// The buffer pool had nothing to resubmit to the encoder port.
    PoolExhausted,
    /// Building or priming the pipeline failed.
    Setup(anyhow::Error),
}

impl CaptureError {
    /// Stable machine-readable identifier for logs and exit codes.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::Busy => "CAPTURE_BUSY",
            CaptureError::WrongMode(_) => "CAPTURE_WRONG_MODE",
            CaptureError::BeginFailed(_) => "CAPTURE_BEGIN_FAILED",
            CaptureError::TriggerFailed(_) => "CAPTURE_TRIGGER_FAILED",
            CaptureError::Timeout(_) => "CAPTURE_TIMEOUT",
            CaptureError::Stalled(_) => "CAPTURE_STALLED",
            CaptureError::TransmissionFailed => "CAPTURE_TRANSMISSION_FAILED",
            CaptureError::Faulted(_) => "CAPTURE_FAULTED",
            CaptureError::PoolExhausted => "CAPTURE_POOL_EXHAUSTED",
            CaptureError::Setup(_) => "CAPTURE_SETUP",
        }
    }

    /// Whether the camera instance must be closed and rebuilt before the next capture.
    ///
    /// Rejections that never touched the pipeline leave it usable; every other
    /// failure means the hardware may be wedged and no recovery is attempted.
    pub fn requires_reopen(&self) -> bool {
        !matches!(
            self,
            CaptureError::Busy | CaptureError::WrongMode(_) | CaptureError::BeginFailed(_)
        )
    }
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Busy => write!(f, "camera is already processing a capture"),
            CaptureError::WrongMode(reason) => write!(f, "{}", reason),
            CaptureError::BeginFailed(err) => {
                write!(f, "picture capture handler failed to begin: {}", err)
            }
            CaptureError::TriggerFailed(err) => write!(f, "failed to start capture: {}", err),
            CaptureError::Timeout(timeout) => {
                write!(f, "capture did not complete within {:?}", timeout)
            }
            CaptureError::Stalled(window) => {
                write!(f, "failed to obtain next frame within {:?}", window)
            }
            CaptureError::TransmissionFailed => write!(f, "encoder buffer transmission failed"),
            CaptureError::Faulted(reason) => write!(f, "error handling picture data: {}", reason),
            CaptureError::PoolExhausted => {
                write!(f, "failed to get next buffer from picture pool")
            }
            CaptureError::Setup(err) => write!(f, "pipeline setup failed: {}", err),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::BeginFailed(err)
            | CaptureError::TriggerFailed(err)
            | CaptureError::Setup(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_begin_failures_leave_pipeline_usable() {
        assert!(!CaptureError::Busy.requires_reopen());
        assert!(!CaptureError::BeginFailed(anyhow::anyhow!("disk full")).requires_reopen());
        assert!(CaptureError::Timeout(Duration::from_millis(5)).requires_reopen());
        assert!(CaptureError::TransmissionFailed.requires_reopen());
    }

    #[test]
    fn source_chains_through_wrapped_errors() {
        let err = CaptureError::Setup(anyhow::anyhow!("enable encoder output port"));
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "enable encoder output port");
        assert_eq!(err.code(), "CAPTURE_SETUP");
    }
}
