//! Still frame assembler.
//!
//! Forwards the encoder output for one still capture to the armed sink and
//! signals the waiting caller exactly once when the frame boundary arrives.
//!
//! `frame_started` tracks whether the frame currently flowing out of the
//! encoder is clean for the armed sink, i.e. no byte of it has been dropped.
//! It becomes false as soon as data arrives with nobody armed, and true again
//! at the next frame boundary. A session armed mid-frame therefore waits for
//! the following frame instead of receiving a truncated tail.

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::recycle;
use crate::buffer::{BufferFlags, BufferHeader, BufferPool};
use crate::error::CaptureError;
use crate::port::{BufferCallback, OutputPort};
use crate::sink::{FrameSink, PictureSink};

/// How an armed still session ended, as observed on the callback thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Complete,
    TransmissionFailed,
    Faulted(String),
    PoolExhausted,
}

impl FrameOutcome {
    pub fn into_result(self) -> Result<(), CaptureError> {
        match self {
            FrameOutcome::Complete => Ok(()),
            FrameOutcome::TransmissionFailed => Err(CaptureError::TransmissionFailed),
            FrameOutcome::Faulted(reason) => Err(CaptureError::Faulted(reason)),
            FrameOutcome::PoolExhausted => Err(CaptureError::PoolExhausted),
        }
    }
}

struct ArmedSession {
    sink: Arc<Mutex<dyn FrameSink>>,
    done_tx: Sender<FrameOutcome>,
    finished: AtomicBool,
}

impl ArmedSession {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Publish the outcome. Only the first call has any effect.
    fn signal(&self, outcome: FrameOutcome) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("StillFrameAssembler: signal capture complete ({:?})", outcome);
        // Single-slot channel, never full on the first send.
        let _ = self.done_tx.try_send(outcome);
    }

    fn forward(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        // Disarmed while this buffer was in flight; the caller may already have ended the sink.
        if self.is_finished() {
            return Ok(());
        }
        match catch_unwind(AssertUnwindSafe(|| sink.write_frame_data(data))) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("picture sink panicked")),
        }
    }
}

/// Buffer callback for the still-capture pipeline.
pub struct StillFrameAssembler {
    pool: BufferPool,
    frame_started: AtomicBool,
    armed: ArcSwapOption<ArmedSession>,
}

impl StillFrameAssembler {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            frame_started: AtomicBool::new(true),
            armed: ArcSwapOption::empty(),
        }
    }

    /// Route the next clean frame to `sink`.
    ///
    /// The returned receiver yields exactly one `FrameOutcome` for this session.
    /// Arming replaces any previous session.
    pub fn arm<S>(&self, sink: Arc<Mutex<S>>) -> Receiver<FrameOutcome>
    where
        S: PictureSink + 'static,
    {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let sink: Arc<Mutex<dyn FrameSink>> = sink;
        self.armed.store(Some(Arc::new(ArmedSession {
            sink,
            done_tx,
            finished: AtomicBool::new(false),
        })));
        log::debug!("StillFrameAssembler: armed");
        done_rx
    }

    /// Stop routing data. Buffers arriving afterwards are discarded.
    pub fn disarm(&self) {
        if let Some(session) = self.armed.swap(None) {
            session.finished.store(true, Ordering::Release);
        }
        log::debug!("StillFrameAssembler: disarmed");
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load().is_some()
    }

    /// Read one buffer and decide whether it finishes the armed session.
    fn consume(
        &self,
        buffer: &mut BufferHeader,
        session: Option<&ArmedSession>,
    ) -> Option<FrameOutcome> {
        let mapped = buffer.lock();
        let length = mapped.length();
        let flags = mapped.flags();
        log::trace!("StillFrameAssembler: length={} flags={:#x}", length, flags.bits());

        let boundary = flags.intersects(BufferFlags::FRAME_END | BufferFlags::TRANSMISSION_FAILED);

        if length > 0 {
            let data = match mapped.payload() {
                Ok(data) => data,
                Err(err) => {
                    log::error!("StillFrameAssembler: error reading picture data: {:#}", err);
                    self.frame_started.store(boundary, Ordering::SeqCst);
                    return Some(FrameOutcome::Faulted(err.to_string()));
                }
            };
            if self.frame_started.load(Ordering::SeqCst) {
                match session {
                    Some(session) => {
                        if let Err(err) = session.forward(data) {
                            log::error!("StillFrameAssembler: picture sink failed: {:#}", err);
                            self.frame_started.store(boundary, Ordering::SeqCst);
                            return Some(FrameOutcome::Faulted(err.to_string()));
                        }
                    }
                    None => self.frame_started.store(false, Ordering::SeqCst),
                }
            }
        }

        if !boundary {
            return None;
        }

        let was_started = self.frame_started.swap(true, Ordering::SeqCst);
        match session {
            Some(_) if was_started => {
                if flags.is_transmission_failed() {
                    log::warn!("StillFrameAssembler: buffer transmission failed");
                    Some(FrameOutcome::TransmissionFailed)
                } else {
                    log::info!("StillFrameAssembler: frame complete");
                    Some(FrameOutcome::Complete)
                }
            }
            Some(_) => {
                log::trace!("StillFrameAssembler: skipped partial frame, next frame is clean");
                None
            }
            None => None,
        }
    }
}

impl BufferCallback for StillFrameAssembler {
    fn on_buffer(&self, port: &dyn OutputPort, mut buffer: BufferHeader) {
        let session = self.armed.load_full().filter(|session| !session.is_finished());

        let mut outcome = self.consume(&mut buffer, session.as_deref());

        if let Err(err) = recycle(&self.pool, port, buffer) {
            log::error!("StillFrameAssembler: failed to recycle buffer: {}", err);
            outcome = Some(match err {
                CaptureError::PoolExhausted => FrameOutcome::PoolExhausted,
                other => FrameOutcome::Faulted(other.to_string()),
            });
        }

        if let (Some(outcome), Some(session)) = (outcome, session) {
            session.signal(outcome);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::test_support::RecordingPort;
    use crate::sink::ByteArraySink;
    use anyhow::Result;
    use crossbeam_channel::TryRecvError;

    const END: BufferFlags = BufferFlags::FRAME_END;
    const NONE: BufferFlags = BufferFlags::empty();

    fn setup(buffers: usize) -> Result<(BufferPool, RecordingPort, StillFrameAssembler)> {
        let pool = BufferPool::new(buffers, 32)?;
        let port = RecordingPort::new();
        port.prime(&pool);
        let assembler = StillFrameAssembler::new(pool.clone());
        Ok((pool, port, assembler))
    }

    fn armed_sink(assembler: &StillFrameAssembler) -> (Arc<Mutex<ByteArraySink>>, Receiver<FrameOutcome>) {
        let sink = Arc::new(Mutex::new(ByteArraySink::new()));
        let done = assembler.arm(sink.clone());
        (sink, done)
    }

    fn bytes(sink: &Arc<Mutex<ByteArraySink>>) -> Vec<u8> {
        sink.lock().unwrap().result()
    }

    #[test]
    fn concatenates_payloads_and_signals_once() -> Result<()> {
        let (_pool, port, assembler) = setup(3)?;
        let (sink, done) = armed_sink(&assembler);

        port.deliver(&assembler, b"ABC", NONE)?;
        assert_eq!(done.try_recv(), Err(TryRecvError::Empty));
        port.deliver(&assembler, b"DE", END)?;

        assert_eq!(done.try_recv(), Ok(FrameOutcome::Complete));
        assert_eq!(bytes(&sink), b"ABCDE");

        // A second frame before disarm is neither forwarded nor signalled.
        port.deliver(&assembler, b"XYZ", END)?;
        assert_eq!(done.try_recv(), Err(TryRecvError::Empty));
        assert!(bytes(&sink).is_empty());
        Ok(())
    }

    #[test]
    fn transmission_failure_without_data_fails_session() -> Result<()> {
        let (_pool, port, assembler) = setup(2)?;
        let (sink, done) = armed_sink(&assembler);

        port.deliver(&assembler, b"", END | BufferFlags::TRANSMISSION_FAILED)?;

        assert_eq!(done.try_recv(), Ok(FrameOutcome::TransmissionFailed));
        assert!(bytes(&sink).is_empty());
        Ok(())
    }

    #[test]
    fn session_armed_mid_frame_waits_for_next_frame() -> Result<()> {
        let (_pool, port, assembler) = setup(3)?;

        port.deliver(&assembler, b"old-head", NONE)?;
        let (sink, done) = armed_sink(&assembler);
        port.deliver(&assembler, b"old-tail", END)?;
        assert_eq!(done.try_recv(), Err(TryRecvError::Empty));

        port.deliver(&assembler, b"new-", NONE)?;
        port.deliver(&assembler, b"frame", END)?;

        assert_eq!(done.try_recv(), Ok(FrameOutcome::Complete));
        assert_eq!(bytes(&sink), b"new-frame");
        Ok(())
    }

    #[test]
    fn session_armed_between_frames_gets_next_full_frame() -> Result<()> {
        let (_pool, port, assembler) = setup(3)?;

        // Frame with nobody armed.
        port.deliver(&assembler, b"ignored", NONE)?;
        port.deliver(&assembler, b"ignored", END)?;

        let (sink, done) = armed_sink(&assembler);
        port.deliver(&assembler, b"full", NONE)?;
        port.deliver(&assembler, b"frame", END)?;

        assert_eq!(done.try_recv(), Ok(FrameOutcome::Complete));
        assert_eq!(bytes(&sink), b"fullframe");
        Ok(())
    }

    #[test]
    fn consecutive_sessions_each_get_their_frame() -> Result<()> {
        let (_pool, port, assembler) = setup(2)?;
        for round in 0..5u8 {
            let (sink, done) = armed_sink(&assembler);
            port.deliver(&assembler, &[round, round], NONE)?;
            port.deliver(&assembler, &[round], END)?;
            assert_eq!(done.try_recv(), Ok(FrameOutcome::Complete));
            assert_eq!(bytes(&sink), vec![round, round, round]);
            assembler.disarm();
        }
        Ok(())
    }

    #[test]
    fn copy_error_finishes_session_and_recycles() -> Result<()> {
        let (pool, port, assembler) = setup(2)?;
        let (_sink, done) = armed_sink(&assembler);

        port.deliver_corrupt(&assembler, NONE)?;

        assert!(matches!(done.try_recv(), Ok(FrameOutcome::Faulted(_))));
        assert_eq!(port.held() + pool.available(), pool.buffer_num());
        assert_eq!(port.held(), 2);
        Ok(())
    }

    #[test]
    fn failing_sink_finishes_session() -> Result<()> {
        struct RefusingSink;
        impl PictureSink for RefusingSink {
            type Output = ();
            fn picture_data(&mut self, _data: &[u8]) -> Result<()> {
                anyhow::bail!("disk full")
            }
            fn result(&mut self) {}
        }

        let (_pool, port, assembler) = setup(2)?;
        let done = assembler.arm(Arc::new(Mutex::new(RefusingSink)));
        port.deliver(&assembler, b"data", NONE)?;

        match done.try_recv() {
            Ok(FrameOutcome::Faulted(reason)) => assert!(reason.contains("disk full")),
            other => panic!("unexpected outcome {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn unarmed_data_is_discarded_but_buffers_keep_flowing() -> Result<()> {
        let (pool, port, assembler) = setup(3)?;
        for _ in 0..20 {
            port.deliver(&assembler, b"noise", NONE)?;
            port.deliver(&assembler, b"noise", END)?;
        }
        assert_eq!(port.held(), pool.buffer_num());
        assert_eq!(pool.available(), 0);
        Ok(())
    }

    #[test]
    fn disabled_port_gets_no_replacement() -> Result<()> {
        let (pool, port, assembler) = setup(2)?;
        port.set_enabled(false);
        port.deliver(&assembler, b"last", END)?;
        assert_eq!(port.held(), 1);
        assert_eq!(pool.available(), 1);
        Ok(())
    }

    #[test]
    fn data_in_flight_at_disarm_is_not_forwarded() -> Result<()> {
        let (_pool, _port, assembler) = setup(2)?;
        let (sink, _done) = armed_sink(&assembler);
        let session = assembler.armed.load_full().expect("armed session");

        assembler.disarm();
        session.forward(b"late")?;

        assert!(bytes(&sink).is_empty());
        Ok(())
    }

    #[test]
    fn rejected_resubmit_faults_session_without_losing_buffer() -> Result<()> {
        let (pool, port, assembler) = setup(2)?;
        let (_sink, done) = armed_sink(&assembler);
        port.set_reject(true);

        port.deliver(&assembler, b"data", NONE)?;

        assert!(matches!(done.try_recv(), Ok(FrameOutcome::Faulted(_))));
        assert_eq!(port.held() + pool.available(), pool.buffer_num());
        Ok(())
    }
}
