//! Encoder output buffers and the pool that recycles them.
//!
//! - `BufferHeader`: fixed-capacity memory plus length/offset/flags metadata.
//!   Move-only, so exactly one owner (pool, port or assembler) holds it at a time.
//! - `MappedBuffer`: RAII lock over a header's memory; dropping it unlocks.
//! - `BufferPool`: fixed set of headers sized from the negotiated port format.
//!
//! The number of headers in circulation never changes after the pool is built.
//! A header taken by the hardware must come back through `BufferPool::release`,
//! otherwise the encoder starves.

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;

use crate::error::CaptureError;
use crate::port::OutputPort;

// ----------------------------------------------------------------------------
// BufferFlags
// ----------------------------------------------------------------------------

/// Boundary and error flags reported by the encoder on each buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const FRAME_END: BufferFlags = BufferFlags(1 << 2);
    pub const TRANSMISSION_FAILED: BufferFlags = BufferFlags(1 << 10);

    pub const fn empty() -> Self {
        BufferFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        BufferFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if any of the bits in `other` are set.
    pub const fn intersects(self, other: BufferFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_frame_end(self) -> bool {
        self.contains(BufferFlags::FRAME_END)
    }

    pub fn is_transmission_failed(self) -> bool {
        self.contains(BufferFlags::TRANSMISSION_FAILED)
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

// ----------------------------------------------------------------------------
// BufferHeader
// ----------------------------------------------------------------------------

/// One pooled buffer. No `Clone`: ownership moves between pool, port and callback.
#[derive(Debug)]
pub struct BufferHeader {
    id: usize,
    data: Box<[u8]>,
    length: usize,
    offset: usize,
    flags: BufferFlags,
    locked: bool,
}

impl BufferHeader {
    fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            length: 0,
            offset: 0,
            flags: BufferFlags::empty(),
            locked: false,
        }
    }

    /// Slot index inside the owning pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Producer side: write `payload` at the start of the region and tag it.
    pub fn fill(&mut self, payload: &[u8], flags: BufferFlags) -> Result<()> {
        if payload.len() > self.data.len() {
            bail!(
                "payload of {} bytes exceeds buffer capacity {}",
                payload.len(),
                self.data.len()
            );
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.offset = 0;
        self.length = payload.len();
        self.flags = flags;
        Ok(())
    }

    /// Producer side: overwrite the reported data window without touching memory.
    ///
    /// Values are taken as the hardware reports them and are only checked when
    /// the region is read through `MappedBuffer::payload`.
    pub fn set_region(&mut self, offset: usize, length: usize) {
        self.offset = offset;
        self.length = length;
    }

    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.flags = flags;
    }

    /// Lock the buffer memory for reading. Unlocked when the guard drops.
    pub fn lock(&mut self) -> MappedBuffer<'_> {
        self.locked = true;
        MappedBuffer { header: self }
    }

    fn reset(&mut self) {
        self.length = 0;
        self.offset = 0;
        self.flags = BufferFlags::empty();
        self.locked = false;
    }
}

/// Locked view of a buffer's memory.
pub struct MappedBuffer<'a> {
    header: &'a mut BufferHeader,
}

impl MappedBuffer<'_> {
    pub fn length(&self) -> usize {
        self.header.length
    }

    pub fn flags(&self) -> BufferFlags {
        self.header.flags
    }

    /// The valid data window, `length` bytes starting at `offset`.
    pub fn payload(&self) -> Result<&[u8]> {
        let start = self.header.offset;
        let end = start
            .checked_add(self.header.length)
            .ok_or_else(|| anyhow!("buffer {} window overflows", self.header.id))?;
        self.header.data.get(start..end).ok_or_else(|| {
            anyhow!(
                "buffer {} window {}..{} is outside capacity {}",
                self.header.id,
                start,
                end,
                self.header.data.len()
            )
        })
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        self.header.locked = false;
    }
}

// ----------------------------------------------------------------------------
// BufferPool
// ----------------------------------------------------------------------------

/// Fixed-size queue of reusable buffers.
///
/// Cloning shares the same queue. The pool holds no frame data of its own.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue_tx: Sender<BufferHeader>,
    queue_rx: Receiver<BufferHeader>,
    buffer_num: usize,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_num: usize, buffer_size: usize) -> Result<Self> {
        if buffer_num == 0 || buffer_size == 0 {
            bail!(
                "buffer pool needs at least one non-empty buffer (num={}, size={})",
                buffer_num,
                buffer_size
            );
        }
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(buffer_num);
        for id in 0..buffer_num {
            queue_tx
                .try_send(BufferHeader::new(id, buffer_size))
                .map_err(|_| anyhow!("failed to queue buffer {}", id))?;
        }
        log::debug!(
            "BufferPool: created {} buffers of {} bytes",
            buffer_num,
            buffer_size
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                queue_tx,
                queue_rx,
                buffer_num,
                buffer_size,
            }),
        })
    }

    /// Take a buffer without blocking. `None` means every buffer is out.
    pub fn acquire(&self) -> Option<BufferHeader> {
        self.inner.queue_rx.try_recv().ok()
    }

    /// Return a buffer to circulation, clearing its metadata.
    pub fn release(&self, mut buffer: BufferHeader) {
        buffer.reset();
        if let Err(TrySendError::Full(buffer) | TrySendError::Disconnected(buffer)) =
            self.inner.queue_tx.try_send(buffer)
        {
            log::error!(
                "BufferPool: dropped buffer {} released into a full pool",
                buffer.id
            );
        }
    }

    /// Hand a buffer to `port` for writing. A rejected buffer goes back to the pool.
    pub fn submit(&self, buffer: BufferHeader, port: &dyn OutputPort) -> Result<()> {
        port.send_buffer(buffer).map_err(|rejected| {
            let id = rejected.buffer.id;
            self.release(rejected.buffer);
            anyhow!(
                "port {} rejected buffer {}: {}",
                port.name(),
                id,
                rejected.reason
            )
        })
    }

    /// Acquire a fresh buffer and submit it to `port`.
    pub fn send_next(&self, port: &dyn OutputPort) -> Result<(), CaptureError> {
        let buffer = self.acquire().ok_or(CaptureError::PoolExhausted)?;
        log::trace!("BufferPool: sending buffer {} to {}", buffer.id, port.name());
        self.submit(buffer, port)
            .map_err(|err| CaptureError::Faulted(err.to_string()))
    }

    /// Buffers currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.inner.queue_rx.len()
    }

    /// Total buffers in circulation.
    pub fn buffer_num(&self) -> usize {
        self.inner.buffer_num
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_num", &self.inner.buffer_num)
            .field("buffer_size", &self.inner.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_each_buffer_once() -> Result<()> {
        let pool = BufferPool::new(3, 16)?;
        let a = pool.acquire().expect("first");
        let b = pool.acquire().expect("second");
        let c = pool.acquire().expect("third");
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        let mut ids = vec![a.id(), b.id(), c.id()];
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.available(), pool.buffer_num());
        Ok(())
    }

    #[test]
    fn release_clears_metadata() -> Result<()> {
        let pool = BufferPool::new(1, 8)?;
        let mut buffer = pool.acquire().expect("buffer");
        buffer.fill(b"abc", BufferFlags::FRAME_END)?;
        pool.release(buffer);

        let buffer = pool.acquire().expect("buffer again");
        assert_eq!(buffer.length(), 0);
        assert_eq!(buffer.offset(), 0);
        assert_eq!(buffer.flags(), BufferFlags::empty());
        Ok(())
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(BufferPool::new(0, 1024).is_err());
        assert!(BufferPool::new(4, 0).is_err());
    }

    #[test]
    fn fill_rejects_oversized_payload() -> Result<()> {
        let pool = BufferPool::new(1, 4)?;
        let mut buffer = pool.acquire().expect("buffer");
        assert!(buffer.fill(b"too long", BufferFlags::empty()).is_err());
        Ok(())
    }

    #[test]
    fn mapped_buffer_unlocks_on_drop() -> Result<()> {
        let pool = BufferPool::new(1, 8)?;
        let mut buffer = pool.acquire().expect("buffer");
        buffer.fill(b"data", BufferFlags::empty())?;
        {
            let mapped = buffer.lock();
            assert_eq!(mapped.payload()?, b"data");
        }
        assert!(!buffer.is_locked());
        Ok(())
    }

    #[test]
    fn payload_outside_capacity_is_an_error() -> Result<()> {
        let pool = BufferPool::new(1, 8)?;
        let mut buffer = pool.acquire().expect("buffer");
        buffer.set_region(6, 4);
        let mapped = buffer.lock();
        assert!(mapped.payload().is_err());
        Ok(())
    }

    #[test]
    fn flags_combine_and_test() {
        let flags = BufferFlags::FRAME_END | BufferFlags::TRANSMISSION_FAILED;
        assert!(flags.is_frame_end());
        assert!(flags.is_transmission_failed());
        let unrelated = BufferFlags::from_bits(1);
        assert!(flags.intersects(BufferFlags::FRAME_END | unrelated));
        assert!(!flags.contains(BufferFlags::FRAME_END | unrelated));
        assert_eq!(BufferFlags::from_bits(flags.bits()), flags);
    }
}
