//! Owned packet buffers passed between the stack, the outbound queue and readers.
//!
//! A [`PacketBuffer`] is move-only: whoever holds it owns it, and handing it to
//! the queue hands over ownership. Releasing consumes the buffer, so a packet
//! cannot be read or released twice. Buffers created with a
//! [`PacketAccounting`] handle record every allocation and release, which
//! makes leaks visible.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Allocation/release counters shared by all buffers of one stack
#[derive(Debug, Default)]
pub struct PacketAccounting {
    allocated: AtomicU64,
    released: AtomicU64,
}

impl PacketAccounting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// Buffers allocated but not yet released
    pub fn outstanding(&self) -> u64 {
        self.allocated().saturating_sub(self.released())
    }
}

pub struct PacketBuffer {
    segments: Vec<BytesMut>,
    accounting: Option<Arc<PacketAccounting>>,
}

impl PacketBuffer {
    pub fn new(data: BytesMut) -> Self {
        Self {
            segments: vec![data],
            accounting: None,
        }
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::new(BytesMut::from(data))
    }

    /// Scatter-gather packet; segments are read back in order.
    pub fn from_segments(segments: Vec<BytesMut>) -> Self {
        Self {
            segments,
            accounting: None,
        }
    }

    /// Attach allocation tracking to this buffer.
    pub fn tracked(mut self, accounting: &Arc<PacketAccounting>) -> Self {
        if self.accounting.is_none() {
            accounting.allocated.fetch_add(1, Ordering::AcqRel);
            self.accounting = Some(accounting.clone());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slices(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|s| &s[..])
    }

    /// IP version nibble of the first byte, if any.
    pub fn ip_version(&self) -> Option<u8> {
        self.as_slices()
            .find(|s| !s.is_empty())
            .map(|s| s[0] >> 4)
    }

    /// Copy all segments into `dst`, returning the number of bytes written.
    ///
    /// `dst` must be at least [`len`](Self::len) bytes long.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut n = 0;
        for slice in self.as_slices() {
            dst[n..n + slice.len()].copy_from_slice(slice);
            n += slice.len();
        }
        n
    }

    /// Take the bytes out as one contiguous buffer and release the packet.
    pub fn into_contiguous(mut self) -> BytesMut {
        let mut segments = std::mem::take(&mut self.segments);
        if segments.len() == 1 {
            return segments.pop().unwrap_or_default();
        }
        let mut data = BytesMut::with_capacity(segments.iter().map(|s| s.len()).sum());
        for segment in segments {
            data.put_slice(&segment);
        }
        data
    }

    /// Give up ownership of the packet.
    pub fn release(self) {}
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(accounting) = self.accounting.take() {
            accounting.released.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len())
            .field("segments", &self.segments.len())
            .finish()
    }
}

pub type PacketBufferList = Vec<PacketBuffer>;
