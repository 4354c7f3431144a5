//! Zero-copy read cursor over one or more byte regions.
//!
//! A [`FrameBuffer`] holds either a single `Bytes` region or a queue of them.
//! Both shapes implement [`bytes::Buf`] identically, so decoders read length
//! prefixes, integers and sub-slices without caring how the frame arrived.
//! Large bodies that were received across several socket reads stay split
//! across regions; nothing is copied until a caller asks for contiguous bytes
//! that straddle a boundary.
//!
//! A buffer may carry a [`CallCleanup`]. [`FrameBuffer::release`] consumes the
//! buffer, so no read can follow a release.
//!
//! # Example
//!
//! ```
//! use bytes::{Buf, Bytes};
//! use rpcwire_server::protocol::FrameBuffer;
//!
//! let mut buf = FrameBuffer::from_regions([
//!     Bytes::from_static(&[0, 0]),
//!     Bytes::from_static(&[0, 5, b'h', b'i']),
//! ]);
//! assert_eq!(buf.peek_u32(), Some(5));
//! assert_eq!(buf.get_u32(), 5);
//! assert_eq!(buf.copy_to_bytes(2), Bytes::from_static(b"hi"));
//! ```

use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::call::CallCleanup;
use crate::error::{Result, RpcwireError};

/// Backing storage for a frame.
#[derive(Clone)]
enum Regions {
    /// One contiguous region (the common case for small control frames).
    Single(Bytes),
    /// Several regions; never contains an empty region.
    Multi {
        regions: VecDeque<Bytes>,
        remaining: usize,
    },
}

/// Readable cursor over 1..N byte regions with an optional one-shot release.
pub struct FrameBuffer {
    regions: Regions,
    release: Option<CallCleanup>,
}

impl FrameBuffer {
    /// Wrap a single region.
    pub fn single(bytes: Bytes) -> Self {
        Self {
            regions: Regions::Single(bytes),
            release: None,
        }
    }

    /// Wrap a sequence of regions.
    ///
    /// Empty regions are dropped; zero or one remaining region collapses to the
    /// single-region form.
    pub fn from_regions<I>(regions: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut queue: VecDeque<Bytes> = regions.into_iter().filter(|r| !r.is_empty()).collect();
        let regions = match queue.len() {
            0 => Regions::Single(Bytes::new()),
            1 => Regions::Single(queue.pop_front().unwrap_or_default()),
            _ => {
                let remaining = queue.iter().map(Bytes::len).sum();
                Regions::Multi {
                    regions: queue,
                    remaining,
                }
            }
        };
        Self {
            regions,
            release: None,
        }
    }

    /// Copy a slice into a new single-region buffer.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::single(Bytes::copy_from_slice(data))
    }

    /// An empty buffer.
    pub fn empty() -> Self {
        Self::single(Bytes::new())
    }

    /// Attach a release to run when this buffer is released or dropped.
    ///
    /// An already attached release is chained, not replaced.
    pub fn with_release(mut self, cleanup: CallCleanup) -> Self {
        self.release = Some(match self.release.take() {
            Some(existing) => existing.and_then(cleanup),
            None => cleanup,
        });
        self
    }

    /// Detach the release so another owner can hold it.
    ///
    /// Returns a no-op cleanup if none was attached.
    pub fn take_release(&mut self) -> CallCleanup {
        self.release.take().unwrap_or_default()
    }

    /// Whether a release is attached.
    #[inline]
    pub fn has_release(&self) -> bool {
        self.release.as_ref().is_some_and(CallCleanup::is_armed)
    }

    /// Release the backing regions. Consumes the buffer.
    pub fn release(mut self) {
        if let Some(cleanup) = self.release.take() {
            cleanup.run();
        }
    }

    /// Number of backing regions still holding unread bytes.
    pub fn region_count(&self) -> usize {
        match &self.regions {
            Regions::Single(b) => usize::from(!b.is_empty()),
            Regions::Multi { regions, .. } => regions.len(),
        }
    }

    /// Whether this buffer spans more than one region.
    #[inline]
    pub fn is_multi_region(&self) -> bool {
        matches!(self.regions, Regions::Multi { .. })
    }

    /// Read a big-endian `u32` without advancing.
    ///
    /// Works across region boundaries. Returns `None` if fewer than 4 bytes
    /// remain.
    pub fn peek_u32(&self) -> Option<u32> {
        if self.remaining() < 4 {
            return None;
        }
        let mut out = [0u8; 4];
        match &self.regions {
            Regions::Single(b) => out.copy_from_slice(&b[..4]),
            Regions::Multi { regions, .. } => {
                let mut filled = 0;
                for region in regions {
                    let take = (4 - filled).min(region.len());
                    out[filled..filled + take].copy_from_slice(&region[..take]);
                    filled += take;
                    if filled == 4 {
                        break;
                    }
                }
            }
        }
        Some(u32::from_be_bytes(out))
    }

    /// Checked big-endian `u32` read for untrusted input.
    pub fn read_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(truncated(4, self.remaining()));
        }
        Ok(self.get_u32())
    }

    /// Split off the first `len` bytes as a new buffer, without copying.
    ///
    /// The returned buffer has no release attached; the release stays with
    /// `self`.
    pub fn split_to(&mut self, len: usize) -> Result<FrameBuffer> {
        if len > self.remaining() {
            return Err(truncated(len, self.remaining()));
        }
        match &mut self.regions {
            Regions::Single(b) => Ok(FrameBuffer::single(b.split_to(len))),
            Regions::Multi { regions, remaining } => {
                let mut taken = Vec::new();
                let mut needed = len;
                while needed > 0 {
                    let Some(front) = regions.front_mut() else {
                        break;
                    };
                    if front.len() <= needed {
                        needed -= front.len();
                        if let Some(region) = regions.pop_front() {
                            taken.push(region);
                        }
                    } else {
                        taken.push(front.split_to(needed));
                        needed = 0;
                    }
                }
                *remaining -= len;
                Ok(FrameBuffer::from_regions(taken))
            }
        }
    }

    /// Checked variant of [`Buf::copy_to_bytes`].
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        if len > self.remaining() {
            return Err(truncated(len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }

    /// Contiguous view of all unread bytes.
    ///
    /// Free for single-region buffers; copies once for multi-region buffers.
    pub fn to_bytes(&self) -> Bytes {
        match &self.regions {
            Regions::Single(b) => b.clone(),
            Regions::Multi { regions, remaining } => {
                let mut out = BytesMut::with_capacity(*remaining);
                for region in regions {
                    out.extend_from_slice(region);
                }
                out.freeze()
            }
        }
    }
}

fn truncated(needed: usize, available: usize) -> RpcwireError {
    RpcwireError::Protocol(format!(
        "Truncated frame: need {} bytes, {} available",
        needed, available
    ))
}

impl Buf for FrameBuffer {
    fn remaining(&self) -> usize {
        match &self.regions {
            Regions::Single(b) => b.len(),
            Regions::Multi { remaining, .. } => *remaining,
        }
    }

    fn chunk(&self) -> &[u8] {
        match &self.regions {
            Regions::Single(b) => b,
            Regions::Multi { regions, .. } => regions.front().map(|b| &b[..]).unwrap_or(&[]),
        }
    }

    fn advance(&mut self, mut cnt: usize) {
        match &mut self.regions {
            Regions::Single(b) => b.advance(cnt),
            Regions::Multi { regions, remaining } => {
                assert!(cnt <= *remaining, "advance past end of FrameBuffer");
                *remaining -= cnt;
                while cnt > 0 {
                    let Some(front) = regions.front_mut() else {
                        break;
                    };
                    if front.len() <= cnt {
                        cnt -= front.len();
                        regions.pop_front();
                    } else {
                        front.advance(cnt);
                        cnt = 0;
                    }
                }
            }
        }
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        match &mut self.regions {
            Regions::Single(b) => b.split_to(len),
            Regions::Multi { regions, remaining } => {
                assert!(len <= *remaining, "copy_to_bytes past end of FrameBuffer");
                // Zero-copy when the range sits inside the front region.
                if let Some(front) = regions.front_mut() {
                    if front.len() >= len {
                        let out = front.split_to(len);
                        if front.is_empty() {
                            regions.pop_front();
                        }
                        *remaining -= len;
                        return out;
                    }
                }
                let mut out = BytesMut::with_capacity(len);
                out.put(Buf::take(&mut *self, len));
                out.freeze()
            }
        }
    }
}

impl From<Bytes> for FrameBuffer {
    fn from(bytes: Bytes) -> Self {
        FrameBuffer::single(bytes)
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("remaining", &self.remaining())
            .field("regions", &self.region_count())
            .field("has_release", &self.has_release())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn single() -> FrameBuffer {
        FrameBuffer::single(Bytes::from_static(b"\x00\x00\x00\x03abcdefgh"))
    }

    fn multi() -> FrameBuffer {
        FrameBuffer::from_regions([
            Bytes::from_static(b"\x00\x00"),
            Bytes::from_static(b"\x00\x03ab"),
            Bytes::from_static(b"cdef"),
            Bytes::from_static(b"gh"),
        ])
    }

    /// Same reads on both shapes must yield the same results.
    fn exercise(mut buf: FrameBuffer) -> (u32, Bytes, Bytes, u8, usize) {
        let peeked = buf.peek_u32().unwrap();
        assert_eq!(peeked, buf.get_u32());
        let head = buf.split_to(3).unwrap().to_bytes();
        let next = buf.copy_to_bytes(2);
        let byte = buf.get_u8();
        (peeked, head, next, byte, buf.remaining())
    }

    #[test]
    fn test_single_and_multi_behave_identically() {
        assert!(!single().is_multi_region());
        assert!(multi().is_multi_region());
        assert_eq!(exercise(single()), exercise(multi()));
    }

    #[test]
    fn test_from_regions_collapses_small_inputs() {
        let buf = FrameBuffer::from_regions([Bytes::new(), Bytes::from_static(b"x"), Bytes::new()]);
        assert!(!buf.is_multi_region());
        assert_eq!(buf.region_count(), 1);

        let empty = FrameBuffer::from_regions(Vec::<Bytes>::new());
        assert_eq!(empty.remaining(), 0);
        assert_eq!(empty.region_count(), 0);
    }

    #[test]
    fn test_copy_to_bytes_within_region_is_zero_copy() {
        let region = Bytes::from_static(b"abcdef");
        let mut buf = FrameBuffer::from_regions([region.clone(), Bytes::from_static(b"gh")]);
        let out = buf.copy_to_bytes(4);
        assert_eq!(out.as_ptr(), region.as_ptr());
        assert_eq!(buf.remaining(), 4);
    }

    #[test]
    fn test_copy_to_bytes_across_regions() {
        let mut buf = multi();
        buf.advance(4);
        let out = buf.copy_to_bytes(5);
        assert_eq!(&out[..], b"abcde");
        assert_eq!(buf.remaining(), 3);
    }

    #[test]
    fn test_peek_u32_across_boundary_does_not_advance() {
        let buf = FrameBuffer::from_regions([
            Bytes::from_static(&[0x01]),
            Bytes::from_static(&[0x02, 0x03]),
            Bytes::from_static(&[0x04, 0xFF]),
        ]);
        assert_eq!(buf.peek_u32(), Some(0x01020304));
        assert_eq!(buf.remaining(), 5);
    }

    #[test]
    fn test_peek_u32_short() {
        let buf = FrameBuffer::copy_from_slice(&[1, 2, 3]);
        assert_eq!(buf.peek_u32(), None);
    }

    #[test]
    fn test_split_to_keeps_remainder() {
        let mut buf = multi();
        let head = buf.split_to(7).unwrap();
        assert!(head.is_multi_region());
        assert_eq!(&head.to_bytes()[..], b"\x00\x00\x00\x03abc");
        assert_eq!(&buf.to_bytes()[..], b"defgh");
    }

    #[test]
    fn test_checked_reads_report_truncation() {
        let mut buf = FrameBuffer::copy_from_slice(&[0, 0]);
        assert!(buf.read_u32().is_err());
        assert!(buf.split_to(3).is_err());
        assert!(buf.read_bytes(5).unwrap_err().to_string().contains("Truncated"));
        assert_eq!(buf.remaining(), 2);
    }

    #[test]
    fn test_release_runs_attached_cleanup_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let buf = single().with_release(CallCleanup::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(buf.has_release());
        buf.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_take_release_moves_ownership() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut buf = multi().with_release(CallCleanup::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let cleanup = buf.take_release();
        assert!(!buf.has_release());
        drop(buf);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        cleanup.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_split_off_piece_does_not_carry_release() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut buf = single().with_release(CallCleanup::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let head = buf.split_to(4).unwrap();
        drop(head);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(buf);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
