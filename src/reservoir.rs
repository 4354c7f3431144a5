//! Shared byte budget for large inbound payloads.
//!
//! The reservoir is shared across every connection of a server. Read loops
//! reserve budget for large frame bodies before handing them to the engine;
//! the lease rides along as the frame's release and comes back when the
//! in-flight call that owns the buffer is dropped. Small frames are never
//! pooled.
//!
//! Accounting is lock-free: one `AtomicUsize` of bytes in use, updated with a
//! compare-exchange loop so the capacity is never overshot.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Buf;
use serde::Deserialize;

use crate::call::CallCleanup;
use crate::protocol::FrameBuffer;

/// Default reservoir capacity (1 GB).
pub const DEFAULT_CAPACITY_BYTES: usize = 1024 * 1024 * 1024;

/// Default minimum frame size worth pooling (1 MB).
pub const DEFAULT_MIN_POOLED_SIZE: usize = 1024 * 1024;

/// Reservoir configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReservoirConfig {
    /// Total bytes that may be leased at once.
    pub capacity_bytes: usize,
    /// Frames smaller than this are not accounted.
    pub min_pooled_size: usize,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            min_pooled_size: DEFAULT_MIN_POOLED_SIZE,
        }
    }
}

#[derive(Debug)]
struct Inner {
    used: AtomicUsize,
    config: ReservoirConfig,
}

/// Cloneable handle to a shared byte budget.
#[derive(Clone)]
pub struct Reservoir {
    inner: Arc<Inner>,
}

impl Reservoir {
    /// Create a reservoir.
    pub fn new(config: ReservoirConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                used: AtomicUsize::new(0),
                config,
            }),
        }
    }

    /// Bytes currently leased.
    #[inline]
    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Bytes still available.
    #[inline]
    pub fn available(&self) -> usize {
        self.inner.config.capacity_bytes.saturating_sub(self.used())
    }

    pub fn config(&self) -> &ReservoirConfig {
        &self.inner.config
    }

    /// Whether a buffer of `len` bytes is large enough to pool.
    #[inline]
    pub fn should_pool(&self, len: usize) -> bool {
        len >= self.inner.config.min_pooled_size
    }

    /// Reserve `len` bytes. Returns `None` if that would exceed capacity.
    pub fn try_reserve(&self, len: usize) -> Option<ReservoirLease> {
        let capacity = self.inner.config.capacity_bytes;
        let mut current = self.inner.used.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(len).filter(|n| *n <= capacity)?;
            match self.inner.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ReservoirLease {
                        inner: self.inner.clone(),
                        len,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Account a large inbound unit against the budget.
    ///
    /// Small units, and units that do not fit, are returned untouched.
    pub fn attach(&self, unit: FrameBuffer) -> FrameBuffer {
        let len = unit.remaining();
        if !self.should_pool(len) {
            return unit;
        }
        match self.try_reserve(len) {
            Some(lease) => unit.with_release(lease.into_cleanup()),
            None => {
                tracing::debug!(
                    len,
                    used = self.used(),
                    "reservoir exhausted, frame not pooled"
                );
                unit
            }
        }
    }
}

impl Default for Reservoir {
    fn default() -> Self {
        Self::new(ReservoirConfig::default())
    }
}

impl fmt::Debug for Reservoir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservoir")
            .field("used", &self.used())
            .field("capacity", &self.inner.config.capacity_bytes)
            .finish()
    }
}

/// Bytes held against a [`Reservoir`]; given back on drop.
#[derive(Debug)]
pub struct ReservoirLease {
    inner: Arc<Inner>,
    len: usize,
}

impl ReservoirLease {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Turn the lease into a cleanup that gives the bytes back.
    pub fn into_cleanup(self) -> CallCleanup {
        CallCleanup::new(move || drop(self))
    }
}

impl Drop for ReservoirLease {
    fn drop(&mut self) {
        self.inner.used.fetch_sub(self.len, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn small() -> Reservoir {
        Reservoir::new(ReservoirConfig {
            capacity_bytes: 100,
            min_pooled_size: 10,
        })
    }

    #[test]
    fn test_reserve_and_release() {
        let reservoir = small();
        let lease = reservoir.try_reserve(60).unwrap();
        assert_eq!(reservoir.used(), 60);
        assert_eq!(reservoir.available(), 40);
        drop(lease);
        assert_eq!(reservoir.used(), 0);
    }

    #[test]
    fn test_reserve_over_capacity_fails() {
        let reservoir = small();
        let _a = reservoir.try_reserve(60).unwrap();
        assert!(reservoir.try_reserve(41).is_none());
        assert!(reservoir.try_reserve(40).is_some());
    }

    #[test]
    fn test_attach_skips_small_units() {
        let reservoir = small();
        let unit = reservoir.attach(FrameBuffer::copy_from_slice(b"tiny"));
        assert!(!unit.has_release());
        assert_eq!(reservoir.used(), 0);
    }

    #[test]
    fn test_attach_large_unit_until_released() {
        let reservoir = small();
        let unit = reservoir.attach(FrameBuffer::single(Bytes::from(vec![0u8; 50])));
        assert!(unit.has_release());
        assert_eq!(reservoir.used(), 50);

        unit.release();
        assert_eq!(reservoir.used(), 0);
    }

    #[test]
    fn test_attach_when_exhausted_passes_through() {
        let reservoir = small();
        let _hold = reservoir.try_reserve(90).unwrap();
        let unit = reservoir.attach(FrameBuffer::single(Bytes::from(vec![0u8; 50])));
        assert!(!unit.has_release());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: ReservoirConfig = serde_json::from_str(r#"{"capacity_bytes": 4096}"#).unwrap();
        assert_eq!(config.capacity_bytes, 4096);
        assert_eq!(config.min_pooled_size, DEFAULT_MIN_POOLED_SIZE);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_capacity() {
        let reservoir = Reservoir::new(ReservoirConfig {
            capacity_bytes: 1000,
            min_pooled_size: 1,
        });
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = reservoir.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..100 {
                        if let Some(lease) = r.try_reserve(7) {
                            assert!(r.used() <= 1000);
                            held.push(lease);
                        }
                    }
                    held
                })
            })
            .collect();
        let leases: Vec<ReservoirLease> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(leases.len() * 7, reservoir.used());
        assert!(reservoir.used() <= 1000);
        drop(leases);
        assert_eq!(reservoir.used(), 0);
    }
}
