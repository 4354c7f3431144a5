//! Single-use release token for inbound buffers.
//!
//! A [`CallCleanup`] guards whatever backs one inbound unit: a reservoir lease,
//! a transport-owned region, a test counter. It runs exactly once: either when
//! its owner calls [`CallCleanup::run`] or when it is dropped. Moving it is how
//! ownership of the release passes from the engine to an in-flight call.

use std::fmt;

use crate::error::Result;

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Owned release token. Runs its release at most once.
pub struct CallCleanup {
    release: Option<ReleaseFn>,
}

impl CallCleanup {
    /// Create a cleanup from an infallible release.
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(move || {
                release();
                Ok(())
            })),
        }
    }

    /// Create a cleanup whose release can fail.
    ///
    /// Failures are logged, never propagated.
    pub fn fallible<F>(release: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A cleanup with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Combine two cleanups into one that releases both.
    pub fn and_then(mut self, mut next: CallCleanup) -> Self {
        match (self.release.take(), next.release.take()) {
            (None, None) => Self::noop(),
            (Some(first), None) => Self {
                release: Some(first),
            },
            (None, Some(second)) => Self {
                release: Some(second),
            },
            (Some(first), Some(second)) => Self {
                release: Some(Box::new(move || {
                    let a = first();
                    let b = second();
                    a.and(b)
                })),
            },
        }
    }

    /// Whether a release is still pending.
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.release.is_some()
    }

    /// Run the release now.
    pub fn run(mut self) {
        self.release_now();
    }

    /// Drop the token without releasing.
    ///
    /// Only for owners that hand the underlying resource to someone else who
    /// will free it by other means.
    pub fn disarm(mut self) {
        self.release = None;
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            if let Err(e) = release() {
                tracing::warn!(error = %e, "buffer release failed");
            }
        }
    }
}

impl Drop for CallCleanup {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl Default for CallCleanup {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for CallCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCleanup")
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcwireError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting() -> (CallCleanup, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cleanup = CallCleanup::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (cleanup, count)
    }

    #[test]
    fn test_run_releases_once() {
        let (cleanup, count) = counting();
        assert!(cleanup.is_armed());
        cleanup.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let (cleanup, count) = counting();
        drop(cleanup);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarm_skips_release() {
        let (cleanup, count) = counting();
        cleanup.disarm();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_moved_cleanup_releases_in_new_owner() {
        let (cleanup, count) = counting();
        let holder = vec![cleanup];
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(holder);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fallible_release_error_is_swallowed_after_logging() {
        let cleanup =
            CallCleanup::fallible(|| Err(RpcwireError::Protocol("pool gone".to_string())));
        cleanup.run();
    }

    #[test]
    fn test_and_then_releases_both() {
        let (a, count_a) = counting();
        let (b, count_b) = counting();
        a.and_then(b).run();
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noop_is_not_armed() {
        let cleanup = CallCleanup::noop();
        assert!(!cleanup.is_armed());
        assert!(!CallCleanup::noop().and_then(CallCleanup::noop()).is_armed());
    }
}
