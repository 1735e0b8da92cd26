//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::readiness::Wake;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    parent: Option<Arc<Inner>>,
    wakers: Mutex<Vec<Arc<dyn Wake>>>,
}

impl Inner {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    fn wake_all(&self) {
        let wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        for waker in wakers.iter() {
            if let Err(e) = waker.wake() {
                tracing::warn!(error = %e, "Failed to wake pump");
            }
        }
    }
}

/// A cloneable cancellation signal.
///
/// Clones share state. A child token is cancelled when it or any ancestor is
/// cancelled; cancelling a child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A fresh, uncancelled root token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.wake_all();
        }
    }

    /// True once this token or any ancestor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Create a token that is also cancelled through `self`.
    ///
    /// Wakers attached to the child are attached to every ancestor too, so a
    /// parent cancellation interrupts a pump waiting on the child.
    #[must_use]
    pub fn child_token(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.inner)),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn attach_waker(&self, waker: &Arc<dyn Wake>) {
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            inner
                .wakers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(waker));
            node = inner.parent.as_ref();
        }
        // A cancellation that raced the attach still has to wake.
        if self.is_cancelled() {
            let _ = waker.wake();
        }
    }

    pub(crate) fn detach_waker(&self, waker: &Arc<dyn Wake>) {
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            inner
                .wakers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|w| !Arc::ptr_eq(w, waker));
            node = inner.parent.as_ref();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn child_follows_parent_but_not_reverse() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        let sibling = parent.child_token();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn parent_cancel_wakes_child_waker() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        let counter = Arc::new(CountingWaker::default());
        let waker: Arc<dyn Wake> = counter.clone();

        child.attach_waker(&waker);
        parent.cancel();
        parent.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        child.detach_waker(&waker);
        child.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_after_cancel_wakes_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let counter = Arc::new(CountingWaker::default());
        let waker: Arc<dyn Wake> = counter.clone();
        token.attach_waker(&waker);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
