//! Cooperative cancellation token handed to units of work.

use tokio_util::sync::CancellationToken;

use crate::error::Canceled;

/// Read side of a cancellation signal.
///
/// Work that receives a `CancelChecker` is expected to poll it at convenient
/// points and exit promptly (typically by returning [`Canceled`]) once it
/// reports canceled. Nothing is ever interrupted preemptively.
#[derive(Debug, Clone, Default)]
pub struct CancelChecker {
    token: CancellationToken,
}

impl CancelChecker {
    /// Creates a checker that is not canceled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `Err(Canceled)` once cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`Canceled`] if this checker (or a parent it was derived from)
    /// was canceled.
    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    /// Derives a checker that is canceled when this one is, and which can also
    /// be canceled on its own without affecting this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Requests cancellation. Idempotent.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

/// Owning side of a [`CancelChecker`]: the only handle able to cancel it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    checker: CancelChecker,
}

impl CancelHandle {
    /// Creates a fresh, non-canceled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a checker observing this handle.
    #[must_use]
    pub fn checker(&self) -> CancelChecker {
        self.checker.clone()
    }

    /// Requests cancellation of every checker derived from this handle.
    pub fn cancel(&self) {
        self.checker.cancel();
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.checker.is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_cancels_its_checkers() {
        let handle = CancelHandle::new();
        let checker = handle.checker();
        assert!(!checker.is_canceled());
        assert!(checker.check().is_ok());

        handle.cancel();
        assert!(checker.is_canceled());
        assert_eq!(checker.check(), Err(Canceled));
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = CancelHandle::new();
        let child = parent.checker().child();
        let grandchild = child.child();

        grandchild.cancel();
        assert!(grandchild.is_canceled());
        assert!(!child.is_canceled());
        assert!(!parent.is_canceled());

        parent.cancel();
        assert!(child.is_canceled());
    }
}
