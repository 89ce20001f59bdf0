//! Shared error types: the cooperative cancellation signal and the
//! primary-plus-suppressed error wrapper.

use std::fmt;

/// Raised when a unit of work observes that it was canceled.
///
/// Cancellation is a control-flow signal, not a failure: callers unwind on it
/// and report it to the client as a distinct outcome. It crosses `anyhow`
/// boundaries unchanged and is recognised with [`is_cancellation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Returns `true` if `err` (or any error in its chain) is a [`Canceled`] signal.
#[must_use]
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Canceled>())
}

/// An error that carries other errors which happened while handling it.
///
/// The primary error is the one reported to the caller; the suppressed errors
/// were raised earlier (or alongside) and must not be lost. `source()` is the
/// primary error.
pub struct CompositeError {
    primary: anyhow::Error,
    suppressed: Vec<anyhow::Error>,
}

impl CompositeError {
    /// Wraps `primary` with no suppressed errors.
    #[must_use]
    pub fn new(primary: anyhow::Error) -> Self {
        Self {
            primary,
            suppressed: Vec::new(),
        }
    }

    /// Attaches `err` as a suppressed error.
    #[must_use]
    pub fn with_suppressed(mut self, err: anyhow::Error) -> Self {
        self.suppressed.push(err);
        self
    }

    /// Attaches `err` as a suppressed error in place.
    pub fn add_suppressed(&mut self, err: anyhow::Error) {
        self.suppressed.push(err);
    }

    /// The error reported to the caller.
    #[must_use]
    pub fn primary(&self) -> &anyhow::Error {
        &self.primary
    }

    /// Errors attached to the primary one, in the order they were added.
    #[must_use]
    pub fn suppressed(&self) -> &[anyhow::Error] {
        &self.suppressed
    }

    /// Splits the composite into its primary and suppressed errors.
    #[must_use]
    pub fn into_parts(self) -> (anyhow::Error, Vec<anyhow::Error>) {
        (self.primary, self.suppressed)
    }

    /// Folds a list of errors into one composite: the first becomes primary.
    /// Returns `None` for an empty list.
    #[must_use]
    pub fn from_errors(errors: Vec<anyhow::Error>) -> Option<Self> {
        let mut iter = errors.into_iter();
        let primary = iter.next()?;
        Some(Self {
            primary,
            suppressed: iter.collect(),
        })
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " (suppressed: ")?;
            for (i, err) in self.suppressed.iter().enumerate() {
                if i > 0 {
                    write!(f, "; ")?;
                }
                write!(f, "{err}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeError")
            .field("primary", &self.primary)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

impl std::error::Error for CompositeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.primary.as_ref())
    }
}
