//! Hierarchical, cancelable progress reporting.
//!
//! A [`ProgressMonitor`] tree maps nested sub-tasks onto the single `[0, 1]`
//! scale shown by the client. Only the root is bound to a
//! [`ClientProgressMonitor`]; children translate their local fraction into
//! the root scale and prepend their message prefix chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cancel::CancelChecker;
use crate::error::Canceled;

/// Progress sink and cancellation source provided by the client.
pub trait ClientProgressMonitor: Send + Sync {
    /// Returns `true` if the client asked to cancel the operation.
    fn is_canceled(&self) -> bool;

    /// Replaces the message displayed to the user.
    fn set_message(&self, message: &str);

    /// Reports overall completion in `[0, 1]`.
    fn set_fraction(&self, fraction: f32);

    /// Switches between determinate and indeterminate display.
    fn set_indeterminate(&self, indeterminate: bool);

    /// Runs `section` while the client refrains from canceling.
    ///
    /// The default implementation offers no client-side guarantee and simply
    /// runs the section.
    fn execute_non_cancelable_section(&self, section: &mut dyn FnMut()) {
        section();
    }
}

/// Nesting depth of non-cancelable sections entered on one node, chained to
/// the node's ancestors.
struct SectionDepth {
    depth: AtomicUsize,
    parent: Option<Arc<SectionDepth>>,
}

impl SectionDepth {
    fn new(parent: Option<Arc<SectionDepth>>) -> Arc<Self> {
        Arc::new(Self {
            depth: AtomicUsize::new(0),
            parent,
        })
    }

    /// `true` if this node or an ancestor is inside a section.
    fn active(&self) -> bool {
        let mut node = Some(self);
        while let Some(current) = node {
            if current.depth.load(Ordering::Acquire) > 0 {
                return true;
            }
            node = current.parent.as_deref();
        }
        false
    }
}

/// Node of a progress tree.
///
/// Cloning is cheap and yields a handle to the same node: a clone shares the
/// node's cancel flag and non-cancelable state.
#[derive(Clone)]
pub struct ProgressMonitor {
    client: Option<Arc<dyn ClientProgressMonitor>>,
    offset: f32,
    factor: f32,
    prefix: Option<String>,
    cancel: CancelChecker,
    non_cancelable: Arc<SectionDepth>,
}

impl std::fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMonitor")
            .field("has_client", &self.client.is_some())
            .field("offset", &self.offset)
            .field("factor", &self.factor)
            .field("prefix", &self.prefix)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl ProgressMonitor {
    /// Creates a root monitor reporting to `client`.
    #[must_use]
    pub fn new(client: Arc<dyn ClientProgressMonitor>) -> Self {
        Self::with_client(Some(client))
    }

    /// Creates a root monitor bound to no client. Progress is discarded and
    /// only local cancellation is observed.
    #[must_use]
    pub fn detached() -> Self {
        Self::with_client(None)
    }

    fn with_client(client: Option<Arc<dyn ClientProgressMonitor>>) -> Self {
        Self {
            client,
            offset: 0.0,
            factor: 1.0,
            prefix: None,
            cancel: CancelChecker::new(),
            non_cancelable: SectionDepth::new(None),
        }
    }

    /// Creates a child covering `[from, to]` of this node's range.
    ///
    /// Bounds are clamped to `[0, 1]` and reordered if reversed. The child's
    /// messages are prefixed with `"<parent prefix> - <prefix>"`; an empty
    /// `prefix` keeps the parent's chain unchanged. Canceling this node also
    /// cancels the child; canceling the child does not affect this node. The
    /// child is non-cancelable while this node is inside a non-cancelable
    /// section.
    #[must_use]
    pub fn sub_progress(&self, from: f32, to: f32, prefix: &str) -> Self {
        let mut from = from.clamp(0.0, 1.0);
        let mut to = to.clamp(0.0, 1.0);
        if from > to {
            std::mem::swap(&mut from, &mut to);
        }
        let prefix = match (&self.prefix, prefix.is_empty()) {
            (parent, true) => parent.clone(),
            (Some(parent), false) => Some(format!("{parent} - {prefix}")),
            (None, false) => Some(prefix.to_string()),
        };
        Self {
            client: self.client.clone(),
            offset: self.offset + from * self.factor,
            factor: (to - from) * self.factor,
            prefix,
            cancel: self.cancel.child(),
            non_cancelable: SectionDepth::new(Some(Arc::clone(&self.non_cancelable))),
        }
    }

    /// Requests cancellation of this node and its descendants.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` if this node (or an ancestor) was canceled, or if the
    /// client reports cancellation.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled() || self.client.as_ref().is_some_and(|c| c.is_canceled())
    }

    /// Returns `Err(Canceled)` if [`is_canceled`](Self::is_canceled) holds and
    /// neither this node nor an ancestor is inside a non-cancelable section.
    ///
    /// # Errors
    ///
    /// Returns [`Canceled`] when the operation should unwind.
    pub fn check_cancel(&self) -> Result<(), Canceled> {
        if self.non_cancelable.active() {
            return Ok(());
        }
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    /// Reports `message` (with this node's prefix chain) to the client.
    pub fn set_message(&self, message: &str) {
        if let Some(client) = &self.client {
            client.set_message(&self.full_message(message));
        }
    }

    /// Reports a local `fraction` (in `[0, 1]`) mapped onto the root scale.
    pub fn set_fraction(&self, fraction: f32) {
        if let Some(client) = &self.client {
            client.set_fraction(self.to_root_fraction(fraction));
        }
    }

    /// Switches the client display between determinate and indeterminate.
    pub fn set_indeterminate(&self, indeterminate: bool) {
        if let Some(client) = &self.client {
            client.set_indeterminate(indeterminate);
        }
    }

    /// Reports a message and a local fraction together.
    pub fn set_progress(&self, message: &str, fraction: f32) {
        self.set_message(message);
        self.set_fraction(fraction);
    }

    /// Reports progress, then unwinds if the operation was canceled.
    ///
    /// # Errors
    ///
    /// Returns [`Canceled`] when the operation should unwind.
    pub fn set_progress_and_check_cancel(&self, message: &str, fraction: f32) -> Result<(), Canceled> {
        self.set_progress(message, fraction);
        self.check_cancel()
    }

    /// Runs `section` without letting cancellation interrupt it.
    ///
    /// Locally, [`check_cancel`](Self::check_cancel) on this node and its
    /// descendants never fails while the section runs. The client is asked to hold back cancellation
    /// as well; how strongly it honors that is up to the client.
    pub fn execute_non_cancelable_section<R>(&self, section: impl FnOnce() -> R) -> R {
        let _guard = NonCancelableGuard::enter(&self.non_cancelable.depth);
        match &self.client {
            None => section(),
            Some(client) => {
                let mut section = Some(section);
                let mut result = None;
                client.execute_non_cancelable_section(&mut || {
                    if let Some(section) = section.take() {
                        result = Some(section());
                    }
                });
                match (result, section) {
                    (Some(result), _) => result,
                    // The client declined to run the section; run it here so
                    // the caller always gets a result.
                    (None, Some(section)) => section(),
                    (None, None) => unreachable!("section ran without producing a result"),
                }
            }
        }
    }

    /// The message prefix chain of this node, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn full_message(&self, message: &str) -> String {
        match &self.prefix {
            None => message.to_string(),
            Some(prefix) if message.is_empty() => prefix.clone(),
            Some(prefix) => format!("{prefix} - {message}"),
        }
    }

    fn to_root_fraction(&self, fraction: f32) -> f32 {
        (self.offset + fraction.clamp(0.0, 1.0) * self.factor).clamp(0.0, 1.0)
    }
}

struct NonCancelableGuard<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> NonCancelableGuard<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::AcqRel);
        Self { depth }
    }
}

impl Drop for NonCancelableGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}
