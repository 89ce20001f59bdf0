//! lintd core: cooperative cancellation, hierarchical progress reporting and
//! the cancelable loading cache shared by the backend.

pub mod cache;
pub mod cancel;
pub mod error;
pub mod progress;

pub use cache::{CacheError, CacheListener, CancelableLoadingCache, SharedError};
pub use cancel::{CancelChecker, CancelHandle};
pub use error::{is_cancellation, Canceled, CompositeError};
pub use progress::{ClientProgressMonitor, ProgressMonitor};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
