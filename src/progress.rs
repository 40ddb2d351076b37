//! Progress-callback trait for per-page job events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] via
//! [`crate::config::JobConfigBuilder::progress_callback`] to follow a job in
//! real time: the CLI drives a progress bar through it, a host application
//! could forward events to a channel or a UI. The event log remains the
//! durable record; callbacks are a live, in-process view only.
//!
//! # Example
//!
//! ```rust
//! use pdf_transcriber::{JobConfig, JobProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl JobProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, fallback_used: bool) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page_num}/{total_pages} done (fallback: {fallback_used})");
//!     }
//! }
//!
//! let config = JobConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the job runner as it works through the pending pages.
///
/// Page numbers are 1-indexed. All methods default to no-ops.
pub trait JobProgressCallback: Send + Sync {
    /// Called once before the first pending page.
    ///
    /// # Arguments
    /// * `total_pages`: pages in the document
    /// * `pending_pages`: pages this run will attempt
    /// * `resumed`: whether an earlier run of the job exists
    fn on_job_start(&self, total_pages: usize, pending_pages: usize, resumed: bool) {
        let _ = (total_pages, pending_pages, resumed);
    }

    /// Called before the page is rendered.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called after `page_completed` is logged.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, fallback_used: bool) {
        let _ = (page_num, total_pages, fallback_used);
    }

    /// Called after `page_failed` is logged.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after `job_completed` is logged.
    fn on_job_complete(&self, pages_completed: usize, pages_failed: usize) {
        let _ = (pages_completed, pages_failed);
    }
}

/// A no-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::JobConfig`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        pending: AtomicUsize,
        completes: AtomicUsize,
        fallbacks: AtomicUsize,
        errors: AtomicUsize,
    }

    impl JobProgressCallback for TrackingCallback {
        fn on_job_start(&self, _total: usize, pending: usize, _resumed: bool) {
            self.pending.store(pending, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page: usize, _total: usize, fallback_used: bool) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            if fallback_used {
                self.fallbacks.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_page_error(&self, _page: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_job_start(5, 3, true);
        cb.on_page_start(1, 5);
        cb.on_page_complete(1, 5, false);
        cb.on_page_error(2, 5, "timeout");
        cb.on_job_complete(4, 1);
    }

    #[test]
    fn tracking_callback_through_arc_dyn() {
        let tracker = Arc::new(TrackingCallback::default());
        let cb: ProgressCallback = tracker.clone();

        cb.on_job_start(3, 2, true);
        cb.on_page_complete(2, 3, true);
        cb.on_page_error(3, 3, "model error");

        assert_eq!(tracker.pending.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.fallbacks.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
