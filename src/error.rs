//! Error types for the pdf-transcriber library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`TranscriberError`]: **Fatal**: the job cannot proceed at all
//!   (source PDF missing, provider not configured, telemetry store not
//!   writable). Returned as `Err(TranscriberError)` from top-level operations.
//!
//! * [`PageError`]: **Non-fatal**: one page failed (render glitch, model
//!   timeout). Recorded as a `page_failed` event and retried on the next run
//!   of the same job; the rest of the job carries on.
//!
//! * [`TelemetryError`]: an event log could not be written or encoded.
//!
//! A corrupt log line, a refused deletion or a job with no state at all are
//! *not* errors: they surface as values (a skipped line counter, a
//! [`crate::sweep::KeepReason`], [`crate::state::JobStatus::Unknown`]).

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf-transcriber library.
#[derive(Debug, Error)]
pub enum TranscriberError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Source PDF was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// pdfium could not open the document at all.
    #[error("PDF '{path}' could not be opened: {detail}\nTry repairing with: qpdf input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// The document has no pages to transcribe.
    #[error("PDF '{path}' has no pages")]
    EmptyDocument { path: PathBuf },

    // ── Engine errors ─────────────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, you can:\n\
  • Check your internet connection and try again.\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Telemetry errors ──────────────────────────────────────────────────
    /// The event log for a job could not be written.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write a page file or the assembled Markdown.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures of the append-only event log.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The central telemetry directory could not be created.
    #[error("Cannot create telemetry directory '{path}': {source}\nSet PDF_TRANSCRIBER_TELEMETRY_DIR to a writable location.")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Appending a line to a job's log failed.
    #[error("Failed to append to event log '{path}': {source}")]
    AppendFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading a job's log failed (other than a malformed line).
    #[error("Failed to read event log '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An event could not be serialised to JSON.
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure reported by a [`crate::pipeline::VisionModel`].
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The service (or its client) gave up waiting.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Any other service, network or model error.
    #[error("{0}")]
    Service(String),
}

impl ModelError {
    /// Classify a provider error message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            ModelError::Timeout(message)
        } else {
            ModelError::Service(message)
        }
    }
}

/// A non-fatal error for a single page.
///
/// Every variant is transient from the job's point of view: the page stays in
/// the pending set and is attempted again on the next run.
#[derive(Debug, Clone, Error)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The vision model returned an error.
    #[error("Page {page}: vision model call failed: {detail}")]
    ModelFailed { page: usize, detail: String },

    /// The vision model call did not return within the configured timeout.
    #[error("Page {page}: vision model call timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The local text-extraction fallback could not read the page.
    #[error("Page {page}: fallback text extraction failed: {detail}")]
    FallbackFailed { page: usize, detail: String },
}

impl PageError {
    /// Short machine-readable kind written as `error_kind` in the event log.
    pub fn kind(&self) -> &'static str {
        match self {
            PageError::RenderFailed { .. } => "render",
            PageError::ModelFailed { .. } => "model",
            PageError::Timeout { .. } => "timeout",
            PageError::FallbackFailed { .. } => "fallback",
        }
    }

    /// 1-indexed page number the error refers to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::ModelFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::FallbackFailed { page, .. } => *page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_error_kinds_are_stable() {
        let timeout = PageError::Timeout { page: 3, secs: 60 };
        assert_eq!(timeout.kind(), "timeout");
        assert_eq!(timeout.page(), 3);
        assert!(timeout.to_string().contains("60s"), "got: {timeout}");

        let model = PageError::ModelFailed {
            page: 1,
            detail: "HTTP 503".into(),
        };
        assert_eq!(model.kind(), "model");
        assert!(model.to_string().contains("HTTP 503"));
    }

    #[test]
    fn model_errors_are_classified_by_message() {
        assert!(matches!(
            ModelError::from_message("operation timed out after 60s"),
            ModelError::Timeout(_)
        ));
        assert!(matches!(
            ModelError::from_message("HTTP 500 Internal Server Error"),
            ModelError::Service(_)
        ));
    }

    #[test]
    fn telemetry_error_is_transparent() {
        let inner = TelemetryError::AppendFailed {
            path: PathBuf::from("/tmp/job.jsonl"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        let e: TranscriberError = inner.into();
        let msg = e.to_string();
        assert!(msg.contains("job.jsonl"), "got: {msg}");
        assert!(msg.contains("disk full"), "got: {msg}");
    }

    #[test]
    fn provider_hint_is_shown() {
        let e = TranscriberError::ProviderNotConfigured {
            provider: "openai".into(),
            hint: "Set OPENAI_API_KEY".into(),
        };
        assert!(e.to_string().contains("OPENAI_API_KEY"));
    }
}
