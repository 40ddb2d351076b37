//! External collaborators of the job runner.
//!
//! The runner never talks to pdfium or an LLM directly. It calls three
//! narrow traits, so tests can swap in fakes and the engine handle can own
//! the real implementations:
//!
//! ```text
//! source.pdf ──▶ PageRenderer ──▶ VisionModel ──▶ candidate text
//!                 (pdfium)          (VLM)
//!            └─▶ FallbackExtractor ─────────────▶ plain text
//!                 (pdfium text layer)
//! ```
//!
//! 1. [`input`]: validate the source path before any work starts
//! 2. [`render`]: rasterise one page; runs in `spawn_blocking` because
//!    pdfium is not async-safe. Also serves the text-layer fallback.
//! 3. [`encode`]: PNG-encode and base64-wrap a page image for the API body
//! 4. [`llm`]: one vision-model call per page, no retries

pub mod encode;
pub mod input;
pub mod llm;
pub mod render;

use crate::error::{ModelError, PageError, TranscriberError};
use async_trait::async_trait;
use image::DynamicImage;
use std::path::Path;

/// Rasterises pages of a PDF.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Number of pages in the document.
    async fn page_count(&self, path: &Path) -> Result<usize, TranscriberError>;

    /// Render the 0-based page `index` at `dpi`.
    async fn render_page(&self, path: &Path, index: usize, dpi: u32) -> Result<DynamicImage, PageError>;
}

/// Turns a page image into Markdown.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn transcribe(&self, image: &DynamicImage) -> Result<String, ModelError>;
}

/// Deterministic, model-free text extraction used when the model hallucinates.
#[async_trait]
pub trait FallbackExtractor: Send + Sync {
    async fn extract_text(&self, path: &Path, index: usize) -> Result<String, PageError>;
}
