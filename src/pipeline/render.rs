//! pdfium-backed page rendering and text-layer fallback.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and blocks for the duration of a render. Every call therefore runs
//! on Tokio's blocking pool, leaving the worker threads free for the
//! heartbeat task and the model request.
//!
//! [`PdfiumRenderer::acquire`] resolves (and on first run downloads) the
//! pdfium shared library once; each blocking call binds to that path.

use super::{FallbackExtractor, PageRenderer};
use crate::error::{PageError, TranscriberError};
use async_trait::async_trait;
use image::DynamicImage;
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Renderer and text extractor over one resolved pdfium library.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    library: PathBuf,
    max_pixels: u32,
}

impl PdfiumRenderer {
    /// Resolve the pdfium library and check that it binds.
    ///
    /// Blocking: may download pdfium on first use.
    pub fn acquire(max_pixels: u32) -> Result<Self, TranscriberError> {
        let library = pdfium_auto::ensure_pdfium_library(None)
            .map_err(|e| TranscriberError::PdfiumBindingFailed(e.to_string()))?;
        pdfium_auto::bind_pdfium_from_path(&library)
            .map_err(|e| TranscriberError::PdfiumBindingFailed(e.to_string()))?;
        info!("pdfium bound from {}", library.display());
        Ok(Self {
            library,
            max_pixels: max_pixels.max(100),
        })
    }
}

#[async_trait]
impl PageRenderer for PdfiumRenderer {
    async fn page_count(&self, path: &Path) -> Result<usize, TranscriberError> {
        let library = self.library.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || page_count_blocking(&library, &path))
            .await
            .map_err(|e| TranscriberError::Internal(format!("Page count task panicked: {}", e)))?
    }

    async fn render_page(&self, path: &Path, index: usize, dpi: u32) -> Result<DynamicImage, PageError> {
        let library = self.library.clone();
        let path = path.to_path_buf();
        let max_pixels = self.max_pixels;
        tokio::task::spawn_blocking(move || render_page_blocking(&library, &path, index, dpi, max_pixels))
            .await
            .map_err(|e| PageError::RenderFailed {
                page: index + 1,
                detail: format!("render task panicked: {}", e),
            })?
    }
}

#[async_trait]
impl FallbackExtractor for PdfiumRenderer {
    async fn extract_text(&self, path: &Path, index: usize) -> Result<String, PageError> {
        let library = self.library.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || extract_text_blocking(&library, &path, index))
            .await
            .map_err(|e| PageError::FallbackFailed {
                page: index + 1,
                detail: format!("extraction task panicked: {}", e),
            })?
    }
}

fn bind(library: &Path) -> Result<Pdfium, String> {
    pdfium_auto::bind_pdfium_from_path(library).map_err(|e| e.to_string())
}

fn page_count_blocking(library: &Path, pdf_path: &Path) -> Result<usize, TranscriberError> {
    let pdfium = bind(library).map_err(TranscriberError::PdfiumBindingFailed)?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| TranscriberError::CorruptPdf {
            path: pdf_path.to_path_buf(),
            detail: format!("{:?}", e),
        })?;
    let total = document.pages().len() as usize;
    info!("PDF loaded: {} pages", total);
    Ok(total)
}

fn render_page_blocking(
    library: &Path,
    pdf_path: &Path,
    index: usize,
    dpi: u32,
    max_pixels: u32,
) -> Result<DynamicImage, PageError> {
    let fail = |detail: String| PageError::RenderFailed {
        page: index + 1,
        detail,
    };
    let pdfium = bind(library).map_err(fail)?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| fail(format!("{:?}", e)))?;
    let page = document
        .pages()
        .get(index as u16)
        .map_err(|e| fail(format!("{:?}", e)))?;

    let target_width = target_width_px(page.width().value, dpi, max_pixels);
    let render_config = PdfRenderConfig::new()
        .set_target_width(target_width)
        .set_maximum_height(max_pixels as i32);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| fail(format!("{:?}", e)))?;
    let image = bitmap.as_image();
    debug!(
        "Rendered page {} at {} DPI → {}x{} px",
        index + 1,
        dpi,
        image.width(),
        image.height()
    );
    Ok(image)
}

/// Pixel width for a page `width_pts` wide (1 pt = 1/72 in), capped at `max_pixels`.
fn target_width_px(width_pts: f32, dpi: u32, max_pixels: u32) -> i32 {
    let px = (width_pts / 72.0 * dpi as f32).round() as i32;
    px.clamp(1, max_pixels as i32)
}

static LEADING_PAGE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+\s*\n").unwrap());

fn extract_text_blocking(library: &Path, pdf_path: &Path, index: usize) -> Result<String, PageError> {
    let fail = |detail: String| PageError::FallbackFailed {
        page: index + 1,
        detail,
    };
    let pdfium = bind(library).map_err(fail)?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| fail(format!("{:?}", e)))?;
    let page = document
        .pages()
        .get(index as u16)
        .map_err(|e| fail(format!("{:?}", e)))?;
    let text = page.text().map_err(|e| fail(format!("{:?}", e)))?.all();

    let cleaned = clean_extracted_text(&text);
    info!(
        "Page {}: extracted {} chars from the text layer",
        index + 1,
        cleaned.len()
    );
    Ok(cleaned)
}

/// Drop a standalone page number on the first line and trim.
fn clean_extracted_text(text: &str) -> String {
    LEADING_PAGE_NUMBER.replace(text, "").trim().to_string()
}
