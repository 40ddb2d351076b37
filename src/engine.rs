//! Process-scoped handle on the expensive collaborators of a job.
//!
//! A [`TranscriptionEngine`] owns the page renderer, the vision model and the
//! fallback extractor. It is acquired once, passed by reference to every
//! [`crate::runner::JobRunner`], and released explicitly; releasing is the
//! whole "clear cache" operation. There is no global engine state.

use crate::config::JobConfig;
use crate::error::TranscriberError;
use crate::pipeline::llm::LlmVisionModel;
use crate::pipeline::render::PdfiumRenderer;
use crate::pipeline::{FallbackExtractor, PageRenderer, VisionModel};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::info;

/// Default model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

pub struct TranscriptionEngine {
    renderer: Arc<dyn PageRenderer>,
    vision: Arc<dyn VisionModel>,
    fallback: Arc<dyn FallbackExtractor>,
}

impl TranscriptionEngine {
    /// Assemble an engine from explicit parts.
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        vision: Arc<dyn VisionModel>,
        fallback: Arc<dyn FallbackExtractor>,
    ) -> Self {
        Self {
            renderer,
            vision,
            fallback,
        }
    }

    /// Bind pdfium and resolve the LLM provider described by `config`.
    pub async fn acquire(config: &JobConfig) -> Result<Self, TranscriberError> {
        let max_pixels = config.max_rendered_pixels;
        let pdfium = tokio::task::spawn_blocking(move || PdfiumRenderer::acquire(max_pixels))
            .await
            .map_err(|e| TranscriberError::Internal(format!("pdfium setup panicked: {}", e)))??;
        let pdfium = Arc::new(pdfium);

        let provider = resolve_provider(config)?;
        let vision = Arc::new(LlmVisionModel::new(provider, config));
        info!("Transcription engine acquired");

        Ok(Self::new(pdfium.clone(), vision, pdfium))
    }

    /// Drop the renderer and the model client.
    pub fn release(self) {
        drop(self);
        info!("Transcription engine released");
    }

    pub fn renderer(&self) -> &dyn PageRenderer {
        self.renderer.as_ref()
    }

    pub fn vision(&self) -> &dyn VisionModel {
        self.vision.as_ref()
    }

    pub fn fallback(&self) -> &dyn FallbackExtractor {
        self.fallback.as_ref()
    }
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, TranscriberError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        TranscriberError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. a pre-built provider in the config;
/// 2. a named provider plus model;
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` in the environment;
/// 4. OpenAI when `OPENAI_API_KEY` is set, else full auto-detection.
pub fn resolve_provider(config: &JobConfig) -> Result<Arc<dyn LLMProvider>, TranscriberError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider("openai", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| TranscriberError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
