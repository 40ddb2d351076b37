//! Vision-model transcription of one page through `edgequake-llm`.
//!
//! One request per page: the system prompt, then a user turn whose only
//! content is the page image. No retry loop here: a
//! failed page is recorded and picked up by the next run of the job.

use super::encode::encode_page;
use super::VisionModel;
use crate::config::JobConfig;
use crate::error::ModelError;
use crate::prompts::TRANSCRIPTION_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// [`VisionModel`] over any `edgequake-llm` provider.
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
}

impl LlmVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &JobConfig) -> Self {
        Self {
            provider,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| TRANSCRIPTION_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

fn build_options(temperature: f32, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    async fn transcribe(&self, image: &DynamicImage) -> Result<String, ModelError> {
        let start = Instant::now();
        let attachment = encode_page(image)?;
        let messages = vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user_with_images("", vec![attachment]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&build_options(self.temperature, self.max_tokens)))
            .await
            .map_err(|e| ModelError::from_message(e.to_string()))?;

        debug!(
            "{} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(strip_outer_fence(&response.content))
    }
}

/// Some models wrap the whole page in a ```markdown fence.
fn strip_outer_fence(content: &str) -> String {
    let trimmed = content.trim();
    let Some(body) = trimmed
        .strip_prefix("```markdown")
        .or_else(|| trimmed.strip_prefix("```md"))
        .or_else(|| trimmed.strip_prefix("```"))
    else {
        return trimmed.to_string();
    };
    match body.strip_suffix("```") {
        Some(inner) if body.starts_with('\n') => inner.trim().to_string(),
        _ => trimmed.to_string(),
    }
}
