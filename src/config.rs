//! Configuration types for transcription jobs and their telemetry.
//!
//! Job behaviour is controlled through [`JobConfig`], built via its
//! [`JobConfigBuilder`]. The telemetry store, the page verifier and the
//! dashboard each get a small dedicated struct so readers (dashboard,
//! sweeper) never need to construct a full job configuration.

use crate::error::TranscriberError;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding the central telemetry directory.
pub const TELEMETRY_DIR_ENV: &str = "PDF_TRANSCRIBER_TELEMETRY_DIR";

/// Configuration for one transcription job.
///
/// # Example
/// ```rust
/// use pdf_transcriber::{JobConfig, QualityPreset};
///
/// let config = JobConfig::builder()
///     .quality(QualityPreset::HighQuality)
///     .model("gpt-4.1-nano")
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi(), 200);
/// ```
#[derive(Clone)]
pub struct JobConfig {
    /// Rendering quality preset. Default: [`QualityPreset::Balanced`] (150 DPI).
    pub quality: QualityPreset,

    /// Explicit DPI overriding the preset. Range: 72–400.
    pub dpi_override: Option<u32>,

    /// Maximum rendered image dimension in pixels. Default: 2000.
    ///
    /// Caps either edge independently of DPI so oversized pages never
    /// allocate unbounded bitmaps.
    pub max_rendered_pixels: u32,

    /// LLM model identifier, e.g. "gpt-4.1-nano". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Per-page vision model timeout in seconds. Default: 120.
    ///
    /// A call that exceeds it is recorded as a `timeout` page failure and the
    /// page is retried on the next run.
    pub api_timeout_secs: u64,

    /// Custom system prompt. If None, uses the built-in transcription prompt.
    pub system_prompt: Option<String>,

    /// Resume from the job's existing event log. Default: true.
    pub resume: bool,

    /// How a finished job with failed pages is classified. Default: [`CompletionPolicy::AlwaysComplete`].
    pub completion_policy: CompletionPolicy,

    /// Hallucination detection thresholds.
    pub verification: VerificationConfig,

    /// Where event logs live and how often heartbeats are written.
    pub telemetry: TelemetryConfig,

    /// Receives per-page progress events.
    pub progress: ProgressCallback,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            quality: QualityPreset::default(),
            dpi_override: None,
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            api_timeout_secs: 120,
            system_prompt: None,
            resume: true,
            completion_policy: CompletionPolicy::default(),
            verification: VerificationConfig::default(),
            telemetry: TelemetryConfig::default(),
            progress: Arc::new(NoopProgressCallback),
        }
    }
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("quality", &self.quality)
            .field("dpi_override", &self.dpi_override)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("resume", &self.resume)
            .field("completion_policy", &self.completion_policy)
            .field("verification", &self.verification)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

impl JobConfig {
    /// Create a new builder for `JobConfig`.
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder {
            config: Self::default(),
        }
    }

    /// Effective rendering DPI: the explicit override, else the preset's.
    pub fn dpi(&self) -> u32 {
        self.dpi_override.unwrap_or_else(|| self.quality.dpi())
    }
}

/// Builder for [`JobConfig`].
pub struct JobConfigBuilder {
    config: JobConfig,
}

impl JobConfigBuilder {
    pub fn quality(mut self, quality: QualityPreset) -> Self {
        self.config.quality = quality;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi_override = Some(dpi.clamp(72, 400));
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn completion_policy(mut self, policy: CompletionPolicy) -> Self {
        self.config.completion_policy = policy;
        self
    }

    pub fn verification(mut self, verification: VerificationConfig) -> Self {
        self.config.verification = verification;
        self
    }

    pub fn telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.config.telemetry = telemetry;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.telemetry.heartbeat_interval = interval;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress = cb;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<JobConfig, TranscriberError> {
        let c = &self.config;
        if c.api_timeout_secs == 0 {
            return Err(TranscriberError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.telemetry.heartbeat_interval.is_zero() {
            return Err(TranscriberError::InvalidConfig(
                "Heartbeat interval must be non-zero".into(),
            ));
        }
        if let CompletionPolicy::MaxFailedFraction(f) = c.completion_policy {
            if !(0.0..=1.0).contains(&f) {
                return Err(TranscriberError::InvalidConfig(format!(
                    "Max failed fraction must be 0.0–1.0, got {f}"
                )));
            }
        }
        Ok(self.config)
    }
}

/// Telemetry store location and heartbeat cadence.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Directory holding one `{job_id}.jsonl` log per job.
    pub central_dir: PathBuf,
    /// Period between heartbeat events. Default: 30s.
    pub heartbeat_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            central_dir: default_central_dir(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl TelemetryConfig {
    pub fn with_central_dir(central_dir: impl Into<PathBuf>) -> Self {
        Self {
            central_dir: central_dir.into(),
            ..Self::default()
        }
    }
}

/// `$PDF_TRANSCRIBER_TELEMETRY_DIR`, else `{cache}/pdf-transcriber/telemetry`.
pub fn default_central_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(TELEMETRY_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pdf-transcriber")
        .join("telemetry")
}

/// Thresholds used to classify model output as hallucinated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// A single-letter token repeated this many times in a row is a failure. Default: 5.
    pub char_run_threshold: usize,
    /// A phrase repeated this many consecutive times is a failure. Default: 10.
    pub phrase_cycle_threshold: usize,
    /// Longest phrase (in words) checked for repetition. Default: 5.
    pub max_phrase_words: usize,
    /// Fraction of non-text characters above which output is garbled. Default: 0.5.
    pub garbled_ratio: f64,
    /// Texts shorter than this are never considered garbled. Default: 100.
    pub garbled_min_chars: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            char_run_threshold: 5,
            phrase_cycle_threshold: 10,
            max_phrase_words: 5,
            garbled_ratio: 0.5,
            garbled_min_chars: 100,
        }
    }
}

/// Dashboard refresh cadence and liveness window.
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    /// Directory whose subdirectories are job output folders.
    pub output_root: PathBuf,
    /// Timer-driven refresh period. Default: 5s.
    pub poll_interval: Duration,
    /// A running job without a heartbeat for longer than this is stale. Default: 120s.
    pub stale_threshold: Duration,
}

impl DashboardConfig {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            poll_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(120),
        }
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Rendering quality, mapped to a DPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityPreset {
    /// 100 DPI.
    Fast,
    /// 150 DPI. (default)
    #[default]
    Balanced,
    /// 200 DPI.
    HighQuality,
}

impl QualityPreset {
    pub fn dpi(self) -> u32 {
        match self {
            QualityPreset::Fast => 100,
            QualityPreset::Balanced => 150,
            QualityPreset::HighQuality => 200,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityPreset::Fast => "fast",
            QualityPreset::Balanced => "balanced",
            QualityPreset::HighQuality => "high-quality",
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityPreset {
    type Err = TranscriberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(QualityPreset::Fast),
            "balanced" => Ok(QualityPreset::Balanced),
            "high-quality" | "high_quality" | "high" => Ok(QualityPreset::HighQuality),
            other => Err(TranscriberError::InvalidConfig(format!(
                "Unknown quality preset '{other}' (expected fast, balanced or high-quality)"
            ))),
        }
    }
}

/// How a job that reached `job_completed` with failed pages is classified.
///
/// Applied inside the state fold, so the same log read with the same policy
/// always yields the same status.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Finishing the run is success; failed pages are only counted. (default)
    #[default]
    AlwaysComplete,
    /// Any failed page makes the job `failed`.
    FailOnAnyPageFailure,
    /// The job is `failed` when `failed / (completed + failed)` exceeds the fraction.
    MaxFailedFraction(f64),
}

impl CompletionPolicy {
    /// True when a finished run with these counts counts as a success.
    pub fn is_success(&self, pages_completed: usize, pages_failed: usize) -> bool {
        match *self {
            CompletionPolicy::AlwaysComplete => true,
            CompletionPolicy::FailOnAnyPageFailure => pages_failed == 0,
            CompletionPolicy::MaxFailedFraction(max) => {
                let attempted = pages_completed + pages_failed;
                attempted == 0 || (pages_failed as f64 / attempted as f64) <= max
            }
        }
    }
}

impl FromStr for CompletionPolicy {
    type Err = TranscriberError;

    /// Parses `always`, `strict`, or a fraction such as `0.1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" | "always-complete" => Ok(CompletionPolicy::AlwaysComplete),
            "strict" | "fail-on-any" => Ok(CompletionPolicy::FailOnAnyPageFailure),
            other => other
                .parse::<f64>()
                .ok()
                .filter(|f| (0.0..=1.0).contains(f))
                .map(CompletionPolicy::MaxFailedFraction)
                .ok_or_else(|| {
                    TranscriberError::InvalidConfig(format!(
                        "Unknown completion policy '{s}' (expected always, strict or a fraction 0.0–1.0)"
                    ))
                }),
        }
    }
}
