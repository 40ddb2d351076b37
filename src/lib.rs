//! # pdf-transcriber
//!
//! Transcribe PDF documents to Markdown with a vision model, one page at a
//! time, in jobs that survive crashes and can be watched while they run.
//!
//! ## How a job is recorded
//!
//! Every job writes an append-only JSONL event log. Nothing else is state:
//! progress, resume points, the dashboard and retention decisions are all
//! derived by replaying that log from the first line.
//!
//! ```text
//! JobRunner ──append──▶ {telemetry}/{job_id}.jsonl ◀──append── heartbeat task
//!                              │  (alias: {output_dir}/events.jsonl)
//!                              ▼
//!                       state::reconstruct ──▶ runner (resume)
//!                                           ├─▶ dashboard (read-only)
//!                                           └─▶ sweep (delete when safe)
//! ```
//!
//! ## Page pipeline
//!
//! ```text
//! page ─▶ render (pdfium) ─▶ vision model ─▶ verify ─┬─▶ page_completed
//!                                  │                 └─ hallucination ─▶ text layer ─▶ page_completed
//!                                  └─ error / timeout ─▶ page_failed (retried next run)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_transcriber::{JobConfig, JobRunner, JobSpec, TranscriptionEngine};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = JobConfig::builder().build()?;
//!     let engine = TranscriptionEngine::acquire(&config).await?;
//!
//!     let spec = JobSpec::for_source(Path::new("paper.pdf"), Path::new("out"));
//!     let summary = JobRunner::new(&engine, &config).run(&spec).await?;
//!     eprintln!("{}/{} pages → {}", summary.pages_completed, summary.total_pages,
//!         summary.output_path.display());
//!
//!     engine.release();
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `pdf-transcriber` binary (clap, anyhow, tracing-subscriber, indicatif, crossterm) |
//! | `bundled` | off     | Embed the pdfium shared library in the binary |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod events;
pub mod heartbeat;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod runner;
pub mod state;
pub mod sweep;
pub mod verify;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    CompletionPolicy, DashboardConfig, JobConfig, JobConfigBuilder, QualityPreset, TelemetryConfig,
    VerificationConfig,
};
pub use engine::TranscriptionEngine;
pub use error::{ModelError, PageError, TelemetryError, TranscriberError};
pub use event_log::{EventLog, EventStore};
pub use events::{Event, Severity};
pub use heartbeat::{spawn_heartbeat, HeartbeatHandle};
pub use pipeline::{FallbackExtractor, PageRenderer, VisionModel};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
pub use runner::{JobRunner, JobSpec, JobSummary};
pub use state::{reconstruct, JobRef, JobState, JobStatus, StateSource};
pub use sweep::{sweep, Decision, KeepReason, SweepReport};
