//! Drives one transcription job page by page.
//!
//! ## Page state machine
//!
//! ```text
//! pending ──▶ verifying ──(clean / informational)──────────────▶ completed
//!    │            └──(hallucination)──▶ failed_fallback_pending ──▶ completed
//!    └──(render / model error)──▶ failed   (pending again next run)
//! ```
//!
//! ## Resume
//!
//! A run first replays the job's log. If the job already started, the work
//! set is every page that is not completed (failed pages included) and the
//! run is announced with `job_resumed` instead of a second `job_started`.
//! `job_completed` is appended only after every pending page of the run has
//! been attempted; a killed run never writes it.

use crate::config::JobConfig;
use crate::engine::TranscriptionEngine;
use crate::error::{ModelError, PageError, TranscriberError};
use crate::event_log::{job_id_for, EventLog, EventStore};
use crate::events::{Event, Severity};
use crate::heartbeat::spawn_heartbeat;
use crate::output::{output_path_for, write_atomic, PageStore};
use crate::pipeline::input::validate_source;
use crate::state::{reconstruct, JobRef, JobState, JobStatus, StateSource};
use crate::verify::verify_page;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to transcribe and where.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: String,
    pub source_pdf: PathBuf,
    /// Job-specific directory holding pages, output and the log alias.
    pub output_dir: PathBuf,
}

impl JobSpec {
    /// `{output_root}/{slug of the PDF file name}`.
    pub fn for_source(source_pdf: &Path, output_root: &Path) -> Self {
        let stem = source_pdf
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let job_id = job_id_for(&stem);
        Self {
            output_dir: output_root.join(&job_id),
            job_id,
            source_pdf: source_pdf.to_path_buf(),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        output_path_for(&self.output_dir, &self.job_id)
    }
}

/// States a page moves through within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Pending,
    Verifying,
    Completed,
    FailedFallbackPending,
    Failed,
}

/// Final state of one attempted page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageReport {
    pub page_index: usize,
    pub state: PageState,
    pub hallucination_detected: bool,
    pub fallback_used: bool,
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub output_path: PathBuf,
    pub total_pages: usize,
    /// Across all runs.
    pub pages_completed: usize,
    /// Across all runs, still not completed.
    pub pages_failed: usize,
    /// Pages a further run would attempt.
    pub pages_pending: usize,
    pub attempted_this_run: usize,
    pub fallback_this_run: usize,
    pub resumed: bool,
    pub status: JobStatus,
    pub duration_ms: u64,
}

#[derive(Default)]
struct RunCounters {
    completed: usize,
    failed: usize,
    fallbacks: usize,
    errors: usize,
    warnings: usize,
}

/// Runs jobs against a borrowed engine.
pub struct JobRunner<'a> {
    engine: &'a TranscriptionEngine,
    config: &'a JobConfig,
    store: EventStore,
}

impl<'a> JobRunner<'a> {
    pub fn new(engine: &'a TranscriptionEngine, config: &'a JobConfig) -> Self {
        Self {
            engine,
            config,
            store: EventStore::from_config(&config.telemetry),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Run (or resume) a job until every pending page has been attempted.
    pub async fn run(&self, spec: &JobSpec) -> Result<JobSummary, TranscriberError> {
        let run_start = Instant::now();
        let source = validate_source(&spec.source_pdf)?;
        std::fs::create_dir_all(&spec.output_dir).map_err(|source| TranscriberError::OutputWriteFailed {
            path: spec.output_dir.clone(),
            source,
        })?;

        // ── Step 1: replay what earlier runs recorded ─────────────────────
        let job = JobRef::new(&self.store, &spec.job_id, Some(spec.output_dir.clone()));
        let prior = reconstruct(&job, &self.config.completion_policy)?;
        let log = self.store.open(&spec.job_id, Some(&spec.output_dir))?;

        // ── Step 2: announce the run ──────────────────────────────────────
        let resumable = matches!(prior.source, StateSource::EventLog(_)) && prior.started_at.is_some();
        let (total_pages, pending, resumed) = if self.config.resume && resumable {
            let pending = prior.pending_pages();
            info!(
                "Resuming '{}': {}/{} pages done, {} pending",
                spec.job_id,
                prior.completed.len(),
                prior.total_pages,
                pending.len()
            );
            log.append(&Event::JobResumed {
                job_id: spec.job_id.clone(),
                pending_pages: pending.iter().copied().collect(),
                resumed_at: Utc::now(),
            })?;
            (prior.total_pages, pending, true)
        } else {
            if let StateSource::Snapshot(path) = &prior.source {
                warn!(
                    "Found legacy progress snapshot {}; starting a fresh event log",
                    path.display()
                );
            } else if resumable {
                info!("Restarting '{}' from scratch", spec.job_id);
            }
            let total = self.engine.renderer().page_count(&source).await?;
            if total == 0 {
                return Err(TranscriberError::EmptyDocument { path: source });
            }
            log.append(&Event::JobStarted {
                job_id: spec.job_id.clone(),
                source_path: source.clone(),
                output_dir: spec.output_dir.clone(),
                output_path: spec.output_path(),
                total_pages: total,
                quality_preset: self.config.quality,
                dpi: self.config.dpi(),
                started_at: Utc::now(),
            })?;
            info!("Started '{}': {} pages", spec.job_id, total);
            (total, (0..total).collect::<BTreeSet<usize>>(), false)
        };

        let progress = &self.config.progress;
        progress.on_job_start(total_pages, pending.len(), resumed);

        // ── Step 3: page loop with the heartbeat running alongside ───────
        let heartbeat = spawn_heartbeat(log.clone(), self.config.telemetry.heartbeat_interval);
        let pages = PageStore::new(&spec.output_dir);
        let mut counters = RunCounters::default();

        for &index in &pending {
            let report = self
                .process_page(&log, &source, &pages, index, total_pages, &mut counters)
                .await?;
            debug!("Page {} finished as {:?}", index + 1, report.state);
        }

        // ── Step 4: assemble, then record completion ─────────────────────
        let state = self.replay(&job)?;
        let output_path = spec.output_path();
        write_atomic(&output_path, &pages.assemble(total_pages, &state.completed))?;

        let duration = run_start.elapsed();
        log.append(&Event::JobCompleted {
            job_id: spec.job_id.clone(),
            pages_completed: state.completed.len(),
            pages_failed: state.failed.len(),
            velocity_pages_per_hour: pages_per_hour(counters.completed, duration),
            duration_ms: duration.as_millis() as u64,
            error_count: counters.errors,
            warning_count: counters.warnings,
            finished_at: Utc::now(),
        })?;
        heartbeat.stop().await;

        let state = self.replay(&job)?;
        progress.on_job_complete(state.completed.len(), state.failed.len());
        info!(
            "Finished '{}': {}/{} pages, {} failed, {} via fallback this run → {}",
            spec.job_id,
            state.completed.len(),
            total_pages,
            state.failed.len(),
            counters.fallbacks,
            output_path.display()
        );

        Ok(JobSummary {
            job_id: spec.job_id.clone(),
            output_path,
            total_pages,
            pages_completed: state.completed.len(),
            pages_failed: state.failed.len(),
            pages_pending: state.pending_pages().len(),
            attempted_this_run: counters.completed + counters.failed,
            fallback_this_run: counters.fallbacks,
            resumed,
            status: state.status,
            duration_ms: duration.as_millis() as u64,
        })
    }

    fn replay(&self, job: &JobRef) -> Result<JobState, TranscriberError> {
        Ok(reconstruct(job, &self.config.completion_policy)?)
    }

    async fn process_page(
        &self,
        log: &EventLog,
        source: &Path,
        pages: &PageStore,
        index: usize,
        total_pages: usize,
        counters: &mut RunCounters,
    ) -> Result<PageReport, TranscriberError> {
        let page_num = index + 1;
        let started = Instant::now();
        self.config.progress.on_page_start(page_num, total_pages);

        // pending → verifying
        let candidate = match self.transcribe(source, index).await {
            Ok(text) => text,
            Err(e) => return self.record_failure(log, index, total_pages, e, counters),
        };

        let finding = verify_page(&candidate, &self.config.verification);
        let (text, hallucination_detected, fallback_used, verification_error) = match finding {
            Some(found) if found.triggers_fallback() => {
                // verifying → failed_fallback_pending
                warn!("Page {}: {} ({}); using text-layer fallback", page_num, found.kind(), found);
                self.append_error(log, Severity::Warning, found.kind(), Some(index), found.to_string())?;
                counters.warnings += 1;
                match self.engine.fallback().extract_text(source, index).await {
                    Ok(text) => (text, true, true, Some(found.to_string())),
                    Err(e) => return self.record_failure(log, index, total_pages, e, counters),
                }
            }
            Some(found) => {
                info!("Page {}: {}", page_num, found);
                self.append_error(log, Severity::Warning, found.kind(), Some(index), found.to_string())?;
                counters.warnings += 1;
                (candidate, false, false, Some(found.to_string()))
            }
            None => (candidate, false, false, None),
        };

        // → completed: text on disk first, then the event.
        pages.write(index, &text)?;
        log.append(&Event::PageCompleted {
            job_id: log.job_id().to_string(),
            page_index: index,
            duration_ms: started.elapsed().as_millis() as u64,
            hallucination_detected,
            fallback_used,
            verification_error,
        })?;
        counters.completed += 1;
        if fallback_used {
            counters.fallbacks += 1;
        }
        self.config
            .progress
            .on_page_complete(page_num, total_pages, fallback_used);

        Ok(PageReport {
            page_index: index,
            state: PageState::Completed,
            hallucination_detected,
            fallback_used,
        })
    }

    /// Render and transcribe one page, bounded by the API timeout.
    async fn transcribe(&self, source: &Path, index: usize) -> Result<String, PageError> {
        let image = self
            .engine
            .renderer()
            .render_page(source, index, self.config.dpi())
            .await?;

        let secs = self.config.api_timeout_secs;
        let call = self.engine.vision().transcribe(&image);
        match tokio::time::timeout(Duration::from_secs(secs), call).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(ModelError::Timeout(_))) | Err(_) => Err(PageError::Timeout {
                page: index + 1,
                secs,
            }),
            Ok(Err(ModelError::Service(detail))) => Err(PageError::ModelFailed {
                page: index + 1,
                detail,
            }),
        }
    }

    /// `→ failed`: the page stays pending for the next run.
    fn record_failure(
        &self,
        log: &EventLog,
        index: usize,
        total_pages: usize,
        error: PageError,
        counters: &mut RunCounters,
    ) -> Result<PageReport, TranscriberError> {
        warn!("{}", error);
        log.append(&Event::PageFailed {
            job_id: log.job_id().to_string(),
            page_index: index,
            error_kind: error.kind().to_string(),
            message: error.to_string(),
        })?;
        self.append_error(log, Severity::Error, error.kind(), Some(index), error.to_string())?;
        counters.failed += 1;
        counters.errors += 1;
        self.config
            .progress
            .on_page_error(error.page(), total_pages, &error.to_string());

        Ok(PageReport {
            page_index: index,
            state: PageState::Failed,
            hallucination_detected: false,
            fallback_used: false,
        })
    }

    fn append_error(
        &self,
        log: &EventLog,
        severity: Severity,
        kind: &str,
        page_index: Option<usize>,
        message: String,
    ) -> Result<(), TranscriberError> {
        log.append(&Event::ErrorEvent {
            job_id: log.job_id().to_string(),
            severity,
            error_kind: kind.to_string(),
            page_index,
            message,
        })?;
        Ok(())
    }
}

/// Pages per hour over `elapsed`; zero when no time has passed.
pub fn pages_per_hour(pages: usize, elapsed: Duration) -> f64 {
    let hours = elapsed.as_secs_f64() / 3600.0;
    if hours > 0.0 {
        pages as f64 / hours
    } else {
        0.0
    }
}
