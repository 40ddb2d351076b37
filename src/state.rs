//! Replay a job's history into a [`JobState`].
//!
//! State is never stored: every query folds the job's event log from the
//! first line. Jobs written before event logs existed only have a legacy
//! `.pdf-progress/state.json` snapshot; [`StateSource::probe`] picks exactly
//! one of the two per job and never mixes them.
//!
//! The fold is pure. It reads no clock, so the same lines under the same
//! [`CompletionPolicy`] always produce the same state.

use crate::config::CompletionPolicy;
use crate::error::TelemetryError;
use crate::event_log::{self, alias_path, EventStore};
use crate::events::{Event, Severity};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Directory of the pre-event-log progress snapshot, inside the output dir.
pub const LEGACY_STATE_DIR: &str = ".pdf-progress";
/// File name of the legacy snapshot.
pub const LEGACY_STATE_FILE: &str = "state.json";

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    /// Neither an event log nor a snapshot exists.
    #[default]
    Unknown,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }
}

/// Where a [`JobState`] was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum StateSource {
    EventLog(PathBuf),
    Snapshot(PathBuf),
    Missing,
}

impl StateSource {
    /// Choose the source for a job by file existence: the event log wins.
    pub fn probe(log_path: &Path, output_dir: Option<&Path>) -> Self {
        if log_path.exists() {
            return StateSource::EventLog(log_path.to_path_buf());
        }
        if let Some(dir) = output_dir {
            let snapshot = legacy_snapshot_path(dir);
            if snapshot.is_file() {
                return StateSource::Snapshot(snapshot);
            }
        }
        StateSource::Missing
    }
}

/// Path of the legacy snapshot for an output directory.
pub fn legacy_snapshot_path(output_dir: &Path) -> PathBuf {
    output_dir.join(LEGACY_STATE_DIR).join(LEGACY_STATE_FILE)
}

/// Everything needed to find a job's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub job_id: String,
    /// Central log path (may not exist yet).
    pub log_path: PathBuf,
    /// The job's output directory, when known.
    pub output_dir: Option<PathBuf>,
}

impl JobRef {
    pub fn new(store: &EventStore, job_id: &str, output_dir: Option<PathBuf>) -> Self {
        Self {
            job_id: job_id.to_string(),
            log_path: store.locate(job_id),
            output_dir,
        }
    }

    /// A job found through the `events.jsonl` alias of its output directory.
    ///
    /// The alias itself is used as the log path, so readers never need to
    /// know the central layout. The job id is the alias target's file stem;
    /// without a link (legacy snapshot only) it is derived from the
    /// directory name.
    pub fn from_output_dir(output_dir: &Path) -> Self {
        let alias = alias_path(output_dir);
        let job_id = fs::read_link(&alias)
            .ok()
            .and_then(|target| target.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| {
                let name = output_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                event_log::job_id_for(&name)
            });
        Self {
            job_id,
            log_path: alias,
            output_dir: Some(output_dir.to_path_buf()),
        }
    }
}

/// Derived view of a job, rebuilt on every query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub total_pages: usize,
    pub completed: BTreeSet<usize>,
    pub failed: BTreeSet<usize>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_cpu_percent: f32,
    pub last_memory_mb: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Start of the run in flight: `job_started` or the latest `job_resumed`.
    pub run_started_at: Option<DateTime<Utc>>,
    /// Running time of earlier runs. Gaps between runs are not counted.
    pub closed_runs_ms: u64,

    pub source_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub quality_preset: Option<String>,
    /// A `job_completed` belongs to the latest run (cleared by `job_resumed`).
    pub completion_recorded: bool,
    /// `pages_failed` as reported by the latest `job_completed`.
    pub pages_failed_reported: Option<usize>,
    pub resume_count: usize,
    pub fallback_pages: usize,
    pub error_count: usize,
    pub warning_count: usize,
    /// Log lines that failed to parse and were skipped.
    pub corrupt_lines: usize,
    pub source: StateSource,
}

impl JobState {
    pub fn empty(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Unknown,
            total_pages: 0,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            last_heartbeat_at: None,
            last_cpu_percent: 0.0,
            last_memory_mb: 0,
            started_at: None,
            finished_at: None,
            run_started_at: None,
            closed_runs_ms: 0,
            source_path: None,
            output_dir: None,
            output_path: None,
            quality_preset: None,
            completion_recorded: false,
            pages_failed_reported: None,
            resume_count: 0,
            fallback_pages: 0,
            error_count: 0,
            warning_count: 0,
            corrupt_lines: 0,
            source: StateSource::Missing,
        }
    }

    /// Pages still to transcribe: every page not completed, failed ones included.
    pub fn pending_pages(&self) -> BTreeSet<usize> {
        (0..self.total_pages)
            .filter(|p| !self.completed.contains(p))
            .collect()
    }

    /// Time spent running across every run, up to `now` for the open one.
    pub fn running_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at?;
        let open = self
            .run_started_at
            .and_then(|start| (self.finished_at.unwrap_or(now) - start).to_std().ok())
            .unwrap_or_default();
        Some(Duration::from_millis(self.closed_runs_ms) + open)
    }

    pub fn progress_fraction(&self) -> f64 {
        if self.total_pages == 0 {
            0.0
        } else {
            self.completed.len() as f64 / self.total_pages as f64
        }
    }

    /// Apply one event. Events whose job id does not match are dropped.
    pub fn apply(&mut self, event: &Event, policy: &CompletionPolicy) {
        if event.job_id() != self.job_id {
            debug!("Ignoring {} for job '{}' in log of '{}'", event.kind(), event.job_id(), self.job_id);
            return;
        }
        match event {
            Event::JobStarted {
                source_path,
                output_dir,
                output_path,
                total_pages,
                quality_preset,
                started_at,
                ..
            } => {
                // A fresh start is a new identity for the same id.
                let source = std::mem::replace(&mut self.source, StateSource::Missing);
                *self = JobState {
                    corrupt_lines: self.corrupt_lines,
                    source,
                    ..JobState::empty(&self.job_id)
                };
                self.total_pages = *total_pages;
                self.started_at = Some(*started_at);
                self.run_started_at = Some(*started_at);
                self.source_path = Some(source_path.clone());
                self.output_dir = Some(output_dir.clone());
                self.output_path = Some(output_path.clone());
                self.quality_preset = Some(quality_preset.to_string());
                self.status = JobStatus::Running;
            }
            Event::JobResumed { resumed_at, .. } => {
                // An interrupted run lasted until its last heartbeat.
                if let Some(start) = self.run_started_at.take() {
                    let ran = self
                        .last_heartbeat_at
                        .and_then(|hb| (hb - start).to_std().ok())
                        .unwrap_or_default();
                    self.closed_runs_ms += ran.as_millis() as u64;
                }
                self.run_started_at = Some(*resumed_at);
                self.status = JobStatus::Running;
                self.finished_at = None;
                self.completion_recorded = false;
                self.resume_count += 1;
            }
            Event::PageCompleted {
                page_index,
                fallback_used,
                ..
            } => {
                self.failed.remove(page_index);
                if self.completed.insert(*page_index) && *fallback_used {
                    self.fallback_pages += 1;
                }
            }
            Event::PageFailed { page_index, .. } => {
                if !self.completed.contains(page_index) {
                    self.failed.insert(*page_index);
                }
            }
            Event::Heartbeat {
                cpu_percent,
                memory_mb,
                emitted_at,
                ..
            } => {
                self.last_heartbeat_at = Some(*emitted_at);
                self.last_cpu_percent = *cpu_percent;
                self.last_memory_mb = *memory_mb;
            }
            Event::ErrorEvent { severity, .. } => match severity {
                Severity::Error => self.error_count += 1,
                Severity::Warning => self.warning_count += 1,
            },
            Event::JobCompleted {
                pages_completed,
                pages_failed,
                duration_ms,
                finished_at,
                ..
            } => {
                if self.run_started_at.take().is_some() {
                    self.closed_runs_ms += duration_ms;
                }
                self.status = if policy.is_success(*pages_completed, *pages_failed) {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                self.finished_at = Some(*finished_at);
                self.completion_recorded = true;
                self.pages_failed_reported = Some(*pages_failed);
            }
        }
    }
}

/// Fold an ordered event sequence into a state.
pub fn fold_events<I>(job_id: &str, events: I, policy: &CompletionPolicy) -> JobState
where
    I: IntoIterator<Item = Event>,
{
    let mut state = JobState::empty(job_id);
    for event in events {
        state.apply(&event, policy);
    }
    state
}

/// Rebuild a job's state from whichever source exists.
pub fn reconstruct(job: &JobRef, policy: &CompletionPolicy) -> Result<JobState, TelemetryError> {
    let source = StateSource::probe(&job.log_path, job.output_dir.as_deref());
    let mut state = match &source {
        StateSource::EventLog(path) => match event_log::read_events(path)? {
            Some(mut reader) => {
                let mut state = fold_events(&job.job_id, reader.by_ref(), policy);
                state.corrupt_lines = reader.skipped();
                state
            }
            // Removed between probe and open.
            None => JobState::empty(&job.job_id),
        },
        StateSource::Snapshot(path) => read_snapshot(&job.job_id, path),
        StateSource::Missing => JobState::empty(&job.job_id),
    };
    state.source = source;
    Ok(state)
}

// ── Legacy snapshot ──────────────────────────────────────────────────────

/// Whole-state JSON written by releases before the event log.
///
/// Page numbers are 1-based.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacySnapshot {
    pub pdf_source: String,
    pub total_pages: usize,
    #[serde(default)]
    pub completed_pages: Vec<usize>,
    #[serde(default)]
    pub failed_pages: Vec<usize>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl LegacySnapshot {
    pub fn into_state(self, job_id: &str) -> JobState {
        let mut state = JobState::empty(job_id);
        state.total_pages = self.total_pages;
        state.completed = self
            .completed_pages
            .iter()
            .filter(|&&p| p >= 1)
            .map(|p| p - 1)
            .collect();
        state.failed = self
            .failed_pages
            .iter()
            .filter(|&&p| p >= 1)
            .map(|p| p - 1)
            .filter(|p| !state.completed.contains(p))
            .collect();
        state.started_at = self.started_at.as_deref().and_then(parse_legacy_timestamp);
        state.run_started_at = state.started_at;
        state.last_heartbeat_at = self.last_updated.as_deref().and_then(parse_legacy_timestamp);
        state.source_path = Some(PathBuf::from(&self.pdf_source));
        state.quality_preset = self.quality;
        state.status = if self.total_pages > 0 && state.completed.len() >= self.total_pages {
            state.finished_at = state.last_heartbeat_at;
            JobStatus::Completed
        } else {
            JobStatus::Running
        };
        state
    }
}

fn read_snapshot(job_id: &str, path: &Path) -> JobState {
    let parsed = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str::<LegacySnapshot>(&text).map_err(|e| e.to_string()));
    match parsed {
        Ok(snapshot) => snapshot.into_state(job_id),
        Err(e) => {
            warn!("Unreadable legacy snapshot {}: {}", path.display(), e);
            JobState::empty(job_id)
        }
    }
}

/// Snapshots stored naive ISO-8601 local timestamps; RFC 3339 is accepted too.
fn parse_legacy_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
