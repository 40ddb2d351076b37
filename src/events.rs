//! Typed telemetry records.
//!
//! Every line of a job's event log is one [`Event`] encoded as a JSON object
//! whose `event_type` field names the variant:
//!
//! ```text
//! {"event_type":"job_started","job_id":"paper","total_pages":3,...}
//! {"event_type":"page_completed","job_id":"paper","page_index":0,...}
//! {"event_type":"heartbeat","job_id":"paper","cpu_percent":10.0,...}
//! ```
//!
//! Events are immutable once written. Page indices are 0-based.

use crate::config::QualityPreset;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One record in a job's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    /// First event of a job identity.
    JobStarted {
        job_id: String,
        source_path: PathBuf,
        output_dir: PathBuf,
        /// Final assembled Markdown; the sweeper checks it before deleting.
        output_path: PathBuf,
        total_pages: usize,
        quality_preset: QualityPreset,
        dpi: u32,
        started_at: DateTime<Utc>,
    },

    /// A later run picking up an existing job.
    JobResumed {
        job_id: String,
        pending_pages: Vec<usize>,
        resumed_at: DateTime<Utc>,
    },

    PageCompleted {
        job_id: String,
        page_index: usize,
        duration_ms: u64,
        hallucination_detected: bool,
        fallback_used: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verification_error: Option<String>,
    },

    PageFailed {
        job_id: String,
        page_index: usize,
        error_kind: String,
        message: String,
    },

    Heartbeat {
        job_id: String,
        cpu_percent: f32,
        memory_mb: u64,
        pages_since_last: usize,
        emitted_at: DateTime<Utc>,
    },

    #[serde(rename = "error")]
    ErrorEvent {
        job_id: String,
        severity: Severity,
        error_kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_index: Option<usize>,
        message: String,
    },

    JobCompleted {
        job_id: String,
        pages_completed: usize,
        pages_failed: usize,
        velocity_pages_per_hour: f64,
        duration_ms: u64,
        #[serde(default)]
        error_count: usize,
        #[serde(default)]
        warning_count: usize,
        finished_at: DateTime<Utc>,
    },
}

impl Event {
    pub fn job_id(&self) -> &str {
        match self {
            Event::JobStarted { job_id, .. }
            | Event::JobResumed { job_id, .. }
            | Event::PageCompleted { job_id, .. }
            | Event::PageFailed { job_id, .. }
            | Event::Heartbeat { job_id, .. }
            | Event::ErrorEvent { job_id, .. }
            | Event::JobCompleted { job_id, .. } => job_id,
        }
    }

    /// Wire name of the variant, as written in `event_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::JobStarted { .. } => "job_started",
            Event::JobResumed { .. } => "job_resumed",
            Event::PageCompleted { .. } => "page_completed",
            Event::PageFailed { .. } => "page_failed",
            Event::Heartbeat { .. } => "heartbeat",
            Event::ErrorEvent { .. } => "error",
            Event::JobCompleted { .. } => "job_completed",
        }
    }
}

/// Severity of an [`Event::ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_and_field_names_on_the_wire() {
        let ev = Event::PageFailed {
            job_id: "paper".into(),
            page_index: 2,
            error_kind: "timeout".into(),
            message: "no response".into(),
        };
        let line = serde_json::to_string(&ev).unwrap();
        assert!(line.starts_with(r#"{"event_type":"page_failed""#), "got: {line}");
        assert!(line.contains(r#""page_index":2"#));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn error_event_uses_short_tag() {
        let ev = Event::ErrorEvent {
            job_id: "paper".into(),
            severity: Severity::Warning,
            error_kind: "content_merged".into(),
            page_index: None,
            message: "merged".into(),
        };
        let line = serde_json::to_string(&ev).unwrap();
        assert!(line.contains(r#""event_type":"error""#), "got: {line}");
        assert!(line.contains(r#""severity":"warning""#));
        assert!(!line.contains("page_index"));
        assert_eq!(ev.kind(), "error");
    }

    #[test]
    fn parses_completed_without_optional_counters() {
        let line = r#"{"event_type":"job_completed","job_id":"a","pages_completed":2,"pages_failed":1,"velocity_pages_per_hour":40.0,"duration_ms":180000,"finished_at":"2025-01-01T00:03:00Z"}"#;
        let ev: Event = serde_json::from_str(line).unwrap();
        match ev {
            Event::JobCompleted {
                pages_failed,
                error_count,
                ..
            } => {
                assert_eq!(pages_failed, 1);
                assert_eq!(error_count, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let line = r#"{"event_type":"page_exploded","job_id":"a"}"#;
        assert!(serde_json::from_str::<Event>(line).is_err());
    }
}
