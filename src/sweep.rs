//! Retention sweep over the central log store.
//!
//! A log is deleted only when its replay contains a `job_completed` for the
//! latest run **and** the job's assembled output is still on disk. Each
//! condition is checked on its own and anything ambiguous keeps the log:
//! deleting the history of a job that is still in flight would make it
//! impossible to resume.

use crate::config::CompletionPolicy;
use crate::event_log::{alias_path, EventStore};
use crate::state::{reconstruct, JobRef};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Why a log was left in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum KeepReason {
    NoCompletionEvent,
    OutputMissing { path: PathBuf },
    NoCompletionAndOutputMissing { path: PathBuf },
    OutputPathUnknown,
    Unreadable { detail: String },
    DeleteFailed { detail: String },
}

impl fmt::Display for KeepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepReason::NoCompletionEvent => write!(f, "no job_completed event"),
            KeepReason::OutputMissing { path } => write!(f, "output missing: {}", path.display()),
            KeepReason::NoCompletionAndOutputMissing { path } => {
                write!(f, "no job_completed event and output missing: {}", path.display())
            }
            KeepReason::OutputPathUnknown => write!(f, "output path not recorded"),
            KeepReason::Unreadable { detail } => write!(f, "log unreadable: {detail}"),
            KeepReason::DeleteFailed { detail } => write!(f, "delete failed: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Deleted,
    WouldDelete,
    Kept(KeepReason),
}

impl Decision {
    pub fn is_kept(&self) -> bool {
        matches!(self, Decision::Kept(_))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Deleted => write!(f, "deleted"),
            Decision::WouldDelete => write!(f, "would delete"),
            Decision::Kept(reason) => write!(f, "kept ({reason})"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepEntry {
    pub job_id: String,
    pub log_path: PathBuf,
    pub decision: Decision,
}

/// Full accounting of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub entries: Vec<SweepEntry>,
}

impl SweepReport {
    pub fn found(&self) -> usize {
        self.entries.len()
    }

    /// Deleted, or would be deleted in a dry run.
    pub fn deleted(&self) -> usize {
        self.entries.iter().filter(|e| !e.decision.is_kept()).count()
    }

    pub fn kept(&self) -> usize {
        self.entries.iter().filter(|e| e.decision.is_kept()).count()
    }

    /// Kept because an I/O operation failed rather than by policy.
    pub fn errors(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.decision,
                    Decision::Kept(KeepReason::DeleteFailed { .. } | KeepReason::Unreadable { .. })
                )
            })
            .count()
    }
}

/// Examine every log in `store` and delete those that are safe to delete.
pub fn sweep(store: &EventStore, policy: &CompletionPolicy, dry_run: bool) -> SweepReport {
    let mut report = SweepReport {
        dry_run,
        entries: Vec::new(),
    };
    let logs = match store.list_logs() {
        Ok(logs) => logs,
        Err(e) => {
            warn!("Cannot list {}: {}", store.central_dir().display(), e);
            return report;
        }
    };

    for (job_id, log_path) in logs {
        let decision = decide(&job_id, &log_path, policy, dry_run);
        debug!("{}: {}", job_id, decision);
        report.entries.push(SweepEntry {
            job_id,
            log_path,
            decision,
        });
    }

    info!(
        "Sweep{}: {} found, {} {}, {} kept",
        if dry_run { " (dry run)" } else { "" },
        report.found(),
        report.deleted(),
        if dry_run { "would be deleted" } else { "deleted" },
        report.kept()
    );
    report
}

fn decide(job_id: &str, log_path: &Path, policy: &CompletionPolicy, dry_run: bool) -> Decision {
    let job = JobRef {
        job_id: job_id.to_string(),
        log_path: log_path.to_path_buf(),
        output_dir: None,
    };
    let state = match reconstruct(&job, policy) {
        Ok(state) => state,
        Err(e) => return Decision::Kept(KeepReason::Unreadable { detail: e.to_string() }),
    };

    let completed = state.completion_recorded;
    let Some(output_path) = state.output_path.clone() else {
        return Decision::Kept(if completed {
            KeepReason::OutputPathUnknown
        } else {
            KeepReason::NoCompletionEvent
        });
    };
    let output_present = output_path.is_file();

    match (completed, output_present) {
        (true, true) => {}
        (true, false) => return Decision::Kept(KeepReason::OutputMissing { path: output_path }),
        (false, true) => return Decision::Kept(KeepReason::NoCompletionEvent),
        (false, false) => {
            return Decision::Kept(KeepReason::NoCompletionAndOutputMissing { path: output_path })
        }
    }

    if dry_run {
        return Decision::WouldDelete;
    }

    let alias = state.output_dir.as_deref().map(alias_path);
    // Resolve the alias before the target disappears.
    let alias_is_ours = alias.as_deref().is_some_and(|a| alias_points_at(a, log_path));

    if let Err(e) = fs::remove_file(log_path) {
        return Decision::Kept(KeepReason::DeleteFailed { detail: e.to_string() });
    }
    if let (Some(alias), true) = (alias, alias_is_ours) {
        if let Err(e) = fs::remove_file(&alias) {
            warn!("Deleted {} but not its alias {}: {}", log_path.display(), alias.display(), e);
        }
    }
    info!("Deleted event log for '{}'", job_id);
    Decision::Deleted
}

/// `alias` is a symlink and resolves to `log_path`.
fn alias_points_at(alias: &Path, log_path: &Path) -> bool {
    let is_link = fs::symlink_metadata(alias).is_ok_and(|m| m.file_type().is_symlink());
    if !is_link {
        return false;
    }
    match (fs::canonicalize(alias), fs::canonicalize(log_path)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityPreset;
    use crate::events::Event;
    use chrono::Utc;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: EventStore,
        out_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        Fixture {
            store: EventStore::new(tmp.path().join("central")),
            out_root: tmp.path().join("out"),
            _tmp: tmp,
        }
    }

    /// Write a log for `job`; returns (output_dir, output_path).
    fn job(f: &Fixture, job: &str, completed: bool, write_output: bool) -> (PathBuf, PathBuf) {
        let dir = f.out_root.join(job);
        fs::create_dir_all(&dir).unwrap();
        let output = dir.join(format!("{job}.md"));
        let log = f.store.open(job, Some(&dir)).unwrap();
        log.append(&Event::JobStarted {
            job_id: job.into(),
            source_path: "/src.pdf".into(),
            output_dir: dir.clone(),
            output_path: output.clone(),
            total_pages: 1,
            quality_preset: QualityPreset::Balanced,
            dpi: 150,
            started_at: Utc::now(),
        })
        .unwrap();
        if completed {
            log.append(&Event::JobCompleted {
                job_id: job.into(),
                pages_completed: 1,
                pages_failed: 0,
                velocity_pages_per_hour: 60.0,
                duration_ms: 60_000,
                error_count: 0,
                warning_count: 0,
                finished_at: Utc::now(),
            })
            .unwrap();
        }
        if write_output {
            fs::write(&output, "# done\n").unwrap();
        }
        (dir, output)
    }

    fn decision_for<'a>(report: &'a SweepReport, job: &str) -> &'a Decision {
        &report.entries.iter().find(|e| e.job_id == job).unwrap().decision
    }

    #[test]
    fn completed_without_output_is_kept() {
        let f = fixture();
        let (_, output) = job(&f, "a", true, false);
        let report = sweep(&f.store, &CompletionPolicy::default(), false);
        assert_eq!(
            decision_for(&report, "a"),
            &Decision::Kept(KeepReason::OutputMissing { path: output })
        );
        assert!(f.store.locate("a").exists());
    }

    #[test]
    fn output_without_completion_is_kept() {
        let f = fixture();
        job(&f, "b", false, true);
        let report = sweep(&f.store, &CompletionPolicy::default(), false);
        assert_eq!(decision_for(&report, "b"), &Decision::Kept(KeepReason::NoCompletionEvent));
        assert!(f.store.locate("b").exists());
    }

    #[test]
    fn neither_condition_reports_both() {
        let f = fixture();
        let (_, output) = job(&f, "c", false, false);
        let report = sweep(&f.store, &CompletionPolicy::default(), false);
        assert_eq!(
            decision_for(&report, "c"),
            &Decision::Kept(KeepReason::NoCompletionAndOutputMissing { path: output })
        );
    }

    #[test]
    fn dry_run_reports_without_deleting() {
        let f = fixture();
        let (dir, _) = job(&f, "d", true, true);
        let report = sweep(&f.store, &CompletionPolicy::default(), true);
        assert_eq!(decision_for(&report, "d"), &Decision::WouldDelete);
        assert!(f.store.locate("d").exists());
        assert!(fs::symlink_metadata(alias_path(&dir)).is_ok());
        assert_eq!(report.deleted(), 1);
    }

    #[test]
    fn safe_job_is_deleted_with_its_alias() {
        let f = fixture();
        let (dir, output) = job(&f, "e", true, true);
        let report = sweep(&f.store, &CompletionPolicy::default(), false);
        assert_eq!(decision_for(&report, "e"), &Decision::Deleted);
        assert!(!f.store.locate("e").exists());
        assert!(fs::symlink_metadata(alias_path(&dir)).is_err());
        assert!(output.exists(), "the transcription itself is never touched");
    }

    #[test]
    fn foreign_file_at_alias_path_is_left_alone() {
        let f = fixture();
        let dir = f.out_root.join("g");
        fs::create_dir_all(&dir).unwrap();
        fs::write(alias_path(&dir), "not a link").unwrap();
        // open() refuses to replace the regular file.
        job(&f, "g", true, true);
        let report = sweep(&f.store, &CompletionPolicy::default(), false);
        assert_eq!(decision_for(&report, "g"), &Decision::Deleted);
        assert_eq!(fs::read_to_string(alias_path(&dir)).unwrap(), "not a link");
    }

    #[test]
    fn resumed_job_is_in_flight_again() {
        let f = fixture();
        job(&f, "h", true, true);
        let log = f.store.open("h", None).unwrap();
        log.append(&Event::JobResumed {
            job_id: "h".into(),
            pending_pages: vec![0],
            resumed_at: Utc::now(),
        })
        .unwrap();
        let report = sweep(&f.store, &CompletionPolicy::default(), false);
        assert_eq!(decision_for(&report, "h"), &Decision::Kept(KeepReason::NoCompletionEvent));
    }

    #[test]
    fn totals_cover_every_job() {
        let f = fixture();
        job(&f, "ok", true, true);
        job(&f, "busy", false, false);
        let report = sweep(&f.store, &CompletionPolicy::default(), false);
        assert_eq!(report.found(), 2);
        assert_eq!(report.deleted(), 1);
        assert_eq!(report.kept(), 1);
        assert_eq!(report.errors(), 0);
    }

    #[test]
    fn missing_store_is_an_empty_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let report = sweep(&EventStore::new(tmp.path().join("nope")), &CompletionPolicy::default(), false);
        assert_eq!(report.found(), 0);
    }
}
