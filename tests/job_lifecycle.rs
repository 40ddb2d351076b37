//! Job lifecycle integration tests.
//!
//! A job runs against in-memory fakes for the page renderer, the vision
//! model and the text-layer fallback, so these tests need neither pdfium
//! nor an API key. Everything written goes to a temp directory.

use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use pdf_transcriber::dashboard::{load_views, DisplayStatus};
use pdf_transcriber::event_log::read_events;
use pdf_transcriber::{
    reconstruct, sweep, CompletionPolicy, DashboardConfig, Decision, Event, EventStore, FallbackExtractor, JobConfig,
    JobRef, JobRunner, JobSpec, JobStatus, KeepReason, ModelError, PageError, PageRenderer, Severity,
    TelemetryConfig, TranscriberError, TranscriptionEngine, VisionModel,
};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Renders page `i` as a `(i + 1) × 1` image so the model can tell pages apart.
struct FakeRenderer {
    pages: usize,
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn page_count(&self, _path: &Path) -> Result<usize, TranscriberError> {
        Ok(self.pages)
    }

    async fn render_page(&self, _path: &Path, index: usize, _dpi: u32) -> Result<DynamicImage, PageError> {
        Ok(DynamicImage::new_rgb8(index as u32 + 1, 1))
    }
}

#[derive(Clone)]
enum Reply {
    Text,
    Loop,
    Fail,
    /// Fail on the first call for this page, succeed afterwards.
    FailOnce,
    Sleep(Duration),
}

#[derive(Default)]
struct FakeModel {
    replies: HashMap<usize, Reply>,
    calls: Mutex<HashMap<usize, usize>>,
}

impl FakeModel {
    fn with(replies: &[(usize, Reply)]) -> Self {
        Self {
            replies: replies.iter().cloned().collect(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls_for(&self, index: usize) -> usize {
        self.calls.lock().unwrap().get(&index).copied().unwrap_or(0)
    }
}

fn page_text(index: usize) -> String {
    format!("## Section {}\n\nBody text transcribed from page number {}.", index + 1, index + 1)
}

#[async_trait]
impl VisionModel for FakeModel {
    async fn transcribe(&self, image: &DynamicImage) -> Result<String, ModelError> {
        let index = image.dimensions().0 as usize - 1;
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(index).or_insert(0);
            *n += 1;
            *n
        };
        match self.replies.get(&index).cloned().unwrap_or(Reply::Text) {
            Reply::Text => Ok(page_text(index)),
            Reply::Loop => Ok("the proof of the theorem ".repeat(12)),
            Reply::Fail => Err(ModelError::Service("HTTP 503 Service Unavailable".into())),
            Reply::FailOnce if call == 1 => Err(ModelError::Service("HTTP 502 Bad Gateway".into())),
            Reply::FailOnce => Ok(page_text(index)),
            Reply::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(page_text(index))
            }
        }
    }
}

#[derive(Default)]
struct FakeFallback {
    calls: AtomicUsize,
}

#[async_trait]
impl FallbackExtractor for FakeFallback {
    async fn extract_text(&self, _path: &Path, index: usize) -> Result<String, PageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("plain text layer of page {}", index + 1))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    _tmp: tempfile::TempDir,
    pdf: PathBuf,
    out_root: PathBuf,
    telemetry: PathBuf,
}

impl Harness {
    fn new(name: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let pdf = tmp.path().join(format!("{name}.pdf"));
        fs::write(&pdf, b"%PDF-1.7\n% fake document for tests\n").unwrap();
        Self {
            pdf,
            out_root: tmp.path().join("output"),
            telemetry: tmp.path().join("telemetry"),
            _tmp: tmp,
        }
    }

    fn config(&self) -> JobConfig {
        self.config_with(|b| b)
    }

    fn config_with(
        &self,
        f: impl FnOnce(pdf_transcriber::JobConfigBuilder) -> pdf_transcriber::JobConfigBuilder,
    ) -> JobConfig {
        let builder = JobConfig::builder().telemetry(TelemetryConfig::with_central_dir(&self.telemetry));
        f(builder).build().unwrap()
    }

    fn store(&self) -> EventStore {
        EventStore::new(&self.telemetry)
    }

    fn spec(&self) -> JobSpec {
        JobSpec::for_source(&self.pdf, &self.out_root)
    }

    fn events(&self) -> Vec<Event> {
        let path = self.store().locate(&self.spec().job_id);
        read_events(&path).unwrap().expect("log exists").collect()
    }

    fn state(&self) -> pdf_transcriber::JobState {
        let spec = self.spec();
        let job = JobRef::new(&self.store(), &spec.job_id, Some(spec.output_dir));
        reconstruct(&job, &CompletionPolicy::default()).unwrap()
    }
}

fn engine(pages: usize, model: Arc<FakeModel>, fallback: Arc<FakeFallback>) -> TranscriptionEngine {
    TranscriptionEngine::new(Arc::new(FakeRenderer { pages }), model, fallback)
}

fn count(events: &[Event], kind: &str) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn clean_run_records_full_lifecycle() {
    let h = Harness::new("Clean Paper");
    let model = Arc::new(FakeModel::default());
    let engine = engine(3, model.clone(), Arc::new(FakeFallback::default()));
    let config = h.config();

    let summary = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();

    assert_eq!(summary.job_id, "clean-paper");
    assert_eq!(summary.pages_completed, 3);
    assert_eq!(summary.pages_failed, 0);
    assert_eq!(summary.pages_pending, 0);
    assert!(!summary.resumed);
    assert_eq!(summary.status, JobStatus::Completed);

    let events = h.events();
    assert_eq!(events.first().map(Event::kind), Some("job_started"));
    assert_eq!(events.last().map(Event::kind), Some("job_completed"));
    assert_eq!(count(&events, "page_completed"), 3);

    let doc = fs::read_to_string(&summary.output_path).unwrap();
    let first = doc.find("Section 1").unwrap();
    let third = doc.find("Section 3").unwrap();
    assert!(first < third);
    assert!(doc.ends_with('\n'));

    // The output directory carries a link back to the central log.
    let alias = h.spec().output_dir.join("events.jsonl");
    assert_eq!(
        fs::canonicalize(alias).unwrap(),
        fs::canonicalize(h.store().locate("clean-paper")).unwrap()
    );
}

#[tokio::test]
async fn failed_page_is_retried_on_the_next_run_only() {
    let h = Harness::new("flaky");
    let model = Arc::new(FakeModel::with(&[(1, Reply::FailOnce)]));
    let engine = engine(3, model.clone(), Arc::new(FakeFallback::default()));
    let config = h.config();
    let runner = JobRunner::new(&engine, &config);

    let first = runner.run(&h.spec()).await.unwrap();
    assert_eq!(first.pages_completed, 2);
    assert_eq!(first.pages_failed, 1);
    assert_eq!(first.status, JobStatus::Completed);
    // No retry within the run.
    assert_eq!(model.calls_for(1), 1);

    let events = h.events();
    assert_eq!(count(&events, "page_failed"), 1);
    let failure_errors = events
        .iter()
        .filter(|e| matches!(e, Event::ErrorEvent { severity: Severity::Error, .. }))
        .count();
    assert_eq!(failure_errors, 1);

    let state = h.state();
    assert_eq!(state.pending_pages(), BTreeSet::from([1]));
    let doc = fs::read_to_string(&first.output_path).unwrap();
    assert!(doc.contains("<!-- page 2 not transcribed -->"));

    let second = runner.run(&h.spec()).await.unwrap();
    assert!(second.resumed);
    assert_eq!(second.attempted_this_run, 1);
    assert_eq!(second.pages_completed, 3);
    assert_eq!(second.pages_failed, 0);
    assert_eq!(model.calls_for(0), 1);
    assert_eq!(model.calls_for(1), 2);

    let events = h.events();
    assert_eq!(count(&events, "job_started"), 1);
    assert_eq!(count(&events, "job_resumed"), 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::JobResumed { pending_pages, .. } if pending_pages == &vec![1])));

    let state = h.state();
    assert_eq!(state.completed, BTreeSet::from([0, 1, 2]));
    assert!(state.failed.is_empty());
    assert_eq!(state.resume_count, 1);
    assert!(!fs::read_to_string(&second.output_path).unwrap().contains("not transcribed"));
}

#[tokio::test]
async fn hallucinated_page_falls_back_to_text_layer() {
    let h = Harness::new("looping");
    let model = Arc::new(FakeModel::with(&[(1, Reply::Loop)]));
    let fallback = Arc::new(FakeFallback::default());
    let engine = engine(2, model, fallback.clone());
    let config = h.config();

    let summary = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();
    assert_eq!(summary.pages_completed, 2);
    assert_eq!(summary.fallback_this_run, 1);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);

    let events = h.events();
    let flagged: Vec<&Event> = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                Event::PageCompleted {
                    hallucination_detected: true,
                    fallback_used: true,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(flagged.len(), 1);
    assert!(matches!(flagged[0], Event::PageCompleted { page_index: 1, .. }));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ErrorEvent { severity: Severity::Warning, error_kind, page_index: Some(1), .. }
            if error_kind == "repetition_hallucination"
    )));
    assert_eq!(count(&events, "page_failed"), 0);

    let doc = fs::read_to_string(&summary.output_path).unwrap();
    assert!(doc.contains("plain text layer of page 2"));
    assert!(!doc.contains("the proof of the theorem the proof"));
    assert_eq!(h.state().fallback_pages, 1);
}

#[tokio::test]
async fn slow_model_call_times_out_as_page_failure() {
    let h = Harness::new("slow");
    let model = Arc::new(FakeModel::with(&[(0, Reply::Sleep(Duration::from_secs(5)))]));
    let engine = engine(2, model, Arc::new(FakeFallback::default()));
    let config = h.config_with(|b| b.api_timeout_secs(1));

    let summary = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();
    assert_eq!(summary.pages_completed, 1);
    assert_eq!(summary.pages_failed, 1);

    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::PageFailed { page_index: 0, error_kind, .. } if error_kind == "timeout"
    )));
}

#[tokio::test]
async fn model_errors_do_not_abort_the_job() {
    let h = Harness::new("broken");
    let model = Arc::new(FakeModel::with(&[(0, Reply::Fail), (2, Reply::Fail)]));
    let engine = engine(3, model, Arc::new(FakeFallback::default()));
    let config = h.config_with(|b| b.completion_policy(CompletionPolicy::FailOnAnyPageFailure));

    let summary = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();
    assert_eq!(summary.pages_completed, 1);
    assert_eq!(summary.pages_failed, 2);
    assert_eq!(summary.status, JobStatus::Failed);

    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::JobCompleted { pages_completed: 1, pages_failed: 2, error_count: 2, .. }
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeats_continue_during_a_slow_page() {
    let h = Harness::new("heartbeat");
    let model = Arc::new(FakeModel::with(&[(1, Reply::Sleep(Duration::from_millis(700)))]));
    let engine = engine(3, model, Arc::new(FakeFallback::default()));
    let config = h.config_with(|b| b.heartbeat_interval(Duration::from_millis(100)));

    JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();

    let events = h.events();
    let completed_at = events.iter().position(|e| e.kind() == "job_completed").unwrap();
    let heartbeats: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind() == "heartbeat")
        .map(|(i, _)| i)
        .collect();
    assert!(heartbeats.len() >= 3, "expected heartbeats during the slow page, got {}", heartbeats.len());
    // The emitter is stopped right after completion is recorded.
    assert!(heartbeats.iter().all(|&i| i < completed_at || i == completed_at + 1));

    assert!(h.state().last_heartbeat_at.is_some());
}

#[tokio::test]
async fn interrupted_run_never_records_completion_and_resumes() {
    let h = Harness::new("interrupted");
    let model = Arc::new(FakeModel::with(&[(1, Reply::Sleep(Duration::from_secs(30)))]));
    let engine = engine(3, model, Arc::new(FakeFallback::default()));
    let config = h.config();

    // Dropping the run future is what Ctrl-C does in the binary.
    let cut = tokio::time::timeout(Duration::from_millis(300), JobRunner::new(&engine, &config).run(&h.spec())).await;
    assert!(cut.is_err());

    let events = h.events();
    assert_eq!(count(&events, "job_completed"), 0);
    let state = h.state();
    assert_eq!(state.status, JobStatus::Running);
    assert_eq!(state.completed, BTreeSet::from([0]));

    // A later run with a healthy model picks up pages 1 and 2 only.
    let healthy = Arc::new(FakeModel::default());
    let engine = TranscriptionEngine::new(
        Arc::new(FakeRenderer { pages: 3 }),
        healthy.clone(),
        Arc::new(FakeFallback::default()),
    );
    let summary = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();
    assert!(summary.resumed);
    assert_eq!(summary.attempted_this_run, 2);
    assert_eq!(healthy.calls_for(0), 0);
    assert_eq!(summary.pages_completed, 3);
}

#[tokio::test]
async fn no_resume_starts_a_fresh_identity() {
    let h = Harness::new("restart");
    let model = Arc::new(FakeModel::default());
    let engine = engine(2, model.clone(), Arc::new(FakeFallback::default()));

    let config = h.config();
    JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();

    let config = h.config_with(|b| b.resume(false));
    let summary = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();
    assert!(!summary.resumed);
    assert_eq!(summary.attempted_this_run, 2);
    assert_eq!(model.calls_for(0), 2);
    assert_eq!(count(&h.events(), "job_started"), 2);
    assert_eq!(h.state().completed.len(), 2);
}

#[tokio::test]
async fn torn_tail_replays_like_the_clean_prefix() {
    let h = Harness::new("torn");
    let engine = engine(4, Arc::new(FakeModel::default()), Arc::new(FakeFallback::default()));
    let config = h.config();
    JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();

    let clean = h.state();
    let log = h.store().locate("torn");
    let mut bytes = fs::read(&log).unwrap();
    bytes.extend_from_slice(br#"{"event_type":"page_completed","job_id":"torn","page_in"#);
    fs::write(&log, bytes).unwrap();

    let torn = h.state();
    assert_eq!(torn.corrupt_lines, 1);
    assert_eq!(torn.completed, clean.completed);
    assert_eq!(torn.failed, clean.failed);
    assert_eq!(torn.status, clean.status);
    assert_eq!(torn.finished_at, clean.finished_at);

    // The next append starts on a fresh line, so the torn line stays the only casualty.
    let again = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();
    assert!(again.resumed);
    let after = h.state();
    assert_eq!(after.corrupt_lines, 1);
    assert_eq!(after.resume_count, 1);
    assert_eq!(after.status, JobStatus::Completed);
}

#[tokio::test]
async fn dashboard_sees_finished_run_without_writing() {
    let h = Harness::new("watched");
    let engine = engine(3, Arc::new(FakeModel::with(&[(2, Reply::Fail)])), Arc::new(FakeFallback::default()));
    let config = h.config();
    JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();

    let log = h.store().locate("watched");
    let before = fs::read(&log).unwrap();

    let views = load_views(&DashboardConfig::new(&h.out_root), &CompletionPolicy::default(), chrono::Utc::now());
    assert_eq!(views.len(), 1);
    let view = &views[0];
    assert_eq!(view.job_id(), "watched");
    assert_eq!(view.display_status, DisplayStatus::Completed);
    assert_eq!(view.state.completed.len(), 2);
    assert_eq!(view.state.total_pages, 3);

    assert_eq!(fs::read(&log).unwrap(), before);
}

#[tokio::test]
async fn sweep_after_run_requires_the_output_file() {
    let h = Harness::new("swept");
    let engine = engine(2, Arc::new(FakeModel::default()), Arc::new(FakeFallback::default()));
    let config = h.config();
    let summary = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap();

    fs::rename(&summary.output_path, summary.output_path.with_extension("bak")).unwrap();
    let report = sweep(&h.store(), &CompletionPolicy::default(), false);
    assert_eq!(
        report.entries[0].decision,
        Decision::Kept(KeepReason::OutputMissing {
            path: summary.output_path.clone()
        })
    );
    assert!(h.store().locate("swept").exists());

    fs::rename(summary.output_path.with_extension("bak"), &summary.output_path).unwrap();
    let dry = sweep(&h.store(), &CompletionPolicy::default(), true);
    assert_eq!(dry.entries[0].decision, Decision::WouldDelete);
    assert!(h.store().locate("swept").exists());

    let report = sweep(&h.store(), &CompletionPolicy::default(), false);
    assert_eq!(report.entries[0].decision, Decision::Deleted);
    assert!(!h.store().locate("swept").exists());
    assert!(fs::symlink_metadata(h.spec().output_dir.join("events.jsonl")).is_err());
    assert!(summary.output_path.exists());
}

#[tokio::test]
async fn not_a_pdf_is_rejected_before_logging() {
    let h = Harness::new("bogus");
    fs::write(&h.pdf, b"hello").unwrap();
    let engine = engine(1, Arc::new(FakeModel::default()), Arc::new(FakeFallback::default()));
    let config = h.config();

    let err = JobRunner::new(&engine, &config).run(&h.spec()).await.unwrap_err();
    assert!(matches!(err, TranscriberError::NotAPdf { .. }), "got: {err}");
    assert!(!h.store().locate("bogus").exists());
}
