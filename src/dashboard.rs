//! Read-only view over every job under an output root.
//!
//! Each refresh rediscovers jobs and replays their logs from scratch, so the
//! view can never drift from what is on disk. Nothing here writes to a log.
//! Terminal handling lives in the binary; this module only turns job states
//! into display rows and key presses into view transitions.

use crate::config::{CompletionPolicy, DashboardConfig};
use crate::event_log::alias_path;
use crate::state::{legacy_snapshot_path, reconstruct, JobRef, JobState, JobStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Job directories under `output_root`: those holding an event-log alias or
/// a legacy snapshot. Sorted by path.
pub fn discover_jobs(output_root: &Path) -> Vec<JobRef> {
    let entries = match fs::read_dir(output_root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list {}: {}", output_root.display(), e);
            return Vec::new();
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|dir| {
            // symlink_metadata: a dangling alias still marks a job directory.
            fs::symlink_metadata(alias_path(dir)).is_ok() || legacy_snapshot_path(dir).is_file()
        })
        .collect();
    dirs.sort();
    dirs.iter().map(|dir| JobRef::from_output_dir(dir)).collect()
}

/// Status as shown to the user; `Stale` only ever replaces `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Running,
    Stale,
    Completed,
    Failed,
    Unknown,
}

impl DisplayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayStatus::Running => "running",
            DisplayStatus::Stale => "stale",
            DisplayStatus::Completed => "completed",
            DisplayStatus::Failed => "failed",
            DisplayStatus::Unknown => "unknown",
        }
    }

    fn rank(self) -> u8 {
        match self {
            DisplayStatus::Running => 0,
            DisplayStatus::Stale => 1,
            DisplayStatus::Completed | DisplayStatus::Failed => 2,
            DisplayStatus::Unknown => 3,
        }
    }
}

/// One job with its derived display fields, computed against `now`.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub state: JobState,
    pub display_status: DisplayStatus,
    pub progress: f64,
    /// Pages per hour; zero when nothing is done or no time has passed.
    pub velocity: f64,
    pub eta: Option<Duration>,
    pub elapsed: Option<Duration>,
    pub stale: bool,
}

impl JobView {
    pub fn from_state(state: JobState, now: DateTime<Utc>, stale_threshold: Duration) -> Self {
        let elapsed = state.running_time(now);
        let velocity = match elapsed {
            Some(d) if d.as_secs_f64() > 0.0 => state.completed.len() as f64 / (d.as_secs_f64() / 3600.0),
            _ => 0.0,
        };
        let remaining = state.total_pages.saturating_sub(state.completed.len());
        let eta = if velocity > 0.0 && remaining > 0 {
            Some(Duration::from_secs_f64(remaining as f64 / velocity * 3600.0))
        } else {
            None
        };
        let stale = is_stale(&state, now, stale_threshold);
        let display_status = match state.status {
            JobStatus::Running if stale => DisplayStatus::Stale,
            JobStatus::Running => DisplayStatus::Running,
            JobStatus::Completed => DisplayStatus::Completed,
            JobStatus::Failed => DisplayStatus::Failed,
            JobStatus::Unknown => DisplayStatus::Unknown,
        };
        Self {
            progress: state.progress_fraction(),
            state,
            display_status,
            velocity,
            eta,
            elapsed,
            stale,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.state.job_id
    }
}

/// A running job whose last sign of life is strictly older than `threshold`.
pub fn is_stale(state: &JobState, now: DateTime<Utc>, threshold: Duration) -> bool {
    if state.status != JobStatus::Running {
        return false;
    }
    let Some(last_seen) = state.last_heartbeat_at.or(state.started_at) else {
        return false;
    };
    match (now - last_seen).to_std() {
        Ok(age) => age > threshold,
        // Heartbeat from the future (clock skew): alive.
        Err(_) => false,
    }
}

/// Replay every discovered job and sort for display.
pub fn load_views(config: &DashboardConfig, policy: &CompletionPolicy, now: DateTime<Utc>) -> Vec<JobView> {
    let mut views: Vec<JobView> = discover_jobs(&config.output_root)
        .iter()
        .map(|job| {
            let state = reconstruct(job, policy).unwrap_or_else(|e| {
                warn!("Cannot read history of '{}': {}", job.job_id, e);
                JobState::empty(&job.job_id)
            });
            JobView::from_state(state, now, config.stale_threshold)
        })
        .collect();
    views.sort_by(compare_views);
    views
}

fn compare_views(a: &JobView, b: &JobView) -> Ordering {
    a.display_status
        .rank()
        .cmp(&b.display_status.rank())
        .then_with(|| a.job_id().cmp(b.job_id()))
}

/// `~Nm` below an hour, `~X.Xh` above; `unknown` when undefined.
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        None => "unknown".to_string(),
        Some(d) => {
            let minutes = d.as_secs_f64() / 60.0;
            if minutes < 60.0 {
                format!("~{}m", minutes.ceil() as u64)
            } else {
                format!("~{:.1}h", minutes / 60.0)
            }
        }
    }
}

/// `Xh Ym`, or `Ym` below an hour.
pub fn format_elapsed(elapsed: Option<Duration>) -> String {
    match elapsed {
        None => "-".to_string(),
        Some(d) => {
            let total_minutes = d.as_secs() / 60;
            let (h, m) = (total_minutes / 60, total_minutes % 60);
            if h > 0 {
                format!("{h}h {m}m")
            } else {
                format!("{m}m")
            }
        }
    }
}

fn format_age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match at.and_then(|t| (now - t).to_std().ok()) {
        Some(age) => format!("{}s ago", age.as_secs()),
        None => "never".to_string(),
    }
}

fn progress_bar(fraction: f64, width: usize) -> String {
    let filled = ((fraction.clamp(0.0, 1.0) * width as f64).round() as usize).min(width);
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

// ── Interaction ──────────────────────────────────────────────────────────

/// Keys the dashboard reacts to, independent of the terminal backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardKey {
    Down,
    Up,
    Enter,
    Back,
    Refresh,
    Quit,
}

impl DashboardKey {
    /// `j`/`k` and `b` as aliases of the arrows and Esc.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'j' => Some(DashboardKey::Down),
            'k' => Some(DashboardKey::Up),
            'b' => Some(DashboardKey::Back),
            'r' => Some(DashboardKey::Refresh),
            'q' => Some(DashboardKey::Quit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    List,
    Detail(String),
}

/// What the event loop should do after a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Redraw,
    Reload,
    Quit,
    None,
}

/// View state of the interactive dashboard.
#[derive(Debug)]
pub struct DashboardModel {
    pub views: Vec<JobView>,
    pub selected: usize,
    pub screen: Screen,
    pub refreshed_at: DateTime<Utc>,
}

impl DashboardModel {
    pub fn new(views: Vec<JobView>, now: DateTime<Utc>) -> Self {
        Self {
            views,
            selected: 0,
            screen: Screen::List,
            refreshed_at: now,
        }
    }

    /// Swap in freshly loaded views, keeping the selection on the same job.
    pub fn replace_views(&mut self, views: Vec<JobView>, now: DateTime<Utc>) {
        let keep = self.views.get(self.selected).map(|v| v.job_id().to_string());
        self.views = views;
        self.refreshed_at = now;
        self.selected = keep
            .and_then(|id| self.views.iter().position(|v| v.job_id() == id))
            .unwrap_or(0)
            .min(self.views.len().saturating_sub(1));
    }

    pub fn handle_key(&mut self, key: DashboardKey) -> Action {
        let on_list = self.screen == Screen::List;
        match (on_list, key) {
            (_, DashboardKey::Quit) => Action::Quit,
            (_, DashboardKey::Refresh) => Action::Reload,
            (true, DashboardKey::Down) => {
                if self.selected + 1 < self.views.len() {
                    self.selected += 1;
                }
                Action::Redraw
            }
            (true, DashboardKey::Up) => {
                self.selected = self.selected.saturating_sub(1);
                Action::Redraw
            }
            (true, DashboardKey::Enter) => match self.views.get(self.selected) {
                Some(view) => {
                    self.screen = Screen::Detail(view.job_id().to_string());
                    Action::Redraw
                }
                None => Action::None,
            },
            (false, DashboardKey::Back) => {
                self.screen = Screen::List;
                Action::Redraw
            }
            _ => Action::None,
        }
    }

    /// The current screen as plain text lines.
    pub fn render(&self, now: DateTime<Utc>) -> String {
        match &self.screen {
            Screen::List => render_list(&self.views, self.selected, now),
            Screen::Detail(id) => match self.views.iter().find(|v| v.job_id() == id) {
                Some(view) => render_detail(view, now),
                None => format!("Job '{id}' is no longer present.\n\n[b] back  [q] quit\n"),
            },
        }
    }
}

pub fn render_list(views: &[JobView], selected: usize, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "PDF transcription jobs  ({})", now.format("%H:%M:%S"));
    let _ = writeln!(out);
    if views.is_empty() {
        let _ = writeln!(out, "  No jobs found.");
    }
    for (i, view) in views.iter().enumerate() {
        let cursor = if i == selected { '>' } else { ' ' };
        let _ = writeln!(
            out,
            "{} {:<28} {:<9} {} {:>4}/{:<4} ETA {:<7} {}",
            cursor,
            view.job_id(),
            view.display_status.as_str(),
            progress_bar(view.progress, 20),
            view.state.completed.len(),
            view.state.total_pages,
            format_eta(view.eta),
            format_elapsed(view.elapsed),
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[j/k] move  [enter] details  [r] refresh  [q] quit");
    out
}

pub fn render_detail(view: &JobView, now: DateTime<Utc>) -> String {
    let s = &view.state;
    let mut out = String::new();
    let _ = writeln!(out, "Job {}", s.job_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "  Status      {}", view.display_status.as_str());
    let _ = writeln!(
        out,
        "  Progress    {} {}/{} ({:.0}%)",
        progress_bar(view.progress, 30),
        s.completed.len(),
        s.total_pages,
        view.progress * 100.0
    );
    let _ = writeln!(out, "  Failed      {}", s.failed.len());
    let _ = writeln!(out, "  Fallback    {}", s.fallback_pages);
    let _ = writeln!(out, "  Velocity    {:.1} pages/h", view.velocity);
    let _ = writeln!(out, "  ETA         {}", format_eta(view.eta));
    let _ = writeln!(out, "  Elapsed     {}", format_elapsed(view.elapsed));
    let _ = writeln!(
        out,
        "  Heartbeat   {} (cpu {:.1}%, mem {} MB)",
        format_age(s.last_heartbeat_at, now),
        s.last_cpu_percent,
        s.last_memory_mb
    );
    let _ = writeln!(out, "  Errors      {} errors, {} warnings", s.error_count, s.warning_count);
    if s.resume_count > 0 {
        let _ = writeln!(out, "  Resumed     {} time(s)", s.resume_count);
    }
    if let Some(src) = &s.source_path {
        let _ = writeln!(out, "  Source      {}", src.display());
    }
    if let Some(dst) = &s.output_path {
        let _ = writeln!(out, "  Output      {}", dst.display());
    }
    if s.corrupt_lines > 0 {
        let _ = writeln!(out, "  Skipped     {} unreadable log line(s)", s.corrupt_lines);
    }
    if !s.failed.is_empty() {
        let pages: Vec<String> = s.failed.iter().map(|p| (p + 1).to_string()).collect();
        let _ = writeln!(out, "  Failed pages {}", pages.join(", "));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[b] back  [r] refresh  [q] quit");
    out
}
