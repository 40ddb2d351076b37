//! CLI binary for pdf-transcriber.
//!
//! Four subcommands over the library crate: `transcribe` runs (or resumes)
//! jobs, `dashboard` watches them, `status` prints one job's replayed state
//! and `cleanup` sweeps finished logs out of the telemetry store.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use indicatif::{ProgressBar, ProgressStyle};
use pdf_transcriber::dashboard::{load_views, Action, DashboardKey, DashboardModel};
use pdf_transcriber::{
    reconstruct, sweep, CompletionPolicy, DashboardConfig, Decision, EventStore, JobConfig, JobProgressCallback,
    JobRef, JobRunner, JobSpec, JobSummary, ProgressCallback, QualityPreset, TelemetryConfig, TranscriptionEngine,
};
use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Progress bar over the pages a run attempts, with one log line per page.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading job history…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap()
            .remove(&page_num)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, total_pages: usize, pending_pages: usize, resumed: bool) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.set_length(pending_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Transcribing");
        self.bar.reset_eta();

        let headline = if resumed {
            format!(
                "Resuming: {} of {} pages left",
                pending_pages, total_pages
            )
        } else {
            format!("Starting transcription of {total_pages} pages…")
        };
        self.bar.println(format!("{} {}", cyan("◆"), bold(&headline)));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.start_times.lock().unwrap().insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, fallback_used: bool) {
        let secs = self.elapsed_secs(page_num);
        let mark = if fallback_used { yellow("↺") } else { green("✓") };
        let note = if fallback_used { yellow("text-layer fallback") } else { String::new() };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            mark,
            page_num,
            total,
            dim(&format!("{secs:.1}s")),
            note
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg = if error.chars().count() > 80 {
            let cut: String = error.chars().take(79).collect();
            format!("{cut}\u{2026}")
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_job_complete(&self, _pages_completed: usize, _pages_failed: usize) {
        self.bar.finish_and_clear();
        let errors = self.errors.load(Ordering::SeqCst);
        if errors > 0 {
            eprintln!("{} {} page error(s) this run", red("✗"), errors);
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Transcribe a paper into ./output/<paper>/
  pdf-transcriber transcribe paper.pdf

  # Re-run after a crash or Ctrl-C: only unfinished pages are attempted
  pdf-transcriber transcribe paper.pdf

  # Several papers, high quality, a specific model
  pdf-transcriber transcribe --quality high-quality --model gpt-4.1 a.pdf b.pdf

  # Watch every job under ./output
  pdf-transcriber dashboard

  # One snapshot, for scripts and non-interactive terminals
  pdf-transcriber dashboard --once

  # Replayed state of one job as JSON
  pdf-transcriber status output/paper

  # See which event logs are safe to delete, then delete them
  pdf-transcriber cleanup --dry-run --verbose
  pdf-transcriber cleanup

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY                    OpenAI API key
  ANTHROPIC_API_KEY                 Anthropic API key
  GEMINI_API_KEY                    Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER            Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL                   Override model ID
  PDF_TRANSCRIBER_OUTPUT_DIR        Root of the per-job output directories (default: ./output)
  PDF_TRANSCRIBER_TELEMETRY_DIR     Central event-log store (default: ~/.cache/pdf-transcriber/telemetry)
  PDFIUM_LIB_PATH                   Path to an existing libpdfium (skips auto-download)

FILES:
  {telemetry}/{job}.jsonl           Append-only event log of a job
  {output}/{job}/events.jsonl       Link to the job's event log
  {output}/{job}/.pages/            One Markdown file per finished page
  {output}/{job}/{job}.md           The assembled transcription
"#;

/// Resumable PDF-to-Markdown transcription with a live job dashboard.
#[derive(Parser, Debug)]
#[command(
    name = "pdf-transcriber",
    version,
    about = "Resumable PDF-to-Markdown transcription using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF_TRANSCRIBER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF_TRANSCRIBER_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcribe (or resume) one or more PDFs.
    Transcribe(TranscribeArgs),
    /// Live view of every job under the output directory.
    Dashboard(DashboardArgs),
    /// Print the replayed state of one job as JSON.
    Status(StatusArgs),
    /// Delete event logs of finished jobs whose output exists.
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Central event-log directory.
    #[arg(long, env = "PDF_TRANSCRIBER_TELEMETRY_DIR")]
    telemetry_dir: Option<PathBuf>,

    /// How a finished job with failed pages is classified: always, strict, or a max failed fraction.
    #[arg(long, env = "PDF_TRANSCRIBER_COMPLETION_POLICY", default_value = "always")]
    completion_policy: CompletionPolicy,
}

impl StoreArgs {
    fn telemetry(&self) -> TelemetryConfig {
        match &self.telemetry_dir {
            Some(dir) => TelemetryConfig::with_central_dir(dir),
            None => TelemetryConfig::default(),
        }
    }
}

#[derive(Args, Debug)]
struct TranscribeArgs {
    /// PDF files to transcribe.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Root directory; each job writes to `<output-dir>/<job-id>/`.
    #[arg(short, long, env = "PDF_TRANSCRIBER_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    #[command(flatten)]
    store: StoreArgs,

    /// Rendering quality: fast (100 DPI), balanced (150), high-quality (200).
    #[arg(long, env = "PDF_TRANSCRIBER_QUALITY", default_value = "balanced")]
    quality: QualityPreset,

    /// Explicit rendering DPI (72–400), overriding the quality preset.
    #[arg(long, env = "PDF_TRANSCRIBER_DPI", value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: Option<u32>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "PDF_TRANSCRIBER_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "PDF_TRANSCRIBER_PROVIDER")]
    provider: Option<String>,

    /// Seconds between heartbeat events.
    #[arg(long, env = "PDF_TRANSCRIBER_HEARTBEAT_SECS", default_value_t = 30,
          value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_secs: u64,

    /// Per-page vision model timeout in seconds.
    #[arg(long, env = "PDF_TRANSCRIBER_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Max LLM output tokens per page.
    #[arg(long, env = "PDF_TRANSCRIBER_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF_TRANSCRIBER_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PDF_TRANSCRIBER_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Ignore earlier runs and start every job from page 1.
    #[arg(long)]
    no_resume: bool,

    /// Disable the progress bar.
    #[arg(long, env = "PDF_TRANSCRIBER_NO_PROGRESS")]
    no_progress: bool,

    /// Print run summaries as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct DashboardArgs {
    /// Root directory holding job output directories.
    #[arg(short, long, env = "PDF_TRANSCRIBER_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    #[command(flatten)]
    store: StoreArgs,

    /// Seconds between automatic refreshes.
    #[arg(long, env = "PDF_TRANSCRIBER_POLL_SECS", default_value_t = 5,
          value_parser = clap::value_parser!(u64).range(1..))]
    poll_secs: u64,

    /// A running job silent for longer than this many seconds is shown as stale.
    #[arg(long, env = "PDF_TRANSCRIBER_STALE_SECS", default_value_t = 120)]
    stale_secs: u64,

    /// Print one snapshot and exit.
    #[arg(long)]
    once: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// A job output directory, or a job id in the telemetry store.
    job: String,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Report what would be deleted without deleting anything.
    #[arg(long)]
    dry_run: bool,

    /// Print the report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar and the dashboard own the terminal; library logs are
    // reduced to errors while either is on screen.
    let owns_terminal = match &cli.command {
        Command::Transcribe(args) => !cli.quiet && !args.no_progress && !args.json,
        Command::Dashboard(args) => !args.once,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || owns_terminal {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Transcribe(args) => transcribe(args, cli.quiet).await,
        Command::Dashboard(args) => dashboard(args),
        Command::Status(args) => status(args),
        Command::Cleanup(args) => cleanup(args, cli.verbose, cli.quiet),
    }
}

// ── transcribe ───────────────────────────────────────────────────────────────

async fn transcribe(args: TranscribeArgs, quiet: bool) -> Result<ExitCode> {
    ensure_pdfium(quiet)?;

    let show_progress = !quiet && !args.no_progress && !args.json;
    let system_prompt = match &args.system_prompt {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        ),
        None => None,
    };

    // One engine for every input.
    let engine = TranscriptionEngine::acquire(&build_config(&args, None, None)?)
        .await
        .context("Failed to set up the transcription engine")?;
    let mut any_failed = false;

    for input in &args.inputs {
        let progress: Option<ProgressCallback> = if show_progress {
            Some(CliProgressCallback::new() as Arc<dyn JobProgressCallback>)
        } else {
            None
        };
        let config = build_config(&args, system_prompt.clone(), progress)?;

        let spec = JobSpec::for_source(input, &args.output_dir);
        let runner = JobRunner::new(&engine, &config);

        // Ctrl-C drops the run: the heartbeat stops and no job_completed is
        // written, so the next invocation resumes.
        let outcome = tokio::select! {
            res = runner.run(&spec) => res,
            _ = tokio::signal::ctrl_c() => {
                eprintln!(
                    "\n{} Interrupted; run the same command again to resume '{}'",
                    yellow("⚠"),
                    spec.job_id
                );
                return Ok(ExitCode::from(130));
            }
        };

        match outcome {
            Ok(summary) => {
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?);
                } else if !quiet {
                    print_summary(&summary);
                }
                if summary.pages_failed > 0 {
                    any_failed = true;
                }
            }
            Err(e) => {
                eprintln!("{} {}: {}", red("✘"), input.display(), e);
                any_failed = true;
            }
        }
    }

    engine.release();
    Ok(if any_failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn print_summary(s: &JobSummary) {
    let mark = if s.pages_failed == 0 { green("✔") } else { cyan("⚠") };
    eprintln!(
        "{}  {}  {}/{} pages  {} failed  {} via fallback  {:.1}s  →  {}",
        mark,
        bold(&s.job_id),
        s.pages_completed,
        s.total_pages,
        s.pages_failed,
        s.fallback_this_run,
        s.duration_ms as f64 / 1000.0,
        bold(&s.output_path.display().to_string()),
    );
    if s.pages_pending > 0 {
        eprintln!("   {}", dim(&format!("{} page(s) left; run again to retry them", s.pages_pending)));
    }
}

/// Map CLI args to `JobConfig`.
fn build_config(
    args: &TranscribeArgs,
    system_prompt: Option<String>,
    progress: Option<ProgressCallback>,
) -> Result<JobConfig> {
    let mut builder = JobConfig::builder()
        .quality(args.quality)
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .api_timeout_secs(args.api_timeout)
        .resume(!args.no_resume)
        .completion_policy(args.store.completion_policy)
        .telemetry(args.store.telemetry())
        .heartbeat_interval(Duration::from_secs(args.heartbeat_secs));

    if let Some(dpi) = args.dpi {
        builder = builder.dpi(dpi);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Download pdfium on first use, with a byte-progress bar.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

// ── dashboard ────────────────────────────────────────────────────────────────

fn dashboard(args: DashboardArgs) -> Result<ExitCode> {
    let config = DashboardConfig {
        output_root: args.output_dir.clone(),
        poll_interval: Duration::from_secs(args.poll_secs),
        stale_threshold: Duration::from_secs(args.stale_secs),
    };
    let policy = args.store.completion_policy;

    if args.once || !io::stdout().is_terminal() {
        let now = Utc::now();
        let model = DashboardModel::new(load_views(&config, &policy, now), now);
        print!("{}", model.render(now));
        return Ok(ExitCode::SUCCESS);
    }

    let mut stdout = io::stdout();
    enable_raw_mode().context("Failed to enter raw mode")?;
    execute!(stdout, EnterAlternateScreen, Hide)?;

    let res = tokio::task::block_in_place(|| dashboard_loop(&config, &policy, &mut stdout));

    // Restore terminal
    disable_raw_mode()?;
    execute!(stdout, LeaveAlternateScreen, Show)?;
    res.map(|_| ExitCode::SUCCESS)
}

fn dashboard_loop(config: &DashboardConfig, policy: &CompletionPolicy, out: &mut io::Stdout) -> Result<()> {
    let now = Utc::now();
    let mut model = DashboardModel::new(load_views(config, policy, now), now);
    let mut last_reload = Instant::now();
    draw(out, &model)?;

    loop {
        let wait = config.poll_interval.saturating_sub(last_reload.elapsed());
        let mut action = Action::None;

        if event::poll(wait)? {
            if let TermEvent::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let mapped = match key.code {
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(DashboardKey::Quit),
                    KeyCode::Down => Some(DashboardKey::Down),
                    KeyCode::Up => Some(DashboardKey::Up),
                    KeyCode::Enter => Some(DashboardKey::Enter),
                    KeyCode::Esc => Some(DashboardKey::Back),
                    KeyCode::Char(c) => DashboardKey::from_char(c),
                    _ => None,
                };
                if let Some(key) = mapped {
                    action = model.handle_key(key);
                }
            }
        } else {
            action = Action::Reload;
        }

        match action {
            Action::Quit => return Ok(()),
            Action::Reload => {
                let now = Utc::now();
                model.replace_views(load_views(config, policy, now), now);
                last_reload = Instant::now();
                draw(out, &model)?;
            }
            Action::Redraw => draw(out, &model)?,
            Action::None => {}
        }
    }
}

fn draw(out: &mut io::Stdout, model: &DashboardModel) -> Result<()> {
    execute!(out, MoveTo(0, 0), Clear(ClearType::All))?;
    // Raw mode: every line needs an explicit carriage return.
    for line in model.render(Utc::now()).lines() {
        write!(out, "{line}\r\n")?;
    }
    out.flush()?;
    Ok(())
}

// ── status ───────────────────────────────────────────────────────────────────

fn status(args: StatusArgs) -> Result<ExitCode> {
    let as_dir = Path::new(&args.job);
    let job = if as_dir.is_dir() {
        JobRef::from_output_dir(as_dir)
    } else {
        let store = EventStore::from_config(&args.store.telemetry());
        JobRef::new(&store, &args.job, None)
    };
    let state = reconstruct(&job, &args.store.completion_policy)
        .with_context(|| format!("Failed to read history of '{}'", job.job_id))?;
    println!("{}", serde_json::to_string_pretty(&state).context("Failed to serialise state")?);
    Ok(ExitCode::SUCCESS)
}

// ── cleanup ──────────────────────────────────────────────────────────────────

fn cleanup(args: CleanupArgs, verbose: bool, quiet: bool) -> Result<ExitCode> {
    let store = EventStore::from_config(&args.store.telemetry());
    let report = sweep(&store, &args.store.completion_policy, args.dry_run);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).context("Failed to serialise report")?);
        return Ok(ExitCode::SUCCESS);
    }

    if verbose {
        for entry in &report.entries {
            let mark = match entry.decision {
                Decision::Deleted => green("✓"),
                Decision::WouldDelete => cyan("○"),
                Decision::Kept(_) => dim("·"),
            };
            println!("  {} {:<32} {}", mark, entry.job_id, entry.decision);
        }
    }
    if !quiet {
        let verb = if args.dry_run { "would delete" } else { "deleted" };
        println!(
            "{} logs examined in {}: {} {}, {} kept{}",
            report.found(),
            store.central_dir().display(),
            report.deleted(),
            verb,
            report.kept(),
            if report.errors() > 0 {
                format!(" ({} with errors)", report.errors())
            } else {
                String::new()
            }
        );
    }
    // Keeping a log is a normal outcome.
    Ok(ExitCode::SUCCESS)
}
