//! CLI binary for edgequake-pdfpages.
//!
//! A thin shim over the library crate: opens the shared database, maps flags
//! onto `WorkerConfig` / `QueueConfig`, and runs one subcommand.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_pdfpages::{
    BackoffPolicy, Collaborators, Database, DocumentId, DocumentStore, JobQueue, LocalBlobStore,
    NewJob, PipelineObserver, QueueConfig, SqliteDocumentStore, SqliteJobQueue, Worker,
    WorkerConfig, WorkerPool,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Worker progress observer using indicatif ─────────────────────────────────

/// One bar per running job, stacked in a `MultiProgress`. Pages complete out
/// of order, so bars count finished pages rather than tracking a position.
struct CliObserver {
    bars: MultiProgress,
    jobs: Mutex<HashMap<String, ProgressBar>>,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bars: MultiProgress::new(),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn bar(&self, job_id: &str) -> Option<ProgressBar> {
        self.jobs.lock().get(job_id).cloned()
    }
}

impl PipelineObserver for CliObserver {
    fn on_job_start(&self, job_id: &str, document_id: &str, attempt: u32) {
        let bar = self.bars.add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix(document_id.to_string());
        bar.set_message(format!("attempt {attempt}: fetching…"));
        bar.enable_steady_tick(Duration::from_millis(80));
        self.jobs.lock().insert(job_id.to_string(), bar);
    }

    fn on_extracted(&self, job_id: &str, total_pages: usize) {
        let Some(bar) = self.bar(job_id) else { return };
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:36.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        bar.set_length(total_pages as u64);
        bar.set_message("");
    }

    fn on_page_complete(&self, job_id: &str, _page_num: usize, _total: usize) {
        if let Some(bar) = self.bar(job_id) {
            bar.inc(1);
        }
    }

    fn on_page_error(&self, job_id: &str, page_num: usize, _total: usize, error: &str) {
        if let Some(bar) = self.bar(job_id) {
            bar.println(format!("  {} page {page_num}: {}", red("✗"), dim(error)));
            bar.inc(1);
        }
    }

    fn on_job_finished(&self, job_id: &str, outcome: Result<usize, &str>) {
        let Some(bar) = self.jobs.lock().remove(job_id) else {
            return;
        };
        let line = match outcome {
            Ok(pages) => format!("{} {} pages", green("✔"), pages),
            Err(e) => format!("{} {}", red("✗"), e),
        };
        bar.finish_and_clear();
        self.bars.remove(&bar);
        let _ = self.bars.println(format!("{}  {}", bold(&bar.prefix()), line));
    }
}

// ── CLI definition ───────────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"EXAMPLES:
  # Queue a document, then process everything queued and exit
  pdfpages enqueue report-2024 https://example.com/report.pdf
  pdfpages worker --until-idle

  # Long-running worker: 4 jobs at once, 8 pages per job
  pdfpages worker --job-concurrency 4 --page-concurrency 8

  # Follow a document's progress until it finishes
  pdfpages status report-2024 --watch

  # Inspect failures
  pdfpages dead-letters --limit 20
  pdfpages stats

OUTPUT LAYOUT (under --blob-dir):
  {document}/pages/0001.png      one PNG per page
  {document}/document.json       per-page text, image URLs and statuses

ENVIRONMENT VARIABLES:
  PDFPAGES_DB             SQLite database shared by queue and document records
  PDFPAGES_BLOB_DIR       Root directory for page images and artifacts
  PDFPAGES_BLOB_BASE_URL  Public URL prefix for stored blobs
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  RUST_LOG                Overrides --verbose / --quiet log filtering
"#;

/// Durable PDF-to-pages pipeline: enqueue documents, run workers, poll progress.
#[derive(Parser, Debug)]
#[command(
    name = "pdfpages",
    version,
    about = "Durable PDF-to-pages pipeline backed by a SQLite job queue",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// SQLite database holding the job queue and document records.
    #[arg(long, global = true, env = "PDFPAGES_DB", default_value = "pdfpages.db")]
    db: PathBuf,

    /// Claims a job may receive before a failure dead-letters it.
    #[arg(long, global = true, env = "PDFPAGES_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Base delay in seconds before a failed job is retried (doubles each time).
    #[arg(long, global = true, env = "PDFPAGES_RETRY_BASE_SECS", default_value_t = 5)]
    retry_base_secs: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFPAGES_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDFPAGES_QUIET")]
    quiet: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "PDFPAGES_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Claim and process jobs.
    Worker(WorkerArgs),
    /// Queue a document for processing.
    Enqueue {
        /// Document identifier (no path separators).
        document_id: String,
        /// Source PDF: http(s):// or file:// URL.
        source_url: String,
    },
    /// Print a document's processing state as JSON.
    Status {
        document_id: String,
        /// Poll with a progress bar until the document completes or errors.
        #[arg(short, long)]
        watch: bool,
        /// Poll period in milliseconds for --watch.
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// List jobs that exhausted their attempts or failed permanently.
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Count jobs by state.
    Stats,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Root directory for page images and artifacts.
    #[arg(long, env = "PDFPAGES_BLOB_DIR", default_value = "blobs")]
    blob_dir: PathBuf,

    /// Public URL prefix for stored blobs (default: file:// URLs).
    #[arg(long, env = "PDFPAGES_BLOB_BASE_URL")]
    blob_base_url: Option<String>,

    /// Worker identity prefix written into leases.
    #[arg(long, env = "PDFPAGES_WORKER_NAME", default_value = "worker")]
    name: String,

    /// Jobs processed at once.
    #[arg(short = 'j', long, env = "PDFPAGES_JOB_CONCURRENCY", default_value_t = 2)]
    job_concurrency: usize,

    /// Page tasks in flight per job.
    #[arg(short = 'p', long, env = "PDFPAGES_PAGE_CONCURRENCY", default_value_t = 2)]
    page_concurrency: usize,

    /// Lease duration in seconds.
    #[arg(long, env = "PDFPAGES_LEASE_SECS", default_value_t = 300)]
    lease_secs: u64,

    /// Heartbeat period in seconds (must be shorter than the lease).
    #[arg(long, env = "PDFPAGES_HEARTBEAT_SECS", default_value_t = 60)]
    heartbeat_secs: u64,

    /// Queue poll period in milliseconds when idle.
    #[arg(long, env = "PDFPAGES_POLL_MS", default_value_t = 1000)]
    poll_ms: u64,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDFPAGES_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Longest rendered edge in pixels.
    #[arg(long, env = "PDFPAGES_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// Retries per page upload.
    #[arg(long, env = "PDFPAGES_UPLOAD_RETRIES", default_value_t = 3)]
    upload_retries: u32,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDFPAGES_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDFPAGES_PASSWORD")]
    password: Option<String>,

    /// Exit once no pending or leased jobs remain.
    #[arg(long)]
    until_idle: bool,

    /// Disable progress bars.
    #[arg(long, env = "PDFPAGES_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let db = Database::open(&cli.db)
        .with_context(|| format!("Failed to open database {}", cli.db.display()))?;
    let queue_config = QueueConfig::default()
        .with_max_attempts(cli.max_attempts)
        .with_job_backoff(
            BackoffPolicy::new(Duration::from_secs(cli.retry_base_secs), cli.max_attempts)
                .with_max_delay(Duration::from_secs(15 * 60)),
        );
    let queue = Arc::new(
        SqliteJobQueue::new(db.clone(), queue_config).context("Invalid queue configuration")?,
    );
    let store = SqliteDocumentStore::new(db);

    match cli.command {
        Command::Worker(ref args) => run_worker(&cli, args, queue, store).await,
        Command::Enqueue {
            ref document_id,
            ref source_url,
        } => {
            let id = queue
                .enqueue(NewJob::new(document_id.as_str(), source_url.as_str()))
                .await
                .context("Failed to enqueue job")?;
            println!("{id}");
            if !cli.quiet {
                eprintln!("{} queued {} as job {}", green("✔"), bold(document_id), dim(&id.to_string()));
            }
            Ok(())
        }
        Command::Status {
            ref document_id,
            watch,
            interval_ms,
        } => {
            let doc = DocumentId::parse(document_id.as_str()).context("Invalid document id")?;
            if watch {
                watch_status(&store, &doc, Duration::from_millis(interval_ms), cli.quiet).await
            } else {
                print_status(&store, &doc).await
            }
        }
        Command::DeadLetters { limit } => {
            let jobs = queue.dead_letters(limit).await.context("Failed to list dead letters")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&jobs).context("Failed to serialise jobs")?
            );
            Ok(())
        }
        Command::Stats => {
            let stats = queue.stats().await.context("Failed to read queue stats")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).context("Failed to serialise stats")?
            );
            Ok(())
        }
    }
}

fn init_logging(cli: &Cli) {
    // Worker progress bars replace INFO logs unless --verbose asks for both.
    let bars = matches!(&cli.command, Command::Worker(a) if !a.no_progress) && !cli.log_json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || bars {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_worker(
    cli: &Cli,
    args: &WorkerArgs,
    queue: Arc<SqliteJobQueue>,
    store: SqliteDocumentStore,
) -> Result<()> {
    let mut blob = LocalBlobStore::new(&args.blob_dir)
        .with_context(|| format!("Failed to open blob directory {}", args.blob_dir.display()))?;
    if let Some(ref base) = args.blob_base_url {
        blob = blob.with_base_url(base.as_str());
    }

    let mut builder = WorkerConfig::builder()
        .worker_name(args.name.as_str())
        .job_concurrency(args.job_concurrency)
        .page_concurrency(args.page_concurrency)
        .lease_duration(Duration::from_secs(args.lease_secs))
        .heartbeat_interval(Duration::from_secs(args.heartbeat_secs))
        .poll_interval(Duration::from_millis(args.poll_ms))
        .dpi(args.dpi)
        .max_rendered_pixels(args.max_pixels)
        .upload_backoff(BackoffPolicy::new(Duration::from_millis(500), args.upload_retries))
        .download_timeout_secs(args.download_timeout);
    if let Some(ref pwd) = args.password {
        builder = builder.password(pwd.as_str());
    }
    if !cli.quiet && !args.no_progress && !cli.log_json {
        builder = builder.observer(CliObserver::new());
    }
    let config = builder.build().context("Invalid worker configuration")?;

    let parts = Collaborators::pdfium(&config, Arc::new(store), Arc::new(blob))
        .context("Failed to set up pipeline")?;
    let pool = WorkerPool::new(queue, Worker::new(config, parts));

    let handle = pool.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; finishing in-flight jobs");
            handle.shutdown();
        }
    });

    let summary = if args.until_idle {
        pool.run_until_idle().await
    } else {
        pool.run().await
    };

    if !cli.quiet {
        eprintln!(
            "{}  {} completed  {} retrying  {} dead-lettered",
            if summary.dead_lettered == 0 && summary.unreported == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            summary.completed,
            summary.retrying,
            summary.dead_lettered,
        );
        if summary.lease_lost + summary.unreported > 0 {
            eprintln!(
                "   {} lease lost  /  {} unreported",
                dim(&summary.lease_lost.to_string()),
                dim(&summary.unreported.to_string()),
            );
        }
    }
    Ok(())
}

async fn print_status(store: &SqliteDocumentStore, doc: &DocumentId) -> Result<()> {
    let Some(state) = store
        .processing_state(doc)
        .await
        .context("Failed to read document record")?
    else {
        bail!("No record for document '{}'", doc);
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&state).context("Failed to serialise state")?
    );
    Ok(())
}

async fn watch_status(
    store: &SqliteDocumentStore,
    doc: &DocumentId,
    every: Duration,
    quiet: bool,
) -> Result<()> {
    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    bar.set_prefix(doc.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));

    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let state = store
            .processing_state(doc)
            .await
            .context("Failed to read document record")?;
        let Some(state) = state else {
            bar.set_message("waiting for a worker…");
            continue;
        };
        bar.set_position(u64::from(state.progress));

        if state.complete {
            bar.finish_with_message(green("complete ✓"));
            break;
        }
        if let Some(ref e) = state.error {
            bar.abandon_with_message(red(e));
            break;
        }
    }
    print_status(store, doc).await
}
