use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use heritage_loader::client::{ApiClient, ProbeStatus};
use heritage_loader::config::{
    DelimiterChoice, Language, UploadConfig, DEFAULT_DELAY_MS, DRAIN_INTERVAL_MS, REQUIRED_FIELD,
};
use heritage_loader::events::{self, EventStream};
use heritage_loader::ingest;
use heritage_loader::models::FieldMapping;
use heritage_loader::schema::{self, SchemaPolicy};
use heritage_loader::upload::{RowSource, RunOutcome, Uploader};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "heritage-loader")]
#[command(about = "Upload CSV records of heritage items to a repository API")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the API is reachable and the key is accepted
    Probe(ApiArgs),
    /// List the element ids reported by the API
    Elements(ApiArgs),
    /// Create one item per CSV row
    Upload(UploadArgs),
    /// Build (and unless --dry-run, send) the payload for the first CSV row
    TestRow(UploadArgs),
}

#[derive(Args)]
struct ApiArgs {
    /// Repository API endpoint, e.g. https://example.org/api/
    #[arg(long, env = "HERITAGE_API_URL")]
    api_url: String,

    /// API key; prefer the environment variable over the command line
    #[arg(long, env = "HERITAGE_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,
}

#[derive(Args)]
struct UploadArgs {
    #[command(flatten)]
    api: ApiArgs,

    /// CSV file, one item per row
    #[arg(short, long)]
    csv: PathBuf,

    /// Field delimiter: auto, comma, semicolon, tab or a single character
    #[arg(long, default_value = "auto")]
    delimiter: DelimiterChoice,

    /// Language whose columns win when both (EN) and (ES) are filled
    #[arg(long, value_enum, default_value_t = Language::English)]
    language: Language,

    /// Escape values containing markup instead of sending them as HTML
    #[arg(long)]
    no_html: bool,

    /// Create items as private
    #[arg(long)]
    private: bool,

    /// Build every payload but send nothing
    #[arg(long)]
    dry_run: bool,

    /// Process at most this many rows (0 = all)
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Pause between requests in milliseconds
    #[arg(long, default_value_t = DEFAULT_DELAY_MS)]
    delay_ms: u64,

    /// Abort instead of using default element ids when the listing cannot be read
    #[arg(long)]
    strict_schema: bool,

    /// Also append every log line to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl UploadArgs {
    fn to_config(&self) -> UploadConfig {
        UploadConfig {
            api_base: self.api.api_url.clone(),
            api_key: self.api.api_key.clone(),
            language: self.language,
            render_html: !self.no_html,
            public: !self.private,
            dry_run: self.dry_run,
            limit: self.limit,
            delay_ms: self.delay_ms,
            delimiter: self.delimiter,
        }
    }

    fn schema_policy(&self) -> SchemaPolicy {
        if self.strict_schema {
            SchemaPolicy::Strict
        } else {
            SchemaPolicy::Fallback
        }
    }
}

/// Prints drained events (above the progress bar when there is one) and
/// mirrors them to the optional log file.
struct EventPrinter {
    stream: EventStream,
    log: Option<BufWriter<File>>,
}

impl EventPrinter {
    fn new(stream: EventStream, log_file: Option<&Path>) -> Result<Self> {
        let log = match log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open log file: {}", path.display()))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Self { stream, log })
    }

    fn flush(&mut self, pb: Option<&ProgressBar>) -> Result<()> {
        for event in self.stream.drain() {
            let line = event.to_string();
            match pb {
                Some(pb) => pb.println(&line),
                None => println!("{line}"),
            }
            if let Some(log) = self.log.as_mut() {
                writeln!(log, "{line}").context("Failed to write log file")?;
            }
        }
        if let Some(log) = self.log.as_mut() {
            log.flush().context("Failed to write log file")?;
        }
        Ok(())
    }
}

fn run_probe(args: ApiArgs) -> Result<()> {
    let client = ApiClient::new(&args.api_url, &args.api_key)?;
    println!("Testing: {}", client.base());

    let rt = build_runtime()?;
    match rt.block_on(client.probe()).context("Network error")? {
        ProbeStatus::Reachable => {
            println!("Connection successful.");
            Ok(())
        }
        ProbeStatus::Unauthorized => {
            bail!("API key invalid or insufficient permissions (HTTP 403)")
        }
        ProbeStatus::Unexpected { status, body } => bail!("Unexpected status {status}: {body}"),
    }
}

fn run_elements(args: ApiArgs) -> Result<()> {
    let client = ApiClient::new(&args.api_url, &args.api_key)?;
    let rt = build_runtime()?;
    let mapping = rt
        .block_on(schema::fetch_mapping(&client))
        .context("Failed to fetch element ids")?;

    for (name, id) in mapping.sorted() {
        println!("{id:>6}  {name}");
    }
    println!();
    println!("Mapped {} element ids", mapping.len());
    if !mapping.contains(REQUIRED_FIELD) {
        warn!(field = REQUIRED_FIELD, "Required element missing");
        eprintln!("Warning: '{REQUIRED_FIELD}' element not found in API response");
    }
    Ok(())
}

async fn resolve_mapping(
    client: &ApiClient,
    policy: SchemaPolicy,
    sink: &events::EventSink,
    printer: &mut EventPrinter,
) -> Result<FieldMapping> {
    let mapping = schema::resolve(client, policy, sink).await;
    printer.flush(None)?;
    mapping.context("Element ids could not be resolved")
}

async fn upload(args: UploadArgs) -> Result<()> {
    let config = args.to_config();
    config.validate()?;
    info!(?config, "Upload configuration");

    let client = ApiClient::new(&config.api_base, &config.api_key)?;
    let (sink, stream) = events::channel();
    let mut printer = EventPrinter::new(stream, args.log_file.as_deref())?;

    let mapping = resolve_mapping(&client, args.schema_policy(), &sink, &mut printer).await?;

    let start = Instant::now();
    let uploader = Uploader::new(client, sink);
    let handle = uploader.spawn(RowSource::Csv(args.csv.clone()), mapping, config)?;

    let pb = make_progress_bar()?;
    let mut tick = tokio::time::interval(Duration::from_millis(DRAIN_INTERVAL_MS));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                printer.flush(Some(&pb))?;
                let snap = handle.snapshot();
                pb.set_length(snap.total);
                pb.set_position(snap.attempted());
                pb.set_message(format!("{} ok, {} failed", snap.succeeded, snap.failed));
                if handle.is_finished() {
                    break;
                }
            }
            _ = &mut ctrl_c, if !cancel_sent => {
                cancel_sent = true;
                handle.request_cancel();
            }
        }
    }

    let run = handle.join().await;
    printer.flush(Some(&pb))?;
    pb.finish_and_clear();

    println!();
    println!("=== Summary ===");
    println!("Total rows:         {}", run.total);
    println!("Succeeded:          {}", run.succeeded);
    println!("Failed:             {}", run.failed);
    println!("Not attempted:      {}", run.not_attempted());
    println!("Elapsed:            {:.2}s", start.elapsed().as_secs_f64());

    match run.outcome {
        RunOutcome::Fatal(reason) => bail!("Batch aborted: {reason}"),
        RunOutcome::Cancelled => {
            warn!("Batch cancelled by user");
            Ok(())
        }
        RunOutcome::Completed => Ok(()),
    }
}

async fn test_row(args: UploadArgs) -> Result<()> {
    let config = args.to_config();
    config.validate()?;

    let client = ApiClient::new(&config.api_base, &config.api_key)?;
    let (sink, stream) = events::channel();
    let mut printer = EventPrinter::new(stream, args.log_file.as_deref())?;

    let mapping = resolve_mapping(&client, args.schema_policy(), &sink, &mut printer).await?;

    let rows = ingest::read_rows(&args.csv, config.delimiter)?;
    let Some(row) = rows.first() else {
        bail!("CSV is empty: {}", args.csv.display());
    };

    let outcome = Uploader::new(client, sink)
        .run_single(row, &mapping, &config)
        .await;
    printer.flush(None)?;

    if !outcome.is_success() {
        bail!("Test row was not accepted");
    }
    Ok(())
}

fn make_progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} items ({percent}%) {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("=> "),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("heritage-upload-worker")
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    let result = match cli.command {
        Commands::Probe(args) => run_probe(args),
        Commands::Elements(args) => run_elements(args),
        Commands::Upload(args) => build_runtime().and_then(|rt| rt.block_on(upload(args))),
        Commands::TestRow(args) => build_runtime().and_then(|rt| rt.block_on(test_row(args))),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
