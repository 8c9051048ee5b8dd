//! flowtrack CLI: follow, cancel and inspect backend workflows from a terminal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use flowtrack::transport;
use flowtrack::{
    filter, FailureReason, FlowtrackConfig, NotificationChannel, RawNotificationEnvelope,
    WorkflowCallbacks, WorkflowCancellation, WorkflowHandle, WorkflowInterest, WorkflowStatus,
    WorkflowTracker,
};

#[derive(Parser)]
#[command(
    name = "flowtrack",
    about = "Follow long-running backend workflows through push notifications",
    version,
    author
)]
struct Cli {
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track one workflow until it completes or fails
    Watch(WatchArgs),
    /// Ask the backend to cancel a workflow
    Cancel {
        /// Id returned by the backend when the workflow was started
        workflow_id: String,
        /// YAML config file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Run the notification filter over a recorded JSON-lines session
    Check {
        /// File with one notification envelope per line
        file: PathBuf,
        /// Expected payload type
        #[arg(long = "type", short = 't')]
        kind: String,
        /// Expected payload category
        #[arg(long, short)]
        category: String,
        /// Only accept notifications for this workflow
        #[arg(long, short)]
        workflow_id: Option<String>,
    },
}

#[derive(Args)]
struct WatchArgs {
    /// Id returned by the backend when the workflow was started
    workflow_id: String,
    /// Expected payload type
    #[arg(long = "type", short = 't')]
    kind: String,
    /// Expected payload category
    #[arg(long, short)]
    category: String,
    /// Notification source: `-` for stdin, an http(s) event-stream URL, or a file
    #[arg(long, short, default_value = "-")]
    source: String,
    /// Fail the workflow if it is still loading after this many milliseconds (0 disables)
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref(), cli.log_json)?;

    match cli.command {
        Commands::Watch(args) => {
            cmd_watch(args).await?;
        }
        Commands::Cancel { workflow_id, config } => {
            cmd_cancel(workflow_id, config).await?;
        }
        Commands::Check {
            file,
            kind,
            category,
            workflow_id,
        } => {
            cmd_check(file, kind, category, workflow_id)?;
        }
    }

    Ok(())
}

fn init_tracing(log_file: Option<&Path>, json: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match log_file {
        Some(path) => {
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("--log-file must name a file: {}", path.display()))?;
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(log_file.is_none())
        .with_writer(writer);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(guard)
}

// ─── Command implementations ──────────────────────────────────────────────────

enum Outcome {
    Completed(Option<String>),
    Failed(FailureReason),
}

enum Finish {
    Terminal(Outcome),
    SourceEnded(WorkflowStatus),
    Interrupted,
}

async fn cmd_watch(args: WatchArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(ms) = args.timeout_ms {
        config.tracker.timeout_ms = (ms > 0).then_some(ms);
    }

    let channel = NotificationChannel::new();
    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let completed_tx = tx.clone();
    let callbacks = WorkflowCallbacks::new()
        .on_completed(move |payload_type| {
            let _ = completed_tx.send(Outcome::Completed(payload_type));
        })
        .on_failed(move |reason| {
            let _ = tx.send(Outcome::Failed(reason));
        });

    let handle = WorkflowHandle::new(&args.workflow_id, &args.kind, &args.category);
    let tracker =
        WorkflowTracker::bind(&channel, handle.clone(), callbacks, config.tracker.clone())?;
    tracker.start();

    connect_source(&channel, &args.source, &config).await?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")?);
    spinner.set_message(format!("{}: {}", handle.workflow_id, tracker.status()));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let mut states = tracker.watch();
    let ticker = spinner.clone();
    let workflow_id = handle.workflow_id.clone();
    let progress = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let status = states.borrow_and_update().status;
            ticker.set_message(format!("{workflow_id}: {status}"));
        }
    });

    let finish = tokio::select! {
        biased;
        Some(outcome) = outcomes.recv() => Finish::Terminal(outcome),
        _ = channel.closed() => {
            // A terminal state reached just before the source ended still
            // delivers its callback (completion fires after the delay).
            let status = tracker.status();
            if status.is_terminal() {
                outcomes
                    .recv()
                    .await
                    .map_or(Finish::SourceEnded(status), Finish::Terminal)
            } else {
                Finish::SourceEnded(status)
            }
        }
        _ = tokio::signal::ctrl_c() => Finish::Interrupted,
    };

    progress.abort();
    spinner.finish_and_clear();
    let state = tracker.state();
    tracker.teardown();
    channel.disconnect();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Field", "Value"]);
    table.add_row(["Workflow", handle.workflow_id.as_str()]);
    table.add_row(["Type", handle.expected_type.as_str()]);
    table.add_row(["Category", handle.expected_category.as_str()]);
    table.add_row(["Status", &state.status.to_string()]);
    if let Some(since) = state.since {
        table.add_row(["Since", &since.format("%Y-%m-%d %H:%M:%S").to_string()]);
    }

    match finish {
        Finish::Terminal(Outcome::Completed(payload_type)) => {
            table.add_row(["Result", payload_type.as_deref().unwrap_or("-")]);
            println!("{table}");
            println!("✓ Workflow {} completed", handle.workflow_id);
            Ok(())
        }
        Finish::Terminal(Outcome::Failed(reason)) => {
            println!("{table}");
            bail!("Workflow {} failed: {reason}", handle.workflow_id)
        }
        Finish::SourceEnded(status) => {
            println!("{table}");
            bail!(
                "Notification source ended while workflow {} was {status}",
                handle.workflow_id
            )
        }
        Finish::Interrupted => {
            println!("{table}");
            bail!("Interrupted while tracking workflow {}", handle.workflow_id)
        }
    }
}

async fn connect_source(
    channel: &NotificationChannel,
    source: &str,
    config: &FlowtrackConfig,
) -> Result<()> {
    if source == "-" {
        info!("reading notifications from stdin");
        channel.connect(transport::json_lines(BufReader::new(tokio::io::stdin())))?;
    } else if source.starts_with("http://") || source.starts_with("https://") {
        let client = config.backend.stream_client()?;
        let events = transport::server_sent_events(&client, source)
            .await
            .with_context(|| format!("Failed to open event stream {source}"))?;
        channel.connect(events)?;
    } else {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("Failed to open notification source {source}"))?;
        info!(%source, "replaying notifications from file");
        channel.connect(transport::json_lines(BufReader::new(file)))?;
    }
    Ok(())
}

async fn cmd_cancel(workflow_id: String, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let cancellation = WorkflowCancellation::from_config(&config.backend)?;
    cancellation
        .try_cancel(&workflow_id)
        .await
        .with_context(|| format!("Cancellation of workflow {workflow_id} was not accepted"))?;
    println!("✓ Cancellation accepted for workflow {workflow_id}");
    Ok(())
}

fn cmd_check(
    file: PathBuf,
    kind: String,
    category: String,
    workflow_id: Option<String>,
) -> Result<()> {
    if !file.exists() {
        bail!("Session file not found: {}", file.display());
    }
    let bytes = std::fs::read(&file)?;
    let content = String::from_utf8_lossy(&bytes);

    let mut interest = WorkflowInterest::any_workflow(kind, category);
    if let Some(id) = workflow_id {
        interest = interest.with_workflow_id(id);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Line", "Workflow", "Status", "Event", "Signal"]);

    let mut total = 0;
    let mut relevant = 0;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total += 1;
        let envelope = RawNotificationEnvelope::from_json(line);
        let signal = filter(&envelope, &interest);
        if signal.is_relevant() {
            relevant += 1;
        }
        let payload = envelope.payload();
        if payload.is_none() {
            warn!(line = index + 1, "envelope has no payload");
        }
        table.add_row([
            (index + 1).to_string(),
            or_dash(payload.and_then(|p| p.workflow_id.as_deref())),
            or_dash(payload.and_then(|p| p.status())),
            or_dash(payload.and_then(|p| p.event.as_deref())),
            signal.to_string(),
        ]);
    }

    println!("Session: {}", file.display());
    println!("{table}");
    println!("{relevant} of {total} envelope(s) relevant");
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn load_config(path: Option<&Path>) -> Result<FlowtrackConfig> {
    let config = match path {
        Some(path) => FlowtrackConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FlowtrackConfig::default(),
    };
    let config = config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}
