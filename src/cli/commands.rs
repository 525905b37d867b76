//! CLI commands implementation.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use url::Url;

use crate::config::Settings;
use crate::models::{Snapshot, SnapshotStatus};
use crate::normalize::Normalizer;
use crate::orchestrator::SnapshotService;
use crate::queue::{JobQueue, WorkerPool};
use crate::repository::VersionStore;
use crate::source::{BlockSource, HttpBlockSource};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Versioned hierarchical document store with structural diffing")]
#[command(version)]
pub struct Cli {
    /// Config file path (defaults to strata.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<IpAddr>,
        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Snapshot a reference and process it inline
    Snapshot {
        /// External reference id to snapshot
        reference_id: String,
    },

    /// Show the state of a snapshot
    Show {
        /// Snapshot id
        snapshot_id: String,
    },

    /// Run the job worker pool
    Worker {
        /// Number of workers (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Exit once the queue is drained
        #[arg(long)]
        drain: bool,
    },

    /// Check cached version pointers against the version rows
    Verify,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            cmd_serve(&settings).await
        }
        Commands::Snapshot { reference_id } => cmd_snapshot(&settings, &reference_id).await,
        Commands::Show { snapshot_id } => cmd_show(&settings, &snapshot_id),
        Commands::Worker { workers, drain } => {
            let workers = workers.unwrap_or(settings.workers);
            cmd_worker(&settings, workers, drain).await
        }
        Commands::Verify => cmd_verify(&settings),
    }
}

fn open_store(settings: &Settings) -> anyhow::Result<VersionStore> {
    VersionStore::new(&settings.database_path).with_context(|| {
        format!(
            "failed to open database at {}",
            settings.database_path.display()
        )
    })
}

fn build_source(settings: &Settings) -> anyhow::Result<Arc<dyn BlockSource>> {
    let base_url = settings
        .source_base_url
        .as_deref()
        .context("source_base_url is not configured")?;
    let base_url =
        Url::parse(base_url).with_context(|| format!("invalid source_base_url: {base_url}"))?;
    let token = settings.source_token.clone().unwrap_or_default();
    let source = HttpBlockSource::new(base_url, token, settings.request_timeout())?;
    Ok(Arc::new(source))
}

fn build_service(settings: &Settings) -> anyhow::Result<(Arc<SnapshotService>, JobQueue)> {
    let store = open_store(settings)?;
    let queue = JobQueue::new(&settings.database_path)?;
    let source = build_source(settings)?;

    let normalizer = Normalizer::new(store.clone())
        .with_retry_policy(settings.source_retries, settings.retry_backoff());
    let service = SnapshotService::new(store, queue.clone(), source).with_normalizer(normalizer);
    Ok((Arc::new(service), queue))
}

/// Start the API server.
async fn cmd_serve(settings: &Settings) -> anyhow::Result<()> {
    let (service, _queue) = build_service(settings)?;

    println!(
        "{} Starting strata server at http://{}",
        style("→").cyan(),
        settings.bind_addr()
    );
    println!("  Press Ctrl+C to stop");

    crate::server::serve(settings, service).await
}

/// Create a snapshot and process it to completion in this process.
async fn cmd_snapshot(settings: &Settings, reference_id: &str) -> anyhow::Result<()> {
    let (service, _queue) = build_service(settings)?;

    println!(
        "{} Snapshotting {}...",
        style("→").cyan(),
        style(reference_id).bold()
    );
    let snapshot = service.run_inline(reference_id).await?;
    print_snapshot(&snapshot);

    if snapshot.status == SnapshotStatus::Error {
        anyhow::bail!("snapshot failed");
    }
    Ok(())
}

/// Show one snapshot from the store.
fn cmd_show(settings: &Settings, snapshot_id: &str) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    match store.get_snapshot(snapshot_id)? {
        Some(snapshot) => {
            print_snapshot(&snapshot);
            Ok(())
        }
        None => anyhow::bail!("snapshot not found: {snapshot_id}"),
    }
}

/// Run the worker pool against the job queue.
async fn cmd_worker(settings: &Settings, workers: usize, drain: bool) -> anyhow::Result<()> {
    let (service, queue) = build_service(settings)?;

    println!(
        "{} Running {} worker{}{}",
        style("→").cyan(),
        workers,
        if workers == 1 { "" } else { "s" },
        if drain { " until the queue drains" } else { "" }
    );

    let stats = WorkerPool::new(queue, service, workers)
        .with_visibility_timeout(settings.job_visibility())
        .run(drain)
        .await;

    println!(
        "  {} {} processed, {} failed",
        style("✓").green(),
        stats.processed,
        stats.failed
    );
    if stats.failed > 0 {
        anyhow::bail!("{} job(s) failed", stats.failed);
    }
    Ok(())
}

/// Check that cached latest-version pointers match the version rows.
fn cmd_verify(settings: &Settings) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let issues = store.verify_pointer_consistency()?;

    if issues.is_empty() {
        println!("{} Version pointers are consistent", style("✓").green());
        return Ok(());
    }
    for issue in &issues {
        println!("  {} {}", style("✗").red(), issue);
    }
    anyhow::bail!("{} inconsistent pointer(s)", issues.len());
}

fn print_snapshot(snapshot: &Snapshot) {
    let status = match snapshot.status {
        SnapshotStatus::Done => style(snapshot.status.as_str()).green(),
        SnapshotStatus::Error => style(snapshot.status.as_str()).red(),
        _ => style(snapshot.status.as_str()).yellow(),
    };
    println!("Snapshot {}", style(&snapshot.id).bold());
    println!("  reference:  {}", snapshot.reference_id);
    println!("  status:     {}", status);
    if let Some(ref document_id) = snapshot.document_id {
        println!("  document:   {}", document_id);
    }
    println!("  triggered:  {}", snapshot.triggered_at.to_rfc3339());
    if let Some(finished_at) = snapshot.finished_at {
        println!("  finished:   {}", finished_at.to_rfc3339());
    }
    if let Some(ref error) = snapshot.error {
        println!("  error:      {}", style(error).red());
    }
    if let Some(ref changed) = snapshot.changed_elements {
        println!("  changed:    {}", changed.join(", "));
    }
    if let Some(ref diff) = snapshot.structure_diff {
        println!(
            "  structure diff:\n{}",
            indent(&pretty_json(diff))
        );
    }
    if let Some(ref diffs) = snapshot.changed_elements_diff {
        if let Some(map) = diffs.as_object() {
            for (element_id, diff) in map {
                println!("  content diff for {}:", style(element_id).bold());
                println!("{}", indent(diff.as_str().unwrap_or("")));
            }
        }
    }
}

fn pretty_json(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
