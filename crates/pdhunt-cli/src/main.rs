use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pdhunt_storage::JobStore;
use pdhunt_sync::{build_scheduler, pipeline_from_env, RunMode, RunOptions, RunSummary, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pdhunt")]
#[command(about = "Postdoc search: scrape boards, score postings, discover PIs, export reports")]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args, Clone, Copy, Default)]
struct OutputFlags {
    /// Email the report to the configured recipients.
    #[arg(long)]
    notify: bool,
    /// Print the text summary to stdout.
    #[arg(long)]
    summary: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, score and store postings, then write the report.
    Run(OutputFlags),
    /// Like `run`, plus seed profiling, co-author and citation PI discovery,
    /// and watched lab page checks.
    Weekly(OutputFlags),
    /// Write the report from stored data only.
    Export(OutputFlags),
    /// Run daily and weekly jobs on their cron schedules until interrupted.
    Schedule {
        #[arg(long)]
        notify: bool,
    },
    /// Create or upgrade the database schema.
    Migrate,
    /// Manage the PI watchlist.
    #[command(subcommand)]
    Watch(WatchCommand),
}

#[derive(Debug, Subcommand)]
enum WatchCommand {
    /// Add a PI, or update the institution and lab page of one already watched.
    Add {
        name: String,
        #[arg(long)]
        institution: Option<String>,
        #[arg(long)]
        lab_url: Option<String>,
    },
    Remove {
        name: String,
    },
    List,
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_once(mode: RunMode, flags: OutputFlags) -> Result<()> {
    let pipeline = pipeline_from_env().await?;
    let summary = pipeline
        .run(RunOptions {
            mode,
            notify: flags.notify,
        })
        .await
        .context("pipeline run failed")?;
    print_summary(&summary, flags.summary);
    Ok(())
}

fn print_summary(summary: &RunSummary, full: bool) {
    if full {
        println!("{}", summary.text_summary);
        println!();
    }
    println!(
        "run complete: run_id={} new={} updated={} partial_sources={} failed_sources={} report={}",
        summary.run_id,
        summary.inserted,
        summary.updated,
        summary.sources_partial,
        summary.sources_failed,
        summary.report_path.display()
    );
    if let Some(discovery) = &summary.discovery {
        println!(
            "discovery: candidates={} skipped_seeds={}",
            discovery.candidates,
            discovery.skipped_seeds.len()
        );
    }
    if let Some(watch) = &summary.watchlist {
        println!(
            "watchlist: checked={} changed={} failed={}",
            watch.checked,
            watch.changed.len(),
            watch.failed
        );
    }
}

async fn watch(command: WatchCommand) -> Result<()> {
    let config = SyncConfig::from_env();
    let store = JobStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    match command {
        WatchCommand::Add {
            name,
            institution,
            lab_url,
        } => {
            let entry = store
                .add_watch(&name, institution.as_deref(), lab_url.as_deref(), Utc::now())
                .await?;
            println!("watching {}", entry.pi_name);
        }
        WatchCommand::Remove { name } => {
            if store.remove_watch(&name).await? {
                println!("removed {name}");
            } else {
                println!("{name} is not on the watchlist");
            }
        }
        WatchCommand::List => {
            for entry in store.list_watchlist().await? {
                let checked = entry
                    .last_checked_at
                    .map(|ts| ts.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}\t{}\t{}\tchecked {}",
                    entry.pi_name,
                    entry.institution.as_deref().unwrap_or("-"),
                    entry.lab_url.as_deref().unwrap_or("-"),
                    checked
                );
            }
        }
    }
    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Run(OutputFlags::default())) {
        Commands::Run(flags) => run_once(RunMode::Daily, flags).await?,
        Commands::Weekly(flags) => run_once(RunMode::Weekly, flags).await?,
        Commands::Export(flags) => run_once(RunMode::ExportOnly, flags).await?,
        Commands::Schedule { notify } => {
            let pipeline = Arc::new(pipeline_from_env().await?);
            let mut sched = build_scheduler(pipeline, notify).await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = JobStore::open(&config.db_path)
                .await
                .with_context(|| format!("opening {}", config.db_path.display()))?;
            store.close().await;
            println!("database ready at {}", config.db_path.display());
        }
        Commands::Watch(command) => watch(command).await?,
    }

    Ok(())
}
