use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jagg_core::Platform;
use jagg_storage::{PostingQuery, PostingStore};
use jagg_sync::{Pipeline, RefreshConfig, RefreshOrchestrator, RefreshSummary, SourceStatus};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jagg")]
#[command(about = "ATS job aggregator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one refresh pass over the configured sources.
    Refresh {
        /// Print the full summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Serve the JSON API.
    Serve,
    /// Probe which platform hosts an organization.
    Detect { organization_key: String },
    /// List postings from the store snapshot.
    List {
        #[arg(long)]
        source: Option<Platform>,
        #[arg(long)]
        q: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        remote: Option<bool>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jagg=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Refresh { json: false }) {
        Commands::Refresh { json } => {
            let pipeline = Pipeline::from_env().await?;
            let summary = pipeline.refresh().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Serve => {
            jagg_web::serve_from_env().await?;
        }
        Commands::Detect { organization_key } => {
            let config = RefreshConfig::from_env()?;
            let orchestrator =
                RefreshOrchestrator::from_config(&config, Arc::new(PostingStore::new()))?;
            match orchestrator.detect(&organization_key).await {
                Some(platform) => println!("{organization_key}: {platform}"),
                None => println!("{organization_key}: no supported platform"),
            }
        }
        Commands::List {
            source,
            q,
            company,
            location,
            remote,
            limit,
        } => {
            let config = RefreshConfig::from_env()?;
            let path = config
                .snapshot_path
                .context("JAGG_SNAPSHOT_PATH must point at a store snapshot to list postings")?;
            let store = PostingStore::load_snapshot(&path)
                .await
                .with_context(|| format!("loading snapshot {}", path.display()))?;
            let page = store
                .list(&PostingQuery {
                    source,
                    q,
                    company,
                    location,
                    remote,
                    offset: 0,
                    limit: Some(limit),
                })
                .await;
            for posting in &page.postings {
                println!(
                    "{}\t{}\t{}\t{}\t{}{}",
                    posting.ts,
                    posting.source,
                    posting.organization_key,
                    posting.title,
                    posting.location,
                    if posting.remote { " (remote)" } else { "" }
                );
                println!("\t{}", posting.url);
            }
            println!("{} of {} matching postings", page.postings.len(), page.total_matches);
        }
    }

    Ok(())
}

fn print_summary(summary: &RefreshSummary) {
    println!(
        "refresh complete: run_id={} total={} inserted={} updated={} unchanged={} removed={} store_total={}",
        summary.run_id,
        summary.counts.total,
        summary.changes.inserted,
        summary.changes.updated,
        summary.changes.unchanged,
        summary.changes.removed,
        summary.store_total,
    );
    for report in &summary.sources {
        let platform = report
            .platform
            .map(|p| p.to_string())
            .unwrap_or_else(|| report.requested.to_string());
        let status = match report.status {
            SourceStatus::Fetched => "fetched",
            SourceStatus::Unavailable => "unavailable",
            SourceStatus::Failed => "failed",
            SourceStatus::Skipped => "skipped",
        };
        match &report.failure {
            Some(failure) => println!(
                "  {platform}:{} {status} ({failure})",
                report.organization_key
            ),
            None => println!(
                "  {platform}:{} {status} postings={} dropped={}",
                report.organization_key, report.postings, report.dropped_items
            ),
        }
    }
    println!("digest={}", summary.store_digest);
    if let Some(path) = &summary.snapshot_path {
        println!("snapshot={path}");
    }
}
