use std::future::Future;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shelf_storage::{CatalogStore, FetchSession};
use shelf_sync::{catalog_report_markdown, load_extraction_rules, HarvestConfig, HarvestPipeline};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "shelf-cli")]
#[command(about = "Shelf catalog harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl storefronts and merge their products into the catalog.
    Harvest(HarvestArgs),
    /// Print a Markdown price summary of the catalog.
    Report {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Write the report to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Truncate the catalog to its header row.
    Reset {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Args)]
struct HarvestArgs {
    /// Storefront landing page urls.
    #[arg(required = true)]
    sites: Vec<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Rules file with selector tiers, keyword tables and site profiles.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    max_categories: Option<usize>,
    #[arg(long)]
    max_products: Option<usize>,
    #[arg(long)]
    max_pages: Option<usize>,
    #[arg(long)]
    retry_attempts: Option<usize>,
    #[arg(long)]
    min_delay_ms: Option<u64>,
    #[arg(long)]
    max_delay_ms: Option<u64>,
    /// Print one JSON summary per site instead of a text line.
    #[arg(long)]
    json: bool,
}

impl HarvestArgs {
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(path) = &self.config {
            config.rules_path = path.clone();
        }
        if let Some(n) = self.max_categories {
            config.max_categories = n;
        }
        if let Some(n) = self.max_products {
            config.max_products_per_category = n;
        }
        if let Some(n) = self.max_pages {
            config.max_pages_per_category = n;
        }
        if let Some(n) = self.retry_attempts {
            config.retry_attempts = n;
        }
        if let Some(ms) = self.min_delay_ms {
            config.min_delay = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            config.max_delay = std::time::Duration::from_millis(ms);
        }
    }
}

fn store_for(data_dir: Option<PathBuf>) -> CatalogStore {
    CatalogStore::new(data_dir.unwrap_or_else(|| HarvestConfig::from_env().data_dir))
}

/// Resolves when the user interrupts; never resolves if the handler could not be installed.
async fn interrupted(signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(err) = signal.await {
        warn!(error = %err, "interrupt handler unavailable; harvesting without it");
        std::future::pending::<()>().await;
    }
}

async fn harvest(args: HarvestArgs) -> Result<()> {
    let mut config = HarvestConfig::from_env();
    args.apply(&mut config);
    let rules = load_extraction_rules(&config.rules_path)?;
    let session = FetchSession::open(config.fetch_config()).context("opening fetch session")?;
    let pipeline = HarvestPipeline::new(config, rules);

    let mut failed = Vec::new();
    for site in &args.sites {
        let shutdown = interrupted(tokio::signal::ctrl_c());
        match pipeline.harvest_site_until(&session, site, shutdown).await {
            Ok(summary) if args.json => {
                println!("{}", serde_json::to_string(&summary).context("serializing site summary")?);
                if summary.interrupted {
                    break;
                }
            }
            Ok(summary) => {
                println!(
                    "harvest complete: site={} brand={} pages={} failed_pages={} records={} catalog={}",
                    summary.site,
                    summary.brand,
                    summary.pages_fetched,
                    summary.pages_failed,
                    summary.records_extracted,
                    summary
                        .merge
                        .as_ref()
                        .map(|m| m.final_count.to_string())
                        .unwrap_or_else(|| "unchanged".to_string()),
                );
                if summary.interrupted {
                    info!("interrupted; remaining sites skipped");
                    break;
                }
            }
            Err(err) => {
                error!(site = %site, error = %format!("{err:#}"), "site harvest failed");
                failed.push(site.clone());
            }
        }
    }
    session.close();

    if !failed.is_empty() {
        bail!("{} site(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Harvest(args) => harvest(args).await?,
        Commands::Report { data_dir, output } => {
            let store = store_for(data_dir);
            let records = store.load().await?;
            let markdown = catalog_report_markdown(&records);
            match output {
                Some(path) => {
                    std::fs::write(&path, markdown).with_context(|| format!("writing {}", path.display()))?;
                    println!("report written: {}", path.display());
                }
                None => print!("{markdown}"),
            }
        }
        Commands::Reset { data_dir, yes } => {
            if !yes {
                bail!("reset discards the whole catalog; pass --yes to confirm");
            }
            let path = store_for(data_dir).reset().await?;
            println!("catalog reset: {}", path.display());
        }
    }

    Ok(())
}
