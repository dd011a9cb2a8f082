mod batch;
mod cellmap;
mod classify;
mod config;
mod error;
mod filing_db;
mod gate;
mod google;
mod layout;
mod llm_extract;
mod pdf_extract;
mod record;
mod sink;

use batch::BatchDriver;
use clap::{Parser, Subcommand};
use config::Config;
use filing_db::FilingLedger;
use gate::FsLifecycleStore;
use google::{GoogleClient, GoogleTemplate, GoogleTracking};
use llm_extract::{ConsistencyPolicy, LlmOracle};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "po_filing")]
#[command(about = "File purchase-order PDFs into per-style PO workbooks")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, env = "PO_FILING_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// File every PDF in the intake folder (the default).
    Run,
    /// Extract and classify one PDF without writing anything.
    Check { pdf: PathBuf },
    /// Drop a PDF from the ledger so it can be filed again.
    Forget { pdf: PathBuf },
    /// Show ledger and intake counts.
    Status,
}

fn open_ledger(cfg: &Config) -> Result<FilingLedger, Box<dyn std::error::Error>> {
    if let Some(parent) = Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(FilingLedger::new(&cfg.db_path)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Install crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);
    let config_path = Config::resolve_path(cli.config.as_deref());
    let cfg = Config::load(&config_path)?;
    info!(config = %config_path.display(), "Configuration loaded");
    let ledger = open_ledger(&cfg)?;

    match command {
        Commands::Status => {
            let (filed, destinations) = ledger.get_counts()?;
            let queued = batch::list_intake(&cfg.paths.intake_dir)?.len();
            info!(filed, destinations, queued, "Filing statistics");
            return Ok(());
        }
        Commands::Forget { pdf } => {
            let hash = FilingLedger::document_hash(&std::fs::read(&pdf)?);
            if ledger.forget(&hash)? {
                info!(file = %pdf.display(), "Ledger entry removed; the PDF can be filed again");
            } else {
                info!(file = %pdf.display(), "PDF was not in the ledger");
            }
            return Ok(());
        }
        Commands::Run | Commands::Check { .. } => {}
    }

    let oracle = LlmOracle::connect(&cfg.llm, cfg.prompt()?).await?;
    let google = GoogleClient::connect(&cfg.google).await?;
    let tracking = GoogleTracking::new(google.clone(), &cfg.google);
    let template = GoogleTemplate::new(google, &cfg.google);
    let lifecycle = FsLifecycleStore;

    let driver = BatchDriver {
        oracle: &oracle,
        tracking: &tracking,
        template: &template,
        lifecycle: &lifecycle,
        ledger: &ledger,
        layout: &cfg.layout,
        policy: ConsistencyPolicy::from_config(&cfg.llm),
        intake_dir: &cfg.paths.intake_dir,
        filing_root: &cfg.paths.filing_root,
    };

    match command {
        Commands::Check { pdf } => {
            let report = driver.check_file(&pdf).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            driver.run().await?;
        }
    }

    Ok(())
}
