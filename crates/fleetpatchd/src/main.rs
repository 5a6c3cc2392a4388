//! fleetpatchd — the Fleetpatch daemon.
//!
//! Single binary that assembles the patch orchestration stack:
//! - Journal (redb)
//! - Campaign engine (saga executor)
//! - Simulated fleet operations
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetpatchd serve --port 8480 --data-dir /var/lib/fleetpatch --config fleetpatch.toml
//! fleetpatchd run --campaign demos/campaign.toml --approve-after 3s
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fleetpatch_saga::{CampaignEngine, StartRequest};
use fleetpatch_state::JournalStore;
use fleetpatchd::config::{FleetpatchConfig, parse_duration};
use fleetpatchd::ops::SimulatedOps;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,fleetpatchd=debug,fleetpatch=debug";
const DEFAULT_PORT: u16 = 8480;
const DEFAULT_DATA_DIR: &str = "/var/lib/fleetpatch";

#[derive(Parser)]
#[command(name = "fleetpatchd", about = "Fleetpatch daemon")]
struct Cli {
    /// Path to fleetpatch.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API and resume unfinished campaigns.
    Serve {
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the journal.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run one campaign to completion and print its report.
    Run {
        /// Campaign definition (TOML).
        #[arg(long)]
        campaign: PathBuf,

        /// Approve automatically after this delay, e.g. "3s".
        #[arg(long)]
        approve_after: Option<String>,

        /// Keep the journal here instead of in memory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = FleetpatchConfig::load(cli.config.as_deref())?;

    let format = match cli.log_format {
        Some(format) => format,
        None => match config.daemon.log_format.as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("daemon.log_format: unknown format {other:?}"),
        },
    };
    init_tracing(format);

    match cli.command {
        Command::Serve { port, data_dir } => {
            let port = port.or(config.daemon.port).unwrap_or(DEFAULT_PORT);
            let data_dir = data_dir
                .or_else(|| config.daemon.data_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
            run_serve(&config, port, &data_dir).await
        }
        Command::Run {
            campaign,
            approve_after,
            data_dir,
        } => run_campaign(&config, &campaign, approve_after.as_deref(), data_dir.as_deref()).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_engine(config: &FleetpatchConfig, journal: JournalStore) -> anyhow::Result<CampaignEngine> {
    let settings = config.saga_settings()?;
    let ops = SimulatedOps::new(&config.simulation)?;
    info!(
        approval_timeout = ?settings.approval_timeout,
        hosts_per_cluster = config.simulation.hosts_per_cluster,
        "campaign engine configured"
    );
    Ok(CampaignEngine::new(journal, Arc::new(ops), settings))
}

async fn run_serve(config: &FleetpatchConfig, port: u16, data_dir: &Path) -> anyhow::Result<()> {
    info!("Fleetpatch daemon starting");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("fleetpatch.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let journal = JournalStore::open(&db_path)?;
    info!(path = ?db_path, "journal opened");

    let engine = build_engine(config, journal)?;

    let resumed = engine.resume_incomplete().await?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), campaigns = ?resumed, "resumed unfinished campaigns");
    }

    // ── Start API server ───────────────────────────────────────

    let router = fleetpatch_api::build_router(engine);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C. Campaigns still running resume from the
    // journal on the next start.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Fleetpatch daemon stopped");
    Ok(())
}

async fn run_campaign(
    config: &FleetpatchConfig,
    campaign: &Path,
    approve_after: Option<&str>,
    data_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(campaign)
        .with_context(|| format!("reading campaign {}", campaign.display()))?;
    let request: StartRequest = toml::from_str(&content)
        .with_context(|| format!("parsing campaign {}", campaign.display()))?;

    let journal = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            JournalStore::open(&dir.join("fleetpatch.redb"))?
        }
        None => JournalStore::open_in_memory()?,
    };
    let engine = build_engine(config, journal)?;

    let handle = engine.start(request).await?;
    let id = handle.id().to_string();
    info!(campaign = %id, "campaign started");

    if let Some(delay) = approve_after {
        let delay = parse_duration(delay)
            .with_context(|| format!("--approve-after: invalid duration {delay:?}"))?;
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match engine.approve(&id).await {
                Ok(_) => info!(campaign = %id, "approval sent"),
                Err(e) => warn!(campaign = %id, error = %e, "approval failed"),
            }
        });
    }

    // Echo progress entries as they land.
    let wait = handle.wait();
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut shown = 0;
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            _ = ticker.tick() => {
                let entries = handle.progress();
                for entry in entries.iter().skip(shown) {
                    info!(campaign = %id, %entry, "progress");
                }
                shown = entries.len();
            }
        }
    };
    for entry in handle.progress().iter().skip(shown) {
        info!(campaign = %id, %entry, "progress");
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.status.is_success() {
        bail!("campaign {id} ended with status {:?}", outcome.status);
    }
    Ok(())
}
