use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reconcile::{
    DraftBuilder, EntityKind, FieldSync, LocalId, ResetConfirmation, SyncConfig,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first field records: drafts, sync and repair")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON); defaults are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a new draft
    Draft {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,

        /// Payload as inline JSON
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,

        /// Payload read from a JSON file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Files to attach (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },

    /// Mark a record submitted
    Submit {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        local_id: i64,
    },

    /// Soft-delete a record
    Delete {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        local_id: i64,
    },

    /// List records, pulling from the remote first
    List {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,

        /// Skip the remote and read the local copy only
        #[arg(long)]
        offline: bool,
    },

    /// Pull every collection and push pending records
    Sync,

    /// Fold duplicate records
    Repair {
        /// Also move dossier sign-offs into the latest live dossier
        #[arg(long)]
        rescue: bool,
    },

    /// Pending counts, progress and quarantined records
    Status,

    /// Put a quarantined record back in the queue
    Release {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        local_id: i64,
    },

    /// Re-download one collection, keeping local drafts
    Rebuild {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,

        /// Must be the exact reset phrase
        #[arg(long)]
        confirm: String,
    },

    /// Erase all local data, unsynced drafts included
    Reset {
        /// Must be the exact reset phrase
        #[arg(long)]
        confirm: String,
    },

    /// Run the background scheduler until interrupted
    Daemon,

    /// Write the effective configuration to a file
    InitConfig { output: PathBuf },
}

fn parse_kind(raw: &str) -> std::result::Result<EntityKind, String> {
    raw.parse::<EntityKind>().map_err(|e| e.to_string())
}

#[derive(Serialize)]
struct StatusReport {
    progress: f64,
    pending: BTreeMap<EntityKind, usize>,
    quarantined: BTreeMap<EntityKind, usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    if let Commands::InitConfig { output } = &cli.command {
        config.save(output)?;
        info!("configuration written to {}", output.display());
        return Ok(());
    }

    let engine = FieldSync::open(config.clone())
        .with_context(|| format!("opening local store at {}", config.db_path.display()))?;

    match cli.command {
        Commands::Draft {
            kind,
            json,
            file,
            attachments,
        } => draft_command(&engine, kind, json, file, attachments),
        Commands::Submit { kind, local_id } => {
            engine.submit(kind, LocalId(local_id))?;
            info!("{kind} {local_id} submitted");
            Ok(())
        }
        Commands::Delete { kind, local_id } => {
            engine.delete_draft(kind, LocalId(local_id))?;
            info!("{kind} {local_id} deleted");
            Ok(())
        }
        Commands::List { kind, offline } => list_command(&engine, kind, offline).await,
        Commands::Sync => sync_command(&engine).await,
        Commands::Repair { rescue } => {
            let folded = engine.repair_duplicates()?;
            info!("{folded} duplicate records folded");
            if rescue {
                let rescued = engine.rescue_orphans()?;
                info!("{rescued} dossiers rescued");
            }
            Ok(())
        }
        Commands::Status => status_command(&engine),
        Commands::Release { kind, local_id } => {
            if engine.release_quarantine(kind, LocalId(local_id))? {
                info!("{kind} {local_id} released");
            } else {
                warn!("{kind} {local_id} was not quarantined");
            }
            Ok(())
        }
        Commands::Rebuild { kind, confirm } => {
            let report = engine
                .rebuild(kind, &ResetConfirmation::new(confirm))
                .await
                .with_context(|| format!("rebuilding {kind}"))?;
            info!(
                "{kind} rebuilt: {} downloaded, {} drafts restored, backup in {}",
                report.downloaded, report.drafts_restored, report.backup_table
            );
            Ok(())
        }
        Commands::Reset { confirm } => {
            let summary = engine.reset(ResetConfirmation::new(confirm))?;
            warn!(
                "local data erased: {} records, {} pending uploads",
                summary.records_removed, summary.blobs_removed
            );
            Ok(())
        }
        Commands::Daemon => daemon_command(&engine).await,
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn draft_command(
    engine: &FieldSync,
    kind: EntityKind,
    json: Option<String>,
    file: Option<PathBuf>,
    attachments: Vec<PathBuf>,
) -> Result<()> {
    let raw = match (json, file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => bail!("either --json or --file is required"),
    };
    let payload: serde_json::Value = serde_json::from_str(&raw).context("payload is not valid JSON")?;

    let mut builder = DraftBuilder::new(kind, payload).import_inline()?;
    for path in &attachments {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("attachment")
            .to_string();
        builder = builder.attach(id, bytes, content_type(path), None);
    }

    let local_id = engine.save_draft_with(kind, builder.build())?;
    println!("{local_id}");
    Ok(())
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

async fn list_command(engine: &FieldSync, kind: EntityKind, offline: bool) -> Result<()> {
    if offline {
        engine.set_online(false);
    }
    let listing = engine.get_records(kind).await?;
    if listing.cached_only {
        warn!("remote unavailable; showing local copy");
    }
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

async fn sync_command(engine: &FieldSync) -> Result<()> {
    let pulled = engine.coordinator().pull_all().await;
    info!(
        "pulled {} rows ({} new, {} replaced, {} merged)",
        pulled.fetched, pulled.inserted, pulled.replaced, pulled.merged
    );
    let report = engine.sync_now().await?;
    info!(
        "pushed {} records ({} failed, {} rejected, {} quarantined)",
        report.synced, report.failed, report.rejected, report.quarantined
    );
    Ok(())
}

fn status_command(engine: &FieldSync) -> Result<()> {
    let mut quarantined = BTreeMap::new();
    for kind in EntityKind::ALL {
        let held = engine.quarantined(kind)?.len();
        if held > 0 {
            quarantined.insert(kind, held);
        }
    }
    let status = StatusReport {
        progress: engine.sync_progress()?,
        pending: engine.pending_counts()?,
        quarantined,
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn daemon_command(engine: &FieldSync) -> Result<()> {
    engine.start().await?;
    let mut notices = engine.notices();
    info!("scheduler running; press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Ok(n) => info!(
                    "new {} on the remote: {}",
                    n.kind,
                    n.official_id.as_deref().unwrap_or("(no official id)")
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{skipped} remote notices skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown().await;
    info!("scheduler stopped");
    Ok(())
}
