//! Chronicle CLI
//!
//! Thin wrapper around chronicle-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Configure this device
//! chronicle init --client-id laptop --secret "correct horse battery staple"
//!
//! # Record a visit
//! chronicle add https://example.com "Example Domain"
//!
//! # List stored history
//! chronicle list
//!
//! # Attach a summary to every visit of a URL
//! chronicle annotate https://example.com "A reserved example domain"
//!
//! # Search titles, URLs, and summaries
//! chronicle search "example"
//!
//! # Tombstone a visit
//! chronicle delete <visit_id>
//!
//! # List known devices
//! chronicle devices
//!
//! # Run one sync cycle against the configured endpoint
//! chronicle sync --full
//!
//! # Keep syncing on the configured interval until Ctrl-C
//! chronicle serve
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use chronicle_core::{
    DeviceRecord, HistoryRecord, LocalIndexedStore, RecordQuery, RecordStore, RemoteSyncClient,
    StaticDeviceProbe, SyncCoordinator, SyncOutcome, SyncSettings,
};

/// Chronicle - encrypted multi-device history sync
#[derive(Parser)]
#[command(name = "chronicle")]
#[command(version = "0.1.0")]
#[command(about = "Chronicle - encrypted multi-device history sync")]
#[command(
    long_about = "Keeps browsing history consistent across devices without a server ever seeing plaintext URLs or titles."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.chronicle)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure this device and write the settings file
    Init {
        /// Client identifier for this device
        #[arg(long)]
        client_id: String,
        /// Secret phrase shared by all your devices
        #[arg(long)]
        secret: String,
        /// Centralized sync endpoint URL
        #[arg(long)]
        api_endpoint: Option<String>,
    },

    /// Record a visit
    Add {
        /// Visited URL
        url: String,
        /// Page title
        #[arg(default_value = "")]
        title: String,
    },

    /// List stored history
    List {
        /// Only records owned by this device id
        #[arg(long)]
        device: Option<String>,
        /// Only records modified at or after this epoch-millis timestamp
        #[arg(long)]
        since: Option<i64>,
        /// Include tombstoned records
        #[arg(long)]
        deleted: bool,
    },

    /// Tombstone a visit (it propagates as a deletion)
    Delete {
        /// Visit id to delete
        visit_id: String,
    },

    /// Attach a summary to every visit of a URL
    Annotate {
        /// The URL to annotate
        url: String,
        /// Summary text
        summary: String,
    },

    /// Search titles, URLs, and summaries
    Search {
        /// Substring to look for
        query: String,
    },

    /// List known devices
    Devices,

    /// Run one sync cycle
    Sync {
        /// Ignore the high-water mark and sync everything
        #[arg(long)]
        full: bool,
    },

    /// Sync on the configured interval until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("could not determine home directory")?
            .join(".chronicle"),
    };
    let settings_path = data_dir.join("settings.json");

    match cli.command {
        Commands::Init {
            client_id,
            secret,
            api_endpoint,
        } => {
            let mut settings = SyncSettings::load(&settings_path)?;
            settings.client_id = client_id;
            settings.secret = secret;
            if let Some(endpoint) = api_endpoint {
                settings.api_endpoint = endpoint;
            }
            settings.save(&settings_path)?;
            println!("Configured device '{}' at {}", settings.client_id, data_dir.display());
        }

        Commands::Add { url, title } => {
            let (settings, store) = open_store(&settings_path, &data_dir)?;
            let record = HistoryRecord::new(url, title, settings.client_id.clone());
            let visit_id = record.visit_id.clone();
            store.upsert_record(record).await?;
            println!("Recorded visit {}", visit_id);
        }

        Commands::List {
            device,
            since,
            deleted,
        } => {
            let (_, store) = open_store(&settings_path, &data_dir)?;
            let query = RecordQuery {
                device_id: device,
                since,
            };
            let mut records = store.query_records(query).await?;
            records.sort_by_key(|r| r.visit_time);
            for record in records {
                if record.deleted && !deleted {
                    continue;
                }
                let marker = if record.deleted { "x" } else { " " };
                println!(
                    "{} {}  {}  {}  {}",
                    marker,
                    record.visit_id,
                    format_time(record.visit_time),
                    record.url,
                    record.title
                );
            }
        }

        Commands::Delete { visit_id } => {
            let (_, store) = open_store(&settings_path, &data_dir)?;
            store.soft_delete(&visit_id).await?;
            println!("Deleted {}", visit_id);
        }

        Commands::Annotate { url, summary } => {
            let (_, store) = open_store(&settings_path, &data_dir)?;
            let updated = store.update_page_content(&url, &summary).await?;
            println!("Annotated {} record(s)", updated);
        }

        Commands::Search { query } => {
            let (_, store) = open_store(&settings_path, &data_dir)?;
            let hits = store.search(&query).await?;
            if hits.is_empty() {
                println!("No matches");
            }
            for hit in hits {
                println!("{}  {}", hit.record.visit_id, hit.record.url);
                for m in hit.matches {
                    println!("    {}: {}", m.field, m.context);
                }
            }
        }

        Commands::Devices => {
            let (_, store) = open_store(&settings_path, &data_dir)?;
            for device in store.list_devices().await? {
                println!(
                    "{}  {} {} {}  last seen {}",
                    device.device_id,
                    device.platform,
                    device.browser_name,
                    device.browser_version,
                    format_time(device.last_seen)
                );
            }
        }

        Commands::Sync { full } => {
            let (settings, store) = open_store(&settings_path, &data_dir)?;
            let coordinator = build_coordinator(&settings, store)?;
            match coordinator.run_cycle(full).await? {
                SyncOutcome::Completed(stats) => println!(
                    "Synced: {} sent, {} received, {} devices",
                    stats.sent, stats.received, stats.devices
                ),
                SyncOutcome::NothingToSync => println!("Nothing to sync"),
                SyncOutcome::AlreadyRunning => println!("Sync already running"),
            }
        }

        Commands::Serve => {
            let (settings, store) = open_store(&settings_path, &data_dir)?;
            let coordinator = build_coordinator(&settings, store)?;
            coordinator.clone().start();
            println!(
                "Syncing every {}s; press Ctrl-C to stop",
                settings.sync_interval_secs
            );
            tokio::signal::ctrl_c().await?;
            coordinator.stop();
        }
    }

    Ok(())
}

/// Load settings and open the durable store.
fn open_store(
    settings_path: &PathBuf,
    data_dir: &PathBuf,
) -> Result<(SyncSettings, Arc<LocalIndexedStore>)> {
    let settings = SyncSettings::load(settings_path)?;
    if settings.secret.is_empty() {
        bail!("no secret configured; run `chronicle init` first");
    }
    let crypto = settings.record_crypto()?;
    let db_path = settings
        .data_dir
        .clone()
        .unwrap_or_else(|| data_dir.clone())
        .join("history.redb");
    let store = LocalIndexedStore::open(db_path, crypto)?;
    Ok((settings, Arc::new(store)))
}

/// Wire a coordinator for the configured HTTP endpoint.
fn build_coordinator(
    settings: &SyncSettings,
    store: Arc<LocalIndexedStore>,
) -> Result<Arc<SyncCoordinator>> {
    let client_id = settings.ensure_client_id()?.to_string();
    let crypto = settings.record_crypto()?;
    let transport = Arc::new(RemoteSyncClient::new(
        settings.api_endpoint.clone(),
        client_id.clone(),
        crypto,
    )?);
    let probe = Arc::new(StaticDeviceProbe::new(DeviceRecord::new(
        client_id,
        std::env::consts::OS,
        "chronicle-cli",
        env!("CARGO_PKG_VERSION"),
    )));
    Ok(Arc::new(
        SyncCoordinator::new(store, transport, probe).with_interval(settings.sync_interval()),
    ))
}

/// Render an epoch-millis timestamp for display.
fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}
