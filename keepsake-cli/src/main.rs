/*!
Keepsake CLI - Command-line interface for Keepsake backup archives.

Builds archives from a local data directory, restores them, and inspects or
verifies existing archives.
*/

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use keepsake_core::{
    create_local_orchestrator, detect_variant, ArchiveReader, AssetStorage, BackupConfig, CancellationToken,
    EntryHeader, LocalFileStorage, NoProgress, Progress, ProgressReporter, StreamingDecoder,
};
use serde_json::Value;
use tabled::{Table, Tabled};
use tokio::io::{AsyncRead, BufReader};
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "keepsake")]
#[command(about = "Backup archives for application state and assets")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "KEEPSAKE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an archive from a data directory
    Save {
        /// Directory holding the assets and the installed document
        #[arg(long)]
        data_dir: PathBuf,
        /// JSON document to archive instead of the installed one
        #[arg(long)]
        document: Option<PathBuf>,
        /// Archive file to write
        #[arg(long)]
        out: PathBuf,
    },
    /// Restore an archive into a data directory
    Restore {
        #[arg(long)]
        data_dir: PathBuf,
        /// Archive file to read
        #[arg(long)]
        archive: PathBuf,
        /// Also write the restored document as pretty JSON
        #[arg(long)]
        document_out: Option<PathBuf>,
    },
    /// List the entries of an archive
    Inspect {
        archive: PathBuf,
    },
    /// Decode the document of an archive without restoring anything
    Verify {
        archive: PathBuf,
    },
}

#[derive(Tabled)]
struct EntryInfo {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Kind")]
    kind: String,
}

/// Logs each new stage once and every update at debug level
#[derive(Default)]
struct LogProgress {
    stage: Mutex<String>,
}

impl ProgressReporter for LogProgress {
    fn report(&self, progress: Progress) {
        let mut stage = self.stage.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *stage != progress.stage {
            info!(percent = progress.percent.round() as u32, "{}", progress.stage);
            *stage = progress.stage.clone();
        }
        debug!(
            percent = progress.percent,
            current = progress.current,
            total = progress.total,
            stage = %progress.stage,
            "Progress"
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs)?;

    let config = match &cli.config {
        Some(path) => BackupConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BackupConfig::default(),
    };

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Interrupted, cancelling");
            interrupt.abort();
        }
    });

    match cli.command {
        Commands::Save {
            data_dir,
            document,
            out,
        } => save_archive(config, &data_dir, document.as_deref(), &out, &token).await?,
        Commands::Restore {
            data_dir,
            archive,
            document_out,
        } => restore_archive(config, &data_dir, &archive, document_out.as_deref(), &token).await?,
        Commands::Inspect { archive } => inspect_archive(&config, &archive).await?,
        Commands::Verify { archive } => verify_archive(&config, &archive, &token).await?,
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    keepsake_core::init_observability(json, verbose)?;
    Ok(())
}

async fn save_archive(
    config: BackupConfig,
    data_dir: &Path,
    document: Option<&Path>,
    out: &Path,
    token: &CancellationToken,
) -> Result<(), anyhow::Error> {
    check_out_path(data_dir, &config.asset_dir, out)?;
    let orchestrator = create_local_orchestrator(data_dir, config)?;

    let document: Value = match document {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading document {}", path.display()))?;
            serde_json::from_slice(&raw).with_context(|| format!("parsing document {}", path.display()))?
        }
        None => orchestrator
            .load_installed_document(token)
            .await
            .context("loading the installed document")?,
    };

    let destination = LocalFileStorage::new()
        .open_staged(&out.to_string_lossy())
        .await?;
    let report = orchestrator
        .save(&document, destination, &LogProgress::default(), token)
        .await?;

    println!("✓ Archive written to {}", out.display());
    println!("  Assets: {} ({})", report.assets, format_size(report.asset_bytes));
    println!(
        "  Document: {} ({}{})",
        format_size(report.document_bytes as u64),
        report.document_variant,
        if report.fell_back { ", fell back" } else { "" }
    );
    println!("  Archive size: {}", format_size(report.archive_bytes));
    println!("  SHA-256: {}", report.digest);
    Ok(())
}

fn resolve(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    })
}

/// Reject an output path inside the asset directory, where the staged
/// archive would be listed as an asset of itself
fn check_out_path(data_dir: &Path, asset_dir: &str, out: &Path) -> Result<(), anyhow::Error> {
    let assets = resolve(&data_dir.join(asset_dir));
    let out_dir = resolve(out.parent().unwrap_or_else(|| Path::new(".")));
    if out_dir.starts_with(&assets) {
        anyhow::bail!(
            "--out {} lies inside the asset directory {}",
            out.display(),
            assets.display()
        );
    }
    Ok(())
}

async fn restore_archive(
    config: BackupConfig,
    data_dir: &Path,
    archive: &Path,
    document_out: Option<&Path>,
    token: &CancellationToken,
) -> Result<(), anyhow::Error> {
    let orchestrator = create_local_orchestrator(data_dir, config)?;

    let file = tokio::fs::File::open(archive)
        .await
        .with_context(|| format!("opening archive {}", archive.display()))?;
    let len = file.metadata().await?.len();

    let report = orchestrator
        .restore(file, Some(len), &LogProgress::default(), token)
        .await?;

    if let Some(path) = document_out {
        let pretty = serde_json::to_vec_pretty(&report.document)?;
        tokio::fs::write(path, pretty)
            .await
            .with_context(|| format!("writing document to {}", path.display()))?;
    }

    println!("✓ Restored into {}", data_dir.display());
    println!(
        "  Assets: {} ({})",
        report.assets_restored,
        format_size(report.bytes_restored)
    );
    println!("  Document: {}", report.document_variant);
    Ok(())
}

/// Entry headers of an archive plus the document payload
///
/// Asset bodies are skipped, so memory stays bounded by the document size.
struct ArchiveListing {
    entries: Vec<EntryHeader>,
    document: Option<Vec<u8>>,
}

impl ArchiveListing {
    fn assets(&self) -> usize {
        self.entries.len() - usize::from(self.document.is_some())
    }
}

async fn scan_archive<R>(source: R, document_entry_name: &str) -> Result<ArchiveListing, anyhow::Error>
where
    R: AsyncRead + Unpin,
{
    let mut reader = ArchiveReader::new(source);
    let mut listing = ArchiveListing {
        entries: Vec::new(),
        document: None,
    };

    while let Some(header) = reader.next_entry().await? {
        if header.name == document_entry_name {
            listing.document = Some(reader.read_body().await?);
        }
        listing.entries.push(header);
    }
    Ok(listing)
}

async fn open_archive(archive: &Path) -> Result<BufReader<tokio::fs::File>, anyhow::Error> {
    let file = tokio::fs::File::open(archive)
        .await
        .with_context(|| format!("opening archive {}", archive.display()))?;
    Ok(BufReader::new(file))
}

fn listing_rows(listing: &ArchiveListing, document_entry_name: &str) -> Vec<EntryInfo> {
    listing
        .entries
        .iter()
        .map(|header| {
            let kind = match (&listing.document, header.name == document_entry_name) {
                (Some(payload), true) => match detect_variant(payload) {
                    Ok(variant) => format!("document ({variant})"),
                    Err(e) => format!("document (unreadable: {e})"),
                },
                _ => "asset".to_string(),
            };
            EntryInfo {
                name: header.name.clone(),
                size: format_size(header.len),
                kind,
            }
        })
        .collect()
}

async fn inspect_archive(config: &BackupConfig, archive: &Path) -> Result<(), anyhow::Error> {
    let listing = scan_archive(open_archive(archive).await?, &config.document_entry_name).await?;
    let rows = listing_rows(&listing, &config.document_entry_name);

    if rows.is_empty() {
        println!("Archive is empty");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

async fn verify_archive(
    config: &BackupConfig,
    archive: &Path,
    token: &CancellationToken,
) -> Result<(), anyhow::Error> {
    let listing = scan_archive(open_archive(archive).await?, &config.document_entry_name).await?;
    let assets = listing.assets();

    let Some(payload) = listing.document else {
        error!("✗ Archive has no '{}' entry", config.document_entry_name);
        return Err(anyhow::anyhow!("document entry missing"));
    };

    let variant = detect_variant(&payload)?;
    let decoded = StreamingDecoder::default()
        .decode(&payload, &NoProgress, token)
        .await?;

    println!("✓ Archive is readable");
    println!("  Assets: {assets}");
    println!("  Document: {} ({})", format_size(payload.len() as u64), variant);
    if let Some(fields) = decoded.as_object() {
        println!("  Top-level fields: {}", fields.len());
        for (key, value) in fields {
            if let Some(items) = value.as_array() {
                println!("    {key}: {} elements", items.len());
            }
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
