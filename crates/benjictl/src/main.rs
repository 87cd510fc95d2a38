use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Once;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use benji_common::{Config, Version, VersionUid};
use benji_engine::{
    BackupRequest, CleanupOptions, Engine, RestoreRequest, ScrubMode,
};
use benji_io::hints::read_hints_file;
use benji_meta::MetaStore;
use benji_nbd::NbdServer;

fn init_tracing(log_file: Option<&PathBuf>) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var("BENJI_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

        // Logs always go to stderr (or the configured file); stdout is
        // reserved for machine-readable output.
        if let Some(path) = log_file {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(env_filter)
                        .with_writer(file)
                        .with_ansi(false)
                        .init();
                    return;
                }
                Err(err) => eprintln!("cannot open log file {}: {err}", path.display()),
            }
        }

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .compact()
                .init();
        }
    });
}

#[derive(Parser)]
#[command(name = "benjictl")]
#[command(about = "Block-level deduplicating backup", long_about = None)]
struct Cli {
    /// Configuration file (overrides the default search order).
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Machine-readable JSON on stdout.
    #[arg(short = 'm', long, global = true)]
    machine: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a source image to the default storage
    Backup {
        /// Source URI (file:..., rbd:..., iscsi:...)
        source: String,
        /// Volume name the version belongs to
        volume: String,
        /// Snapshot name recorded on the version
        #[arg(short, long, default_value = "")]
        snapshot: String,
        /// Base version uid for a differential backup
        #[arg(long)]
        base_version: Option<String>,
        /// Sparse-region hints file (rbd diff --format=json)
        #[arg(long)]
        hints_file: Option<PathBuf>,
        /// Explicit version uid
        #[arg(long)]
        uid: Option<String>,
        /// Labels as name=value, repeatable
        #[arg(short, long)]
        label: Vec<String>,
    },
    /// Restore a version into a destination image
    Restore {
        version_uid: String,
        /// Destination URI
        destination: String,
        /// Skip all-zero blocks (leaves holes / unmapped regions)
        #[arg(long)]
        sparse: bool,
        /// Overwrite a non-empty destination
        #[arg(long)]
        force: bool,
        /// Restore from the storage-embedded metadata, without a database
        #[arg(long)]
        database_less: bool,
        /// Storage holding the metadata object for --database-less
        #[arg(long)]
        storage: Option<String>,
    },
    /// List versions
    Ls {
        /// Filter expression
        filter: Option<String>,
    },
    /// Remove versions (logical; objects go through cleanup)
    Rm {
        version_uids: Vec<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        override_lock: bool,
    },
    /// Delete expired unreferenced objects from the storages
    Cleanup {
        /// Grace window in hours before a candidate may be swept
        #[arg(long, default_value_t = 1.0)]
        grace_hours: f64,
        /// Also sweep objects no block references at all
        #[arg(long)]
        full: bool,
        #[arg(long)]
        override_lock: bool,
    },
    /// Protect versions from removal
    Protect { version_uids: Vec<String> },
    /// Remove removal protection
    Unprotect { version_uids: Vec<String> },
    /// Add (name=value) or remove (name-) labels
    Label {
        version_uid: String,
        labels: Vec<String>,
    },
    /// Verify object existence and sidecar integrity
    Scrub {
        version_uid: String,
        #[arg(long, default_value_t = 100)]
        block_percentage: u8,
    },
    /// Verify object contents against recorded checksums
    DeepScrub {
        version_uid: String,
        #[arg(long, default_value_t = 100)]
        block_percentage: u8,
        /// Also compare against a live source URI
        #[arg(long)]
        source: Option<String>,
    },
    /// Scrub all versions matching a filter
    BatchScrub {
        filter: Option<String>,
        #[arg(long, default_value_t = 100)]
        version_percentage: u8,
        #[arg(long, default_value_t = 100)]
        block_percentage: u8,
    },
    /// Deep-scrub all versions matching a filter
    BatchDeepScrub {
        filter: Option<String>,
        #[arg(long, default_value_t = 100)]
        version_percentage: u8,
        #[arg(long, default_value_t = 100)]
        block_percentage: u8,
    },
    /// Export version metadata as JSON
    MetadataExport {
        version_uids: Vec<String>,
        /// Output file, - for stdout
        #[arg(short, long, default_value = "-")]
        output: String,
    },
    /// Import version metadata from JSON
    MetadataImport {
        /// Input file, - for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
    },
    /// Re-embed metadata documents on the version storages
    MetadataBackup { filter: Option<String> },
    /// Import versions from a storage's embedded metadata
    MetadataRestore {
        #[arg(long)]
        storage: String,
        version_uids: Vec<String>,
    },
    /// List metadata documents on a storage
    MetadataLs {
        #[arg(long)]
        storage: String,
    },
    /// Apply a retention policy (latestN,hoursN,daysN,weeksN,monthsN,yearsN)
    Enforce {
        policy: String,
        filter: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        override_lock: bool,
    },
    /// Object count and byte totals per storage
    StorageStats {
        /// Storage name; all storages when omitted
        storage: Option<String>,
    },
    /// Exclusive/shared byte attribution per version
    StorageUsage { filter: Option<String> },
    /// Create the database schema
    DatabaseInit {
        #[arg(long)]
        force: bool,
    },
    /// Migrate the database schema to this binary's version
    DatabaseMigrate,
    /// Serve versions as NBD exports
    Nbd {
        #[arg(long)]
        read_only: bool,
    },
    /// Show one version in detail
    VersionInfo { version_uid: String },
}

fn parse_labels(labels: &[String]) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for label in labels {
        let (name, value) = label
            .split_once('=')
            .with_context(|| format!("label {label:?} is not name=value"))?;
        parsed.insert(name.to_string(), value.to_string());
    }
    Ok(parsed)
}

fn uids(raw: &[String]) -> Vec<VersionUid> {
    raw.iter().map(|uid| VersionUid::new(uid.as_str())).collect()
}

fn print_versions(versions: &[Version], machine: bool) -> Result<()> {
    if machine {
        println!("{}", serde_json::to_string_pretty(versions)?);
        return Ok(());
    }
    println!("uid\tdate\tvolume\tsnapshot\tsize\tblock_size\tstatus\tprotected\tstorage\tlabels");
    for version in versions {
        let labels = version
            .labels
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            version.uid,
            benji_common::format_timestamp(&version.date),
            version.volume,
            version.snapshot,
            version.size,
            version.block_size,
            version.status,
            version.protected,
            version.storage,
            labels
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Database administration does not need (or want) a fully wired engine.
    match &cli.command {
        Commands::DatabaseInit { force } => {
            let config = Config::load(cli.config.as_deref())?;
            init_tracing(config.log_file.as_ref());
            let store = MetaStore::open(&config.database_engine)?;
            store.init(*force)?;
            println!("database initialized");
            return Ok(());
        }
        Commands::DatabaseMigrate => {
            let config = Config::load(cli.config.as_deref())?;
            init_tracing(config.log_file.as_ref());
            let store = MetaStore::open(&config.database_engine)?;
            store.migrate()?;
            println!("database migrated");
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load(cli.config.as_deref())?;
    init_tracing(config.log_file.as_ref());
    let engine = Engine::open(config)?;

    match cli.command {
        Commands::Backup {
            source,
            volume,
            snapshot,
            base_version,
            hints_file,
            uid,
            label,
        } => {
            let hints = match &hints_file {
                Some(path) => Some(read_hints_file(path)?),
                None => None,
            };
            let version = engine.backup(BackupRequest {
                source,
                volume,
                snapshot,
                base_version: base_version.map(|uid| VersionUid::new(uid.as_str())),
                hints,
                uid: uid.map(|uid| VersionUid::new(uid.as_str())),
                labels: parse_labels(&label)?,
            })?;
            print_versions(std::slice::from_ref(&version), cli.machine)?;
        }
        Commands::Restore {
            version_uid,
            destination,
            sparse,
            force,
            database_less,
            storage,
        } => {
            let report = engine.restore(RestoreRequest {
                version: VersionUid::new(version_uid.as_str()),
                destination,
                sparse,
                force,
                database_less,
                metadata_storage: storage,
            })?;
            if cli.machine {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "restored {} blocks ({} sparse, {} failed)",
                    report.blocks_restored, report.blocks_sparse, report.blocks_failed
                );
            }
            if report.blocks_failed > 0 {
                bail!("{} blocks failed integrity during restore", report.blocks_failed);
            }
        }
        Commands::Ls { filter } => {
            let versions = engine.ls(filter.as_deref())?;
            print_versions(&versions, cli.machine)?;
        }
        Commands::Rm {
            version_uids,
            force,
            override_lock,
        } => {
            for uid in uids(&version_uids) {
                let enqueued = engine.remove(&uid, force, override_lock)?;
                println!("removed {uid} ({enqueued} objects queued for cleanup)");
            }
        }
        Commands::Cleanup {
            grace_hours,
            full,
            override_lock,
        } => {
            let report = engine.cleanup(CleanupOptions {
                grace_hours,
                full,
                override_lock,
            })?;
            if cli.machine {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "deleted {} objects ({} rescued, {} orphans)",
                    report.objects_deleted, report.candidates_rescued, report.orphans_deleted
                );
            }
        }
        Commands::Protect { version_uids } => {
            for uid in uids(&version_uids) {
                engine.protect(&uid, true)?;
            }
        }
        Commands::Unprotect { version_uids } => {
            for uid in uids(&version_uids) {
                engine.protect(&uid, false)?;
            }
        }
        Commands::Label {
            version_uid,
            labels,
        } => {
            engine.label(&VersionUid::new(version_uid.as_str()), &labels)?;
        }
        Commands::Scrub {
            version_uid,
            block_percentage,
        } => {
            let uid = VersionUid::new(version_uid.as_str());
            let report = engine.scrub(&uid, ScrubMode::Light, block_percentage)?;
            println!(
                "checked {} blocks, {} failed",
                report.blocks_checked, report.blocks_failed
            );
            if !report.passed() {
                bail!("scrub of {uid} found {} invalid blocks", report.blocks_failed);
            }
        }
        Commands::DeepScrub {
            version_uid,
            block_percentage,
            source,
        } => {
            let uid = VersionUid::new(version_uid.as_str());
            let report = engine.scrub(&uid, ScrubMode::Deep { source }, block_percentage)?;
            println!(
                "checked {} blocks, {} failed",
                report.blocks_checked, report.blocks_failed
            );
            if !report.passed() {
                bail!("deep-scrub of {uid} found {} invalid blocks", report.blocks_failed);
            }
        }
        Commands::BatchScrub {
            filter,
            version_percentage,
            block_percentage,
        } => {
            run_batch_scrub(
                &engine,
                filter.as_deref(),
                ScrubMode::Light,
                version_percentage,
                block_percentage,
            )?;
        }
        Commands::BatchDeepScrub {
            filter,
            version_percentage,
            block_percentage,
        } => {
            run_batch_scrub(
                &engine,
                filter.as_deref(),
                ScrubMode::Deep { source: None },
                version_percentage,
                block_percentage,
            )?;
        }
        Commands::MetadataExport {
            version_uids,
            output,
        } => {
            let json = engine.metadata_export(&uids(&version_uids))?;
            if output == "-" {
                println!("{json}");
            } else {
                std::fs::write(&output, json)
                    .with_context(|| format!("cannot write {output}"))?;
            }
        }
        Commands::MetadataImport { input } => {
            let json = if input == "-" {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            } else {
                std::fs::read_to_string(&input).with_context(|| format!("cannot read {input}"))?
            };
            let imported = engine.metadata_import(&json)?;
            for uid in imported {
                println!("imported {uid}");
            }
        }
        Commands::MetadataBackup { filter } => {
            let written = engine.metadata_backup(filter.as_deref())?;
            println!("embedded metadata for {} versions", written.len());
        }
        Commands::MetadataRestore {
            storage,
            version_uids,
        } => {
            let imported = engine.metadata_restore(&storage, &uids(&version_uids))?;
            for uid in imported {
                println!("imported {uid}");
            }
        }
        Commands::MetadataLs { storage } => {
            let listed = engine.metadata_ls(&storage)?;
            if cli.machine {
                println!("{}", serde_json::to_string_pretty(&listed)?);
            } else {
                for uid in listed {
                    println!("{uid}");
                }
            }
        }
        Commands::Enforce {
            policy,
            filter,
            dry_run,
            override_lock,
        } => {
            let report = engine.enforce(&policy, filter.as_deref(), dry_run, override_lock)?;
            if cli.machine {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for uid in &report.removed {
                    println!("{}{}", if dry_run { "would remove " } else { "removed " }, uid);
                }
                println!("kept {}, removed {}", report.kept.len(), report.removed.len());
            }
        }
        Commands::StorageStats { storage } => {
            let names = match storage {
                Some(name) => vec![name],
                None => engine.storage_names(),
            };
            let mut stats = Vec::with_capacity(names.len());
            for name in names {
                let (objects, bytes) = engine.storage_stats(&name)?;
                stats.push(serde_json::json!({
                    "storage": name,
                    "objects": objects,
                    "bytes": bytes,
                }));
            }
            if cli.machine {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                for entry in stats {
                    println!(
                        "{}\t{} objects\t{} bytes",
                        entry["storage"].as_str().unwrap_or(""),
                        entry["objects"],
                        entry["bytes"]
                    );
                }
            }
        }
        Commands::StorageUsage { filter } => {
            let usage = engine.storage_usage(filter.as_deref())?;
            if cli.machine {
                let rows: Vec<_> = usage
                    .iter()
                    .map(|(uid, report)| {
                        serde_json::json!({
                            "uid": uid,
                            "exclusive": report.exclusive,
                            "shared": report.shared,
                            "sparse": report.sparse,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("uid\texclusive\tshared\tsparse");
                for (uid, report) in usage {
                    println!(
                        "{uid}\t{}\t{}\t{}",
                        report.exclusive, report.shared, report.sparse
                    );
                }
            }
        }
        Commands::Nbd { read_only } => {
            let server = NbdServer::new(Arc::new(engine), read_only)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server.serve())?;
        }
        Commands::VersionInfo { version_uid } => {
            let (version, blocks) = engine.version_info(&VersionUid::new(version_uid.as_str()))?;
            if cli.machine {
                let mut value = serde_json::to_value(&version)?;
                value["blocks"] = serde_json::json!(blocks);
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_versions(std::slice::from_ref(&version), false)?;
                println!("blocks: {blocks}");
                println!(
                    "counters: read={} written={} deduplicated={} sparse={} duration={}s",
                    version.bytes_read,
                    version.bytes_written,
                    version.bytes_deduplicated,
                    version.bytes_sparse,
                    version.duration
                );
            }
        }
        Commands::DatabaseInit { .. } | Commands::DatabaseMigrate => unreachable!("handled above"),
    }

    Ok(())
}

fn run_batch_scrub(
    engine: &Engine,
    filter: Option<&str>,
    mode: ScrubMode,
    version_percentage: u8,
    block_percentage: u8,
) -> Result<()> {
    let report = engine.batch_scrub(filter, mode, version_percentage, block_percentage)?;
    let mut failed = 0u64;
    for (uid, scrubbed) in &report.scrubbed {
        println!(
            "{uid}: checked {} blocks, {} failed",
            scrubbed.blocks_checked, scrubbed.blocks_failed
        );
        failed += scrubbed.blocks_failed;
    }
    if failed > 0 {
        bail!("batch scrub found {failed} invalid blocks");
    }
    Ok(())
}
