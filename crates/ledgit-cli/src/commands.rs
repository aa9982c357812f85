use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use ledgit_blob::{
    BlobFailure, BlobStore, OptimizeOptions, PutHints, Targets, VerifyOptions, VerifyReport,
};
use ledgit_resilience::HealthStatus;
use ledgit_sync::{MigrateOptions, ProgressEvent, SyncEngine};
use ledgit_types::{LocationSet, ObjectId, StorageLocation};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::*;
use crate::repo::Repo;

/// How a command that ran to completion went.
pub enum Outcome {
    Clean,
    /// Some per-blob work failed; reported, exit code 1.
    Failures,
}

impl Outcome {
    fn from_failures(failed: usize) -> Self {
        if failed == 0 {
            Self::Clean
        } else {
            Self::Failures
        }
    }
}

pub async fn run_command(cli: Cli) -> anyhow::Result<Outcome> {
    let format = cli.format;
    match cli.command {
        Command::Init(args) => cmd_init(&cli.repo, args),
        Command::Storage(StorageArgs { action }) => {
            let repo = Repo::open(&cli.repo)?;
            let store = repo.blob_store()?;
            let outcome = match action {
                StorageCommand::Verify(args) => cmd_verify(&store, args, format).await,
                StorageCommand::Sync(args) => cmd_sync(&repo, Arc::clone(&store), args, format).await,
                StorageCommand::Optimize(args) => cmd_optimize(&store, args, format).await,
                StorageCommand::Stats => cmd_stats(&store, format),
                StorageCommand::Health(args) => cmd_health(&store, args, format).await,
                StorageCommand::Put(args) => cmd_put(&store, args, format).await,
                StorageCommand::Get(args) => cmd_get(&store, args).await,
                StorageCommand::Rebuild => cmd_rebuild(&store, format),
            };
            // A get may have promoted a remote blob to local.
            store.flush_index().await?;
            outcome
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_hashes(raw: &[String]) -> anyhow::Result<Targets> {
    if raw.is_empty() {
        return Ok(Targets::All);
    }
    let hashes = raw
        .iter()
        .map(|h| ObjectId::from_hex(h).with_context(|| format!("invalid blob hash {h:?}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Targets::Only(hashes))
}

/// A token cancelled by Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} interrupted, finishing in-flight work", "!".yellow().bold());
            child.cancel();
        }
    });
    token
}

fn print_failures(failed: &[BlobFailure]) {
    for f in failed {
        println!(
            "  {} {} [{}] {}",
            "✗".red(),
            f.hash.short_hex().yellow(),
            f.kind,
            f.message.dimmed()
        );
    }
}

fn cmd_init(root: &std::path::Path, args: InitArgs) -> anyhow::Result<Outcome> {
    let repo = Repo::init(root, args.remote_dir)?;
    println!(
        "{} Initialized ledgit storage in {}",
        "✓".green().bold(),
        repo.dir().display().to_string().bold()
    );
    match &repo.config().remote {
        Some(remote) => println!("  Remote: {} ({})", remote.id.cyan(), remote.path.display()),
        None => println!("  Remote: {}", "none".dimmed()),
    }
    Ok(Outcome::Clean)
}

async fn cmd_verify(store: &BlobStore, args: VerifyArgs, format: OutputFormat) -> anyhow::Result<Outcome> {
    let options = VerifyOptions {
        repair: args.repair,
        sync_missing: args.sync,
        cancel: interrupt_token(),
    };
    let report = store.verify_and_repair(parse_hashes(&args.blobs)?, options).await?;
    if format == OutputFormat::Json {
        print_json(&report)?;
    } else {
        print_verify(&report);
    }
    Ok(Outcome::from_failures(report.failed.len()))
}

fn print_verify(report: &VerifyReport) {
    let mark = if report.failed.is_empty() {
        "✓".green().bold()
    } else {
        "✗".red().bold()
    };
    println!(
        "{} Verified {}, repaired {}, failed {}, skipped {}",
        mark,
        report.verified.len().to_string().bold(),
        report.repaired.len().to_string().cyan(),
        report.failed.len().to_string().red(),
        report.skipped.len()
    );
    for hash in &report.repaired {
        println!("  {} {}", "repaired:".cyan(), hash.short_hex());
    }
    print_failures(&report.failed);
}

async fn cmd_sync(repo: &Repo, store: Arc<BlobStore>, args: SyncArgs, format: OutputFormat) -> anyhow::Result<Outcome> {
    let settings = &repo.config().sync;
    let (tx, mut rx) = mpsc::channel(256);
    let show_progress = format == OutputFormat::Text;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !show_progress {
                continue;
            }
            match event {
                ProgressEvent::Started { direction, total } => {
                    println!("{} {} ({} candidates)", "→".cyan(), direction.to_string().bold(), total)
                }
                ProgressEvent::Transferred { hash, bytes } => {
                    println!("  {} {} {} bytes", "copied".green(), hash.short_hex(), bytes)
                }
                ProgressEvent::Skipped { hash } => println!("  {} {}", "skipped".dimmed(), hash.short_hex()),
                ProgressEvent::Failed { hash, kind, message } => {
                    println!("  {} {} [{}] {}", "failed".red(), hash.short_hex(), kind, message.dimmed())
                }
                ProgressEvent::Finished { .. } => {}
            }
        }
    });

    let options = MigrateOptions {
        skip_existing: args.skip_existing,
        concurrency: args.concurrency.unwrap_or(settings.concurrency),
        adaptive: settings.adaptive,
        transfer_timeout: settings.transfer_timeout_ms.map(Duration::from_millis),
        cancel: interrupt_token(),
        progress: Some(tx),
    };
    let engine = SyncEngine::new(store);
    let report = engine
        .migrate(args.direction, parse_hashes(&args.blobs)?, options)
        .await?;
    printer.await.context("progress printer")?;

    if format == OutputFormat::Json {
        print_json(&report)?;
    } else {
        for pass in &report.passes {
            println!(
                "{} {}: transferred {} ({} bytes), skipped {}, failed {}",
                if pass.failed.is_empty() { "✓".green().bold() } else { "✗".red().bold() },
                pass.direction.to_string().bold(),
                pass.transferred.len(),
                pass.bytes,
                pass.skipped.len(),
                pass.failed.len()
            );
            print_failures(&pass.failed);
        }
    }
    Ok(Outcome::from_failures(report.failed().count()))
}

async fn cmd_optimize(store: &BlobStore, args: OptimizeArgs, format: OutputFormat) -> anyhow::Result<Outcome> {
    let all = args.selects_all();
    let options = OptimizeOptions {
        deduplicate: all || args.deduplicate,
        recompress: all || args.recompress,
        clean: all || args.clean,
        cancel: interrupt_token(),
    };
    let report = store.optimize(options).await?;
    if format == OutputFormat::Json {
        print_json(&report)?;
    } else {
        println!(
            "{} Deduplicated {}, recompressed {}, cleaned {}; saved {} bytes",
            "✓".green().bold(),
            report.deduplicated,
            report.recompressed,
            report.cleaned,
            report.savings.to_string().bold()
        );
        print_failures(&report.failed);
    }
    Ok(Outcome::from_failures(report.failed.len()))
}

fn cmd_stats(store: &BlobStore, format: OutputFormat) -> anyhow::Result<Outcome> {
    let stats = store.stats()?;
    if format == OutputFormat::Json {
        print_json(&stats)?;
        return Ok(Outcome::Clean);
    }
    println!("Blobs:        {} unique, {} references", stats.unique_blobs.to_string().bold(), stats.total_references);
    println!("Locations:    {} local, {} remote", stats.local_blobs, stats.remote_blobs);
    println!("Chunks:       {}", stats.chunk_count);
    println!("Aliases:      {}", stats.alias_count);
    println!("Logical size: {} bytes", stats.logical_bytes);
    println!("Stored size:  {} bytes", stats.local_stored_bytes);
    Ok(Outcome::Clean)
}

#[derive(Serialize)]
struct HealthReport {
    summary: ledgit_resilience::HealthSummary,
    recommendations: ledgit_resilience::Recommendations,
    breakers: Vec<ledgit_resilience::BreakerSnapshot>,
    patterns: Vec<ledgit_resilience::FailurePattern>,
}

async fn cmd_health(store: &BlobStore, args: HealthArgs, format: OutputFormat) -> anyhow::Result<Outcome> {
    let cancel = interrupt_token();
    if store.has_remote() {
        for _ in 0..args.probe {
            if let Err(e) = store.probe_remote(&cancel).await {
                tracing::debug!(error = %e, "probe failed");
            }
        }
    }
    let resilience = store.resilience();
    let report = HealthReport {
        summary: resilience.health().summary(),
        recommendations: resilience.recommendations(),
        breakers: resilience.breakers(),
        patterns: resilience.analytics().detect_patterns(0.1),
    };
    if format == OutputFormat::Json {
        print_json(&report)?;
        return Ok(Outcome::Clean);
    }

    let status = match report.summary.status {
        HealthStatus::Healthy => report.summary.status.to_string().green(),
        HealthStatus::Degraded => report.summary.status.to_string().yellow(),
        HealthStatus::Unhealthy => report.summary.status.to_string().red(),
    };
    println!("Network: {} ({} samples)", status.bold(), report.summary.samples);
    println!(
        "  success {:.0}%, mean {}ms, p95 {}ms",
        report.summary.success_rate * 100.0,
        report.summary.mean_latency_ms,
        report.summary.p95_latency_ms
    );
    let r = report.recommendations;
    println!(
        "Recommended: batch {}, concurrency {}, retries {}",
        r.batch_size, r.concurrency, r.retry_count
    );
    for b in &report.breakers {
        println!(
            "Breaker {}: {} ({} consecutive failures, opened {} times)",
            b.backend.cyan(),
            b.state.to_string().bold(),
            b.consecutive_failures,
            b.times_opened
        );
    }
    for p in &report.patterns {
        println!("{} {} x{} ({:.0}%)", "pattern".yellow(), p.signature, p.occurrences, p.confidence * 100.0);
        println!("  {}", p.recommendation.dimmed());
    }
    Ok(Outcome::Clean)
}

async fn cmd_put(store: &BlobStore, args: PutArgs, format: OutputFormat) -> anyhow::Result<Outcome> {
    let content = tokio::fs::read(&args.path)
        .await
        .with_context(|| format!("reading {}", args.path.display()))?;
    let mut hints = if args.remote {
        PutHints::at(LocationSet::both())
    } else {
        PutHints::default()
    };
    if let Some(ct) = args.content_type {
        hints = hints.with_content_type(ct);
    }
    let stored = store.put(&content, hints).await?;
    if format == OutputFormat::Json {
        print_json(&stored.meta)?;
    } else {
        let note = if stored.deduplicated { " (already stored)" } else { "" };
        println!("{}{}", stored.hash().to_hex(), note.dimmed());
    }
    Ok(Outcome::Clean)
}

async fn cmd_get(store: &BlobStore, args: GetArgs) -> anyhow::Result<Outcome> {
    let hash = ObjectId::from_hex(&args.hash).with_context(|| format!("invalid blob hash {:?}", args.hash))?;
    let preferred = args.prefer_remote.then_some(StorageLocation::Remote);
    let content = store.get(&hash, preferred).await?;
    match args.output {
        Some(path) => tokio::fs::write(&path, &content)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => std::io::stdout().write_all(&content)?,
    }
    Ok(Outcome::Clean)
}

fn cmd_rebuild(store: &BlobStore, format: OutputFormat) -> anyhow::Result<Outcome> {
    let report = store.rebuild_index()?;
    if format == OutputFormat::Json {
        print_json(&report)?;
    } else {
        println!(
            "{} Index rebuilt: {} blobs, {} chunks, {} stale locations dropped, {} unrecognized objects",
            "✓".green().bold(),
            report.blobs,
            report.chunks,
            report.dropped,
            report.unrecognized
        );
    }
    Ok(Outcome::Clean)
}
