mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ecocert_archive_core::{ArchiveConfig, ArchiveStatistics, IdentifierOutcome, ProcessingStatus};
use ecocert_archive_pipeline::{
    ContentUploader, FetcherConfig, GracefulShutdown, HttpFetcher, MockAttestationSource,
    Orchestrator, PinataClient, PinataConfig, StagingArea, UrlPolicy, ValidationPolicy,
    STALE_AFTER,
};
use ecocert_archive_store_sqlite::{ArchiveStore, RetryPolicy, SqliteStore, StoreHealth};
use serde_json::{json, Value};

use crate::settings::{init_tracing, Settings};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Parser)]
#[command(name = "ecocert-archive")]
#[command(version, about = "Archive content cited by ecocert attestations to a pinning service")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the pipeline over every identifier the source knows
    ProcessAll,
    /// Run the pipeline over specific identifiers
    Process(ProcessArgs),
    Stats(StatsArgs),
    /// Re-run retry-eligible failed records
    Retry(RetryArgs),
    /// Readiness of the record store and the pinning service
    Health(HealthArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct ProcessArgs {
    #[arg(required = true)]
    ids: Vec<String>,
}

#[derive(Debug, Args)]
struct StatsArgs {
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = false)]
    by_identifier: bool,
}

#[derive(Debug, Args)]
struct RetryArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Args)]
struct HealthArgs {
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Migrate,
    SchemaVersion,
    /// Drop every table and re-create the schema
    Reset(DbResetArgs),
}

#[derive(Debug, Args)]
struct DbResetArgs {
    /// Required; the reset deletes all archive history
    #[arg(long, default_value_t = false)]
    confirm: bool,
}

enum PipelineCommand {
    ProcessAll,
    Process(Vec<String>),
    Retry(usize),
}

fn emit_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = cli.settings.into_config();
    config.validate().context("invalid configuration")?;

    match cli.command {
        Command::ProcessAll => run_pipeline(&config, PipelineCommand::ProcessAll).await,
        Command::Process(args) => run_pipeline(&config, PipelineCommand::Process(args.ids)).await,
        Command::Retry(args) => run_pipeline(&config, PipelineCommand::Retry(args.limit)).await,
        Command::Stats(args) => run_stats(&config, &args).await,
        Command::Health(args) => run_health(&config, &args).await,
        Command::Db { command } => run_db(&config, command),
    }
}

fn open_sqlite(config: &ArchiveConfig) -> Result<SqliteStore> {
    let path = config.database_path.display();
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("failed to open database {path}"))?;
    Ok(store.with_retry_policy(RetryPolicy {
        max_attempts: config.max_retry_attempts,
        ..RetryPolicy::default()
    }))
}

fn open_store(config: &ArchiveConfig) -> Result<ArchiveStore> {
    let mut store = open_sqlite(config)?;
    store.migrate().context("failed to migrate database")?;
    Ok(ArchiveStore::spawn(store)?)
}

fn pinata_client(config: &ArchiveConfig) -> Result<PinataClient> {
    let client = PinataClient::new(PinataConfig {
        api_url: config.pinata_api_url.clone(),
        gateway_url: config.gateway_url.clone(),
        jwt: config.pinata_jwt.clone().unwrap_or_default(),
        timeout: config.request_timeout(),
        validation: ValidationPolicy {
            max_size: config.max_file_size_bytes(),
            enforce_mime_allowlist: config.enforce_mime_allowlist,
            block_suspicious_content: config.block_suspicious_content,
        },
        concurrency: config.upload_concurrency,
    })?;
    Ok(client)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for ctrl-c; graceful shutdown disabled");
        std::future::pending::<()>().await;
    }
}

async fn run_pipeline(config: &ArchiveConfig, command: PipelineCommand) -> Result<()> {
    let pinata = pinata_client(config).context("pinning service is not configured")?;
    if !pinata.health_check().await {
        bail!("pinning service health check failed; refusing to start");
    }

    let store = open_store(config)?;
    let staging_dir = config.staging_dir.display();
    let staging = StagingArea::create(&config.staging_dir)
        .await
        .with_context(|| format!("failed to create staging dir {staging_dir}"))?;
    if let Err(err) = staging.sweep_stale(STALE_AFTER).await {
        tracing::warn!(error = %err, "initial staging sweep failed");
    }
    let sweeper = staging.spawn_sweeper(SWEEP_INTERVAL);

    let fetcher = HttpFetcher::new(
        staging.clone(),
        FetcherConfig {
            max_size: config.max_file_size_bytes(),
            timeout: config.request_timeout(),
            policy: UrlPolicy {
                https_only: config.https_only(),
                allowed_hosts: config.allowed_hosts.clone(),
            },
            concurrency: config.fetch_concurrency,
        },
    )?;
    let orchestrator = Orchestrator::new(
        Arc::new(MockAttestationSource::sample()),
        Arc::new(fetcher),
        Arc::new(pinata),
        store.clone(),
    )
    .with_identifier_concurrency(config.identifier_concurrency)
    .with_url_concurrency(config.fetch_concurrency);

    let work = async {
        match command {
            PipelineCommand::ProcessAll => orchestrator
                .process_all()
                .await
                .map(|outcomes| batch_report(&outcomes)),
            PipelineCommand::Process(ids) => {
                Ok(batch_report(&orchestrator.process_batch(&ids).await))
            }
            PipelineCommand::Retry(limit) => orchestrator
                .retry_scheduler()
                .retry_failed(limit)
                .await
                .map(|summary| json!(summary)),
        }
    };

    let outcome = GracefulShutdown::new(staging, store)
        .run(work, shutdown_signal())
        .await;
    sweeper.abort();

    let report = outcome
        .into_inner()
        .ok_or_else(|| anyhow!("shutdown grace period elapsed before work finished"))?;
    emit_json(&report?)
}

fn batch_report(outcomes: &[IdentifierOutcome]) -> Value {
    let completed = outcomes
        .iter()
        .filter(|o| o.status == ProcessingStatus::Completed)
        .count();
    json!({
        "identifiers": outcomes.len(),
        "completed": completed,
        "failed": outcomes.len() - completed,
        "urls_extracted": outcomes.iter().map(|o| o.urls_extracted).sum::<usize>(),
        "urls_archived": outcomes.iter().map(|o| o.urls_archived).sum::<usize>(),
        "outcomes": outcomes,
    })
}

async fn pinning_healthy(config: &ArchiveConfig) -> bool {
    match pinata_client(config) {
        Ok(client) => client.health_check().await,
        Err(err) => {
            tracing::debug!(error = %err, "pinning client unavailable");
            false
        }
    }
}

async fn run_stats(config: &ArchiveConfig, args: &StatsArgs) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.compute_statistics().await?;
    let store_health = store.health_check().await?;
    let summaries = if args.by_identifier {
        Some(store.list_identifier_summaries().await?)
    } else {
        None
    };
    store.close().await;
    let pinning_ok = pinning_healthy(config).await;

    if args.json {
        let mut report = json!({
            "statistics": stats,
            "health": { "store": store_health, "pinning_service": pinning_ok },
        });
        if let Some(summaries) = summaries {
            report["identifiers"] = json!(summaries);
        }
        return emit_json(&report);
    }

    print_statistics(&stats);
    println!();
    println!("store healthy:        {}", store_health.is_healthy());
    println!("pinning reachable:    {pinning_ok}");
    if let Some(summaries) = summaries {
        println!();
        println!(
            "{:<72} {:>6} {:>6} {:>9} {:>6}",
            "identifier", "atts", "urls", "completed", "failed"
        );
        for row in summaries {
            println!(
                "{:<72} {:>6} {:>6} {:>9} {:>6}",
                row.identifier_id,
                row.attestation_count,
                row.archived_content_count,
                row.completed_count,
                row.failed_count
            );
        }
    }
    Ok(())
}

fn print_statistics(stats: &ArchiveStatistics) {
    println!(
        "identifiers:          {} ({} processed)",
        stats.total_identifiers, stats.processed_identifiers
    );
    println!("attestations:         {}", stats.total_attestations);
    println!("urls:                 {}", stats.total_urls);
    println!(
        "  pending/downloading/uploading: {}/{}/{}",
        stats.pending, stats.downloading, stats.uploading
    );
    println!("  completed:          {}", stats.completed);
    println!("  failed:             {}", stats.failed);
    println!("avg urls/identifier:  {:.2}", stats.average_urls_per_identifier);
    println!("success rate:         {:.1}%", stats.success_rate);
}

async fn run_health(config: &ArchiveConfig, args: &HealthArgs) -> Result<()> {
    let store_health: Result<StoreHealth> = match open_store(config) {
        Ok(store) => {
            let health = store.health_check().await.map_err(anyhow::Error::from);
            store.close().await;
            health
        }
        Err(err) => Err(err),
    };
    let pinning_ok = pinning_healthy(config).await;
    let store_ok = store_health.as_ref().is_ok_and(StoreHealth::is_healthy);
    let healthy = store_ok && pinning_ok;

    if args.json {
        let store = match &store_health {
            Ok(health) => json!(health),
            Err(err) => json!({ "error": format!("{err:#}") }),
        };
        emit_json(&json!({
            "healthy": healthy,
            "store": store,
            "pinning_service": pinning_ok,
        }))?;
    } else {
        match &store_health {
            Ok(health) => {
                let state = if health.is_healthy() {
                    "ok"
                } else {
                    "unhealthy"
                };
                println!("store:            {state}");
            }
            Err(err) => println!("store:            error ({err:#})"),
        }
        let pinning = if pinning_ok { "ok" } else { "unavailable" };
        println!("pinning service:  {pinning}");
    }

    if !healthy {
        bail!("system is not healthy");
    }
    Ok(())
}

fn run_db(config: &ArchiveConfig, command: DbCommand) -> Result<()> {
    let mut store = open_sqlite(config)?;
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(&json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.is_current(),
            }))
        }
        DbCommand::Migrate => {
            let before = store.schema_status()?;
            let after = store.migrate()?;
            emit_json(&json!({
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.is_current(),
            }))
        }
        DbCommand::Reset(args) => {
            if !args.confirm {
                bail!("db reset deletes all archive data; re-run with --confirm");
            }
            let status = store.reset()?;
            tracing::warn!(path = %config.database_path.display(), "database reset");
            emit_json(&json!({ "reset": true, "current_version": status.current_version }))
        }
    }
}
