use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use mary_core::{DateRange, EntityKind};
use mary_storage::{ClickHouseConfig, ClickHouseStore, MarilynCredentials};
use mary_sync::{provision_all, RunOutcome, SyncConfig, SyncRunner, Tuning};
use tracing::{error, info};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "mary-cli", version)]
#[command(about = "Reload Marilyn placements and statistics into ClickHouse")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one inclusive date range, then exit.
    Sync(SyncArgs),
    /// Create the database and tables without syncing anything.
    Provision(ProvisionArgs),
    /// Sync a trailing window on a cron schedule until interrupted.
    Schedule(ScheduleArgs),
}

#[derive(Debug, Args)]
struct MarilynArgs {
    #[arg(long, env = "MARY_API_ROOT")]
    marilyn_api_root: String,
    #[arg(long, env = "MARY_API_TOKEN", hide_env_values = true)]
    marilyn_token: String,
    #[arg(long, env = "MARY_ACCOUNT_ID")]
    marilyn_account: String,
    #[arg(long, env = "MARY_PROJECT_ID")]
    marilyn_project: u64,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[arg(long, env = "MARY_DB_HOST")]
    db_host: String,
    /// ClickHouse HTTP interface port.
    #[arg(long, env = "MARY_DB_PORT", default_value_t = 8123)]
    db_port: u16,
    #[arg(long, env = "MARY_DB_NAME")]
    db_name: String,
    #[arg(long, env = "MARY_DB_USER", default_value = "default")]
    db_user: String,
    #[arg(long, env = "MARY_DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,
}

impl DbArgs {
    fn clickhouse(&self) -> ClickHouseConfig {
        ClickHouseConfig::new(&self.db_host, self.db_port, self.db_user.clone(), self.db_password.clone())
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Entity kinds to sync; all of them when omitted.
    #[arg(long, env = "MARY_ENTITIES", value_delimiter = ',')]
    entities: Vec<EntityKind>,
    /// Run the selected entities concurrently instead of one after another.
    #[arg(long, env = "MARY_CONCURRENT")]
    concurrent: bool,
    #[arg(long, env = "MARY_PER_PAGE")]
    per_page: Option<u32>,
    /// YAML file with timeouts, retry and paging settings.
    #[arg(long, env = "MARY_TUNING_FILE")]
    tuning_file: Option<PathBuf>,
}

impl RunArgs {
    fn tuning(&self) -> Result<Tuning> {
        let mut tuning = Tuning::load_optional(self.tuning_file.as_deref())?;
        if let Some(per_page) = self.per_page {
            anyhow::ensure!(per_page > 0, "--per-page must be positive");
            tuning.per_page = per_page;
        }
        Ok(tuning)
    }
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(short = 's', long, env = "MARY_START_DATE", value_parser = parse_date)]
    start_date: NaiveDate,
    #[arg(short = 'e', long, env = "MARY_END_DATE", value_parser = parse_date)]
    end_date: NaiveDate,
    #[command(flatten)]
    marilyn: MarilynArgs,
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    #[command(flatten)]
    db: DbArgs,
    #[arg(long, env = "MARY_ENTITIES", value_delimiter = ',')]
    entities: Vec<EntityKind>,
    #[arg(long, env = "MARY_TUNING_FILE")]
    tuning_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    /// Six-field cron expression, seconds first.
    #[arg(long, env = "MARY_SCHEDULE_CRON", default_value = "0 0 6 * * *")]
    cron: String,
    /// Days before today included in every scheduled run.
    #[arg(long, env = "MARY_LOOKBACK_DAYS", default_value_t = 3)]
    lookback_days: u32,
    #[command(flatten)]
    marilyn: MarilynArgs,
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    run: RunArgs,
}

fn parse_date(input: &str) -> Result<NaiveDate, String> {
    mary_core::parse_cli_date(input).map_err(|err| err.to_string())
}

fn sync_config(marilyn: &MarilynArgs, db: &DbArgs, run: &RunArgs) -> Result<SyncConfig> {
    Ok(SyncConfig {
        api_root: marilyn.marilyn_api_root.clone(),
        credentials: MarilynCredentials {
            account_id: marilyn.marilyn_account.clone(),
            token: marilyn.marilyn_token.clone(),
        },
        project_id: marilyn.marilyn_project,
        clickhouse: db.clickhouse(),
        database: db.db_name.clone(),
        entities: run.entities.clone(),
        concurrent: run.concurrent,
        tuning: run.tuning()?,
    })
}

fn report(outcome: &RunOutcome) -> ExitCode {
    for entity in &outcome.entities {
        match &entity.result {
            Ok(summary) => info!(
                entity = %summary.entity,
                pages = summary.pages,
                fetched = summary.fetched,
                inserted = summary.inserted,
                discarded = summary.discarded,
                partitions_dropped = summary.partitions_dropped,
                "entity summary"
            ),
            Err(err) => error!(entity = %entity.entity, error = %err, "entity failed"),
        }
    }
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run_sync(args: SyncArgs) -> Result<ExitCode> {
    let range = DateRange::new(args.start_date, args.end_date)?;
    let config = sync_config(&args.marilyn, &args.db, &args.run)?;
    let runner = SyncRunner::from_config(&config)?;
    runner.store().ping().await.context("connecting to ClickHouse")?;
    let outcome = runner.run(range).await?;
    Ok(report(&outcome))
}

async fn run_provision(args: ProvisionArgs) -> Result<ExitCode> {
    let tuning = Tuning::load_optional(args.tuning_file.as_deref())?;
    let config = ClickHouseConfig {
        timeout: std::time::Duration::from_secs(tuning.store_timeout_secs),
        backoff: tuning.backoff(),
        ..args.db.clickhouse()
    };
    let store = ClickHouseStore::new(&config);
    store.ping().await.context("connecting to ClickHouse")?;

    let mut entities = if args.entities.is_empty() {
        EntityKind::ALL.to_vec()
    } else {
        args.entities
    };
    entities.sort();
    entities.dedup();

    let tables = provision_all(&store, &args.db.db_name, &entities).await?;
    info!(tables = tables.len(), "provisioned");
    Ok(ExitCode::SUCCESS)
}

async fn run_schedule(args: ScheduleArgs) -> Result<ExitCode> {
    let config = sync_config(&args.marilyn, &args.db, &args.run)?;
    let runner = Arc::new(SyncRunner::from_config(&config)?);
    let mut sched = mary_sync::build_scheduler(runner, &args.cron, args.lookback_days).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %args.cron, lookback_days = args.lookback_days, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(ExitCode::SUCCESS)
}

async fn main_impl(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Sync(args) => run_sync(args).await,
        Commands::Provision(args) => run_provision(args).await,
        Commands::Schedule(args) => run_schedule(args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::LogConfig::from_env().and_then(|config| logging::init_logging(&config)) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match main_impl(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
