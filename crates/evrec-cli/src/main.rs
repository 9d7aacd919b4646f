use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use evrec_core::EventSource;
use evrec_reconcile::{write_report, FailurePolicy, GroupStatus, ReconcileConfig, Reconciler, RunStatus};
use evrec_storage::PgEventStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "evrec-cli")]
#[command(about = "Reconcile event records duplicated by an external integration")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge every duplicate group into its canonical record and retire the rest.
    Reconcile(RunArgs),
    /// Print the duplicate groups and what would be written, without writing.
    Groups(TargetArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct TargetArgs {
    /// Events table, optionally schema-qualified.
    #[arg(long)]
    table: Option<String>,
    /// Source name of the mapping that identifies duplicates.
    #[arg(long)]
    source_name: Option<String>,
    /// Marketplace name of the mapping that identifies duplicates.
    #[arg(long)]
    marketplace_name: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Plan and report without writing.
    #[arg(long)]
    dry_run: bool,
    /// Groups applied concurrently.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Keep reconciling other groups after one fails.
    #[arg(long)]
    keep_going: bool,
    /// Directory receiving `<run_id>/reconcile_report.json`.
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

impl TargetArgs {
    fn apply(&self, config: &mut ReconcileConfig) {
        if let Some(table) = &self.table {
            config.table = table.clone();
        }
        config.target = EventSource::new(
            self.source_name.clone().unwrap_or_else(|| config.target.name.clone()),
            self.marketplace_name
                .clone()
                .unwrap_or_else(|| config.target.marketplace_name.clone()),
        );
    }
}

impl RunArgs {
    fn apply(&self, config: &mut ReconcileConfig) {
        self.target.apply(config);
        config.dry_run |= self.dry_run;
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency.max(1);
        }
        if self.keep_going {
            config.failure_policy = FailurePolicy::Continue;
        }
        if let Some(dir) = &self.report_dir {
            config.report_dir = Some(dir.clone());
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evrec=info"));
    let registry = tracing_subscriber::registry().with(filter);
    match std::env::var("EVREC_LOG_FORMAT").as_deref() {
        Ok("json") => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn connect(config: &ReconcileConfig) -> Result<Arc<PgEventStore>> {
    let store = PgEventStore::connect(&config.store_config())
        .await
        .context("connecting to the events database")?;
    tracing::info!(table = %config.table, "connected to database");
    Ok(Arc::new(store))
}

async fn run_reconcile(config: ReconcileConfig) -> Result<()> {
    let store = connect(&config).await?;
    let summary = Reconciler::new(store, config.options())
        .run()
        .await
        .context("reconciliation aborted")?;

    if let Some(dir) = &config.report_dir {
        let path = write_report(&summary, dir).await?;
        tracing::info!(report = %path.display(), "wrote run report");
    }

    println!(
        "reconcile {:?}: run_id={} keys={} applied={} already_reconciled={} planned={} failed={} not_attempted={}",
        summary.status,
        summary.run_id,
        summary.located_keys,
        summary.count(GroupStatus::Applied),
        summary.count(GroupStatus::AlreadyReconciled),
        summary.count(GroupStatus::Planned),
        summary.count(GroupStatus::Failed),
        summary.count(GroupStatus::NotAttempted),
    );

    if summary.status != RunStatus::Completed {
        let reason = summary
            .first_error()
            .and_then(|g| g.error.clone())
            .unwrap_or_else(|| "a worker stopped unexpectedly".to_string());
        bail!("reconciliation finished with failures: {reason}");
    }
    Ok(())
}

async fn list_groups(config: ReconcileConfig) -> Result<()> {
    let store = connect(&config).await?;
    let planning = Reconciler::new(store, config.options())
        .plan()
        .await
        .context("planning duplicate groups")?;

    for plan in &planning.plans {
        let diff = serde_json::to_string(&plan.diff).context("serializing diff")?;
        println!(
            "{}\t{}\tcanonical={}\tretire={:?}\tsettled={}\tdiff={}",
            plan.external_key, plan.name, plan.canonical_id, plan.retire_ids, plan.already_reconciled, diff
        );
    }
    println!(
        "{} duplicated keys, {} groups, {} unnamed records skipped",
        planning.located_keys,
        planning.plans.len(),
        planning.unnamed.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let mut config = ReconcileConfig::from_env();

    match cli.command.unwrap_or_else(|| Commands::Reconcile(RunArgs::default())) {
        Commands::Reconcile(args) => {
            args.apply(&mut config);
            run_reconcile(config).await
        }
        Commands::Groups(args) => {
            args.apply(&mut config);
            list_groups(config).await
        }
    }
}
