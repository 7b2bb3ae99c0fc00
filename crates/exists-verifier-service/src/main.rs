use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use exists_verifier_service::{Verifier, VerifierConfig, WorkerPool};
use exists_verifier_store_sqlite::SqliteStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "exists-verifier")]
#[command(about = "Verifies instance exists records against usage and delete records")]
struct Args {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "./exists_verifier.sqlite3")]
    db: PathBuf,
    /// Run a single scheduling pass, wait for it to drain, then exit.
    #[arg(long)]
    once: bool,
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = VerifierConfig::load(&args.config)?;
    let store = SqliteStore::open(&args.db)?;
    let status = store.schema_status()?;
    if !status.pending_versions.is_empty() {
        info!(pending = ?status.pending_versions, "applying schema migrations");
        store.migrate()?;
    }
    let health = store.health_check()?;
    if health.is_corrupt() {
        bail!("database {} failed quick_check: {}", args.db.display(), health.quick_check);
    }
    if !health.dangling_links.is_empty() {
        warn!(
            count = health.dangling_links.len(),
            first = ?health.dangling_links.first(),
            "exists records link to missing usage or delete rows"
        );
    }
    if health.stranded_verifying > 0 {
        warn!(
            count = health.stranded_verifying,
            "exists records left VERIFYING by an earlier run will not be rescheduled"
        );
    }
    let pool = WorkerPool::new(config.pool_size)?;
    info!(workers = pool.size(), db = %args.db.display(), "exists verifier ready");
    let verifier = Verifier::new(config, Arc::new(store), pool);

    let shutdown = verifier.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => warn!(error = %err, "failed to listen for ctrl-c"),
        }
        shutdown.cancel();
    });

    let once = args.once;
    tokio::task::spawn_blocking(move || {
        if once {
            let stats = verifier.run_once()?;
            info!(successful = stats.successful, errored = stats.errored, "single pass finished");
            Ok(())
        } else {
            verifier.run()
        }
    })
    .await
    .context("verifier thread panicked")?
}
