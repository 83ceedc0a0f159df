//! filter-chain daemon entry point.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use filter_chain::exec::{Exec, SystemExec};
use filter_chain::fetcher::Fetcher;
use filter_chain::lock::LockGuard;
use filter_chain::repository::SqliteRepository;
use filter_chain::shutdown::{self, ShutdownToken};
use filter_chain::{Config, Reconciler};

const STATE_DIR: &str = "/var/lib/filter-chain";
const DB_FILE: &str = "data.db";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    debug!("starting filter-chain");

    filter_chain::firewall::check_root()?;
    let _lock = LockGuard::acquire()?;

    let state_dir = Path::new(STATE_DIR);
    bootstrap_state_dir(state_dir)?;

    let storage = Arc::new(
        SqliteRepository::open(&state_dir.join(DB_FILE)).context("could not open database")?,
    );

    let config = Config::load(state_dir)?;
    config.validate()?;
    debug!(?config, "loaded configuration");

    let token = ShutdownToken::new();
    shutdown::listen_for_signals(&token);

    let fetcher = Fetcher::new(config.country_codes(), config.refresh_period(), storage.clone())?;
    let fetch_task = tokio::spawn(fetcher.run(token.clone()));

    let exec: Arc<dyn Exec> = Arc::new(SystemExec::new());
    let reconciler = Reconciler::new(config, storage, exec);
    let result = reconciler.run(token.clone()).await;

    token.cancel();
    let _ = fetch_task.await;
    result
}

/// Log level comes from `LOG_LEVEL` (debug/info/warn/error), default info.
fn init_logging() -> Result<()> {
    let level = match std::env::var("LOG_LEVEL").as_deref() {
        Ok("debug") => Level::DEBUG,
        Ok("warn") => Level::WARN,
        Ok("error") => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("could not install logging subscriber")?;
    Ok(())
}

/// The state directory holds the policy and the database; owner-only.
fn bootstrap_state_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("could not create state directory {}", dir.display()))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("could not restrict mode of {}", dir.display()))?;
    Ok(())
}
