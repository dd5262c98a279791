//! docsync daemon - Background synchronization service
//!
//! Runs one scheduler per configured folder pair. Each scheduler is woken
//! by its poll interval and by the folder's local watcher, and drives a
//! [`SyncOrchestrator`] against the mounted share configured as
//! `mirror.root`.
//!
//! `--once` runs a single pass per folder instead and exits non-zero when
//! any of them did not converge. SIGTERM and SIGINT stop the daemon
//! gracefully: the running pass is cancelled and the schedulers exit.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use docsync_cache::DatabasePool;
use docsync_core::config::{Config, LoggingConfig, RepoInfo};
use docsync_core::ports::{IChangeStore, IRemoteConnector, LogNotifier};
use docsync_mirror::MirrorConnector;
use docsync_sync::{
    LocalWatcher, PassStatus, RetryPolicy, SyncControl, SyncOrchestrator, SyncScheduler,
};

#[derive(Debug, Parser)]
#[command(name = "docsyncd", version, about = "Bidirectional document synchronization daemon")]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single pass per folder and exit
    #[arg(long)]
    once: bool,

    /// Only synchronize the named folder pair
    #[arg(long, value_name = "NAME")]
    folder: Option<String>,
}

// ============================================================================
// DaemonService
// ============================================================================

/// Owns everything the folder workers share
struct DaemonService {
    config: Config,
    db_pool: DatabasePool,
    connector: Arc<MirrorConnector>,
    shutdown: CancellationToken,
}

impl DaemonService {
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let db_path = config.database_path();
        let db_pool = DatabasePool::new(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        info!(db = %db_path.display(), "Change store opened");

        let connector = Arc::new(MirrorConnector::new(config.mirror.root.clone()));

        Ok(Self {
            config,
            db_pool,
            connector,
            shutdown,
        })
    }

    /// Folder pairs to run, optionally narrowed to one name
    fn folders(&self, only: Option<&str>) -> Result<Vec<Arc<RepoInfo>>> {
        let folders: Vec<Arc<RepoInfo>> = match only {
            Some(name) => match self.config.folder(name) {
                Some(folder) => vec![Arc::new(folder.clone())],
                None => bail!("No folder pair named '{name}' in the configuration"),
            },
            None => self.config.folders.iter().cloned().map(Arc::new).collect(),
        };
        if folders.is_empty() {
            bail!("No folder pairs configured");
        }
        Ok(folders)
    }

    fn orchestrator(&self, repo: Arc<RepoInfo>) -> Result<SyncOrchestrator> {
        let store: Arc<dyn IChangeStore> = Arc::new(self.db_pool.store(repo.name.clone()));
        let control = Arc::new(SyncControl::new(self.shutdown.child_token()));
        let retry = RetryPolicy::new(
            self.config.transfer.retry_attempts,
            self.config.transfer.retry_base_delay(),
        );
        let connector: Arc<dyn IRemoteConnector> = self.connector.clone();
        SyncOrchestrator::new(
            repo,
            connector,
            store,
            Arc::new(LogNotifier),
            control,
            retry,
        )
    }

    /// One pass per folder; true when every folder converged
    async fn run_once(&self, folders: Vec<Arc<RepoInfo>>) -> Result<bool> {
        let mut converged = true;
        for repo in folders {
            let name = repo.name.clone();
            let orchestrator = self.orchestrator(repo)?;
            match orchestrator.sync().await {
                Ok(report) => {
                    info!(folder = %name, status = ?report.status, mode = ?report.mode, "Pass finished");
                    converged &= report.status == PassStatus::Success;
                }
                Err(e) => {
                    error!(folder = %name, error = %e, "Pass failed");
                    converged = false;
                }
            }
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }
        }
        Ok(converged)
    }

    /// Run the schedulers until shutdown
    async fn run(&self, folders: Vec<Arc<RepoInfo>>) -> Result<()> {
        let debounce = self
            .config
            .watcher
            .debounce()
            .max(self.config.watcher.pairing_window());

        // Watchers stop delivering events when dropped
        let mut watchers = Vec::with_capacity(folders.len());
        let mut schedulers = JoinSet::new();

        for repo in folders {
            let poll_interval = repo.poll_interval();
            let mut orchestrator = self.orchestrator(Arc::clone(&repo))?;

            let activity = match LocalWatcher::start(&repo.local_path, &self.config.watcher) {
                Ok(watcher) => {
                    orchestrator = orchestrator.with_watch_queue(watcher.queue());
                    let activity = watcher.activity();
                    watchers.push(watcher);
                    activity
                }
                Err(e) => {
                    warn!(
                        folder = %repo.name,
                        error = %format!("{e:#}"),
                        "Local watcher unavailable, relying on polling"
                    );
                    Arc::new(tokio::sync::Notify::new())
                }
            };

            let scheduler = SyncScheduler::new(
                Arc::new(orchestrator),
                activity,
                poll_interval,
                debounce,
                self.shutdown.clone(),
            );
            info!(folder = %repo.name, local = %repo.local_path.display(), remote = %repo.remote_path, "Folder worker starting");
            schedulers.spawn(scheduler.run());
        }

        while let Some(joined) = schedulers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Folder worker panicked");
            }
        }

        drop(watchers);
        self.db_pool.close().await;
        Ok(())
    }
}

// ============================================================================
// Startup
// ============================================================================

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let listed: Vec<String> = errors.iter().map(ToString::to_string).collect();
        bail!("Invalid configuration:\n  {}", listed.join("\n  "));
    }
    Ok(config)
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

/// Waits for SIGTERM or SIGINT and cancels `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    info!(
        folders = config.folders.len(),
        mirror = %config.mirror.root.display(),
        once = cli.once,
        "docsync daemon starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let service = DaemonService::new(config, shutdown).await?;
    let folders = service.folders(cli.folder.as_deref())?;

    if cli.once {
        let converged = service.run_once(folders).await?;
        service.db_pool.close().await;
        return Ok(if converged {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let result = service.run(folders).await;
    match &result {
        Ok(()) => info!("docsync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "docsync daemon exiting with error"),
    }
    result.map(|()| ExitCode::SUCCESS)
}

// ============================================================================
// Tests
// ============================================================================
