use anyhow::{Context, Result};
use clap::Parser;
use devenv_api::{create_app, start_health_task, start_reaper_task, AppState};
use devenv_config::OrchestratorConfig;
use devenv_orchestrator::db::{backup_database, create_pool, run_migrations};
use devenv_orchestrator::EnvironmentOrchestrator;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "devenv-api", version, about = "Dev environment orchestrator service")]
struct Args {
    /// Path to the orchestrator config file
    #[arg(short, long, env = "DEVENV_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides `api.bind_addr`
    #[arg(long, env = "DEVENV_BIND_ADDR")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = devenv_logging::init_subscriber();

    info!("Starting devenv-api service...");

    let mut config = OrchestratorConfig::load(args.config.as_deref())
        .context("failed to load orchestrator config")?;
    if let Some(bind) = args.bind {
        config.api.bind_addr = bind;
    }
    info!(
        bind_addr = %config.api.bind_addr,
        db_path = %config.registry.db_path.display(),
        backend = config.backend.kind.as_str(),
        "configuration loaded"
    );

    // Backup before migrations
    let db_path = &config.registry.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!(path = %backup_path.display(), "database backed up");
    }

    let pool = create_pool(db_path).await?;
    run_migrations(&pool).await?;
    info!("migrations complete");

    let orchestrator = EnvironmentOrchestrator::from_config(pool, &config);
    let recovered = orchestrator.recover_interrupted().await?;
    if recovered > 0 {
        warn!(recovered, "environments left mid-transition were marked failed");
    }

    let shutdown = CancellationToken::new();
    let reaper = tokio::spawn(start_reaper_task(
        orchestrator.clone(),
        config.reaper.interval_secs,
        shutdown.clone(),
    ));
    let health = tokio::spawn(start_health_task(
        orchestrator.clone(),
        config.health.interval_secs,
        shutdown.clone(),
    ));

    let app = create_app(AppState::with_shutdown(orchestrator.clone(), shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.api.bind_addr))?;
    info!("Listening on http://{}", config.api.bind_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(reaper, health);
    orchestrator.shutdown().await;
    info!("devenv-api stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
