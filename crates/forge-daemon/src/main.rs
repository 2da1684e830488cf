// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result, bail};
use clap::Parser;
use forge_build::{BuildSettings, Orchestrator};
use forge_config::{ForgeConfig, load_config, validate_config};
use forge_container::{CliRuntime, ContainerRuntime};
use forge_core::ValidationLimits;
use forge_daemon::{AppState, build_app};
use forge_dispatch::{DispatchSettings, Dispatcher};
use forge_store::JobStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "forge-daemon", version, about = "Build-on-demand OpenWrt firmware images")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the container runtime binary (docker or podman).
    #[arg(long)]
    container_binary: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref()).context("load configuration")?;
    init_tracing(&config, args.debug);

    let warnings = validate_config(&config).context("validate configuration")?;
    for warning in &warnings {
        warn!("config: {warning}");
    }

    fs::create_dir_all(&config.store_path)
        .await
        .with_context(|| format!("create store dir {}", config.store_path.display()))?;

    let store = Arc::new(JobStore::open(&config.database_file()).context("open job store")?);
    let runtime = container_runtime(&config, args.container_binary.as_deref())?;

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        runtime,
        BuildSettings {
            registry: config.imagebuilder_registry.clone(),
            store_path: config.store_path.clone(),
            allow_defaults: config.allow_defaults,
            job_timeout: config.job_timeout(),
        },
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        orchestrator,
        DispatchSettings {
            worker_concurrent: config.worker_concurrent,
            poll_interval: config.worker_poll(),
            build_ttl: config.build_ttl(),
            failure_ttl: config.failure_ttl(),
            store_path: config.store_path.clone(),
        },
    ));

    // Sweep jobs a previous process left BUILDING before taking new work.
    let report = dispatcher.recover().context("recovery sweep")?;
    for fingerprint in &report.requeued {
        info!(fingerprint = %fingerprint, "requeued stale build");
    }

    let notify: Arc<Notify> = dispatcher.notifier();
    let handle = dispatcher.spawn();

    let state = Arc::new(AppState {
        store,
        notify,
        limits: ValidationLimits {
            max_defaults_length: config.max_defaults_length,
            max_rootfs_size_mb: config.max_custom_rootfs_size_mb,
            allow_defaults: config.allow_defaults,
        },
        max_pending_jobs: config.max_pending_jobs,
    });
    let app = build_app(state);

    let bind = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(
        bind = %bind,
        store = %config.store_path.display(),
        workers = config.worker_concurrent,
        "forge-daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    info!("shutting down workers");
    handle.shutdown().await;
    Ok(())
}

fn init_tracing(config: &ForgeConfig, debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        config.log_level.clone().unwrap_or_else(|| "info".into())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn container_runtime(
    config: &ForgeConfig,
    binary: Option<&std::path::Path>,
) -> Result<Arc<dyn ContainerRuntime>> {
    let mut runtime = match binary {
        Some(path) => CliRuntime::new(path),
        None => match CliRuntime::from_path() {
            Some(runtime) => runtime,
            None => bail!("no container runtime found on PATH; install docker or podman"),
        },
    };
    if let Some(socket) = &config.container_socket_path {
        runtime = runtime.with_socket(socket.clone());
    }
    Ok(Arc::new(runtime))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install ctrl-c handler");
    }
}
