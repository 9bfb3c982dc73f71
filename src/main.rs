use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use athena_rwsplit::backend::Directory;
use athena_rwsplit::config::{self, Config};
use athena_rwsplit::metrics::start_metrics_server;
use athena_rwsplit::proxy;
use athena_rwsplit::router::RouterInstance;
use athena_rwsplit::transport::PipePool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();
    if config.services.is_empty() {
        warn!("No services configured, nothing to listen on");
    }

    let directory = Arc::new(Directory::from_config(&config.servers));
    let pipes = Arc::new(PipePool::new(config.pipe_pool.size).context("creating pipe pool")?);
    info!(
        servers = directory.len(),
        pipes = pipes.capacity(),
        "Backend directory loaded"
    );

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    if config.metrics.enabled {
        let addr = config.metrics.listen_addr.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr, token).await {
                error!(error = %e, "Metrics server failed");
            }
        }));
    }

    for service in &config.services {
        let instance = RouterInstance::new(service, directory.clone(), pipes.clone())
            .with_context(|| format!("building router for service '{}'", service.name))?;
        let addr = service.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {} for service '{}'", addr, service.name))?;

        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = proxy::serve(listener, Arc::new(instance), token).await {
                error!(error = %e, "Service listener failed");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();
    pipes.close();
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

fn load_or_default_config() -> Config {
    // Try to load from config file
    let env_path = std::env::var("ATHENA_RWSPLIT_CONFIG").ok();
    let config_paths = env_path
        .iter()
        .map(String::as_str)
        .chain(["config/athena-rwsplit.toml", "athena-rwsplit.toml"]);

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
