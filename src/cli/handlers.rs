use crate::{
    backend::{self, BackendPool, ModelStatus},
    cli::commands::{ModelsCommand, ServerCommand},
    config::ServiceConfig,
    logging,
    service::Gateway,
};
use anyhow::{Context, Result};
use serde::Serialize;

pub async fn handle_server(cmd: ServerCommand) -> Result<()> {
    let config = ServiceConfig::load(&cmd.config).context("Failed to load configuration")?;

    // Set up logging before anything else
    let _guard = logging::init(&config.logging).context("Failed to initialize logging")?;

    config.validate().context("Invalid configuration")?;
    let addr = config.listen_addr()?;

    let backend =
        backend::from_config(&config.backend).context("Failed to create inference backend")?;
    let gateway = Gateway::from_config(&config, backend).context("Failed to initialize gateway")?;

    gateway
        .serve(addr, shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}

#[derive(Serialize)]
struct ModelRow<'a> {
    name: &'a str,
    version: u32,
    input_name: &'a str,
    workers: usize,
    queue_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

pub async fn handle_models(cmd: ModelsCommand) -> Result<()> {
    let config = ServiceConfig::load(&cmd.config).context("Failed to load configuration")?;
    let catalog = config.catalog().context("Invalid model catalog")?;

    let mut statuses = Vec::new();
    if cmd.check {
        let backend = backend::from_config(&config.backend)
            .context("Failed to create inference backend")?;
        let pool = BackendPool::new(backend, &catalog, 1);
        statuses = pool.check_models().await;
    }

    let mut rows = Vec::with_capacity(catalog.len());
    for name in catalog.names() {
        let Some(spec) = catalog.get(name) else { continue };
        let status = statuses.iter().find(|(n, _)| n == name).map(|(_, s)| match s {
            Ok(ModelStatus::Available) => "available".to_string(),
            Ok(ModelStatus::Unavailable(reason)) => format!("unavailable ({})", reason),
            Err(e) => format!("error ({})", e),
        });
        rows.push(ModelRow {
            name: &spec.name,
            version: spec.version,
            input_name: &spec.input_name,
            workers: spec.workers.unwrap_or(config.dispatcher.default_workers),
            queue_capacity: spec
                .queue_capacity
                .unwrap_or(config.dispatcher.default_queue_capacity),
            status,
        });
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No models configured.");
        return Ok(());
    }

    println!("Backend: {}", config.backend.url);
    println!(
        "{:<24} {:>7} {:<20} {:>7} {:>6}  {}",
        "NAME", "VERSION", "INPUT", "WORKERS", "QUEUE", "STATUS"
    );
    for row in &rows {
        println!(
            "{:<24} {:>7} {:<20} {:>7} {:>6}  {}",
            row.name,
            row.version,
            row.input_name,
            row.workers,
            row.queue_capacity,
            row.status.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
