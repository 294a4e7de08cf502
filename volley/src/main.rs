use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use volley::config::{Args, Config};
use volley::{Application, GenerationRequest, ProviderId, telemetry};

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

/// One JSON request per line; blank lines are skipped.
async fn read_requests(path: &Path) -> anyhow::Result<Vec<GenerationRequest>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("{}:{}: invalid request", path.display(), n + 1))
        })
        .collect()
}

/// Submit one batch, wait for it to settle, and print the final snapshot.
async fn submit_and_wait(app: &Application, args: &Args, path: &Path) -> anyhow::Result<()> {
    let requests = read_requests(path).await?;
    let provider = args.provider.clone().map(ProviderId::from);
    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), serde_json::json!(path.display().to_string()));

    let job_id = app.submit_batch(requests, provider, args.priority, metadata)?;
    tracing::info!(job_id = %job_id, "Waiting for batch");

    let snapshot = tokio::select! {
        snapshot = app.processor().wait_for_completion(job_id) => snapshot,
        _ = shutdown_signal() => {
            app.cancel_batch(job_id);
            app.get_batch_status(job_id)
        }
    };
    let snapshot = snapshot.context("batch disappeared before it settled")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export, config.log_format)?;
    tracing::debug!("{:?}", args);

    if config.enable_metrics {
        let addr: SocketAddr = config
            .metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics_addr '{}'", config.metrics_addr))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        tracing::info!(%addr, "Prometheus metrics exporter listening");
    }

    let app = Application::new(config).await?;
    app.start();

    let result = match &args.submit {
        Some(path) => submit_and_wait(&app, &args, path).await,
        None => {
            shutdown_signal().await;
            Ok(())
        }
    };

    app.shutdown().await;
    tracing::info!("Shutting down telemetry...");
    telemetry::shutdown_telemetry();
    result
}
