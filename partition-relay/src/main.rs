use std::future::ready;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use partition_relay::config::Config;
use partition_relay::ready::ReadyGate;
use partition_relay::service::RelayService;
use partition_relay::shutdown::exit_code;
use partition_relay::signals::shutdown_signal;

/// Every series carries the consumer group, so relays sharing a scrape
/// target stay apart.
fn metrics_builder(group: &str) -> PrometheusBuilder {
    PrometheusBuilder::new().add_global_label("group", group)
}

fn setup_metrics(group: &str) -> Result<PrometheusHandle> {
    metrics_builder(group)
        .install_recorder()
        .context("Failed to install metrics recorder")
}

fn setup_tracing(config: &Config) {
    let base_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    let log_layer = if config.log_json() {
        base_layer
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        base_layer.with_filter(EnvFilter::from_default_env()).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

/// Serve probes and metrics once the relay session is live.
fn start_server(
    config: &Config,
    metrics: Option<PrometheusHandle>,
    ready_gate: ReadyGate,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(|| async { "partition relay" }))
        .route(
            "/_readiness",
            get(move || {
                let shutdown = shutdown.clone();
                async move {
                    if shutdown.is_cancelled() {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        )
        .route("/_liveness", get(|| async { "ok" }));

    let router = match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    };

    let bind = config.bind_address.clone();

    tokio::task::spawn(async move {
        ready_gate.wait().await;
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind HTTP server to {bind}: {e}");
                return;
            }
        };
        info!("Serving probes and metrics on {bind}");
        if let Err(e) = axum::serve(listener, router).await {
            error!("HTTP server failed: {e}");
        }
    })
}

async fn run() -> Result<i32> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    setup_tracing(&config);

    let settings = config.validate().context("Invalid configuration")?;
    info!("Starting partition relay");
    info!("Configuration loaded: {:?}", settings);

    // Recorder goes in first so nothing counted before the server starts is lost
    let metrics = if config.export_prometheus {
        Some(setup_metrics(&settings.consumer.kafka_consumer_group)?)
    } else {
        None
    };

    let signal = shutdown_signal().context("Failed to install signal handlers")?;

    let service = RelayService::new(settings)
        .await
        .context("Failed to start partition relay")?;

    let server_handle = start_server(
        &config,
        metrics,
        service.ready_gate(),
        service.shutdown_token(),
    );

    let result = service.run(signal).await;
    if let Err(e) = &result {
        error!("Partition relay did not shut down cleanly: {e}");
    }

    server_handle.abort();
    Ok(exit_code(&result))
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            // tracing may not be initialised yet
            eprintln!("partition relay failed to start: {e:#}");
            error!("partition relay failed to start: {e:#}");
            1
        }
    };
    std::process::exit(code);
}
