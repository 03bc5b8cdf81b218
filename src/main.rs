use clap::Parser;
use dotenvy::dotenv;
use media_converter::config::{ConverterConfig, QueueConfig, StorageConfig};
use media_converter::infrastructure::{converter, queue, storage};
use media_converter::services::conversion_worker::{ConsumerExit, ConversionWorker};
use media_converter::services::scanner::BucketScanner;
use media_converter::services::worker::BackgroundWorker;
use media_converter::utils::retry::RetryConfig;
use media_converter::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service type to run (api, worker, all)
    #[arg(short, long, default_value = "all")]
    mode: String,

    /// Port for the API server
    #[arg(short, long, default_value_t = 4000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initial Environment & Logging Setup
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_converter=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let run_api = matches!(args.mode.as_str(), "api" | "all");
    let run_worker = matches!(args.mode.as_str(), "worker" | "all");
    if !run_api && !run_worker {
        anyhow::bail!("unknown mode '{}', expected api, worker or all", args.mode);
    }

    info!("🚀 Starting Media Converter [Mode: {}]...", args.mode);

    // 2. Configuration
    let storage_config = StorageConfig::from_env()?;
    let queue_config = QueueConfig::from_env();
    let converter_config = ConverterConfig::from_env();
    converter_config.validate()?;
    info!(
        "🛠️  Converter Config: Backend={}, Target={:?}, Trigger=.{}, Scan={:?}, Ack={:?}",
        converter_config.converter_backend,
        converter_config.target_format,
        converter_config.convert_extension,
        converter_config.scan_mode,
        converter_config.ack_policy
    );

    // 3. Setup Common Infrastructure
    let storage_service = storage::setup_storage(&storage_config).await;
    let task_queue = queue::setup_queue(&queue_config).await?;

    let conversion_worker = if run_worker {
        let image_converter = converter::setup_converter(&converter_config).await;
        Some(Arc::new(ConversionWorker::new(
            storage_service.clone(),
            image_converter,
            converter_config.clone(),
        )))
    } else {
        None
    };

    let mut scanner = BucketScanner::new(
        storage_service.clone(),
        task_queue.clone(),
        converter_config.clone(),
    );
    if let Some(worker) = &conversion_worker {
        scanner = scanner.with_in_flight(worker.in_flight());
    }
    let scanner = Arc::new(scanner);

    // 4. Setup Graceful Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();
    let mut consumer_handle: Option<JoinHandle<anyhow::Result<()>>> = None;

    // 5. Initialize Worker Service
    if let Some(conversion_worker) = conversion_worker {
        let consumer = conversion_worker.clone();
        let consumer_queue = task_queue.clone();
        let consumer_shutdown = shutdown_rx.clone();
        consumer_handle = Some(tokio::spawn(async move {
            let resubscribe = RetryConfig {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                ..RetryConfig::default()
            };
            loop {
                let subscription = resubscribe
                    .retry("subscribe", || consumer_queue.subscribe("media-converter"))
                    .await?;
                match consumer
                    .run(subscription, consumer_queue.as_ref(), consumer_shutdown.clone())
                    .await
                {
                    ConsumerExit::Shutdown => return Ok::<(), anyhow::Error>(()),
                    ConsumerExit::SubscriptionClosed => {
                        warn!("🐇 Delivery stream ended, resubscribing...");
                    }
                }
            }
        }));

        let scheduler = BackgroundWorker::new(
            scanner.clone(),
            converter_config.scan_interval,
            shutdown_rx.clone(),
        )
        .with_staged_sweep(conversion_worker, converter_config.staged_sweep_interval);
        handles.push(tokio::spawn(scheduler.run()));

        info!("👷 Worker service initialized.");
    }

    // 6. Initialize API Service
    if run_api {
        let state = AppState {
            scanner: scanner.clone(),
        };

        // Configure tracing layer for HTTP requests
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            );

        let app = create_app(state).layer(trace_layer);
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("✅ API Server listening on: http://0.0.0.0:{}", args.port);
        info!("📖 Swagger UI documentation: http://localhost:{}/swagger-ui", args.port);

        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
            {
                error!("❌ Server runtime error: {}", e);
            }
        }));
    }

    // 7. Wait for Shutdown Signal (or a consumer that lost the broker),
    // then let the in-flight task finish
    let consumer_exit = match consumer_handle.as_mut() {
        Some(handle) => tokio::select! {
            _ = shutdown_signal() => None,
            joined = handle => Some(joined),
        },
        None => {
            shutdown_signal().await;
            None
        }
    };
    let _ = shutdown_tx.send(true);

    info!("🛑 Shutting down converter services...");
    if consumer_exit.is_none() {
        if let Some(handle) = consumer_handle {
            let _ = handle.await;
        }
    }
    for handle in handles {
        let _ = handle.await;
    }

    if let Some(joined) = consumer_exit {
        // Exit non-zero so the supervisor restarts us with a fresh connection.
        let e = match joined {
            Ok(Ok(())) => anyhow::anyhow!("consumer stopped without a shutdown request"),
            Ok(Err(e)) => e,
            Err(e) => e.into(),
        };
        error!("❌ Conversion consumer stopped: {:#}", e);
        return Err(e);
    }

    info!("👋 Media Converter exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
