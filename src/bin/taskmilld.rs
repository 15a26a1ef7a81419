//! taskmilld: the background task processor daemon.
//!
//! Wires the store, broker, worker pools, and HTTP control surface from
//! environment configuration, then runs until SIGINT/SIGTERM. Exits 0 on a
//! graceful drain and 1 on startup failure.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{error, info};

use taskmill::config::{Config, QueueConfig};
use taskmill::registry::{HandlerContext, HandlerRegistry};
use taskmill::retry::Backoff;
use taskmill::server::AppContext;
use taskmill::store::{JobStore, PostgresStore};
use taskmill::{
    Broker, Dispatcher, DispatcherConfig, JobCoordinator, JobEnvelope, MetricsAggregator, Result,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env(default_queues()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(config).await {
        Ok(()) => {
            info!("graceful shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        port = config.port,
        mode = ?config.mode,
        db_host = %config.store.host,
        "starting taskmilld"
    );
    info!(
        redis_host = %config.broker.host,
        redis_port = config.broker.port,
        "broker backend is in-memory; redis settings recognized but unused"
    );

    let store: Arc<dyn JobStore> = Arc::new(PostgresStore::connect(&config.store).await?);

    let mut registry = HandlerRegistry::new();
    register_handlers(&mut registry, &config);
    let registry = Arc::new(registry);

    let broker = Arc::new(Broker::new(registry.type_names()));
    let coordinator = Arc::new(JobCoordinator::new(
        store.clone(),
        broker.clone(),
        registry,
    ));
    let metrics = Arc::new(MetricsAggregator::new(store, broker));

    let dispatcher = Dispatcher::new(
        coordinator.clone(),
        DispatcherConfig {
            shutdown_grace: config.shutdown_grace,
            stale_active_after: config.stale_active_after,
            ..DispatcherConfig::default()
        },
    );

    let report = dispatcher.recover().await?;
    info!(
        requeued = report.requeued,
        dead_lettered = report.dead_lettered,
        "recovery complete"
    );
    dispatcher.start();

    let server = tokio::spawn(taskmill::server::serve(
        AppContext {
            coordinator,
            metrics,
            mode: config.mode,
        },
        config.port,
        dispatcher.shutdown_signal(),
    ));

    wait_for_signal().await;
    info!("shutdown signal received");

    dispatcher.shutdown().await;
    let _ = server.await;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Built-in queue types with their scheduling defaults. Every value can be
/// overridden with `{TYPE}_*` environment variables.
fn default_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new("email")
            .with_concurrency(3)
            .with_retry_delay(Duration::from_secs(1))
            .with_backoff(Backoff::Exponential),
        QueueConfig::new("image")
            .with_concurrency(2)
            .with_retry_delay(Duration::from_secs(5)),
        QueueConfig::new("file")
            .with_concurrency(2)
            .with_retry_delay(Duration::from_secs(3)),
        QueueConfig::new("export")
            .with_concurrency(1)
            .with_retry_delay(Duration::from_secs(10))
            .with_timeout(Duration::from_secs(300)),
        QueueConfig::new("api")
            .with_concurrency(4)
            .with_retry_delay(Duration::from_secs(1))
            .with_backoff(Backoff::Exponential)
            .with_timeout(Duration::from_secs(30)),
        QueueConfig::new("cleanup")
            .with_concurrency(1)
            .with_retry_delay(Duration::from_secs(60)),
    ]
}

fn register_handlers(registry: &mut HandlerRegistry, config: &Config) {
    let queue = |name: &str| {
        config
            .queue(name)
            .cloned()
            .unwrap_or_else(|| QueueConfig::new(name))
    };

    registry.register(queue("email"), send_email);
    registry.register(queue("image"), transform_image);
    registry.register(queue("file"), parse_file);
    registry.register(queue("export"), export_data);
    registry.register(queue("api"), call_api);
    registry.register(queue("cleanup"), run_cleanup);
}

// The handlers below simulate their work; each demonstrates the contract:
// report progress, honor cancellation, return a JSON result or an error.

async fn send_email(envelope: JobEnvelope, ctx: HandlerContext) -> Result<Value> {
    let recipients = envelope
        .payload
        .get("to")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if recipients == 0 {
        return Err(taskmill::TaskmillError::handler("no recipients in payload"));
    }

    for sent in 1..=recipients {
        if ctx.is_cancelled() {
            return Err(taskmill::TaskmillError::handler("cancelled"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.report_progress((sent * 100 / recipients) as u8);
    }
    Ok(json!({ "sent": recipients }))
}

async fn transform_image(envelope: JobEnvelope, ctx: HandlerContext) -> Result<Value> {
    let sizes = envelope
        .payload
        .get("sizes")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(3);

    for done in 1..=sizes {
        if ctx.is_cancelled() {
            return Err(taskmill::TaskmillError::handler("cancelled"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.report_progress((done * 100 / sizes) as u8);
    }
    Ok(json!({ "variants": sizes }))
}

async fn parse_file(envelope: JobEnvelope, ctx: HandlerContext) -> Result<Value> {
    let rows = envelope
        .payload
        .get("rows")
        .and_then(Value::as_u64)
        .unwrap_or(100);

    for pct in [10u8, 40, 70, 100] {
        if ctx.is_cancelled() {
            return Err(taskmill::TaskmillError::handler("cancelled"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.report_progress(pct);
    }
    Ok(json!({ "parsedRows": rows }))
}

async fn export_data(envelope: JobEnvelope, ctx: HandlerContext) -> Result<Value> {
    let format = envelope
        .payload
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("csv")
        .to_string();

    for pct in (10..=100).step_by(10) {
        tokio::select! {
            _ = ctx.cancelled() => {
                return Err(taskmill::TaskmillError::handler("cancelled"));
            }
            _ = tokio::time::sleep(Duration::from_millis(150)) => {
                ctx.report_progress(pct as u8);
            }
        }
    }
    Ok(json!({ "format": format, "location": format!("/exports/{}.{format}", envelope.id) }))
}

async fn call_api(envelope: JobEnvelope, ctx: HandlerContext) -> Result<Value> {
    let url = envelope
        .payload
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| taskmill::TaskmillError::handler("missing url in payload"))?
        .to_string();

    tokio::select! {
        _ = ctx.cancelled() => Err(taskmill::TaskmillError::handler("cancelled")),
        _ = tokio::time::sleep(Duration::from_millis(300)) => {
            ctx.report_progress(100);
            Ok(json!({ "url": url, "statusCode": 200 }))
        }
    }
}

async fn run_cleanup(_envelope: JobEnvelope, ctx: HandlerContext) -> Result<Value> {
    tokio::time::sleep(Duration::from_millis(250)).await;
    ctx.report_progress(100);
    Ok(json!({ "swept": true }))
}
