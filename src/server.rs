//! HTTP control surface: admission, inspection, and admin operations.
//!
//! A thin warp adapter over the coordinator and the metrics aggregator.
//! Errors are returned as `{error, message?}`; the `message` detail is
//! included only in development mode.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::config::Mode;
use crate::coordinator::JobCoordinator;
use crate::error::TaskmillError;
use crate::job::{Job, JobId, Priority};
use crate::metrics::MetricsAggregator;

/// Shared state injected into every route.
#[derive(Clone)]
pub struct AppContext {
    pub coordinator: Arc<JobCoordinator>,
    pub metrics: Arc<MetricsAggregator>,
    pub mode: Mode,
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    #[serde(rename = "type")]
    task_type: String,
    priority: Option<i64>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryFailedRequest {
    #[serde(rename = "taskType")]
    task_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn error_reply(error: &TaskmillError, mode: Mode) -> warp::reply::WithStatus<warp::reply::Json> {
    let (status, kind) = match error {
        TaskmillError::Validation { .. }
        | TaskmillError::Config { .. }
        | TaskmillError::Serialization(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        TaskmillError::QueueNotFound { .. } => (StatusCode::BAD_REQUEST, "unknown_queue"),
        TaskmillError::JobNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        TaskmillError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        TaskmillError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    let body = ErrorBody {
        error: kind.to_string(),
        message: mode.is_development().then(|| error.to_string()),
    };
    if status.is_server_error() {
        warn!(error = %error, "request failed");
    }
    warp::reply::with_status(warp::reply::json(&body), status)
}

fn with_context(
    ctx: AppContext,
) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Builds the complete route tree.
pub fn routes(
    ctx: AppContext,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let submit = warp::path("tasks")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx.clone()))
        .and_then(submit_handler);

    let get_task = warp::path!("tasks" / String)
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(get_task_handler);

    let queue_stats = warp::path!("stats" / "queues")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(queue_stats_handler);

    let system_stats = warp::path!("stats" / "system")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(system_stats_handler);

    let pause = warp::path!("admin" / "queues" / String / "pause")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and_then(pause_handler);

    let resume = warp::path!("admin" / "queues" / String / "resume")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and_then(resume_handler);

    let retry_failed = warp::path!("admin" / "retry-failed")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_context(ctx.clone()))
        .and_then(retry_failed_handler);

    let cancel = warp::path!("admin" / "tasks" / String / "cancel")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and_then(cancel_handler);

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_context(ctx))
        .and_then(health_handler);

    submit
        .or(get_task)
        .or(queue_stats)
        .or(system_stats)
        .or(pause)
        .or(resume)
        .or(retry_failed)
        .or(cancel)
        .or(health)
        .recover(handle_rejection)
}

/// Maps warp rejections (unmatched routes, malformed bodies) onto the
/// `{error, message?}` shape.
async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Rejection> {
    let (status, kind) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found")
    } else if rejection
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        (StatusCode::BAD_REQUEST, "validation_error")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            error: kind.to_string(),
            message: None,
        }),
        status,
    ))
}

/// Binds the server and runs until the shutdown signal flips.
pub async fn serve(ctx: AppContext, port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let (bound, server) =
        warp::serve(routes(ctx)).bind_with_graceful_shutdown(addr, async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        });
    info!(address = %bound, "control surface listening");
    server.await;
}

async fn submit_handler(
    request: TaskRequest,
    ctx: AppContext,
) -> Result<impl Reply, Infallible> {
    let priority = match Priority::new(request.priority.unwrap_or(5)) {
        Ok(priority) => priority,
        Err(e) => return Ok(error_reply(&e, ctx.mode)),
    };

    let mut job = Job::new(
        request.task_type,
        request.data.unwrap_or_else(|| serde_json::json!({})),
    )
    .with_priority(priority);
    if let Some(config) = ctx.coordinator.registry().queue_config(&job.job_type) {
        job.max_retries = config.max_retries;
    }

    match ctx.coordinator.submit(job).await {
        Ok(id) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "taskId": id })),
            StatusCode::CREATED,
        )),
        Err(e) => Ok(error_reply(&e, ctx.mode)),
    }
}

async fn get_task_handler(id: String, ctx: AppContext) -> Result<impl Reply, Infallible> {
    let Ok(id) = id.parse::<JobId>() else {
        return Ok(error_reply(
            &TaskmillError::JobNotFound { id },
            ctx.mode,
        ));
    };
    match ctx.coordinator.job(id).await {
        Ok(job) => Ok(warp::reply::with_status(
            warp::reply::json(&job),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e, ctx.mode)),
    }
}

async fn queue_stats_handler(ctx: AppContext) -> Result<impl Reply, Infallible> {
    let stats = ctx.coordinator.broker().all_stats();
    Ok(warp::reply::with_status(
        warp::reply::json(&stats),
        StatusCode::OK,
    ))
}

async fn system_stats_handler(ctx: AppContext) -> Result<impl Reply, Infallible> {
    match ctx.metrics.snapshot().await {
        Ok(metrics) => Ok(warp::reply::with_status(
            warp::reply::json(&metrics),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e, ctx.mode)),
    }
}

async fn pause_handler(queue: String, ctx: AppContext) -> Result<impl Reply, Infallible> {
    match ctx.coordinator.pause(&queue).await {
        Ok(()) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "paused": queue })),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e, ctx.mode)),
    }
}

async fn resume_handler(queue: String, ctx: AppContext) -> Result<impl Reply, Infallible> {
    match ctx.coordinator.resume(&queue).await {
        Ok(()) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "resumed": queue })),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e, ctx.mode)),
    }
}

async fn retry_failed_handler(
    body: bytes::Bytes,
    ctx: AppContext,
) -> Result<impl Reply, Infallible> {
    // The body is optional; an empty body means every queue.
    let request: RetryFailedRequest = if body.is_empty() {
        RetryFailedRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return Ok(error_reply(&e.into(), ctx.mode)),
        }
    };

    match ctx
        .coordinator
        .retry_failed(request.task_type.as_deref())
        .await
    {
        Ok(count) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "retriedCount": count })),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e, ctx.mode)),
    }
}

async fn cancel_handler(id: String, ctx: AppContext) -> Result<impl Reply, Infallible> {
    let Ok(id) = id.parse::<JobId>() else {
        return Ok(error_reply(
            &TaskmillError::JobNotFound { id },
            ctx.mode,
        ));
    };
    match ctx.coordinator.cancel(id).await {
        Ok(()) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "cancelled": id })),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e, ctx.mode)),
    }
}

async fn health_handler(ctx: AppContext) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "uptime": ctx.metrics.uptime_seconds(),
            "memory": crate::metrics::resident_set_bytes(),
        })),
        StatusCode::OK,
    ))
}
