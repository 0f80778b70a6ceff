//! HTTP monitoring surface of a function instance.
//!
//! | route                         | body                         |
//! |-------------------------------|------------------------------|
//! | `GET  /metrics`               | windowed metrics as JSON     |
//! | `POST /metrics/reset`         | empty, 204                   |
//! | `POST /metrics/get-and-reset` | metrics before the reset     |
//! | `GET  /metrics/prometheus`    | text exposition of registry  |
//! | `GET  /status`                | function status as JSON      |

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

use fnhost_engine::InstanceHandle;

#[derive(Clone)]
struct AppState {
    instance: InstanceHandle,
    registry: Registry,
}

pub fn router(instance: InstanceHandle, registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/metrics/reset", post(handle_reset))
        .route("/metrics/get-and-reset", post(handle_get_and_reset))
        .route("/metrics/prometheus", get(handle_prometheus))
        .route("/status", get(handle_status))
        .with_state(AppState { instance, registry })
}

/// Serve the monitoring routes on `0.0.0.0:port` until `shutdown` fires.
pub async fn run(
    port: u16,
    instance: InstanceHandle,
    registry: Registry,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let app = router(instance, registry);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| format!("bind monitor :{port}: {e}"))?;
    tracing::info!(port, "monitoring server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    tracing::info!("monitoring server stopped");
    Ok(())
}

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.instance.get_metrics())
}

async fn handle_reset(State(state): State<AppState>) -> impl IntoResponse {
    state.instance.reset_metrics();
    StatusCode::NO_CONTENT
}

async fn handle_get_and_reset(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.instance.get_and_reset_metrics())
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.instance.get_function_status())
}

async fn handle_prometheus(State(state): State<AppState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut buf) {
        Ok(()) => ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode prometheus metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {e}")).into_response()
        }
    }
}
