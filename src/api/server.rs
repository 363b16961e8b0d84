use std::future::Future;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::config::StreamConfig;
use crate::stream::{StreamError, StreamManager};

#[derive(Clone)]
pub struct AppState {
    pub manager: StreamManager,
}

impl AppState {
    pub fn new(manager: StreamManager) -> Self {
        Self { manager }
    }
}

#[derive(Serialize)]
struct ServiceInfo {
    service: &'static str,
    version: &'static str,
    streams: usize,
}

#[derive(Serialize)]
struct StartResult {
    stream_id: String,
    started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct StopResponse {
    stream_id: String,
    state: String,
}

#[derive(Serialize)]
struct StopAllResponse {
    stopping: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/streams", post(start_handler))
        .route("/status", get(status_list_handler))
        .route("/status/{id}", get(status_handler))
        .route("/detections/{id}", get(detections_handler))
        .route("/alerts/{id}", get(alerts_handler))
        .route("/stop/{id}", post(stop_handler))
        .route("/stop-all", post(stop_all_handler))
        .route("/download/{id}/{filename}", get(download_handler))
        .route("/clear/{id}", delete(clear_handler))
        .with_state(state)
}

pub async fn start_server(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn index_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        streams: state.manager.list().len(),
    })
}

fn error_status(error: &StreamError) -> StatusCode {
    match error {
        StreamError::Configuration(_) => StatusCode::BAD_REQUEST,
        StreamError::AlreadyActive(_) => StatusCode::CONFLICT,
        StreamError::Model(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn start_handler(
    State(state): State<AppState>,
    Json(configs): Json<Vec<StreamConfig>>,
) -> Response {
    if configs.is_empty() {
        return (StatusCode::BAD_REQUEST, "no streams given").into_response();
    }

    let mut results = Vec::with_capacity(configs.len());
    let mut first_error = None;

    for config in configs {
        let stream_id = config.id.clone();
        // Model loading and directory setup block.
        let manager = state.manager.clone();
        let outcome = tokio::task::spawn_blocking(move || manager.start(config).map(|_| ())).await;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                tracing::warn!(stream = %stream_id, error = %e, "stream not started");
                first_error.get_or_insert(error_status(&e));
                Some(e.to_string())
            }
            Err(e) => {
                tracing::error!(stream = %stream_id, error = %e, "stream start task failed");
                first_error.get_or_insert(StatusCode::INTERNAL_SERVER_ERROR);
                Some(e.to_string())
            }
        };
        results.push(StartResult {
            stream_id,
            started: error.is_none(),
            error,
        });
    }

    let any_started = results.iter().any(|r| r.started);
    let status = match first_error {
        None => StatusCode::OK,
        Some(_) if any_started => StatusCode::MULTI_STATUS,
        Some(code) => code,
    };
    (status, Json(results)).into_response()
}

async fn status_list_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.list())
}

async fn status_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.status(&id) {
        Some(status) => Json(status).into_response(),
        None => (StatusCode::NOT_FOUND, "stream not found").into_response(),
    }
}

async fn detections_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.detections(&id) {
        Some(detections) => Json(detections).into_response(),
        None if state.manager.registry().contains(&id) => {
            Json(Vec::<crate::storage::StoredDetection>::new()).into_response()
        }
        None => (StatusCode::NOT_FOUND, "stream not found").into_response(),
    }
}

async fn alerts_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.alerts(&id) {
        Some(alerts) => Json(alerts).into_response(),
        None if state.manager.registry().contains(&id) => {
            Json(Vec::<crate::storage::StoredAlert>::new()).into_response()
        }
        None => (StatusCode::NOT_FOUND, "stream not found").into_response(),
    }
}

async fn stop_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.manager.stop(&id) {
        return Json(StopResponse {
            stream_id: id,
            state: "stopping".to_string(),
        })
        .into_response();
    }

    match state.manager.status(&id) {
        Some(status) => (
            StatusCode::CONFLICT,
            format!("stream is already {}", status.state),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "stream not found").into_response(),
    }
}

async fn stop_all_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StopAllResponse {
        stopping: state.manager.stop_all(),
    })
}

async fn download_handler(
    State(state): State<AppState>,
    Path((id, filename)): Path<(String, String)>,
) -> Response {
    let Some(path) = state.manager.frame_path(&id, &filename) else {
        return (StatusCode::NOT_FOUND, "frame not found").into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(data) => ([(header::CONTENT_TYPE, "image/jpeg")], data).into_response(),
        Err(e) => {
            tracing::warn!(stream = %id, path = %path.display(), error = %e, "failed to read frame");
            (StatusCode::NOT_FOUND, "frame not found").into_response()
        }
    }
}

async fn clear_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.manager.clear(&id) {
        (StatusCode::OK, "cleared").into_response()
    } else {
        (StatusCode::NOT_FOUND, "stream not found").into_response()
    }
}
