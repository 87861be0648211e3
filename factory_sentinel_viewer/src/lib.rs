// Read-only HTTP view over the files the sentinel hands off: live state,
// last analyzed frame and incident history. The viewer never writes; a file
// that is missing or half written reads as "no data yet".

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use factory_sentinel::core_modules::state_store::{IncidentEntry, StateStore};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{error, info};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3001";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub state_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            state_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IncidentsView {
    pub count: usize,
    pub incidents: Vec<IncidentEntry>,
}

pub fn router(store: StateStore) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/status", get(status))
        .route("/api/frame", get(frame))
        .route("/api/incidents", get(incidents))
        .with_state(store)
}

/// Latest LiveState, or `{"status": null}` before the first verdict.
pub async fn status(State(store): State<StateStore>) -> Json<Value> {
    match store.read_live_state() {
        Some(state) => match serde_json::to_value(&state) {
            Ok(value) => Json(value),
            Err(e) => {
                error!(error = %e, "live state did not serialize");
                Json(json!({ "status": null }))
            }
        },
        None => Json(json!({ "status": null })),
    }
}

pub async fn frame(State(store): State<StateStore>) -> Response {
    match store.read_frame() {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => (StatusCode::NOT_FOUND, "no frame analyzed yet").into_response(),
    }
}

pub async fn incidents(State(store): State<StateStore>) -> Json<IncidentsView> {
    let incidents = store.load_incidents();
    Json(IncidentsView {
        count: incidents.len(),
        incidents,
    })
}

/// Binds `cfg.bind_addr` and serves the viewer on a background task.
pub async fn start_server(cfg: ServerConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let store = StateStore::new(&cfg.state_dir);
    let app = router(store);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        state_dir = %cfg.state_dir.display(),
        "viewer listening"
    );
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "viewer server stopped");
        }
    });
    Ok(server)
}
