//! Admin HTTP API: read/manage incidents, view or refresh configuration,
//! and inspect system/event counters.
//!
//! Grounded on `api/server.go`'s route table and `api/incident.go`'s
//! `Incident` endpoint (`{id:.+}` wildcard doubling as both `GET /*` for
//! the full listing and `GET /{id}` for one incident; `DELETE` resolves by
//! firing the incident's resolver and resubmitting it as OK). Auth is out
//! of scope here -- routes are served unauthenticated, matching the
//! pipeline's own framing of auth as an external collaborator.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use bangarang::event::Status;
use bangarang::Pipeline;
use serde_json::json;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AdminState {
    pipeline: Pipeline,
}

pub fn router(pipeline: Pipeline) -> Router {
    let state = AdminState { pipeline };
    Router::new()
        .route("/api/incident/*id", get(get_incident).delete(delete_incident))
        .route("/api/stats/system", get(system_stats))
        .route("/api/stats/event", get(event_stats))
        .route("/api/config", get(view_config).post(update_config))
        .route("/api/escalation/config/:id", get(escalation_config))
        .with_state(Arc::new(state))
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

async fn get_incident(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if id == "*" {
        return match state.pipeline.list_incidents_at_or_above(Status::Warning).await {
            Ok(incidents) => Json(json!(incidents)).into_response(),
            Err(e) => internal_error(e).into_response(),
        };
    }

    match state.pipeline.get_incident(&id).await {
        Ok(incident) => Json(json!(incident)).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_incident(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut incident = match state.pipeline.get_incident(&id).await {
        Ok(Some(incident)) => incident,
        Ok(None) => return StatusCode::BAD_REQUEST.into_response(),
        Err(e) => return internal_error(e).into_response(),
    };

    // Notify whoever is holding this incident's resolver (the condition
    // that created it) that it's being manually cleared, then resubmit it
    // as OK through the pipeline just like the original's two-step resolve.
    if let Some(resolver) = state.pipeline.take_incident_resolver(&incident.index_name) {
        let mut cleared = incident.clone();
        cleared.status = Status::Ok;
        cleared.description.clear();
        let _ = resolver.send(cleared);
    }

    incident.status = Status::Ok;
    incident.description.clear();
    if let Err(e) = state.pipeline.process_incident(incident).await {
        return internal_error(e).into_response();
    }

    StatusCode::OK.into_response()
}

async fn system_stats(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(state.pipeline.tracker().system_stats())
}

async fn event_stats(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(state.pipeline.tracker().event_stats())
}

async fn view_config(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(state.pipeline.view_config())
}

async fn update_config(
    State(state): State<Arc<AdminState>>,
    Json(new_config): Json<bangarang::AppConfig>,
) -> impl IntoResponse {
    match state.pipeline.refresh(new_config).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn escalation_config(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let config = state.pipeline.view_config();
    match config.escalations.into_iter().find(|e| e.name == id) {
        Some(escalation) => Json(escalation).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}
