//! REST API and SSE routes

use crate::pipeline::EngineCommand;
use crate::state::{AppState, SourceStatus};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt as FuturesStreamExt};
use gst_core::curve::tsv;
use gst_core::gear::GearInfo;
use gst_core::EngineSnapshot;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::oneshot;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/curve", get(curve))
        .route("/api/gears", get(gears))
        .route("/api/cues/stream", get(cue_stream))
        .route("/api/tone-offset", post(set_tone_offset))
        .route("/api/reset", post(reset))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn pipeline_unavailable() -> (StatusCode, String) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "Pipeline is not running".to_string(),
    )
}

// === Status Endpoints ===

#[derive(Serialize)]
struct StatusResponse {
    source: Option<SourceStatus>,
    engine: EngineSnapshot,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let source = state.source.read().await.clone();
    let engine = state.snapshot.read().await.clone();
    Json(StatusResponse { source, engine })
}

#[derive(Deserialize)]
struct CurveQuery {
    format: Option<String>,
}

async fn curve(
    State(state): State<AppState>,
    Query(query): Query<CurveQuery>,
) -> Result<Response, (StatusCode, String)> {
    let curve = state.curve.read().await;
    let curve = curve
        .as_ref()
        .ok_or((StatusCode::NOT_FOUND, "No curve for this car yet".to_string()))?;

    match query.format.as_deref() {
        None | Some("json") => Ok(Json(curve).into_response()),
        Some("tsv") => Ok((
            [(header::CONTENT_TYPE, "text/tab-separated-values")],
            tsv::write(curve),
        )
            .into_response()),
        Some(other) => Err((
            StatusCode::BAD_REQUEST,
            format!("Unknown format: {}", other),
        )),
    }
}

async fn gears(State(state): State<AppState>) -> Json<Vec<GearInfo>> {
    let snapshot = state.snapshot.read().await;
    Json(snapshot.gears.clone())
}

// === Cue Stream Endpoint ===

async fn cue_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.subscribe();
    let shutdown = state.shutdown.clone();

    let stream = BroadcastStream::new(rx)
        .filter_map(|result| async move {
            match result {
                Ok(cue) => match serde_json::to_string(&cue) {
                    Ok(json) => Some(Ok(Event::default().event("cue").data(json))),
                    Err(e) => {
                        tracing::error!("Failed to serialize cue: {}", e);
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!("Cue stream lagged: {}", e);
                    None
                }
            }
        })
        .take_until(async move { shutdown.cancelled().await });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// === Control Endpoints ===

#[derive(Deserialize)]
struct ToneOffsetRequest {
    value: f64,
}

#[derive(Serialize)]
struct ToneOffsetResponse {
    value: f64,
}

async fn set_tone_offset(
    State(state): State<AppState>,
    Json(request): Json<ToneOffsetRequest>,
) -> Result<Json<ToneOffsetResponse>, (StatusCode, String)> {
    if !request.value.is_finite() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Tone offset must be a finite number".to_string(),
        ));
    }

    let (reply, rx) = oneshot::channel();
    state
        .commands
        .send(EngineCommand::SetToneOffset {
            value: request.value,
            reply,
        })
        .await
        .map_err(|_| pipeline_unavailable())?;
    let value = rx.await.map_err(|_| pipeline_unavailable())?;

    Ok(Json(ToneOffsetResponse { value }))
}

async fn reset(State(state): State<AppState>) -> Result<StatusCode, (StatusCode, String)> {
    let (reply, rx) = oneshot::channel();
    state
        .commands
        .send(EngineCommand::Reset { reply })
        .await
        .map_err(|_| pipeline_unavailable())?;
    rx.await.map_err(|_| pipeline_unavailable())?;

    tracing::info!("Reset requested over the API");
    Ok(StatusCode::NO_CONTENT)
}
