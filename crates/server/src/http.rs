//! HTTP inspection endpoints and the WebSocket upgrade.
//!
//! Read-only views over the engine: current/previous/history race records,
//! raw and final tick data, the event timeline, results, and metrics. An
//! optional bearer token guards everything except `/health`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use furlong_sim::{EventInstance, Tick};

use crate::subscriber::{serve_socket, ConnectParams};
use crate::Engine;

/// Build the full router.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(public_config))
        .route("/current", get(current))
        .route("/previous", get(previous))
        .route("/history", get(history))
        .route("/ticks/:race_id", get(ticks))
        .route("/ticks-final/:race_id", get(ticks_final))
        .route("/timeline/:race_id", get(timeline))
        .route("/results/:race_id", get(results))
        .route("/metrics", get(metrics))
        .route("/stream", get(stream))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&engine),
            require_token,
        ))
        .with_state(engine)
}

// ============================================================================
// Auth
// ============================================================================

async fn require_token(
    State(engine): State<Arc<Engine>>,
    request: Request,
    next: Next,
) -> Response {
    if !engine.options.require_token || request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let Some(expected) = engine.options.auth_token.as_deref() else {
        // Token required but none configured: refuse everything.
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if bearer_token(&request).as_deref() == Some(expected) {
        return next.run(request).await;
    }
    StatusCode::UNAUTHORIZED.into_response()
}

fn bearer_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if let Ok(text) = value.to_str() {
            if let Some(token) = text.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    // WebSocket clients cannot always set headers; accept `?token=`.
    request.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(str::to_string))
    })
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn public_config(State(engine): State<Arc<Engine>>) -> Json<Value> {
    Json(public_config_payload(&engine))
}

/// `/config` payload: signing identity plus the subscriber-relevant knobs.
pub fn public_config_payload(engine: &Engine) -> Value {
    json!({
        "keyId": engine.signer.as_ref().map(|s| s.key_id().to_string()),
        "publicKey": engine.signer.as_ref().map(|s| s.public_key_b64().to_string()),
        "keyframeIntervalTicks": engine.options.keyframe_interval_ticks,
        "pingIntervalMs": engine.options.ping_interval_ms,
        "backpressureThreshold": engine.options.backpressure_threshold,
        "supportsBinary": true,
        "supportsDelta": true,
    })
}

async fn current(State(engine): State<Arc<Engine>>) -> Response {
    match engine.live.current() {
        Some(active) => {
            let config = &active.race.config;
            let end_ts = active.start_ts_ms + config.duration_ms;
            Json(json!({
                "raceId": config.race_id,
                "config": config,
                "finishLine": config.finish_line(),
                "startTime": active.start_ts_ms,
                "endTime": end_ts,
                "currentTickIndex": active.current_tick(),
                "phase": engine.live.phase(),
            }))
            .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn previous(State(engine): State<Arc<Engine>>) -> Response {
    let previous_id = engine
        .live
        .previous()
        .map(|race| race.config.race_id.clone());
    match previous_id.and_then(|id| engine.live.find_summary(&id)) {
        Some(summary) => Json(summary).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn history(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.live.history()).into_response()
}

async fn ticks(State(engine): State<Arc<Engine>>, Path(race_id): Path<String>) -> Response {
    match engine.live.find_race(&race_id) {
        Some(race) => Json(&race.base_paths).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ticks_final(State(engine): State<Arc<Engine>>, Path(race_id): Path<String>) -> Response {
    match engine.live.find_race(&race_id) {
        Some(race) => {
            let positions: Vec<Vec<f64>> = (0..race.config.total_ticks())
                .map(|t| race.matrix.positions_at(t))
                .collect();
            Json(positions).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn timeline(State(engine): State<Arc<Engine>>, Path(race_id): Path<String>) -> Response {
    match engine.live.find_race(&race_id) {
        Some(race) => Json(timeline_payload(&race.timeline)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Tick-indexed event instances, ascending by construction.
pub fn timeline_payload(timeline: &furlong_sim::EventTimeline) -> BTreeMap<Tick, Vec<EventInstance>> {
    timeline
        .iter()
        .map(|(tick, instances)| (tick, instances.to_vec()))
        .collect()
}

async fn results(State(engine): State<Arc<Engine>>, Path(race_id): Path<String>) -> Response {
    // Results exist once a race is finished and retired; in-flight races
    // deliberately 404 here.
    match engine.live.find_summary(&race_id) {
        Some(summary) => Json(json!({
            "winnerId": summary.outcome.winner_id,
            "finishOrder": summary.outcome.finish_order,
            "finishTimesMs": summary.outcome.finish_times_ms,
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn metrics(State(engine): State<Arc<Engine>>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(engine.metrics.snapshot(engine.options.tick_ms))
}

async fn stream(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<BTreeMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let connect = ConnectParams::from_query(
        params.get("mode").map(String::as_str),
        params.get("binary").map(String::as_str),
    );
    upgrade.on_upgrade(move |socket| serve_socket(socket, engine, connect))
}

// ============================================================================
// Tests
// ============================================================================
