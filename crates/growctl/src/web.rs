use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::controller::Controller;
use crate::db::Db;
use crate::dosing::DosePump;
use crate::hardware::Device;
use crate::settings::GlobalSettings;

const DEFAULT_EVENT_LIMIT: i64 = 100;
const MAX_EVENT_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/events", get(api_events))
        .route("/api/settings", get(api_settings).put(api_save_settings))
        .route("/api/profiles", get(api_profiles))
        .route("/api/run/{profile}", post(api_run))
        .route("/api/stop", post(api_stop))
        .route("/api/pause", post(api_pause))
        .route("/api/unpause", post(api_unpause))
        .route("/api/kick", post(api_kick))
        .route("/api/resume", post(api_resume))
        .route("/api/resume/dismiss", post(api_resume_dismiss))
        .route("/api/dose", post(api_dose))
        .route("/api/dose/profile", post(api_dose_profile))
        .route("/api/nutrient/stop", post(api_nutrient_stop))
        .route("/api/nutrient/calibrate", post(api_calibrate))
        .route("/api/mix", post(api_mix))
        .route("/api/override", post(api_override))
        .route("/api/override/release", post(api_override_release))
        .route("/api/renewal/begin", post(api_renewal_begin))
        .route("/api/renewal/end", post(api_renewal_end))
        .with_state(state)
}

/// `200 {"ok":true,...}` on success, `409 {"ok":false,"error":...}` when the
/// controller rejects the request.
fn reply(result: Result<Value>) -> Response {
    match result {
        Ok(mut body) => {
            if let Value::Object(map) = &mut body {
                map.insert("ok".into(), Value::Bool(true));
            }
            Json(body).into_response()
        }
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "ok": false, "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

// -- Read -------------------------------------------------------------------

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.controller.status().read().await;
    Json(serde_json::to_value(st.to_status()).unwrap_or_default())
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<i64>,
}

async fn api_events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
    match state.db.recent_events(limit).await {
        Ok(events) => Json(json!({ "ok": true, "events": events })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

async fn api_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(GlobalSettings::clone(&state.controller.settings()))
}

async fn api_save_settings(
    State(state): State<AppState>,
    Json(settings): Json<GlobalSettings>,
) -> Response {
    reply(state.controller.save_settings(settings).map(|()| json!({})))
}

async fn api_profiles(State(state): State<AppState>) -> Response {
    reply(state.controller.profiles().map(|ids| json!({ "profiles": ids })))
}

// -- Run lifecycle ----------------------------------------------------------

async fn api_run(State(state): State<AppState>, Path(profile): Path<String>) -> Response {
    reply(
        state
            .controller
            .start(&profile)
            .await
            .map(|()| json!({ "profile_id": profile })),
    )
}

async fn api_stop(State(state): State<AppState>) -> Response {
    reply(state.controller.stop().await.map(|()| json!({})))
}

async fn api_pause(State(state): State<AppState>) -> Response {
    reply(state.controller.pause().await.map(|()| json!({})))
}

#[derive(Deserialize)]
struct UnpauseQuery {
    #[serde(default)]
    kick: bool,
}

async fn api_unpause(State(state): State<AppState>, Query(q): Query<UnpauseQuery>) -> Response {
    reply(
        state
            .controller
            .unpause(q.kick)
            .await
            .map(|()| json!({ "kick": q.kick })),
    )
}

async fn api_kick(State(state): State<AppState>) -> Response {
    reply(state.controller.kick().await.map(|()| json!({})))
}

async fn api_resume(State(state): State<AppState>) -> Response {
    reply(state.controller.resume_from_checkpoint().await.map(|()| json!({})))
}

async fn api_resume_dismiss(State(state): State<AppState>) -> Response {
    reply(state.controller.dismiss_checkpoint().await.map(|()| json!({})))
}

// -- Dosing -----------------------------------------------------------------

#[derive(Deserialize)]
struct DoseRequest {
    #[serde(default)]
    ml_a: f64,
    #[serde(default)]
    ml_b: f64,
}

async fn api_dose(State(state): State<AppState>, Json(req): Json<DoseRequest>) -> Response {
    reply(
        state
            .controller
            .dose(req.ml_a, req.ml_b)
            .await
            .map(|plan| json!({ "plan": plan })),
    )
}

#[derive(Deserialize)]
struct ProfileDoseRequest {
    litres: Option<f64>,
}

async fn api_dose_profile(
    State(state): State<AppState>,
    Json(req): Json<ProfileDoseRequest>,
) -> Response {
    reply(
        state
            .controller
            .dose_for_litres(req.litres)
            .await
            .map(|plan| json!({ "plan": plan })),
    )
}

async fn api_nutrient_stop(State(state): State<AppState>) -> Response {
    let generation = state.controller.emergency_stop().await;
    reply(Ok(json!({ "generation": generation })))
}

#[derive(Deserialize)]
struct CalibrateRequest {
    pump: DosePump,
    ml: f64,
    seconds: f64,
}

async fn api_calibrate(State(state): State<AppState>, Json(req): Json<CalibrateRequest>) -> Response {
    let controller = state.controller.clone();
    let result = tokio::task::spawn_blocking(move || {
        controller.record_calibration(req.pump, req.ml, req.seconds)
    })
    .await
    .map_err(anyhow::Error::from)
    .and_then(|r| r);
    reply(result.map(|rate| json!({ "pump": req.pump, "ml_per_s": rate })))
}

#[derive(Deserialize)]
struct MixRequest {
    seconds: Option<f64>,
}

async fn api_mix(State(state): State<AppState>, Json(req): Json<MixRequest>) -> Response {
    reply(
        state
            .controller
            .mix(req.seconds)
            .await
            .map(|()| json!({ "seconds": req.seconds })),
    )
}

// -- Manual control ---------------------------------------------------------

#[derive(Deserialize)]
struct OverrideRequest {
    device: Device,
    on: bool,
}

async fn api_override(State(state): State<AppState>, Json(req): Json<OverrideRequest>) -> Response {
    reply(
        state
            .controller
            .set_override(req.device, req.on)
            .await
            .map(|actual| json!({ "device": req.device, "on": actual })),
    )
}

#[derive(Deserialize)]
struct ReleaseRequest {
    device: Device,
}

async fn api_override_release(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> Response {
    reply(
        state
            .controller
            .clear_override(req.device)
            .await
            .map(|()| json!({ "device": req.device })),
    )
}

async fn api_renewal_begin(State(state): State<AppState>) -> Response {
    reply(state.controller.begin_renewal().await.map(|()| json!({})))
}

async fn api_renewal_end(State(state): State<AppState>) -> Response {
    reply(state.controller.end_renewal().await.map(|()| json!({})))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
