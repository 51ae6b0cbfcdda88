use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::arbiter::{GroupView, ZoneView};
use crate::error::{HubError, HubResult};
use crate::state::{SharedState, SystemState};
use crate::zone::{Mode, SavedSchedule, ZoneDef};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HubError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HubError::StaleController(_) => StatusCode::CONFLICT,
            HubError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Storage(e) => {
                error!("storage error: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn invalid(msg: impl Into<String>) -> ApiError {
    ApiError(crate::error::ValidationError::new(msg).into())
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ModeBody {
    mode: String,
}

#[derive(Deserialize)]
struct TestBody {
    duration_seconds: u32,
}

#[derive(Deserialize)]
struct ToggleBody {
    enabled: bool,
}

#[derive(Serialize)]
struct SchedulesResponse {
    groups: Vec<GroupView>,
    schedules: Vec<SavedSchedule>,
}

#[derive(Serialize)]
struct ToggleResponse {
    /// Sibling basic schedules switched off by this change.
    disabled: Vec<String>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/controllers", get(api_controllers))
        .route("/api/zones", get(list_zones))
        .route(
            "/api/zones/{id}",
            get(get_zone).put(put_zone).delete(delete_zone),
        )
        .route("/api/zones/{id}/mode", post(set_mode))
        .route("/api/zones/{id}/start", post(start_zone))
        .route("/api/zones/{id}/stop", post(stop_zone))
        .route("/api/zones/{id}/manual/spray", post(manual_spray))
        .route("/api/zones/{id}/manual/stop", post(manual_stop))
        .route("/api/zones/{id}/test", post(test_spray))
        .route("/api/schedules", get(list_schedules))
        .route(
            "/api/schedules/{id}",
            put(put_schedule).delete(delete_schedule),
        )
        .route("/api/schedules/{id}/toggle", post(toggle_schedule))
        .with_state(state)
}

async fn api_status(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.to_status())
}

async fn api_controllers(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.liveness.controllers(st.now()))
}

// -- Zones ------------------------------------------------------------------

async fn list_zones(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.arbiter.zones())
}

async fn get_zone(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<ZoneView>> {
    let st = state.read().await;
    st.arbiter
        .zone(&id)
        .map(Json)
        .ok_or_else(|| ApiError(HubError::NotFound(format!("zone '{id}'"))))
}

/// Report an operator action to the event log and hand the zone back.
fn finish(st: &mut SystemState, id: &str, action: &str, result: HubResult<()>) -> ApiResult<Json<ZoneView>> {
    match &result {
        Ok(()) => {
            info!(zone = %id, action, "operator action");
            st.record_operator(format!("{id}: {action}"));
        }
        Err(e) => st.record_error(format!("{id}: {action} failed: {e}")),
    }
    result?;
    st.arbiter
        .zone(id)
        .map(Json)
        .ok_or_else(|| ApiError(HubError::NotFound(format!("zone '{id}'"))))
}

async fn put_zone(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(mut def): Json<ZoneDef>,
) -> ApiResult<Json<ZoneView>> {
    if def.zone_id.is_empty() {
        def.zone_id = id.clone();
    } else if def.zone_id != id {
        return Err(invalid(format!("zone_id '{}' does not match path '{id}'", def.zone_id)));
    }
    let mut st = state.write().await;
    let now = st.now();
    let result = st.arbiter.save_zone(def, now).await.map(|_| ());
    finish(&mut st, &id, "saved", result)
}

async fn delete_zone(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let mut st = state.write().await;
    let now = st.now();
    let result = st.arbiter.delete_zone(&id, now).await;
    match &result {
        Ok(()) => st.record_operator(format!("{id}: deleted")),
        Err(e) => st.record_error(format!("{id}: delete failed: {e}")),
    }
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_mode(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<ModeBody>,
) -> ApiResult<Json<ZoneView>> {
    let mode = Mode::parse(&body.mode)
        .ok_or_else(|| invalid(format!("unknown mode '{}' (OFF, MANUAL or AUTO)", body.mode)))?;
    let mut st = state.write().await;
    let now = st.now();
    let result = st.arbiter.set_mode(&id, mode, now).await;
    finish(&mut st, &id, &format!("mode {}", mode.as_str()), result)
}

async fn start_zone(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<ZoneView>> {
    let mut st = state.write().await;
    let now = st.now();
    let result = st.arbiter.start(&id, now).await;
    finish(&mut st, &id, "start", result)
}

async fn stop_zone(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<ZoneView>> {
    let mut st = state.write().await;
    let now = st.now();
    let result = st.arbiter.stop(&id, now).await;
    finish(&mut st, &id, "stop", result)
}

async fn manual_spray(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<ZoneView>> {
    let mut st = state.write().await;
    let now = st.now();
    let result = st.arbiter.manual_spray(&id, now).await;
    finish(&mut st, &id, "manual spray", result)
}

async fn manual_stop(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<ZoneView>> {
    let mut st = state.write().await;
    let now = st.now();
    let result = st.arbiter.manual_stop(&id, now).await;
    finish(&mut st, &id, "manual stop", result)
}

async fn test_spray(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<TestBody>,
) -> ApiResult<Json<ZoneView>> {
    let mut st = state.write().await;
    let now = st.now();
    let result = st.arbiter.test(&id, body.duration_seconds, now).await;
    finish(&mut st, &id, &format!("test {}s", body.duration_seconds), result)
}

// -- Saved schedules ------------------------------------------------------------

async fn list_schedules(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(SchedulesResponse {
        groups: st.arbiter.groups(),
        schedules: st.arbiter.schedules(),
    })
}

/// Report a saved-schedule action to the event log.
fn logged<T>(st: &mut SystemState, id: &str, action: &str, result: HubResult<T>) -> ApiResult<T> {
    match &result {
        Ok(_) => {
            info!(schedule = %id, action, "operator action");
            st.record_operator(format!("schedule {id}: {action}"));
        }
        Err(e) => st.record_error(format!("schedule {id}: {action} failed: {e}")),
    }
    Ok(result?)
}

async fn put_schedule(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(mut schedule): Json<SavedSchedule>,
) -> ApiResult<Json<ToggleResponse>> {
    if schedule.id.is_empty() {
        schedule.id = id.clone();
    } else if schedule.id != id {
        return Err(invalid(format!("schedule id '{}' does not match path '{id}'", schedule.id)));
    }
    let mut st = state.write().await;
    let result = st.arbiter.save_schedule(schedule).await;
    let disabled = logged(&mut st, &id, "saved", result)?;
    Ok(Json(ToggleResponse { disabled }))
}

async fn delete_schedule(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let mut st = state.write().await;
    let result = st.arbiter.delete_schedule(&id).await;
    logged(&mut st, &id, "deleted", result)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_schedule(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> ApiResult<Json<ToggleResponse>> {
    let verb = if body.enabled { "enabled" } else { "disabled" };
    let mut st = state.write().await;
    let result = st.arbiter.toggle_schedule(&id, body.enabled).await;
    let disabled = logged(&mut st, &id, verb, result)?;
    Ok(Json(ToggleResponse { disabled }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "operator api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
