use crate::error::AppError;
use crate::middleware::guards::AuthUser;
use crate::models::{CallParticipant, CallSession, CallType, MediaUpdate, QualityLabel, QualitySample};
use crate::routes::ApiResponse;
use crate::services::{JoinOutcome, RoomToken};
use crate::state::AppState;
use actix_web::{get, post, web, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Request/Response DTOs
// ============================================================================

/// Start a call with one or more invitees
#[derive(Deserialize)]
pub struct StartCallRequest {
    pub participant_ids: Vec<Uuid>,
    #[serde(default)]
    pub call_type: CallType,
    /// Optional conversation the call belongs to; membership is enforced
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct JoinResponse {
    pub call: CallSession,
    pub token: RoomToken,
}

impl From<JoinOutcome> for JoinResponse {
    fn from(outcome: JoinOutcome) -> Self {
        Self {
            call: outcome.session,
            token: outcome.token,
        }
    }
}

#[derive(Deserialize)]
pub struct QualityRequest {
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub rtt_ms: f64,
    pub bandwidth_kbps: f64,
}

#[derive(Serialize)]
pub struct QualityResponse {
    pub label: QualityLabel,
    pub degraded: bool,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    20
}

const MAX_HISTORY_LIMIT: usize = 100;

// ============================================================================
// API Handlers
// ============================================================================

/// Start a call
/// POST /api/v1/calls
#[post("/api/v1/calls")]
pub async fn start_call(
    state: web::Data<AppState>,
    user: AuthUser,
    body: web::Json<StartCallRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let outcome = state
        .calls
        .start(
            &user.identity,
            body.call_type,
            body.participant_ids,
            body.conversation_id,
        )
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok(JoinResponse::from(outcome))))
}

/// Accept or re-enter a call from the caller's device
/// POST /api/v1/calls/{id}/join
#[post("/api/v1/calls/{call_id}/join")]
pub async fn join_call(
    state: web::Data<AppState>,
    user: AuthUser,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let outcome = state.calls.join(call_id.into_inner(), &user.identity).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(JoinResponse::from(outcome))))
}

/// POST /api/v1/calls/{id}/decline
#[post("/api/v1/calls/{call_id}/decline")]
pub async fn decline_call(
    state: web::Data<AppState>,
    user: AuthUser,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let session = state
        .calls
        .decline(call_id.into_inner(), user.user_id())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(session)))
}

/// Hang up for everyone; ending an ended call succeeds
/// POST /api/v1/calls/{id}/end
#[post("/api/v1/calls/{call_id}/end")]
pub async fn end_call(
    state: web::Data<AppState>,
    user: AuthUser,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let session = state.calls.end(call_id.into_inner(), user.user_id()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(session)))
}

/// Fresh room token for a device already in the call
/// POST /api/v1/calls/{id}/token
#[post("/api/v1/calls/{call_id}/token")]
pub async fn refresh_token(
    state: web::Data<AppState>,
    user: AuthUser,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let token = state
        .calls
        .refresh_token(call_id.into_inner(), &user.identity)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(token)))
}

/// POST /api/v1/calls/{id}/media
#[post("/api/v1/calls/{call_id}/media")]
pub async fn update_media(
    state: web::Data<AppState>,
    user: AuthUser,
    call_id: web::Path<Uuid>,
    body: web::Json<MediaUpdate>,
) -> Result<HttpResponse, AppError> {
    let participant: CallParticipant = state
        .calls
        .update_participant(call_id.into_inner(), &user.identity, body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(participant)))
}

/// Media path confirmed by the client
/// POST /api/v1/calls/{id}/media-connected
#[post("/api/v1/calls/{call_id}/media-connected")]
pub async fn media_connected(
    state: web::Data<AppState>,
    user: AuthUser,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let session = state
        .calls
        .on_media_connected(call_id.into_inner(), &user.identity)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(session)))
}

/// POST /api/v1/calls/{id}/quality
#[post("/api/v1/calls/{call_id}/quality")]
pub async fn report_quality(
    state: web::Data<AppState>,
    user: AuthUser,
    call_id: web::Path<Uuid>,
    body: web::Json<QualityRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let sample = QualitySample {
        jitter_ms: body.jitter_ms,
        packet_loss_pct: body.packet_loss_pct,
        rtt_ms: body.rtt_ms,
        bandwidth_kbps: body.bandwidth_kbps,
        recorded_at: Utc::now(),
    };
    let report = state
        .calls
        .record_quality(call_id.into_inner(), &user.identity, sample)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(QualityResponse {
        label: report.label,
        degraded: report.degraded,
    })))
}

/// GET /api/v1/calls/{id}/stats
#[get("/api/v1/calls/{call_id}/stats")]
pub async fn call_stats(
    state: web::Data<AppState>,
    user: AuthUser,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let stats = state
        .calls
        .stats(call_id.into_inner(), user.user_id())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(stats)))
}

/// Live calls the caller is part of
/// GET /api/v1/calls/active
#[get("/api/v1/calls/active")]
pub async fn active_calls(
    state: web::Data<AppState>,
    user: AuthUser,
) -> Result<HttpResponse, AppError> {
    let calls = state.calls.active_calls(user.user_id()).await;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(calls)))
}

/// Archived calls, newest first
/// GET /api/v1/calls/history?limit=20
#[get("/api/v1/calls/history")]
pub async fn call_history(
    state: web::Data<AppState>,
    user: AuthUser,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let limit = query.limit.clamp(1, MAX_HISTORY_LIMIT);
    let calls = state.calls.history(user.user_id(), limit).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(calls)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(start_call)
        .service(active_calls)
        .service(call_history)
        .service(join_call)
        .service(decline_call)
        .service(end_call)
        .service(refresh_token)
        .service(update_media)
        .service(media_connected)
        .service(report_quality)
        .service(call_stats);
}
