use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use innsync_core::channel::ChannelHealth;
use innsync_core::db::{LogFilter, MappingFilter};
use innsync_core::models::{
    ChangeEvent, Conflict, ConflictId, DeadLetter, DeadLetterId, EntityType, MappingId,
    NewMapping, PropertySettings, RunId, SyncDirection, SyncLog, SyncMapping, SyncState,
    SyncType, TimestampWinner,
};
use innsync_core::sync::{PairStatus, ResolutionReport, ResolutionRequest, WebhookAck};
use innsync_core::SyncContext;

use crate::auth::OperatorAuth;
use crate::error::AppError;
use crate::rate_limit::{RateLimitMetricsSnapshot, TriggerRateLimiter};

pub const SIGNATURE_HEADER: &str = "x-channel-signature";
pub const TIMESTAMP_HEADER: &str = "x-channel-timestamp";

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    context: Arc<SyncContext>,
    trigger_limiter: Arc<TriggerRateLimiter>,
    operator_auth: Option<Arc<OperatorAuth>>,
}

impl AppState {
    pub fn new(
        context: Arc<SyncContext>,
        trigger_limiter: TriggerRateLimiter,
        operator_token: Option<&str>,
    ) -> Self {
        Self {
            context,
            trigger_limiter: Arc::new(trigger_limiter),
            operator_auth: operator_token.map(|token| Arc::new(OperatorAuth::new(token))),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route("/properties/{property_id}/sync/{sync_type}", post(trigger_sync))
        .route("/properties/{property_id}/status", get(property_status))
        .route(
            "/properties/{property_id}/settings",
            get(get_settings).put(put_settings).delete(reset_settings),
        )
        .route("/runs", get(list_runs))
        .route("/logs", get(list_logs))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}", get(get_conflict))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/mappings", get(list_mappings).post(create_mapping))
        .route("/mappings/{id}", delete(retire_mapping))
        .route("/events", post(submit_event))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}/replay", post(replay_dead_letter))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_operator));

    // The webhook authenticates with its own signature.
    let v1 = Router::new()
        .route("/webhooks/channel", post(channel_webhook))
        .merge(operator_routes);

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

async fn require_operator(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(auth) = &state.operator_auth {
        auth.verify(request.headers())?;
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    channel: ChannelHealth,
    trigger_rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        channel: state.context.health(),
        trigger_rate_limit: state.trigger_limiter.metrics_snapshot(),
    })
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: WebhookAck,
}

async fn channel_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let signature = header_str(&headers, SIGNATURE_HEADER);
    let timestamp = header_str(&headers, TIMESTAMP_HEADER);
    let status = state
        .context
        .webhooks()
        .receive(signature, timestamp, &body)
        .await
        .inspect_err(|error| tracing::warn!(error = %error, "Webhook refused"))?;
    Ok(Json(WebhookResponse { status }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    run_id: RunId,
}

async fn trigger_sync(
    State(state): State<AppState>,
    Path((property_id, sync_type)): Path<(String, String)>,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    let sync_type: SyncType = sync_type.parse()?;
    state.context.env().external_property_id(&property_id)?;
    state
        .trigger_limiter
        .check(&property_id, sync_type.as_str())
        .await?;

    let run_id = state
        .context
        .trigger(&property_id, sync_type)
        .await?
        .ok_or_else(|| AppError::conflict(format!("{sync_type} sync is already running")))?;
    tracing::info!(
        property = %property_id,
        sync_type = %sync_type,
        run_id = %run_id,
        "Manual sync triggered"
    );
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { run_id })))
}

async fn property_status(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
) -> Result<Json<Vec<PairStatus>>, AppError> {
    Ok(Json(state.context.status(&property_id).await?))
}

#[derive(Debug, Serialize)]
struct SettingsResponse {
    property_id: String,
    overrides: Option<PropertySettings>,
    amount_tolerance_percent: f64,
    timestamp_winner: TimestampWinner,
}

async fn settings_response(
    state: &AppState,
    property_id: String,
) -> Result<SettingsResponse, AppError> {
    let env = state.context.env();
    env.external_property_id(&property_id)?;
    let overrides = env.store.property_settings(&property_id).await?;
    let policy = env.settings.for_property(overrides.as_ref());
    Ok(SettingsResponse {
        property_id,
        overrides,
        amount_tolerance_percent: policy.amount_tolerance_percent,
        timestamp_winner: policy.timestamp_winner,
    })
}

async fn get_settings(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
) -> Result<Json<SettingsResponse>, AppError> {
    Ok(Json(settings_response(&state, property_id).await?))
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    #[serde(default)]
    amount_tolerance_percent: Option<f64>,
    #[serde(default)]
    timestamp_winner: Option<TimestampWinner>,
}

async fn put_settings(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<SettingsResponse>, AppError> {
    state.context.env().external_property_id(&property_id)?;
    if let Some(tolerance) = update.amount_tolerance_percent {
        if !(0.0..=100.0).contains(&tolerance) {
            return Err(AppError::bad_request(
                "amount_tolerance_percent must be between 0 and 100",
            ));
        }
    }
    let mut settings = PropertySettings::new(property_id.clone());
    settings.amount_tolerance_percent = update.amount_tolerance_percent;
    settings.timestamp_winner = update.timestamp_winner;
    state.context.store().save_property_settings(&settings).await?;
    tracing::info!(property = %property_id, "Property conflict policy updated");
    Ok(Json(settings_response(&state, property_id).await?))
}

async fn reset_settings(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.context.env().external_property_id(&property_id)?;
    state
        .context
        .store()
        .delete_property_settings(&property_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    property_id: Option<String>,
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<SyncState>>, AppError> {
    let runs = state
        .context
        .store()
        .list_runs(query.property_id.as_deref(), page(query.limit))
        .await?;
    Ok(Json(runs))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    property_id: Option<String>,
    run_id: Option<RunId>,
    entity_type: Option<EntityType>,
    local_id: Option<String>,
    external_id: Option<String>,
    #[serde(default)]
    failures_only: bool,
    limit: Option<usize>,
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<SyncLog>>, AppError> {
    let filter = LogFilter {
        property_id: query.property_id,
        run_id: query.run_id,
        entity_type: query.entity_type,
        local_id: query.local_id,
        external_id: query.external_id,
        failures_only: query.failures_only,
        limit: page(query.limit),
    };
    Ok(Json(state.context.store().list_logs(&filter).await?))
}

#[derive(Debug, Deserialize)]
struct ConflictsQuery {
    property_id: Option<String>,
    limit: Option<usize>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    Query(query): Query<ConflictsQuery>,
) -> Result<Json<Vec<Conflict>>, AppError> {
    let conflicts = state
        .context
        .store()
        .list_open_conflicts(query.property_id.as_deref(), page(query.limit))
        .await?;
    Ok(Json(conflicts))
}

#[derive(Debug, Serialize)]
struct ConflictDetail {
    conflict: Conflict,
    /// Every conflict recorded for the same entity, newest first
    history: Vec<Conflict>,
}

async fn get_conflict(
    State(state): State<AppState>,
    Path(id): Path<ConflictId>,
) -> Result<Json<ConflictDetail>, AppError> {
    let store = state.context.store();
    let conflict = store
        .get_conflict(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("conflict {id}")))?;
    let history = store
        .conflict_history(
            &conflict.property_id,
            conflict.entity_type,
            &conflict.external_id,
        )
        .await?;
    Ok(Json(ConflictDetail { conflict, history }))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<ConflictId>,
    Json(request): Json<ResolutionRequest>,
) -> Result<Json<ResolutionReport>, AppError> {
    let report = state.context.resolve_conflict(&id, &request).await?;
    tracing::info!(
        conflict = %id,
        action = %request.action,
        resolved_by = %request.resolved_by,
        "Conflict resolved by operator"
    );
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct MappingsQuery {
    property_id: Option<String>,
    entity_type: Option<EntityType>,
    #[serde(default)]
    include_retired: bool,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn list_mappings(
    State(state): State<AppState>,
    Query(query): Query<MappingsQuery>,
) -> Result<Json<Vec<SyncMapping>>, AppError> {
    let filter = MappingFilter {
        property_id: query.property_id,
        entity_type: query.entity_type,
        include_retired: query.include_retired,
        limit: page(query.limit),
        offset: query.offset,
    };
    Ok(Json(state.context.store().list_mappings(&filter).await?))
}

#[derive(Debug, Deserialize)]
struct CreateMappingRequest {
    property_id: String,
    entity_type: EntityType,
    local_id: String,
    external_id: String,
    sync_direction: Option<SyncDirection>,
}

async fn create_mapping(
    State(state): State<AppState>,
    Json(request): Json<CreateMappingRequest>,
) -> Result<(StatusCode, Json<SyncMapping>), AppError> {
    let local_id = request.local_id.trim();
    let external_id = request.external_id.trim();
    if local_id.is_empty() || external_id.is_empty() {
        return Err(AppError::bad_request(
            "local_id and external_id must not be empty",
        ));
    }
    let external_property_id = state
        .context
        .env()
        .external_property_id(&request.property_id)?;
    let new = NewMapping {
        property_id: request.property_id.clone(),
        entity_type: request.entity_type,
        local_id: local_id.to_string(),
        external_id: external_id.to_string(),
        external_property_id,
        sync_direction: request
            .sync_direction
            .unwrap_or(SyncDirection::Bidirectional),
        local_hash: None,
        external_hash: None,
        match_method: None,
        match_confidence: None,
    };
    let mapping = state.context.store().create_mapping(new, false).await?;
    tracing::info!(
        mapping = %mapping.id,
        property = %mapping.property_id,
        entity_type = %mapping.entity_type,
        "Mapping created by operator"
    );

    // A newly mapped room type needs its inventory pushed.
    if mapping.entity_type == EntityType::RoomType {
        for sync_type in [SyncType::Availability, SyncType::Rates] {
            match state.context.trigger(&mapping.property_id, sync_type).await {
                Ok(Some(run_id)) => {
                    tracing::info!(
                        run_id = %run_id,
                        sync_type = %sync_type,
                        "Inventory push queued for new room type"
                    );
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        sync_type = %sync_type,
                        error = %error,
                        "Inventory push not started"
                    );
                }
            }
        }
    }
    Ok((StatusCode::CREATED, Json(mapping)))
}

async fn retire_mapping(
    State(state): State<AppState>,
    Path(id): Path<MappingId>,
) -> Result<StatusCode, AppError> {
    state.context.store().retire_mapping(&id).await?;
    tracing::info!(mapping = %id, "Mapping retired by operator");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct EventResponse {
    queued: bool,
}

async fn submit_event(
    State(state): State<AppState>,
    Json(event): Json<ChangeEvent>,
) -> Result<(StatusCode, Json<EventResponse>), AppError> {
    let queued = state.context.submit_change(event)?;
    Ok((StatusCode::ACCEPTED, Json(EventResponse { queued })))
}

#[derive(Debug, Deserialize)]
struct DeadLettersQuery {
    #[serde(default)]
    include_replayed: bool,
    limit: Option<usize>,
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLettersQuery>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    let letters = state
        .context
        .store()
        .list_dead_letters(query.include_replayed, page(query.limit))
        .await?;
    Ok(Json(letters))
}

async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<DeadLetterId>,
) -> Result<StatusCode, AppError> {
    state.context.replay_dead_letter(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

fn page(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}
