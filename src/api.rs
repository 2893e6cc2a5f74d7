use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::{time::OffsetDateTime, uuid::Uuid};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{error, info, warn};

use crate::{
    error::DispatchError,
    metrics,
    models::{
        Application, Bounds, Device, DeviceProfile, DispatchResult, FilterSpec,
        NotificationLogEntry, ScheduledNotification, ScheduledNotificationPatch, Segment,
    },
    service::{CredentialStatus, CredentialUpload, NewApplication, NotificationService},
    stats::{DayCount, OverviewStats, UserStats},
};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_CONCURRENT_REQUESTS: usize = 256;

// API state
pub struct ApiState {
    pub service: Arc<NotificationService>,
    pub dispatch_timeout: Duration,
}

pub enum ApiError {
    Dispatch(DispatchError),
    Timeout(Duration),
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError::Dispatch(e)
    }
}

fn status_for(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::NotFound(_) | DispatchError::NoMatchingDevices => StatusCode::NOT_FOUND,
        DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
        DispatchError::TenantIdMissing
        | DispatchError::CredentialNotFound { .. }
        | DispatchError::CredentialMalformed { .. } => StatusCode::FAILED_DEPENDENCY,
        DispatchError::Gateway { .. } => StatusCode::BAD_GATEWAY,
        DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, tenant_id) = match self {
            ApiError::Dispatch(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                }
                (status, e.to_string(), e.tenant_id().map(str::to_string))
            }
            ApiError::Timeout(after) => {
                warn!(timeout_secs = after.as_secs(), "Dispatch timed out");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("Dispatch did not finish within {}s", after.as_secs()),
                    None,
                )
            }
        };

        let body = Json(json!({
            "message": message,
            "tenantId": tenant_id,
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Bounds a dispatch by the configured deadline. Dropping the future on
/// expiry abandons any gateway calls still in flight.
async fn with_deadline<T, F>(state: &ApiState, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, DispatchError>>,
{
    match tokio::time::timeout(state.dispatch_timeout, fut).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => Err(ApiError::Timeout(state.dispatch_timeout)),
    }
}

// Request and response models
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    app_id: Uuid,
    title: String,
    body: String,
    #[serde(default)]
    filters: FilterSpec,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendToTokensRequest {
    app_id: Uuid,
    title: String,
    body: String,
    #[serde(default)]
    tokens: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendByBoundsRequest {
    app_id: Uuid,
    title: String,
    body: String,
    bounds: Bounds,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    app_id: Uuid,
    title: String,
    body: String,
    #[serde(default)]
    filters: FilterSpec,
    #[serde(with = "time::serde::rfc3339")]
    send_at: OffsetDateTime,
}

#[derive(Deserialize)]
struct MessageRequest {
    title: String,
    body: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchResponse {
    message: String,
    #[serde(flatten)]
    result: DispatchResult,
}

impl From<DispatchResult> for DispatchResponse {
    fn from(result: DispatchResult) -> Self {
        Self {
            message: format!("Notification sent to {} devices", result.success_count),
            result,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadCredentialRequest {
    #[serde(default)]
    tenant_id: Option<String>,
    service_account: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplaceCredentialRequest {
    service_account: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerQuery {
    owner_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDeviceRequest {
    app_id: Uuid,
    token: String,
    #[serde(default)]
    profile: DeviceProfile,
}

#[derive(Deserialize)]
struct UpdateDeviceRequest {
    token: String,
    profile: DeviceProfile,
}

#[derive(Deserialize)]
struct UpdateLocationRequest {
    token: String,
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSegmentRequest {
    app_id: Uuid,
    name: String,
    #[serde(default)]
    filters: FilterSpec,
}

// Set up API router
pub fn create_api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Notifications
        .route("/notifications/send", post(send_notification))
        .route("/notifications/send-to-specific", post(send_to_specific))
        .route("/notifications/send-by-location", post(send_by_location))
        .route("/notifications/schedule", post(schedule_notification))
        // GET takes an application id, PUT and DELETE a scheduled notification id.
        .route(
            "/notifications/scheduled/:id",
            get(list_scheduled)
                .put(update_scheduled)
                .delete(delete_scheduled),
        )
        .route("/notifications/history/app/:app_id", get(history_by_app))
        .route("/notifications/history/:token", get(history_by_token))
        .route("/notifications/stats/daily/:app_id", get(daily_stats))
        .route("/notifications/:id", delete(delete_log_entry))
        // Applications and credentials
        .route("/applications/upload-service-account", post(upload_credential))
        .route("/applications", post(create_application).get(list_applications))
        .route(
            "/applications/:id",
            get(get_application).delete(delete_application),
        )
        .route("/applications/:id/interests", get(application_interests))
        .route("/applications/:id/client-id", get(application_tenant))
        .route("/applications/:id/service-account-status", get(credential_status))
        .route("/applications/:id/service-account", put(replace_credential))
        // Devices
        .route("/devices/register", post(register_device))
        .route("/devices/app/:app_id", get(devices_for_app))
        .route("/devices/app/:app_id/located", get(located_devices))
        .route("/devices/me/:token", get(device_by_token))
        .route("/devices/update", put(update_device))
        .route("/devices/location", put(update_location))
        .route("/devices/unregister/:token", delete(unregister_device))
        // Segments
        .route("/segments", post(create_segment))
        .route("/segments/:id", get(list_segments).delete(delete_segment))
        .route("/segments/:id/send", post(send_to_segment))
        // Statistics
        .route("/stats/overview/:app_id", get(overview_stats))
        .route("/stats/per-user/:app_id", get(per_user_stats))
        // Operations
        .route("/admin/tenants", get(cached_tenants))
        .route("/admin/tenants/invalidate", post(invalidate_all_tenants))
        .route("/admin/tenants/:tenant_id/invalidate", post(invalidate_tenant))
        .route("/metrics", get(metrics_endpoint))
        .route("/health", get(health))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(CorsLayer::permissive())
}

// Notification handlers
async fn send_notification(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SendRequest>,
) -> ApiResult<DispatchResponse> {
    info!(app_id = %req.app_id, "Sending notification");
    let result = with_deadline(
        &state,
        state
            .service
            .send_immediate(req.app_id, &req.title, &req.body, req.filters),
    )
    .await?;
    Ok(Json(result.into()))
}

async fn send_to_specific(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SendToTokensRequest>,
) -> ApiResult<DispatchResponse> {
    info!(app_id = %req.app_id, tokens = req.tokens.len(), "Sending to specific tokens");
    let result = with_deadline(
        &state,
        state
            .service
            .send_to_tokens(req.app_id, &req.title, &req.body, &req.tokens),
    )
    .await?;
    Ok(Json(result.into()))
}

async fn send_by_location(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SendByBoundsRequest>,
) -> ApiResult<DispatchResponse> {
    info!(app_id = %req.app_id, "Sending by location bounds");
    let result = with_deadline(
        &state,
        state
            .service
            .send_by_bounds(req.app_id, &req.title, &req.body, req.bounds),
    )
    .await?;
    Ok(Json(result.into()))
}

async fn schedule_notification(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduledNotification>), ApiError> {
    let scheduled = state
        .service
        .schedule_notification(req.app_id, &req.title, &req.body, req.filters, req.send_at)
        .await?;
    Ok((StatusCode::CREATED, Json(scheduled)))
}

async fn list_scheduled(
    State(state): State<Arc<ApiState>>,
    Path(app_id): Path<Uuid>,
) -> ApiResult<Vec<ScheduledNotification>> {
    Ok(Json(state.service.list_scheduled(app_id).await?))
}

async fn update_scheduled(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<ScheduledNotificationPatch>,
) -> ApiResult<ScheduledNotification> {
    Ok(Json(state.service.update_scheduled(id, patch).await?))
}

async fn delete_scheduled(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_scheduled(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn history_by_app(
    State(state): State<Arc<ApiState>>,
    Path(app_id): Path<Uuid>,
) -> ApiResult<Vec<NotificationLogEntry>> {
    Ok(Json(state.service.history_for_application(app_id).await?))
}

async fn history_by_token(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
) -> ApiResult<Vec<NotificationLogEntry>> {
    Ok(Json(state.service.history_for_token(&token).await?))
}

async fn daily_stats(
    State(state): State<Arc<ApiState>>,
    Path(app_id): Path<Uuid>,
) -> ApiResult<Vec<DayCount>> {
    Ok(Json(state.service.daily_stats(app_id).await?))
}

async fn delete_log_entry(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_log_entry(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Application handlers
async fn upload_credential(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<UploadCredentialRequest>,
) -> Result<(StatusCode, Json<CredentialUpload>), ApiError> {
    let blob = serde_json::to_vec(&req.service_account)
        .map_err(|e| DispatchError::Validation(e.to_string()))?;
    let upload = state
        .service
        .upload_credential(req.tenant_id.as_deref(), &blob)
        .await?;
    Ok((StatusCode::CREATED, Json(upload)))
}

async fn create_application(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewApplication>,
) -> Result<(StatusCode, Json<Application>), ApiError> {
    let app = state.service.create_application(req).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn list_applications(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Vec<Application>> {
    Ok(Json(state.service.list_applications(&query.owner_id).await?))
}

async fn get_application(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Application> {
    Ok(Json(state.service.get_application(id).await?))
}

async fn delete_application(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_application(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn application_interests(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<String>> {
    Ok(Json(state.service.application_interests(id).await?))
}

async fn application_tenant(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let app = state.service.get_application(id).await?;
    Ok(Json(json!({ "tenantId": app.tenant_id })))
}

async fn credential_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<CredentialStatus> {
    Ok(Json(state.service.credential_status(id).await?))
}

async fn replace_credential(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReplaceCredentialRequest>,
) -> ApiResult<CredentialStatus> {
    let blob = serde_json::to_vec(&req.service_account)
        .map_err(|e| DispatchError::Validation(e.to_string()))?;
    Ok(Json(
        state.service.replace_application_credential(id, &blob).await?,
    ))
}

// Device handlers
async fn register_device(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let device = state
        .service
        .register_device(req.app_id, &req.token, req.profile)
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn devices_for_app(
    State(state): State<Arc<ApiState>>,
    Path(app_id): Path<Uuid>,
) -> ApiResult<Vec<Device>> {
    Ok(Json(state.service.devices_for_application(app_id).await?))
}

async fn located_devices(
    State(state): State<Arc<ApiState>>,
    Path(app_id): Path<Uuid>,
) -> ApiResult<Vec<Device>> {
    Ok(Json(state.service.devices_with_location(app_id).await?))
}

async fn device_by_token(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
) -> ApiResult<Device> {
    Ok(Json(state.service.device_by_token(&token).await?))
}

async fn update_device(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<UpdateDeviceRequest>,
) -> ApiResult<Device> {
    Ok(Json(
        state
            .service
            .update_device_profile(&req.token, req.profile)
            .await?,
    ))
}

async fn update_location(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<UpdateLocationRequest>,
) -> ApiResult<Device> {
    Ok(Json(
        state
            .service
            .update_device_location(&req.token, req.lat, req.lng)
            .await?,
    ))
}

async fn unregister_device(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.unregister_device(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Segment handlers
async fn create_segment(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateSegmentRequest>,
) -> Result<(StatusCode, Json<Segment>), ApiError> {
    let segment = state
        .service
        .create_segment(req.app_id, &req.name, req.filters)
        .await?;
    Ok((StatusCode::CREATED, Json(segment)))
}

/// `id` is the application id here.
async fn list_segments(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Segment>> {
    Ok(Json(state.service.list_segments(id).await?))
}

async fn delete_segment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_segment(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_to_segment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<DispatchResponse> {
    let result = with_deadline(
        &state,
        state.service.send_to_segment(id, &req.title, &req.body),
    )
    .await?;
    Ok(Json(result.into()))
}

// Statistics handlers
async fn overview_stats(
    State(state): State<Arc<ApiState>>,
    Path(app_id): Path<Uuid>,
) -> ApiResult<OverviewStats> {
    Ok(Json(state.service.overview_stats(app_id).await?))
}

async fn per_user_stats(
    State(state): State<Arc<ApiState>>,
    Path(app_id): Path<Uuid>,
) -> ApiResult<Vec<UserStats>> {
    Ok(Json(state.service.per_user_stats(app_id).await?))
}

// Operational handlers
async fn cached_tenants(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let tenants = state.service.cached_tenants().await;
    Json(json!({ "tenants": tenants }))
}

async fn invalidate_all_tenants(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let cleared = state.service.invalidate_all_tenant_caches().await;
    Json(json!({ "cleared": cleared }))
}

async fn invalidate_tenant(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let cleared = state.service.invalidate_tenant_cache(&tenant_id).await?;
    Ok(Json(json!({ "tenantId": tenant_id, "cleared": cleared })))
}

async fn metrics_endpoint() -> String {
    metrics::metrics_handler()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
