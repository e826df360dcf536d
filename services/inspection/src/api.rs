use crate::aggregator::{
    AggregationState, Aggregator, RefreshHandle, RefreshOutcome, RefreshReason, ShipperView,
};
use crate::auth::{bearer_token, TokenVerifier};
use crate::config::ApiConfig;
use crate::error::{AuthError, Error, StoreError, UploadError, ValidationError};
use crate::models::{GeoPoint, PhotoField, Shipper, UserIdentity};
use crate::mutations::{parse_timestamp_input, Confirmation};
use crate::record_store::RecordStore;
use crate::session::{Session, SessionManager};
use crate::submission::{ContainerDraft, SubmissionForm, SubmissionReceipt, Submitter};
use anyhow::Context;
use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub tokens: Arc<TokenVerifier>,
    pub sessions: Arc<SessionManager>,
    pub aggregator: Arc<Aggregator>,
    pub submitter: Arc<Submitter>,
    pub refresh: RefreshHandle,
}

impl AppState {
    /// Verified identity behind the request's bearer token
    fn identity(&self, headers: &HeaderMap) -> Result<UserIdentity, AuthError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or(AuthError::NoSession)?;
        self.tokens.verify(token)
    }

    /// Established session of the token's user
    fn authorize(&self, headers: &HeaderMap) -> Result<Arc<Session>, AuthError> {
        let user = self.identity(headers)?;
        self.sessions.require(user.id)
    }
}

/// Session of the authenticated caller, resolved per request
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Arc<Session>);

#[async_trait]
impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        Ok(CurrentSession(state.authorize(&parts.headers)?))
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// A failed user action, rendered as `{ error, code }`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(ValidationError::ConfirmationRequired(_)) => {
                StatusCode::PRECONDITION_REQUIRED
            }
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Store(StoreError::InvalidReference { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            Error::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Store(StoreError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Upload(UploadError::Conflict { .. }) => StatusCode::CONFLICT,
            Error::Upload(UploadError::QuotaExceeded { .. }) => StatusCode::INSUFFICIENT_STORAGE,
            Error::Upload(_) | Error::Signing(_) => StatusCode::BAD_GATEWAY,
            Error::Location(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Auth(AuthError::NoSession | AuthError::InvalidToken) => StatusCode::UNAUTHORIZED,
            Error::Auth(AuthError::AdminRequired) => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.code(), "Request failed");
        } else {
            warn!(error = %self.0, code = self.0.code(), "Request rejected");
        }

        let body = ErrorResponse {
            error: self.0.user_message(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Current view returned by `GET /api/v1/shippers`
#[derive(Debug, Serialize)]
pub struct ShipperListResponse {
    #[serde(flatten)]
    pub state: AggregationState,
    pub is_admin: bool,
    pub sequence: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub shipper_count: usize,
    pub container_count: usize,
    pub shippers: Vec<ShipperListItem>,
}

#[derive(Debug, Serialize)]
pub struct ShipperListItem {
    #[serde(flatten)]
    pub view: ShipperView,
    pub expanded: bool,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub message: String,
    pub refresh: RefreshOutcome,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmQuery {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateShipperRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TimestampRequest {
    /// RFC 3339 or `datetime-local`; null or empty clears the override
    #[serde(default)]
    pub custom_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmissionRequest {
    pub shipper_id: Option<Uuid>,
    #[serde(default)]
    pub containers: Vec<DraftRequest>,
}

/// One container draft; photos are base64 JPEG captures
#[derive(Debug, Deserialize)]
pub struct DraftRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub container_photo: Option<String>,
    pub commodity_photo: Option<String>,
    pub ispm_photo: Option<String>,
}

impl DraftRequest {
    fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
            _ => None,
        }
    }

    fn capture(&self, field: PhotoField) -> Option<&str> {
        match field {
            PhotoField::ContainerNumber => self.container_photo.as_deref(),
            PhotoField::Commodity => self.commodity_photo.as_deref(),
            PhotoField::Ispm => self.ispm_photo.as_deref(),
        }
    }
}

impl SubmissionRequest {
    fn into_form(self) -> Result<SubmissionForm, ValidationError> {
        let mut form = SubmissionForm::new();
        if let Some(shipper_id) = self.shipper_id {
            form.select_shipper(shipper_id);
        }

        for (index, draft) in self.containers.iter().enumerate() {
            form.push_draft(ContainerDraft::new(draft.location()));
            for field in PhotoField::ALL {
                if let Some(capture) = draft.capture(field).filter(|c| !c.is_empty()) {
                    form.attach_photo(index, field, capture)?;
                }
            }
        }

        Ok(form)
    }
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub shipper_id: Uuid,
    pub expanded: bool,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/api/v1/session",
            get(get_session).post(establish_session).delete(sign_out),
        )
        .route("/api/v1/shippers", get(list_shippers).post(create_shipper))
        .route(
            "/api/v1/shippers/:shipper_id",
            axum::routing::delete(delete_shipper),
        )
        .route("/api/v1/shippers/:shipper_id/toggle", post(toggle_shipper))
        .route("/api/v1/refresh", post(refresh))
        .route(
            "/api/v1/containers/:container_id",
            axum::routing::delete(delete_container),
        )
        .route(
            "/api/v1/containers/:container_id/verify",
            post(verify_container),
        )
        .route(
            "/api/v1/containers/:container_id/timestamp",
            put(update_timestamp),
        )
        .route("/api/v1/submissions", post(submit))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "inspection-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

async fn get_session(CurrentSession(session): CurrentSession) -> Json<Session> {
    Json(session.as_ref().clone())
}

/// Bind the identity in the caller's access token to a session
#[instrument(skip_all)]
async fn establish_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Session>> {
    let user = state.identity(&headers)?;
    let session = state.sessions.establish(user).await;
    Ok(Json(session.as_ref().clone()))
}

async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let user = state.identity(&headers)?;
    state.sessions.sign_out(user.id);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_shippers(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Json<ShipperListResponse> {
    let snapshot = state.aggregator.snapshot();
    let user_id = session.user.id;

    let shippers = snapshot
        .shippers
        .iter()
        .map(|view| ShipperListItem {
            expanded: state.sessions.is_expanded(user_id, view.shipper.id),
            view: view.clone(),
        })
        .collect();

    Json(ShipperListResponse {
        state: state.aggregator.state(),
        is_admin: session.is_admin,
        sequence: snapshot.sequence,
        refreshed_at: snapshot.refreshed_at,
        shipper_count: snapshot.shipper_count(),
        container_count: snapshot.container_count(),
        shippers,
    })
}

#[instrument(skip_all, fields(user_id = %session.user.id))]
async fn refresh(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Json<RefreshOutcome> {
    let outcome = match state.refresh.request_and_wait(RefreshReason::Manual).await {
        Some(outcome) => outcome,
        // refresh loop not running
        None => state.aggregator.refresh().await,
    };
    Json(outcome)
}

#[instrument(skip_all, fields(user_id = %session.user.id))]
async fn create_shipper(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(request): Json<CreateShipperRequest>,
) -> ApiResult<(StatusCode, Json<Shipper>)> {
    let shipper = state.submitter.create_shipper(&session, &request.name).await?;
    state.refresh.request(RefreshReason::Submission).await;
    Ok((StatusCode::CREATED, Json(shipper)))
}

#[instrument(skip(state, session))]
async fn delete_shipper(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(shipper_id): Path<Uuid>,
    Query(query): Query<ConfirmQuery>,
) -> ApiResult<Json<MutationResponse>> {
    let refresh = state
        .aggregator
        .delete_shipper(&session, shipper_id, query.confirm.into())
        .await?;
    Ok(Json(MutationResponse {
        message: "Shipper berhasil dihapus".to_string(),
        refresh,
    }))
}

async fn toggle_shipper(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(shipper_id): Path<Uuid>,
) -> ApiResult<Json<ToggleResponse>> {
    let expanded = state.sessions.toggle_shipper(session.user.id, shipper_id)?;
    Ok(Json(ToggleResponse {
        shipper_id,
        expanded,
    }))
}

#[instrument(skip(state, session))]
async fn verify_container(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(container_id): Path<Uuid>,
) -> ApiResult<Json<MutationResponse>> {
    let refresh = state
        .aggregator
        .verify_container(&session, container_id)
        .await?;
    Ok(Json(MutationResponse {
        message: "Container berhasil diverifikasi".to_string(),
        refresh,
    }))
}

#[instrument(skip(state, session))]
async fn delete_container(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(container_id): Path<Uuid>,
    Query(query): Query<ConfirmQuery>,
) -> ApiResult<Json<MutationResponse>> {
    let confirmation = Confirmation::from(query.confirm);
    let refresh = state
        .aggregator
        .delete_container(&session, container_id, confirmation)
        .await?;
    Ok(Json(MutationResponse {
        message: "Container berhasil dihapus".to_string(),
        refresh,
    }))
}

#[instrument(skip(state, session, request))]
async fn update_timestamp(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(container_id): Path<Uuid>,
    Json(request): Json<TimestampRequest>,
) -> ApiResult<Json<MutationResponse>> {
    let custom_timestamp = parse_timestamp_input(
        request.custom_timestamp.as_deref(),
        state.aggregator.display_offset(),
    )?;
    let refresh = state
        .aggregator
        .update_timestamp(&session, container_id, custom_timestamp)
        .await?;
    Ok(Json(MutationResponse {
        message: "Timestamp berhasil diupdate".to_string(),
        refresh,
    }))
}

#[instrument(skip_all, fields(user_id = %session.user.id, drafts = request.containers.len()))]
async fn submit(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(request): Json<SubmissionRequest>,
) -> ApiResult<(StatusCode, Json<SubmissionReceipt>)> {
    let form = request.into_form()?;
    let receipt = state.submitter.submit(&session, &form).await?;
    state.refresh.request(RefreshReason::Submission).await;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// Start the API server; returns once `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting inspection API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
