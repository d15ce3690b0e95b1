//! Axum REST API handlers.
//!
//! The caller's identity arrives in the `x-user-id` header, already verified
//! by the gateway in front of this service.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::error;

use crate::errors::LedgerError;
use crate::identity::{self, Caller, Profile, Role};
use crate::ledger::Ledger;
use crate::models::{Attestation, NewDonation, PaymentMethod, PaymentStatus, ReactionType, RegistrationDetails};
use crate::reactions::Reactions;
use crate::registrations::Registrations;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub ledger: Ledger,
    pub reactions: Reactions,
    pub registrations: Registrations,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/donations", post(create_donation))
        .route("/donations/:id", get(get_donation).delete(delete_donation))
        .route("/donations/:id/status", patch(update_donation_status))
        .route("/campaigns", post(create_campaign))
        .route("/campaigns/:id", get(get_campaign))
        .route("/campaigns/:id/donations", get(list_campaign_donations))
        .route("/campaigns/:id/audit", get(audit_campaign))
        .route(
            "/campaigns/:id/reactions/:kind",
            get(reaction_state).post(toggle_reaction),
        )
        .route("/events", post(create_event))
        .route("/events/:id", get(get_event))
        .route("/events/:id/audit", get(audit_event))
        .route("/events/:id/registrations", post(register))
        .route("/events/:id/registrations/me", get(registration_state))
        .route("/profiles/:id", put(upsert_profile))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateDonationRequest {
    pub campaign_id: String,
    pub amount: i64,
    pub method: PaymentMethod,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub last_four_digits: Option<String>,
    #[serde(default)]
    pub receiver_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: PaymentStatus,
}

#[derive(Debug, Deserialize)]
pub struct CreateRecordRequest {
    pub id: String,
    /// Campaign name or event title.
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ProfileRequest {
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_role")]
    pub role: Role,
    /// Opening balance; ignored when the profile already exists.
    #[serde(default)]
    pub wallet_balance: i64,
}

fn default_role() -> Role {
    Role::Member
}

#[derive(Serialize)]
pub struct CreatedResponse {
    pub id: String,
}

#[derive(Serialize)]
pub struct ReactionStateResponse {
    pub user_has_reacted: bool,
}

#[derive(Serialize)]
pub struct RegistrationStateResponse {
    pub registered: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

pub enum ApiError {
    MissingCaller,
    BadRequest(String),
    Ledger(LedgerError),
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

/// HTTP status for an engine error.
pub fn status_for(e: &LedgerError) -> StatusCode {
    match e {
        LedgerError::CampaignNotFound(_)
        | LedgerError::EventNotFound(_)
        | LedgerError::TransactionNotFound(_)
        | LedgerError::UserProfileNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::AlreadyRegistered { .. }
        | LedgerError::AlreadyExists(_)
        | LedgerError::TransactionConflict { .. } => StatusCode::CONFLICT,
        LedgerError::InsufficientFunds { .. } | LedgerError::InvalidTransition { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LedgerError::InvalidAmount(_) | LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        LedgerError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::MissingCaller => (
                StatusCode::UNAUTHORIZED,
                format!("missing {USER_HEADER} header"),
            ),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Ledger(e) => {
                let status = status_for(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!("Request failed: {e}");
                }
                (status, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn caller_id(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or(ApiError::MissingCaller)
}

async fn caller(state: &ApiState, headers: &HeaderMap) -> ApiResult<Caller> {
    let user_id = caller_id(headers)?;
    Ok(Caller::resolve(&state.pool, &user_id).await?)
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /donations`
pub async fn create_donation(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<CreateDonationRequest>,
) -> ApiResult<impl IntoResponse> {
    let user_id = caller_id(&headers)?;
    let id = state
        .ledger
        .create_donation(NewDonation {
            user_id,
            user_email: req.user_email,
            campaign_id: req.campaign_id,
            amount: req.amount,
            method: req.method,
            attestation: Attestation {
                last_four_digits: req.last_four_digits,
                receiver_reference: req.receiver_reference,
            },
        })
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

/// `GET /donations/:id`
pub async fn get_donation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.get_donation(&id).await?))
}

/// `PATCH /donations/:id/status` (admin)
pub async fn update_donation_status(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers).await?;
    state
        .ledger
        .update_donation_status(&caller, &id, req.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /donations/:id` (admin, idempotent)
pub async fn delete_donation(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers).await?;
    state.ledger.delete_donation(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /campaigns` (admin)
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRecordRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers).await?;
    let campaign = state
        .ledger
        .create_campaign(&caller, &req.id, &req.name)
        .await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// `GET /campaigns/:id`
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.get_campaign(&id).await?))
}

/// `GET /campaigns/:id/donations`
pub async fn list_campaign_donations(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.list_campaign_donations(&id).await?))
}

/// `GET /campaigns/:id/audit`
pub async fn audit_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.audit_campaign(&id).await?))
}

/// `POST /campaigns/:id/reactions/:kind`
pub async fn toggle_reaction(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path((campaign_id, kind)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let user_id = caller_id(&headers)?;
    let kind = ReactionType::parse(&kind)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown reaction type: {kind}")))?;
    let outcome = state.reactions.toggle(&campaign_id, &user_id, kind).await?;
    Ok(Json(outcome))
}

/// `GET /campaigns/:id/reactions/:kind`
pub async fn reaction_state(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path((campaign_id, kind)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let user_id = caller_id(&headers)?;
    let kind = ReactionType::parse(&kind)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown reaction type: {kind}")))?;
    let user_has_reacted = state
        .reactions
        .has_reacted(&campaign_id, &user_id, kind)
        .await?;
    Ok(Json(ReactionStateResponse { user_has_reacted }))
}

/// `POST /events` (admin)
pub async fn create_event(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRecordRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers).await?;
    let event = state
        .registrations
        .create_event(&caller, &req.id, &req.name)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// `GET /events/:id`
pub async fn get_event(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registrations.get_event(&id).await?))
}

/// `GET /events/:id/audit`
pub async fn audit_event(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registrations.audit_event(&id).await?))
}

/// `GET /events/:id/registrations/me`
pub async fn registration_state(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let user_id = caller_id(&headers)?;
    let registered = state
        .registrations
        .is_registered(&event_id, &user_id)
        .await?;
    Ok(Json(RegistrationStateResponse { registered }))
}

/// `POST /events/:id/registrations`
pub async fn register(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Json(details): Json<RegistrationDetails>,
) -> ApiResult<impl IntoResponse> {
    let user_id = caller_id(&headers)?;
    let registration = state
        .registrations
        .register(&event_id, &user_id, details)
        .await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

/// `PUT /profiles/:id` (admin)
pub async fn upsert_profile(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(req): Json<ProfileRequest>,
) -> ApiResult<impl IntoResponse> {
    caller(&state, &headers)
        .await?
        .require_admin("provision profiles")?;
    identity::upsert_profile(
        &state.pool,
        &Profile {
            phone: req.phone,
            email: req.email,
            role: req.role,
            wallet_balance: req.wallet_balance,
            ..Profile::new(user_id.clone(), req.display_name)
        },
    )
    .await?;
    let profile = identity::get_profile(&state.pool, &user_id)
        .await?
        .ok_or(LedgerError::UserProfileNotFound(user_id))?;
    Ok(Json(profile))
}
