//! JSON HTTP API consumed by the configuration and display pages.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    qr::{self, QrError},
    scheduler::{self, Clock, Snapshot},
    store::{
        CredentialRecord, CredentialSummary, CredentialUpdate, OrderAssignment, SecretStore,
        StoreError,
    },
    totp::Totp,
    uri::OtpAuthUri,
    OtpError, OtpHashAlgorithm,
};

/// Issuer written into exported otpauth URIs.
pub const EXPORT_ISSUER: &str = "2FA-iframe";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SecretStore>,
    pub clock: Arc<dyn Clock>,
    pub max_image_bytes: usize,
}

impl AppState {
    pub fn new(store: Arc<SecretStore>, clock: Arc<dyn Clock>, max_image_bytes: usize) -> Self {
        Self {
            store,
            clock,
            max_image_bytes,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "2FA not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.status.as_u16(),
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(message) => Self::bad_request(message),
            StoreError::NotFound(_) => Self::not_found(),
            StoreError::Io(_) | StoreError::Serialization(_) => {
                error!(error = %err, "Storage failure");
                Self::internal("Failed to save 2FA data")
            }
        }
    }
}

impl From<QrError> for ApiError {
    fn from(err: QrError) -> Self {
        match err {
            QrError::TooLarge(_) => Self::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string()),
            QrError::Encode(_) => {
                error!(error = %err, "QR rendering failed");
                Self::internal("Failed to generate QR code")
            }
            _ => {
                warn!(error = %err, "QR decode failed");
                Self::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("{err}. Please try again with a different image or crop."),
                )
            }
        }
    }
}

impl From<OtpError> for ApiError {
    fn from(err: OtpError) -> Self {
        Self::bad_request(format!("The stored secret cannot generate codes: {err}"))
    }
}

pub fn router(state: AppState) -> Router {
    let max_image_bytes = state.max_image_bytes;

    Router::new()
        .route("/health", get(health_check))
        .route("/api/2fa", get(list_credentials).post(create_credential))
        .route("/api/2fa/otps", get(current_otps))
        .route("/api/2fa/reorder", put(reorder_credentials))
        .route("/api/2fa/qr/decode", post(decode_qr))
        .route("/api/2fa/qr/import", post(import_qr))
        .route(
            "/api/2fa/{id}",
            put(update_credential).delete(delete_credential),
        )
        .route("/api/2fa/{id}/secret", get(reveal_secret))
        .route("/api/2fa/{id}/verify", post(verify_code))
        .layer(DefaultBodyLimit::max(max_image_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct ListResponse {
    items: Vec<CredentialSummary>,
}

async fn list_credentials(State(state): State<AppState>) -> Json<ListResponse> {
    Json(ListResponse {
        items: state.store.list_active(),
    })
}

async fn current_otps(State(state): State<AppState>) -> Json<Snapshot> {
    Json(scheduler::snapshot(
        &state.store,
        state.clock.unix_seconds(),
    ))
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    secret: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    success: bool,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr_code: Option<String>,
}

async fn create_credential(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    let store = state.store.clone();

    let (id, qr_code) = run_blocking(move || {
        let note = req.note.as_deref().unwrap_or_default();
        let record = store.add_totp(&req.name, note, &Totp::new(req.secret))?;

        // The record is saved at this point; a missing QR code is not a failure.
        let qr_code = match qr::encode_data_uri(&export_uri(&record)) {
            Ok(data_uri) => Some(data_uri),
            Err(e) => {
                warn!(id = %record.id, error = %e, "Skipping QR code for new credential");
                None
            }
        };

        Ok((record.id, qr_code))
    })
    .await?;

    Ok(Json(CreateResponse {
        success: true,
        id,
        qr_code,
    }))
}

async fn update_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<CredentialUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    run_blocking(move || Ok(store.update(&id, update)?)).await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct ReorderRequest {
    items: Vec<OrderAssignment>,
}

async fn reorder_credentials(
    State(state): State<AppState>,
    Json(req): Json<ReorderRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    run_blocking(move || Ok(store.reorder(&req.items)?)).await?;

    Ok(Json(json!({ "success": true })))
}

async fn delete_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    run_blocking(move || Ok(store.soft_delete(&id)?)).await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretResponse {
    secret: String,
    qr_code: String,
}

async fn reveal_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SecretResponse>, ApiError> {
    let record = state.store.get_active(&id)?;

    let response = run_blocking(move || {
        let qr_code = qr::encode_data_uri(&export_uri(&record))?;
        Ok(SecretResponse {
            secret: record.secret,
            qr_code,
        })
    })
    .await?;

    info!(%id, "Secret revealed");
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    token: String,
}

async fn verify_code(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state.store.get_active(&id)?;
    let valid = record.totp().verify(&req.token, state.clock.unix_seconds())?;

    Ok(Json(json!({ "valid": valid })))
}

#[derive(Serialize)]
struct DecodeResponse {
    name: String,
    secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    issuer: Option<String>,
    algorithm: OtpHashAlgorithm,
    digits: u32,
    period: u64,
}

async fn decode_qr(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DecodeResponse>, ApiError> {
    let max_image_bytes = state.max_image_bytes;
    let decoded = run_blocking(move || Ok(qr::decode_image(&body, max_image_bytes)?)).await?;

    Ok(Json(DecodeResponse {
        name: decoded.label,
        secret: decoded.secret,
        issuer: decoded.issuer,
        algorithm: decoded.algorithm,
        digits: decoded.digits,
        period: decoded.period,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ImportParams {
    note: Option<String>,
}

async fn import_qr(
    State(state): State<AppState>,
    Query(params): Query<ImportParams>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let max_image_bytes = state.max_image_bytes;

    let record = run_blocking(move || {
        let decoded = qr::decode_image(&body, max_image_bytes)?;

        let name = match decoded.label.trim() {
            "" => decoded.issuer.as_deref().unwrap_or_default(),
            label => label,
        };
        if name.trim().is_empty() {
            return Err(ApiError::bad_request(
                "The QR code carries no account name; add the secret manually",
            ));
        }

        let note = params.note.as_deref().unwrap_or_default();
        Ok(store.add_totp(name, note, &decoded.to_totp())?)
    })
    .await?;

    Ok(Json(json!({ "success": true, "id": record.id, "name": record.name })))
}

/// Runs file and image work off the async workers.
async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        error!(error = %e, "Blocking task failed");
        ApiError::internal("Internal server error")
    })?
}

fn export_uri(record: &CredentialRecord) -> OtpAuthUri {
    record.otpauth_uri().with_issuer(EXPORT_ISSUER)
}
