use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{FromRequest, Path, Request, State, rejection::JsonRejection},
    http::{HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing,
};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::qr_service::{QrFields, QrRecordService, QrServiceError, RenderedQr};

pub const X_SHORT_ID: &str = "x-short-id";
pub const X_REDIRECT_URL: &str = "x-redirect-url";
pub const X_QR_METADATA: &str = "x-qr-metadata";

type Service = Arc<dyn QrRecordService>;
type ApiError = (StatusCode, Json<Error>);

#[derive(Debug, Deserialize)]
pub struct PostQrPayload {
    pub destination_url: Option<String>,
    pub color: Option<String>,
    pub format: Option<String>,
    #[serde(rename = "existingShortId", alias = "existing_short_id")]
    pub existing_short_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PutQrPayload {
    pub destination_url: Option<String>,
    pub color: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateQrPayload {
    pub destination_url: Option<String>,
    pub color: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedQrResponse {
    pub message: String,
    pub short_id: String,
    pub redirect_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QrMetadata<'a> {
    short_id: &'a str,
    redirect_url: &'a str,
    original_url: &'a str,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub success: bool,
    pub message: String,
    /// Timestamp in ISO-8601 format
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct Error {
    pub error: String,
    pub error_id: String,
}

/// [`Json`] that rejects unreadable bodies with a 400 in the [`Error`] shape.
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                let err_uuid = Uuid::new_v4();
                info!(?err_uuid, ?rejection, "User submitted an unreadable body");
                Err((
                    StatusCode::BAD_REQUEST,
                    Json(Error {
                        error: rejection.body_text(),
                        error_id: err_uuid.to_string(),
                    }),
                ))
            }
        }
    }
}

pub fn router(service: Service, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([
            HeaderName::from_static(X_SHORT_ID),
            HeaderName::from_static(X_REDIRECT_URL),
            HeaderName::from_static(X_QR_METADATA),
        ]);

    Router::new()
        .route("/api/qr", routing::post(post_qr))
        .route("/api/qr/{short_id}", routing::get(get_qr).put(put_qr))
        .route("/api/qr/{short_id}/image", routing::get(get_qr_image))
        .route("/api/qr/redirect/{short_id}", routing::get(redirect))
        .route("/redirect/{short_id}", routing::get(redirect))
        .route("/generate", routing::post(generate_static))
        .route("/api/health", routing::get(health))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

#[instrument(skip(service))]
async fn post_qr(
    State(service): State<Service>,
    JsonBody(PostQrPayload {
        destination_url,
        color,
        format,
        existing_short_id,
    }): JsonBody<PostQrPayload>,
) -> Result<Response, ApiError> {
    let fields = QrFields {
        destination_url,
        color,
        format,
    };
    service
        .create_or_update(fields, existing_short_id.as_deref())
        .await
        .map_err(error_response)
        .and_then(image_response)
}

#[instrument(skip(service))]
async fn get_qr(
    State(service): State<Service>,
    Path(short_id): Path<String>,
) -> impl IntoResponse {
    service
        .lookup(&short_id)
        .await
        .map(Json)
        .map_err(error_response)
}

#[instrument(skip(service))]
async fn put_qr(
    State(service): State<Service>,
    Path(short_id): Path<String>,
    JsonBody(PutQrPayload {
        destination_url,
        color,
        format,
    }): JsonBody<PutQrPayload>,
) -> impl IntoResponse {
    let fields = QrFields {
        destination_url,
        color,
        format,
    };
    service
        .update(&short_id, fields)
        .await
        .map(|updated| {
            Json(UpdatedQrResponse {
                message: "QR code updated successfully".to_owned(),
                short_id: updated.short_id,
                redirect_url: updated.redirect_url,
            })
        })
        .map_err(error_response)
}

#[instrument(skip(service))]
async fn get_qr_image(
    State(service): State<Service>,
    Path(short_id): Path<String>,
) -> Result<Response, ApiError> {
    service
        .render(&short_id)
        .await
        .map_err(error_response)
        .and_then(image_response)
}

#[instrument(skip(service))]
async fn redirect(
    State(service): State<Service>,
    Path(short_id): Path<String>,
) -> impl IntoResponse {
    service
        .redirect(&short_id)
        .await
        .map(|redirect| (StatusCode::FOUND, [(header::LOCATION, redirect.url)]))
        .map_err(error_response)
}

#[instrument(skip(service))]
async fn generate_static(
    State(service): State<Service>,
    JsonBody(GenerateQrPayload {
        destination_url,
        color,
        format,
    }): JsonBody<GenerateQrPayload>,
) -> impl IntoResponse {
    let fields = QrFields {
        destination_url,
        color,
        format,
    };
    service
        .render_static(fields)
        .await
        .map(|image| {
            (
                [(header::CONTENT_TYPE, image.content_type)],
                image.bytes,
            )
        })
        .map_err(error_response)
}

#[instrument(skip(service))]
async fn health(State(service): State<Service>) -> impl IntoResponse {
    service
        .check_store()
        .await
        .map(|()| {
            Json(HealthStatus {
                success: true,
                message: "Database keepalive successful".to_owned(),
                timestamp: OffsetDateTime::now_utc()
                    .format(&Rfc3339)
                    .unwrap_or_default(),
            })
        })
        .map_err(error_response)
}

fn image_response(
    RenderedQr {
        short_id,
        redirect_url,
        original_url,
        image,
    }: RenderedQr,
) -> Result<Response, ApiError> {
    let metadata = serde_json::to_string(&QrMetadata {
        short_id: &short_id,
        redirect_url: &redirect_url,
        original_url: &original_url,
    })
    .map_err(|err| {
        let err_uuid = Uuid::new_v4();
        error!(?err_uuid, ?err, "Failed to serialize QR metadata header");
        internal_error(err_uuid, "Internal server error")
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, image.content_type.to_owned()),
            (HeaderName::from_static(X_SHORT_ID), short_id),
            (HeaderName::from_static(X_REDIRECT_URL), redirect_url),
            (HeaderName::from_static(X_QR_METADATA), metadata),
        ],
        image.bytes,
    )
        .into_response())
}

fn error_response(error: QrServiceError) -> ApiError {
    let err_uuid = Uuid::new_v4();
    match error {
        QrServiceError::Validation(_) => {
            info!(?err_uuid, ?error, "User submitted a bad request");
            (
                StatusCode::BAD_REQUEST,
                Json(Error {
                    error: error.to_string(),
                    error_id: err_uuid.to_string(),
                }),
            )
        }
        QrServiceError::NotFound => {
            info!(?err_uuid, "QR code not found");
            (
                StatusCode::NOT_FOUND,
                Json(Error {
                    error: error.to_string(),
                    error_id: err_uuid.to_string(),
                }),
            )
        }
        QrServiceError::AllocationExhausted { .. } => {
            warn!(?err_uuid, ?error, "Exhausted short ID allocation attempts");
            internal_error(
                err_uuid,
                "Could not allocate a unique short ID; please retry the request",
            )
        }
        QrServiceError::Encoding(_) => {
            error!(?err_uuid, ?error, "Failed to render QR code");
            internal_error(err_uuid, "Failed to render QR code")
        }
        QrServiceError::Storage(_) => {
            error!(?err_uuid, ?error, "Encountered an error during a request");
            internal_error(err_uuid, "Internal server error")
        }
    }
}

fn internal_error(err_uuid: Uuid, message: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Error {
            error: message.to_owned(),
            error_id: err_uuid.to_string(),
        }),
    )
}
