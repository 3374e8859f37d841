//! Problem-details error responses for the admin API.

use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::admin::AdminError;
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: ProblemDetails,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            problem: ProblemDetails {
                title: status
                    .canonical_reason()
                    .unwrap_or("Unknown Error")
                    .to_string(),
                status: status.as_u16(),
                detail: detail.into(),
                code: code.into(),
            },
        }
    }

    pub fn bad_request(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, detail)
    }

    pub fn not_found(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, detail)
    }

    pub fn conflict(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, detail)
    }

    pub fn internal(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        match &err {
            AdminError::UnknownPlatform(_) => Self::bad_request("unknown_platform", err.to_string()),
            AdminError::MissingBinary(_) => Self::bad_request("missing_binary", err.to_string()),
            AdminError::Store(store) => match store {
                StoreError::UnknownEndpoint(_) => Self::not_found("unknown_endpoint", err.to_string()),
                StoreError::UnknownZone(_) => Self::not_found("unknown_zone", err.to_string()),
                StoreError::ZoneOwned { .. } => Self::conflict("zone_owned", err.to_string()),
                StoreError::InvalidZoneName(_) => Self::bad_request("invalid_zone", err.to_string()),
                StoreError::Persist { .. } => Self::internal("persist_failed", err.to_string()),
            },
            AdminError::Pki(_) => Self::internal("issuance_failed", err.to_string()),
            AdminError::Token(_) => Self::internal("token_failed", err.to_string()),
            AdminError::Io(_) => Self::internal("io_error", err.to_string()),
        }
    }
}
