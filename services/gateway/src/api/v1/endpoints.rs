//! Endpoint lifecycle: issuance, listing, deletion, bundle download.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::admin::Admin;
use crate::api::ApiError;
use crate::store::{Endpoint, ZoneRecord};

#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
    pub platform: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub platform: String,
    pub backend_host: String,
    pub backend_port: u16,
    pub domains: Vec<String>,
    /// Records by label, applied to every created zone. A-record values
    /// are pinned to the gateway address server-side.
    #[serde(default)]
    pub records: BTreeMap<String, Vec<ZoneRecord>>,
}

#[derive(Debug, Serialize)]
pub struct CreateEndpointResponse {
    pub cn: String,
    pub bundle_url: String,
}

pub async fn create_client(
    State(admin): State<Arc<Admin>>,
    Json(req): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<CreateEndpointResponse>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("invalid_name", "name must not be empty"));
    }

    let created = admin.create_client(name, &req.platform).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateEndpointResponse {
            bundle_url: format!("/v1/endpoints/{}/bundle", created.cn),
            cn: created.cn,
        }),
    ))
}

pub async fn create_service(
    State(admin): State<Arc<Admin>>,
    Json(req): Json<CreateServiceRequest>,
) -> Result<(StatusCode, Json<CreateEndpointResponse>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("invalid_name", "name must not be empty"));
    }
    if req.backend_port == 0 {
        return Err(ApiError::bad_request("invalid_port", "backend_port must be 1..65535"));
    }
    if req.domains.iter().all(|d| d.trim().is_empty()) {
        return Err(ApiError::bad_request("invalid_domains", "at least one domain is required"));
    }

    let created = admin
        .create_service(
            name,
            &req.platform,
            req.backend_host.trim(),
            req.backend_port,
            &req.domains,
            &req.records,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateEndpointResponse {
            bundle_url: format!("/v1/endpoints/{}/bundle", created.cn),
            cn: created.cn,
        }),
    ))
}

pub async fn list_endpoints(
    State(admin): State<Arc<Admin>>,
) -> Json<BTreeMap<String, Endpoint>> {
    Json(admin.store.endpoints().await)
}

pub async fn delete_endpoint(
    State(admin): State<Arc<Admin>>,
    Path(cn): Path<String>,
) -> Result<StatusCode, ApiError> {
    admin.delete_endpoint(&cn).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn download_bundle(
    State(admin): State<Arc<Admin>>,
    Path(cn): Path<String>,
) -> Result<Response, ApiError> {
    let (filename, bytes) = admin.bundle(&cn).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/gzip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::internal("response_build", e.to_string()))
}
