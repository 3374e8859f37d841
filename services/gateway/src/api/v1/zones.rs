//! Zone and route views plus access-list edits.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::admin::Admin;
use crate::api::ApiError;
use crate::store::{Route, Zone};

#[derive(Debug, Deserialize)]
pub struct AccessRequest {
    pub cn: String,
}

pub async fn list_zones(State(admin): State<Arc<Admin>>) -> Json<BTreeMap<String, Zone>> {
    Json(admin.store.zones().await)
}

pub async fn list_routes(State(admin): State<Arc<Admin>>) -> Json<BTreeMap<String, Route>> {
    Json(admin.store.routes().await)
}

pub async fn authorize(
    State(admin): State<Arc<Admin>>,
    Path(zone): Path<String>,
    Json(req): Json<AccessRequest>,
) -> Result<StatusCode, ApiError> {
    admin.authorize(&zone, &req.cn).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deauthorize(
    State(admin): State<Arc<Admin>>,
    Path((zone, cn)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    admin.deauthorize(&zone, &cn).await?;
    Ok(StatusCode::NO_CONTENT)
}
