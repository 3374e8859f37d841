//! Administrative HTTP API (port 5001).
//!
//! CRUD over endpoints, zones, and routes, plus bundle retrieval. This
//! is the contract the web UI consumes; it is bound to loopback by
//! default and carries no authentication of its own.

mod error;
mod v1;

pub use error::ApiError;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin::Admin;

/// Build the API router.
pub fn router(admin: Arc<Admin>) -> Router {
    Router::new()
        .route("/healthz", get(v1::healthz))
        .route("/v1/clients", post(v1::endpoints::create_client))
        .route("/v1/services", post(v1::endpoints::create_service))
        .route("/v1/endpoints", get(v1::endpoints::list_endpoints))
        .route("/v1/endpoints/{cn}", delete(v1::endpoints::delete_endpoint))
        .route("/v1/endpoints/{cn}/bundle", get(v1::endpoints::download_bundle))
        .route("/v1/zones", get(v1::zones::list_zones))
        .route("/v1/zones/{zone}/access", post(v1::zones::authorize))
        .route("/v1/zones/{zone}/access/{cn}", delete(v1::zones::deauthorize))
        .route("/v1/routes", get(v1::zones::list_routes))
        .layer(TraceLayer::new_for_http())
        .with_state(admin)
}

/// Serve the API until the process exits.
pub async fn serve(bind_addr: SocketAddr, admin: Arc<Admin>) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(bind_addr = %listener.local_addr()?, "Admin API bound");
    axum::serve(listener, router(admin)).await
}
