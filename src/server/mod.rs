//! HTTP server exposing the FHIRPath engine to the fhirpath-lab UI
//!
//! Endpoints:
//! - `GET /api/metadata` - CapabilityStatement
//! - `GET|POST /api/$fhirpath` and versioned variants (`-r4`, `-r4b`, `-r5`, `-r6`)
//! - `GET /health`, `GET /version`

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod metadata;
pub mod models;
pub mod paths;
pub mod registry;
pub mod response;
pub mod results;
pub mod trace;
pub mod version;

#[cfg(test)]
mod tests;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header::CONTENT_TYPE},
    routing::get,
};
use std::net::SocketAddr;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::server::{config::ServerConfig, handlers::*, registry::ServerRegistry};

/// Start the server and block until it exits.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Initializing FhirPathEngine registry for all FHIR versions...");
    let registry = ServerRegistry::new().await?;
    info!(
        "Registry initialized with {} FHIR versions",
        registry.version_count()
    );

    let app = create_app(registry, config.clone());

    if config.cors_all {
        warn!("CORS enabled for all origins");
    }

    let addr = SocketAddr::from((config.host, config.port));
    info!("Starting fhirpath-lab server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router.
pub fn create_app(registry: ServerRegistry, config: ServerConfig) -> Router {
    let cors = if config.cors_all {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE])
            .allow_origin(Any)
    } else {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE])
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
    };

    let app = Router::new()
        .route("/api/metadata", get(metadata_handler))
        .route(
            "/api/$fhirpath",
            get(fhirpath_lab_get_handler).post(fhirpath_lab_handler),
        )
        .route(
            "/api/$fhirpath-r4",
            get(fhirpath_lab_get_r4_handler).post(fhirpath_lab_r4_handler),
        )
        .route(
            "/api/$fhirpath-r4b",
            get(fhirpath_lab_get_r4b_handler).post(fhirpath_lab_r4b_handler),
        )
        .route(
            "/api/$fhirpath-r5",
            get(fhirpath_lab_get_r5_handler).post(fhirpath_lab_r5_handler),
        )
        .route(
            "/api/$fhirpath-r6",
            get(fhirpath_lab_get_r6_handler).post(fhirpath_lab_r6_handler),
        )
        .route(
            "/api/$fhirpath-stu3",
            get(fhirpath_lab_stu3_handler).post(fhirpath_lab_stu3_handler),
        )
        .route("/health", get(health_handler))
        .route("/version", get(version_handler));

    app.layer(DefaultBodyLimit::max(config.max_payload_size()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(CatchPanicLayer::new())
        .with_state(registry)
}
