//! Web server module

mod error;
pub mod middleware;
mod routes;

use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::relay::EventRelay;
use middleware::{Tracker, TrackingLayer};

pub use routes::warm_cache;

pub struct AppState {
    pub db: Database,
    pub show_downloads: bool,
}

/// Stats API and resource downloads, with request tracking when a layer is given
pub fn router(state: Arc<AppState>, tracking: Option<TrackingLayer>) -> Router {
    let api = Router::new()
        .route("/api/stats/datasets", get(routes::api_datasets))
        .route("/api/stats/datasets/top", get(routes::api_top_datasets))
        .route("/api/stats/datasets/:id/visits", get(routes::api_dataset_activity))
        .route("/api/stats/resources", get(routes::api_resources))
        .route("/api/stats/resources/top", get(routes::api_top_resources))
        .route("/api/stats/locations/top", get(routes::api_top_locations))
        .route("/api/stats/locations/sessions", get(routes::api_location_sessions))
        .route("/api/stats/locations/monthly", get(routes::api_monthly_sessions))
        .route("/dataset/:id/resource/:resource_id/download", get(routes::resource_download))
        .route(
            "/dataset/:id/resource/:resource_id/download/:filename",
            get(routes::resource_download),
        )
        .with_state(state);

    let api = match tracking {
        Some(layer) => api.layer(layer),
        None => api,
    };
    api.layer(TraceLayer::new_for_http())
}

pub async fn start_server(config: &Config, db: Database, relay: Option<EventRelay>) -> Result<()> {
    let state = Arc::new(AppState {
        db,
        show_downloads: config.server.show_downloads,
    });

    let tracking = relay.map(|relay| {
        info!("Request tracking enabled");
        TrackingLayer::new(Tracker::new(relay, config.tracking.effective_tracking_id()))
    });
    let app = router(state, tracking);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
