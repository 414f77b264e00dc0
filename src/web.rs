use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::actions;
use crate::config::AppConfig;
use crate::db::PgPool;
use crate::health_repo::HealthRepository;
use crate::kit_client::KitClient;
use crate::registry::KitRegistry;
use crate::signals_repo::SignalsRepository;
use crate::tracks_repo::TracksRepository;

/// Shared application context handed to every handler. Built once in
/// `main`; no process-wide mutable state hides behind it.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub registry: KitRegistry,
    pub tracks: TracksRepository,
    pub signals: SignalsRepository,
    pub health: HealthRepository,
    pub kit_client: KitClient,
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        registry: KitRegistry,
        kit_client: KitClient,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        Self {
            config,
            registry,
            tracks: TracksRepository::new(pool.clone()),
            signals: SignalsRepository::new(pool.clone()),
            health: HealthRepository::new(pool),
            kit_client,
            metrics_handle,
        }
    }
}

/// Request logging with a short correlation id.
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(
        "{} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        response.status().as_u16(),
        elapsed_ms
    );
    metrics::histogram!("dragnet.http.request_duration_ms").record(elapsed_ms);
    response
}

async fn metrics_endpoint(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    state.metrics_handle.render()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(actions::status::health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/kits", get(actions::kits::list_kits))
        .route("/api/drones", get(actions::drones::query_drones))
        .route("/api/drones/{id}/track", get(actions::drones::drone_track))
        .route("/api/signals", get(actions::signals::query_signals))
        .route("/api/export/csv", get(actions::drones::export_csv))
        .route("/api/admin/kits", post(actions::kits::create_kit))
        .route("/api/admin/kits/test", post(actions::kits::test_kit))
        .route("/api/admin/kits/{id}", put(actions::kits::update_kit))
        .route("/api/admin/kits/{id}", delete(actions::kits::delete_kit))
        .route(
            "/api/patterns/repeated-drones",
            get(actions::patterns::repeated_drones),
        )
        .route(
            "/api/patterns/coordinated",
            get(actions::patterns::coordinated),
        )
        .route(
            "/api/patterns/pilot-reuse",
            get(actions::patterns::pilot_reuse_endpoint),
        )
        .route("/api/patterns/anomalies", get(actions::patterns::anomalies_endpoint))
        .route("/api/patterns/multi-kit", get(actions::patterns::multi_kit))
        .route(
            "/api/patterns/security-alerts",
            get(actions::patterns::security_alerts_endpoint),
        )
        .route("/api/patterns/loitering", get(actions::patterns::loitering_endpoint))
        .route(
            "/api/patterns/rapid-descent",
            get(actions::patterns::rapid_descent_endpoint),
        )
        .route(
            "/api/patterns/night-activity",
            get(actions::patterns::night_activity_endpoint),
        )
        .route(
            "/api/analysis/estimate-location/{drone_id}",
            get(actions::analysis::estimate_location),
        )
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(CorsLayer::permissive())
}

/// Bind and serve until the cancellation token fires, then finish
/// in-flight requests and return.
pub async fn start_web_server(
    state: AppState,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("Web server listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
