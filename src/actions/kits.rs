use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::api_error;
use crate::kits::{Kit, KitSource, KitStatus, NewKit};
use crate::kits_repo::KitAdminUpdate;
use crate::supervisor::classify;
use crate::web::AppState;

/// A kit as the read API reports it: stored columns plus the liveness
/// classification derived from `last_seen` at response time, so callers
/// never wait on the next supervisor sweep.
#[derive(Debug, Serialize)]
pub struct KitView {
    pub kit_id: String,
    pub name: String,
    pub location: Option<String>,
    pub api_url: Option<String>,
    pub source: KitSource,
    pub enabled: bool,
    pub status: KitStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl KitView {
    fn from_kit(kit: &Kit, now: DateTime<Utc>, state: &AppState) -> Self {
        // Never-seen kits keep their stored status (unknown, or offline
        // once the collector hits its failure threshold).
        let status = if kit.last_seen.is_some() {
            classify(
                kit.last_seen,
                now,
                state.config.stale_after,
                state.config.offline_after,
            )
        } else {
            kit.status
        };
        Self {
            kit_id: kit.kit_id.clone(),
            name: kit.name.clone(),
            location: kit.location.clone(),
            api_url: kit.api_url.clone(),
            source: kit.source,
            enabled: kit.enabled,
            status,
            last_seen: kit.last_seen,
            created_at: kit.created_at,
        }
    }
}

pub async fn list_kits(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let kits = state.registry.kits();
    let views: Vec<KitView> = kits
        .iter()
        .map(|k| KitView::from_kit(k, now, &state))
        .collect();
    Json(views)
}

#[derive(Debug, Deserialize)]
pub struct CreateKitRequest {
    pub kit_id: String,
    pub name: Option<String>,
    pub location: Option<String>,
    pub api_url: Option<String>,
    pub source: Option<KitSource>,
    pub enabled: Option<bool>,
}

pub async fn create_kit(
    State(state): State<AppState>,
    Json(body): Json<CreateKitRequest>,
) -> impl IntoResponse {
    if body.kit_id.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "kit_id must not be empty");
    }
    let source = body.source.unwrap_or(KitSource::Http);
    let api_url = body.api_url.clone().filter(|u| !u.is_empty());
    if source != KitSource::Mqtt && api_url.is_none() {
        return api_error(
            StatusCode::BAD_REQUEST,
            "api_url is required unless source is 'mqtt'",
        );
    }

    let new_kit = NewKit {
        kit_id: body.kit_id.trim().to_string(),
        name: body.name.clone().unwrap_or_else(|| body.kit_id.clone()),
        location: body.location.clone(),
        api_url,
        source,
        enabled: body.enabled.unwrap_or(true),
    };

    let created = state
        .registry
        .mutate_and_refresh(move |repo| repo.insert(&new_kit))
        .await;
    match created {
        Ok(Some(kit)) => {
            info!("Admin created kit {}", kit.kit_id);
            (StatusCode::CREATED, Json(kit)).into_response()
        }
        Ok(None) => api_error(
            StatusCode::CONFLICT,
            format!("kit '{}' already exists", body.kit_id),
        ),
        Err(e) => {
            error!("Failed to create kit: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateKitRequest {
    pub name: Option<String>,
    pub location: Option<String>,
    pub api_url: Option<String>,
    pub source: Option<KitSource>,
    pub enabled: Option<bool>,
}

pub async fn update_kit(
    State(state): State<AppState>,
    Path(kit_id): Path<String>,
    Json(body): Json<UpdateKitRequest>,
) -> impl IntoResponse {
    // The http/both source invariant must hold after the partial update.
    if let Some(existing) = state.registry.get(&kit_id) {
        let target_source = match body.source {
            Some(s) => existing.source.merge(s),
            None => existing.source,
        };
        let target_url = body
            .api_url
            .clone()
            .or(existing.api_url)
            .filter(|u| !u.is_empty());
        if target_source != KitSource::Mqtt && target_url.is_none() {
            return api_error(
                StatusCode::BAD_REQUEST,
                "api_url is required while source is 'http' or 'both'",
            );
        }
    }

    let update = KitAdminUpdate {
        name: body.name,
        location: body.location,
        api_url: body.api_url,
        source: body.source,
        enabled: body.enabled,
    };
    let id = kit_id.clone();
    let updated = state
        .registry
        .mutate_and_refresh(move |repo| repo.admin_update(&id, &update))
        .await;
    match updated {
        Ok(Some(kit)) => Json(kit).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("kit '{kit_id}' not found")),
        Err(e) => {
            error!("Failed to update kit {kit_id}: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteKitParams {
    #[serde(default)]
    pub delete_data: bool,
}

pub async fn delete_kit(
    State(state): State<AppState>,
    Path(kit_id): Path<String>,
    Query(params): Query<DeleteKitParams>,
) -> impl IntoResponse {
    let id = kit_id.clone();
    let removed = state
        .registry
        .mutate_and_refresh(move |repo| repo.admin_delete(&id, params.delete_data))
        .await;
    match removed {
        Ok(true) => {
            info!(
                "Admin removed kit {kit_id} (telemetry {})",
                if params.delete_data { "purged" } else { "retained" }
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => api_error(StatusCode::NOT_FOUND, format!("kit '{kit_id}' not found")),
        Err(e) => {
            error!("Failed to delete kit {kit_id}: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TestKitParams {
    pub api_url: String,
}

/// One bounded probe against a candidate kit URL: reachability, the kit id
/// it reports, and the response latency.
pub async fn test_kit(
    State(state): State<AppState>,
    Query(params): Query<TestKitParams>,
) -> impl IntoResponse {
    if params.api_url.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "api_url must not be empty");
    }
    let result = state.kit_client.probe(params.api_url.trim()).await;
    Json(result).into_response()
}
