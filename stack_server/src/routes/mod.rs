//! HTTP routes: tenant API, signup webhook, health.

pub mod api;
pub mod webhook;

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::ProvisionError;
use crate::models::{DeploymentRecord, ErrorSummary, RollbackReport, TenantConfig};
use crate::providers::TargetHealth;
use crate::provisioners::UpgradeSummary;
use crate::service::{Accepted, Invalidation, ProvisioningService};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: ProvisioningService,
    pub webhook_secret: String,
}

type ApiError = (StatusCode, Json<ErrorSummary>);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Webhook
        .route("/webhook/signup", post(signup_webhook))
        // Tenant API
        .route("/api/tenants", get(list_tenants).post(provision_tenant))
        .route(
            "/api/tenants/{tenant_id}",
            get(get_tenant).delete(deprovision_tenant),
        )
        .route("/api/tenants/{tenant_id}/upgrade", post(upgrade_tenant))
        .route("/api/tenants/{tenant_id}/invalidate", post(invalidate_cache))
        .route("/api/tenants/{tenant_id}/targets", get(target_health))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP status for a service error.
pub fn status_for(err: &ProvisionError) -> StatusCode {
    match err {
        ProvisionError::ConfigValidation { .. } => StatusCode::BAD_REQUEST,
        ProvisionError::InvalidUpgrade { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ProvisionError::NotFound(_) => StatusCode::NOT_FOUND,
        ProvisionError::ProvisioningInProgress(_) | ProvisionError::NotCompleted { .. } => {
            StatusCode::CONFLICT
        }
        ProvisionError::Stage { .. } | ProvisionError::RollbackPartialFailure { .. } => {
            StatusCode::BAD_GATEWAY
        }
        ProvisionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: ProvisionError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    } else {
        tracing::debug!(error = %err, "request rejected");
    }
    (status, Json(ErrorSummary::from(&err)))
}

async fn health(State(state): State<AppState>) -> Json<api::HealthJson> {
    Json(api::HealthJson {
        status: "ok",
        active_runs: state.service.active_runs(),
    })
}

// ── Webhook ──

async fn signup_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Option<Accepted>>), StatusCode> {
    let accepted =
        webhook::handle_signup(&state.service, &state.webhook_secret, &headers, body).await?;
    let status = if accepted.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(accepted)))
}

// ── Tenant API ──

async fn provision_tenant(
    State(state): State<AppState>,
    Json(config): Json<TenantConfig>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    crate::metrics::signup_received("api");
    state
        .service
        .spawn_provision(config)
        .await
        .map(|accepted| (StatusCode::ACCEPTED, Json(accepted)))
        .map_err(api_error)
}

async fn list_tenants(
    State(state): State<AppState>,
) -> Result<Json<Vec<api::TenantSummary>>, ApiError> {
    let records = state.service.list().await.map_err(api_error)?;
    Ok(Json(records.iter().map(api::TenantSummary::from).collect()))
}

async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    state
        .service
        .get_status(&tenant_id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Teardown runs in its own task: a timed-out or disconnected request must
/// not stop a rollback half way.
async fn deprovision_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<RollbackReport>, ApiError> {
    let service = state.service.clone();
    let teardown = tokio::spawn(async move { service.deprovision(&tenant_id).await });
    match teardown.await {
        Ok(result) => result.map(Json).map_err(api_error),
        Err(e) => {
            tracing::error!(error = %e, "deprovision task failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorSummary {
                    kind: "internal".to_string(),
                    stage: None,
                    message: e.to_string(),
                }),
            ))
        }
    }
}

async fn upgrade_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<api::UpgradeRequest>,
) -> Result<Json<UpgradeSummary>, ApiError> {
    state
        .service
        .upgrade_tier(&tenant_id, req.tier)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn invalidate_cache(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<api::InvalidateRequest>,
) -> Result<(StatusCode, Json<Invalidation>), ApiError> {
    state
        .service
        .invalidate_cache(&tenant_id, req.paths)
        .await
        .map(|inv| (StatusCode::ACCEPTED, Json(inv)))
        .map_err(api_error)
}

async fn target_health(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<TargetHealth>>, ApiError> {
    state
        .service
        .target_health(&tenant_id)
        .await
        .map(Json)
        .map_err(api_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::models::Stage;

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(
            status_for(&ProvisionError::ConfigValidation { problems: vec![] }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ProvisionError::ProvisioningInProgress("acme-1".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ProvisionError::NotFound("acme-1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ProvisionError::Stage {
                stage: Stage::Database,
                source: StageError::DatabaseFailed("acme-1-db".into()),
            }),
            StatusCode::BAD_GATEWAY
        );
    }
}
