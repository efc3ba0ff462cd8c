//! REST API Handlers
//!
//! Thin axum surface over the orchestrator: snapshot lifecycle and
//! schedules, log bundle download, and node drain/purge.

use crate::controlplane::Orchestrator;
use crate::domain::SnapshotTrigger;
use crate::error::Error;
use crate::node::DrainOutcome;
use crate::snapshot::schedule::{valid_ttl, SnapshotSchedule};
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Added to the download budget before a request is cancelled
const DEADLINE_SLACK: Duration = Duration::from_secs(5);

// =============================================================================
// Request/Response Types
// =============================================================================

/// Snapshot creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotRequest {
    /// manual (default), schedule or pre_upgrade
    #[serde(default)]
    pub trigger: Option<String>,
    /// Retention replacing the template's, e.g. `720h0m0s`
    #[serde(default)]
    pub ttl: Option<String>,
}

/// Name of a created resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedResponse {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSnapshotsQuery {
    /// Only snapshots of this application slug
    #[serde(default)]
    pub app: Option<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Snapshot endpoints
            .route("/v1/apps/:app_id/snapshots", post(create_snapshot))
            .route("/v1/snapshots", get(list_snapshots))
            .route(
                "/v1/snapshots/:name",
                get(get_snapshot).delete(delete_snapshot),
            )
            .route("/v1/snapshots/:name/restore", post(restore_snapshot))
            .route("/v1/snapshots/:name/logs", get(download_logs))
            .route(
                "/v1/apps/:app_id/snapshot-schedule",
                put(save_schedule).get(get_schedule).delete(delete_schedule),
            )
            // Node endpoints
            .route("/v1/nodes/:name/drain", post(drain_node))
            .route("/v1/nodes/:name/purge", post(purge_node))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Token cancelled once the download budget is spent or the handler returns
    fn deadline(&self) -> (CancellationToken, DropGuard) {
        let cancel = CancellationToken::new();
        let budget = self.orchestrator.download_budget() + DEADLINE_SLACK;
        let timer = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(budget) => timer.cancel(),
            }
        });
        let guard = cancel.clone().drop_guard();
        (cancel, guard)
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn error_code(err: &Error) -> &'static str {
    match err {
        Error::AccessDenied { .. } => "access_denied",
        Error::ControllerNotInstalled => "controller_not_installed",
        Error::ResourceNotFound { .. } | Error::NodeNotFound { .. } | Error::AppNotFound { .. } => {
            "not_found"
        }
        Error::NoStorageBackend { .. } => "no_storage_backend",
        Error::InvalidBackup { .. } => "invalid_backup",
        Error::InvalidSchedule { .. } => "invalid_schedule",
        Error::DownloadTimeout { .. } | Error::DownloadCancelled { .. } | Error::Timeout { .. } => {
            "timeout"
        }
        Error::CordonFailed { .. } => "cordon_failed",
        Error::EvictionBudgetBlocked { .. } => "eviction_blocked",
        Error::EvictionMisconfigured { .. } => "eviction_misconfigured",
        Error::PurgeIncomplete { .. } => "purge_incomplete",
        _ => "internal_error",
    }
}

fn error_response(err: Error, details: Option<serde_json::Value>) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, "request rejected");
    }

    let details = details.or_else(|| match &err {
        Error::PurgeIncomplete { failures, .. } => Some(serde_json::json!(failures
            .iter()
            .map(|f| serde_json::json!({"step": f.step, "resource": f.resource, "reason": f.reason}))
            .collect::<Vec<_>>())),
        _ => None,
    });

    (
        status,
        Json(ApiErrorResponse {
            error: error_code(&err).into(),
            message: err.to_string(),
            details,
        }),
    )
        .into_response()
}

fn parse_trigger(value: Option<&str>) -> Option<SnapshotTrigger> {
    match value {
        None => Some(SnapshotTrigger::Manual),
        Some(v) => SnapshotTrigger::from_annotation(&v.replace('-', "_")),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Create a snapshot for an application
async fn create_snapshot(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    body: Option<Json<CreateSnapshotRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let Some(trigger) = parse_trigger(request.trigger.as_deref()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiErrorResponse {
                error: "invalid_trigger".into(),
                message: format!(
                    "Invalid trigger: {}. Use 'manual', 'schedule' or 'pre_upgrade'",
                    request.trigger.unwrap_or_default()
                ),
                details: None,
            }),
        )
            .into_response();
    };

    if let Some(ttl) = request.ttl.as_deref().filter(|t| !valid_ttl(t)) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiErrorResponse {
                error: "invalid_ttl".into(),
                message: format!("Invalid ttl: {}. Use a duration such as '720h0m0s'", ttl),
                details: None,
            }),
        )
            .into_response();
    }

    match state
        .orchestrator
        .create_snapshot(&app_id, trigger, request.ttl.as_deref())
        .await
    {
        Ok(name) => {
            info!(app = %app_id, backup = %name, "snapshot created");
            (StatusCode::CREATED, Json(CreatedResponse { name })).into_response()
        }
        Err(e) => error_response(e, None),
    }
}

/// List snapshots
async fn list_snapshots(
    State(state): State<AppState>,
    Query(query): Query<ListSnapshotsQuery>,
) -> impl IntoResponse {
    match state.orchestrator.list_snapshots(query.app.as_deref()).await {
        Ok(snapshots) => (StatusCode::OK, Json(snapshots)).into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Snapshot detail
async fn get_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let (cancel, _guard) = state.deadline();
    match state.orchestrator.get_snapshot_detail(&name, &cancel).await {
        Ok(detail) => (StatusCode::OK, Json(detail)).into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Delete a snapshot
async fn delete_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.delete_snapshot(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Restore a snapshot
async fn restore_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.restore_snapshot(&name).await {
        Ok(restore) => (StatusCode::CREATED, Json(CreatedResponse { name: restore })).into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Raw gzip log bundle of a snapshot
async fn download_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let (cancel, _guard) = state.deadline();
    match state.orchestrator.download_snapshot_logs(&name, &cancel).await {
        Ok(bundle) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/gzip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}-logs.gz\"", name),
                ),
            ],
            bundle,
        )
            .into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Create or replace an application's snapshot schedule
async fn save_schedule(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Json(schedule): Json<SnapshotSchedule>,
) -> impl IntoResponse {
    match state.orchestrator.save_snapshot_schedule(&app_id, &schedule).await {
        Ok(name) => (StatusCode::OK, Json(CreatedResponse { name })).into_response(),
        Err(e) => error_response(e, None),
    }
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.get_snapshot_schedule(&app_id).await {
        Ok(Some(schedule)) => (StatusCode::OK, Json(schedule)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "not_found".into(),
                message: format!("No snapshot schedule for application {}", app_id),
                details: None,
            }),
        )
            .into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Stop automatic snapshots; succeeds when nothing was scheduled
async fn delete_schedule(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.delete_snapshot_schedule(&app_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Cordon and drain a node
async fn drain_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.drain_node(&name).await {
        Ok(outcome) => drain_response(&name, outcome),
        Err(e) => error_response(e, None),
    }
}

fn drain_response(node: &str, outcome: DrainOutcome) -> Response {
    match outcome.operator_error(node) {
        None => (StatusCode::OK, Json(outcome)).into_response(),
        Some(e) => error_response(e, serde_json::to_value(outcome).ok()),
    }
}

/// Delete a node and its leftovers
async fn purge_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.purge_node(&name).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::{Adapters, Metrics, OrchestratorConfig};
    use crate::domain::{AppInfo, Verb};
    use crate::testing::{FakeCluster, FixedApps, NoWaitSleeper, PassThrough, StaticFetcher};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn router(cluster: &Arc<FakeCluster>) -> Router {
        let adapters = Adapters {
            cluster: cluster.clone(),
            fetcher: StaticFetcher::new(),
            sleeper: NoWaitSleeper::new(),
            apps: Arc::new(FixedApps(vec![AppInfo {
                id: "app-1".into(),
                slug: "acme".into(),
                sequence: 0,
                backup_spec: String::new(),
            }])),
            templates: Arc::new(PassThrough),
        };
        let orchestrator =
            Orchestrator::new(OrchestratorConfig::default(), adapters, Metrics::new().unwrap());
        RestRouter::new(orchestrator).build()
    }

    async fn call(router: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    async fn call_json(
        router: Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[test]
    fn test_parse_trigger() {
        assert_eq!(parse_trigger(None), Some(SnapshotTrigger::Manual));
        assert_eq!(parse_trigger(Some("schedule")), Some(SnapshotTrigger::Schedule));
        assert_eq!(parse_trigger(Some("pre-upgrade")), Some(SnapshotTrigger::PreUpgrade));
        assert_eq!(parse_trigger(Some("hourly")), None);
    }

    #[tokio::test]
    async fn test_missing_controller_is_503() {
        let cluster = FakeCluster::new();
        let (status, body) = call(router(&cluster), "GET", "/v1/snapshots").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "controller_not_installed");
    }

    #[tokio::test]
    async fn test_access_denied_is_403() {
        let cluster = FakeCluster::new();
        cluster.respond_json(
            Verb::Get,
            "/apis/velero.io/v1/namespaces/velero/backups",
            403,
            json!({}),
        );
        let (status, body) = call(router(&cluster), "GET", "/v1/snapshots?app=acme").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "access_denied");
    }

    #[tokio::test]
    async fn test_unknown_app_is_404() {
        let cluster = FakeCluster::new();
        let (status, body) = call(router(&cluster), "POST", "/v1/apps/nope/snapshots").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_bad_ttl_is_400() {
        let cluster = FakeCluster::new();
        let (status, body) = call_json(
            router(&cluster),
            "POST",
            "/v1/apps/app-1/snapshots",
            json!({"trigger": "schedule", "ttl": "3d"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_ttl");
        assert!(cluster.requests().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_with_seconds_is_400() {
        let cluster = FakeCluster::new();
        let (status, body) = call_json(
            router(&cluster),
            "PUT",
            "/v1/apps/app-1/snapshot-schedule",
            json!({"schedule": "0 0 2 * * *", "retention": {"quantity": 2, "unit": "weeks"}}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_schedule");
    }

    #[tokio::test]
    async fn test_schedule_lifecycle() {
        let cluster = FakeCluster::new();
        let (status, _) = call(router(&cluster), "GET", "/v1/apps/app-1/snapshot-schedule").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            call(router(&cluster), "DELETE", "/v1/apps/app-1/snapshot-schedule").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_drain_missing_node_is_404() {
        let cluster = FakeCluster::new();
        let (status, _) = call(router(&cluster), "POST", "/v1/nodes/node-9/drain").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_blocked_drain_reports_outcome() {
        let outcome = DrainOutcome {
            wait_and_retry: true,
            misconfigured_policy_disruption_budget: false,
        };
        let response = drain_response("node-1", outcome);
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = drain_response("node-1", DrainOutcome::default());
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health() {
        let cluster = FakeCluster::new();
        let (status, _) = call(router(&cluster), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
