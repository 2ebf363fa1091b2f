use crate::metrics::Metrics;
use crate::model::{SnapshotId, SnapshotRecord};
use crate::state::State as DaemonState;
use crate::store::{Store, StoreError};
use crate::wire::{self, Created, WireError, WireSnapshot};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const DEFAULT_TIMESTAMP_COUNT: u32 = 10;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<DaemonState>>,
    pub store: Option<Store>,
}

#[derive(Debug, Deserialize)]
pub struct TimestampsQuery {
    pub count: Option<u32>,
}

enum ApiError {
    NoStore,
    BadSnapshot(WireError),
    Store(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NoStore => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no database configured on this node",
            )
                .into_response(),
            ApiError::BadSnapshot(err) => {
                (StatusCode::BAD_REQUEST, err.to_string()).into_response()
            }
            ApiError::Store(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: Arc<RwLock<DaemonState>>,
    store: Option<Store>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/status", get(status_handler))
        .route("/api/timestamps", get(timestamps_handler))
        .route("/api/snapshots", post(upload_handler))
        .route(
            "/api/snapshots/:id",
            get(snapshot_handler).delete(delete_handler),
        )
        .with_state(HttpAppState {
            metrics,
            state,
            store,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    {
        let guard = state.state.read().await;
        state.metrics.update_from_state(&guard);
    }
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn status_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(guard.clone())
}

fn store_of(state: &HttpAppState) -> Result<&Store, ApiError> {
    state.store.as_ref().ok_or(ApiError::NoStore)
}

fn store_failed(metrics: &Metrics, operation: &str, err: StoreError) -> ApiError {
    error!(operation, error = %err, "database operation failed");
    metrics.inc_store_error(operation);
    ApiError::Store(err)
}

async fn upload_handler(
    State(state): State<HttpAppState>,
    body: String,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    let store = store_of(&state)?;
    let snapshot = wire::from_json(&body).map_err(|err| {
        warn!(error = %err, "rejected uploaded snapshot");
        ApiError::BadSnapshot(err)
    })?;

    let id = store
        .store(&snapshot)
        .await
        .map_err(|err| store_failed(&state.metrics, "store", err))?;
    state.metrics.inc_snapshot_stored();
    info!(
        id,
        devices = snapshot.devices.len(),
        timestamp = %snapshot.timestamp,
        "stored uploaded snapshot"
    );
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn timestamps_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<TimestampsQuery>,
) -> Result<Json<Vec<SnapshotRecord>>, ApiError> {
    let store = store_of(&state)?;
    let count = query.count.unwrap_or(DEFAULT_TIMESTAMP_COUNT);
    let records = store
        .get_n_timestamps(count)
        .await
        .map_err(|err| store_failed(&state.metrics, "get_n_timestamps", err))?;
    Ok(Json(records))
}

async fn snapshot_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<SnapshotId>,
) -> Result<Json<WireSnapshot>, ApiError> {
    let store = store_of(&state)?;
    let snapshot = store
        .get_snapshot(id)
        .await
        .map_err(|err| store_failed(&state.metrics, "get_snapshot", err))?;
    Ok(Json(wire::encode(&snapshot)))
}

async fn delete_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<SnapshotId>,
) -> Result<StatusCode, ApiError> {
    let store = store_of(&state)?;
    store
        .delete_snapshot(id)
        .await
        .map_err(|err| store_failed(&state.metrics, "delete_snapshot", err))?;
    info!(id, "deleted snapshot");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, Snapshot};
    use axum::body::to_bytes;
    use axum::http::{Method, Request};
    use chrono::DateTime;
    use tower::ServiceExt;

    fn app(store: Option<Store>) -> (Router, Arc<Metrics>) {
        let metrics = Metrics::new().expect("metrics registry");
        let state = Arc::new(RwLock::new(DaemonState::new(0)));
        (build_router(metrics.clone(), state, store), metrics)
    }

    async fn call(app: Router, method: Method, uri: &str, body: Body) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn sample_json(secs: i64) -> String {
        let mut snapshot = Snapshot::new(DateTime::from_timestamp(secs, 0).unwrap());
        snapshot
            .devices
            .push(Device::unreachable("leaf1", "Nokia", "nokia_srlinux"));
        wire::to_json(&snapshot).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _) = app(None);
        let (status, body) = call(app, Method::GET, "/healthz", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let (app, _) = app(None);
        let (status, body) = call(app, Method::GET, "/metrics", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("netsnap_uptime_seconds"));
        assert!(body.contains("netsnap_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn status_returns_json() {
        let (app, _) = app(None);
        let (status, body) = call(app, Method::GET, "/api/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"started_at_unix\""));
        assert!(body.contains("\"last_collection\":null"));
    }

    #[tokio::test]
    async fn snapshot_endpoints_need_a_database() {
        let (app, _) = app(None);
        let (status, _) = call(app.clone(), Method::GET, "/api/timestamps", Body::empty()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = call(app, Method::POST, "/api/snapshots", Body::from(sample_json(1))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn uploaded_snapshot_can_be_listed_read_and_deleted() {
        let store = Store::open_in_memory().await.unwrap();
        let (app, metrics) = app(Some(store));

        let (status, body) = call(
            app.clone(),
            Method::POST,
            "/api/snapshots",
            Body::from(sample_json(1_700_000_000)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let created: Created = serde_json::from_str(&body).unwrap();
        assert_eq!(metrics.netsnap_snapshots_stored_total.get(), 1.0);

        let (status, body) = call(app.clone(), Method::GET, "/api/timestamps?count=5", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let listed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listed[0]["id"], created.id);
        assert_eq!(listed[0]["timestamp"], "2023-11-14T22:13:20Z");

        let uri = format!("/api/snapshots/{}", created.id);
        let (status, body) = call(app.clone(), Method::GET, &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let wire: WireSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(wire.id, Some(created.id));
        assert_eq!(wire.devices[0].hostname, "leaf1");
        assert!(!wire.devices[0].snapshot_successful);

        let (status, _) = call(app.clone(), Method::DELETE, &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(app, Method::GET, &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let wire: WireSnapshot = serde_json::from_str(&body).unwrap();
        assert!(wire.id.is_none());
        assert!(wire.devices.is_empty());
    }

    #[tokio::test]
    async fn nameless_interface_is_not_stored() {
        let store = Store::open_in_memory().await.unwrap();
        let (app, _) = app(Some(store));

        let body = r#"{"timestamp": "2024-05-01T10:00:00Z",
            "devices": [{"hostname": "leaf1", "snapshot_successful": true,
                         "interfaces": [{"name": "", "mtu": 1500},
                                        {"name": "mgmt0", "mtu": 1514}]}]}"#;
        let (status, body) = call(app.clone(), Method::POST, "/api/snapshots", Body::from(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: Created = serde_json::from_str(&body).unwrap();

        let uri = format!("/api/snapshots/{}", created.id);
        let (_, body) = call(app, Method::GET, &uri, Body::empty()).await;
        let wire: WireSnapshot = serde_json::from_str(&body).unwrap();
        let names: Vec<_> = wire.devices[0].interfaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["mgmt0"]);
    }

    #[tokio::test]
    async fn malformed_upload_is_a_bad_request() {
        let store = Store::open_in_memory().await.unwrap();
        let (app, _) = app(Some(store));

        let (status, _) = call(app.clone(), Method::POST, "/api/snapshots", Body::from("{")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let bad_ip = sample_json(1).replace("\"management_ip\": \"\"", "\"management_ip\": \"10.0.0.1/99\"");
        let (status, body) = call(app, Method::POST, "/api/snapshots", Body::from(bad_ip)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("10.0.0.1/99"));
    }

    #[tokio::test]
    async fn duplicate_timestamp_is_a_server_error() {
        let store = Store::open_in_memory().await.unwrap();
        let (app, metrics) = app(Some(store));

        let (status, _) = call(app.clone(), Method::POST, "/api/snapshots", Body::from(sample_json(5))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(app, Method::POST, "/api/snapshots", Body::from(sample_json(5))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            metrics
                .netsnap_store_errors_total
                .with_label_values(&["store"])
                .get(),
            1.0
        );
    }
}
