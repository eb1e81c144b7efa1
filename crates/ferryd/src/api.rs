//! JSON job API over HTTP
//!
//! Endpoints:
//!   GET  /v1/locations: configured locations with availability
//!   GET  /v1/jobs: retained jobs, newest first
//!   POST /v1/jobs: submit `{ "tasks": [TaskSpec], "policy": "skip" }`
//!   GET  /v1/jobs/{id}: job snapshot
//!   GET  /v1/jobs/{id}/events: progress as server-sent events, ends at a terminal status
//!   POST /v1/jobs/{id}/cancel: `{ "cancelled": bool }`
//!   POST /v1/jobs/{id}/cleanup: remove partial destinations of a finished job
//!   POST /v1/conflicts: `{ "dir": TransferRef, "names": [..] }` -> names already present
//!
//! Errors are `{ "error": message, "kind": FerryError::kind() }`.

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use ferry_core::types::{ConflictPolicy, StorageLocation, TransferRef};
use ferry_core::FerryError;
use ferry_transfer::{ProgressEvent, SubmitReceipt, TaskSpec, TransferEngine, TransferJob};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub policy: ConflictPolicy,
}

#[derive(Debug, Deserialize)]
pub struct ConflictsRequest {
    pub dir: TransferRef,
    pub names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictsResponse {
    pub conflicts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed: Vec<TransferRef>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

/// [`FerryError`] rendered as an HTTP response
pub struct ApiError(FerryError);

impl From<FerryError> for ApiError {
    fn from(e: FerryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(kind = self.0.kind(), "api: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn status_for(err: &FerryError) -> StatusCode {
    match err {
        FerryError::Security(_) | FerryError::Permission(_) => StatusCode::FORBIDDEN,
        FerryError::NotFound(_) => StatusCode::NOT_FOUND,
        FerryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        FerryError::InvalidState(_) | FerryError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(engine: TransferEngine) -> Router {
    Router::new()
        .route("/v1/locations", get(locations_handler))
        .route("/v1/jobs", get(list_jobs_handler).post(submit_handler))
        .route("/v1/jobs/{id}", get(get_job_handler))
        .route("/v1/jobs/{id}/events", get(events_handler))
        .route("/v1/jobs/{id}/cancel", post(cancel_handler))
        .route("/v1/jobs/{id}/cleanup", post(cleanup_handler))
        .route("/v1/conflicts", post(conflicts_handler))
        .with_state(engine)
}

/// Serve the job API on `addr` (e.g. "127.0.0.1:7878")
pub async fn serve(addr: String, engine: TransferEngine) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("api bind {addr}: {e}"))?;

    info!(addr = %addr, "api: listening on /v1");

    axum::serve(listener, router(engine))
        .await
        .map_err(|e| anyhow::anyhow!("api server: {e}"))
}

async fn locations_handler(State(engine): State<TransferEngine>) -> Json<Vec<StorageLocation>> {
    Json(engine.locations().await)
}

async fn list_jobs_handler(State(engine): State<TransferEngine>) -> Json<Vec<TransferJob>> {
    Json(engine.list_jobs())
}

async fn submit_handler(
    State(engine): State<TransferEngine>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitReceipt>)> {
    let receipt = engine.submit(req.tasks, req.policy)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_job_handler(
    State(engine): State<TransferEngine>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransferJob>> {
    Ok(Json(engine.get(&id)?))
}

async fn events_handler(
    State(engine): State<TransferEngine>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let events = engine.subscribe(&id)?.into_stream().map(|event| {
        let name = match &event {
            ProgressEvent::Snapshot(_) => "snapshot",
            ProgressEvent::Task(_) => "task",
        };
        Event::default().event(name).json_data(&event)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn cancel_handler(
    State(engine): State<TransferEngine>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = engine.cancel(&id)?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn cleanup_handler(
    State(engine): State<TransferEngine>,
    Path(id): Path<String>,
) -> ApiResult<Json<CleanupResponse>> {
    let removed = engine.cleanup_partial(&id).await?;
    Ok(Json(CleanupResponse { removed }))
}

async fn conflicts_handler(
    State(engine): State<TransferEngine>,
    Json(req): Json<ConflictsRequest>,
) -> ApiResult<Json<ConflictsResponse>> {
    let conflicts = engine.check_conflicts(&req.dir, &req.names).await?;
    Ok(Json(ConflictsResponse { conflicts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use ferry_core::config::FerryConfig;
    use ferry_storage::{LocalFileOps, OpendalObjectStore, PathValidator};
    use ferry_transfer::{JobStatus, TransferExecutor};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn engine(root: &std::path::Path) -> TransferEngine {
        let config = FerryConfig::default();
        let executor = TransferExecutor::new(
            Arc::new(OpendalObjectStore::new(config.transfer.chunk_size)),
            LocalFileOps::new(Arc::new(PathValidator::new(&[root]))),
            config.transfer.chunk_size,
            config.transfer.max_file_size_bytes(),
        );
        TransferEngine::new(executor, &config.transfer).unwrap()
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn wait_terminal(engine: &TransferEngine, job_id: &str) {
        let mut sub = engine.subscribe(job_id).unwrap();
        while sub.next().await.is_some() {}
    }

    #[tokio::test]
    async fn submitted_job_runs_and_is_queryable() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), b"hello").unwrap();
        let engine = engine(dir.path());
        let app = router(engine.clone());

        let (status, body) = call(
            &app,
            "POST",
            "/v1/jobs",
            Some(serde_json::json!({
                "tasks": [{
                    "source": { "location_id": "local-0", "kind": "local", "path": "src/a.txt" },
                    "dest": { "location_id": "local-0", "kind": "local", "path": "out/a.txt" }
                }],
                "policy": "overwrite"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
        let receipt: SubmitReceipt = serde_json::from_slice(&body).unwrap();
        wait_terminal(&engine, &receipt.job_id).await;

        let (status, body) = call(&app, "GET", &format!("/v1/jobs/{}", receipt.job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let job: TransferJob = serde_json::from_slice(&body).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(std::fs::read(dir.path().join("out/a.txt")).unwrap(), b"hello");

        let (_, body) = call(&app, "GET", "/v1/jobs", None).await;
        let jobs: Vec<TransferJob> = serde_json::from_slice(&body).unwrap();
        assert_eq!(jobs.len(), 1);

        // A finished job's event stream is its final snapshot, then closes
        let (status, body) =
            call(&app, "GET", &format!("/v1/jobs/{}/events", receipt.job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("event: snapshot"), "{text}");
        assert!(text.contains("\"status\":\"completed\""), "{text}");

        let (status, body) =
            call(&app, "POST", &format!("/v1/jobs/{}/cancel", receipt.job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let cancel: CancelResponse = serde_json::from_slice(&body).unwrap();
        assert!(!cancel.cancelled);

        let (status, body) =
            call(&app, "POST", &format!("/v1/jobs/{}/cleanup", receipt.job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let cleanup: CleanupResponse = serde_json::from_slice(&body).unwrap();
        assert!(cleanup.removed.is_empty());
    }

    #[tokio::test]
    async fn errors_map_to_status_and_kind() {
        let dir = TempDir::new().unwrap();
        let app = router(engine(dir.path()));

        let (status, body) = call(&app, "GET", "/v1/jobs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.kind, "not_found");

        let (status, body) = call(
            &app,
            "POST",
            "/v1/jobs",
            Some(serde_json::json!({ "tasks": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.kind, "invalid_request");

        let (status, body) = call(
            &app,
            "POST",
            "/v1/conflicts",
            Some(serde_json::json!({
                "dir": { "location_id": "local-0", "kind": "local", "path": "../.." },
                "names": ["a.txt"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.kind, "security");
    }

    #[tokio::test]
    async fn conflicts_and_locations() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(dir.path().join("out/a.txt"), b"x").unwrap();
        let app = router(engine(dir.path()));

        let (status, body) = call(
            &app,
            "POST",
            "/v1/conflicts",
            Some(serde_json::json!({
                "dir": { "location_id": "local-0", "kind": "local", "path": "out" },
                "names": ["a.txt", "b.txt"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resp: ConflictsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.conflicts, vec!["a.txt".to_string()]);

        let (status, body) = call(&app, "GET", "/v1/locations", None).await;
        assert_eq!(status, StatusCode::OK);
        let locations: Vec<StorageLocation> = serde_json::from_slice(&body).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].id, "local-0");
        assert!(locations[0].available);
    }
}
