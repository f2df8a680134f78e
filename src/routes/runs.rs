use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, warn};

use crate::models::{AppState, CancelRunResponse, CreateRunRequest, CreateRunResponse, ErrorResponse};
use crate::run::{RunId, RunSnapshot};
use crate::types::AppError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/runs", post(create_run))
        .route("/api/runs/{run_id}", get(get_run))
        .route("/api/runs/{run_id}/cancel", post(cancel_run))
        .with_state(state)
}

pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::InvalidIntent(_) => StatusCode::BAD_REQUEST,
            AppError::RunNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<(StatusCode, ResponseJson<CreateRunResponse>), ApiError> {
    info!(route = %request.intent.route, "Received run request");

    let run_id = state.engine.create_run(request.intent).await?;
    state.queue.enqueue(run_id).await?;
    let status = state.engine.get_state(run_id).await?.status;

    Ok((StatusCode::ACCEPTED, Json(CreateRunResponse { run_id, status })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
) -> Result<ResponseJson<RunSnapshot>, ApiError> {
    Ok(Json(state.engine.get_state(run_id).await?))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
) -> Result<ResponseJson<CancelRunResponse>, ApiError> {
    let status = state.engine.cancel(run_id).await?;
    Ok(Json(CancelRunResponse { run_id, status }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::queue::WorkerPool;
    use crate::run::RunStatus;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> (AppState, WorkerPool) {
        let engine = Arc::new(Engine::builder(Config::default()).build());
        let (queue, pool) = WorkerPool::start(engine.clone(), 1, 4);
        (AppState { engine, queue }, pool)
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_poll_run() {
        let (state, pool) = state();
        let body = serde_json::json!({
            "intent": { "route": "market-back", "fields": { "indication": "IBD" } }
        });

        let (status, created) = call(router(state.clone()), post_json("/api/runs", body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = created["run_id"].as_str().unwrap().to_string();

        let mut last = serde_json::Value::Null;
        for _ in 0..200 {
            let request = Request::get(format!("/api/runs/{}", run_id)).body(Body::empty()).unwrap();
            let (status, snapshot) = call(router(state.clone()), request).await;
            assert_eq!(status, StatusCode::OK);
            last = snapshot;
            if last["status"] == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last["status"], "completed");
        assert_eq!(last["route"], "market-back");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_intent_is_bad_request() {
        let (state, pool) = state();
        let body = serde_json::json!({ "intent": { "route": "debate", "fields": { "drug_name": "Metformin" } } });

        let (status, error) = call(router(state), post_json("/api/runs", body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error["error"].as_str().unwrap().contains("Invalid intent"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (state, pool) = state();
        let request = Request::get(format!("/api/runs/{}", RunId::new())).body(Body::empty()).unwrap();

        let (status, _) = call(router(state), request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unstarted_run() {
        let (state, pool) = state();
        let intent = crate::intent::Intent::new(crate::intent::Route::MarketBack).with_field("indication", "IBD");
        let run_id = state.engine.create_run(intent).await.unwrap();

        let request = Request::post(format!("/api/runs/{}/cancel", run_id)).body(Body::empty()).unwrap();
        let (status, body) = call(router(state.clone()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
        assert_eq!(state.engine.get_state(run_id).await.unwrap().status, RunStatus::Cancelled);
        pool.shutdown().await;
    }
}
