//! HTTP facade for the workflow engine
//!
//! Remote workers drive the claim/complete protocol over this API; local
//! callers start and manage runs. All endpoints require the configured
//! bearer token.

pub mod api;
pub mod auth;
pub mod config;

use axum::Router;
use runloom_engine::Engine;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub api_token: String,
}

/// Build the application router
pub fn app(state: AppState) -> Router {
    api::router(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use runloom_engine::{
        EngineConfig, Envelope, InMemoryWorkflowStore, NodeRegistry, NoopNode, Run, RunStatus,
        WorkflowStore,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TOKEN: &str = "test-token";

    fn test_app() -> (Router, Engine) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let registry = Arc::new(NodeRegistry::new());
        registry.register(Arc::new(NoopNode));
        let engine = Engine::new(store, registry, EngineConfig::default());
        let app = app(AppState {
            engine: engine.clone(),
            api_token: TOKEN.to_string(),
        });
        (app, engine)
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json");
        match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_requests_without_token_are_rejected() {
        let (app, _engine) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/workers")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let (app, _engine) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/workers")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let (app, _engine) = test_app();

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/workers",
                Some(json!({"id": "api-w1", "hostname": "host-a", "capabilities": ["*"]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let worker = body_json(response).await;
        assert_eq!(worker["id"], "api-w1");
        assert_eq!(worker["status"], "idle");

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/workers/api-w1/heartbeat",
                Some(json!({"current_step_count": 2})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker_is_404() {
        let (app, _engine) = test_app();

        let response = app
            .oneshot(request(
                "POST",
                "/api/v1/workers/ghost/heartbeat",
                Some(json!({})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_run_and_duplicate_conflict() {
        let (app, engine) = test_app();
        let run_id = Uuid::now_v7();
        let body = json!({
            "run_id": run_id,
            "workflow_id": Uuid::now_v7(),
            "input": {"test": "basic"},
        });

        let response = app
            .clone()
            .oneshot(request("POST", "/api/v1/runs", Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let run = body_json(response).await;
        assert_eq!(run["status"], "pending");
        assert_eq!(run["input"]["test"], "basic");

        assert_eq!(
            engine.run(run_id).await.unwrap().status,
            RunStatus::Pending
        );

        let response = app
            .oneshot(request("POST", "/api/v1/runs", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_run_lifecycle_endpoints() {
        let (app, engine) = test_app();
        let run_id = engine
            .start_run(Run::new(Uuid::now_v7(), Envelope::new()))
            .await
            .unwrap();
        engine
            .store()
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("POST", &format!("/api/v1/runs/{run_id}/pause"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "paused");

        let response = app
            .clone()
            .oneshot(request("POST", &format!("/api/v1/runs/{run_id}/resume"), None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "running");

        let response = app
            .clone()
            .oneshot(request("POST", &format!("/api/v1/runs/{run_id}/cancel"), None))
            .await
            .unwrap();
        let run = body_json(response).await;
        assert_eq!(run["status"], "cancelled");
        assert!(!run["completed_at"].is_null());

        // Terminal: pausing again conflicts
        let response = app
            .oneshot(request("POST", &format!("/api/v1/runs/{run_id}/pause"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_claim_and_complete_over_http() {
        let (app, engine) = test_app();

        // A registered worker and a run with one queued item
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/workers",
                Some(json!({"id": "api-w1"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let run_id = engine
            .start_run(Run::new(Uuid::now_v7(), Envelope::new()))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/workers/api-w1/claim",
                Some(json!({"max_items": 5})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let claim = body_json(response).await;
        let items = claim["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["queue_type"], "start_run");
        let item_id = items[0]["id"].as_str().unwrap().to_string();

        // Completing under another worker id is a stale claim
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/workers/api-w2/complete",
                Some(json!({"item_id": item_id, "result": {"success": true}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/workers/api-w1/complete",
                Some(json!({"item_id": item_id, "result": {"success": true}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await["run_id"],
            json!(run_id.to_string())
        );
    }

    #[tokio::test]
    async fn test_claim_requires_registered_worker() {
        let (app, _engine) = test_app();

        let response = app
            .oneshot(request(
                "POST",
                "/api/v1/workers/ghost/claim",
                Some(json!({})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_run_detail() {
        let (app, engine) = test_app();
        let run_id = engine
            .start_run(Run::new(
                Uuid::now_v7(),
                Envelope::from_value(json!({"a": 1})),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/api/v1/runs/{run_id}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail = body_json(response).await;
        assert_eq!(detail["id"], json!(run_id.to_string()));
        assert_eq!(detail["steps"], json!([]));

        let response = app
            .oneshot(request(
                "GET",
                &format!("/api/v1/runs/{}", Uuid::now_v7()),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unregister_marks_offline() {
        let (app, engine) = test_app();
        app.clone()
            .oneshot(request(
                "POST",
                "/api/v1/workers",
                Some(json!({"id": "api-w1"})),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(request("DELETE", "/api/v1/workers/api-w1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            engine.worker("api-w1").await.unwrap().status,
            runloom_engine::WorkerStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_cancel_removes_queued_items() {
        let (app, engine) = test_app();
        let run_id = engine
            .start_run(Run::new(Uuid::now_v7(), Envelope::new()))
            .await
            .unwrap();

        app.clone()
            .oneshot(request("POST", &format!("/api/v1/runs/{run_id}/cancel"), None))
            .await
            .unwrap();

        // The start_run item is gone with the cancellation
        app.clone()
            .oneshot(request(
                "POST",
                "/api/v1/workers",
                Some(json!({"id": "api-w1"})),
            ))
            .await
            .unwrap();
        let response = app
            .oneshot(request(
                "POST",
                "/api/v1/workers/api-w1/claim",
                Some(json!({"max_items": 10})),
            ))
            .await
            .unwrap();
        let claim = body_json(response).await;
        assert_eq!(claim["items"], json!([]));
    }
}
