//! Gateway behavior: request/response schema, error mapping, lifecycle.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{MockBackend, MockResponse, Responder};
use http_body_util::BodyExt;
use pg_http_proxy::gateway::{self, AppState};
use pg_http_proxy::pool::Pool;
use pg_http_proxy::supervisor::Supervisor;
use serde_json::{Value, json};
use tower::ServiceExt;

const STALENESS: Duration = Duration::from_secs(300);

struct Setup {
    app: Router,
    backend: MockBackend,
    supervisor: Arc<Supervisor>,
    pool: Pool,
}

async fn setup_with(responder: Responder, auth_tokens: &[&str], start: bool) -> Setup {
    let backend = MockBackend::spawn(responder).await;
    let pool = Pool::new(backend.opts(), 1, STALENESS);
    let supervisor = Arc::new(Supervisor::new(pool.clone(), Duration::from_secs(5)));
    if start {
        supervisor.start(1).await.unwrap();
    }

    let state = AppState {
        pool: pool.clone(),
        lifecycle: supervisor.subscribe(),
        request_timeout: Duration::from_secs(2),
        auth_tokens: Arc::new(auth_tokens.iter().map(|s| s.to_string()).collect::<HashSet<_>>()),
    };
    Setup {
        app: gateway::router(state),
        backend,
        supervisor,
        pool,
    }
}

async fn setup(responder: Responder) -> Setup {
    setup_with(responder, &[], true).await
}

fn default_responder() -> Responder {
    Arc::new(|sql: &str| {
        if sql.contains("dup") {
            MockResponse::sql_error("23505", "duplicate key value violates unique constraint")
        } else if sql.contains("slow") {
            MockResponse::rows(&[("n", 23)], &[&[Some("1")]])
                .with_delay(Duration::from_millis(600))
        } else {
            MockResponse::rows(
                &[("v", 25), ("n", 23), ("z", 25)],
                &[&[Some("a"), Some("1"), None]],
            )
        }
    })
}

fn post_exec(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/exec")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn exec_round_trip_renders_columns_and_rows() {
    let setup = setup(default_responder()).await;

    let response = setup
        .app
        .oneshot(post_exec(json!({
            "sql": "SELECT $1::text AS v, $2::int AS n, $3::text AS z",
            "params": ["a", 1, null],
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body,
        json!({
            "columns": [
                {"name": "v", "type": "text"},
                {"name": "n", "type": "int4"},
                {"name": "z", "type": "text"},
            ],
            "rows": [["a", 1, null]],
            "rows_affected": 1,
        })
    );
}

#[tokio::test]
async fn constraint_violation_maps_to_422_and_connection_is_reused() {
    let setup = setup(default_responder()).await;

    let response = setup
        .app
        .clone()
        .oneshot(post_exec(json!({"sql": "INSERT dup", "params": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "backend_error");
    assert_eq!(body["error"]["sqlstate"], "23505");
    assert_eq!(
        body["error"]["message"],
        "duplicate key value violates unique constraint"
    );

    // The connection survived the clean error and serves the next query.
    let response = setup
        .app
        .oneshot(post_exec(json!({"sql": "SELECT 1", "params": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(setup.backend.stats.connections(), 1);
}

#[tokio::test]
async fn execute_deadline_maps_to_504_then_recovers() {
    let setup = setup(default_responder()).await;

    let response = setup
        .app
        .clone()
        .oneshot(post_exec(json!({
            "sql": "SELECT slow",
            "params": [],
            "timeout_ms": 100,
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "timeout");

    // The timed-out connection was discarded; a fresh one serves.
    let response = setup
        .app
        .oneshot(post_exec(json!({"sql": "SELECT 1", "params": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(setup.backend.stats.connections() >= 2);
}

#[tokio::test]
async fn empty_sql_is_rejected_without_touching_the_pool() {
    let setup = setup(default_responder()).await;

    let response = setup
        .app
        .oneshot(post_exec(json!({"sql": "   ", "params": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "invalid_request");
}

#[tokio::test]
async fn bearer_auth_guards_the_endpoint() {
    let setup = setup_with(default_responder(), &["sekrit"], true).await;

    // Missing header
    let response = setup
        .app
        .clone()
        .oneshot(post_exec(json!({"sql": "SELECT 1", "params": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong token
    let mut request = post_exec(json!({"sql": "SELECT 1", "params": []}));
    request
        .headers_mut()
        .insert("authorization", "Bearer wrong".parse().unwrap());
    let response = setup.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Valid token
    let mut request = post_exec(json!({"sql": "SELECT 1", "params": []}));
    request
        .headers_mut()
        .insert("authorization", "Bearer sekrit".parse().unwrap());
    let response = setup.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn requests_fail_fast_outside_ready() {
    // Supervisor never started: still in Starting.
    let setup = setup_with(default_responder(), &[], false).await;

    let response = setup
        .app
        .clone()
        .oneshot(post_exec(json!({"sql": "SELECT 1", "params": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "unavailable");

    let response = setup
        .app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    // The pool was never touched.
    assert_eq!(setup.backend.stats.connections(), 0);
}

#[tokio::test]
async fn health_and_ready_probes() {
    let setup = setup(default_responder()).await;

    let response = setup
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = setup
        .app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn draining_refuses_new_requests_and_completes_in_flight() {
    let setup = setup(default_responder()).await;

    // Start a request that takes a while.
    let in_flight = {
        let app = setup.app.clone();
        tokio::spawn(async move {
            app.oneshot(post_exec(json!({"sql": "SELECT slow", "params": []})))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Drain: the in-flight request completes, new ones are refused.
    let shutdown = {
        let supervisor = Arc::clone(&setup.supervisor);
        tokio::spawn(async move { supervisor.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = setup
        .app
        .oneshot(post_exec(json!({"sql": "SELECT 1", "params": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = in_flight.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    shutdown.await.unwrap();
    assert_eq!(
        setup.supervisor.state(),
        pg_http_proxy::supervisor::Lifecycle::Stopped
    );
    assert_eq!(setup.pool.in_flight(), 0);
}
