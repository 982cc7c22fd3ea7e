//! Drives the HTTP router end-to-end against a real (but fake) worker
//! process — a tiny shell script speaking the worker's NDJSON protocol —
//! instead of a real wasmtime instance, exercising the render pipeline the
//! way spec.md §8's end-to-end scenarios describe without requiring an
//! actual compiled Wasm module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use crawlserver::cache::RenderCache;
use crawlserver::context::AppContext;
use crawlserver::coordinator::RequestCoordinator;
use crawlserver::dispatch::DispatchQueue;
use crawlserver::http::{router, HttpState};
use crawlserver::pool::WorkerPool;
use crawlserver::state_reporter::StateReporter;
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Writes an executable shell script that always replies with the same
/// successful render, standing in for a worker that has a live Wasm
/// instance and just re-renders the requested route.
fn write_fake_worker(dir: &Path) -> PathBuf {
    let script_path = dir.join("fake-worker.sh");
    let script = r#"#!/bin/sh
while IFS= read -r line; do
  printf '%s\n' '{"type":"render","html":"<html><span id=\"x-1\">hi</span></html>","expires_in":60,"last_modified_at":1700000000}'
done
"#;
    std::fs::write(&script_path, script).expect("write fake worker script");
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&script_path, perms).unwrap();
    script_path
}

async fn build_app(worker_binary: PathBuf, wasm_path: PathBuf, pool_size: usize) -> axum::Router {
    let reporter = StateReporter::new();
    let pool = Arc::new(
        WorkerPool::spawn(worker_binary, pool_size, reporter.clone())
            .await
            .expect("spawn fake worker pool"),
    );
    let queue = DispatchQueue::new(pool.clone(), pool_size + 1_000);
    let cache = RenderCache::new();
    let coordinator = Arc::new(RequestCoordinator::new(
        pool, queue, cache, reporter, wasm_path, 8080, false,
    ));
    router(HttpState {
        coordinator,
        ctx: AppContext::new(),
    })
}

#[tokio::test]
async fn cold_render_then_cache_hit_then_etag_revalidation() {
    let dir = tempfile::tempdir().unwrap();
    let worker_binary = write_fake_worker(dir.path());
    let wasm_path = dir.path().join("app.wasm");
    std::fs::write(&wasm_path, b"not-really-wasm").unwrap();

    let app = build_app(worker_binary, wasm_path, 1).await;

    // Scenario 1: cold cache, successful render. ids are stripped from the
    // served body and the ETag is a hex digest over the stripped body.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/hello?x=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/html; charset=utf-8"
    );
    let etag = response
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(
        response.headers().get("last-modified").unwrap(),
        "Tue, 14 Nov 2023 22:13:20 GMT"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "<html><span>hi</span></html>".as_bytes());

    // Scenario 2: second request within TTL is served from cache with the
    // same ETag, no new render needed.
    let cached = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/hello?x=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cached.status(), StatusCode::OK);
    assert_eq!(cached.headers().get("etag").unwrap().to_str().unwrap(), etag);

    // Scenario 3: ETag revalidation short-circuits to 304 with no body.
    let not_modified = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/hello?x=1")
                .header("if-none-match", etag.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(not_modified.status(), StatusCode::NOT_MODIFIED);
    let body = not_modified.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn blocked_extension_never_reaches_the_render_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let worker_binary = write_fake_worker(dir.path());
    let wasm_path = dir.path().join("app.wasm");
    std::fs::write(&wasm_path, b"not-really-wasm").unwrap();

    let app = build_app(worker_binary, wasm_path, 1).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/bundle.js")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_wasm_file_responds_500() {
    let dir = tempfile::tempdir().unwrap();
    let worker_binary = write_fake_worker(dir.path());
    let missing_wasm = dir.path().join("does-not-exist.wasm");

    let app = build_app(worker_binary, missing_wasm, 0).await;

    let response = app
        .oneshot(Request::builder().uri("/home").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn health_reports_pool_occupancy() {
    let dir = tempfile::tempdir().unwrap();
    let worker_binary = write_fake_worker(dir.path());
    let wasm_path = dir.path().join("app.wasm");
    std::fs::write(&wasm_path, b"not-really-wasm").unwrap();

    let app = build_app(worker_binary, wasm_path, 2).await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["workers"]["total"], 2);
    assert_eq!(json["workers"]["busy"], 0);
}
