//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. PostgreSQL and Redis running
//! 2. API server running (migrations applied at its startup)
//! 3. Worker process running, with Chromium available and either
//!    OPENAI_API_KEY or OPENAI_MOCK=true
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override the default (http://localhost:8080).
//! Set ROBOTS_DENY_URL to a page whose robots.txt disallows everything to
//! run the policy test.

mod helpers;

use helpers::*;

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_health_check() {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/healthz", base_url()))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["services"]["postgres"]["status"], "ok");
    assert_eq!(body["services"]["redis"]["status"], "ok");
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_example_com_is_described() {
    let base_url = base_url();
    let client = reqwest::Client::new();

    let id = submit_accepted(&client, &base_url, "https://example.com")
        .await
        .expect("Submit failed");
    let view = wait_for_terminal(&client, &base_url, id, 180)
        .await
        .expect("Job did not finish");

    assert_eq!(view["status"], "done", "unexpected view: {view}");
    let result = &view["result"];
    assert!(!result["description"].as_str().unwrap().is_empty());
    assert!(result["image"]
        .as_str()
        .unwrap()
        .starts_with("data:image/jpeg;base64,"));
    assert!(result["image"].as_str().unwrap().len() > "data:image/jpeg;base64,".len());
    assert!(result["tookMs"].as_i64().unwrap() >= 0);
    assert_eq!(result["meta"]["viewport"]["width"], 1920);
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_invalid_url_rejected() {
    let response = submit_url(&reqwest::Client::new(), &base_url(), "not-a-url")
        .await
        .expect("Request failed");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_url");
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_duplicate_submission_shares_job() {
    let base_url = base_url();
    let client = reqwest::Client::new();
    // Unique path so no earlier job interferes.
    let url = format!("https://example.com/?run={}", uuid::Uuid::new_v4());

    let first = submit_accepted(&client, &base_url, &format!("{url}#top"))
        .await
        .unwrap();
    let second = submit_accepted(&client, &base_url, &url).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and ROBOTS_DENY_URL
async fn test_e2e_robots_denial() {
    let Ok(url) = std::env::var("ROBOTS_DENY_URL") else {
        println!("ROBOTS_DENY_URL not set, skipping");
        return;
    };
    let base_url = base_url();
    let client = reqwest::Client::new();

    let id = submit_accepted(&client, &base_url, &url).await.unwrap();
    let view = wait_for_terminal(&client, &base_url, id, 60).await.unwrap();

    assert_eq!(
        view,
        serde_json::json!({ "status": "error", "message": "robots_disallowed" })
    );
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_unknown_job_not_found() {
    let response = reqwest::Client::new()
        .get(format!("{}/crawl/{}", base_url(), uuid::Uuid::now_v7()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
