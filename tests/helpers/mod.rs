//! Shared helpers for tests that talk to a running deployment.

use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Response from POST /crawl
#[derive(Debug, Deserialize)]
pub struct CrawlAccepted {
    pub id: Uuid,
}

/// Base URL of the API server, `API_BASE_URL` or localhost.
pub fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

/// Submit a URL, returning the raw response.
pub async fn submit_url(
    client: &reqwest::Client,
    base_url: &str,
    url: &str,
) -> Result<reqwest::Response, reqwest::Error> {
    client
        .post(format!("{}/crawl", base_url))
        .json(&serde_json::json!({ "url": url }))
        .send()
        .await
}

/// Submit a URL that must be accepted.
pub async fn submit_accepted(
    client: &reqwest::Client,
    base_url: &str,
    url: &str,
) -> Result<Uuid, Box<dyn std::error::Error>> {
    let response = submit_url(client, base_url, url).await?;
    let status = response.status();
    if status != reqwest::StatusCode::ACCEPTED {
        let error_text = response.text().await?;
        return Err(format!("Submit failed with status {}: {}", status, error_text).into());
    }
    Ok(response.json::<CrawlAccepted>().await?.id)
}

/// Poll a job until it leaves `pending` (with timeout).
pub async fn wait_for_terminal(
    client: &reqwest::Client,
    base_url: &str,
    id: Uuid,
    timeout_secs: u64,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let view: serde_json::Value = client
            .get(format!("{}/crawl/{}", base_url, id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match view["status"].as_str() {
            Some("done") | Some("error") => return Ok(view),
            Some("pending") => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
                }
                sleep(Duration::from_millis(500)).await;
            }
            other => return Err(format!("Unknown job status: {:?}", other).into()),
        }
    }

    Err(format!("Job did not finish within {} seconds", timeout_secs).into())
}
