//! GitHub Checks REST client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};

use crate::api::{CheckRunApi, CreateCheckRun, UpdateCheckRun};

const USER_AGENT: &str = concat!("runnergrid/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    id: u64,
}

/// Client for `POST/PATCH /repos/{owner}/{repo}/check-runs`.
pub struct GitHubChecksClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubChecksClient {
    pub fn new(api_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl CheckRunApi for GitHubChecksClient {
    async fn create_check_run(&self, repository: &str, request: &CreateCheckRun) -> Result<u64> {
        let url = format!("{}/repos/{repository}/check-runs", self.api_url);
        debug!(%url, head_sha = %request.head_sha, "creating check run");

        let response = self
            .request(reqwest::Method::POST, &url)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, %repository, "failed to create check run");
            anyhow::bail!("failed to create check run: {status} - {body}");
        }

        let created: CheckRunResponse = response.json().await?;
        debug!(%repository, check_run_id = created.id, "check run created");
        Ok(created.id)
    }

    async fn update_check_run(
        &self,
        repository: &str,
        check_run_id: u64,
        request: &UpdateCheckRun,
    ) -> Result<()> {
        let url = format!("{}/repos/{repository}/check-runs/{check_run_id}", self.api_url);
        debug!(%url, status = ?request.status, "updating check run");

        let response = self
            .request(reqwest::Method::PATCH, &url)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, %repository, check_run_id, "failed to update check run");
            anyhow::bail!("failed to update check run {check_run_id}: {status} - {body}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{patch, post};
    use axum::{Json, Router};
    use runnergrid_state::{CheckStatus, Conclusion};
    use serde_json::{Value, json};

    #[derive(Clone, Default)]
    struct Seen {
        requests: Arc<Mutex<Vec<(String, Value, Option<String>)>>>,
    }

    async fn create(
        State(seen): State<Seen>,
        Path((owner, repo)): Path<(String, String)>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.requests
            .lock()
            .unwrap()
            .push((format!("POST {owner}/{repo}"), body, auth));
        (StatusCode::CREATED, Json(json!({ "id": 4242 })))
    }

    async fn update(
        State(seen): State<Seen>,
        Path((owner, repo, id)): Path<(String, String, u64)>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        seen.requests
            .lock()
            .unwrap()
            .push((format!("PATCH {owner}/{repo}/{id}"), body, None));
        if id == 404 {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::OK
        }
    }

    async fn serve() -> (String, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route("/repos/{owner}/{repo}/check-runs", post(create))
            .route("/repos/{owner}/{repo}/check-runs/{id}", patch(update))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn create_body() -> CreateCheckRun {
        CreateCheckRun {
            name: "runnergrid / build".to_string(),
            head_sha: "abc123".to_string(),
            external_id: "job-1".to_string(),
            status: CheckStatus::InProgress,
            started_at: Some("2024-01-01T00:00:00Z".to_string()),
            completed_at: None,
            conclusion: None,
            output: None,
        }
    }

    #[tokio::test]
    async fn create_posts_and_returns_id() {
        let (url, seen) = serve().await;
        let client =
            GitHubChecksClient::new(&format!("{url}/"), Some("t0ken".to_string()), Duration::from_secs(5)).unwrap();

        let id = client.create_check_run("acme/api", &create_body()).await.unwrap();
        assert_eq!(id, 4242);

        let requests = seen.requests.lock().unwrap();
        assert_eq!(requests[0].0, "POST acme/api");
        assert_eq!(requests[0].1["head_sha"], "abc123");
        assert_eq!(requests[0].1["status"], "in_progress");
        assert_eq!(requests[0].2.as_deref(), Some("Bearer t0ken"));
    }

    #[tokio::test]
    async fn update_patches_and_surfaces_errors() {
        let (url, seen) = serve().await;
        let client = GitHubChecksClient::new(&url, None, Duration::from_secs(5)).unwrap();
        let body = UpdateCheckRun {
            status: CheckStatus::Completed,
            completed_at: Some("2024-01-01T00:01:00Z".to_string()),
            conclusion: Some(Conclusion::Failure),
            output: None,
        };

        client.update_check_run("acme/api", 7, &body).await.unwrap();
        let err = client.update_check_run("acme/api", 404, &body).await.unwrap_err();
        assert!(err.to_string().contains("404"));

        let requests = seen.requests.lock().unwrap();
        assert_eq!(requests[0].0, "PATCH acme/api/7");
        assert_eq!(requests[0].1["conclusion"], "failure");
    }
}
