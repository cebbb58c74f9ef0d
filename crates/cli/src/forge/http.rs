// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! reqwest-backed forge client for a GitHub-style REST API.
//!
//! Every response feeds its rate-limit headers into the shared
//! [`RateLimiter`] so the dispatcher sees limits without extra probes.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use super::{Comment, Forge, ForgeError, Issue};
use crate::limiter::{Channel, RateLimiter};

/// GitHub-style REST client bound to one `owner/repo`.
pub struct HttpForge {
    base_url: String,
    owner: String,
    repo: String,
    token: String,
    client: Client,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<WireLabel>,
    user: WireUser,
    state: String,
    /// Present on pull requests, which are not work items.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: WireUser,
}

fn issue_from_wire(wire: WireIssue) -> Issue {
    Issue {
        number: wire.number,
        title: wire.title,
        body: wire.body.unwrap_or_default(),
        labels: wire.labels.into_iter().map(|l| l.name).collect(),
        author: wire.user.login,
        state: wire.state,
    }
}

/// `x-ratelimit-reset` carries epoch seconds; we track epoch ms.
fn reset_header_to_ms(value: Option<&str>) -> Option<u64> {
    value?.parse::<u64>().ok().map(|secs| secs * 1000)
}

impl HttpForge {
    pub fn new(
        base_url: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("poppo/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
            client,
            limiter,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{path}", self.base_url, self.owner, self.repo)
    }

    fn record_limit_headers(&self, resp: &Response) {
        let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let reset_at = reset_header_to_ms(
            resp.headers().get("x-ratelimit-reset").and_then(|v| v.to_str().ok()),
        );
        if let (Some(remaining), Some(reset_at)) = (remaining, reset_at) {
            self.limiter.record_headers(Channel::Forge, remaining, reset_at);
        }
    }

    /// Map a non-success response to the error taxonomy.
    async fn classify(&self, resp: Response) -> ForgeError {
        let status = resp.status();
        let reset_at = reset_header_to_ms(
            resp.headers().get("x-ratelimit-reset").and_then(|v| v.to_str().ok()),
        );
        let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                self.limiter.record_limited(Channel::Forge, reset_at);
                ForgeError::RateLimited { reset_at }
            }
            // A 403 with an exhausted quota is a rate limit, not an auth failure.
            StatusCode::FORBIDDEN if remaining == Some(0) => {
                self.limiter.record_limited(Channel::Forge, reset_at);
                ForgeError::RateLimited { reset_at }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ForgeError::Auth,
            StatusCode::NOT_FOUND => ForgeError::NotFound(status.to_string()),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                ForgeError::Api(format!("{status}: {body}"))
            }
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, ForgeError> {
        let resp = req
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ForgeError::Network(e.to_string()))?;
        self.record_limit_headers(&resp);
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(self.classify(resp).await)
        }
    }
}

#[async_trait]
impl Forge for HttpForge {
    async fn list_issues(&self, state: &str, labels: &[String]) -> Result<Vec<Issue>, ForgeError> {
        let mut req = self
            .client
            .get(self.url("/issues"))
            .query(&[("state", state), ("per_page", "100")]);
        if !labels.is_empty() {
            req = req.query(&[("labels", labels.join(","))]);
        }
        let resp = self.send(req).await?;
        let wire: Vec<WireIssue> =
            resp.json().await.map_err(|e| ForgeError::Api(e.to_string()))?;
        Ok(wire
            .into_iter()
            .filter(|w| w.pull_request.is_none())
            .map(issue_from_wire)
            .collect())
    }

    async fn get_issue(&self, id: u64) -> Result<Issue, ForgeError> {
        let resp = self.send(self.client.get(self.url(&format!("/issues/{id}")))).await?;
        let wire: WireIssue = resp.json().await.map_err(|e| ForgeError::Api(e.to_string()))?;
        Ok(issue_from_wire(wire))
    }

    async fn list_comments(&self, id: u64) -> Result<Vec<Comment>, ForgeError> {
        let resp = self
            .send(
                self.client
                    .get(self.url(&format!("/issues/{id}/comments")))
                    .query(&[("per_page", "100")]),
            )
            .await?;
        let wire: Vec<WireComment> =
            resp.json().await.map_err(|e| ForgeError::Api(e.to_string()))?;
        Ok(wire
            .into_iter()
            .map(|c| Comment { id: c.id, author: c.user.login, body: c.body.unwrap_or_default() })
            .collect())
    }

    async fn add_comment(&self, id: u64, body: &str) -> Result<(), ForgeError> {
        self.send(
            self.client
                .post(self.url(&format!("/issues/{id}/comments")))
                .json(&serde_json::json!({ "body": body })),
        )
        .await?;
        Ok(())
    }

    async fn add_labels(&self, id: u64, labels: &[String]) -> Result<(), ForgeError> {
        if labels.is_empty() {
            return Ok(());
        }
        self.send(
            self.client
                .post(self.url(&format!("/issues/{id}/labels")))
                .json(&serde_json::json!({ "labels": labels })),
        )
        .await?;
        Ok(())
    }

    async fn remove_labels(&self, id: u64, labels: &[String]) -> Result<(), ForgeError> {
        for label in labels {
            let result = self
                .send(self.client.delete(self.url(&format!("/issues/{id}/labels/{label}"))))
                .await;
            match result {
                Ok(_) => {}
                // Removing a label that is already gone is a success.
                Err(ForgeError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
