//! GitHub adapter over the commits and contents REST endpoints.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::error::{Result, ServerError};
use crate::scm::{Commit, Content, Scm};
use crate::store::GitActor;

const DEFAULT_BASE_URL: &str = "https://api.github.com";

pub struct GitHubScm {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl GitHubScm {
    pub fn new(base_url: &str, token: &str) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .header("User-Agent", "bantam-ci")
            .header("Accept", "application/vnd.github+json");
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.token));
        }
        request
    }
}

#[async_trait]
impl Scm for GitHubScm {
    async fn last_commit(&self, full_name: &str, branch: &str) -> Result<Commit> {
        let url = format!("{}/repos/{}/commits/{}", self.base_url, full_name, branch);
        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| ServerError::ScmUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ServerError::ScmUnavailable(format!(
                "commit lookup for {full_name}@{branch} failed: {}",
                response.status()
            )));
        }

        let commit: CommitResponse = response
            .json()
            .await
            .map_err(|e| ServerError::ScmUnavailable(e.to_string()))?;
        Ok(commit.into())
    }

    async fn find_content(&self, full_name: &str, sha: &str, path: &str) -> Result<Content> {
        let url = format!(
            "{}/repos/{}/contents/{}?ref={}",
            self.base_url, full_name, path, sha
        );
        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| ServerError::ScmUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ServerError::ConfigMissing(format!("{path} at {sha}")));
        }
        if !response.status().is_success() {
            return Err(ServerError::ScmUnavailable(format!(
                "content lookup for {path} failed: {}",
                response.status()
            )));
        }

        let content: ContentResponse = response
            .json()
            .await
            .map_err(|e| ServerError::ScmUnavailable(e.to_string()))?;

        // The contents API returns base64 with embedded newlines.
        let cleaned: String = content.content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| ServerError::ScmUnavailable(format!("content decode: {e}")))?;
        let data = String::from_utf8(bytes)
            .map_err(|e| ServerError::ScmUnavailable(format!("content decode: {e}")))?;
        Ok(Content { data })
    }
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    commit: CommitDetail,
    author: Option<ActorResponse>,
    committer: Option<ActorResponse>,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
    author: Option<SignatureResponse>,
    committer: Option<SignatureResponse>,
}

#[derive(Debug, Deserialize)]
struct ActorResponse {
    login: String,
    avatar_url: String,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    name: Option<String>,
    email: Option<String>,
}

impl From<CommitResponse> for Commit {
    fn from(response: CommitResponse) -> Self {
        let CommitResponse {
            sha,
            commit,
            author,
            committer,
        } = response;
        let actor = |account: Option<ActorResponse>, signature: Option<SignatureResponse>| {
            let (login, avatar) = account
                .map(|a| (a.login, a.avatar_url))
                .unwrap_or_default();
            let (name, email) = signature
                .map(|s| (s.name.unwrap_or_default(), s.email.unwrap_or_default()))
                .unwrap_or_default();
            GitActor {
                login,
                name,
                email,
                avatar,
            }
        };

        Commit {
            sha,
            message: commit.message,
            author: actor(author, commit.author),
            committer: actor(committer, commit.committer),
        }
    }
}
