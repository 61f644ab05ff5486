//! SCM adapters.
//!
//! One adapter instance is built per trigger via [`new_scm`] and dropped
//! when the trigger finishes. The control plane only needs two calls:
//! the last commit of a branch and a file's content at a commit.

pub mod github;

use async_trait::async_trait;

use crate::error::{Result, ServerError};
use crate::store::GitActor;

pub use github::GitHubScm;

/// Commit metadata captured into the build record.
#[derive(Debug, Clone)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: GitActor,
    pub committer: GitActor,
}

/// File content fetched at a commit.
#[derive(Debug, Clone)]
pub struct Content {
    pub data: String,
}

#[async_trait]
pub trait Scm: Send + Sync {
    /// Last commit of the given branch.
    async fn last_commit(&self, full_name: &str, branch: &str) -> Result<Commit>;

    /// Content of `path` at `sha`. Errors with *config-missing* if the
    /// file does not exist at that commit.
    async fn find_content(&self, full_name: &str, sha: &str, path: &str) -> Result<Content>;
}

/// Build the adapter for a repository's provider.
pub fn new_scm(provider: &str, base_url: &str, token: &str) -> Result<Box<dyn Scm>> {
    match provider {
        "github" => Ok(Box::new(GitHubScm::new(base_url, token))),
        other => Err(ServerError::ScmUnavailable(format!(
            "unsupported provider: {other}"
        ))),
    }
}

/// Constructor seam for the orchestrator; swapped out in tests.
pub trait ScmFactory: Send + Sync {
    fn create(&self, provider: &str, base_url: &str, token: &str) -> Result<Box<dyn Scm>>;
}

/// Production factory delegating to [`new_scm`].
pub struct DefaultScmFactory;

impl ScmFactory for DefaultScmFactory {
    fn create(&self, provider: &str, base_url: &str, token: &str) -> Result<Box<dyn Scm>> {
        new_scm(provider, base_url, token)
    }
}
