use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::JobStatus;

/// A connected source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub user_id: u64,
    pub full_name: String,
    pub url: String,
    pub default_branch: String,
    pub provider: Provider,
}

/// SCM provider credentials for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub url: String,
    pub access_token: String,
}

/// Author or committer descriptor captured from the commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitActor {
    pub login: String,
    pub name: String,
    pub email: String,
    pub avatar: String,
}

/// A single CI invocation triggered by one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: u64,
    pub branch: String,
    pub commit: String,
    pub commit_message: String,
    pub author: GitActor,
    pub committer: GitActor,
    /// Raw repository config the build was parsed from.
    pub config: String,
    pub repository_id: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A persisted unit of execution belonging to a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub build_id: u64,
    pub image: String,
    /// Serialized command list, as dispatched to the worker.
    pub commands: String,
    /// Environment tuple this job runs under.
    pub env: String,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

/// Build loaded together with its jobs and owning repository.
#[derive(Debug, Clone)]
pub struct BuildDetail {
    pub build: Build,
    pub repository: Repository,
    pub jobs: Vec<Job>,
}

/// Job loaded together with its build and repository.
#[derive(Debug, Clone)]
pub struct JobDetail {
    pub job: Job,
    pub build: Build,
    pub repository: Repository,
}
