//! Persisted state and the repository interfaces the orchestrator
//! consumes. The control plane only depends on the traits; the shipped
//! implementation is the in-memory database backing single-node mode and
//! the test suite.

pub mod memory;
pub mod models;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemDatabase;
pub use models::{Build, BuildDetail, GitActor, Job, JobDetail, Provider, Repository};

#[async_trait]
pub trait RepoRepository: Send + Sync {
    /// Resolve a repository owned by the given user.
    async fn find(&self, repo_id: u64, user_id: u64) -> Result<Repository>;
}

#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Persist a new build; the id is assigned by the store.
    async fn create(&self, build: Build) -> Result<Build>;

    /// Write back build fields (jobs are owned by the job repository).
    async fn update(&self, build: Build) -> Result<Build>;

    /// Load a build with its jobs and owning repository.
    async fn find_all(&self, build_id: u64) -> Result<BuildDetail>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a new job; the id is assigned by the store and is
    /// monotonically increasing.
    async fn create(&self, job: Job) -> Result<Job>;

    async fn find(&self, job_id: u64) -> Result<Job>;

    /// Load a job with its build and repository.
    async fn find_detail(&self, job_id: u64) -> Result<JobDetail>;

    async fn update(&self, job: Job) -> Result<Job>;
}
