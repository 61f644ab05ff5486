//! In-memory database.
//!
//! One shared table set behind a read/writer lock; the three repository
//! traits are implemented by cheap handles cloning the same tables. Ids
//! are assigned monotonically per table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, ServerError};
use crate::store::models::{Build, BuildDetail, Job, JobDetail, Provider, Repository};
use crate::store::{BuildRepository, JobRepository, RepoRepository};

#[derive(Default)]
struct Tables {
    repos: HashMap<u64, Repository>,
    builds: HashMap<u64, Build>,
    jobs: HashMap<u64, Job>,
    next_repo_id: u64,
    next_build_id: u64,
    next_job_id: u64,
}

impl Tables {
    fn build_detail(&self, build_id: u64) -> Result<BuildDetail> {
        let build = self
            .builds
            .get(&build_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("build {build_id}")))?;
        let repository = self
            .repos
            .get(&build.repository_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("repository {}", build.repository_id)))?;
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| j.build_id == build_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(BuildDetail {
            build,
            repository,
            jobs,
        })
    }
}

/// Shared in-memory database; `repos()`, `builds()` and `jobs()` hand out
/// the repository trait objects the app consumes.
#[derive(Clone, Default)]
pub struct MemDatabase {
    tables: Arc<RwLock<Tables>>,
}

impl MemDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repos(&self) -> Arc<dyn RepoRepository> {
        Arc::new(self.clone())
    }

    pub fn builds(&self) -> Arc<dyn BuildRepository> {
        Arc::new(self.clone())
    }

    pub fn jobs(&self) -> Arc<dyn JobRepository> {
        Arc::new(self.clone())
    }

    /// Seed a repository row; used by the binary's single-node wiring and
    /// the tests.
    pub async fn insert_repo(
        &self,
        user_id: u64,
        full_name: &str,
        url: &str,
        default_branch: &str,
        provider: Provider,
    ) -> Repository {
        let mut tables = self.tables.write().await;
        tables.next_repo_id += 1;
        let repo = Repository {
            id: tables.next_repo_id,
            user_id,
            full_name: full_name.to_string(),
            url: url.to_string(),
            default_branch: default_branch.to_string(),
            provider,
        };
        tables.repos.insert(repo.id, repo.clone());
        repo
    }
}

#[async_trait]
impl RepoRepository for MemDatabase {
    async fn find(&self, repo_id: u64, user_id: u64) -> Result<Repository> {
        let tables = self.tables.read().await;
        tables
            .repos
            .get(&repo_id)
            .filter(|r| r.user_id == user_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("repository {repo_id}")))
    }
}

#[async_trait]
impl BuildRepository for MemDatabase {
    async fn create(&self, mut build: Build) -> Result<Build> {
        let mut tables = self.tables.write().await;
        tables.next_build_id += 1;
        build.id = tables.next_build_id;
        tables.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn update(&self, build: Build) -> Result<Build> {
        let mut tables = self.tables.write().await;
        if !tables.builds.contains_key(&build.id) {
            return Err(ServerError::NotFound(format!("build {}", build.id)));
        }
        tables.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn find_all(&self, build_id: u64) -> Result<BuildDetail> {
        self.tables.read().await.build_detail(build_id)
    }
}

#[async_trait]
impl JobRepository for MemDatabase {
    async fn create(&self, mut job: Job) -> Result<Job> {
        let mut tables = self.tables.write().await;
        if !tables.builds.contains_key(&job.build_id) {
            return Err(ServerError::NotFound(format!("build {}", job.build_id)));
        }
        tables.next_job_id += 1;
        job.id = tables.next_job_id;
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find(&self, job_id: u64) -> Result<Job> {
        let tables = self.tables.read().await;
        tables
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("job {job_id}")))
    }

    async fn find_detail(&self, job_id: u64) -> Result<JobDetail> {
        let tables = self.tables.read().await;
        let job = tables
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("job {job_id}")))?;
        let detail = tables.build_detail(job.build_id)?;
        Ok(JobDetail {
            job,
            build: detail.build,
            repository: detail.repository,
        })
    }

    async fn update(&self, job: Job) -> Result<Job> {
        let mut tables = self.tables.write().await;
        if !tables.jobs.contains_key(&job.id) {
            return Err(ServerError::NotFound(format!("job {}", job.id)));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }
}
