use chrono::Utc;
use futures::future::join_all;

use crate::app::App;
use crate::error::{Result, ServerError};
use crate::parser::ConfigParser;
use crate::scheduler::{self, JobStatus};
use crate::store::{self, Build, BuildDetail, Repository};

/// Priority assigned to jobs from interactive triggers.
pub const DEFAULT_JOB_PRIORITY: u16 = 1000;

impl App {
    /// Trigger a build for the head of the repository's default branch:
    /// resolve the repo, fetch the last commit and the CI config at it,
    /// parse, persist the build and one job per environment tuple, and
    /// submit them to the scheduler in configuration order.
    pub async fn trigger_build(&self, repo_id: u64, user_id: u64) -> Result<u64> {
        let repo = self.repos.find(repo_id, user_id).await?;
        let scm = self.scm.create(
            &repo.provider.name,
            &repo.provider.url,
            &repo.provider.access_token,
        )?;
        let commit = scm.last_commit(&repo.full_name, &repo.default_branch).await?;
        let content = scm
            .find_content(&repo.full_name, &commit.sha, &self.config.config_file)
            .await?;
        let parsed = ConfigParser::new(&content.data).parse()?;
        let commands = serde_json::to_string(&parsed.commands)
            .map_err(|e| ServerError::Persistence(e.to_string()))?;

        let build = self
            .builds
            .create(Build {
                id: 0,
                branch: repo.default_branch.clone(),
                commit: commit.sha.clone(),
                commit_message: commit.message.clone(),
                author: commit.author.clone(),
                committer: commit.committer.clone(),
                config: content.data.clone(),
                repository_id: repo.id,
                start_time: Some(Utc::now()),
                end_time: None,
            })
            .await?;

        for env in &parsed.env {
            let job = self
                .jobs
                .create(store::Job {
                    id: 0,
                    build_id: build.id,
                    image: parsed.image.clone(),
                    commands: commands.clone(),
                    env: env.clone(),
                    status: JobStatus::Unknown,
                    start_time: None,
                    end_time: None,
                    worker_id: None,
                })
                .await?;
            self.schedule_job(&job, &repo, &commit.sha).await;
        }

        tracing::info!(
            build_id = build.id,
            repo = %repo.full_name,
            commit = %commit.sha,
            jobs = parsed.env.len(),
            "Build triggered"
        );
        self.broadcast_new_build(build.id);
        Ok(build.id)
    }

    /// Stop the job with the given id.
    pub async fn stop_job(&self, job_id: u64) -> Result<()> {
        self.scheduler.cancel(job_id).await
    }

    /// Stop the job if queued or running, then schedule it again under
    /// the same id with cleared timestamps.
    pub async fn restart_job(&self, job_id: u64) -> Result<()> {
        self.stop_job(job_id).await?;
        let detail = self.jobs.find_detail(job_id).await?;
        self.schedule_job(&detail.job, &detail.repository, &detail.build.commit)
            .await;
        Ok(())
    }

    /// Stop the build and all of its jobs. Jobs are cancelled
    /// concurrently; individual failures are logged and do not abort the
    /// bulk. Idempotent: stopping an already-stopped build is a no-op.
    pub async fn stop_build(&self, build_id: u64) -> Result<BuildDetail> {
        let detail = self.builds.find_all(build_id).await?;

        join_all(detail.jobs.iter().map(|job| async move {
            if let Err(e) = self.scheduler.cancel(job.id).await {
                tracing::error!(job_id = job.id, error = %e, "Error stopping job");
            }
        }))
        .await;

        Ok(detail)
    }

    /// Stop the build's jobs if any are active, reopen the build by
    /// clearing its start and end times, then submit every job afresh.
    pub async fn restart_build(&self, build_id: u64) -> Result<()> {
        let BuildDetail {
            mut build,
            repository,
            jobs,
        } = self.stop_build(build_id).await?;

        build.start_time = None;
        build.end_time = None;
        let build = self.builds.update(build).await?;

        join_all(
            jobs.iter()
                .map(|job| self.schedule_job(job, &repository, &build.commit)),
        )
        .await;

        Ok(())
    }

    /// Map a persisted job onto the dispatch payload and hand it to the
    /// scheduler.
    pub(crate) async fn schedule_job(
        &self,
        job: &store::Job,
        repo: &Repository,
        commit_sha: &str,
    ) {
        let dispatch = scheduler::Job {
            id: job.id,
            build_id: job.build_id,
            commands: job.commands.clone(),
            image: job.image.clone(),
            env: job.env.clone(),
            url: repo.url.clone(),
            provider_name: repo.provider.name.clone(),
            provider_url: repo.provider.url.clone(),
            provider_token: repo.provider.access_token.clone(),
            commit_sha: commit_sha.to_string(),
            repo_name: repo.full_name.clone(),
            priority: DEFAULT_JOB_PRIORITY,
            status: JobStatus::Unknown,
        };
        self.scheduler.schedule(dispatch).await;
    }

    /// Recompute the build's start and end times from its jobs. The
    /// start time is the earliest job start; the end time is only set
    /// once every job has ended, to the latest of them. Serialized per
    /// build id so concurrent sibling completions cannot race. Returns
    /// whether the build is complete.
    pub async fn update_build_time(&self, build_id: u64) -> Result<bool> {
        let lock = self.build_lock(build_id).await;
        let guard = lock.lock().await;
        let result = self.recompute_build_time(build_id).await;
        drop(guard);
        self.evict_build_lock(build_id).await;
        result
    }

    async fn recompute_build_time(&self, build_id: u64) -> Result<bool> {
        let detail = self.builds.find_all(build_id).await?;

        let mut start = None;
        let mut end = None;
        let mut all_done = !detail.jobs.is_empty();
        for job in &detail.jobs {
            if let Some(s) = job.start_time {
                start = Some(start.map_or(s, |c: chrono::DateTime<Utc>| c.min(s)));
            }
            match job.end_time {
                Some(e) => end = Some(end.map_or(e, |c: chrono::DateTime<Utc>| c.max(e))),
                None => all_done = false,
            }
        }

        let mut build = detail.build;
        let mut changed = false;
        if let Some(s) = start {
            if build.start_time != Some(s) {
                build.start_time = Some(s);
                changed = true;
            }
        }
        if all_done {
            if build.end_time != end {
                build.end_time = end;
                changed = true;
            }
        } else if build.end_time.is_some() {
            // A job was reopened (restart, requeue) after the build had
            // completed; the end time no longer holds.
            build.end_time = None;
            changed = true;
        }
        if changed {
            self.builds.update(build).await?;
        }
        Ok(all_done)
    }

    pub(crate) fn broadcast_new_build(&self, build_id: u64) {
        self.broadcaster
            .send("new_build", serde_json::json!({ "buildID": build_id }));
    }
}
