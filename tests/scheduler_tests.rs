//! Dispatch, capacity, priority, cancellation, and worker-loss
//! scenarios, driven end to end through the coordination store.


use std::time::Duration;

use chrono::Utc;
use bantam::coordination::{keys, CoordinationClient};
use bantam::scheduler::JobStatus;
use test_harness::{start_server, wait_until, ONE_JOB_CONFIG, THREE_JOB_CONFIG};

#[tokio::test]
async fn dispatches_to_largest_slack_first() {
    let server = start_server(THREE_JOB_CONFIG).await;
    server.register_worker("a", 2).await;
    server.register_worker("b", 1).await;
    let repo = server.seed_repo().await;

    let build_id = server.app.trigger_build(repo.id, repo.user_id).await.unwrap();

    let srv = &server;
    wait_until("all three jobs dispatched", || async {
        srv.dispatched_jobs("a").await.len() == 2 && srv.dispatched_jobs("b").await.len() == 1
    })
    .await;

    let build = server.build(build_id).await;
    assert!(build.start_time.is_some());
    assert!(build.end_time.is_none());

    for job_id in [1, 2, 3] {
        let job = server.job(job_id).await;
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.worker_id.is_some());
    }

    // Largest slack first, ties to the smallest worker id: a, a, b.
    let a_jobs: Vec<u64> = server.dispatched_jobs("a").await.iter().map(|j| j.id).collect();
    assert_eq!(a_jobs, vec![1, 2]);
}

#[tokio::test]
async fn waits_for_capacity_and_dispatches_in_submission_order() {
    let server = start_server(THREE_JOB_CONFIG).await;
    server.register_worker("a", 1).await;
    let repo = server.seed_repo().await;

    server.app.trigger_build(repo.id, repo.user_id).await.unwrap();

    let srv = &server;
    wait_until("first job dispatched", || async {
        srv.dispatched_jobs("a").await.iter().map(|j| j.id).collect::<Vec<_>>() == vec![1]
    })
    .await;
    assert_eq!(server.app.scheduler.queued_len().await, 2);

    let now = Utc::now();
    server
        .report_job("a", 1, JobStatus::Passing, Some(now), Some(now))
        .await;
    wait_until("second job dispatched", || async {
        srv.dispatched_jobs("a").await.iter().map(|j| j.id).collect::<Vec<_>>() == vec![2]
    })
    .await;

    let now = Utc::now();
    server
        .report_job("a", 2, JobStatus::Passing, Some(now), Some(now))
        .await;
    wait_until("third job dispatched", || async {
        srv.dispatched_jobs("a").await.iter().map(|j| j.id).collect::<Vec<_>>() == vec![3]
    })
    .await;
}

#[tokio::test]
async fn higher_priority_job_preempts_queue_order() {
    let server = start_server(THREE_JOB_CONFIG).await;
    server.register_worker("a", 1).await;
    let (repo, _build, jobs) = server.seed_build_with_jobs(3).await;

    // Job X occupies the only slot.
    let x = server.dispatch_payload(&jobs[0], &repo, 1000);
    server.app.scheduler.schedule(x).await;
    let srv = &server;
    wait_until("x dispatched", || async {
        srv.dispatched_jobs("a").await.len() == 1
    })
    .await;

    // Y at low priority, then Z at high priority.
    let y = server.dispatch_payload(&jobs[1], &repo, 500);
    let z = server.dispatch_payload(&jobs[2], &repo, 2000);
    server.app.scheduler.schedule(y).await;
    server.app.scheduler.schedule(z).await;
    assert_eq!(server.app.scheduler.queued_len().await, 2);

    let now = Utc::now();
    server
        .report_job("a", jobs[0].id, JobStatus::Passing, Some(now), Some(now))
        .await;

    let z_id = jobs[2].id;
    wait_until("z dispatched before y", || async {
        srv.dispatched_jobs("a").await.iter().map(|j| j.id).collect::<Vec<_>>() == vec![z_id]
    })
    .await;
    assert_eq!(server.job(jobs[1].id).await.status, JobStatus::Queued);

    let now = Utc::now();
    server
        .report_job("a", z_id, JobStatus::Passing, Some(now), Some(now))
        .await;
    let y_id = jobs[1].id;
    wait_until("y dispatched last", || async {
        srv.dispatched_jobs("a").await.iter().map(|j| j.id).collect::<Vec<_>>() == vec![y_id]
    })
    .await;
}

#[tokio::test]
async fn lost_worker_jobs_are_requeued_and_redispatched() {
    let server = start_server(ONE_JOB_CONFIG).await;
    server.register_worker("a", 1).await;
    let repo = server.seed_repo().await;

    server.app.trigger_build(repo.id, repo.user_id).await.unwrap();
    let srv = &server;
    wait_until("job on worker a", || async {
        srv.dispatched_jobs("a").await.len() == 1
    })
    .await;
    assert_eq!(server.job(1).await.worker_id.as_deref(), Some("a"));

    server.remove_worker("a").await;
    wait_until("job requeued", || async {
        srv.job(1).await.status == JobStatus::Queued && srv.app.scheduler.queued_len().await == 1
    })
    .await;

    server.register_worker("b", 1).await;
    wait_until("job redispatched to b", || async {
        srv.dispatched_jobs("b").await.len() == 1
    })
    .await;
    let job = server.job(1).await;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.worker_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn cancel_of_queued_job_removes_it() {
    let server = start_server(ONE_JOB_CONFIG).await;
    let repo = server.seed_repo().await;

    server.app.trigger_build(repo.id, repo.user_id).await.unwrap();
    let srv = &server;
    wait_until("job queued", || async {
        srv.app.scheduler.queued_len().await == 1
    })
    .await;

    server.app.stop_job(1).await.unwrap();
    let job = server.job(1).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.end_time.is_some());
    assert_eq!(server.app.scheduler.queued_len().await, 0);

    // Cancelling a terminal job is a no-op success.
    server.app.stop_job(1).await.unwrap();
}

#[tokio::test]
async fn cancel_of_unknown_job_is_not_found() {
    let server = start_server(ONE_JOB_CONFIG).await;
    assert!(server.app.stop_job(99).await.is_err());
}

#[tokio::test]
async fn cancel_of_dispatched_job_waits_for_acknowledgement() {
    let server = start_server(ONE_JOB_CONFIG).await;
    server.register_worker("a", 1).await;
    let repo = server.seed_repo().await;

    server.app.trigger_build(repo.id, repo.user_id).await.unwrap();
    let srv = &server;
    wait_until("job dispatched", || async {
        srv.dispatched_jobs("a").await.len() == 1
    })
    .await;

    // Worker side: wait for the cancel directive, then report terminal.
    let store = server.store.clone();
    let worker = tokio::spawn(async move {
        loop {
            if store.get(&keys::control(1)).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let now = Utc::now();
        let report = serde_json::json!({
            "status": "cancelled",
            "startTime": now,
            "endTime": now,
        });
        store
            .put(&keys::dispatch_status("a", 1), &report.to_string(), None)
            .await
            .unwrap();
    });

    server.app.stop_job(1).await.unwrap();
    worker.await.unwrap();

    let job = server.job(1).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.end_time.is_some());
}

#[tokio::test]
async fn cancel_timeout_forces_terminal_and_ignores_late_report() {
    let server = start_server(ONE_JOB_CONFIG).await;
    server.register_worker("a", 1).await;
    let repo = server.seed_repo().await;

    server.app.trigger_build(repo.id, repo.user_id).await.unwrap();
    let srv = &server;
    wait_until("job dispatched", || async {
        srv.dispatched_jobs("a").await.len() == 1
    })
    .await;

    // Nobody acknowledges; the bounded wait elapses and the job is
    // forced terminal.
    server.app.stop_job(1).await.unwrap();
    let job = server.job(1).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.end_time.is_some());
    let forced_end = job.end_time;

    // A late completion must not resurrect it.
    let now = Utc::now();
    server
        .report_job("a", 1, JobStatus::Passing, Some(now), Some(now))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = server.job(1).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.end_time, forced_end);
}

#[tokio::test]
async fn restart_job_twice_leaves_it_queued_once() {
    let server = start_server(ONE_JOB_CONFIG).await;
    let repo = server.seed_repo().await;

    server.app.trigger_build(repo.id, repo.user_id).await.unwrap();
    let srv = &server;
    wait_until("job queued", || async {
        srv.app.scheduler.queued_len().await == 1
    })
    .await;

    server.app.restart_job(1).await.unwrap();
    server.app.restart_job(1).await.unwrap();

    assert_eq!(server.app.scheduler.queued_len().await, 1);
    let job = server.job(1).await;
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.start_time.is_none());
    assert!(job.end_time.is_none());
}

#[tokio::test]
async fn never_dispatches_beyond_worker_capacity() {
    let server = start_server(THREE_JOB_CONFIG).await;
    server.register_worker("a", 2).await;
    let repo = server.seed_repo().await;

    server.app.trigger_build(repo.id, repo.user_id).await.unwrap();
    let srv = &server;
    wait_until("two jobs dispatched", || async {
        srv.dispatched_jobs("a").await.len() == 2
    })
    .await;

    // The third job stays queued; the worker is never overcommitted.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.dispatched_jobs("a").await.len(), 2);
    assert_eq!(server.app.scheduler.queued_len().await, 1);
    let snapshot = server.app.worker_snapshot().await;
    assert!(snapshot.iter().all(|w| w.running <= w.max));
}
