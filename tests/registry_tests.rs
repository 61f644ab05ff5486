//! Worker watch protocol, end to end over the in-process store.


use std::time::Duration;

use bantam::coordination::{keys, CoordinationClient};
use bantam::registry::WorkerStatus;
use test_harness::{start_server, wait_until, ONE_JOB_CONFIG};

#[tokio::test]
async fn worker_joins_then_becomes_ready() {
    let server = start_server(ONE_JOB_CONFIG).await;

    // Announcement alone leaves the worker joining; it contributes no
    // capacity yet.
    let announcement = r#"{"address":"a.workers.local:7100","max":4,"capabilities":[]}"#;
    server
        .store
        .put(&keys::worker("a"), announcement, None)
        .await
        .unwrap();

    let workers = server.app.workers.clone();
    wait_until("worker joining", || {
        let workers = workers.clone();
        async move {
            workers
                .read()
                .await
                .get("a")
                .map(|w| w.status == WorkerStatus::Joining)
                .unwrap_or(false)
        }
    })
    .await;
    assert_eq!(server.app.get_capacity().await, (0, 0));

    // The liveness sentinel promotes it to ready.
    server.report_worker_status("a", 0).await;
    let app = server.app.clone();
    wait_until("capacity visible", || {
        let app = app.clone();
        async move { app.get_capacity().await == (4, 0) }
    })
    .await;
}

#[tokio::test]
async fn heartbeat_reconciles_running_count() {
    let server = start_server(ONE_JOB_CONFIG).await;
    server.register_worker("a", 4).await;

    server.report_worker_status("a", 3).await;
    let app = server.app.clone();
    wait_until("running count applied", || {
        let app = app.clone();
        async move { app.get_capacity().await == (4, 3) }
    })
    .await;

    // A report above max clamps rather than violating running <= max.
    server.report_worker_status("a", 9).await;
    let app = server.app.clone();
    wait_until("clamped to max", || {
        let app = app.clone();
        async move { app.get_capacity().await == (4, 4) }
    })
    .await;
    let snapshot = server.app.worker_snapshot().await;
    assert!(snapshot.iter().all(|w| w.running <= w.max));
}

#[tokio::test]
async fn draining_worker_contributes_no_capacity() {
    let server = start_server(ONE_JOB_CONFIG).await;
    server.register_worker("a", 2).await;
    assert_eq!(server.app.get_capacity().await, (2, 0));

    server.report_worker_draining("a", 1).await;
    let app = server.app.clone();
    wait_until("worker draining", || {
        let app = app.clone();
        async move { app.get_capacity().await == (0, 0) }
    })
    .await;
    let snapshot = server.app.worker_snapshot().await;
    assert_eq!(snapshot[0].status, WorkerStatus::Draining);
}

#[tokio::test]
async fn deleted_worker_is_lost() {
    let server = start_server(ONE_JOB_CONFIG).await;
    server.register_worker("a", 2).await;
    server.register_worker("b", 1).await;
    assert_eq!(server.app.get_capacity().await, (3, 0));

    server.remove_worker("a").await;
    let app = server.app.clone();
    wait_until("worker removed", || {
        let app = app.clone();
        async move { app.get_capacity().await == (1, 0) }
    })
    .await;
    assert!(server.app.workers.read().await.get("a").is_none());
}

#[tokio::test]
async fn status_lease_expiry_drops_worker() {
    let server = start_server(ONE_JOB_CONFIG).await;

    let announcement = r#"{"address":"a.workers.local:7100","max":2,"capabilities":[]}"#;
    server
        .store
        .put(&keys::worker("a"), announcement, None)
        .await
        .unwrap();
    let lease = server
        .store
        .grant_lease(Duration::from_millis(200))
        .await
        .unwrap();
    let status = r#"{"running":0,"load":0.0,"lastSeen":"2026-08-02T00:00:00Z"}"#;
    server
        .store
        .put(&keys::worker_status("a"), status, Some(lease))
        .await
        .unwrap();

    let app = server.app.clone();
    wait_until("worker ready", || {
        let app = app.clone();
        async move { app.get_capacity().await == (2, 0) }
    })
    .await;

    // No keep-alive: the sentinel expires and the worker goes lost.
    let app = server.app.clone();
    wait_until("worker lost on lease expiry", || {
        let app = app.clone();
        async move { app.get_capacity().await == (0, 0) }
    })
    .await;
}

#[tokio::test]
async fn lease_expired_worker_returns_on_next_heartbeat() {
    let server = start_server(ONE_JOB_CONFIG).await;

    let announcement = r#"{"address":"a.workers.local:7100","max":2,"capabilities":[]}"#;
    server
        .store
        .put(&keys::worker("a"), announcement, None)
        .await
        .unwrap();
    let lease = server
        .store
        .grant_lease(Duration::from_millis(150))
        .await
        .unwrap();
    server
        .store
        .put(
            &keys::worker_status("a"),
            r#"{"running":0,"load":0.0,"lastSeen":"2026-08-02T00:00:00Z"}"#,
            Some(lease),
        )
        .await
        .unwrap();

    let app = server.app.clone();
    wait_until("worker lost", || {
        let app = app.clone();
        async move {
            // Wait through ready and then lost.
            tokio::time::sleep(Duration::from_millis(50)).await;
            app.workers.read().await.is_empty()
        }
    })
    .await;

    // The worker's next status write resurrects it from the still-present
    // announcement.
    server.report_worker_status("a", 0).await;
    let app = server.app.clone();
    wait_until("worker back", || {
        let app = app.clone();
        async move { app.get_capacity().await == (2, 0) }
    })
    .await;
}
