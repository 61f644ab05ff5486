use bantam::scheduler::{Job, JobQueue, JobStatus};

fn job(id: u64, priority: u16) -> Job {
    Job {
        id,
        build_id: 1,
        commands: "[\"make\"]".to_string(),
        image: "alpine".to_string(),
        env: String::new(),
        url: "https://github.com/octocat/hello-world".to_string(),
        provider_name: "github".to_string(),
        provider_url: String::new(),
        provider_token: String::new(),
        commit_sha: "4f2d1c8".to_string(),
        repo_name: "octocat/hello-world".to_string(),
        priority,
        status: JobStatus::Unknown,
    }
}

#[test]
fn equal_priorities_dequeue_fifo() {
    let mut queue = JobQueue::new();
    queue.enqueue(job(1, 1000));
    queue.enqueue(job(2, 1000));
    queue.enqueue(job(3, 1000));

    assert_eq!(queue.dequeue().unwrap().job.id, 1);
    assert_eq!(queue.dequeue().unwrap().job.id, 2);
    assert_eq!(queue.dequeue().unwrap().job.id, 3);
    assert!(queue.dequeue().is_none());
}

#[test]
fn higher_priority_wins_over_insertion_order() {
    let mut queue = JobQueue::new();
    queue.enqueue(job(1, 500));
    queue.enqueue(job(2, 2000));
    queue.enqueue(job(3, 1000));

    assert_eq!(queue.dequeue().unwrap().job.id, 2);
    assert_eq!(queue.dequeue().unwrap().job.id, 3);
    assert_eq!(queue.dequeue().unwrap().job.id, 1);
}

#[test]
fn peek_is_non_destructive() {
    let mut queue = JobQueue::new();
    queue.enqueue(job(1, 1000));
    queue.enqueue(job(2, 2000));

    assert_eq!(queue.peek().unwrap().job.id, 2);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.dequeue().unwrap().job.id, 2);
}

#[test]
fn remove_by_id_leaves_rest_ordered() {
    let mut queue = JobQueue::new();
    queue.enqueue(job(1, 1000));
    queue.enqueue(job(2, 1000));
    queue.enqueue(job(3, 1000));

    let removed = queue.remove(2).unwrap();
    assert_eq!(removed.id, 2);
    assert!(queue.remove(2).is_none());
    assert!(!queue.contains(2));

    assert_eq!(queue.dequeue().unwrap().job.id, 1);
    assert_eq!(queue.dequeue().unwrap().job.id, 3);
}

#[test]
fn requeue_preserves_original_position() {
    let mut queue = JobQueue::new();
    queue.enqueue(job(1, 1000));
    queue.enqueue(job(2, 1000));

    // Job 1 is dispatched, then its worker dies; it comes back under its
    // original sequence and stays ahead of job 2.
    let entry = queue.dequeue().unwrap();
    assert_eq!(entry.job.id, 1);
    queue.requeue(entry.job, entry.seq);

    assert_eq!(queue.dequeue().unwrap().job.id, 1);
    assert_eq!(queue.dequeue().unwrap().job.id, 2);
}

#[test]
fn sequence_not_reused_after_dequeue() {
    let mut queue = JobQueue::new();
    let seq1 = queue.enqueue(job(1, 1000));
    queue.dequeue();
    let seq2 = queue.enqueue(job(2, 1000));
    assert!(seq2 > seq1);
}
