use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::scheduler::job::Job;

/// Entry in the pending-job queue. Ordered by priority descending, then
/// enqueue sequence ascending (FIFO among equal priorities).
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub priority: u16,
    pub seq: u64,
    pub job: Job,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of jobs awaiting capacity. Owned exclusively by the
/// scheduler; a job is in the queue iff its status is queued.
#[derive(Debug, Default)]
pub struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job with the next enqueue sequence. Returns the sequence
    /// assigned to it.
    pub fn enqueue(&mut self, job: Job) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.heap.push(QueueEntry {
            priority: job.priority,
            seq,
            job,
        });
        seq
    }

    /// Re-insert a job under its original sequence, preserving its
    /// historical position among equal priorities. Used when a worker is
    /// lost while holding the job.
    pub fn requeue(&mut self, job: Job, seq: u64) {
        self.heap.push(QueueEntry {
            priority: job.priority,
            seq,
            job,
        });
    }

    /// Remove and return the highest-priority entry.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    /// Non-destructive top.
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.peek()
    }

    /// Remove a job by id. Linear scan; only used by cancellation of
    /// not-yet-dispatched jobs.
    pub fn remove(&mut self, job_id: u64) -> Option<Job> {
        if !self.contains(job_id) {
            return None;
        }
        let mut removed = None;
        let drained = std::mem::take(&mut self.heap);
        self.heap = drained
            .into_iter()
            .filter_map(|entry| {
                if entry.job.id == job_id {
                    removed = Some(entry.job);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        removed
    }

    pub fn contains(&self, job_id: u64) -> bool {
        self.heap.iter().any(|e| e.job.id == job_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
