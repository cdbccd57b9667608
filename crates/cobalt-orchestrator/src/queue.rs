//! Priority job queue and running-slot accounting.
//!
//! Ordering is strict priority, then enqueue time, then insertion order. There
//! is no aging, so a steady stream of `High` jobs starves `Low` ones.
//!
//! The running set lives behind the same lock as the pending heap, so the
//! concurrency count and dequeues never disagree. A job waiting out a retry
//! backoff holds a reservation, which occupies a slot until it is dropped or
//! the job starts again.

use chrono::{DateTime, Utc};
use cobalt_training::{JobId, Priority};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// A pending queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub job_id: JobId,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    seq: u64,
}

/// Wrapper giving the max-heap "most urgent first" semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry(QueuedTask);

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // lower rank, earlier time and lower seq are "greater" for the max-heap
        other
            .0
            .priority
            .urgency_rank()
            .cmp(&self.0.priority.urgency_rank())
            .then_with(|| other.0.enqueued_at.cmp(&self.0.enqueued_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BinaryHeap<HeapEntry>,
    queued: HashSet<JobId>,
    running: HashSet<JobId>,
    reserved: HashSet<JobId>,
    next_seq: u64,
}

impl QueueState {
    /// Running jobs plus reservations held by jobs that are not running.
    fn occupied(&self) -> usize {
        self.running.len() + self.reserved.iter().filter(|id| !self.running.contains(*id)).count()
    }
}

pub struct JobQueue {
    max_concurrent: usize,
    state: Mutex<QueueState>,
    /// Signalled on every push.
    available: Notify,
    /// Signalled whenever a running slot is released.
    released: Notify,
}

impl JobQueue {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            released: Notify::new(),
        }
    }

    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Adds a job. Returns `false` if it is already queued or running.
    pub fn push(&self, job_id: JobId, priority: Priority) -> bool {
        {
            let mut state = self.state.lock();
            if state.queued.contains(&job_id) || state.running.contains(&job_id) {
                debug!(job_id = %job_id, "Job already queued or running");
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queued.insert(job_id.clone());
            debug!(job_id = %job_id, priority = %priority, depth = state.pending.len() + 1, "Enqueued job");
            state.pending.push(HeapEntry(QueuedTask { job_id, priority, enqueued_at: Utc::now(), seq }));
        }
        self.available.notify_one();
        true
    }

    /// Puts a dequeued task back with its original ordering key.
    pub fn requeue(&self, task: QueuedTask) {
        {
            let mut state = self.state.lock();
            if !state.queued.insert(task.job_id.clone()) {
                return;
            }
            state.pending.push(HeapEntry(task));
        }
        self.available.notify_one();
    }

    /// Removes and returns the most urgent task without waiting.
    pub fn pop(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock();
        let HeapEntry(task) = state.pending.pop()?;
        state.queued.remove(&task.job_id);
        debug!(job_id = %task.job_id, priority = %task.priority, "Dequeued job");
        Some(task)
    }

    /// Waits up to `timeout` for a task.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<QueuedTask> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.pop() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, self.available.notified()).await.is_err() {
                return self.pop();
            }
        }
    }

    /// Removes a task that has not been dequeued yet.
    pub fn cancel_queued(&self, job_id: &JobId) -> bool {
        let mut state = self.state.lock();
        if !state.queued.remove(job_id) {
            return false;
        }
        state.pending.retain(|entry| &entry.0.job_id != job_id);
        debug!(job_id = %job_id, "Removed job from queue");
        true
    }

    /// Claims a running slot for `job_id` if capacity remains. A reservation
    /// held by the same job is converted into the slot.
    pub fn try_acquire_slot(self: &Arc<Self>, job_id: &JobId) -> Option<RunningSlot> {
        let mut state = self.state.lock();
        if state.running.contains(job_id) {
            return None;
        }
        let own = usize::from(state.reserved.contains(job_id));
        if state.occupied() - own >= self.max_concurrent {
            return None;
        }
        state.reserved.remove(job_id);
        state.running.insert(job_id.clone());
        Some(RunningSlot { queue: Arc::clone(self), job_id: job_id.clone() })
    }

    /// Holds a slot for `job_id` until the returned guard drops.
    pub fn reserve(self: &Arc<Self>, job_id: &JobId) -> Reservation {
        if self.state.lock().reserved.insert(job_id.clone()) {
            debug!(job_id = %job_id, "Reserved slot for retry");
        }
        Reservation { queue: Arc::clone(self), job_id: job_id.clone() }
    }

    /// Resolves once some slot or reservation has been released.
    pub async fn slot_released(&self) {
        self.released.notified().await;
    }

    /// Resolves once `job_id` no longer holds a running slot.
    pub async fn wait_until_idle(&self, job_id: &JobId) {
        loop {
            let mut released = std::pin::pin!(self.released.notified());
            released.as_mut().enable();
            if !self.is_running(job_id) {
                return;
            }
            released.await;
        }
    }

    pub fn is_queued(&self, job_id: &JobId) -> bool {
        self.state.lock().queued.contains(job_id)
    }

    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.state.lock().running.contains(job_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Slots taken by running jobs and retry reservations.
    pub fn occupied_count(&self) -> usize {
        self.state.lock().occupied()
    }

    pub fn is_reserved(&self, job_id: &JobId) -> bool {
        self.state.lock().reserved.contains(job_id)
    }

    /// Pending tasks in dequeue order.
    pub fn snapshot(&self) -> Vec<QueuedTask> {
        let mut entries: Vec<HeapEntry> = self.state.lock().pending.iter().cloned().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.0).collect()
    }

    fn release(&self, job_id: &JobId) {
        let removed = self.state.lock().running.remove(job_id);
        if removed {
            debug!(job_id = %job_id, "Released running slot");
            self.released.notify_waiters();
        }
    }

    fn unreserve(&self, job_id: &JobId) {
        let removed = self.state.lock().reserved.remove(job_id);
        if removed {
            debug!(job_id = %job_id, "Released retry reservation");
            self.released.notify_waiters();
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobQueue")
            .field("max_concurrent", &self.max_concurrent)
            .field("pending", &state.pending.len())
            .field("running", &state.running.len())
            .field("reserved", &state.reserved.len())
            .finish_non_exhaustive()
    }
}

/// A claimed worker slot. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct RunningSlot {
    queue: Arc<JobQueue>,
    job_id: JobId,
}

impl RunningSlot {
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.queue.release(&self.job_id);
    }
}

/// A slot held for a job between runs. Dropping it frees the slot unless the
/// job has already started on it.
#[derive(Debug)]
pub struct Reservation {
    queue: Arc<JobQueue>,
    job_id: JobId,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.queue.unreserve(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::from(s)
    }

    #[test]
    fn test_priority_then_fifo_ordering() {
        let queue = JobQueue::new(1);
        queue.push(id("low-1"), Priority::Low);
        queue.push(id("med-1"), Priority::Medium);
        queue.push(id("high-1"), Priority::High);
        queue.push(id("low-2"), Priority::Low);
        queue.push(id("high-2"), Priority::High);

        let order: Vec<String> =
            std::iter::from_fn(|| queue.pop()).map(|task| task.job_id.0).collect();
        assert_eq!(order, ["high-1", "high-2", "med-1", "low-1", "low-2"]);
    }

    #[test]
    fn test_snapshot_matches_dequeue_order() {
        let queue = JobQueue::new(1);
        queue.push(id("a"), Priority::Low);
        queue.push(id("b"), Priority::High);
        queue.push(id("c"), Priority::Medium);
        let snapshot: Vec<JobId> = queue.snapshot().into_iter().map(|t| t.job_id).collect();
        assert_eq!(snapshot, vec![id("b"), id("c"), id("a")]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let queue = JobQueue::new(1);
        assert!(queue.push(id("a"), Priority::Low));
        assert!(!queue.push(id("a"), Priority::High));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cancel_queued() {
        let queue = JobQueue::new(1);
        queue.push(id("a"), Priority::Low);
        queue.push(id("b"), Priority::Low);
        assert!(queue.cancel_queued(&id("a")));
        assert!(!queue.cancel_queued(&id("a")));
        assert_eq!(queue.pop().unwrap().job_id, id("b"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_slots_are_bounded_and_released_on_drop() {
        let queue = Arc::new(JobQueue::new(2));
        let a = queue.try_acquire_slot(&id("a")).unwrap();
        assert!(queue.try_acquire_slot(&id("a")).is_none());
        let _b = queue.try_acquire_slot(&id("b")).unwrap();
        assert!(queue.try_acquire_slot(&id("c")).is_none());
        assert_eq!(queue.running_count(), 2);

        drop(a);
        assert_eq!(queue.running_count(), 1);
        assert!(queue.try_acquire_slot(&id("c")).is_some());
    }

    #[test]
    fn test_running_job_cannot_be_pushed() {
        let queue = Arc::new(JobQueue::new(1));
        let _slot = queue.try_acquire_slot(&id("a")).unwrap();
        assert!(!queue.push(id("a"), Priority::High));
    }

    #[test]
    fn test_reservation_holds_a_slot_for_its_job() {
        let queue = Arc::new(JobQueue::new(1));
        let reservation = queue.reserve(&id("retrying"));
        assert_eq!(queue.occupied_count(), 1);
        assert_eq!(queue.running_count(), 0);
        assert!(queue.try_acquire_slot(&id("other")).is_none());

        // the reserved job starts on its own reservation
        let slot = queue.try_acquire_slot(&id("retrying")).unwrap();
        assert!(!queue.is_reserved(&id("retrying")));
        drop(reservation);
        assert_eq!(queue.occupied_count(), 1);
        drop(slot);

        let again = queue.reserve(&id("retrying"));
        drop(again);
        assert_eq!(queue.occupied_count(), 0);
        assert!(queue.try_acquire_slot(&id("other")).is_some());
    }

    #[test]
    fn test_reserved_and_running_job_counts_once() {
        let queue = Arc::new(JobQueue::new(2));
        let _slot = queue.try_acquire_slot(&id("a")).unwrap();
        let _reservation = queue.reserve(&id("a"));
        assert_eq!(queue.occupied_count(), 1);
        assert!(queue.try_acquire_slot(&id("b")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_idle_resolves_when_slot_drops() {
        let queue = Arc::new(JobQueue::new(1));
        queue.wait_until_idle(&id("a")).await;

        let slot = queue.try_acquire_slot(&id("a")).unwrap();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_until_idle(&id("a")).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn test_requeue_keeps_position() {
        let queue = JobQueue::new(1);
        queue.push(id("first"), Priority::Medium);
        queue.push(id("second"), Priority::Medium);
        let first = queue.pop().unwrap();
        queue.requeue(first);
        assert_eq!(queue.pop().unwrap().job_id, id("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_waits_for_push() {
        let queue = Arc::new(JobQueue::new(1));
        assert!(queue.pop_timeout(Duration::from_millis(50)).await.is_none());

        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(JobId::from("late"), Priority::Low);
        });
        let task = queue.pop_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(task.job_id, id("late"));
    }
}
