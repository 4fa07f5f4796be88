//! Ordered multiset of queued work, partitioned by required runner type.
//!
//! The queue is process-authoritative but its membership is exactly the
//! set of jobs with `status = queued`, so a restart rebuilds it from the
//! store. FIFO within equal priority; priority is a single tier today.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};

/// A queued work item. `pinned_runner_id` is set for continuation steps
/// that must land on a specific runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: i64,
    pub runner_type: String,
    pub pinned_runner_id: Option<i64>,
}

#[derive(Default)]
struct QueueState {
    partitions: HashMap<String, VecDeque<QueuedJob>>,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    /// Signals the dispatcher that membership or runner availability changed.
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Wake the dispatcher. Also used by the registry when a runner idles.
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    pub async fn enqueue(&self, job: QueuedJob) {
        let mut state = self.state.lock().await;
        state
            .partitions
            .entry(job.runner_type.clone())
            .or_default()
            .push_back(job);
        drop(state);
        self.poke();
    }

    /// Pop the next job a runner of `type_filter` may execute. A filter of
    /// `any` matches every partition; any filter matches the `any`
    /// partition. Across eligible partitions the oldest job wins.
    pub async fn claim(&self, type_filter: &str) -> Option<QueuedJob> {
        let mut state = self.state.lock().await;
        let mut best: Option<(String, i64)> = None;
        for (partition, jobs) in state.partitions.iter() {
            if !partition_matches(partition, type_filter) {
                continue;
            }
            if let Some(front) = jobs.front() {
                match &best {
                    Some((_, best_id)) if *best_id <= front.job_id => {}
                    _ => best = Some((partition.clone(), front.job_id)),
                }
            }
        }
        let (partition, _) = best?;
        state
            .partitions
            .get_mut(&partition)
            .and_then(|jobs| jobs.pop_front())
    }

    /// Put a job back at the front of its partition after a failed ack.
    pub async fn release(&self, job: QueuedJob) {
        let mut state = self.state.lock().await;
        state
            .partitions
            .entry(job.runner_type.clone())
            .or_default()
            .push_front(job);
        drop(state);
        self.poke();
    }

    /// Put a job back without waking the dispatcher. Used when no runner
    /// matched; re-dispatch waits for a pool change instead of spinning.
    pub async fn release_quiet(&self, job: QueuedJob) {
        let mut state = self.state.lock().await;
        state
            .partitions
            .entry(job.runner_type.clone())
            .or_default()
            .push_front(job);
    }

    /// Drop a job from the queue, if still queued here.
    pub async fn cancel(&self, job_id: i64) -> bool {
        let mut state = self.state.lock().await;
        for jobs in state.partitions.values_mut() {
            if let Some(pos) = jobs.iter().position(|j| j.job_id == job_id) {
                jobs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Runner types that currently have queued work.
    pub async fn active_types(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .partitions
            .iter()
            .filter(|(_, jobs)| !jobs.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.partitions.values().map(|q| q.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Rebuild membership from the store's queued jobs, in dispatch order.
    pub async fn rebuild(&self, jobs: impl IntoIterator<Item = QueuedJob>) {
        let mut state = self.state.lock().await;
        state.partitions.clear();
        for job in jobs {
            state
                .partitions
                .entry(job.runner_type.clone())
                .or_default()
                .push_back(job);
        }
        drop(state);
        self.poke();
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn partition_matches(partition: &str, type_filter: &str) -> bool {
    type_filter == "any" || partition == "any" || partition == type_filter
}
