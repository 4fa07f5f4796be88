//! Runner pool: session registry, job dispatch, heartbeat liveness.
//!
//! Each connected runner is one task (`session.rs`) owning the socket;
//! all per-runner state the rest of the system needs lives in the store
//! row plus a send-channel held here. The dispatcher is the single claim
//! path: queue pop, store claim, `run_job` send, ack window.

pub mod protocol;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::config::{ACK_TIMEOUT, CANCEL_GRACE, Config, HEARTBEAT_DEAD_AFTER};
use crate::errors::{DispatchError, StoreError};
use crate::githost::{GitHost, assets};
use crate::queue::{JobQueue, QueuedJob};
use crate::store::Store;
use crate::store::db::now_epoch;
use crate::store::models::{Job, JobStatus, Runner, RunnerStatus};
use self::protocol::{AgentFilePayload, RunnerMessage, ServerMessage};

struct SessionHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

pub struct RunnerRegistry {
    store: Store,
    queue: Arc<JobQueue>,
    githost: Arc<GitHost>,
    config: Config,
    sessions: Mutex<HashMap<i64, SessionHandle>>,
    /// job_id → runner_id awaiting `job_ack`.
    pending_acks: Mutex<HashMap<i64, i64>>,
}

/// Per-type pool counts for `/runners` and the `pool_stats` broadcast.
#[derive(Debug, Clone, Default, serde::Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub connected: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued_jobs: usize,
}

impl RunnerRegistry {
    pub fn new(store: Store, queue: Arc<JobQueue>, githost: Arc<GitHost>, config: Config) -> Self {
        Self {
            store,
            queue,
            githost,
            config,
            sessions: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    // ── Session lifecycle ─────────────────────────────────────────────

    /// First-message registration: validate the declared type, assign or
    /// confirm the runner id, and attach the session's send channel.
    pub async fn register(
        &self,
        runner_type: &str,
        runner_id: Option<i64>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Runner, DispatchError> {
        if runner_type.is_empty()
            || !runner_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DispatchError::UnknownRunnerType(runner_type.to_string()));
        }

        let runner = match runner_id {
            Some(id) => {
                {
                    let sessions = self.sessions.lock().await;
                    if sessions.contains_key(&id) {
                        return Err(DispatchError::AlreadyConnected(id));
                    }
                }
                match self.store.get_runner(id).await {
                    Ok(Some(existing)) if existing.runner_type == runner_type => {
                        self.store
                            .runner_set_status(id, RunnerStatus::Connecting)
                            .await
                            .map_err(|_| DispatchError::UnknownRunnerType(runner_type.into()))?
                    }
                    // Unknown or re-typed id: assign a fresh one.
                    _ => self
                        .store
                        .register_runner(runner_type.to_string())
                        .await
                        .map_err(|_| DispatchError::UnknownRunnerType(runner_type.into()))?,
                }
            }
            None => self
                .store
                .register_runner(runner_type.to_string())
                .await
                .map_err(|_| DispatchError::UnknownRunnerType(runner_type.into()))?,
        };

        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&runner.id) {
                return Err(DispatchError::AlreadyConnected(runner.id));
            }
            sessions.insert(runner.id, SessionHandle { tx });
        }

        let runner = self
            .store
            .runner_set_status(runner.id, RunnerStatus::Idle)
            .await
            .map_err(|_| DispatchError::UnknownRunnerType(runner_type.into()))?;
        let _ = self.store.runner_heartbeat(runner.id).await;
        tracing::info!(runner_id = runner.id, runner_type, "runner registered");
        self.queue.poke();
        Ok(runner)
    }

    /// Socket gone: runner row outlives the session but goes to
    /// `disconnected`; a job in flight fails with "runner lost".
    pub async fn detach(&self, runner_id: i64) {
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.remove(&runner_id).is_none() {
                return;
            }
        }
        let job_id = match self.store.get_runner(runner_id).await {
            Ok(Some(runner)) => runner.current_job_id,
            _ => None,
        };
        if let Some(job_id) = job_id {
            self.fail_lost_job(job_id, "runner lost").await;
        }
        self.clear_pending_acks_for(runner_id).await;
        if let Err(e) = self
            .store
            .runner_drop_job(runner_id, RunnerStatus::Disconnected)
            .await
        {
            tracing::warn!(runner_id, error = %e, "failed to mark runner disconnected");
        }
        tracing::info!(runner_id, "runner disconnected");
    }

    pub async fn is_connected(&self, runner_id: i64) -> bool {
        self.sessions.lock().await.contains_key(&runner_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Send `shutdown` to every connected runner (graceful stop).
    pub async fn shutdown(&self) {
        let sessions = self.sessions.lock().await;
        for (runner_id, handle) in sessions.iter() {
            if handle.tx.send(ServerMessage::Shutdown).is_err() {
                tracing::debug!(runner_id, "shutdown send failed; session already gone");
            }
        }
    }

    pub async fn pool_stats(&self) -> Result<HashMap<String, PoolStats>, StoreError> {
        let runners = self.store.list_runners().await?;
        let sessions = self.sessions.lock().await;
        let mut stats: HashMap<String, PoolStats> = HashMap::new();
        for runner in runners {
            let entry = stats.entry(runner.runner_type.clone()).or_default();
            if sessions.contains_key(&runner.id) {
                entry.connected += 1;
            }
            match runner.status {
                RunnerStatus::Idle => entry.idle += 1,
                RunnerStatus::Assigned | RunnerStatus::Busy => entry.busy += 1,
                _ => {}
            }
        }
        drop(sessions);
        let queued = self.queue.len().await;
        for entry in stats.values_mut() {
            entry.queued_jobs = queued;
        }
        Ok(stats)
    }

    // ── Inbound messages ──────────────────────────────────────────────

    pub async fn on_message(&self, runner_id: i64, msg: RunnerMessage) {
        match msg {
            RunnerMessage::Register { .. } => {
                tracing::warn!(runner_id, "duplicate register ignored");
            }
            RunnerMessage::Heartbeat => {
                if let Err(e) = self.store.runner_heartbeat(runner_id).await {
                    tracing::warn!(runner_id, error = %e, "heartbeat for unknown runner");
                }
            }
            RunnerMessage::JobAck { job_id, accepted } => {
                self.on_ack(runner_id, job_id, accepted).await;
            }
            RunnerMessage::LogAppend { job_id, chunk, seq } => {
                tracing::trace!(runner_id, job_id, seq, "log chunk");
                if let Err(e) = self.store.append_job_logs(job_id, chunk).await {
                    tracing::warn!(job_id, error = %e, "log append failed");
                }
            }
            RunnerMessage::JobResult {
                job_id,
                status,
                error,
                branch_name,
                test_results,
            } => {
                self.on_result(runner_id, job_id, status, error, branch_name, test_results)
                    .await;
            }
        }
    }

    async fn on_ack(&self, runner_id: i64, job_id: i64, accepted: bool) {
        let expected = {
            let mut pending = self.pending_acks.lock().await;
            pending.remove(&job_id)
        };
        if expected != Some(runner_id) {
            tracing::warn!(runner_id, job_id, "unexpected job_ack ignored");
            return;
        }
        if accepted {
            if let Err(e) = self.store.runner_set_status(runner_id, RunnerStatus::Busy).await {
                tracing::warn!(runner_id, error = %e, "failed to mark runner busy");
            }
            tracing::debug!(runner_id, job_id, "assignment accepted");
        } else {
            tracing::info!(runner_id, job_id, "assignment rejected; releasing job");
            self.release_assignment(job_id, runner_id).await;
        }
    }

    async fn on_result(
        &self,
        runner_id: i64,
        job_id: i64,
        status: JobStatus,
        error: Option<String>,
        branch_name: Option<String>,
        test_results: Option<crate::store::models::TestResults>,
    ) {
        if !status.is_terminal() {
            tracing::warn!(runner_id, job_id, "non-terminal job_result ignored");
            return;
        }
        // An ack may never have arrived; a result supersedes it.
        {
            let mut pending = self.pending_acks.lock().await;
            pending.remove(&job_id);
        }
        match self
            .store
            .finish_job(job_id, status, error, branch_name, test_results)
            .await
        {
            Ok(Some(job)) => {
                tracing::info!(runner_id, job_id, status = status.as_str(), "job finished");
                debug_assert!(job.status.is_terminal());
            }
            Ok(None) => {
                // Duplicate after terminal: already warned by the store.
            }
            Err(e) => {
                tracing::error!(runner_id, job_id, error = %e, "failed to record job result");
            }
        }
        if let Err(e) = self.store.runner_finish_job(runner_id).await {
            tracing::warn!(runner_id, error = %e, "failed to idle runner after result");
        }
        self.queue.poke();
    }

    async fn release_assignment(&self, job_id: i64, runner_id: i64) {
        match self.store.release_job(job_id, runner_id).await {
            // Only re-enqueue when the row actually went back to queued; a
            // job that reached a terminal state in the meantime stays out.
            Ok((job, _)) if job.status == JobStatus::Queued => {
                self.queue
                    .release(QueuedJob {
                        job_id: job.id,
                        runner_type: job.required_runner_type.clone(),
                        pinned_runner_id: job.pinned_runner_id,
                    })
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id, runner_id, error = %e, "release after ack failure");
            }
        }
    }

    async fn clear_pending_acks_for(&self, runner_id: i64) {
        let orphaned: Vec<i64> = {
            let mut pending = self.pending_acks.lock().await;
            let ids: Vec<i64> = pending
                .iter()
                .filter(|(_, r)| **r == runner_id)
                .map(|(j, _)| *j)
                .collect();
            for id in &ids {
                pending.remove(id);
            }
            ids
        };
        for job_id in orphaned {
            self.release_assignment(job_id, runner_id).await;
        }
    }

    /// Fail a job whose runner went away; the queue no longer owns it.
    async fn fail_lost_job(&self, job_id: i64, reason: &str) {
        match self
            .store
            .finish_job(job_id, JobStatus::Failed, Some(reason.to_string()), None, None)
            .await
        {
            Ok(Some(_)) => tracing::warn!(job_id, reason, "job failed"),
            Ok(None) => {}
            Err(e) => tracing::error!(job_id, error = %e, "failed to fail lost job"),
        }
    }

    // ── Cancellation ──────────────────────────────────────────────────

    /// Cancel a job wherever it currently is. Queued jobs fail
    /// immediately; running jobs get `cancel_job` and a grace period.
    pub async fn cancel_job(self: &Arc<Self>, job_id: i64, reason: &str) -> Result<(), StoreError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(StoreError::NotFound {
                entity: "job",
                id: job_id,
            });
        };
        match job.status {
            JobStatus::Queued => {
                self.queue.cancel(job_id).await;
                self.store
                    .finish_job(job_id, JobStatus::Failed, Some(reason.to_string()), None, None)
                    .await?;
                Ok(())
            }
            JobStatus::Running => {
                let runner_id = job.runner_id;
                let reachable = match runner_id {
                    Some(id) => {
                        let sessions = self.sessions.lock().await;
                        sessions
                            .get(&id)
                            .map(|s| s.tx.send(ServerMessage::CancelJob { job_id }).is_ok())
                            .unwrap_or(false)
                    }
                    None => false,
                };
                if reachable {
                    // Grace period, then force the failure.
                    let registry = Arc::clone(self);
                    let reason = reason.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(CANCEL_GRACE).await;
                        registry.force_fail_if_running(job_id, runner_id, &reason).await;
                    });
                } else {
                    self.store
                        .finish_job(job_id, JobStatus::Failed, Some(reason.to_string()), None, None)
                        .await?;
                    if let Some(id) = runner_id {
                        let _ = self
                            .store
                            .runner_drop_job(id, RunnerStatus::Disconnected)
                            .await;
                    }
                }
                Ok(())
            }
            _ => Ok(()), // already terminal
        }
    }

    async fn force_fail_if_running(&self, job_id: i64, runner_id: Option<i64>, reason: &str) {
        match self.store.get_job(job_id).await {
            Ok(Some(job)) if !job.status.is_terminal() => {
                tracing::warn!(job_id, "cancel grace elapsed; forcing failure");
                let _ = self
                    .store
                    .finish_job(job_id, JobStatus::Failed, Some(reason.to_string()), None, None)
                    .await;
                if let Some(id) = runner_id {
                    let _ = self.store.runner_finish_job(id).await;
                    self.queue.poke();
                }
            }
            _ => {}
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────

    /// The dispatcher loop: wakes on queue/pool changes and assigns work
    /// to idle runners until nothing further matches.
    pub async fn run_dispatcher(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.queue.wait_for_work() => {}
                _ = tick.tick() => {}
            }
            while self.dispatch_once().await {}
        }
    }

    /// Drain all currently possible assignments (one dispatcher tick).
    pub async fn run_dispatch_tick(&self) {
        while self.dispatch_once().await {}
    }

    /// One assignment attempt; true when a job moved.
    async fn dispatch_once(&self) -> bool {
        for partition in self.queue.active_types().await {
            let Some(queued) = self.queue.claim(&partition).await else {
                continue;
            };

            // Continuation steps are pinned to the previous step's runner.
            let runner = if let Some(pin) = queued.pinned_runner_id {
                let mut pinned = None;
                if let Ok(Some(runner)) = self.store.get_runner(pin).await {
                    if runner.status == RunnerStatus::Idle && self.is_connected(runner.id).await {
                        pinned = Some(runner);
                    }
                }
                match pinned {
                    Some(runner) => runner,
                    None => {
                        self.fail_lost_job(queued.job_id, "continuation runner unavailable")
                            .await;
                        return true;
                    }
                }
            } else {
                let mut candidate = None;
                if let Ok(Some(runner)) = self.store.oldest_idle_runner(partition.clone()).await {
                    if self.is_connected(runner.id).await {
                        candidate = Some(runner);
                    }
                }
                match candidate {
                    Some(runner) => runner,
                    None => {
                        // No runner for this partition right now.
                        self.queue.release_quiet(queued).await;
                        continue;
                    }
                }
            };

            match self.store.claim_job(queued.job_id, runner.id).await {
                Ok((job, runner)) => {
                    self.send_assignment(&job, &runner).await;
                    return true;
                }
                Err(StoreError::TransitionLost { entity: "runner", .. }) => {
                    // Runner raced away; put the job back.
                    self.queue.release_quiet(queued).await;
                }
                Err(StoreError::TransitionLost { .. }) => {
                    // Job no longer queued (cancelled); drop it.
                    tracing::debug!(job_id = queued.job_id, "claim lost; job left the queue");
                }
                Err(e) => {
                    tracing::error!(job_id = queued.job_id, error = %e, "claim failed");
                    self.queue.release_quiet(queued).await;
                }
            }
        }
        false
    }

    async fn send_assignment(&self, job: &Job, runner: &Runner) {
        let clone_url = match self.store.get_repo(job.repo_id).await {
            Ok(Some(repo)) => repo.clone_url,
            _ => self.config.clone_url(job.repo_id),
        };
        let agent_files = self.resolve_agent_files(job).await;
        let msg = ServerMessage::run_job(job, clone_url, agent_files);

        let sent = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&runner.id)
                .map(|s| s.tx.send(msg).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            tracing::warn!(runner_id = runner.id, job_id = job.id, "send failed; releasing");
            self.release_assignment(job.id, runner.id).await;
            return;
        }

        {
            let mut pending = self.pending_acks.lock().await;
            pending.insert(job.id, runner.id);
        }
        tracing::info!(runner_id = runner.id, job_id = job.id, "run_job dispatched");
    }

    /// Ack watchdog loop: any assignment without a `job_ack` inside the
    /// window is released back to the queue.
    pub async fn run_ack_watchdog(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        // Deadlines are coarse: a pending entry older than ACK_TIMEOUT is
        // released on the next tick.
        let mut ages: HashMap<i64, std::time::Instant> = HashMap::new();
        loop {
            tick.tick().await;
            let pending: Vec<(i64, i64)> = {
                let p = self.pending_acks.lock().await;
                p.iter().map(|(j, r)| (*j, *r)).collect()
            };
            let now = std::time::Instant::now();
            ages.retain(|job_id, _| pending.iter().any(|(j, _)| j == job_id));
            for (job_id, runner_id) in pending {
                let age = ages.entry(job_id).or_insert(now);
                if now.duration_since(*age) >= ACK_TIMEOUT {
                    let removed = {
                        let mut p = self.pending_acks.lock().await;
                        p.remove(&job_id).is_some()
                    };
                    if removed {
                        tracing::warn!(job_id, runner_id, "ack timeout; releasing job");
                        self.release_assignment(job_id, runner_id).await;
                    }
                    ages.remove(&job_id);
                }
            }
        }
    }

    // ── Liveness ──────────────────────────────────────────────────────

    /// Heartbeat reaper: marks silent runners dead, fails their jobs, and
    /// downgrades socketless dead runners to disconnected.
    pub async fn run_heartbeat_reaper(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            self.reap_stale_runners().await;
        }
    }

    pub async fn reap_stale_runners(&self) {
        let cutoff = now_epoch() - HEARTBEAT_DEAD_AFTER.as_secs() as i64;
        let stale = match self.store.stale_runners(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::error!(error = %e, "stale runner scan failed");
                return;
            }
        };
        for runner in stale {
            tracing::warn!(runner_id = runner.id, "runner heartbeat lost; marking dead");
            if let Some(job_id) = runner.current_job_id {
                self.fail_lost_job(job_id, "runner lost").await;
            }
            let _ = self.store.runner_drop_job(runner.id, RunnerStatus::Dead).await;
            if !self.is_connected(runner.id).await {
                let _ = self
                    .store
                    .runner_drop_job(runner.id, RunnerStatus::Disconnected)
                    .await;
            }
        }
    }

    // ── Assignment payload helpers ────────────────────────────────────

    /// Repo-defined agents shadow platform agent files of the same name.
    async fn resolve_agent_files(&self, job: &Job) -> Vec<AgentFilePayload> {
        let mut out = Vec::new();
        let default_branch = match self.store.get_repo(job.repo_id).await {
            Ok(Some(repo)) => repo.default_branch,
            _ => "main".to_string(),
        };
        for name in &job.agent_files {
            let repo_asset =
                assets::read_repo_agent(&self.githost, job.repo_id, &default_branch, name)
                    .await
                    .ok()
                    .flatten();
            if let Some(asset) = repo_asset {
                out.push(AgentFilePayload {
                    name: name.clone(),
                    content: asset.content,
                });
                continue;
            }
            match self.store.get_agent_file_by_name(name.clone()).await {
                Ok(Some(file)) => out.push(AgentFilePayload {
                    name: file.name,
                    content: file.content,
                }),
                _ => {
                    tracing::warn!(name = %name, job_id = job.id, "agent file not found; skipping");
                }
            }
        }
        out
    }
}
