//! Pipeline execution engine.
//!
//! One cooperative task per active run advances through steps, dispatches
//! each as a job, interprets routing verbs, and maintains the context
//! directory on the working branch. Step dispatch and routing are
//! strictly sequential within a run.

pub mod context;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::cards::CardService;
use crate::config::{CANCEL_GRACE, Config};
use crate::debugger::{DebugController, GateDecision};
use crate::errors::StoreError;
use crate::events::{Event, RecvError, Topic};
use crate::githost::{GitHost, MergeOutcome};
use crate::queue::{JobQueue, QueuedJob};
use crate::runner::RunnerRegistry;
use crate::store::Store;
use crate::store::models::{
    CardStatus, DebugSession, Job, JobStatus, PipelineRun, RoutingVerb, RunStatus, StepConfig,
};
use self::context::ContextMetadata;

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy)]
enum RunSignal {
    Cancel,
}

enum StepWait {
    Terminal(Job),
    Cancelled,
    TimedOut,
}

enum Routed {
    Continue(usize),
    Terminal(RunStatus, Option<String>),
}

pub struct PipelineEngine {
    store: Store,
    queue: Arc<JobQueue>,
    githost: Arc<GitHost>,
    registry: Arc<RunnerRegistry>,
    debugger: Arc<DebugController>,
    cards: CardService,
    config: Config,
    controls: Mutex<HashMap<i64, mpsc::UnboundedSender<RunSignal>>>,
}

impl PipelineEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        queue: Arc<JobQueue>,
        githost: Arc<GitHost>,
        registry: Arc<RunnerRegistry>,
        debugger: Arc<DebugController>,
        cards: CardService,
        config: Config,
    ) -> Self {
        Self {
            store,
            queue,
            githost,
            registry,
            debugger,
            cards,
            config,
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Launch a run of a stored pipeline and drive it in the background.
    pub async fn start_run(
        self: &Arc<Self>,
        pipeline_id: i64,
        trigger_type: &str,
        trigger_ref: Option<String>,
        trigger_context: serde_json::Value,
        branch: Option<String>,
    ) -> Result<PipelineRun> {
        let run = self
            .create_run_record(pipeline_id, trigger_type, trigger_ref, trigger_context, branch)
            .await?;
        self.spawn_driver(run.id);
        Ok(run)
    }

    /// Replay a finished run with breakpoints. The session is attached
    /// before the driver starts so step 0 breakpoints are honored.
    pub async fn debug_rerun(
        self: &Arc<Self>,
        source_run_id: i64,
        breakpoints: Vec<i64>,
        branch: Option<String>,
        commit_sha: Option<String>,
    ) -> Result<(PipelineRun, DebugSession, String)> {
        let source = self
            .store
            .get_run(source_run_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "pipeline_run",
                id: source_run_id,
            })?;
        let mut trigger_context = source.trigger_context.clone();
        if let serde_json::Value::Object(ref mut map) = trigger_context {
            map.insert("source_run_id".to_string(), serde_json::json!(source_run_id));
            if let Some(sha) = &commit_sha {
                map.insert("commit_sha".to_string(), serde_json::json!(sha));
            }
        }
        let run = self
            .create_run_record(
                source.pipeline_id,
                "debug_rerun",
                source.trigger_ref.clone(),
                trigger_context,
                branch.or(Some(source.branch_name.clone())),
            )
            .await?;
        let (session, token) = self
            .debugger
            .create_session(run.id, breakpoints, None)
            .await?;
        self.spawn_driver(run.id);
        let run = self
            .store
            .get_run(run.id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "pipeline_run",
                id: run.id,
            })?;
        Ok((run, session, token))
    }

    async fn create_run_record(
        &self,
        pipeline_id: i64,
        trigger_type: &str,
        trigger_ref: Option<String>,
        trigger_context: serde_json::Value,
        branch: Option<String>,
    ) -> Result<PipelineRun> {
        let pipeline = self
            .store
            .get_pipeline(pipeline_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "pipeline",
                id: pipeline_id,
            })?;
        let repo = self
            .store
            .get_repo(pipeline.repo_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "repo",
                id: pipeline.repo_id,
            })?;
        let branch = branch.unwrap_or(repo.default_branch);
        let step_names = pipeline.steps.iter().map(|s| s.name.clone()).collect();
        self.store
            .create_run(
                pipeline_id,
                pipeline.repo_id,
                trigger_type.to_string(),
                trigger_ref,
                trigger_context,
                branch,
                step_names,
            )
            .await
    }

    fn spawn_driver(self: &Arc<Self>, run_id: i64) {
        let engine = Arc::clone(self);
        // Boxed: the driver can launch child runs (trigger:pipeline:),
        // which would otherwise make the spawned future type recursive.
        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            Self::drive(engine, run_id).await;
        });
        tokio::spawn(fut);
    }

    /// Cancel a run: short-circuits routing to terminal=cancelled and
    /// cancels the in-flight step job.
    pub async fn cancel(&self, run_id: i64) -> Result<PipelineRun> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "pipeline_run",
                id: run_id,
            })?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let signalled = {
            let controls = self.controls.lock().await;
            controls
                .get(&run_id)
                .map(|tx| tx.send(RunSignal::Cancel).is_ok())
                .unwrap_or(false)
        };
        if !signalled {
            // No driver attached (stale pending row): finish directly.
            return self
                .store
                .run_set_status(run_id, RunStatus::Cancelled, None)
                .await;
        }
        Ok(run)
    }

    // ── Driver ────────────────────────────────────────────────────────

    async fn drive(engine: Arc<Self>, run_id: i64) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut controls = engine.controls.lock().await;
            controls.insert(run_id, tx);
        }
        let outcome = Self::drive_inner(&engine, run_id, &mut rx).await;
        {
            let mut controls = engine.controls.lock().await;
            controls.remove(&run_id);
        }
        if let Err(e) = outcome {
            tracing::error!(run_id, error = %e, "run driver failed");
            let _ = engine
                .store
                .run_set_status(run_id, RunStatus::Failed, Some(e.to_string()))
                .await;
        }
        if let Ok(Some(run)) = engine.store.get_run(run_id).await {
            if let Some(session_id) = run.debug_session_id {
                engine.debugger.drop_channel(session_id).await;
            }
        }
    }

    async fn drive_inner(
        engine: &Arc<Self>,
        run_id: i64,
        rx: &mut mpsc::UnboundedReceiver<RunSignal>,
    ) -> Result<()> {
        let run = engine
            .store
            .get_run(run_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "pipeline_run",
                id: run_id,
            })?;
        let pipeline = engine
            .store
            .get_pipeline(run.pipeline_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "pipeline",
                id: run.pipeline_id,
            })?;
        let steps = pipeline.steps;
        engine
            .store
            .run_set_status(run_id, RunStatus::Running, None)
            .await?;
        tracing::info!(run_id, pipeline_id = pipeline.id, "run started");

        // Overall cap: sum of step timeouts plus 10%.
        let total_secs: u64 = steps
            .iter()
            .map(|s| s.timeout_secs.unwrap_or(engine.config.step_timeout.as_secs()))
            .sum();
        let overall_deadline = Instant::now() + Duration::from_secs(total_secs + total_secs / 10);

        let mut metadata = ContextMetadata {
            run_id,
            steps_completed: 0,
            step_id_map: Default::default(),
        };
        let mut prev_runner: Option<i64> = None;
        let mut completed: i64 = 0;
        let mut index: usize = 0;

        let (terminal, error) = 'run: loop {
            if index >= steps.len() {
                break 'run (RunStatus::Passed, None);
            }
            if Instant::now() > overall_deadline {
                break 'run (RunStatus::Failed, Some("pipeline timeout".to_string()));
            }
            if matches!(rx.try_recv(), Ok(RunSignal::Cancel)) {
                break 'run (RunStatus::Cancelled, None);
            }

            // Debug gate, before dispatch.
            let run = engine
                .store
                .get_run(run_id)
                .await?
                .ok_or(StoreError::NotFound {
                    entity: "pipeline_run",
                    id: run_id,
                })?;
            if engine.debugger.gate(&run, index as i64).await == GateDecision::Abort {
                break 'run (RunStatus::Cancelled, None);
            }

            let step = &steps[index];
            engine
                .store
                .run_progress(run_id, index as i64, completed)
                .await?;

            // Continuation steps pin to the previous step's runner; a lost
            // runner fails the step rather than silently cloning afresh.
            let pinned = if step.continue_in_context {
                let prev_ok = match prev_runner {
                    Some(runner_id) => engine.registry.is_connected(runner_id).await,
                    None => false,
                };
                if !prev_ok {
                    engine
                        .store
                        .step_run_start(run_id, index as i64, None)
                        .await?;
                    engine
                        .store
                        .step_run_finish(
                            run_id,
                            index as i64,
                            RunStatus::Failed,
                            String::new(),
                            Some("continuation runner unavailable".to_string()),
                        )
                        .await?;
                    completed += 1;
                    engine
                        .store
                        .run_progress(run_id, index as i64, completed)
                        .await?;
                    match Self::route(engine, step.on_failure.clone(), run_id, &run, index, false)
                        .await?
                    {
                        Routed::Continue(next) => {
                            index = next;
                            continue 'run;
                        }
                        Routed::Terminal(status, error) => break 'run (status, error),
                    }
                }
                prev_runner
            } else {
                None
            };

            let (prompt, agent_files) = match &step.config {
                StepConfig::Agent {
                    prompt,
                    agent_files,
                } => (prompt.clone(), agent_files.clone()),
                _ => (None, Vec::new()),
            };
            let timeout_secs = step
                .timeout_secs
                .unwrap_or(engine.config.step_timeout.as_secs());
            let job = engine
                .store
                .create_job(
                    run.repo_id,
                    step.runner_type.clone(),
                    step.config.clone(),
                    prompt,
                    agent_files,
                    step.continue_in_context,
                    pinned,
                    false,
                    timeout_secs,
                )
                .await?;
            engine
                .store
                .step_run_start(run_id, index as i64, Some(job.id))
                .await?;

            // Subscribe before enqueueing so the terminal event cannot be
            // missed.
            let mut job_events = engine.store.bus().subscribe(&[Topic::JobChanged]);
            engine
                .queue
                .enqueue(QueuedJob {
                    job_id: job.id,
                    runner_type: job.required_runner_type.clone(),
                    pinned_runner_id: pinned,
                })
                .await;

            let waited = Self::wait_for_job(
                engine,
                &mut job_events,
                rx,
                job.id,
                timeout_secs,
                overall_deadline,
            )
            .await?;
            let final_job = match waited {
                StepWait::Terminal(job) => job,
                StepWait::Cancelled => {
                    let _ = engine.registry.cancel_job(job.id, "cancelled").await;
                    engine
                        .store
                        .step_run_finish(
                            run_id,
                            index as i64,
                            RunStatus::Cancelled,
                            String::new(),
                            Some("cancelled".to_string()),
                        )
                        .await?;
                    completed += 1;
                    engine
                        .store
                        .run_progress(run_id, index as i64, completed)
                        .await?;
                    break 'run (RunStatus::Cancelled, None);
                }
                StepWait::TimedOut => {
                    tracing::warn!(run_id, step = index, job_id = job.id, "step timeout");
                    let _ = engine.registry.cancel_job(job.id, "step timeout").await;
                    match Self::await_terminal(
                        engine,
                        &mut job_events,
                        job.id,
                        CANCEL_GRACE + Duration::from_secs(5),
                    )
                    .await
                    {
                        Some(job) => job,
                        None => engine
                            .store
                            .finish_job(
                                job.id,
                                JobStatus::Failed,
                                Some("step timeout".to_string()),
                                None,
                                None,
                            )
                            .await?
                            .unwrap_or(job),
                    }
                }
            };

            let success = final_job.status == JobStatus::Completed;

            // Context directory: the step's log lands on the working
            // branch; a failed commit never fails the step.
            metadata.record_step(step, index);
            metadata.steps_completed = completed + 1;
            if let Err(e) = context::commit_step(
                &engine.githost,
                run.repo_id,
                &run.branch_name,
                &metadata,
                step,
                index,
                &final_job.logs,
            )
            .await
            {
                tracing::warn!(run_id, step = index, error = %e, "context commit failed");
            }

            engine
                .store
                .step_run_finish(
                    run_id,
                    index as i64,
                    if success {
                        RunStatus::Passed
                    } else {
                        RunStatus::Failed
                    },
                    final_job.logs.clone(),
                    final_job.error.clone(),
                )
                .await?;
            prev_runner = final_job.runner_id;
            completed += 1;
            engine
                .store
                .run_progress(run_id, index as i64, completed)
                .await?;

            let verb = if success {
                step.on_success.clone()
            } else {
                step.on_failure.clone()
            };
            match Self::route(engine, verb, run_id, &run, index, success).await? {
                Routed::Continue(next) => index = next,
                Routed::Terminal(status, error) => break 'run (status, error),
            }
        };

        engine.store.run_set_status(run_id, terminal, error).await?;
        tracing::info!(run_id, status = terminal.as_str(), "run finished");
        Ok(())
    }

    /// Apply a routing verb to a just-completed step.
    async fn route(
        engine: &Arc<Self>,
        verb: RoutingVerb,
        run_id: i64,
        run: &PipelineRun,
        index: usize,
        success: bool,
    ) -> Result<Routed> {
        match verb {
            RoutingVerb::Next => Ok(Routed::Continue(index + 1)),
            RoutingVerb::Stop => {
                if success {
                    Ok(Routed::Terminal(RunStatus::Passed, None))
                } else {
                    Ok(Routed::Terminal(
                        RunStatus::Failed,
                        Some(format!("step {} failed", index)),
                    ))
                }
            }
            RoutingVerb::TriggerCard(card_id) => {
                engine.fire_card(card_id).await;
                Ok(Routed::Continue(index + 1))
            }
            RoutingVerb::TriggerPipeline(pipeline_id) => {
                let result = engine
                    .start_run(
                        pipeline_id,
                        "pipeline",
                        Some(run.branch_name.clone()),
                        run.trigger_context.clone(),
                        Some(run.branch_name.clone()),
                    )
                    .await;
                match result {
                    Ok(child) => {
                        tracing::info!(run_id, child_run = child.id, "child pipeline launched");
                    }
                    Err(e) => {
                        tracing::warn!(run_id, pipeline_id, error = %e, "child launch failed");
                    }
                }
                Ok(Routed::Continue(index + 1))
            }
            RoutingVerb::Merge(target) => {
                // Clean the context directory first so a squash-merge
                // leaves the target branch clean.
                if let Err(e) = engine
                    .githost
                    .remove_context_dir(run.repo_id, &run.branch_name)
                    .await
                {
                    tracing::warn!(run_id, error = %e, "context cleanup before merge failed");
                }
                match engine
                    .githost
                    .merge(run.repo_id, &run.branch_name, &target)
                    .await
                {
                    Ok(MergeOutcome::Conflict { files }) => Ok(Routed::Terminal(
                        RunStatus::Failed,
                        Some(format!(
                            "merge conflict into {}: {}",
                            target,
                            files
                                .iter()
                                .map(|f| f.path.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )),
                    )),
                    Ok(_) => Ok(Routed::Terminal(RunStatus::Passed, None)),
                    Err(e) => Ok(Routed::Terminal(RunStatus::Failed, Some(e.to_string()))),
                }
            }
        }
    }

    /// `trigger:<card>`: start (or retry) a card for AI-fix loops.
    async fn fire_card(&self, card_id: i64) {
        let result = match self.store.get_card(card_id).await {
            Ok(Some(card)) if card.status == CardStatus::Failed => {
                self.cards.retry(card_id, true).await.map(|_| ())
            }
            Ok(Some(_)) => self.cards.start(card_id).await.map(|_| ()),
            Ok(None) => {
                tracing::warn!(card_id, "trigger verb names an unknown card");
                return;
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(card_id, error = %e, "card trigger failed");
        }
    }

    // ── Waiting ───────────────────────────────────────────────────────

    async fn wait_for_job(
        engine: &Arc<Self>,
        events: &mut crate::events::Subscription,
        control: &mut mpsc::UnboundedReceiver<RunSignal>,
        job_id: i64,
        timeout_secs: u64,
        overall_deadline: Instant,
    ) -> Result<StepWait> {
        // The job may already be terminal (fast runner, or queue raced).
        if let Some(job) = engine.store.get_job(job_id).await? {
            if job.status.is_terminal() {
                return Ok(StepWait::Terminal(job));
            }
        }
        let step_deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let deadline = step_deadline.min(overall_deadline);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(StepWait::TimedOut),
                signal = control.recv() => {
                    if matches!(signal, Some(RunSignal::Cancel) | None) {
                        return Ok(StepWait::Cancelled);
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(Event::JobChanged { job, .. })
                            if job.id == job_id && job.status.is_terminal() =>
                        {
                            return Ok(StepWait::Terminal(job));
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged) => {
                            // Missed events; fall back to polling the row.
                            if let Some(job) = engine.store.get_job(job_id).await? {
                                if job.status.is_terminal() {
                                    return Ok(StepWait::Terminal(job));
                                }
                            }
                        }
                        Err(RecvError::Closed) => return Ok(StepWait::Cancelled),
                    }
                }
            }
        }
    }

    async fn await_terminal(
        engine: &Arc<Self>,
        events: &mut crate::events::Subscription,
        job_id: i64,
        window: Duration,
    ) -> Option<Job> {
        let deadline = Instant::now() + window;
        loop {
            if let Ok(Some(job)) = engine.store.get_job(job_id).await {
                if job.status.is_terminal() {
                    return Some(job);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return None,
                event = events.recv() => {
                    if let Ok(Event::JobChanged { job, .. }) = event {
                        if job.id == job_id && job.status.is_terminal() {
                            return Some(job);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::events::EventBus;
    use crate::runner::protocol::{RunnerMessage, ServerMessage};
    use crate::store::db::Db;
    use crate::store::models::{Pipeline, Repo};
    use git2::{Repository, Signature};
    use tempfile::tempdir;

    struct Harness {
        engine: Arc<PipelineEngine>,
        store: Store,
        githost: Arc<GitHost>,
        registry: Arc<RunnerRegistry>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let store = Store::new(Db::open_in_memory().unwrap(), EventBus::new());
        let queue = Arc::new(JobQueue::new());
        let githost = Arc::new(GitHost::new(dir.path().join("git")).unwrap());
        let config = test_config(dir.path());
        let registry = Arc::new(RunnerRegistry::new(
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&githost),
            config.clone(),
        ));
        let debugger = Arc::new(DebugController::new(store.clone()));
        let cards = CardService::new(
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&githost),
            config.clone(),
        );
        let engine = Arc::new(PipelineEngine::new(
            store.clone(),
            queue,
            Arc::clone(&githost),
            Arc::clone(&registry),
            debugger,
            cards,
            config,
        ));
        Harness {
            engine,
            store,
            githost,
            registry,
            _dir: dir,
        }
    }

    async fn seed_repo(h: &Harness) -> Repo {
        let repo = h
            .store
            .create_repo("demo".into(), "main".into(), "http://x".into())
            .await
            .unwrap();
        h.githost.init_bare(repo.id, "main").await.unwrap();
        let git = Repository::open_bare(h.githost.repo_path(repo.id)).unwrap();
        let blob = git.blob(b"hello\n").unwrap();
        let mut builder = git.treebuilder(None).unwrap();
        builder.insert("README.md", blob, 0o100644).unwrap();
        let tree = git.find_tree(builder.write().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test").unwrap();
        git.commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        repo
    }

    async fn pipeline(h: &Harness, repo_id: i64, steps: serde_json::Value) -> Pipeline {
        let steps: Vec<crate::store::models::Step> = serde_json::from_value(steps).unwrap();
        h.store
            .create_pipeline(repo_id, "ci".into(), steps, vec![], false)
            .await
            .unwrap()
    }

    /// A scripted runner: registers, then answers each `run_job` with an
    /// ack and the next outcome from the list.
    async fn scripted_runner(h: &Harness, outcomes: Vec<(JobStatus, Option<&'static str>)>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let runner = h.registry.register("any", None, tx).await.unwrap();
        let registry = Arc::clone(&h.registry);
        tokio::spawn(async move {
            let mut remaining = outcomes.into_iter();
            while let Some(msg) = rx.recv().await {
                if let ServerMessage::RunJob { job_id, .. } = msg {
                    registry
                        .on_message(runner.id, RunnerMessage::JobAck { job_id, accepted: true })
                        .await;
                    registry
                        .on_message(
                            runner.id,
                            RunnerMessage::LogAppend {
                                job_id,
                                chunk: "step output\n".into(),
                                seq: 0,
                            },
                        )
                        .await;
                    let (status, error) = remaining.next().unwrap_or((JobStatus::Completed, None));
                    registry
                        .on_message(
                            runner.id,
                            RunnerMessage::JobResult {
                                job_id,
                                status,
                                error: error.map(|s| s.to_string()),
                                branch_name: None,
                                test_results: None,
                            },
                        )
                        .await;
                }
            }
        });
        // Pump the dispatcher in the background too.
        let registry = Arc::clone(&h.registry);
        tokio::spawn(async move {
            loop {
                registry.run_dispatch_tick().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
    }

    async fn wait_terminal(h: &Harness, run_id: i64) -> PipelineRun {
        for _ in 0..600 {
            let run = h.store.get_run(run_id).await.unwrap().unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} did not finish", run_id);
    }

    #[tokio::test]
    async fn run_passes_through_all_steps() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        let p = pipeline(
            &h,
            repo.id,
            serde_json::json!([
                {"name": "lint", "kind": "script", "command": "true"},
                {"name": "test", "kind": "script", "command": "true"}
            ]),
        )
        .await;
        scripted_runner(&h, vec![(JobStatus::Completed, None), (JobStatus::Completed, None)])
            .await;

        let run = h
            .engine
            .start_run(p.id, "manual", None, serde_json::json!({}), None)
            .await
            .unwrap();
        let run = wait_terminal(&h, run.id).await;
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.steps_completed, 2);
        assert_eq!(run.steps_total, 2);

        let steps = h.store.list_step_runs(run.id).await.unwrap();
        assert!(steps.iter().all(|s| s.status == RunStatus::Passed));
        assert!(steps.iter().all(|s| s.logs.contains("step output")));

        // Context directory committed on the working branch.
        let metadata = h
            .githost
            .read_branch_file(repo.id, "main", &ContextMetadata::path())
            .await
            .unwrap();
        let metadata: ContextMetadata =
            serde_json::from_str(&metadata.unwrap()).unwrap();
        assert_eq!(metadata.run_id, run.id);
        assert_eq!(metadata.steps_completed, 2);
    }

    #[tokio::test]
    async fn stop_on_failure_fails_run() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        let p = pipeline(
            &h,
            repo.id,
            serde_json::json!([
                {"name": "lint", "kind": "script", "command": "true", "on_failure": "stop"},
                {"name": "never", "kind": "script", "command": "true"}
            ]),
        )
        .await;
        scripted_runner(&h, vec![(JobStatus::Failed, Some("lint errors"))]).await;

        let run = h
            .engine
            .start_run(p.id, "manual", None, serde_json::json!({}), None)
            .await
            .unwrap();
        let run = wait_terminal(&h, run.id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps_completed, 1);
        let steps = h.store.list_step_runs(run.id).await.unwrap();
        assert_eq!(steps[0].status, RunStatus::Failed);
        assert_eq!(steps[1].status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn failure_route_can_continue_and_launch_child() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        let fix = pipeline(
            &h,
            repo.id,
            serde_json::json!([
                {"name": "fix", "kind": "script", "command": "true"}
            ]),
        )
        .await;
        let p = pipeline(
            &h,
            repo.id,
            serde_json::json!([
                {"name": "lint", "kind": "script", "command": "true",
                 "on_failure": format!("trigger:pipeline:{}", fix.id)},
                {"name": "test", "kind": "script", "command": "true"}
            ]),
        )
        .await;
        // lint fails, child fix passes, test passes.
        scripted_runner(
            &h,
            vec![
                (JobStatus::Failed, Some("lint errors")),
                (JobStatus::Completed, None),
                (JobStatus::Completed, None),
            ],
        )
        .await;

        let run = h
            .engine
            .start_run(p.id, "manual", None, serde_json::json!({}), None)
            .await
            .unwrap();
        let run = wait_terminal(&h, run.id).await;
        assert_eq!(run.status, RunStatus::Passed);
        let steps = h.store.list_step_runs(run.id).await.unwrap();
        assert_eq!(steps[0].status, RunStatus::Failed);
        assert_eq!(steps[1].status, RunStatus::Passed);

        // The child run exists and reaches a terminal state too.
        let runs = h.store.list_runs(Some(fix.id)).await.unwrap();
        assert_eq!(runs.len(), 1);
        let child = wait_terminal(&h, runs[0].id).await;
        assert_eq!(child.trigger_type, "pipeline");
        assert_eq!(child.status, RunStatus::Passed);
    }

    #[tokio::test]
    async fn merge_verb_merges_and_passes() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        h.githost.ensure_branch(repo.id, "work", "main").await.unwrap();
        h.githost
            .commit_files(repo.id, "work", vec![("w.txt".into(), "w\n".into())], "work")
            .await
            .unwrap();
        let p = pipeline(
            &h,
            repo.id,
            serde_json::json!([
                {"name": "test", "kind": "script", "command": "true",
                 "on_success": "merge:main"}
            ]),
        )
        .await;
        scripted_runner(&h, vec![(JobStatus::Completed, None)]).await;

        let run = h
            .engine
            .start_run(p.id, "manual", None, serde_json::json!({}), Some("work".into()))
            .await
            .unwrap();
        let run = wait_terminal(&h, run.id).await;
        assert_eq!(run.status, RunStatus::Passed);

        // Work landed on main, and the context directory did not.
        assert!(
            h.githost
                .read_branch_file(repo.id, "main", "w.txt")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            h.githost
                .read_branch_file(repo.id, "main", &ContextMetadata::path())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn cancel_short_circuits_to_cancelled() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        let p = pipeline(
            &h,
            repo.id,
            serde_json::json!([
                {"name": "forever", "kind": "script", "command": "sleep"}
            ]),
        )
        .await;
        // No runner: the step job just sits queued.
        let run = h
            .engine
            .start_run(p.id, "manual", None, serde_json::json!({}), None)
            .await
            .unwrap();
        // Give the driver a moment to enter the wait.
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.engine.cancel(run.id).await.unwrap();
        let run = wait_terminal(&h, run.id).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        let steps = h.store.list_step_runs(run.id).await.unwrap();
        assert_eq!(steps[0].status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn continuation_without_previous_runner_fails_step() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        // Continuation on step 1, but the step-0 runner disconnects first.
        let p = pipeline(
            &h,
            repo.id,
            serde_json::json!([
                {"name": "build", "kind": "script", "command": "true"},
                {"name": "reuse", "kind": "script", "command": "true",
                 "continue_in_context": true, "on_failure": "stop"}
            ]),
        )
        .await;

        // One-shot runner that detaches after the first job.
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let runner = h.registry.register("any", None, tx).await.unwrap();
        let registry = Arc::clone(&h.registry);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let ServerMessage::RunJob { job_id, .. } = msg {
                    registry
                        .on_message(runner.id, RunnerMessage::JobAck { job_id, accepted: true })
                        .await;
                    registry
                        .on_message(
                            runner.id,
                            RunnerMessage::JobResult {
                                job_id,
                                status: JobStatus::Completed,
                                error: None,
                                branch_name: None,
                                test_results: None,
                            },
                        )
                        .await;
                    registry.detach(runner.id).await;
                    break;
                }
            }
        });
        let registry = Arc::clone(&h.registry);
        tokio::spawn(async move {
            loop {
                registry.run_dispatch_tick().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let run = h
            .engine
            .start_run(p.id, "manual", None, serde_json::json!({}), None)
            .await
            .unwrap();
        let run = wait_terminal(&h, run.id).await;
        assert_eq!(run.status, RunStatus::Failed);
        let steps = h.store.list_step_runs(run.id).await.unwrap();
        assert_eq!(steps[0].status, RunStatus::Passed);
        assert_eq!(steps[1].status, RunStatus::Failed);
        assert_eq!(
            steps[1].error.as_deref(),
            Some("continuation runner unavailable")
        );
    }

    #[tokio::test]
    async fn debug_rerun_pauses_and_aborts() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        let p = pipeline(
            &h,
            repo.id,
            serde_json::json!([
                {"name": "one", "kind": "script", "command": "true"},
                {"name": "two", "kind": "script", "command": "true"}
            ]),
        )
        .await;
        scripted_runner(&h, vec![(JobStatus::Completed, None), (JobStatus::Completed, None)])
            .await;

        // A finished source run to replay.
        let source = h
            .engine
            .start_run(p.id, "manual", None, serde_json::json!({}), None)
            .await
            .unwrap();
        wait_terminal(&h, source.id).await;

        let mut debug_events = h
            .store
            .bus()
            .subscribe(&[Topic::DebugBreakpoint, Topic::DebugResume]);

        let (rerun, session, token) = h
            .engine
            .debug_rerun(source.id, vec![0, 1], None, None)
            .await
            .unwrap();
        assert!(!token.is_empty());
        assert_eq!(rerun.debug_session_id, Some(session.id));
        assert_eq!(rerun.trigger_type, "debug_rerun");

        // Paused before step 0.
        let event = debug_events.recv().await.unwrap();
        assert!(matches!(event, Event::DebugBreakpoint { step_index: 0, .. }));

        // Resume: step 0 runs, then pause before step 1.
        h.engine.debugger.resume(session.id).await.unwrap();
        let event = debug_events.recv().await.unwrap();
        assert!(matches!(event, Event::DebugResume { step_index: 0, .. }));
        let event = debug_events.recv().await.unwrap();
        assert!(matches!(event, Event::DebugBreakpoint { step_index: 1, .. }));

        // Abort at the second breakpoint.
        h.engine.debugger.abort(session.id).await.unwrap();
        let run = wait_terminal(&h, rerun.id).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        let session = h
            .store
            .get_debug_session(session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, crate::store::models::DebugStatus::Ended);
    }
}
