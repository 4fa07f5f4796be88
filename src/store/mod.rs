//! Durable entities and transactional transitions.
//!
//! `Store` is the only component permitted to write entity rows. Every
//! successful mutation emits exactly one change event to the bus, after
//! the commit. Reads go straight through.

pub mod db;
pub mod models;

use crate::errors::StoreError;
use crate::events::{Event, EventBus};
use self::db::{Db, DbHandle, RecoveryReport};
use self::models::*;

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    db: DbHandle,
    bus: EventBus,
}

impl Store {
    pub fn new(db: Db, bus: EventBus) -> Self {
        Self {
            db: DbHandle::new(db),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }

    // ── Repos ─────────────────────────────────────────────────────────

    pub async fn create_repo(
        &self,
        name: String,
        default_branch: String,
        base_url: String,
    ) -> Result<Repo> {
        self.db
            .call(move |db| {
                let repo = db.create_repo(&name, &default_branch)?;
                let url = format!("{}/git/{}.git", base_url.trim_end_matches('/'), repo.id);
                db.set_repo_clone_url(repo.id, &url)
            })
            .await
    }

    pub async fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        self.db.call(move |db| db.get_repo(id)).await
    }

    pub async fn list_repos(&self) -> Result<Vec<Repo>> {
        self.db.call(|db| db.list_repos()).await
    }

    pub async fn delete_repo(&self, id: i64) -> Result<bool> {
        self.db.call(move |db| db.delete_repo(id)).await
    }

    pub async fn mark_ingested(&self, id: i64) -> Result<Repo> {
        self.db.call(move |db| db.mark_ingested(id)).await
    }

    // ── Cards ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_card(
        &self,
        repo_id: i64,
        title: String,
        description: String,
        runner_type: String,
        step: StepConfig,
        pipeline_run_id: Option<i64>,
        step_index: Option<i64>,
    ) -> Result<Card> {
        let card = self
            .db
            .call(move |db| {
                db.create_card(
                    repo_id,
                    &title,
                    &description,
                    &runner_type,
                    &step,
                    pipeline_run_id,
                    step_index,
                )
            })
            .await?;
        self.bus.publish(Event::CardChanged { card: card.clone() });
        Ok(card)
    }

    pub async fn get_card(&self, id: i64) -> Result<Option<Card>> {
        self.db.call(move |db| db.get_card(id)).await
    }

    pub async fn list_cards(
        &self,
        repo_id: Option<i64>,
        status: Option<CardStatus>,
    ) -> Result<Vec<Card>> {
        self.db.call(move |db| db.list_cards(repo_id, status)).await
    }

    pub async fn update_card(
        &self,
        id: i64,
        title: Option<String>,
        description: Option<String>,
        runner_type: Option<String>,
        step: Option<StepConfig>,
    ) -> Result<Card> {
        let card = self
            .db
            .call(move |db| {
                db.update_card_fields(
                    id,
                    title.as_deref(),
                    description.as_deref(),
                    runner_type.as_deref(),
                    step.as_ref(),
                )
            })
            .await?;
        self.bus.publish(Event::CardChanged { card: card.clone() });
        Ok(card)
    }

    pub async fn delete_card(&self, id: i64) -> Result<bool> {
        self.db.call(move |db| db.delete_card(id)).await
    }

    pub async fn card_transition(
        &self,
        id: i64,
        from: CardStatus,
        to: CardStatus,
    ) -> Result<Card> {
        let card = self
            .db
            .call(move |db| db.card_transition(id, from, to))
            .await?;
        self.bus.publish(Event::CardChanged { card: card.clone() });
        Ok(card)
    }

    /// Single-write consumption of a job outcome. `None` means the result
    /// was stale and nothing changed (no event either).
    pub async fn card_apply_job_result(
        &self,
        card_id: i64,
        job_id: i64,
        to: CardStatus,
        branch: Option<String>,
    ) -> Result<Option<Card>> {
        let card = self
            .db
            .call(move |db| db.card_apply_job_result(card_id, job_id, to, branch.as_deref()))
            .await?;
        if let Some(ref card) = card {
            self.bus.publish(Event::CardChanged { card: card.clone() });
        }
        Ok(card)
    }

    pub async fn card_set_conflict(
        &self,
        id: i64,
        conflict: Option<serde_json::Value>,
    ) -> Result<Card> {
        let card = self
            .db
            .call(move |db| db.card_set_conflict(id, conflict.as_ref()))
            .await?;
        self.bus.publish(Event::CardChanged { card: card.clone() });
        Ok(card)
    }

    pub async fn card_set_branch(&self, id: i64, branch: String) -> Result<Card> {
        let card = self
            .db
            .call(move |db| db.card_set_branch(id, &branch))
            .await?;
        self.bus.publish(Event::CardChanged { card: card.clone() });
        Ok(card)
    }

    /// Snapshot + enqueue transition: card to `in_progress`, new queued job.
    pub async fn start_card(&self, id: i64, deadline_secs: u64) -> Result<(Card, Job)> {
        let (card, job) = self
            .db
            .call(move |db| db.start_card(id, deadline_secs))
            .await?;
        self.bus.publish(Event::CardChanged { card: card.clone() });
        self.bus.publish(Event::JobChanged {
            job: job.clone(),
            log_delta: None,
        });
        Ok((card, job))
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_job(
        &self,
        repo_id: i64,
        required_runner_type: String,
        step: StepConfig,
        prompt: Option<String>,
        agent_files: Vec<String>,
        continuation: bool,
        pinned_runner_id: Option<i64>,
        ephemeral: bool,
        deadline_secs: u64,
    ) -> Result<Job> {
        let job = self
            .db
            .call(move |db| {
                db.create_job(
                    repo_id,
                    &required_runner_type,
                    &step,
                    prompt.as_deref(),
                    &agent_files,
                    continuation,
                    pinned_runner_id,
                    ephemeral,
                    deadline_secs,
                )
            })
            .await?;
        self.bus.publish(Event::JobChanged {
            job: job.clone(),
            log_delta: None,
        });
        Ok(job)
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        self.db.call(move |db| db.get_job(id)).await
    }

    pub async fn list_jobs_for_card(&self, card_id: i64) -> Result<Vec<Job>> {
        self.db.call(move |db| db.list_jobs_for_card(card_id)).await
    }

    pub async fn queued_job_ids(&self) -> Result<Vec<(i64, String)>> {
        self.db.call(|db| db.queued_job_ids()).await
    }

    /// Append a log chunk. Terminal jobs are frozen; the append is dropped
    /// with a warning and no event.
    pub async fn append_job_logs(&self, id: i64, chunk: String) -> Result<Job> {
        let delta = chunk.clone();
        let (job, appended) = self
            .db
            .call(move |db| db.append_job_logs(id, &chunk))
            .await?;
        if appended {
            self.bus.publish(Event::JobChanged {
                job: job.clone(),
                log_delta: Some(delta),
            });
        } else {
            tracing::warn!(job_id = id, "log append after terminal state dropped");
        }
        Ok(job)
    }

    pub async fn claim_job(&self, job_id: i64, runner_id: i64) -> Result<(Job, Runner)> {
        let (job, runner) = self
            .db
            .call(move |db| db.claim_job(job_id, runner_id))
            .await?;
        self.bus.publish(Event::JobChanged {
            job: job.clone(),
            log_delta: None,
        });
        self.bus.publish(Event::RunnerChanged {
            runner: runner.clone(),
        });
        Ok((job, runner))
    }

    pub async fn release_job(&self, job_id: i64, runner_id: i64) -> Result<(Job, Runner)> {
        let (job, runner) = self
            .db
            .call(move |db| db.release_job(job_id, runner_id))
            .await?;
        self.bus.publish(Event::JobChanged {
            job: job.clone(),
            log_delta: None,
        });
        self.bus.publish(Event::RunnerChanged {
            runner: runner.clone(),
        });
        Ok((job, runner))
    }

    /// Terminal transition; duplicates after terminal are ignored with a
    /// warning and return `None`.
    pub async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<String>,
        branch_name: Option<String>,
        test_results: Option<TestResults>,
    ) -> Result<Option<Job>> {
        let job = self
            .db
            .call(move |db| {
                db.finish_job(
                    id,
                    status,
                    error.as_deref(),
                    branch_name.as_deref(),
                    test_results.as_ref(),
                )
            })
            .await?;
        match job {
            Some(job) => {
                self.bus.publish(Event::JobChanged {
                    job: job.clone(),
                    log_delta: None,
                });
                Ok(Some(job))
            }
            None => {
                tracing::warn!(job_id = id, "duplicate terminal job result ignored");
                Ok(None)
            }
        }
    }

    // ── Runners ───────────────────────────────────────────────────────

    pub async fn register_runner(&self, runner_type: String) -> Result<Runner> {
        let runner = self
            .db
            .call(move |db| db.insert_runner(&runner_type))
            .await?;
        self.bus.publish(Event::RunnerChanged {
            runner: runner.clone(),
        });
        Ok(runner)
    }

    pub async fn get_runner(&self, id: i64) -> Result<Option<Runner>> {
        self.db.call(move |db| db.get_runner(id)).await
    }

    pub async fn list_runners(&self) -> Result<Vec<Runner>> {
        self.db.call(|db| db.list_runners()).await
    }

    pub async fn runner_set_status(&self, id: i64, status: RunnerStatus) -> Result<Runner> {
        let runner = self
            .db
            .call(move |db| db.runner_set_status(id, status))
            .await?;
        self.bus.publish(Event::RunnerChanged {
            runner: runner.clone(),
        });
        Ok(runner)
    }

    pub async fn runner_heartbeat(&self, id: i64) -> Result<Runner> {
        let runner = self.db.call(move |db| db.runner_heartbeat(id)).await?;
        self.bus.publish(Event::RunnerChanged {
            runner: runner.clone(),
        });
        Ok(runner)
    }

    pub async fn runner_finish_job(&self, id: i64) -> Result<Runner> {
        let runner = self.db.call(move |db| db.runner_finish_job(id)).await?;
        self.bus.publish(Event::RunnerChanged {
            runner: runner.clone(),
        });
        Ok(runner)
    }

    pub async fn runner_drop_job(&self, id: i64, status: RunnerStatus) -> Result<Runner> {
        let runner = self
            .db
            .call(move |db| db.runner_drop_job(id, status))
            .await?;
        self.bus.publish(Event::RunnerChanged {
            runner: runner.clone(),
        });
        Ok(runner)
    }

    pub async fn oldest_idle_runner(&self, runner_type: String) -> Result<Option<Runner>> {
        self.db
            .call(move |db| db.oldest_idle_runner(&runner_type))
            .await
    }

    pub async fn stale_runners(&self, cutoff_epoch: i64) -> Result<Vec<Runner>> {
        self.db
            .call(move |db| db.stale_runners(cutoff_epoch))
            .await
    }

    // ── Pipelines ─────────────────────────────────────────────────────

    pub async fn create_pipeline(
        &self,
        repo_id: i64,
        name: String,
        steps: Vec<Step>,
        triggers: Vec<TriggerDef>,
        is_template: bool,
    ) -> Result<Pipeline> {
        validate_pipeline(&steps, &triggers).map_err(StoreError::Validation)?;
        self.db
            .call(move |db| db.create_pipeline(repo_id, &name, &steps, &triggers, is_template))
            .await
    }

    pub async fn update_pipeline(
        &self,
        id: i64,
        name: String,
        steps: Vec<Step>,
        triggers: Vec<TriggerDef>,
    ) -> Result<Pipeline> {
        validate_pipeline(&steps, &triggers).map_err(StoreError::Validation)?;
        self.db
            .call(move |db| db.update_pipeline(id, &name, &steps, &triggers))
            .await
    }

    pub async fn get_pipeline(&self, id: i64) -> Result<Option<Pipeline>> {
        self.db.call(move |db| db.get_pipeline(id)).await
    }

    pub async fn list_pipelines(&self, repo_id: Option<i64>) -> Result<Vec<Pipeline>> {
        self.db.call(move |db| db.list_pipelines(repo_id)).await
    }

    pub async fn delete_pipeline(&self, id: i64) -> Result<bool> {
        self.db.call(move |db| db.delete_pipeline(id)).await
    }

    // ── Pipeline runs ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_run(
        &self,
        pipeline_id: i64,
        repo_id: i64,
        trigger_type: String,
        trigger_ref: Option<String>,
        trigger_context: serde_json::Value,
        branch_name: String,
        step_names: Vec<String>,
    ) -> Result<PipelineRun> {
        let run = self
            .db
            .call(move |db| {
                db.create_run(
                    pipeline_id,
                    repo_id,
                    &trigger_type,
                    trigger_ref.as_deref(),
                    &trigger_context,
                    &branch_name,
                    &step_names,
                )
            })
            .await?;
        self.bus.publish(Event::RunChanged { run: run.clone() });
        Ok(run)
    }

    pub async fn get_run(&self, id: i64) -> Result<Option<PipelineRun>> {
        self.db.call(move |db| db.get_run(id)).await
    }

    pub async fn list_runs(&self, pipeline_id: Option<i64>) -> Result<Vec<PipelineRun>> {
        self.db.call(move |db| db.list_runs(pipeline_id)).await
    }

    pub async fn run_set_status(
        &self,
        id: i64,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<PipelineRun> {
        let run = self
            .db
            .call(move |db| db.run_set_status(id, status, error.as_deref()))
            .await?;
        self.bus.publish(Event::RunChanged { run: run.clone() });
        Ok(run)
    }

    pub async fn run_progress(
        &self,
        id: i64,
        current_step: i64,
        steps_completed: i64,
    ) -> Result<PipelineRun> {
        let run = self
            .db
            .call(move |db| db.run_progress(id, current_step, steps_completed))
            .await?;
        self.bus.publish(Event::RunChanged { run: run.clone() });
        Ok(run)
    }

    pub async fn run_attach_debug(&self, id: i64, session_id: i64) -> Result<PipelineRun> {
        let run = self
            .db
            .call(move |db| db.run_attach_debug(id, session_id))
            .await?;
        self.bus.publish(Event::RunChanged { run: run.clone() });
        Ok(run)
    }

    // ── Step runs ─────────────────────────────────────────────────────

    pub async fn get_step_run(&self, run_id: i64, step_index: i64) -> Result<Option<StepRun>> {
        self.db
            .call(move |db| db.get_step_run(run_id, step_index))
            .await
    }

    pub async fn list_step_runs(&self, run_id: i64) -> Result<Vec<StepRun>> {
        self.db.call(move |db| db.list_step_runs(run_id)).await
    }

    pub async fn step_run_start(
        &self,
        run_id: i64,
        step_index: i64,
        job_id: Option<i64>,
    ) -> Result<StepRun> {
        let step = self
            .db
            .call(move |db| db.step_run_start(run_id, step_index, job_id))
            .await?;
        self.bus.publish(Event::StepChanged { step: step.clone() });
        Ok(step)
    }

    pub async fn step_run_finish(
        &self,
        run_id: i64,
        step_index: i64,
        status: RunStatus,
        logs: String,
        error: Option<String>,
    ) -> Result<StepRun> {
        let step = self
            .db
            .call(move |db| db.step_run_finish(run_id, step_index, status, &logs, error.as_deref()))
            .await?;
        self.bus.publish(Event::StepChanged { step: step.clone() });
        Ok(step)
    }

    // ── Agent files ───────────────────────────────────────────────────

    pub async fn create_agent_file(
        &self,
        name: String,
        description: String,
        content: String,
    ) -> Result<AgentFile> {
        validate_slug(&name).map_err(StoreError::Validation)?;
        self.db
            .call(move |db| db.create_agent_file(&name, &description, &content))
            .await
    }

    pub async fn get_agent_file(&self, id: i64) -> Result<Option<AgentFile>> {
        self.db.call(move |db| db.get_agent_file(id)).await
    }

    pub async fn get_agent_file_by_name(&self, name: String) -> Result<Option<AgentFile>> {
        self.db
            .call(move |db| db.get_agent_file_by_name(&name))
            .await
    }

    pub async fn list_agent_files(&self) -> Result<Vec<AgentFile>> {
        self.db.call(|db| db.list_agent_files()).await
    }

    pub async fn update_agent_file(
        &self,
        id: i64,
        description: Option<String>,
        content: Option<String>,
    ) -> Result<AgentFile> {
        self.db
            .call(move |db| db.update_agent_file(id, description.as_deref(), content.as_deref()))
            .await
    }

    pub async fn delete_agent_file(&self, id: i64) -> Result<bool> {
        self.db.call(move |db| db.delete_agent_file(id)).await
    }

    // ── Debug sessions ────────────────────────────────────────────────

    pub async fn create_debug_session(
        &self,
        run_id: i64,
        breakpoints: Vec<i64>,
        token: String,
        expires_at: i64,
    ) -> Result<DebugSession> {
        self.db
            .call(move |db| db.create_debug_session(run_id, &breakpoints, &token, expires_at))
            .await
    }

    pub async fn get_debug_session(&self, id: i64) -> Result<Option<DebugSession>> {
        self.db.call(move |db| db.get_debug_session(id)).await
    }

    pub async fn debug_set_status(
        &self,
        id: i64,
        status: DebugStatus,
        current_step: Option<i64>,
    ) -> Result<DebugSession> {
        self.db
            .call(move |db| db.debug_set_status(id, status, current_step))
            .await
    }

    pub async fn debug_take_token(&self, id: i64, token: String) -> Result<bool> {
        self.db
            .call(move |db| db.debug_take_token(id, &token))
            .await
    }

    pub async fn expired_debug_sessions(&self, now: i64) -> Result<Vec<DebugSession>> {
        self.db
            .call(move |db| db.expired_debug_sessions(now))
            .await
    }

    // ── Startup ───────────────────────────────────────────────────────

    /// Orphan recovery, run before the server accepts traffic.
    pub async fn recover_startup(&self) -> Result<RecoveryReport> {
        let report = self.db.call(|db| db.recover_startup()).await?;
        for job in &report.failed_jobs {
            tracing::warn!(job_id = job.id, "orphaned job failed at startup");
            self.bus.publish(Event::JobChanged {
                job: job.clone(),
                log_delta: None,
            });
        }
        for card in &report.failed_cards {
            self.bus.publish(Event::CardChanged { card: card.clone() });
        }
        for run in &report.failed_runs {
            tracing::warn!(run_id = run.id, "orphaned pipeline run failed at startup");
            self.bus.publish(Event::RunChanged { run: run.clone() });
        }
        for runner in &report.reset_runners {
            self.bus.publish(Event::RunnerChanged {
                runner: runner.clone(),
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;

    fn script_step() -> StepConfig {
        StepConfig::Script {
            command: "echo hi".to_string(),
            workdir: None,
        }
    }

    async fn test_store() -> Store {
        let db = Db::open_in_memory().unwrap();
        Store::new(db, EventBus::new())
    }

    #[tokio::test]
    async fn create_repo_derives_clone_url_from_id() {
        let store = test_store().await;
        let repo = store
            .create_repo(
                "demo".into(),
                "main".into(),
                "http://127.0.0.1:7070".into(),
            )
            .await
            .unwrap();
        assert_eq!(repo.clone_url, format!("http://127.0.0.1:7070/git/{}.git", repo.id));
    }

    #[tokio::test]
    async fn mutations_emit_exactly_one_event_after_commit() {
        let store = test_store().await;
        let mut sub = store.bus().subscribe(&[Topic::CardChanged]);
        let repo = store
            .create_repo("demo".into(), "main".into(), "http://x".into())
            .await
            .unwrap();
        let card = store
            .create_card(repo.id, "t".into(), "".into(), "any".into(), script_step(), None, None)
            .await
            .unwrap();
        let event = sub.recv().await.unwrap();
        match event {
            Event::CardChanged { card: c } => assert_eq!(c.id, card.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_finish_emits_no_event() {
        let store = test_store().await;
        let repo = store
            .create_repo("demo".into(), "main".into(), "http://x".into())
            .await
            .unwrap();
        let card = store
            .create_card(repo.id, "t".into(), "".into(), "any".into(), script_step(), None, None)
            .await
            .unwrap();
        let (_, job) = store.start_card(card.id, 300).await.unwrap();

        let first = store
            .finish_job(job.id, JobStatus::Completed, None, None, None)
            .await
            .unwrap();
        assert!(first.is_some());

        let mut sub = store.bus().subscribe(&[Topic::JobChanged]);
        let dup = store
            .finish_job(job.id, JobStatus::Failed, Some("late".into()), None, None)
            .await
            .unwrap();
        assert!(dup.is_none());
        // Nothing should arrive for the duplicate.
        let got = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn pipeline_validation_rejected_at_save() {
        let store = test_store().await;
        let repo = store
            .create_repo("demo".into(), "main".into(), "http://x".into())
            .await
            .unwrap();
        let err = store
            .create_pipeline(repo.id, "empty".into(), vec![], vec![], false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }
}
