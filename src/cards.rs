//! Card lifecycle: start/approve/reject/retry plus the job-outcome
//! consumer. Transitions are serialized per card.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::errors::StoreError;
use crate::events::{Event, Topic};
use crate::githost::{GitHost, MergeOutcome};
use crate::queue::{JobQueue, QueuedJob};
use crate::store::Store;
use crate::store::models::{Card, CardStatus, Job, JobStatus, StepConfig};

type Result<T> = std::result::Result<T, StoreError>;

/// Result of `approve`. A conflict leaves the card untouched.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApproveOutcome {
    Done { card: Card },
    Conflict { card: Card, merge: MergeOutcome },
}

#[derive(Clone)]
pub struct CardService {
    store: Store,
    queue: Arc<JobQueue>,
    githost: Arc<GitHost>,
    config: Config,
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl CardService {
    pub fn new(store: Store, queue: Arc<JobQueue>, githost: Arc<GitHost>, config: Config) -> Self {
        Self {
            store,
            queue,
            githost,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn card_lock(&self, card_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(card_id).or_default())
    }

    pub async fn create(
        &self,
        repo_id: i64,
        title: String,
        description: String,
        runner_type: String,
        step: StepConfig,
    ) -> Result<Card> {
        step.validate().map_err(StoreError::Validation)?;
        if self.store.get_repo(repo_id).await?.is_none() {
            return Err(StoreError::NotFound {
                entity: "repo",
                id: repo_id,
            });
        }
        self.store
            .create_card(repo_id, title, description, runner_type, step, None, None)
            .await
    }

    /// Snapshot the card into a job and enqueue it. Succeeds even when no
    /// runner is connected; the job waits in the queue.
    pub async fn start(&self, card_id: i64) -> Result<(Card, Job)> {
        let lock = self.card_lock(card_id).await;
        let _guard = lock.lock().await;
        let (card, job) = self
            .store
            .start_card(card_id, self.config.step_timeout.as_secs())
            .await?;
        self.queue
            .enqueue(QueuedJob {
                job_id: job.id,
                runner_type: job.required_runner_type.clone(),
                pinned_runner_id: None,
            })
            .await;
        tracing::info!(card_id, job_id = job.id, "card started");
        Ok((card, job))
    }

    /// Merge the result branch into `target` (repo default when absent).
    /// Idempotent once the card is `done`.
    pub async fn approve(&self, card_id: i64, target: Option<String>) -> Result<ApproveOutcome> {
        let lock = self.card_lock(card_id).await;
        let _guard = lock.lock().await;

        let card = self
            .store
            .get_card(card_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "card",
                id: card_id,
            })?;

        if card.status == CardStatus::Done {
            return Ok(ApproveOutcome::Done { card });
        }
        if card.status != CardStatus::InReview {
            return Err(StoreError::InvalidTransition {
                entity: "card",
                from: card.status.as_str().to_string(),
                to: CardStatus::Done.as_str().to_string(),
            });
        }
        let branch = card
            .branch_name
            .clone()
            .ok_or_else(|| StoreError::Validation("card has no result branch".to_string()))?;

        let repo = self
            .store
            .get_repo(card.repo_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "repo",
                id: card.repo_id,
            })?;
        let target = target.unwrap_or(repo.default_branch);

        let outcome = self
            .githost
            .merge(card.repo_id, &branch, &target)
            .await
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        if outcome.is_conflict() {
            let record = serde_json::to_value(&outcome)
                .map_err(|e| StoreError::Database(e.into()))?;
            let card = self.store.card_set_conflict(card_id, Some(record)).await?;
            return Ok(ApproveOutcome::Conflict {
                card,
                merge: outcome,
            });
        }

        let _ = self.store.card_set_conflict(card_id, None).await?;
        let card = self
            .store
            .card_transition(card_id, CardStatus::InReview, CardStatus::Done)
            .await?;
        tracing::info!(card_id, into = %target, "card approved and merged");
        Ok(ApproveOutcome::Done { card })
    }

    /// Back to `todo`; the result branch is left in place.
    pub async fn reject(&self, card_id: i64) -> Result<Card> {
        let lock = self.card_lock(card_id).await;
        let _guard = lock.lock().await;
        self.store
            .card_transition(card_id, CardStatus::InReview, CardStatus::Todo)
            .await
    }

    /// `failed → todo`, optionally starting right away.
    pub async fn retry(&self, card_id: i64, auto: bool) -> Result<Card> {
        {
            let lock = self.card_lock(card_id).await;
            let _guard = lock.lock().await;
            self.store
                .card_transition(card_id, CardStatus::Failed, CardStatus::Todo)
                .await?;
        }
        if auto {
            let (card, _) = self.start(card_id).await?;
            return Ok(card);
        }
        self.store
            .get_card(card_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "card",
                id: card_id,
            })
    }

    /// Consume one terminal job outcome for its card.
    pub async fn on_job_result(&self, job: &Job) {
        let Some(card_id) = job.card_id else {
            return;
        };
        if job.ephemeral || !job.status.is_terminal() {
            return;
        }
        let lock = self.card_lock(card_id).await;
        let _guard = lock.lock().await;

        let to = match job.status {
            JobStatus::Completed => match &job.branch_name {
                Some(_) => CardStatus::InReview,
                None => {
                    let tests_ok = job
                        .test_results
                        .map(|t| t.all_passed())
                        .unwrap_or(true);
                    if tests_ok {
                        CardStatus::Done
                    } else {
                        CardStatus::Failed
                    }
                }
            },
            JobStatus::Failed => CardStatus::Failed,
            _ => return,
        };

        match self
            .store
            .card_apply_job_result(card_id, job.id, to, job.branch_name.clone())
            .await
        {
            Ok(Some(card)) => {
                tracing::info!(card_id, status = card.status.as_str(), "card consumed job result");
            }
            Ok(None) => {
                tracing::debug!(card_id, job_id = job.id, "stale job result for card");
            }
            Err(e) => {
                tracing::error!(card_id, job_id = job.id, error = %e, "card update failed");
            }
        }
    }

    /// Long-lived consumer wiring job outcomes to card transitions.
    pub async fn run_job_watcher(self) {
        let mut sub = self.store.bus().subscribe(&[Topic::JobChanged]);
        loop {
            match sub.recv().await {
                Ok(Event::JobChanged { job, log_delta }) => {
                    if log_delta.is_none() && job.status.is_terminal() {
                        self.on_job_result(&job).await;
                    }
                }
                Ok(_) => {}
                Err(crate::events::RecvError::Lagged) => {
                    tracing::warn!("card watcher lagged; continuing");
                }
                Err(crate::events::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::events::EventBus;
    use crate::store::db::Db;
    use git2::{Repository, Signature};
    use tempfile::tempdir;

    fn script_step() -> StepConfig {
        StepConfig::Script {
            command: "echo hi".to_string(),
            workdir: None,
        }
    }

    async fn service() -> (CardService, Store, Arc<GitHost>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::new(Db::open_in_memory().unwrap(), EventBus::new());
        let queue = Arc::new(JobQueue::new());
        let githost = Arc::new(GitHost::new(dir.path().join("git")).unwrap());
        let service = CardService::new(
            store.clone(),
            queue,
            Arc::clone(&githost),
            test_config(dir.path()),
        );
        (service, store, githost, dir)
    }

    fn seed_commit(host: &GitHost, repo_id: i64) {
        let repo = Repository::open_bare(host.repo_path(repo_id)).unwrap();
        let blob = repo.blob(b"hello\n").unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert("README.md", blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test").unwrap();
        repo.commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
            .unwrap();
    }

    async fn seed_repo_card(service: &CardService, store: &Store, host: &GitHost) -> Card {
        let repo = store
            .create_repo("demo".into(), "main".into(), "http://x".into())
            .await
            .unwrap();
        host.init_bare(repo.id, "main").await.unwrap();
        seed_commit(host, repo.id);
        service
            .create(repo.id, "add README".into(), "".into(), "any".into(), script_step())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_requires_existing_repo() {
        let (service, _store, _host, _dir) = service().await;
        let err = service
            .create(42, "t".into(), "".into(), "any".into(), script_step())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn start_enqueues_and_is_not_idempotent() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;

        let (card, job) = service.start(card.id).await.unwrap();
        assert_eq!(card.status, CardStatus::InProgress);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(service.queue.len().await, 1);

        let err = service.start(card.id).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn completed_job_with_branch_moves_to_in_review() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;
        let (_, job) = service.start(card.id).await.unwrap();

        let job = store
            .finish_job(job.id, JobStatus::Completed, None, Some("lazyaf/c".into()), None)
            .await
            .unwrap()
            .unwrap();
        service.on_job_result(&job).await;

        let card = store.get_card(card.id).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::InReview);
        assert_eq!(card.branch_name.as_deref(), Some("lazyaf/c"));
        assert!(card.current_job_id.is_none());
    }

    #[tokio::test]
    async fn completed_script_without_branch_is_done_or_failed_by_tests() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;
        let (_, job) = service.start(card.id).await.unwrap();

        let job = store
            .finish_job(
                job.id,
                JobStatus::Completed,
                None,
                None,
                Some(crate::store::models::TestResults {
                    total: 2,
                    passed: 1,
                    failed: 1,
                }),
            )
            .await
            .unwrap()
            .unwrap();
        service.on_job_result(&job).await;
        let card = store.get_card(card.id).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::Failed);
    }

    #[tokio::test]
    async fn failed_job_fails_card_and_retry_resets() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;
        let (_, job) = service.start(card.id).await.unwrap();

        let job = store
            .finish_job(job.id, JobStatus::Failed, Some("boom".into()), None, None)
            .await
            .unwrap()
            .unwrap();
        service.on_job_result(&job).await;
        let card = store.get_card(card.id).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::Failed);

        let card = service.retry(card.id, false).await.unwrap();
        assert_eq!(card.status, CardStatus::Todo);
    }

    #[tokio::test]
    async fn retry_with_auto_starts_again() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;
        let (_, job) = service.start(card.id).await.unwrap();
        let job = store
            .finish_job(job.id, JobStatus::Failed, Some("boom".into()), None, None)
            .await
            .unwrap()
            .unwrap();
        service.on_job_result(&job).await;

        let card = service.retry(card.id, true).await.unwrap();
        assert_eq!(card.status, CardStatus::InProgress);
        assert_eq!(service.queue.len().await, 2);
    }

    #[tokio::test]
    async fn approve_fast_forwards_and_is_idempotent() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;
        host.ensure_branch(card.repo_id, "lazyaf/c", "main").await.unwrap();
        host.commit_files(card.repo_id, "lazyaf/c", vec![("work.txt".into(), "w".into())], "work")
            .await
            .unwrap();

        let (_, job) = service.start(card.id).await.unwrap();
        let job = store
            .finish_job(job.id, JobStatus::Completed, None, Some("lazyaf/c".into()), None)
            .await
            .unwrap()
            .unwrap();
        service.on_job_result(&job).await;

        let outcome = service.approve(card.id, None).await.unwrap();
        let ApproveOutcome::Done { card } = outcome else {
            panic!("expected done");
        };
        assert_eq!(card.status, CardStatus::Done);
        assert!(
            host.read_branch_file(card.repo_id, "main", "work.txt")
                .await
                .unwrap()
                .is_some()
        );

        // Second approve: done without re-merging.
        let outcome = service.approve(card.id, None).await.unwrap();
        assert!(matches!(outcome, ApproveOutcome::Done { .. }));
    }

    #[tokio::test]
    async fn approve_conflict_leaves_status_and_records_conflict() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;
        host.ensure_branch(card.repo_id, "lazyaf/c", "main").await.unwrap();
        host.commit_files(card.repo_id, "lazyaf/c", vec![("README.md".into(), "theirs\n".into())], "a")
            .await
            .unwrap();
        host.commit_files(card.repo_id, "main", vec![("README.md".into(), "ours\n".into())], "b")
            .await
            .unwrap();

        let (_, job) = service.start(card.id).await.unwrap();
        let job = store
            .finish_job(job.id, JobStatus::Completed, None, Some("lazyaf/c".into()), None)
            .await
            .unwrap()
            .unwrap();
        service.on_job_result(&job).await;

        let outcome = service.approve(card.id, None).await.unwrap();
        let ApproveOutcome::Conflict { card, merge } = outcome else {
            panic!("expected conflict");
        };
        assert_eq!(card.status, CardStatus::InReview);
        assert!(card.conflict.is_some());
        assert!(merge.is_conflict());
    }

    #[tokio::test]
    async fn approve_from_todo_is_client_error() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;
        let err = service.approve(card.id, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let _ = store;
    }

    #[tokio::test]
    async fn reject_returns_to_todo_and_keeps_branch() {
        let (service, store, host, _dir) = service().await;
        let card = seed_repo_card(&service, &store, &host).await;
        let (_, job) = service.start(card.id).await.unwrap();
        let job = store
            .finish_job(job.id, JobStatus::Completed, None, Some("lazyaf/c".into()), None)
            .await
            .unwrap()
            .unwrap();
        service.on_job_result(&job).await;

        let card = service.reject(card.id).await.unwrap();
        assert_eq!(card.status, CardStatus::Todo);
        assert_eq!(card.branch_name.as_deref(), Some("lazyaf/c"));
    }
}
