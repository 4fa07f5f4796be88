//! Fan-in from card state transitions and git pushes to pipeline starts,
//! with deduplication and terminal actions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::TRIGGER_DEDUP_WINDOW;
use crate::engine::PipelineEngine;
use crate::events::{Event, RecvError, Topic};
use crate::githost::GitHost;
use crate::store::Store;
use crate::store::models::{
    Card, CardStatus, PipelineRun, RunStatus, TerminalAction, TriggerType,
};

/// What to do to the originating card when a triggered run ends.
#[derive(Debug, Clone)]
struct PendingAction {
    card_id: Option<i64>,
    on_pass: TerminalAction,
    on_fail: TerminalAction,
}

pub struct TriggerService {
    store: Store,
    engine: Arc<PipelineEngine>,
    githost: Arc<GitHost>,
    seen: Mutex<HashMap<String, Instant>>,
    pending: Mutex<HashMap<i64, PendingAction>>,
}

/// `hash(pipeline_id, trigger_type, card_id or commit_sha)`.
pub fn trigger_key(pipeline_id: i64, trigger_type: TriggerType, discriminator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pipeline_id.to_be_bytes());
    hasher.update(trigger_type.as_str().as_bytes());
    hasher.update(discriminator.as_bytes());
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl TriggerService {
    pub fn new(store: Store, engine: Arc<PipelineEngine>, githost: Arc<GitHost>) -> Self {
        Self {
            store,
            engine,
            githost,
            seen: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Long-lived matcher task.
    pub async fn run(self: Arc<Self>) {
        let mut sub = self.store.bus().subscribe(&[
            Topic::CardChanged,
            Topic::PushReceived,
            Topic::RunChanged,
        ]);
        loop {
            match sub.recv().await {
                Ok(Event::CardChanged { card }) => self.on_card_changed(&card).await,
                Ok(Event::PushReceived {
                    repo_id,
                    ref_name,
                    old_sha,
                    new_sha,
                }) => {
                    self.on_push(repo_id, &ref_name, &old_sha, &new_sha).await;
                }
                Ok(Event::RunChanged { run }) => self.on_run_changed(&run).await,
                Ok(_) => {}
                Err(RecvError::Lagged) => {
                    tracing::warn!("trigger matcher lagged; some events were dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Suppress duplicate keys inside the dedup window. True = fresh.
    async fn dedup(&self, key: String) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, at| now.duration_since(*at) < TRIGGER_DEDUP_WINDOW);
        match seen.get(&key) {
            Some(_) => false,
            None => {
                seen.insert(key, now);
                true
            }
        }
    }

    pub async fn on_card_changed(&self, card: &Card) {
        // Only transitions into a trigger-configured status fire.
        if !matches!(card.status, CardStatus::InReview | CardStatus::Done) {
            return;
        }
        let pipelines = match self.store.list_pipelines(Some(card.repo_id)).await {
            Ok(pipelines) => pipelines,
            Err(e) => {
                tracing::error!(error = %e, "pipeline scan failed");
                return;
            }
        };
        for pipeline in pipelines {
            for trigger in &pipeline.triggers {
                if trigger.trigger_type != TriggerType::CardComplete {
                    continue;
                }
                if trigger.status != Some(card.status) {
                    continue;
                }
                let key = trigger_key(
                    pipeline.id,
                    TriggerType::CardComplete,
                    &card.id.to_string(),
                );
                if !self.dedup(key).await {
                    tracing::debug!(card_id = card.id, pipeline_id = pipeline.id, "duplicate trigger suppressed");
                    continue;
                }
                let context = serde_json::json!({
                    "card_id": card.id,
                    "card_title": card.title,
                    "branch": card.branch_name,
                });
                let branch = card.branch_name.clone();
                match self
                    .engine
                    .start_run(
                        pipeline.id,
                        "card_complete",
                        branch.clone(),
                        context,
                        branch,
                    )
                    .await
                {
                    Ok(run) => {
                        tracing::info!(
                            card_id = card.id,
                            pipeline_id = pipeline.id,
                            run_id = run.id,
                            "card trigger fired"
                        );
                        let mut pending = self.pending.lock().await;
                        pending.insert(
                            run.id,
                            PendingAction {
                                card_id: Some(card.id),
                                on_pass: trigger.on_pass.clone(),
                                on_fail: trigger.on_fail.clone(),
                            },
                        );
                    }
                    Err(e) => {
                        tracing::error!(pipeline_id = pipeline.id, error = %e, "trigger launch failed");
                    }
                }
            }
        }
    }

    pub async fn on_push(&self, repo_id: i64, ref_name: &str, old_sha: &str, new_sha: &str) {
        let Some(branch) = ref_name.strip_prefix("refs/heads/") else {
            return;
        };
        // Branch deletions don't trigger.
        if new_sha.chars().all(|c| c == '0') {
            return;
        }
        let pipelines = match self.store.list_pipelines(Some(repo_id)).await {
            Ok(pipelines) => pipelines,
            Err(e) => {
                tracing::error!(error = %e, "pipeline scan failed");
                return;
            }
        };
        for pipeline in pipelines {
            for trigger in &pipeline.triggers {
                if trigger.trigger_type != TriggerType::Push {
                    continue;
                }
                if !branch_matches(&trigger.branches, branch) {
                    continue;
                }
                let key = trigger_key(pipeline.id, TriggerType::Push, new_sha);
                if !self.dedup(key).await {
                    tracing::debug!(branch, pipeline_id = pipeline.id, "duplicate push suppressed");
                    continue;
                }
                let context = serde_json::json!({
                    "branch": branch,
                    "commit_sha": new_sha,
                    "old_sha": old_sha,
                    "push_ref": ref_name,
                });
                match self
                    .engine
                    .start_run(
                        pipeline.id,
                        "push",
                        Some(branch.to_string()),
                        context,
                        Some(branch.to_string()),
                    )
                    .await
                {
                    Ok(run) => {
                        tracing::info!(branch, pipeline_id = pipeline.id, run_id = run.id, "push trigger fired");
                        let mut pending = self.pending.lock().await;
                        pending.insert(
                            run.id,
                            PendingAction {
                                card_id: None,
                                on_pass: trigger.on_pass.clone(),
                                on_fail: trigger.on_fail.clone(),
                            },
                        );
                    }
                    Err(e) => {
                        tracing::error!(pipeline_id = pipeline.id, error = %e, "trigger launch failed");
                    }
                }
            }
        }
    }

    async fn on_run_changed(&self, run: &PipelineRun) {
        if !run.status.is_terminal() {
            return;
        }
        let action = {
            let mut pending = self.pending.lock().await;
            pending.remove(&run.id)
        };
        let Some(action) = action else {
            return;
        };
        match run.status {
            RunStatus::Passed => self.apply(run, action.card_id, action.on_pass).await,
            RunStatus::Failed | RunStatus::Cancelled => {
                self.apply(run, action.card_id, action.on_fail).await
            }
            _ => {}
        }
    }

    async fn apply(&self, run: &PipelineRun, card_id: Option<i64>, action: TerminalAction) {
        let Some(card_id) = card_id else {
            // Push-triggered runs have no originating card to act on.
            return;
        };
        match action {
            TerminalAction::Nothing => {}
            TerminalAction::Merge(target) => {
                self.merge_card(run, card_id, target).await;
            }
            TerminalAction::Fail => {
                if let Err(e) = self
                    .store
                    .card_transition(card_id, CardStatus::InReview, CardStatus::Failed)
                    .await
                {
                    tracing::warn!(card_id, error = %e, "on_fail transition skipped");
                }
            }
            TerminalAction::Reject => {
                if let Err(e) = self
                    .store
                    .card_transition(card_id, CardStatus::InReview, CardStatus::Todo)
                    .await
                {
                    tracing::warn!(card_id, error = %e, "on_fail reject skipped");
                }
            }
        }
    }

    /// `on_pass: merge`: merge the originating card branch. On success
    /// the card completes; on conflict the card keeps its status and the
    /// conflict record lands on its approval surface.
    async fn merge_card(&self, run: &PipelineRun, card_id: i64, target: Option<String>) {
        let card = match self.store.get_card(card_id).await {
            Ok(Some(card)) => card,
            _ => {
                tracing::warn!(card_id, "merge action on unknown card");
                return;
            }
        };
        let Some(branch) = card.branch_name.clone() else {
            tracing::warn!(card_id, "merge action but card has no branch");
            return;
        };
        let target = match target {
            Some(target) => target,
            None => match self.store.get_repo(card.repo_id).await {
                Ok(Some(repo)) => repo.default_branch,
                _ => "main".to_string(),
            },
        };
        match self.githost.merge(card.repo_id, &branch, &target).await {
            Ok(outcome) if outcome.is_conflict() => {
                tracing::warn!(card_id, run_id = run.id, "terminal merge conflicted");
                let record = serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null);
                if let Err(e) = self.store.card_set_conflict(card_id, Some(record)).await {
                    tracing::error!(card_id, error = %e, "failed to record conflict");
                }
            }
            Ok(_) => {
                let _ = self.store.card_set_conflict(card_id, None).await;
                if let Err(e) = self
                    .store
                    .card_transition(card_id, CardStatus::InReview, CardStatus::Done)
                    .await
                {
                    tracing::warn!(card_id, error = %e, "post-merge transition skipped");
                }
            }
            Err(e) => {
                tracing::error!(card_id, error = %e, "terminal merge failed");
            }
        }
    }
}

/// Shell-style glob match over the configured branch patterns.
pub fn branch_matches(patterns: &[String], branch: &str) -> bool {
    patterns.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(branch))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::CardService;
    use crate::store::models::TriggerDef;
    use crate::config::test_config;
    use crate::debugger::DebugController;
    use crate::events::EventBus;
    use crate::queue::JobQueue;
    use crate::runner::RunnerRegistry;
    use crate::runner::protocol::{RunnerMessage, ServerMessage};
    use crate::store::db::Db;
    use crate::store::models::{JobStatus, Repo, Step, StepConfig};
    use git2::{Repository, Signature};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    struct Harness {
        triggers: Arc<TriggerService>,
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
        let triggers = Arc::new(TriggerService::new(
            store.clone(),
            engine,
            Arc::clone(&githost),
        ));
        Harness {
            triggers,
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

    fn push_trigger(branches: &[&str]) -> TriggerDef {
        TriggerDef {
            trigger_type: TriggerType::Push,
            status: None,
            branches: branches.iter().map(|s| s.to_string()).collect(),
            on_pass: TerminalAction::Nothing,
            on_fail: TerminalAction::Nothing,
        }
    }

    fn script_steps() -> Vec<Step> {
        serde_json::from_value(serde_json::json!([
            {"name": "check", "kind": "script", "command": "true"}
        ]))
        .unwrap()
    }

    /// Always-succeeds runner + dispatcher pump.
    async fn auto_runner(h: &Harness) {
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
    }

    async fn wait_run_count(h: &Harness, pipeline_id: i64, count: usize) -> Vec<crate::store::models::PipelineRun> {
        for _ in 0..300 {
            let runs = h.store.list_runs(Some(pipeline_id)).await.unwrap();
            if runs.len() >= count {
                return runs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.store.list_runs(Some(pipeline_id)).await.unwrap()
    }

    #[test]
    fn branch_glob_semantics_are_shell_style() {
        let patterns = vec!["main".to_string(), "release/*".to_string()];
        assert!(branch_matches(&patterns, "main"));
        assert!(branch_matches(&patterns, "release/1.2"));
        assert!(!branch_matches(&patterns, "feature/x"));
        assert!(!branch_matches(&patterns, "mainline"));
    }

    #[test]
    fn trigger_key_is_stable_and_discriminating() {
        let a = trigger_key(1, TriggerType::Push, "abc");
        assert_eq!(a, trigger_key(1, TriggerType::Push, "abc"));
        assert_ne!(a, trigger_key(2, TriggerType::Push, "abc"));
        assert_ne!(a, trigger_key(1, TriggerType::CardComplete, "abc"));
        assert_ne!(a, trigger_key(1, TriggerType::Push, "abd"));
    }

    #[tokio::test]
    async fn push_to_matching_branch_launches_exactly_one_run() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        let pipeline = h
            .store
            .create_pipeline(
                repo.id,
                "q".into(),
                script_steps(),
                vec![push_trigger(&["main", "release/*"])],
                false,
            )
            .await
            .unwrap();

        let sha = "a".repeat(40);
        h.triggers
            .on_push(repo.id, "refs/heads/release/1.2", &"0".repeat(40), &sha)
            .await;
        let runs = wait_run_count(&h, pipeline.id, 1).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger_ref.as_deref(), Some("release/1.2"));
        assert_eq!(runs[0].trigger_context["commit_sha"], sha);

        // Non-matching branch: nothing.
        h.triggers
            .on_push(repo.id, "refs/heads/feature/x", &"0".repeat(40), &"b".repeat(40))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.list_runs(Some(pipeline.id)).await.unwrap().len(), 1);

        // Duplicate sha within the window: suppressed.
        h.triggers
            .on_push(repo.id, "refs/heads/release/1.2", &"0".repeat(40), &sha)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.list_runs(Some(pipeline.id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn branch_deletion_does_not_trigger() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        let pipeline = h
            .store
            .create_pipeline(
                repo.id,
                "q".into(),
                script_steps(),
                vec![push_trigger(&["main"])],
                false,
            )
            .await
            .unwrap();
        h.triggers
            .on_push(repo.id, "refs/heads/main", &"a".repeat(40), &"0".repeat(40))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.list_runs(Some(pipeline.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn card_into_in_review_fires_and_merges_on_pass() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        auto_runner(&h).await;

        // Card branch with work to merge.
        h.githost.ensure_branch(repo.id, "lazyaf/c", "main").await.unwrap();
        h.githost
            .commit_files(repo.id, "lazyaf/c", vec![("w.txt".into(), "w\n".into())], "work")
            .await
            .unwrap();

        let pipeline = h
            .store
            .create_pipeline(
                repo.id,
                "gate".into(),
                script_steps(),
                vec![TriggerDef {
                    trigger_type: TriggerType::CardComplete,
                    status: Some(CardStatus::InReview),
                    branches: vec![],
                    on_pass: TerminalAction::Merge(None),
                    on_fail: TerminalAction::Fail,
                }],
                false,
            )
            .await
            .unwrap();

        let card = h
            .store
            .create_card(
                repo.id,
                "c".into(),
                "".into(),
                "any".into(),
                StepConfig::Script {
                    command: "true".into(),
                    workdir: None,
                },
                None,
                None,
            )
            .await
            .unwrap();
        let (_, job) = h.store.start_card(card.id, 300).await.unwrap();
        // Simulate the card reaching review with its branch.
        let card = h
            .store
            .card_apply_job_result(card.id, job.id, CardStatus::InReview, Some("lazyaf/c".into()))
            .await
            .unwrap()
            .unwrap();

        h.triggers.on_card_changed(&card).await;
        let runs = wait_run_count(&h, pipeline.id, 1).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger_context["card_id"], card.id);

        // Let the run pass, then deliver the terminal event by hand.
        for _ in 0..300 {
            let run = h.store.get_run(runs[0].id).await.unwrap().unwrap();
            if run.status.is_terminal() {
                assert_eq!(run.status, RunStatus::Passed);
                h.triggers.on_run_changed(&run).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let card = h.store.get_card(card.id).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::Done);
        assert!(
            h.githost
                .read_branch_file(repo.id, "main", "w.txt")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn terminal_merge_conflict_leaves_card_in_review_with_record() {
        let h = harness().await;
        let repo = seed_repo(&h).await;
        auto_runner(&h).await;

        // Diverge so the merge conflicts.
        h.githost.ensure_branch(repo.id, "lazyaf/c", "main").await.unwrap();
        h.githost
            .commit_files(repo.id, "lazyaf/c", vec![("README.md".into(), "theirs\n".into())], "a")
            .await
            .unwrap();
        h.githost
            .commit_files(repo.id, "main", vec![("README.md".into(), "ours\n".into())], "b")
            .await
            .unwrap();

        let pipeline = h
            .store
            .create_pipeline(
                repo.id,
                "gate".into(),
                script_steps(),
                vec![TriggerDef {
                    trigger_type: TriggerType::CardComplete,
                    status: Some(CardStatus::InReview),
                    branches: vec![],
                    on_pass: TerminalAction::Merge(None),
                    on_fail: TerminalAction::Fail,
                }],
                false,
            )
            .await
            .unwrap();

        let card = h
            .store
            .create_card(
                repo.id,
                "c".into(),
                "".into(),
                "any".into(),
                StepConfig::Script {
                    command: "true".into(),
                    workdir: None,
                },
                None,
                None,
            )
            .await
            .unwrap();
        let (_, job) = h.store.start_card(card.id, 300).await.unwrap();
        let card = h
            .store
            .card_apply_job_result(card.id, job.id, CardStatus::InReview, Some("lazyaf/c".into()))
            .await
            .unwrap()
            .unwrap();

        h.triggers.on_card_changed(&card).await;
        let runs = wait_run_count(&h, pipeline.id, 1).await;
        for _ in 0..300 {
            let run = h.store.get_run(runs[0].id).await.unwrap().unwrap();
            if run.status.is_terminal() {
                assert_eq!(run.status, RunStatus::Passed);
                h.triggers.on_run_changed(&run).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let card = h.store.get_card(card.id).await.unwrap().unwrap();
        // Run passed but the merge conflicted: the card stays reviewable
        // with the conflict record attached.
        assert_eq!(card.status, CardStatus::InReview);
        assert!(card.conflict.is_some());
    }

    #[tokio::test]
    async fn on_fail_reject_returns_card_to_todo() {
        let h = harness().await;
        let repo = seed_repo(&h).await;

        let pipeline = h
            .store
            .create_pipeline(
                repo.id,
                "gate".into(),
                script_steps(),
                vec![TriggerDef {
                    trigger_type: TriggerType::CardComplete,
                    status: Some(CardStatus::InReview),
                    branches: vec![],
                    on_pass: TerminalAction::Nothing,
                    on_fail: TerminalAction::Reject,
                }],
                false,
            )
            .await
            .unwrap();

        let card = h
            .store
            .create_card(
                repo.id,
                "c".into(),
                "".into(),
                "any".into(),
                StepConfig::Script {
                    command: "true".into(),
                    workdir: None,
                },
                None,
                None,
            )
            .await
            .unwrap();
        let (_, job) = h.store.start_card(card.id, 300).await.unwrap();
        let card = h
            .store
            .card_apply_job_result(card.id, job.id, CardStatus::InReview, Some("lazyaf/c".into()))
            .await
            .unwrap()
            .unwrap();

        // No runner: cancel the run to reach a failing terminal state.
        h.triggers.on_card_changed(&card).await;
        let runs = wait_run_count(&h, pipeline.id, 1).await;
        let run = h
            .store
            .run_set_status(runs[0].id, RunStatus::Failed, Some("forced".into()))
            .await
            .unwrap();
        h.triggers.on_run_changed(&run).await;

        let card = h.store.get_card(card.id).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::Todo);
    }
}
