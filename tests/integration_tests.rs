//! End-to-end scenarios composed through the public library surface:
//! store + queue + runner pool + engine + git host wired exactly as the
//! binary wires them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use lazyaf::api::SharedState;
use lazyaf::config::test_config;
use lazyaf::runner::protocol::{RunnerMessage, ServerMessage};
use lazyaf::server::{build_router, build_state, spawn_workers};
use lazyaf::store::models::{
    CardStatus, JobStatus, RunStatus, RunnerStatus, StepConfig, TriggerDef,
};

fn script_step() -> StepConfig {
    StepConfig::Script {
        command: "echo done".to_string(),
        workdir: None,
    }
}

fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@test")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@test")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Seed a throwaway source repository with one commit on `main`.
fn seed_source_repo(dir: &Path) {
    run_git(dir, &["init", "--initial-branch=main", "."]);
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    run_git(dir, &["add", "."]);
    run_git(dir, &["commit", "-m", "init"]);
}

/// A runner driven directly through the registry: acks every assignment
/// and reports the scripted outcome.
async fn attach_runner(
    state: &SharedState,
    outcomes: Vec<(JobStatus, Option<&'static str>, Option<&'static str>)>,
) -> i64 {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let runner = state.registry.register("any", None, tx).await.unwrap();
    let registry = Arc::clone(&state.registry);
    let runner_id = runner.id;
    tokio::spawn(async move {
        let mut remaining = outcomes.into_iter();
        while let Some(msg) = rx.recv().await {
            if let ServerMessage::RunJob { job_id, .. } = msg {
                registry
                    .on_message(runner_id, RunnerMessage::JobAck { job_id, accepted: true })
                    .await;
                registry
                    .on_message(
                        runner_id,
                        RunnerMessage::LogAppend {
                            job_id,
                            chunk: "done\n".into(),
                            seq: 0,
                        },
                    )
                    .await;
                let (status, error, branch) =
                    remaining.next().unwrap_or((JobStatus::Completed, None, None));
                registry
                    .on_message(
                        runner_id,
                        RunnerMessage::JobResult {
                            job_id,
                            status,
                            error: error.map(String::from),
                            branch_name: branch.map(String::from),
                            test_results: None,
                        },
                    )
                    .await;
            }
        }
    });
    runner_id
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_card_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_config(dir.path())).await.unwrap();
    spawn_workers(&state);

    let repo = state
        .store
        .create_repo("r".into(), "main".into(), state.config.base_url.clone())
        .await
        .unwrap();
    let card = state
        .cards
        .create(
            repo.id,
            "add README".into(),
            "".into(),
            "any".into(),
            StepConfig::Agent {
                prompt: Some("add a README".into()),
                agent_files: vec![],
            },
        )
        .await
        .unwrap();
    state.cards.start(card.id).await.unwrap();

    let runner_id = attach_runner(
        &state,
        vec![(JobStatus::Completed, None, Some("lazyaf/c"))],
    )
    .await;

    let done = wait_for(|| {
        let state = Arc::clone(&state);
        async move {
            state
                .store
                .get_card(card.id)
                .await
                .unwrap()
                .map(|c| c.status == CardStatus::InReview)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(done, "card never reached in_review");

    let card = state.store.get_card(card.id).await.unwrap().unwrap();
    assert_eq!(card.branch_name.as_deref(), Some("lazyaf/c"));
    assert!(card.current_job_id.is_none());
    let jobs = state.store.list_jobs_for_card(card.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].logs, "done\n");

    let idle = wait_for(|| {
        let state = Arc::clone(&state);
        async move {
            state
                .store
                .get_runner(runner_id)
                .await
                .unwrap()
                .map(|r| r.status == RunnerStatus::Idle)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(idle, "runner never returned to idle");
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_queued_job_dispatches_when_runner_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_config(dir.path())).await.unwrap();
    spawn_workers(&state);

    let repo = state
        .store
        .create_repo("r".into(), "main".into(), state.config.base_url.clone())
        .await
        .unwrap();
    let card = state
        .cards
        .create(repo.id, "c".into(), "".into(), "any".into(), script_step())
        .await
        .unwrap();
    // Start succeeds with no runner connected: the job waits.
    let (_, job) = state.cards.start(card.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(state.registry.connected_count().await, 0);

    attach_runner(&state, vec![(JobStatus::Completed, None, None)]).await;

    let dispatched = wait_for(|| {
        let state = Arc::clone(&state);
        async move {
            state
                .store
                .get_job(job.id)
                .await
                .unwrap()
                .map(|j| j.status.is_terminal())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(dispatched, "queued job was not dispatched after registration");
}

#[tokio::test(flavor = "multi_thread")]
async fn s7_restart_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let (card_id, job_id, runner_id);
    {
        // First process lifetime: a runner busy on a running job. No
        // background workers; dispatch driven by hand.
        let state = build_state(config.clone()).await.unwrap();
        let repo = state
            .store
            .create_repo("r".into(), "main".into(), state.config.base_url.clone())
            .await
            .unwrap();
        let card = state
            .cards
            .create(repo.id, "c".into(), "".into(), "any".into(), script_step())
            .await
            .unwrap();
        let (_, job) = state.cards.start(card.id).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel::<ServerMessage>();
        let runner = state.registry.register("any", None, tx).await.unwrap();
        state.registry.run_dispatch_tick().await;
        state
            .registry
            .on_message(runner.id, RunnerMessage::JobAck { job_id: job.id, accepted: true })
            .await;

        let job = state.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        card_id = card.id;
        job_id = job.id;
        runner_id = runner.id;
        // Process dies here.
    }

    let state = build_state(config).await.unwrap();
    let job = state.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("restart during execution"));
    let card = state.store.get_card(card_id).await.unwrap().unwrap();
    assert_eq!(card.status, CardStatus::Failed);
    let runner = state.store.get_runner(runner_id).await.unwrap().unwrap();
    assert_eq!(runner.status, RunnerStatus::Disconnected);
    assert!(runner.current_job_id.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn ingest_then_clone_reproduces_refs_and_push_triggers_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    seed_source_repo(&source);

    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    let mut config = test_config(&data);

    // Serve the real transport on an ephemeral port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    config.base_url = format!("http://127.0.0.1:{}", port);

    let state = build_state(config).await.unwrap();
    spawn_workers(&state);
    let app = build_router(Arc::clone(&state));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    // Ingest the source and register a push-triggered pipeline.
    let repo = state
        .store
        .create_repo("r".into(), "main".into(), state.config.base_url.clone())
        .await
        .unwrap();
    state
        .githost
        .ingest(repo.id, &source.to_string_lossy(), "main")
        .await
        .unwrap();
    let repo = state.store.mark_ingested(repo.id).await.unwrap();

    let steps: Vec<lazyaf::store::models::Step> = serde_json::from_value(serde_json::json!([
        {"name": "check", "kind": "script", "command": "true"}
    ]))
    .unwrap();
    let triggers: Vec<TriggerDef> = serde_json::from_value(serde_json::json!([
        {"trigger_type": "push", "branches": ["main", "release/*"],
         "on_pass": "nothing", "on_fail": "nothing"}
    ]))
    .unwrap();
    let pipeline = state
        .store
        .create_pipeline(repo.id, "q".into(), steps, triggers, false)
        .await
        .unwrap();

    // Fresh clone of the internal URL reproduces every ref.
    let clone_dir = dir.path().join("clone");
    run_git(dir.path(), &["clone", &repo.clone_url, &clone_dir.to_string_lossy()]);
    let source_refs = run_git(&source, &["rev-parse", "main"]);
    let clone_refs = run_git(&clone_dir, &["rev-parse", "origin/main"]);
    assert_eq!(source_refs, clone_refs);

    // Push to a matching branch: exactly one run, with the pushed sha.
    run_git(&clone_dir, &["checkout", "-b", "release/1.2"]);
    std::fs::write(clone_dir.join("work.txt"), "w\n").unwrap();
    run_git(&clone_dir, &["add", "."]);
    run_git(&clone_dir, &["commit", "-m", "work"]);
    let pushed_sha = run_git(&clone_dir, &["rev-parse", "HEAD"]).trim().to_string();
    run_git(&clone_dir, &["push", "origin", "release/1.2"]);

    let fired = wait_for(|| {
        let state = Arc::clone(&state);
        async move {
            !state
                .store
                .list_runs(Some(pipeline.id))
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;
    assert!(fired, "push did not launch a pipeline run");
    let runs = state.store.list_runs(Some(pipeline.id)).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger_ref.as_deref(), Some("release/1.2"));
    assert_eq!(runs[0].trigger_context["commit_sha"], pushed_sha);

    // A push to a non-matching branch launches nothing.
    run_git(&clone_dir, &["checkout", "-b", "feature/x"]);
    std::fs::write(clone_dir.join("other.txt"), "o\n").unwrap();
    run_git(&clone_dir, &["add", "."]);
    run_git(&clone_dir, &["commit", "-m", "other"]);
    run_git(&clone_dir, &["push", "origin", "feature/x"]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(state.store.list_runs(Some(pipeline.id)).await.unwrap().len(), 1);

    // The branch list now reflects the pushed refs.
    let branches = state.githost.list_branches(repo.id).await.unwrap();
    let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
    assert!(names.contains(&"main"));
    assert!(names.contains(&"release/1.2"));
    assert!(names.contains(&"feature/x"));

    // Finish the run so the data dir ends in a clean state.
    attach_runner(&state, vec![(JobStatus::Completed, None, None)]).await;
    let finished = wait_for(|| {
        let state = Arc::clone(&state);
        let run_id = runs[0].id;
        async move {
            state
                .store
                .get_run(run_id)
                .await
                .unwrap()
                .map(|r| r.status == RunStatus::Passed)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(finished, "push-triggered run did not pass");
}
