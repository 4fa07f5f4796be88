use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

fn db_err(e: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Database(e.into())
}

/// Unix epoch seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the SQLite database at the given path and run
    /// migrations before anything else touches it.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .context("Failed to open SQLite database")
            .map_err(db_err)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")
            .map_err(db_err)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")
            .map_err(db_err)?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS repos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    ingested INTEGER NOT NULL DEFAULT 0,
                    clone_url TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS cards (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'todo',
                    runner_type TEXT NOT NULL DEFAULT 'any',
                    step_config TEXT NOT NULL,
                    branch_name TEXT,
                    current_job_id INTEGER,
                    pipeline_run_id INTEGER,
                    step_index INTEGER,
                    conflict TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    card_id INTEGER REFERENCES cards(id) ON DELETE CASCADE,
                    repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                    required_runner_type TEXT NOT NULL DEFAULT 'any',
                    status TEXT NOT NULL DEFAULT 'queued',
                    step_config TEXT NOT NULL,
                    prompt TEXT,
                    agent_files TEXT NOT NULL DEFAULT '[]',
                    continuation INTEGER NOT NULL DEFAULT 0,
                    pinned_runner_id INTEGER,
                    ephemeral INTEGER NOT NULL DEFAULT 0,
                    priority INTEGER NOT NULL DEFAULT 0,
                    runner_id INTEGER,
                    logs TEXT NOT NULL DEFAULT '',
                    error TEXT,
                    branch_name TEXT,
                    test_results TEXT,
                    deadline_secs INTEGER NOT NULL DEFAULT 300,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS runners (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    runner_type TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'connecting',
                    current_job_id INTEGER,
                    last_heartbeat INTEGER NOT NULL DEFAULT 0,
                    registered_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS pipelines (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    steps TEXT NOT NULL,
                    triggers TEXT NOT NULL DEFAULT '[]',
                    is_template INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
                    repo_id INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    trigger_type TEXT NOT NULL DEFAULT 'manual',
                    trigger_ref TEXT,
                    trigger_context TEXT NOT NULL DEFAULT '{}',
                    branch_name TEXT NOT NULL DEFAULT '',
                    current_step INTEGER NOT NULL DEFAULT 0,
                    steps_total INTEGER NOT NULL DEFAULT 0,
                    steps_completed INTEGER NOT NULL DEFAULT 0,
                    debug_session_id INTEGER,
                    error TEXT,
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS step_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    step_index INTEGER NOT NULL,
                    step_name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    job_id INTEGER,
                    logs TEXT NOT NULL DEFAULT '',
                    error TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    UNIQUE(run_id, step_index)
                );

                CREATE TABLE IF NOT EXISTS agent_files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    description TEXT NOT NULL DEFAULT '',
                    content TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS debug_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    breakpoints TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_step INTEGER,
                    token TEXT,
                    expires_at INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_cards_repo ON cards(repo_id);
                CREATE INDEX IF NOT EXISTS idx_cards_status ON cards(repo_id, status);
                CREATE INDEX IF NOT EXISTS idx_jobs_card ON jobs(card_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON pipeline_runs(pipeline_id);
                CREATE INDEX IF NOT EXISTS idx_step_runs_run ON step_runs(run_id);
                CREATE INDEX IF NOT EXISTS idx_pipelines_repo ON pipelines(repo_id);
                ",
            )
            .context("Failed to create tables")
            .map_err(db_err)
    }

    // ── Repos ─────────────────────────────────────────────────────────

    pub fn create_repo(&self, name: &str, default_branch: &str) -> Result<Repo> {
        self.conn
            .execute(
                "INSERT INTO repos (name, default_branch) VALUES (?1, ?2)",
                params![name, default_branch],
            )
            .context("Failed to insert repo")
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_repo(id)?.ok_or(StoreError::NotFound {
            entity: "repo",
            id,
        })
    }

    pub fn set_repo_clone_url(&self, id: i64, url: &str) -> Result<Repo> {
        self.conn
            .execute(
                "UPDATE repos SET clone_url = ?1 WHERE id = ?2",
                params![url, id],
            )
            .context("Failed to set clone url")
            .map_err(db_err)?;
        self.get_repo(id)?.ok_or(StoreError::NotFound {
            entity: "repo",
            id,
        })
    }

    /// `ingested` once true stays true.
    pub fn mark_ingested(&self, id: i64) -> Result<Repo> {
        self.conn
            .execute("UPDATE repos SET ingested = 1 WHERE id = ?1", params![id])
            .context("Failed to mark repo ingested")
            .map_err(db_err)?;
        self.get_repo(id)?.ok_or(StoreError::NotFound {
            entity: "repo",
            id,
        })
    }

    pub fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        self.conn
            .query_row(
                "SELECT id, name, default_branch, ingested, clone_url, created_at
                 FROM repos WHERE id = ?1",
                params![id],
                repo_from_row,
            )
            .optional()
            .context("Failed to query repo")
            .map_err(db_err)
    }

    pub fn list_repos(&self) -> Result<Vec<Repo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, default_branch, ingested, clone_url, created_at
                 FROM repos ORDER BY id",
            )
            .context("Failed to prepare list_repos")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], repo_from_row)
            .context("Failed to query repos")
            .map_err(db_err)?;
        collect_rows(rows)
    }

    pub fn delete_repo(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM repos WHERE id = ?1", params![id])
            .context("Failed to delete repo")
            .map_err(db_err)?;
        Ok(count > 0)
    }

    // ── Cards ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_card(
        &self,
        repo_id: i64,
        title: &str,
        description: &str,
        runner_type: &str,
        step: &StepConfig,
        pipeline_run_id: Option<i64>,
        step_index: Option<i64>,
    ) -> Result<Card> {
        let config = serde_json::to_string(step)
            .context("Failed to serialize step config")
            .map_err(db_err)?;
        self.conn
            .execute(
                "INSERT INTO cards (repo_id, title, description, runner_type, step_config,
                                    pipeline_run_id, step_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    repo_id,
                    title,
                    description,
                    runner_type,
                    config,
                    pipeline_run_id,
                    step_index
                ],
            )
            .context("Failed to insert card")
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_card(id)?.ok_or(StoreError::NotFound {
            entity: "card",
            id,
        })
    }

    pub fn get_card(&self, id: i64) -> Result<Option<Card>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", CARD_SELECT),
                params![id],
                card_row,
            )
            .optional()
            .context("Failed to query card")
            .map_err(db_err)?;
        row.map(CardRow::into_card).transpose()
    }

    pub fn list_cards(
        &self,
        repo_id: Option<i64>,
        status: Option<CardStatus>,
    ) -> Result<Vec<Card>> {
        let mut sql = CARD_SELECT.to_string();
        sql.push_str(" WHERE 1=1");
        if repo_id.is_some() {
            sql.push_str(" AND repo_id = :repo");
        }
        if status.is_some() {
            sql.push_str(" AND status = :status");
        }
        sql.push_str(" ORDER BY id");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_cards")
            .map_err(db_err)?;
        let status_str = status.map(|s| s.as_str().to_string());
        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        if let Some(ref r) = repo_id {
            named.push((":repo", r as &dyn rusqlite::ToSql));
        }
        if let Some(ref s) = status_str {
            named.push((":status", s as &dyn rusqlite::ToSql));
        }
        let rows = stmt
            .query_map(named.as_slice(), card_row)
            .context("Failed to query cards")
            .map_err(db_err)?;
        let raw: Vec<CardRow> = collect_rows(rows)?;
        raw.into_iter().map(CardRow::into_card).collect()
    }

    pub fn update_card_fields(
        &self,
        id: i64,
        title: Option<&str>,
        description: Option<&str>,
        runner_type: Option<&str>,
        step: Option<&StepConfig>,
    ) -> Result<Card> {
        if let Some(t) = title {
            self.conn
                .execute(
                    "UPDATE cards SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![t, id],
                )
                .context("Failed to update card title")
                .map_err(db_err)?;
        }
        if let Some(d) = description {
            self.conn
                .execute(
                    "UPDATE cards SET description = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![d, id],
                )
                .context("Failed to update card description")
                .map_err(db_err)?;
        }
        if let Some(r) = runner_type {
            self.conn
                .execute(
                    "UPDATE cards SET runner_type = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![r, id],
                )
                .context("Failed to update card runner type")
                .map_err(db_err)?;
        }
        if let Some(s) = step {
            let config = serde_json::to_string(s)
                .context("Failed to serialize step config")
                .map_err(db_err)?;
            self.conn
                .execute(
                    "UPDATE cards SET step_config = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![config, id],
                )
                .context("Failed to update card step config")
                .map_err(db_err)?;
        }
        self.get_card(id)?.ok_or(StoreError::NotFound {
            entity: "card",
            id,
        })
    }

    pub fn delete_card(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM cards WHERE id = ?1", params![id])
            .context("Failed to delete card")
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Conditional status write; fails with `TransitionLost` when the card
    /// is no longer in `from`.
    pub fn card_transition(&self, id: i64, from: CardStatus, to: CardStatus) -> Result<Card> {
        let count = self
            .conn
            .execute(
                "UPDATE cards SET status = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = ?3",
                params![to.as_str(), id, from.as_str()],
            )
            .context("Failed to transition card")
            .map_err(db_err)?;
        if count == 0 {
            let exists = self.get_card(id)?;
            return match exists {
                None => Err(StoreError::NotFound {
                    entity: "card",
                    id,
                }),
                Some(card) => Err(StoreError::InvalidTransition {
                    entity: "card",
                    from: card.status.as_str().to_string(),
                    to: to.as_str().to_string(),
                }),
            };
        }
        self.get_card(id)?.ok_or(StoreError::NotFound {
            entity: "card",
            id,
        })
    }

    /// Consume a job outcome: move the card out of `in_progress`, record
    /// the result branch, and clear the active-job slot, in one write.
    /// Returns `None` when the result is stale (the card moved on or the
    /// job is no longer its active job).
    pub fn card_apply_job_result(
        &self,
        card_id: i64,
        job_id: i64,
        to: CardStatus,
        branch: Option<&str>,
    ) -> Result<Option<Card>> {
        let count = self
            .conn
            .execute(
                "UPDATE cards SET status = ?1, branch_name = COALESCE(?2, branch_name),
                        current_job_id = NULL, updated_at = datetime('now')
                 WHERE id = ?3 AND current_job_id = ?4 AND status = 'in_progress'",
                params![to.as_str(), branch, card_id, job_id],
            )
            .context("Failed to apply job result to card")
            .map_err(db_err)?;
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(self.get_card(card_id)?.ok_or(StoreError::NotFound {
            entity: "card",
            id: card_id,
        })?))
    }

    pub fn card_set_conflict(&self, id: i64, conflict: Option<&serde_json::Value>) -> Result<Card> {
        let text = conflict.map(|c| c.to_string());
        self.conn
            .execute(
                "UPDATE cards SET conflict = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![text, id],
            )
            .context("Failed to set card conflict")
            .map_err(db_err)?;
        self.get_card(id)?.ok_or(StoreError::NotFound {
            entity: "card",
            id,
        })
    }

    pub fn card_set_branch(&self, id: i64, branch: &str) -> Result<Card> {
        self.conn
            .execute(
                "UPDATE cards SET branch_name = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![branch, id],
            )
            .context("Failed to set card branch")
            .map_err(db_err)?;
        self.get_card(id)?.ok_or(StoreError::NotFound {
            entity: "card",
            id,
        })
    }

    /// Snapshot the card's step into a new queued Job and move the card to
    /// `in_progress`, atomically. Fails when the card already has an active
    /// job or is not startable.
    pub fn start_card(&mut self, id: i64, deadline_secs: u64) -> Result<(Card, Job)> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin start_card transaction")
            .map_err(db_err)?;

        let card = tx
            .query_row(&format!("{} WHERE id = ?1", CARD_SELECT), params![id], card_row)
            .optional()
            .context("Failed to query card for start")
            .map_err(db_err)?
            .ok_or(StoreError::NotFound {
                entity: "card",
                id,
            })?
            .into_card()?;

        if card.status == CardStatus::InProgress || card.current_job_id.is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "card {} is already running",
                id
            )));
        }
        if !card.status.can_transition_to(CardStatus::InProgress) {
            return Err(StoreError::InvalidTransition {
                entity: "card",
                from: card.status.as_str().to_string(),
                to: CardStatus::InProgress.as_str().to_string(),
            });
        }

        let config = serde_json::to_string(&card.step)
            .context("Failed to serialize step snapshot")
            .map_err(db_err)?;
        let prompt = match &card.step {
            StepConfig::Agent { prompt, .. } => prompt.clone(),
            _ => None,
        };
        let files = match &card.step {
            StepConfig::Agent { agent_files, .. } => serde_json::to_string(agent_files)
                .context("Failed to serialize agent files")
                .map_err(db_err)?,
            _ => "[]".to_string(),
        };
        tx.execute(
            "INSERT INTO jobs (card_id, repo_id, required_runner_type, step_config, prompt,
                               agent_files, deadline_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                card.id,
                card.repo_id,
                card.runner_type,
                config,
                prompt,
                files,
                deadline_secs as i64
            ],
        )
        .context("Failed to insert job snapshot")
        .map_err(db_err)?;
        let job_id = tx.last_insert_rowid();

        let moved = tx
            .execute(
                "UPDATE cards SET status = 'in_progress', current_job_id = ?1,
                        updated_at = datetime('now')
                 WHERE id = ?2 AND status = ?3",
                params![job_id, id, card.status.as_str()],
            )
            .context("Failed to move card to in_progress")
            .map_err(db_err)?;
        if moved == 0 {
            return Err(StoreError::TransitionLost {
                entity: "card",
                id,
            });
        }

        tx.commit()
            .context("Failed to commit start_card")
            .map_err(db_err)?;

        let card = self.get_card(id)?.ok_or(StoreError::NotFound {
            entity: "card",
            id,
        })?;
        let job = self.get_job(job_id)?.ok_or(StoreError::NotFound {
            entity: "job",
            id: job_id,
        })?;
        Ok((card, job))
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_job(
        &self,
        repo_id: i64,
        required_runner_type: &str,
        step: &StepConfig,
        prompt: Option<&str>,
        agent_files: &[String],
        continuation: bool,
        pinned_runner_id: Option<i64>,
        ephemeral: bool,
        deadline_secs: u64,
    ) -> Result<Job> {
        let config = serde_json::to_string(step)
            .context("Failed to serialize step config")
            .map_err(db_err)?;
        let files = serde_json::to_string(agent_files)
            .context("Failed to serialize agent files")
            .map_err(db_err)?;
        self.conn
            .execute(
                "INSERT INTO jobs (repo_id, required_runner_type, step_config, prompt,
                                   agent_files, continuation, pinned_runner_id, ephemeral,
                                   deadline_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    repo_id,
                    required_runner_type,
                    config,
                    prompt,
                    files,
                    continuation as i64,
                    pinned_runner_id,
                    ephemeral as i64,
                    deadline_secs as i64
                ],
            )
            .context("Failed to insert job")
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.ok_or(StoreError::NotFound {
            entity: "job",
            id,
        })
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", JOB_SELECT),
                params![id],
                job_row,
            )
            .optional()
            .context("Failed to query job")
            .map_err(db_err)?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs_for_card(&self, card_id: i64) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE card_id = ?1 ORDER BY id", JOB_SELECT))
            .context("Failed to prepare list_jobs_for_card")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![card_id], job_row)
            .context("Failed to query jobs")
            .map_err(db_err)?;
        let raw: Vec<JobRow> = collect_rows(rows)?;
        raw.into_iter().map(JobRow::into_job).collect()
    }

    /// Ids of all queued jobs in dispatch order, for queue rebuild.
    pub fn queued_job_ids(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, required_runner_type FROM jobs
                 WHERE status = 'queued' ORDER BY priority DESC, id ASC",
            )
            .context("Failed to prepare queued_job_ids")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query queued jobs")
            .map_err(db_err)?;
        collect_rows(rows)
    }

    /// Append to a running job's log; terminal jobs are never mutated.
    /// Returns the job and whether the append landed.
    pub fn append_job_logs(&self, id: i64, chunk: &str) -> Result<(Job, bool)> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET logs = logs || ?1
                 WHERE id = ?2 AND status IN ('queued', 'running')",
                params![chunk, id],
            )
            .context("Failed to append job logs")
            .map_err(db_err)?;
        let job = self.get_job(id)?.ok_or(StoreError::NotFound {
            entity: "job",
            id,
        })?;
        Ok((job, count > 0))
    }

    /// Atomically move a queued job to `running` on the given runner and
    /// the idle runner to `assigned`. Fails with `TransitionLost` when
    /// either side changed underneath the dispatcher.
    pub fn claim_job(&mut self, job_id: i64, runner_id: i64) -> Result<(Job, Runner)> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin claim transaction")
            .map_err(db_err)?;
        let claimed = tx
            .execute(
                "UPDATE jobs SET status = 'running', runner_id = ?1,
                        started_at = datetime('now')
                 WHERE id = ?2 AND status = 'queued'",
                params![runner_id, job_id],
            )
            .context("Failed to claim job")
            .map_err(db_err)?;
        if claimed == 0 {
            return Err(StoreError::TransitionLost {
                entity: "job",
                id: job_id,
            });
        }
        let assigned = tx
            .execute(
                "UPDATE runners SET status = 'assigned', current_job_id = ?1
                 WHERE id = ?2 AND status = 'idle'",
                params![job_id, runner_id],
            )
            .context("Failed to assign runner")
            .map_err(db_err)?;
        if assigned == 0 {
            return Err(StoreError::TransitionLost {
                entity: "runner",
                id: runner_id,
            });
        }
        tx.commit()
            .context("Failed to commit claim")
            .map_err(db_err)?;
        let job = self.get_job(job_id)?.ok_or(StoreError::NotFound {
            entity: "job",
            id: job_id,
        })?;
        let runner = self.get_runner(runner_id)?.ok_or(StoreError::NotFound {
            entity: "runner",
            id: runner_id,
        })?;
        Ok((job, runner))
    }

    /// Undo a claim after a rejected or timed-out ack: job back to the
    /// queue, runner back to idle.
    pub fn release_job(&mut self, job_id: i64, runner_id: i64) -> Result<(Job, Runner)> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin release transaction")
            .map_err(db_err)?;
        tx.execute(
            "UPDATE jobs SET status = 'queued', runner_id = NULL, started_at = NULL
             WHERE id = ?1 AND status = 'running'",
            params![job_id],
        )
        .context("Failed to release job")
        .map_err(db_err)?;
        tx.execute(
            "UPDATE runners SET status = 'idle', current_job_id = NULL
             WHERE id = ?1 AND status IN ('assigned', 'busy')",
            params![runner_id],
        )
        .context("Failed to idle runner")
        .map_err(db_err)?;
        tx.commit()
            .context("Failed to commit release")
            .map_err(db_err)?;
        let job = self.get_job(job_id)?.ok_or(StoreError::NotFound {
            entity: "job",
            id: job_id,
        })?;
        let runner = self.get_runner(runner_id)?.ok_or(StoreError::NotFound {
            entity: "runner",
            id: runner_id,
        })?;
        Ok((job, runner))
    }

    /// Write the exactly-once terminal transition. Returns `None` when the
    /// job was already terminal (the caller logs and drops the duplicate).
    pub fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<&str>,
        branch_name: Option<&str>,
        test_results: Option<&TestResults>,
    ) -> Result<Option<Job>> {
        debug_assert!(status.is_terminal());
        let results = test_results
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize test results")
            .map_err(db_err)?;
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1, error = ?2,
                        branch_name = COALESCE(?3, branch_name),
                        test_results = COALESCE(?4, test_results),
                        finished_at = datetime('now')
                 WHERE id = ?5 AND status IN ('queued', 'running')",
                params![status.as_str(), error, branch_name, results, id],
            )
            .context("Failed to finish job")
            .map_err(db_err)?;
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(self.get_job(id)?.ok_or(StoreError::NotFound {
            entity: "job",
            id,
        })?))
    }

    // ── Runners ───────────────────────────────────────────────────────

    pub fn insert_runner(&self, runner_type: &str) -> Result<Runner> {
        self.conn
            .execute(
                "INSERT INTO runners (runner_type, status, last_heartbeat)
                 VALUES (?1, 'connecting', ?2)",
                params![runner_type, now_epoch()],
            )
            .context("Failed to insert runner")
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_runner(id)?.ok_or(StoreError::NotFound {
            entity: "runner",
            id,
        })
    }

    pub fn get_runner(&self, id: i64) -> Result<Option<Runner>> {
        self.conn
            .query_row(
                "SELECT id, runner_type, status, current_job_id, last_heartbeat, registered_at
                 FROM runners WHERE id = ?1",
                params![id],
                runner_from_row,
            )
            .optional()
            .context("Failed to query runner")
            .map_err(db_err)
    }

    pub fn list_runners(&self) -> Result<Vec<Runner>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, runner_type, status, current_job_id, last_heartbeat, registered_at
                 FROM runners ORDER BY id",
            )
            .context("Failed to prepare list_runners")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], runner_from_row)
            .context("Failed to query runners")
            .map_err(db_err)?;
        collect_rows(rows)
    }

    pub fn runner_set_status(&self, id: i64, status: RunnerStatus) -> Result<Runner> {
        self.conn
            .execute(
                "UPDATE runners SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to set runner status")
            .map_err(db_err)?;
        self.get_runner(id)?.ok_or(StoreError::NotFound {
            entity: "runner",
            id,
        })
    }

    pub fn runner_heartbeat(&self, id: i64) -> Result<Runner> {
        self.set_heartbeat(id, now_epoch())
    }

    pub fn set_heartbeat(&self, id: i64, epoch: i64) -> Result<Runner> {
        self.conn
            .execute(
                "UPDATE runners SET last_heartbeat = ?1 WHERE id = ?2",
                params![epoch, id],
            )
            .context("Failed to record heartbeat")
            .map_err(db_err)?;
        self.get_runner(id)?.ok_or(StoreError::NotFound {
            entity: "runner",
            id,
        })
    }

    /// Clear the runner's job slot and return it to `idle` after a result.
    pub fn runner_finish_job(&self, id: i64) -> Result<Runner> {
        self.conn
            .execute(
                "UPDATE runners SET status = 'idle', current_job_id = NULL,
                        last_heartbeat = ?1
                 WHERE id = ?2",
                params![now_epoch(), id],
            )
            .context("Failed to idle runner")
            .map_err(db_err)?;
        self.get_runner(id)?.ok_or(StoreError::NotFound {
            entity: "runner",
            id,
        })
    }

    /// Drop the runner's job slot while moving it off the pool (dead,
    /// disconnected).
    pub fn runner_drop_job(&self, id: i64, status: RunnerStatus) -> Result<Runner> {
        self.conn
            .execute(
                "UPDATE runners SET status = ?1, current_job_id = NULL WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to drop runner job")
            .map_err(db_err)?;
        self.get_runner(id)?.ok_or(StoreError::NotFound {
            entity: "runner",
            id,
        })
    }

    /// Oldest-idle runner of a type (FIFO tie-break on `last_heartbeat`).
    pub fn oldest_idle_runner(&self, runner_type: &str) -> Result<Option<Runner>> {
        self.conn
            .query_row(
                "SELECT id, runner_type, status, current_job_id, last_heartbeat, registered_at
                 FROM runners
                 WHERE status = 'idle' AND (runner_type = ?1 OR ?1 = 'any' OR runner_type = 'any')
                 ORDER BY last_heartbeat ASC, id ASC LIMIT 1",
                params![runner_type],
                runner_from_row,
            )
            .optional()
            .context("Failed to query idle runner")
            .map_err(db_err)
    }

    /// Runners whose heartbeat is older than the cutoff and that are not
    /// already dead/disconnected.
    pub fn stale_runners(&self, cutoff_epoch: i64) -> Result<Vec<Runner>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, runner_type, status, current_job_id, last_heartbeat, registered_at
                 FROM runners
                 WHERE last_heartbeat < ?1 AND status IN ('connecting', 'idle', 'assigned', 'busy')
                 ORDER BY id",
            )
            .context("Failed to prepare stale_runners")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![cutoff_epoch], runner_from_row)
            .context("Failed to query stale runners")
            .map_err(db_err)?;
        collect_rows(rows)
    }

    // ── Pipelines ─────────────────────────────────────────────────────

    pub fn create_pipeline(
        &self,
        repo_id: i64,
        name: &str,
        steps: &[Step],
        triggers: &[TriggerDef],
        is_template: bool,
    ) -> Result<Pipeline> {
        let steps_json = serde_json::to_string(steps)
            .context("Failed to serialize steps")
            .map_err(db_err)?;
        let triggers_json = serde_json::to_string(triggers)
            .context("Failed to serialize triggers")
            .map_err(db_err)?;
        self.conn
            .execute(
                "INSERT INTO pipelines (repo_id, name, steps, triggers, is_template)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![repo_id, name, steps_json, triggers_json, is_template as i64],
            )
            .context("Failed to insert pipeline")
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_pipeline(id)?.ok_or(StoreError::NotFound {
            entity: "pipeline",
            id,
        })
    }

    pub fn update_pipeline(
        &self,
        id: i64,
        name: &str,
        steps: &[Step],
        triggers: &[TriggerDef],
    ) -> Result<Pipeline> {
        let steps_json = serde_json::to_string(steps)
            .context("Failed to serialize steps")
            .map_err(db_err)?;
        let triggers_json = serde_json::to_string(triggers)
            .context("Failed to serialize triggers")
            .map_err(db_err)?;
        self.conn
            .execute(
                "UPDATE pipelines SET name = ?1, steps = ?2, triggers = ?3 WHERE id = ?4",
                params![name, steps_json, triggers_json, id],
            )
            .context("Failed to update pipeline")
            .map_err(db_err)?;
        self.get_pipeline(id)?.ok_or(StoreError::NotFound {
            entity: "pipeline",
            id,
        })
    }

    pub fn get_pipeline(&self, id: i64) -> Result<Option<Pipeline>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, repo_id, name, steps, triggers, is_template, created_at
                 FROM pipelines WHERE id = ?1",
                params![id],
                pipeline_row,
            )
            .optional()
            .context("Failed to query pipeline")
            .map_err(db_err)?;
        row.map(PipelineRow::into_pipeline).transpose()
    }

    pub fn list_pipelines(&self, repo_id: Option<i64>) -> Result<Vec<Pipeline>> {
        let mut stmt;
        let rows = match repo_id {
            Some(repo) => {
                stmt = self
                    .conn
                    .prepare(
                        "SELECT id, repo_id, name, steps, triggers, is_template, created_at
                         FROM pipelines WHERE repo_id = ?1 ORDER BY id",
                    )
                    .context("Failed to prepare list_pipelines")
                    .map_err(db_err)?;
                stmt.query_map(params![repo], pipeline_row)
            }
            None => {
                stmt = self
                    .conn
                    .prepare(
                        "SELECT id, repo_id, name, steps, triggers, is_template, created_at
                         FROM pipelines ORDER BY id",
                    )
                    .context("Failed to prepare list_pipelines")
                    .map_err(db_err)?;
                stmt.query_map([], pipeline_row)
            }
        }
        .context("Failed to query pipelines")
        .map_err(db_err)?;
        let raw: Vec<PipelineRow> = collect_rows(rows)?;
        raw.into_iter().map(PipelineRow::into_pipeline).collect()
    }

    pub fn delete_pipeline(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM pipelines WHERE id = ?1", params![id])
            .context("Failed to delete pipeline")
            .map_err(db_err)?;
        Ok(count > 0)
    }

    // ── Pipeline runs ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_run(
        &mut self,
        pipeline_id: i64,
        repo_id: i64,
        trigger_type: &str,
        trigger_ref: Option<&str>,
        trigger_context: &serde_json::Value,
        branch_name: &str,
        step_names: &[String],
    ) -> Result<PipelineRun> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin create_run transaction")
            .map_err(db_err)?;
        let context = trigger_context.to_string();
        tx.execute(
            "INSERT INTO pipeline_runs (pipeline_id, repo_id, trigger_type, trigger_ref,
                                        trigger_context, branch_name, steps_total)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pipeline_id,
                repo_id,
                trigger_type,
                trigger_ref,
                context,
                branch_name,
                step_names.len() as i64
            ],
        )
        .context("Failed to insert pipeline run")
        .map_err(db_err)?;
        let run_id = tx.last_insert_rowid();
        for (index, name) in step_names.iter().enumerate() {
            tx.execute(
                "INSERT INTO step_runs (run_id, step_index, step_name) VALUES (?1, ?2, ?3)",
                params![run_id, index as i64, name],
            )
            .context("Failed to insert step run")
            .map_err(db_err)?;
        }
        tx.commit()
            .context("Failed to commit create_run")
            .map_err(db_err)?;
        self.get_run(run_id)?.ok_or(StoreError::NotFound {
            entity: "pipeline_run",
            id: run_id,
        })
    }

    pub fn get_run(&self, id: i64) -> Result<Option<PipelineRun>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", RUN_SELECT),
                params![id],
                run_row,
            )
            .optional()
            .context("Failed to query pipeline run")
            .map_err(db_err)?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn list_runs(&self, pipeline_id: Option<i64>) -> Result<Vec<PipelineRun>> {
        let mut stmt;
        let rows = match pipeline_id {
            Some(p) => {
                stmt = self
                    .conn
                    .prepare(&format!(
                        "{} WHERE pipeline_id = ?1 ORDER BY id DESC",
                        RUN_SELECT
                    ))
                    .context("Failed to prepare list_runs")
                    .map_err(db_err)?;
                stmt.query_map(params![p], run_row)
            }
            None => {
                stmt = self
                    .conn
                    .prepare(&format!("{} ORDER BY id DESC", RUN_SELECT))
                    .context("Failed to prepare list_runs")
                    .map_err(db_err)?;
                stmt.query_map([], run_row)
            }
        }
        .context("Failed to query pipeline runs")
        .map_err(db_err)?;
        let raw: Vec<RunRow> = collect_rows(rows)?;
        raw.into_iter().map(RunRow::into_run).collect()
    }

    /// Ids of runs that were mid-flight (for startup recovery).
    pub fn inflight_run_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM pipeline_runs WHERE status IN ('pending', 'running')")
            .context("Failed to prepare inflight_run_ids")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query in-flight runs")
            .map_err(db_err)?;
        collect_rows(rows)
    }

    pub fn run_set_status(
        &self,
        id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<PipelineRun> {
        if status.is_terminal() {
            self.conn
                .execute(
                    "UPDATE pipeline_runs SET status = ?1, error = ?2,
                            completed_at = datetime('now')
                     WHERE id = ?3 AND status NOT IN ('passed', 'failed', 'cancelled')",
                    params![status.as_str(), error, id],
                )
                .context("Failed to finish pipeline run")
                .map_err(db_err)?;
        } else {
            self.conn
                .execute(
                    "UPDATE pipeline_runs SET status = ?1, error = ?2 WHERE id = ?3",
                    params![status.as_str(), error, id],
                )
                .context("Failed to update pipeline run")
                .map_err(db_err)?;
        }
        self.get_run(id)?.ok_or(StoreError::NotFound {
            entity: "pipeline_run",
            id,
        })
    }

    pub fn run_progress(
        &self,
        id: i64,
        current_step: i64,
        steps_completed: i64,
    ) -> Result<PipelineRun> {
        self.conn
            .execute(
                "UPDATE pipeline_runs SET current_step = ?1, steps_completed = ?2 WHERE id = ?3",
                params![current_step, steps_completed, id],
            )
            .context("Failed to update run progress")
            .map_err(db_err)?;
        self.get_run(id)?.ok_or(StoreError::NotFound {
            entity: "pipeline_run",
            id,
        })
    }

    pub fn run_attach_debug(&self, id: i64, session_id: i64) -> Result<PipelineRun> {
        self.conn
            .execute(
                "UPDATE pipeline_runs SET debug_session_id = ?1 WHERE id = ?2",
                params![session_id, id],
            )
            .context("Failed to attach debug session")
            .map_err(db_err)?;
        self.get_run(id)?.ok_or(StoreError::NotFound {
            entity: "pipeline_run",
            id,
        })
    }

    // ── Step runs ─────────────────────────────────────────────────────

    pub fn get_step_run(&self, run_id: i64, step_index: i64) -> Result<Option<StepRun>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE run_id = ?1 AND step_index = ?2", STEP_RUN_SELECT),
                params![run_id, step_index],
                step_run_row,
            )
            .optional()
            .context("Failed to query step run")
            .map_err(db_err)?;
        row.map(StepRunRow::into_step_run).transpose()
    }

    pub fn list_step_runs(&self, run_id: i64) -> Result<Vec<StepRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE run_id = ?1 ORDER BY step_index",
                STEP_RUN_SELECT
            ))
            .context("Failed to prepare list_step_runs")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![run_id], step_run_row)
            .context("Failed to query step runs")
            .map_err(db_err)?;
        let raw: Vec<StepRunRow> = collect_rows(rows)?;
        raw.into_iter().map(StepRunRow::into_step_run).collect()
    }

    pub fn step_run_start(&self, run_id: i64, step_index: i64, job_id: Option<i64>) -> Result<StepRun> {
        self.conn
            .execute(
                "UPDATE step_runs SET status = 'running', job_id = ?1,
                        started_at = datetime('now')
                 WHERE run_id = ?2 AND step_index = ?3",
                params![job_id, run_id, step_index],
            )
            .context("Failed to start step run")
            .map_err(db_err)?;
        self.get_step_run(run_id, step_index)?
            .ok_or(StoreError::NotFound {
                entity: "step_run",
                id: step_index,
            })
    }

    pub fn step_run_finish(
        &self,
        run_id: i64,
        step_index: i64,
        status: RunStatus,
        logs: &str,
        error: Option<&str>,
    ) -> Result<StepRun> {
        debug_assert!(status.is_terminal());
        self.conn
            .execute(
                "UPDATE step_runs SET status = ?1, logs = ?2, error = ?3,
                        completed_at = datetime('now')
                 WHERE run_id = ?4 AND step_index = ?5
                   AND status NOT IN ('passed', 'failed', 'cancelled')",
                params![status.as_str(), logs, error, run_id, step_index],
            )
            .context("Failed to finish step run")
            .map_err(db_err)?;
        self.get_step_run(run_id, step_index)?
            .ok_or(StoreError::NotFound {
                entity: "step_run",
                id: step_index,
            })
    }

    // ── Agent files ───────────────────────────────────────────────────

    pub fn create_agent_file(
        &self,
        name: &str,
        description: &str,
        content: &str,
    ) -> Result<AgentFile> {
        let result = self.conn.execute(
            "INSERT INTO agent_files (name, description, content) VALUES (?1, ?2, ?3)",
            params![name, description, content],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::AlreadyExists(format!("agent file '{}'", name)));
            }
            Err(e) => {
                return Err(db_err(anyhow::Error::new(e).context("Failed to insert agent file")));
            }
        }
        let id = self.conn.last_insert_rowid();
        self.get_agent_file(id)?.ok_or(StoreError::NotFound {
            entity: "agent_file",
            id,
        })
    }

    pub fn get_agent_file(&self, id: i64) -> Result<Option<AgentFile>> {
        self.conn
            .query_row(
                "SELECT id, name, description, content, created_at, updated_at
                 FROM agent_files WHERE id = ?1",
                params![id],
                agent_file_from_row,
            )
            .optional()
            .context("Failed to query agent file")
            .map_err(db_err)
    }

    pub fn get_agent_file_by_name(&self, name: &str) -> Result<Option<AgentFile>> {
        self.conn
            .query_row(
                "SELECT id, name, description, content, created_at, updated_at
                 FROM agent_files WHERE name = ?1",
                params![name],
                agent_file_from_row,
            )
            .optional()
            .context("Failed to query agent file by name")
            .map_err(db_err)
    }

    pub fn list_agent_files(&self) -> Result<Vec<AgentFile>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, content, created_at, updated_at
                 FROM agent_files ORDER BY name",
            )
            .context("Failed to prepare list_agent_files")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], agent_file_from_row)
            .context("Failed to query agent files")
            .map_err(db_err)?;
        collect_rows(rows)
    }

    pub fn update_agent_file(
        &self,
        id: i64,
        description: Option<&str>,
        content: Option<&str>,
    ) -> Result<AgentFile> {
        if let Some(d) = description {
            self.conn
                .execute(
                    "UPDATE agent_files SET description = ?1, updated_at = datetime('now')
                     WHERE id = ?2",
                    params![d, id],
                )
                .context("Failed to update agent file description")
                .map_err(db_err)?;
        }
        if let Some(c) = content {
            self.conn
                .execute(
                    "UPDATE agent_files SET content = ?1, updated_at = datetime('now')
                     WHERE id = ?2",
                    params![c, id],
                )
                .context("Failed to update agent file content")
                .map_err(db_err)?;
        }
        self.get_agent_file(id)?.ok_or(StoreError::NotFound {
            entity: "agent_file",
            id,
        })
    }

    pub fn delete_agent_file(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM agent_files WHERE id = ?1", params![id])
            .context("Failed to delete agent file")
            .map_err(db_err)?;
        Ok(count > 0)
    }

    // ── Debug sessions ────────────────────────────────────────────────

    pub fn create_debug_session(
        &self,
        run_id: i64,
        breakpoints: &[i64],
        token: &str,
        expires_at: i64,
    ) -> Result<DebugSession> {
        let bps = serde_json::to_string(breakpoints)
            .context("Failed to serialize breakpoints")
            .map_err(db_err)?;
        self.conn
            .execute(
                "INSERT INTO debug_sessions (run_id, breakpoints, token, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, bps, token, expires_at],
            )
            .context("Failed to insert debug session")
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_debug_session(id)?.ok_or(StoreError::NotFound {
            entity: "debug_session",
            id,
        })
    }

    pub fn get_debug_session(&self, id: i64) -> Result<Option<DebugSession>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, run_id, breakpoints, status, current_step, token, expires_at,
                        created_at
                 FROM debug_sessions WHERE id = ?1",
                params![id],
                debug_session_row,
            )
            .optional()
            .context("Failed to query debug session")
            .map_err(db_err)?;
        row.map(DebugSessionRow::into_session).transpose()
    }

    pub fn debug_set_status(
        &self,
        id: i64,
        status: DebugStatus,
        current_step: Option<i64>,
    ) -> Result<DebugSession> {
        self.conn
            .execute(
                "UPDATE debug_sessions SET status = ?1,
                        current_step = COALESCE(?2, current_step)
                 WHERE id = ?3",
                params![status.as_str(), current_step, id],
            )
            .context("Failed to update debug session")
            .map_err(db_err)?;
        self.get_debug_session(id)?.ok_or(StoreError::NotFound {
            entity: "debug_session",
            id,
        })
    }

    /// Consume the single-use join token. Succeeds at most once.
    pub fn debug_take_token(&self, id: i64, token: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE debug_sessions SET token = NULL WHERE id = ?1 AND token = ?2",
                params![id, token],
            )
            .context("Failed to consume debug token")
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Sessions past their expiry that are still live.
    pub fn expired_debug_sessions(&self, now: i64) -> Result<Vec<DebugSession>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, breakpoints, status, current_step, token, expires_at,
                        created_at
                 FROM debug_sessions
                 WHERE expires_at < ?1 AND status IN ('pending', 'waiting_at_bp', 'connected')",
            )
            .context("Failed to prepare expired_debug_sessions")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![now], debug_session_row)
            .context("Failed to query expired sessions")
            .map_err(db_err)?;
        let raw: Vec<DebugSessionRow> = collect_rows(rows)?;
        raw.into_iter().map(DebugSessionRow::into_session).collect()
    }

    // ── Startup recovery ──────────────────────────────────────────────

    /// Move every orphaned in-flight row to its failed terminal state and
    /// reset all runner rows. Returns what was touched so the composition
    /// root can publish events and warnings.
    pub fn recover_startup(&mut self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let orphan_job_ids: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM jobs WHERE status = 'running'")
                .context("Failed to prepare orphan scan")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .context("Failed to query orphan jobs")
                .map_err(db_err)?;
            collect_rows(rows)?
        };

        for job_id in orphan_job_ids {
            if let Some(job) = self.finish_job(
                job_id,
                JobStatus::Failed,
                Some("restart during execution"),
                None,
                None,
            )? {
                if let Some(card_id) = job.card_id {
                    if let Ok(card) =
                        self.card_transition(card_id, CardStatus::InProgress, CardStatus::Failed)
                    {
                        report.failed_cards.push(card);
                    }
                }
                report.failed_jobs.push(job);
            }
        }

        for run_id in self.inflight_run_ids()? {
            let step_runs = self.list_step_runs(run_id)?;
            for step in step_runs {
                if step.status == RunStatus::Running {
                    self.step_run_finish(
                        run_id,
                        step.step_index,
                        RunStatus::Failed,
                        &step.logs,
                        Some("restart during execution"),
                    )?;
                }
            }
            // Keep the counter equal to the number of terminal step runs.
            self.conn
                .execute(
                    "UPDATE pipeline_runs SET steps_completed =
                        (SELECT COUNT(*) FROM step_runs
                         WHERE step_runs.run_id = pipeline_runs.id
                           AND step_runs.status IN ('passed', 'failed', 'cancelled'))
                     WHERE id = ?1",
                    params![run_id],
                )
                .context("Failed to resync run counters")
                .map_err(db_err)?;
            let run =
                self.run_set_status(run_id, RunStatus::Failed, Some("restart during execution"))?;
            report.failed_runs.push(run);
        }

        self.conn
            .execute(
                "UPDATE runners SET status = 'disconnected', current_job_id = NULL",
                [],
            )
            .context("Failed to reset runners")
            .map_err(db_err)?;
        report.reset_runners = self.list_runners()?;

        Ok(report)
    }
}

/// What startup recovery touched.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub failed_jobs: Vec<Job>,
    pub failed_cards: Vec<Card>,
    pub failed_runs: Vec<PipelineRun>,
    pub reset_runners: Vec<Runner>,
}

// ── Async handle ──────────────────────────────────────────────────────

/// Thin `Arc<Mutex<Db>>` that moves closures onto the blocking pool.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Db) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut db = inner.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut db)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("blocking task failed: {}", e)))?
    }

    /// Synchronous access for startup, before the runtime serves requests.
    pub fn lock_sync(&self) -> Result<MutexGuard<'_, Db>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("Failed to read row").map_err(db_err)?);
    }
    Ok(out)
}

fn repo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repo> {
    Ok(Repo {
        id: row.get(0)?,
        name: row.get(1)?,
        default_branch: row.get(2)?,
        ingested: row.get::<_, i64>(3)? != 0,
        clone_url: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn runner_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Runner> {
    let status: String = row.get(2)?;
    Ok(Runner {
        id: row.get(0)?,
        runner_type: row.get(1)?,
        status: RunnerStatus::parse(&status).unwrap_or(RunnerStatus::Disconnected),
        current_job_id: row.get(3)?,
        last_heartbeat: row.get(4)?,
        registered_at: row.get(5)?,
    })
}

fn agent_file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentFile> {
    Ok(AgentFile {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const CARD_SELECT: &str = "SELECT id, repo_id, title, description, status, runner_type,
        step_config, branch_name, current_job_id, pipeline_run_id, step_index, conflict,
        created_at, updated_at FROM cards";

struct CardRow {
    id: i64,
    repo_id: i64,
    title: String,
    description: String,
    status: String,
    runner_type: String,
    step_config: String,
    branch_name: Option<String>,
    current_job_id: Option<i64>,
    pipeline_run_id: Option<i64>,
    step_index: Option<i64>,
    conflict: Option<String>,
    created_at: String,
    updated_at: String,
}

fn card_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CardRow> {
    Ok(CardRow {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        runner_type: row.get(5)?,
        step_config: row.get(6)?,
        branch_name: row.get(7)?,
        current_job_id: row.get(8)?,
        pipeline_run_id: row.get(9)?,
        step_index: row.get(10)?,
        conflict: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl CardRow {
    fn into_card(self) -> Result<Card> {
        let status = CardStatus::parse(&self.status).map_err(StoreError::Validation)?;
        let step: StepConfig = serde_json::from_str(&self.step_config)
            .context("Failed to parse card step config")
            .map_err(db_err)?;
        let conflict = self
            .conflict
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse card conflict record")
            .map_err(db_err)?;
        Ok(Card {
            id: self.id,
            repo_id: self.repo_id,
            title: self.title,
            description: self.description,
            status,
            runner_type: self.runner_type,
            step,
            branch_name: self.branch_name,
            current_job_id: self.current_job_id,
            pipeline_run_id: self.pipeline_run_id,
            step_index: self.step_index,
            conflict,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const JOB_SELECT: &str = "SELECT id, card_id, repo_id, required_runner_type, status,
        step_config, prompt, agent_files, continuation, pinned_runner_id, ephemeral,
        priority, runner_id, logs, error, branch_name, test_results, deadline_secs,
        created_at, started_at, finished_at FROM jobs";

struct JobRow {
    id: i64,
    card_id: Option<i64>,
    repo_id: i64,
    required_runner_type: String,
    status: String,
    step_config: String,
    prompt: Option<String>,
    agent_files: String,
    continuation: i64,
    pinned_runner_id: Option<i64>,
    ephemeral: i64,
    priority: i64,
    runner_id: Option<i64>,
    logs: String,
    error: Option<String>,
    branch_name: Option<String>,
    test_results: Option<String>,
    deadline_secs: i64,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        card_id: row.get(1)?,
        repo_id: row.get(2)?,
        required_runner_type: row.get(3)?,
        status: row.get(4)?,
        step_config: row.get(5)?,
        prompt: row.get(6)?,
        agent_files: row.get(7)?,
        continuation: row.get(8)?,
        pinned_runner_id: row.get(9)?,
        ephemeral: row.get(10)?,
        priority: row.get(11)?,
        runner_id: row.get(12)?,
        logs: row.get(13)?,
        error: row.get(14)?,
        branch_name: row.get(15)?,
        test_results: row.get(16)?,
        deadline_secs: row.get(17)?,
        created_at: row.get(18)?,
        started_at: row.get(19)?,
        finished_at: row.get(20)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status).map_err(StoreError::Validation)?;
        let step: StepConfig = serde_json::from_str(&self.step_config)
            .context("Failed to parse job step config")
            .map_err(db_err)?;
        let agent_files: Vec<String> = serde_json::from_str(&self.agent_files)
            .context("Failed to parse job agent files")
            .map_err(db_err)?;
        let test_results = self
            .test_results
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse job test results")
            .map_err(db_err)?;
        Ok(Job {
            id: self.id,
            card_id: self.card_id,
            repo_id: self.repo_id,
            required_runner_type: self.required_runner_type,
            status,
            step,
            prompt: self.prompt,
            agent_files,
            continuation: self.continuation != 0,
            pinned_runner_id: self.pinned_runner_id,
            ephemeral: self.ephemeral != 0,
            priority: self.priority,
            runner_id: self.runner_id,
            logs: self.logs,
            error: self.error,
            branch_name: self.branch_name,
            test_results,
            deadline_secs: self.deadline_secs as u64,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

struct PipelineRow {
    id: i64,
    repo_id: i64,
    name: String,
    steps: String,
    triggers: String,
    is_template: i64,
    created_at: String,
}

fn pipeline_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRow> {
    Ok(PipelineRow {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        name: row.get(2)?,
        steps: row.get(3)?,
        triggers: row.get(4)?,
        is_template: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl PipelineRow {
    fn into_pipeline(self) -> Result<Pipeline> {
        let steps: Vec<Step> = serde_json::from_str(&self.steps)
            .context("Failed to parse pipeline steps")
            .map_err(db_err)?;
        let triggers: Vec<TriggerDef> = serde_json::from_str(&self.triggers)
            .context("Failed to parse pipeline triggers")
            .map_err(db_err)?;
        Ok(Pipeline {
            id: self.id,
            repo_id: self.repo_id,
            name: self.name,
            steps,
            triggers,
            is_template: self.is_template != 0,
            created_at: self.created_at,
        })
    }
}

const RUN_SELECT: &str = "SELECT id, pipeline_id, repo_id, status, trigger_type, trigger_ref,
        trigger_context, branch_name, current_step, steps_total, steps_completed,
        debug_session_id, error, started_at, completed_at FROM pipeline_runs";

struct RunRow {
    id: i64,
    pipeline_id: i64,
    repo_id: i64,
    status: String,
    trigger_type: String,
    trigger_ref: Option<String>,
    trigger_context: String,
    branch_name: String,
    current_step: i64,
    steps_total: i64,
    steps_completed: i64,
    debug_session_id: Option<i64>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

fn run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        repo_id: row.get(2)?,
        status: row.get(3)?,
        trigger_type: row.get(4)?,
        trigger_ref: row.get(5)?,
        trigger_context: row.get(6)?,
        branch_name: row.get(7)?,
        current_step: row.get(8)?,
        steps_total: row.get(9)?,
        steps_completed: row.get(10)?,
        debug_session_id: row.get(11)?,
        error: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

impl RunRow {
    fn into_run(self) -> Result<PipelineRun> {
        let status = RunStatus::parse(&self.status).map_err(StoreError::Validation)?;
        let trigger_context = serde_json::from_str(&self.trigger_context)
            .context("Failed to parse trigger context")
            .map_err(db_err)?;
        Ok(PipelineRun {
            id: self.id,
            pipeline_id: self.pipeline_id,
            repo_id: self.repo_id,
            status,
            trigger_type: self.trigger_type,
            trigger_ref: self.trigger_ref,
            trigger_context,
            branch_name: self.branch_name,
            current_step: self.current_step,
            steps_total: self.steps_total,
            steps_completed: self.steps_completed,
            debug_session_id: self.debug_session_id,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

const STEP_RUN_SELECT: &str = "SELECT id, run_id, step_index, step_name, status, job_id,
        logs, error, started_at, completed_at FROM step_runs";

struct StepRunRow {
    id: i64,
    run_id: i64,
    step_index: i64,
    step_name: String,
    status: String,
    job_id: Option<i64>,
    logs: String,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn step_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRunRow> {
    Ok(StepRunRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_index: row.get(2)?,
        step_name: row.get(3)?,
        status: row.get(4)?,
        job_id: row.get(5)?,
        logs: row.get(6)?,
        error: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

impl StepRunRow {
    fn into_step_run(self) -> Result<StepRun> {
        let status = RunStatus::parse(&self.status).map_err(StoreError::Validation)?;
        Ok(StepRun {
            id: self.id,
            run_id: self.run_id,
            step_index: self.step_index,
            step_name: self.step_name,
            status,
            job_id: self.job_id,
            logs: self.logs,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct DebugSessionRow {
    id: i64,
    run_id: i64,
    breakpoints: String,
    status: String,
    current_step: Option<i64>,
    token: Option<String>,
    expires_at: i64,
    created_at: String,
}

fn debug_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DebugSessionRow> {
    Ok(DebugSessionRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        breakpoints: row.get(2)?,
        status: row.get(3)?,
        current_step: row.get(4)?,
        token: row.get(5)?,
        expires_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl DebugSessionRow {
    fn into_session(self) -> Result<DebugSession> {
        let status = DebugStatus::parse(&self.status).map_err(StoreError::Validation)?;
        let breakpoints: Vec<i64> = serde_json::from_str(&self.breakpoints)
            .context("Failed to parse breakpoints")
            .map_err(db_err)?;
        Ok(DebugSession {
            id: self.id,
            run_id: self.run_id,
            breakpoints,
            status,
            current_step: self.current_step,
            token: self.token,
            expires_at: self.expires_at,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
