//! Internal git server: bare-repo hosting and the merge/rebase/diff
//! primitives the engine and card service consume.
//!
//! One bare repository per ingested repo lives under the data root. All
//! object-level work goes through `git2`; the smart-HTTP transport
//! (`http.rs`) shells out to `git` itself. Ref-mutating operations
//! serialize per repo via an advisory lock.

pub mod assets;
pub mod http;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::build::TreeUpdateBuilder;
use git2::{BranchType, Delta, DiffOptions, FileMode, Oid, Repository, Signature, Time};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::errors::GitHostError;

type Result<T> = std::result::Result<T, GitHostError>;

/// Directory committed onto working branches to carry logs and notes
/// across pipeline steps.
pub const CONTEXT_DIR: &str = ".lazyaf-context";

/// Repo-scoped asset tree.
pub const ASSET_DIR: &str = ".lazyaf";

// ── Result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    pub name: String,
    pub sha: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileDiff {
    pub path: String,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
    pub patch: String,
}

/// Per-file conflict triple. Content is `None` when the side does not
/// have the file (add/add or delete conflicts).
#[derive(Debug, Clone, Serialize)]
pub struct ConflictFile {
    pub path: String,
    pub base: Option<String>,
    pub ours: Option<String>,
    pub theirs: Option<String>,
}

/// Outcome of the merge primitive. Conflicts never write.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MergeOutcome {
    FastForward { sha: String },
    Merge { sha: String },
    Conflict { files: Vec<ConflictFile> },
}

impl MergeOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Outcome of the rebase primitive (theirs = onto).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RebaseOutcome {
    Clean { sha: String },
    Conflict { files: Vec<ConflictFile> },
}

/// One accepted ref update, fed to the trigger bus by the push hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub repo_id: i64,
    pub ref_name: String,
    pub old_sha: String,
    pub new_sha: String,
}

pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

// ── Host ──────────────────────────────────────────────────────────────

pub struct GitHost {
    root: PathBuf,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl GitHost {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).map_err(|e| GitHostError::Io {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn repo_path(&self, repo_id: i64) -> PathBuf {
        self.root.join(format!("{}.git", repo_id))
    }

    pub fn is_ingested(&self, repo_id: i64) -> bool {
        self.repo_path(repo_id).join("HEAD").exists()
    }

    /// Advisory per-repo lock. Hold the guard across any ref-mutating
    /// sequence (merge, rebase, receive-pack).
    pub async fn repo_lock(&self, repo_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(repo_id).or_default())
    }

    /// Create an empty bare repository with HEAD pointing at the default
    /// branch. Idempotent.
    pub async fn init_bare(&self, repo_id: i64, default_branch: &str) -> Result<()> {
        let path = self.repo_path(repo_id);
        let branch = default_branch.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if path.join("HEAD").exists() {
                return Ok(());
            }
            let repo = Repository::init_bare(&path)?;
            repo.set_head(&format!("refs/heads/{}", branch))?;
            Ok(())
        })
        .await
        .map_err(|e| GitHostError::Transport(format!("blocking task failed: {}", e)))?
    }

    /// Mirror-clone `source` (local path or URL) into the bare repo. Fails
    /// with `AlreadyExists` semantics at the store layer; here a populated
    /// repo is simply left alone.
    pub async fn ingest(&self, repo_id: i64, source: &str, default_branch: &str) -> Result<()> {
        let path = self.repo_path(repo_id);
        if path.join("HEAD").exists() {
            // Re-ingest over an existing mirror is a no-op.
            return Ok(());
        }
        let output = tokio::process::Command::new("git")
            .args([
                "clone",
                "--mirror",
                source,
                &path.to_string_lossy(),
            ])
            .output()
            .await
            .map_err(|e| GitHostError::Transport(format!("failed to spawn git clone: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitHostError::Transport(format!(
                "git clone --mirror failed: {}",
                stderr.trim()
            )));
        }
        let branch = default_branch.to_string();
        let head_path = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = Repository::open_bare(&head_path)?;
            if repo
                .find_branch(&branch, BranchType::Local)
                .is_ok()
            {
                repo.set_head(&format!("refs/heads/{}", branch))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| GitHostError::Transport(format!("blocking task failed: {}", e)))?
    }

    pub async fn delete_repo_dir(&self, repo_id: i64) -> Result<()> {
        let path = self.repo_path(repo_id);
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| GitHostError::Io { path, source: e })?;
        }
        Ok(())
    }

    // ── Read primitives ───────────────────────────────────────────────

    pub async fn list_branches(&self, repo_id: i64) -> Result<Vec<BranchInfo>> {
        self.blocking(repo_id, |repo| {
            let mut out = Vec::new();
            for entry in repo.branches(Some(BranchType::Local))? {
                let (branch, _) = entry?;
                let name = branch
                    .name()?
                    .ok_or_else(|| GitHostError::InvalidRef("non-utf8 branch".into()))?
                    .to_string();
                let sha = branch
                    .get()
                    .target()
                    .map(|oid| oid.to_string())
                    .unwrap_or_default();
                out.push(BranchInfo { name, sha });
            }
            out.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(out)
        })
        .await
    }

    pub async fn commits(&self, repo_id: i64, branch: &str, limit: usize) -> Result<Vec<CommitInfo>> {
        let branch = branch.to_string();
        self.blocking(repo_id, move |repo| {
            let tip = branch_commit(repo, &branch)?;
            let mut walk = repo.revwalk()?;
            walk.push(tip.id())?;
            let mut out = Vec::new();
            for oid in walk.take(limit) {
                let commit = repo.find_commit(oid?)?;
                out.push(CommitInfo {
                    sha: commit.id().to_string(),
                    message: commit.message().unwrap_or_default().to_string(),
                    author: commit.author().name().unwrap_or_default().to_string(),
                    timestamp: commit.time().seconds(),
                });
            }
            Ok(out)
        })
        .await
    }

    /// Per-file status + patch + counts between two refs.
    pub async fn diff(&self, repo_id: i64, base: &str, head: &str) -> Result<Vec<FileDiff>> {
        let base = base.to_string();
        let head = head.to_string();
        self.blocking(repo_id, move |repo| {
            let base_tree = resolve_commit(repo, &base)?.tree()?;
            let head_tree = resolve_commit(repo, &head)?.tree()?;
            let mut opts = DiffOptions::new();
            let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), Some(&mut opts))?;

            let mut out = Vec::new();
            for delta_idx in 0..diff.deltas().len() {
                let Some(delta) = diff.get_delta(delta_idx) else {
                    continue;
                };
                let status = match delta.status() {
                    Delta::Added => FileStatus::Added,
                    Delta::Modified => FileStatus::Modified,
                    Delta::Deleted => FileStatus::Deleted,
                    Delta::Renamed => FileStatus::Renamed,
                    _ => continue,
                };
                let path = delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();

                let mut additions = 0;
                let mut deletions = 0;
                let mut patch_text = String::new();
                if let Ok(Some(mut patch)) = git2::Patch::from_diff(&diff, delta_idx) {
                    let mut buf = Vec::new();
                    patch
                        .print(&mut |_d, _h, line| {
                            match line.origin() {
                                '+' => additions += 1,
                                '-' => deletions += 1,
                                _ => {}
                            }
                            buf.extend_from_slice(line.content());
                            true
                        })
                        .ok();
                    patch_text = String::from_utf8_lossy(&buf).to_string();
                }
                out.push(FileDiff {
                    path,
                    status,
                    additions,
                    deletions,
                    patch: patch_text,
                });
            }
            Ok(out)
        })
        .await
    }

    /// Read a file from a branch tip without a working copy.
    pub async fn read_branch_file(
        &self,
        repo_id: i64,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let branch = branch.to_string();
        let path = path.to_string();
        self.blocking(repo_id, move |repo| {
            let tip = branch_commit(repo, &branch)?;
            let tree = tip.tree()?;
            let entry = match tree.get_path(Path::new(&path)) {
                Ok(entry) => entry,
                Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let blob = repo.find_blob(entry.id())?;
            Ok(Some(String::from_utf8_lossy(blob.content()).to_string()))
        })
        .await
    }

    /// Ref name → sha snapshot; the push hook diffs two of these.
    pub async fn refs_snapshot(&self, repo_id: i64) -> Result<HashMap<String, String>> {
        self.blocking(repo_id, |repo| {
            let mut out = HashMap::new();
            for reference in repo.references()? {
                let reference = reference?;
                if let (Some(name), Some(target)) = (reference.name(), reference.target()) {
                    if name.starts_with("refs/heads/") || name.starts_with("refs/tags/") {
                        out.insert(name.to_string(), target.to_string());
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    // ── Write primitives ──────────────────────────────────────────────

    /// Merge `src` into `dst`: fast-forward preferred, three-way merge
    /// commit otherwise, structured conflict (no write) on failure.
    pub async fn merge(&self, repo_id: i64, src: &str, dst: &str) -> Result<MergeOutcome> {
        let lock = self.repo_lock(repo_id).await;
        let _guard = lock.lock().await;
        let src = src.to_string();
        let dst = dst.to_string();
        self.blocking(repo_id, move |repo| merge_branches(repo, &src, &dst))
            .await
    }

    /// Rebase `branch` onto `onto`: replay each commit, structured
    /// conflict (no write) on the first failure.
    pub async fn rebase(&self, repo_id: i64, branch: &str, onto: &str) -> Result<RebaseOutcome> {
        let lock = self.repo_lock(repo_id).await;
        let _guard = lock.lock().await;
        let branch = branch.to_string();
        let onto = onto.to_string();
        self.blocking(repo_id, move |repo| rebase_branch(repo, &branch, &onto))
            .await
    }

    pub async fn delete_branch(&self, repo_id: i64, name: &str) -> Result<()> {
        let lock = self.repo_lock(repo_id).await;
        let _guard = lock.lock().await;
        let name = name.to_string();
        self.blocking(repo_id, move |repo| {
            let mut branch = repo
                .find_branch(&name, BranchType::Local)
                .map_err(|_| GitHostError::BranchNotFound(name.clone()))?;
            branch.delete()?;
            Ok(())
        })
        .await
    }

    /// Create `branch` at the tip of `from` if it does not exist yet.
    pub async fn ensure_branch(&self, repo_id: i64, branch: &str, from: &str) -> Result<String> {
        let lock = self.repo_lock(repo_id).await;
        let _guard = lock.lock().await;
        let branch = branch.to_string();
        let from = from.to_string();
        self.blocking(repo_id, move |repo| {
            if let Ok(existing) = repo.find_branch(&branch, BranchType::Local) {
                return Ok(existing
                    .get()
                    .target()
                    .map(|o| o.to_string())
                    .unwrap_or_default());
            }
            let tip = branch_commit(repo, &from)?;
            repo.branch(&branch, &tip, false)?;
            Ok(tip.id().to_string())
        })
        .await
    }

    /// Commit a set of text files onto a branch tip (no working copy).
    /// Returns the new tip sha; a no-op change returns the current tip.
    pub async fn commit_files(
        &self,
        repo_id: i64,
        branch: &str,
        files: Vec<(String, String)>,
        message: &str,
    ) -> Result<String> {
        let lock = self.repo_lock(repo_id).await;
        let _guard = lock.lock().await;
        let branch = branch.to_string();
        let message = message.to_string();
        self.blocking(repo_id, move |repo| {
            let tip = branch_commit(repo, &branch)?;
            let base_tree = tip.tree()?;
            let mut update = TreeUpdateBuilder::new();
            for (path, content) in &files {
                let blob = repo.blob(content.as_bytes())?;
                update.upsert(path.as_str(), blob, FileMode::Blob);
            }
            let new_tree_oid = update.create_updated(repo, &base_tree)?;
            if new_tree_oid == base_tree.id() {
                return Ok(tip.id().to_string());
            }
            let tree = repo.find_tree(new_tree_oid)?;
            let sig = Signature::now("lazyaf", "lazyaf@localhost")?;
            let oid = repo.commit(
                Some(&format!("refs/heads/{}", branch)),
                &sig,
                &sig,
                &message,
                &tree,
                &[&tip],
            )?;
            Ok(oid.to_string())
        })
        .await
    }

    /// Drop the context directory from a branch tip so a squash-merge
    /// leaves the target clean. No-op when the directory is absent.
    pub async fn remove_context_dir(&self, repo_id: i64, branch: &str) -> Result<Option<String>> {
        let lock = self.repo_lock(repo_id).await;
        let _guard = lock.lock().await;
        let branch = branch.to_string();
        self.blocking(repo_id, move |repo| {
            let tip = branch_commit(repo, &branch)?;
            let base_tree = tip.tree()?;
            if base_tree.get_path(Path::new(CONTEXT_DIR)).is_err() {
                return Ok(None);
            }
            let mut update = TreeUpdateBuilder::new();
            update.remove(CONTEXT_DIR);
            let new_tree_oid = update.create_updated(repo, &base_tree)?;
            let tree = repo.find_tree(new_tree_oid)?;
            let sig = Signature::now("lazyaf", "lazyaf@localhost")?;
            let oid = repo.commit(
                Some(&format!("refs/heads/{}", branch)),
                &sig,
                &sig,
                &format!("Remove {}", CONTEXT_DIR),
                &tree,
                &[&tip],
            )?;
            Ok(Some(oid.to_string()))
        })
        .await
    }

    async fn blocking<T, F>(&self, repo_id: i64, f: F) -> Result<T>
    where
        F: FnOnce(&Repository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.repo_path(repo_id);
        tokio::task::spawn_blocking(move || {
            if !path.join("HEAD").exists() {
                return Err(GitHostError::NotIngested(repo_id));
            }
            let repo = Repository::open_bare(&path)?;
            f(&repo)
        })
        .await
        .map_err(|e| GitHostError::Transport(format!("blocking task failed: {}", e)))?
    }
}

// ── Merge/rebase internals ────────────────────────────────────────────

fn branch_commit<'r>(repo: &'r Repository, branch: &str) -> Result<git2::Commit<'r>> {
    let reference = repo
        .find_branch(branch, BranchType::Local)
        .map_err(|_| GitHostError::BranchNotFound(branch.to_string()))?;
    Ok(reference.get().peel_to_commit()?)
}

fn resolve_commit<'r>(repo: &'r Repository, refish: &str) -> Result<git2::Commit<'r>> {
    let object = repo
        .revparse_single(refish)
        .map_err(|_| GitHostError::InvalidRef(refish.to_string()))?;
    object
        .peel_to_commit()
        .map_err(|_| GitHostError::InvalidRef(refish.to_string()))
}

fn blob_text(repo: &Repository, oid: Option<Oid>) -> Option<String> {
    let oid = oid?;
    let blob = repo.find_blob(oid).ok()?;
    Some(String::from_utf8_lossy(blob.content()).to_string())
}

fn collect_conflicts(repo: &Repository, index: &git2::Index) -> Result<Vec<ConflictFile>> {
    let mut files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let path_bytes = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|e| e.path.clone())
            .unwrap_or_default();
        let path = String::from_utf8_lossy(&path_bytes).to_string();
        files.push(ConflictFile {
            path,
            base: blob_text(repo, conflict.ancestor.as_ref().map(|e| e.id)),
            ours: blob_text(repo, conflict.our.as_ref().map(|e| e.id)),
            theirs: blob_text(repo, conflict.their.as_ref().map(|e| e.id)),
        });
    }
    Ok(files)
}

/// Deterministic committer for merge/rebase products: the signature time
/// is a function of the input commits, so identical inputs produce
/// identical shas.
fn derived_signature(a: &git2::Commit<'_>, b: &git2::Commit<'_>) -> Result<Signature<'static>> {
    let seconds = a.time().seconds().max(b.time().seconds());
    Ok(Signature::new(
        "lazyaf",
        "lazyaf@localhost",
        &Time::new(seconds, 0),
    )?)
}

fn merge_branches(repo: &Repository, src: &str, dst: &str) -> Result<MergeOutcome> {
    let src_commit = branch_commit(repo, src)?;
    let dst_commit = branch_commit(repo, dst)?;

    if src_commit.id() == dst_commit.id() {
        return Ok(MergeOutcome::FastForward {
            sha: dst_commit.id().to_string(),
        });
    }

    let base = repo.merge_base(src_commit.id(), dst_commit.id())?;

    // src already contained in dst: nothing to do.
    if base == src_commit.id() {
        return Ok(MergeOutcome::FastForward {
            sha: dst_commit.id().to_string(),
        });
    }

    // dst is an ancestor of src: fast-forward the ref.
    if base == dst_commit.id() {
        repo.reference(
            &format!("refs/heads/{}", dst),
            src_commit.id(),
            true,
            &format!("Merge {} into {}", src, dst),
        )?;
        return Ok(MergeOutcome::FastForward {
            sha: src_commit.id().to_string(),
        });
    }

    let mut index = repo.merge_commits(&dst_commit, &src_commit, None)?;
    if index.has_conflicts() {
        let files = collect_conflicts(repo, &index)?;
        return Ok(MergeOutcome::Conflict { files });
    }

    let tree_oid = index.write_tree_to(repo)?;
    let tree = repo.find_tree(tree_oid)?;
    let sig = derived_signature(&src_commit, &dst_commit)?;
    let oid = repo.commit(
        Some(&format!("refs/heads/{}", dst)),
        &sig,
        &sig,
        &format!("Merge {} into {}", src, dst),
        &tree,
        &[&dst_commit, &src_commit],
    )?;
    Ok(MergeOutcome::Merge {
        sha: oid.to_string(),
    })
}

fn rebase_branch(repo: &Repository, branch: &str, onto: &str) -> Result<RebaseOutcome> {
    let branch_tip = branch_commit(repo, branch)?;
    let onto_tip = branch_commit(repo, onto)?;

    let base = repo.merge_base(branch_tip.id(), onto_tip.id())?;

    // Already based on onto.
    if base == onto_tip.id() {
        return Ok(RebaseOutcome::Clean {
            sha: branch_tip.id().to_string(),
        });
    }

    // Nothing of our own to replay: the branch just moves to onto.
    if base == branch_tip.id() {
        repo.reference(
            &format!("refs/heads/{}", branch),
            onto_tip.id(),
            true,
            &format!("Rebase {} onto {}", branch, onto),
        )?;
        return Ok(RebaseOutcome::Clean {
            sha: onto_tip.id().to_string(),
        });
    }

    // Collect branch-only commits, oldest first.
    let mut walk = repo.revwalk()?;
    walk.push(branch_tip.id())?;
    walk.hide(base)?;
    walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)?;
    let mut to_replay = Vec::new();
    for oid in walk {
        to_replay.push(repo.find_commit(oid?)?);
    }

    let mut head = onto_tip.clone();
    for commit in &to_replay {
        let mut index = repo.cherrypick_commit(commit, &head, 0, None)?;
        if index.has_conflicts() {
            let files = collect_conflicts(repo, &index)?;
            return Ok(RebaseOutcome::Conflict { files });
        }
        let tree_oid = index.write_tree_to(repo)?;
        let tree = repo.find_tree(tree_oid)?;
        let sig = derived_signature(commit, &head)?;
        let oid = repo.commit(
            None,
            &commit.author(),
            &sig,
            commit.message().unwrap_or_default(),
            &tree,
            &[&head],
        )?;
        head = repo.find_commit(oid)?;
    }

    repo.reference(
        &format!("refs/heads/{}", branch),
        head.id(),
        true,
        &format!("Rebase {} onto {}", branch, onto),
    )?;
    Ok(RebaseOutcome::Clean {
        sha: head.id().to_string(),
    })
}

/// Diff two ref snapshots into accepted-update records.
pub fn diff_refs(
    repo_id: i64,
    before: &HashMap<String, String>,
    after: &HashMap<String, String>,
) -> Vec<RefUpdate> {
    let mut updates = Vec::new();
    for (name, new_sha) in after {
        let old_sha = before.get(name).cloned().unwrap_or_else(|| ZERO_SHA.to_string());
        if &old_sha != new_sha {
            updates.push(RefUpdate {
                repo_id,
                ref_name: name.clone(),
                old_sha,
                new_sha: new_sha.clone(),
            });
        }
    }
    for (name, old_sha) in before {
        if !after.contains_key(name) {
            updates.push(RefUpdate {
                repo_id,
                ref_name: name.clone(),
                old_sha: old_sha.clone(),
                new_sha: ZERO_SHA.to_string(),
            });
        }
    }
    updates.sort_by(|a, b| a.ref_name.cmp(&b.ref_name));
    updates
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Build a bare repo with an initial commit on `main` directly through
    /// the host's own plumbing.
    async fn host_with_repo() -> (GitHost, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let host = GitHost::new(dir.path().to_path_buf()).unwrap();
        host.init_bare(1, "main").await.unwrap();
        seed_initial_commit(&host.repo_path(1), "main");
        (host, dir)
    }

    fn seed_initial_commit(path: &Path, branch: &str) {
        let repo = Repository::open_bare(path).unwrap();
        let blob = repo.blob(b"hello\n").unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert("README.md", blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test").unwrap();
        repo.commit(
            Some(&format!("refs/heads/{}", branch)),
            &sig,
            &sig,
            "init",
            &tree,
            &[],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn init_bare_is_idempotent() {
        let dir = tempdir().unwrap();
        let host = GitHost::new(dir.path().to_path_buf()).unwrap();
        host.init_bare(7, "main").await.unwrap();
        host.init_bare(7, "main").await.unwrap();
        assert!(host.is_ingested(7));
    }

    #[tokio::test]
    async fn unknown_repo_reports_not_ingested() {
        let dir = tempdir().unwrap();
        let host = GitHost::new(dir.path().to_path_buf()).unwrap();
        let err = host.list_branches(99).await.unwrap_err();
        assert!(matches!(err, GitHostError::NotIngested(99)));
    }

    #[tokio::test]
    async fn commit_files_then_read_back() {
        let (host, _dir) = host_with_repo().await;
        let sha = host
            .commit_files(
                1,
                "main",
                vec![(format!("{}/metadata.json", CONTEXT_DIR), "{}".to_string())],
                "context",
            )
            .await
            .unwrap();
        assert_eq!(sha.len(), 40);
        let content = host
            .read_branch_file(1, "main", &format!("{}/metadata.json", CONTEXT_DIR))
            .await
            .unwrap();
        assert_eq!(content.as_deref(), Some("{}"));
        // Missing paths read as None, not an error.
        assert!(host.read_branch_file(1, "main", "nope.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_files_noop_returns_current_tip() {
        let (host, _dir) = host_with_repo().await;
        let a = host
            .commit_files(1, "main", vec![("a.txt".into(), "x".into())], "one")
            .await
            .unwrap();
        let b = host
            .commit_files(1, "main", vec![("a.txt".into(), "x".into())], "two")
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn remove_context_dir_cleans_branch() {
        let (host, _dir) = host_with_repo().await;
        host.commit_files(
            1,
            "main",
            vec![(format!("{}/step_000_lint.log", CONTEXT_DIR), "ok\n".into())],
            "context",
        )
        .await
        .unwrap();
        let removed = host.remove_context_dir(1, "main").await.unwrap();
        assert!(removed.is_some());
        let gone = host
            .read_branch_file(1, "main", &format!("{}/step_000_lint.log", CONTEXT_DIR))
            .await
            .unwrap();
        assert!(gone.is_none());
        // Second removal is a no-op.
        assert!(host.remove_context_dir(1, "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_fast_forwards_when_possible() {
        let (host, _dir) = host_with_repo().await;
        host.ensure_branch(1, "feature", "main").await.unwrap();
        host.commit_files(1, "feature", vec![("f.txt".into(), "f\n".into())], "feat")
            .await
            .unwrap();

        let outcome = host.merge(1, "feature", "main").await.unwrap();
        match outcome {
            MergeOutcome::FastForward { sha } => {
                let branches = host.list_branches(1).await.unwrap();
                let main = branches.iter().find(|b| b.name == "main").unwrap();
                assert_eq!(main.sha, sha);
            }
            other => panic!("expected fast-forward, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn merge_creates_merge_commit_when_diverged() {
        let (host, _dir) = host_with_repo().await;
        host.ensure_branch(1, "feature", "main").await.unwrap();
        host.commit_files(1, "feature", vec![("f.txt".into(), "f\n".into())], "feat")
            .await
            .unwrap();
        host.commit_files(1, "main", vec![("m.txt".into(), "m\n".into())], "mainline")
            .await
            .unwrap();

        let outcome = host.merge(1, "feature", "main").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Merge { .. }));

        // Both files present on main after the merge.
        assert!(host.read_branch_file(1, "main", "f.txt").await.unwrap().is_some());
        assert!(host.read_branch_file(1, "main", "m.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn merge_conflict_reports_triple_and_does_not_write() {
        let (host, _dir) = host_with_repo().await;
        host.ensure_branch(1, "feature", "main").await.unwrap();
        host.commit_files(1, "feature", vec![("README.md".into(), "theirs\n".into())], "a")
            .await
            .unwrap();
        host.commit_files(1, "main", vec![("README.md".into(), "ours\n".into())], "b")
            .await
            .unwrap();

        let before = host.refs_snapshot(1).await.unwrap();
        let outcome = host.merge(1, "feature", "main").await.unwrap();
        match outcome {
            MergeOutcome::Conflict { files } => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].path, "README.md");
                assert_eq!(files[0].ours.as_deref(), Some("ours\n"));
                assert_eq!(files[0].theirs.as_deref(), Some("theirs\n"));
                assert_eq!(files[0].base.as_deref(), Some("hello\n"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        // No refs moved.
        assert_eq!(host.refs_snapshot(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn merge_is_deterministic_for_identical_inputs() {
        let (host, _dir) = host_with_repo().await;
        host.ensure_branch(1, "feature", "main").await.unwrap();
        host.commit_files(1, "feature", vec![("f.txt".into(), "f\n".into())], "feat")
            .await
            .unwrap();
        host.commit_files(1, "main", vec![("m.txt".into(), "m\n".into())], "mainline")
            .await
            .unwrap();
        let feature_sha = host.list_branches(1).await.unwrap();
        let main_before = feature_sha.iter().find(|b| b.name == "main").unwrap().sha.clone();

        let first = host.merge(1, "feature", "main").await.unwrap();
        let MergeOutcome::Merge { sha: first_sha } = first else {
            panic!("expected merge commit");
        };

        // Rewind main and merge again: identical trees, identical sha.
        {
            let repo = Repository::open_bare(host.repo_path(1)).unwrap();
            repo.reference(
                "refs/heads/main",
                Oid::from_str(&main_before).unwrap(),
                true,
                "rewind",
            )
            .unwrap();
        }
        let second = host.merge(1, "feature", "main").await.unwrap();
        let MergeOutcome::Merge { sha: second_sha } = second else {
            panic!("expected merge commit");
        };
        assert_eq!(first_sha, second_sha);
    }

    #[tokio::test]
    async fn rebase_replays_commits_onto_new_base() {
        let (host, _dir) = host_with_repo().await;
        host.ensure_branch(1, "topic", "main").await.unwrap();
        host.commit_files(1, "topic", vec![("t.txt".into(), "t\n".into())], "topic work")
            .await
            .unwrap();
        host.commit_files(1, "main", vec![("m.txt".into(), "m\n".into())], "mainline")
            .await
            .unwrap();

        let outcome = host.rebase(1, "topic", "main").await.unwrap();
        assert!(matches!(outcome, RebaseOutcome::Clean { .. }));
        // Rebased topic contains mainline's file.
        assert!(host.read_branch_file(1, "topic", "m.txt").await.unwrap().is_some());
        assert!(host.read_branch_file(1, "topic", "t.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rebase_conflict_does_not_move_branch() {
        let (host, _dir) = host_with_repo().await;
        host.ensure_branch(1, "topic", "main").await.unwrap();
        host.commit_files(1, "topic", vec![("README.md".into(), "topic\n".into())], "a")
            .await
            .unwrap();
        host.commit_files(1, "main", vec![("README.md".into(), "main\n".into())], "b")
            .await
            .unwrap();

        let before = host.refs_snapshot(1).await.unwrap();
        let outcome = host.rebase(1, "topic", "main").await.unwrap();
        assert!(matches!(outcome, RebaseOutcome::Conflict { .. }));
        assert_eq!(host.refs_snapshot(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn delete_branch_removes_ref() {
        let (host, _dir) = host_with_repo().await;
        host.ensure_branch(1, "doomed", "main").await.unwrap();
        host.delete_branch(1, "doomed").await.unwrap();
        let err = host.delete_branch(1, "doomed").await.unwrap_err();
        assert!(matches!(err, GitHostError::BranchNotFound(_)));
    }

    #[test]
    fn diff_refs_reports_created_updated_deleted() {
        let before: HashMap<String, String> = [
            ("refs/heads/main".to_string(), "a".repeat(40)),
            ("refs/heads/gone".to_string(), "b".repeat(40)),
        ]
        .into_iter()
        .collect();
        let after: HashMap<String, String> = [
            ("refs/heads/main".to_string(), "c".repeat(40)),
            ("refs/heads/new".to_string(), "d".repeat(40)),
        ]
        .into_iter()
        .collect();

        let updates = diff_refs(3, &before, &after);
        assert_eq!(updates.len(), 3);
        let gone = updates.iter().find(|u| u.ref_name.ends_with("gone")).unwrap();
        assert_eq!(gone.new_sha, ZERO_SHA);
        let new = updates.iter().find(|u| u.ref_name.ends_with("new")).unwrap();
        assert_eq!(new.old_sha, ZERO_SHA);
        let main = updates.iter().find(|u| u.ref_name.ends_with("main")).unwrap();
        assert_eq!(main.old_sha, "a".repeat(40));
        assert_eq!(main.new_sha, "c".repeat(40));
    }

    #[tokio::test]
    async fn commits_walks_history_with_limit() {
        let (host, _dir) = host_with_repo().await;
        host.commit_files(1, "main", vec![("a.txt".into(), "1".into())], "second")
            .await
            .unwrap();
        host.commit_files(1, "main", vec![("a.txt".into(), "2".into())], "third")
            .await
            .unwrap();
        let commits = host.commits(1, "main", 2).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "third");
        assert_eq!(commits[1].message, "second");
    }

    #[tokio::test]
    async fn diff_reports_file_statuses() {
        let (host, _dir) = host_with_repo().await;
        let branches = host.list_branches(1).await.unwrap();
        let base_sha = branches[0].sha.clone();
        host.commit_files(
            1,
            "main",
            vec![
                ("new.txt".into(), "fresh\n".into()),
                ("README.md".into(), "hello\nworld\n".into()),
            ],
            "changes",
        )
        .await
        .unwrap();

        let diffs = host.diff(1, &base_sha, "main").await.unwrap();
        let added = diffs.iter().find(|d| d.path == "new.txt").unwrap();
        assert_eq!(added.status, FileStatus::Added);
        assert!(added.additions >= 1);
        let modified = diffs.iter().find(|d| d.path == "README.md").unwrap();
        assert_eq!(modified.status, FileStatus::Modified);
        assert!(modified.patch.contains("world"));
    }
}
