//! Runtime configuration.
//!
//! The core consumes exactly three knobs from the environment: a data-root
//! path, the base URL advertised to runners, and the default per-step
//! timeout. Everything else (agent credentials, workspace paths) is the
//! runner's concern.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Heartbeat interval expected from runners.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A runner is marked dead after this many missed-heartbeat seconds (3H).
pub const HEARTBEAT_DEAD_AFTER: Duration = Duration::from_secs(15);

/// How long the dispatcher waits for a `job_ack` before releasing the job.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between `cancel_job` and force-failing the job.
pub const CANCEL_GRACE: Duration = Duration::from_secs(15);

/// SSE keep-alive ping interval.
pub const SSE_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Trigger dedup window.
pub const TRIGGER_DEDUP_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the relational store, bare repos, and snapshots.
    pub data_dir: PathBuf,
    /// Base URL advertised to runners in clone URLs, e.g. `http://127.0.0.1:7070`.
    pub base_url: String,
    /// Default per-step timeout when a pipeline step does not set one.
    pub step_timeout: Duration,
    /// Listen port for the HTTP/WS server.
    pub port: u16,
    /// Permissive CORS + external bind, for UI development.
    pub dev_mode: bool,
}

impl Config {
    /// Read configuration from the environment, applying defaults.
    pub fn from_env() -> Self {
        let port = std::env::var("LAZYAF_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7070);
        let data_dir = std::env::var("LAZYAF_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".lazyaf-data"));
        let base_url = std::env::var("LAZYAF_BASE_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{}", port));
        let step_timeout = std::env::var("LAZYAF_STEP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));
        Self {
            data_dir,
            base_url,
            step_timeout,
            port,
            dev_mode: std::env::var("LAZYAF_DEV").unwrap_or_default() == "1",
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("lazyaf.db")
    }

    pub fn git_root(&self) -> PathBuf {
        self.data_dir.join("git_repos")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Clone URL for a repo, served by the embedded git host.
    pub fn clone_url(&self, repo_id: i64) -> String {
        format!("{}/git/{}.git", self.base_url.trim_end_matches('/'), repo_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".lazyaf-data"),
            base_url: "http://127.0.0.1:7070".to_string(),
            step_timeout: Duration::from_secs(300),
            port: 7070,
            dev_mode: false,
        }
    }
}

/// Config pointed at a throwaway directory, for tests.
pub fn test_config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        base_url: "http://127.0.0.1:0".to_string(),
        step_timeout: Duration::from_secs(300),
        port: 0,
        dev_mode: false,
    }
}
