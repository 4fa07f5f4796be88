//! The shared context workspace committed onto a run's working branch.
//!
//! Each step's logs land in a predictable file; `metadata.json` tracks
//! progress so agents in later steps can orient themselves. A successful
//! `merge:` verb removes the whole directory before merging.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::GitHostError;
use crate::githost::{CONTEXT_DIR, GitHost};
use crate::store::models::Step;

/// Lowercased, dash-separated, trimmed to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.chars().count() > max_len {
        let truncated: String = slug.chars().take(max_len).collect();
        truncated.trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Log path for a step: stable-id form when the step declares an id,
/// positional form otherwise.
pub fn step_log_path(step: &Step, index: usize) -> String {
    match &step.id {
        Some(id) => format!("{}/id_{}_{:03}.log", CONTEXT_DIR, slugify(id, 40), index),
        None => format!(
            "{}/step_{:03}_{}.log",
            CONTEXT_DIR,
            index,
            slugify(&step.name, 40)
        ),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextMetadata {
    pub run_id: i64,
    pub steps_completed: i64,
    /// Step id (or positional name) → log file path.
    pub step_id_map: BTreeMap<String, String>,
}

impl ContextMetadata {
    pub fn path() -> String {
        format!("{}/metadata.json", CONTEXT_DIR)
    }

    pub fn record_step(&mut self, step: &Step, index: usize) {
        let key = step
            .id
            .clone()
            .unwrap_or_else(|| format!("step_{:03}", index));
        self.step_id_map.insert(key, step_log_path(step, index));
    }
}

/// Commit one finished step's log plus refreshed metadata onto the
/// working branch.
pub async fn commit_step(
    host: &GitHost,
    repo_id: i64,
    branch: &str,
    metadata: &ContextMetadata,
    step: &Step,
    index: usize,
    logs: &str,
) -> Result<String, GitHostError> {
    let metadata_json = serde_json::to_string_pretty(metadata)
        .map_err(|e| GitHostError::Transport(format!("metadata encode failed: {}", e)))?;
    host.commit_files(
        repo_id,
        branch,
        vec![
            (step_log_path(step, index), logs.to_string()),
            (ContextMetadata::path(), metadata_json),
        ],
        &format!("Record step {} ({})", index, step.name),
    )
    .await
}
