//! Read path for the `.lazyaf/` tree of an ingested repo.
//!
//! Repo-scoped agents and pipelines are read live from the branch tip
//! (they are not store entities) and shadow platform assets of the same
//! name.

use serde::{Deserialize, Serialize};

use super::{ASSET_DIR, GitHost};
use crate::errors::GitHostError;
use crate::store::models::{Step, TriggerDef, validate_pipeline};

/// Raw text resolved from a repo tree, with its source branch for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedAsset {
    pub name: String,
    pub content: String,
    pub source_branch: String,
}

/// A pipeline document as stored under `.lazyaf/pipelines/`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDoc {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

/// Parse and validate a repo-defined pipeline document.
pub fn parse_pipeline_doc(yaml: &str) -> Result<PipelineDoc, String> {
    let doc: PipelineDoc =
        serde_yaml::from_str(yaml).map_err(|e| format!("invalid pipeline document: {}", e))?;
    validate_pipeline(&doc.steps, &doc.triggers)?;
    Ok(doc)
}

async fn read_first_match(
    host: &GitHost,
    repo_id: i64,
    branch: &str,
    candidates: &[String],
) -> Result<Option<String>, GitHostError> {
    for path in candidates {
        if let Some(content) = host.read_branch_file(repo_id, branch, path).await? {
            return Ok(Some(content));
        }
    }
    Ok(None)
}

/// Resolve `.lazyaf/agents/<name>` from a branch tip.
pub async fn read_repo_agent(
    host: &GitHost,
    repo_id: i64,
    branch: &str,
    name: &str,
) -> Result<Option<ResolvedAsset>, GitHostError> {
    let candidates = [
        format!("{}/agents/{}", ASSET_DIR, name),
        format!("{}/agents/{}.md", ASSET_DIR, name),
    ];
    Ok(read_first_match(host, repo_id, branch, &candidates)
        .await?
        .map(|content| ResolvedAsset {
            name: name.to_string(),
            content,
            source_branch: branch.to_string(),
        }))
}

/// Resolve `.lazyaf/pipelines/<name>` from a branch tip.
pub async fn read_repo_pipeline(
    host: &GitHost,
    repo_id: i64,
    branch: &str,
    name: &str,
) -> Result<Option<ResolvedAsset>, GitHostError> {
    let candidates = [
        format!("{}/pipelines/{}", ASSET_DIR, name),
        format!("{}/pipelines/{}.yaml", ASSET_DIR, name),
        format!("{}/pipelines/{}.yml", ASSET_DIR, name),
    ];
    Ok(read_first_match(host, repo_id, branch, &candidates)
        .await?
        .map(|content| ResolvedAsset {
            name: name.to_string(),
            content,
            source_branch: branch.to_string(),
        }))
}
