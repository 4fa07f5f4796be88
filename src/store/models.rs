use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Status alphabets ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Failed,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid card status: {}", s)),
        }
    }

    /// Legal moves on the card board. `start`/`approve`/`reject`/`retry`
    /// and job outcomes all reduce to one of these edges.
    pub fn can_transition_to(&self, next: CardStatus) -> bool {
        use CardStatus::*;
        matches!(
            (self, next),
            (Todo, InProgress)
                | (InProgress, InReview)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InReview, Done)
                | (InReview, Todo)
                | (InReview, Failed)
                | (Failed, Todo)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid job status: {}", s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Disconnected,
    Connecting,
    Idle,
    Assigned,
    Busy,
    Dead,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Assigned => "assigned",
            Self::Busy => "busy",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "idle" => Ok(Self::Idle),
            "assigned" => Ok(Self::Assigned),
            "busy" => Ok(Self::Busy),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("invalid runner status: {}", s)),
        }
    }
}

/// Shared by pipeline runs and their step runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid run status: {}", s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DebugStatus {
    Pending,
    WaitingAtBp,
    Connected,
    Timeout,
    Ended,
}

impl DebugStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WaitingAtBp => "waiting_at_bp",
            Self::Connected => "connected",
            Self::Timeout => "timeout",
            Self::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting_at_bp" => Ok(Self::WaitingAtBp),
            "connected" => Ok(Self::Connected),
            "timeout" => Ok(Self::Timeout),
            "ended" => Ok(Self::Ended),
            _ => Err(format!("invalid debug status: {}", s)),
        }
    }
}

// ── Step configuration ───────────────────────────────────────────────

/// What a runner executes for a card or pipeline step. Validated at save
/// time so the engine/runner contract is statically checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    Agent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        agent_files: Vec<String>,
    },
    Script {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<String>,
    },
    Container {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        volumes: Vec<String>,
    },
}

impl StepConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Agent { .. } => "agent",
            Self::Script { .. } => "script",
            Self::Container { .. } => "container",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Script { command, .. } if command.trim().is_empty() => {
                Err("script step requires a non-empty command".to_string())
            }
            Self::Container { image, .. } if image.trim().is_empty() => {
                Err("container step requires a non-empty image".to_string())
            }
            _ => Ok(()),
        }
    }
}

// ── Routing verbs ────────────────────────────────────────────────────

/// What to do after a step completes, per routing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingVerb {
    Next,
    Stop,
    TriggerCard(i64),
    TriggerPipeline(i64),
    Merge(String),
}

impl fmt::Display for RoutingVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next => write!(f, "next"),
            Self::Stop => write!(f, "stop"),
            Self::TriggerCard(id) => write!(f, "trigger:{}", id),
            Self::TriggerPipeline(id) => write!(f, "trigger:pipeline:{}", id),
            Self::Merge(branch) => write!(f, "merge:{}", branch),
        }
    }
}

impl FromStr for RoutingVerb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "next" => Ok(Self::Next),
            "stop" => Ok(Self::Stop),
            _ => {
                if let Some(rest) = s.strip_prefix("trigger:pipeline:") {
                    rest.parse()
                        .map(Self::TriggerPipeline)
                        .map_err(|_| format!("invalid pipeline id in verb '{}'", s))
                } else if let Some(rest) = s.strip_prefix("trigger:") {
                    rest.parse()
                        .map(Self::TriggerCard)
                        .map_err(|_| format!("invalid card id in verb '{}'", s))
                } else if let Some(branch) = s.strip_prefix("merge:") {
                    if branch.is_empty() {
                        Err("merge verb requires a branch name".to_string())
                    } else {
                        Ok(Self::Merge(branch.to_string()))
                    }
                } else {
                    Err(format!("unknown routing verb '{}'", s))
                }
            }
        }
    }
}

impl Serialize for RoutingVerb {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RoutingVerb {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Pipeline value objects ───────────────────────────────────────────

fn default_runner_type() -> String {
    "any".to_string()
}

fn default_on_success() -> RoutingVerb {
    RoutingVerb::Next
}

fn default_on_failure() -> RoutingVerb {
    RoutingVerb::Stop
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Stable id used for context-directory log naming; optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_runner_type")]
    pub runner_type: String,
    #[serde(flatten)]
    pub config: StepConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_on_success")]
    pub on_success: RoutingVerb,
    #[serde(default = "default_on_failure")]
    pub on_failure: RoutingVerb,
    /// The runner must reuse the workspace of the previous step.
    #[serde(default)]
    pub continue_in_context: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    CardComplete,
    Push,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardComplete => "card_complete",
            Self::Push => "push",
        }
    }
}

/// Action applied to the originating card when a triggered run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalAction {
    Nothing,
    /// Merge the card branch; `None` targets the repo default branch.
    Merge(Option<String>),
    Fail,
    Reject,
}

impl fmt::Display for TerminalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nothing => write!(f, "nothing"),
            Self::Merge(None) => write!(f, "merge"),
            Self::Merge(Some(branch)) => write!(f, "merge:{}", branch),
            Self::Fail => write!(f, "fail"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for TerminalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nothing" => Ok(Self::Nothing),
            "merge" => Ok(Self::Merge(None)),
            "fail" => Ok(Self::Fail),
            "reject" => Ok(Self::Reject),
            _ => {
                if let Some(branch) = s.strip_prefix("merge:") {
                    if branch.is_empty() {
                        Err("merge action requires a branch name".to_string())
                    } else {
                        Ok(Self::Merge(Some(branch.to_string())))
                    }
                } else {
                    Err(format!("unknown terminal action '{}'", s))
                }
            }
        }
    }
}

impl Serialize for TerminalAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TerminalAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn default_nothing() -> TerminalAction {
    TerminalAction::Nothing
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerDef {
    pub trigger_type: TriggerType,
    /// For `card_complete`: the card status that fires the trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CardStatus>,
    /// For `push`: shell-style branch globs, e.g. `release/*`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    #[serde(default = "default_nothing")]
    pub on_pass: TerminalAction,
    #[serde(default = "default_nothing")]
    pub on_fail: TerminalAction,
}

/// Validate a pipeline definition at save time.
pub fn validate_pipeline(steps: &[Step], triggers: &[TriggerDef]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("pipeline requires at least one step".to_string());
    }
    for (i, step) in steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(format!("step {} requires a name", i));
        }
        step.config
            .validate()
            .map_err(|e| format!("step {} ({}): {}", i, step.name, e))?;
        if step.continue_in_context && i == 0 {
            return Err("first step cannot continue in context".to_string());
        }
    }
    for trigger in triggers {
        match trigger.trigger_type {
            TriggerType::CardComplete => {
                match trigger.status {
                    Some(CardStatus::InReview) | Some(CardStatus::Done) => {}
                    _ => {
                        return Err(
                            "card_complete trigger requires status in_review or done".to_string()
                        );
                    }
                }
            }
            TriggerType::Push => {
                if trigger.branches.is_empty() {
                    return Err("push trigger requires at least one branch glob".to_string());
                }
                for pattern in &trigger.branches {
                    glob::Pattern::new(pattern).map_err(|e| {
                        format!("invalid branch glob '{}' (shell-style): {}", pattern, e)
                    })?;
                }
            }
        }
    }
    Ok(())
}

// ── Entities ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub name: String,
    pub default_branch: String,
    pub ingested: bool,
    pub clone_url: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub repo_id: i64,
    pub title: String,
    pub description: String,
    pub status: CardStatus,
    pub runner_type: String,
    pub step: StepConfig,
    pub branch_name: Option<String>,
    pub current_job_id: Option<i64>,
    /// Set when the card was spawned by a pipeline step.
    pub pipeline_run_id: Option<i64>,
    pub step_index: Option<i64>,
    /// Latest merge-conflict record from approve or a trigger terminal
    /// action; cleared on a successful merge.
    pub conflict: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResults {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl TestResults {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Absent for pipeline-step jobs and ephemeral (playground) jobs.
    pub card_id: Option<i64>,
    pub repo_id: i64,
    pub required_runner_type: String,
    pub status: JobStatus,
    /// Snapshot taken at start; later card edits do not mutate running jobs.
    pub step: StepConfig,
    pub prompt: Option<String>,
    pub agent_files: Vec<String>,
    pub continuation: bool,
    pub pinned_runner_id: Option<i64>,
    pub ephemeral: bool,
    /// Single tier today; field reserved for expansion.
    pub priority: i64,
    pub runner_id: Option<i64>,
    pub logs: String,
    pub error: Option<String>,
    pub branch_name: Option<String>,
    pub test_results: Option<TestResults>,
    pub deadline_secs: u64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,
    pub runner_type: String,
    pub status: RunnerStatus,
    pub current_job_id: Option<i64>,
    /// Unix epoch seconds of the last heartbeat.
    pub last_heartbeat: i64,
    pub registered_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub repo_id: i64,
    pub name: String,
    pub steps: Vec<Step>,
    pub triggers: Vec<TriggerDef>,
    pub is_template: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub pipeline_id: i64,
    pub repo_id: i64,
    pub status: RunStatus,
    pub trigger_type: String,
    pub trigger_ref: Option<String>,
    pub trigger_context: serde_json::Value,
    /// Branch the context directory is committed to.
    pub branch_name: String,
    pub current_step: i64,
    pub steps_total: i64,
    pub steps_completed: i64,
    pub debug_session_id: Option<i64>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: i64,
    pub run_id: i64,
    pub step_index: i64,
    pub step_name: String,
    pub status: RunStatus,
    pub job_id: Option<i64>,
    pub logs: String,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFile {
    pub id: i64,
    /// CLI-safe slug.
    pub name: String,
    pub description: String,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSession {
    pub id: i64,
    pub run_id: i64,
    pub breakpoints: Vec<i64>,
    pub status: DebugStatus,
    pub current_step: Option<i64>,
    /// Single-use join token; cleared once presented.
    pub token: Option<String>,
    /// Unix epoch seconds.
    pub expires_at: i64,
    pub created_at: String,
}

/// Validate an agent-file name as a CLI-safe slug.
pub fn validate_slug(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 64 {
        return Err("name must be 1-64 characters".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("name may only contain alphanumerics, '-' and '_'".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_status_roundtrip() {
        for s in ["todo", "in_progress", "in_review", "done", "failed"] {
            assert_eq!(CardStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(CardStatus::parse("bogus").is_err());
    }

    #[test]
    fn card_transition_graph() {
        use CardStatus::*;
        assert!(Todo.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(InReview));
        assert!(InReview.can_transition_to(Done));
        assert!(InReview.can_transition_to(Todo));
        assert!(Failed.can_transition_to(Todo));
        // No shortcuts.
        assert!(!Todo.can_transition_to(Done));
        assert!(!Done.can_transition_to(Todo));
        assert!(!Todo.can_transition_to(InReview));
    }

    #[test]
    fn job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn routing_verb_roundtrip() {
        for s in ["next", "stop", "trigger:7", "trigger:pipeline:3", "merge:main"] {
            let verb: RoutingVerb = s.parse().unwrap();
            assert_eq!(verb.to_string(), s);
        }
    }

    #[test]
    fn routing_verb_rejects_garbage() {
        assert!("jump".parse::<RoutingVerb>().is_err());
        assert!("trigger:abc".parse::<RoutingVerb>().is_err());
        assert!("merge:".parse::<RoutingVerb>().is_err());
    }

    #[test]
    fn routing_verb_serde_as_string() {
        let verb = RoutingVerb::Merge("main".to_string());
        let json = serde_json::to_string(&verb).unwrap();
        assert_eq!(json, "\"merge:main\"");
        let back: RoutingVerb = serde_json::from_str(&json).unwrap();
        assert_eq!(back, verb);
    }

    #[test]
    fn terminal_action_roundtrip() {
        for s in ["nothing", "merge", "merge:release", "fail", "reject"] {
            let action: TerminalAction = s.parse().unwrap();
            assert_eq!(action.to_string(), s);
        }
    }

    #[test]
    fn step_config_tagged_serialization() {
        let step = StepConfig::Script {
            command: "cargo test".to_string(),
            workdir: None,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"], "script");
        assert_eq!(json["command"], "cargo test");

        let container: StepConfig = serde_json::from_value(serde_json::json!({
            "kind": "container",
            "image": "rust:1.80",
            "env": {"CI": "1"}
        }))
        .unwrap();
        assert_eq!(container.kind(), "container");
    }

    #[test]
    fn step_defaults_apply() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "lint",
            "kind": "script",
            "command": "cargo clippy"
        }))
        .unwrap();
        assert_eq!(step.runner_type, "any");
        assert_eq!(step.on_success, RoutingVerb::Next);
        assert_eq!(step.on_failure, RoutingVerb::Stop);
        assert!(!step.continue_in_context);
    }

    #[test]
    fn validate_pipeline_rejects_empty_and_bad_globs() {
        assert!(validate_pipeline(&[], &[]).is_err());

        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "lint", "kind": "script", "command": "true"
        }))
        .unwrap();

        let bad_trigger = TriggerDef {
            trigger_type: TriggerType::Push,
            status: None,
            branches: vec!["release/[".to_string()],
            on_pass: TerminalAction::Nothing,
            on_fail: TerminalAction::Nothing,
        };
        let err = validate_pipeline(std::slice::from_ref(&step), &[bad_trigger]).unwrap_err();
        assert!(err.contains("shell-style"));

        let ok_trigger = TriggerDef {
            trigger_type: TriggerType::Push,
            status: None,
            branches: vec!["main".to_string(), "release/*".to_string()],
            on_pass: TerminalAction::Nothing,
            on_fail: TerminalAction::Nothing,
        };
        assert!(validate_pipeline(&[step], &[ok_trigger]).is_ok());
    }

    #[test]
    fn validate_pipeline_rejects_leading_continuation() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "second-half", "kind": "script", "command": "true",
            "continue_in_context": true
        }))
        .unwrap();
        assert!(validate_pipeline(&[step], &[]).is_err());
    }

    #[test]
    fn validate_pipeline_requires_card_complete_status() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "lint", "kind": "script", "command": "true"
        }))
        .unwrap();
        let trigger = TriggerDef {
            trigger_type: TriggerType::CardComplete,
            status: Some(CardStatus::Todo),
            branches: vec![],
            on_pass: TerminalAction::Merge(None),
            on_fail: TerminalAction::Fail,
        };
        assert!(validate_pipeline(&[step], &[trigger]).is_err());
    }

    #[test]
    fn test_results_all_passed() {
        let ok = TestResults {
            total: 3,
            passed: 3,
            failed: 0,
        };
        assert!(ok.all_passed());
        let bad = TestResults {
            total: 3,
            passed: 2,
            failed: 1,
        };
        assert!(!bad.all_passed());
    }

    #[test]
    fn slug_validation() {
        assert!(validate_slug("code-reviewer_2").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("has space").is_err());
        assert!(validate_slug("semi;colon").is_err());
    }
}
