//! Wire messages exchanged with runner processes over the persistent
//! session. Envelope shape is `{type, payload}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::models::{Job, JobStatus, StepConfig, TestResults};

/// Runner → server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RunnerMessage {
    Register {
        runner_type: String,
        /// Present when a runner reconnects and wants its id confirmed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runner_id: Option<i64>,
    },
    Heartbeat,
    JobAck {
        job_id: i64,
        accepted: bool,
    },
    LogAppend {
        job_id: i64,
        chunk: String,
        seq: u64,
    },
    JobResult {
        job_id: i64,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        test_results: Option<TestResults>,
    },
}

/// Agent file content shipped with a job assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentFilePayload {
    pub name: String,
    pub content: String,
}

/// Server → runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        runner_id: i64,
    },
    RunJob {
        job_id: i64,
        repo_clone_url: String,
        #[serde(flatten)]
        step_config: StepConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        agent_files: Vec<AgentFilePayload>,
        /// The workspace of the previous step must be reused.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        continuation: bool,
        /// Seconds the runner has before the server cancels the job.
        deadline_secs: u64,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    CancelJob {
        job_id: i64,
    },
    Shutdown,
}

impl ServerMessage {
    /// Assemble the assignment message from a job snapshot.
    pub fn run_job(job: &Job, clone_url: String, agent_files: Vec<AgentFilePayload>) -> Self {
        Self::RunJob {
            job_id: job.id,
            repo_clone_url: clone_url,
            step_config: job.step.clone(),
            prompt: job.prompt.clone(),
            agent_files,
            continuation: job.continuation,
            deadline_secs: job.deadline_secs,
            env: BTreeMap::new(),
        }
    }
}

pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

pub fn decode(text: &str) -> Result<RunnerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_envelope_shape() {
        let msg = RunnerMessage::Register {
            runner_type: "docker".to_string(),
            runner_id: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["payload"]["runner_type"], "docker");
        assert!(json["payload"].get("runner_id").is_none());
    }

    #[test]
    fn heartbeat_has_no_payload_fields() {
        let parsed = decode("{\"type\":\"heartbeat\"}").unwrap();
        assert_eq!(parsed, RunnerMessage::Heartbeat);
    }

    #[test]
    fn job_result_roundtrip() {
        let msg = RunnerMessage::JobResult {
            job_id: 9,
            status: JobStatus::Completed,
            error: None,
            branch_name: Some("lazyaf/c".to_string()),
            test_results: Some(TestResults {
                total: 5,
                passed: 5,
                failed: 0,
            }),
        };
        let parsed = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn run_job_flattens_step_config() {
        let msg = ServerMessage::RunJob {
            job_id: 3,
            repo_clone_url: "http://host/git/1.git".to_string(),
            step_config: StepConfig::Script {
                command: "make test".to_string(),
                workdir: None,
            },
            prompt: None,
            agent_files: vec![],
            continuation: true,
            deadline_secs: 300,
            env: BTreeMap::new(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "run_job");
        assert_eq!(json["payload"]["kind"], "script");
        assert_eq!(json["payload"]["command"], "make test");
        assert_eq!(json["payload"]["continuation"], true);
        assert_eq!(json["payload"]["deadline_secs"], 300);
    }

    #[test]
    fn cancel_and_shutdown_encode() {
        let cancel = serde_json::to_value(ServerMessage::CancelJob { job_id: 4 }).unwrap();
        assert_eq!(cancel["type"], "cancel_job");
        assert_eq!(cancel["payload"]["job_id"], 4);
        let shutdown = serde_json::to_value(ServerMessage::Shutdown).unwrap();
        assert_eq!(shutdown["type"], "shutdown");
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(decode("{\"type\":\"fly\"}").is_err());
        assert!(decode("not json").is_err());
    }
}
