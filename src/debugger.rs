//! Breakpointed reruns: a debug session parks a pipeline run before
//! configured step indices until resumed, aborted, or expired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::events::Event;
use crate::store::Store;
use crate::store::db::now_epoch;
use crate::store::models::{DebugSession, DebugStatus, PipelineRun};

type Result<T> = std::result::Result<T, StoreError>;

/// Default and maximum session lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const MAX_TTL: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Abort,
}

#[derive(Debug, Clone, Copy)]
enum DebugCommand {
    Resume,
    Abort,
}

struct SessionChannel {
    tx: mpsc::UnboundedSender<DebugCommand>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<DebugCommand>>>,
}

pub struct DebugController {
    store: Store,
    channels: Mutex<HashMap<i64, SessionChannel>>,
}

impl DebugController {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session for a planned run. Returns the session and its
    /// single-use join token.
    pub async fn create_session(
        &self,
        run_id: i64,
        breakpoints: Vec<i64>,
        ttl: Option<Duration>,
    ) -> Result<(DebugSession, String)> {
        let ttl = ttl.unwrap_or(DEFAULT_TTL).min(MAX_TTL);
        let token = Uuid::new_v4().to_string();
        let expires_at = now_epoch() + ttl.as_secs() as i64;
        let session = self
            .store
            .create_debug_session(run_id, breakpoints, token.clone(), expires_at)
            .await?;
        self.store.run_attach_debug(run_id, session.id).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock().await;
        channels.insert(
            session.id,
            SessionChannel {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            },
        );
        Ok((session, token))
    }

    /// Called by the engine before dispatching each step. Blocks while the
    /// session is parked at a matching breakpoint.
    pub async fn gate(&self, run: &PipelineRun, step_index: i64) -> GateDecision {
        let Some(session_id) = run.debug_session_id else {
            return GateDecision::Proceed;
        };
        let session = match self.store.get_debug_session(session_id).await {
            Ok(Some(session)) => session,
            _ => return GateDecision::Proceed,
        };
        match session.status {
            DebugStatus::Ended | DebugStatus::Timeout => return GateDecision::Proceed,
            _ => {}
        }
        if !session.breakpoints.contains(&step_index) {
            return GateDecision::Proceed;
        }

        let rx = {
            let channels = self.channels.lock().await;
            match channels.get(&session_id) {
                Some(channel) => Arc::clone(&channel.rx),
                None => return GateDecision::Proceed,
            }
        };

        if let Err(e) = self
            .store
            .debug_set_status(session_id, DebugStatus::WaitingAtBp, Some(step_index))
            .await
        {
            tracing::warn!(session_id, error = %e, "failed to park debug session");
        }
        self.store.bus().publish(Event::DebugBreakpoint {
            session_id,
            run_id: run.id,
            step_index,
        });
        tracing::info!(run_id = run.id, step_index, "paused at breakpoint");

        let wait = Duration::from_secs((session.expires_at - now_epoch()).max(0) as u64);
        let mut rx = rx.lock().await;
        let command = tokio::time::timeout(wait, rx.recv()).await;
        drop(rx);

        match command {
            Ok(Some(DebugCommand::Resume)) => {
                // Keep `connected` if a CLI already attached.
                let next = match self.store.get_debug_session(session_id).await {
                    Ok(Some(s)) if s.status == DebugStatus::Connected => DebugStatus::Connected,
                    _ => DebugStatus::Pending,
                };
                let _ = self.store.debug_set_status(session_id, next, None).await;
                self.store.bus().publish(Event::DebugResume {
                    session_id,
                    run_id: run.id,
                    step_index,
                });
                GateDecision::Proceed
            }
            Ok(Some(DebugCommand::Abort)) | Ok(None) => {
                let _ = self
                    .store
                    .debug_set_status(session_id, DebugStatus::Ended, None)
                    .await;
                GateDecision::Abort
            }
            Err(_) => {
                // Expired while parked.
                let _ = self
                    .store
                    .debug_set_status(session_id, DebugStatus::Timeout, None)
                    .await;
                tracing::warn!(session_id, "debug session expired at breakpoint");
                GateDecision::Abort
            }
        }
    }

    /// Let the parked run continue past the current breakpoint.
    pub async fn resume(&self, session_id: i64) -> Result<DebugSession> {
        let session = self
            .store
            .get_debug_session(session_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "debug_session",
                id: session_id,
            })?;
        if !matches!(session.status, DebugStatus::WaitingAtBp | DebugStatus::Connected) {
            return Err(StoreError::InvalidTransition {
                entity: "debug_session",
                from: session.status.as_str().to_string(),
                to: "resumed".to_string(),
            });
        }
        let channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&session_id) {
            let _ = channel.tx.send(DebugCommand::Resume);
        }
        Ok(session)
    }

    /// End the session. Returns the run id so the caller can cancel the
    /// run when it was not parked.
    pub async fn abort(&self, session_id: i64) -> Result<i64> {
        let session = self
            .store
            .get_debug_session(session_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "debug_session",
                id: session_id,
            })?;
        {
            let channels = self.channels.lock().await;
            if let Some(channel) = channels.get(&session_id) {
                let _ = channel.tx.send(DebugCommand::Abort);
            }
        }
        let _ = self
            .store
            .debug_set_status(session_id, DebugStatus::Ended, None)
            .await;
        Ok(session.run_id)
    }

    /// Present the single-use join token; marks the session `connected`.
    pub async fn attach(&self, session_id: i64, token: &str) -> Result<DebugSession> {
        let consumed = self
            .store
            .debug_take_token(session_id, token.to_string())
            .await?;
        if !consumed {
            return Err(StoreError::Validation("invalid or used join token".to_string()));
        }
        self.store
            .debug_set_status(session_id, DebugStatus::Connected, None)
            .await
    }

    /// Expiry sweep: ends overdue sessions and returns the run ids the
    /// caller must cancel (auto-abort).
    pub async fn expire_due(&self) -> Vec<i64> {
        let due = match self.store.expired_debug_sessions(now_epoch()).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "debug expiry scan failed");
                return Vec::new();
            }
        };
        let mut runs = Vec::new();
        for session in due {
            tracing::warn!(session_id = session.id, "debug session expired");
            {
                let channels = self.channels.lock().await;
                if let Some(channel) = channels.get(&session.id) {
                    let _ = channel.tx.send(DebugCommand::Abort);
                }
            }
            let _ = self
                .store
                .debug_set_status(session.id, DebugStatus::Timeout, None)
                .await;
            runs.push(session.run_id);
        }
        runs
    }

    pub async fn drop_channel(&self, session_id: i64) {
        let mut channels = self.channels.lock().await;
        channels.remove(&session_id);
    }
}
