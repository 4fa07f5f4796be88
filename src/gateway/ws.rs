//! UI WebSocket: every state change reaches connected clients as a
//! compact `{topic, data}` message.
//!
//! Clients get an initial snapshot on connect and may narrow their
//! subscription with a `{"topics": [...]}` message. The send path is
//! bounded; a client that cannot keep up is disconnected and expected to
//! reconnect and resync from a fresh snapshot.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::api::SharedState;
use crate::events::{Event, RecvError};
use crate::runner::RunnerRegistry;
use crate::store::Store;
use crate::store::models::Job;

/// Debounce window for coalesced pool-stats messages.
const POOL_STATS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Per-client pool-stats buffer; overflow disconnects the client.
const POOL_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize)]
struct UiMessage<'a, T: Serialize> {
    topic: &'a str,
    data: T,
}

#[derive(Debug, Deserialize, Default)]
struct SubscriptionScope {
    /// Topic prefixes, e.g. `["card", "pipeline_run"]`. Empty = all.
    #[serde(default)]
    topics: Vec<String>,
}

impl SubscriptionScope {
    fn wants(&self, topic: &str) -> bool {
        self.topics.is_empty()
            || self
                .topics
                .iter()
                .any(|prefix| topic == prefix || topic.starts_with(&format!("{}.", prefix)))
    }
}

/// Job payload without the (unbounded) log body; log tails use SSE.
#[derive(Debug, Serialize)]
struct JobView<'a> {
    id: i64,
    card_id: Option<i64>,
    repo_id: i64,
    status: &'a str,
    error: &'a Option<String>,
    branch_name: &'a Option<String>,
    runner_id: Option<i64>,
    ephemeral: bool,
}

impl<'a> From<&'a Job> for JobView<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            id: job.id,
            card_id: job.card_id,
            repo_id: job.repo_id,
            status: job.status.as_str(),
            error: &job.error,
            branch_name: &job.branch_name,
            runner_id: job.runner_id,
            ephemeral: job.ephemeral,
        }
    }
}

/// Render a bus event as a compact change message, or nothing for events
/// the UI does not consume directly.
fn compact(event: &Event) -> Option<(String, String)> {
    fn encode<T: Serialize>(topic: String, data: T) -> Option<(String, String)> {
        serde_json::to_string(&UiMessage {
            topic: &topic,
            data,
        })
        .ok()
        .map(|json| (topic, json))
    }
    match event {
        Event::CardChanged { card } => encode(format!("card.{}", card.id), card),
        Event::JobChanged { job, .. } => encode(format!("job.{}", job.id), JobView::from(job)),
        Event::RunnerChanged { runner } => encode(format!("runner.{}", runner.id), runner),
        Event::RunChanged { run } => encode(format!("pipeline_run.{}", run.id), run),
        Event::StepChanged { step } => encode(format!("step_run.{}", step.id), step),
        Event::DebugBreakpoint {
            session_id,
            run_id,
            step_index,
        } => encode(
            format!("pipeline_run.{}", run_id),
            serde_json::json!({
                "debug": "breakpoint",
                "session_id": session_id,
                "step_index": step_index,
            }),
        ),
        Event::DebugResume {
            session_id,
            run_id,
            step_index,
        } => encode(
            format!("pipeline_run.{}", run_id),
            serde_json::json!({
                "debug": "resume",
                "session_id": session_id,
                "step_index": step_index,
            }),
        ),
        Event::PushReceived { .. } => None,
    }
}

/// Coalesced pool-stats publisher shared by all UI clients.
pub struct PoolStatsFeed {
    tx: broadcast::Sender<String>,
}

impl PoolStatsFeed {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(POOL_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Debounced recompute loop: runner churn and job churn (the stats
    /// carry queue depth) mark the stats dirty; at most one `pool_stats`
    /// message goes out per window.
    pub async fn run(self: Arc<Self>, store: Store, registry: Arc<RunnerRegistry>) {
        let mut sub = store.bus().subscribe(&[
            crate::events::Topic::RunnerChanged,
            crate::events::Topic::JobChanged,
        ]);
        let mut dirty = false;
        let mut tick = tokio::time::interval(POOL_STATS_DEBOUNCE);
        loop {
            tokio::select! {
                event = sub.recv() => {
                    match event {
                        Ok(_) | Err(RecvError::Lagged) => dirty = true,
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = tick.tick() => {
                    if !dirty {
                        continue;
                    }
                    dirty = false;
                    if let Ok(stats) = registry.pool_stats().await {
                        if let Ok(json) = serde_json::to_string(&UiMessage {
                            topic: "pool_stats",
                            data: stats,
                        }) {
                            let _ = self.tx.send(json);
                        }
                    }
                }
            }
        }
    }
}

impl Default for PoolStatsFeed {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn ui_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();

    // Initial snapshot so the client can render immediately.
    match snapshot(&state).await {
        Ok(json) => {
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "snapshot failed; dropping UI client");
            return;
        }
    }

    let mut bus = state.store.bus().subscribe(&[]);
    let mut pool_rx = state.pool_feed.subscribe();
    let mut scope = SubscriptionScope::default();

    loop {
        tokio::select! {
            event = bus.recv() => {
                match event {
                    Ok(event) => {
                        if let Some((topic, json)) = compact(&event) {
                            if !scope.wants(&topic) {
                                continue;
                            }
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged) => {
                        // Overflowed its buffer: cut it loose, the UI will
                        // reconnect and resync.
                        tracing::debug!("slow UI client disconnected");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            stats = pool_rx.recv() => {
                match stats {
                    Ok(json) => {
                        if scope.wants("pool_stats")
                            && sender.send(Message::Text(json.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SubscriptionScope>(text.as_str()) {
                            Ok(new_scope) => scope = new_scope,
                            Err(_) => {
                                tracing::debug!("ignoring malformed UI subscription message");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

async fn snapshot(state: &SharedState) -> Result<String, crate::errors::StoreError> {
    let cards = state.store.list_cards(None, None).await?;
    let runners = state.store.list_runners().await?;
    let pipelines = state.store.list_pipelines(None).await?;
    let runs = state.store.list_runs(None).await?;
    serde_json::to_string(&UiMessage {
        topic: "snapshot",
        data: serde_json::json!({
            "cards": cards,
            "runners": runners,
            "pipelines": pipelines,
            "pipeline_runs": runs,
        }),
    })
    .map_err(|e| crate::errors::StoreError::Database(e.into()))
}
