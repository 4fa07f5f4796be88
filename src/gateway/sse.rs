//! SSE log tails for jobs, the playground variant, and debug sessions.
//!
//! Events: `log`, `logs_batch`, `status`, `complete`, `error`, `ping`.
//! Event ids are line numbers, so a reconnect with `Last-Event-ID`
//! replays the missing lines without duplicates.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, Sse},
    },
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::SharedState;
use crate::config::SSE_PING_INTERVAL;
use crate::events::{Event, RecvError, Topic};
use crate::store::models::Job;

/// How long the debug stream waits for the breakpoint step's job to
/// appear before giving up.
const DEBUG_JOB_WAIT: Duration = Duration::from_secs(60);

fn parse_last_event_id(headers: &HeaderMap) -> usize {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// `GET /jobs/{id}/logs/stream`
pub async fn job_logs_stream(
    State(state): State<SharedState>,
    Path(job_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    stream_job(state, job_id, parse_last_event_id(&headers)).await
}

/// `GET /playground/{session}/stream`. A playground session is an
/// ephemeral job; terminal transitions skip card/pipeline updates and the
/// result is surfaced here only.
pub async fn playground_stream(
    State(state): State<SharedState>,
    Path(job_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    stream_job(state, job_id, parse_last_event_id(&headers)).await
}

#[derive(Debug, Deserialize)]
pub struct DebugStreamParams {
    pub token: String,
}

/// `GET /debug/{session}/stream?token=…`. The single-use join token is
/// the only path by which an external CLI may attach to the live log
/// stream of the breakpoint step.
pub async fn debug_stream(
    State(state): State<SharedState>,
    Path(session_id): Path<i64>,
    Query(params): Query<DebugStreamParams>,
    headers: HeaderMap,
) -> Response {
    let session = match state.debugger.attach(session_id, &params.token).await {
        Ok(session) => session,
        Err(e) => {
            return crate::api::ApiError::from(e).into_response();
        }
    };

    // Find the job of the step the session is parked before (or the one
    // currently running).
    let deadline = tokio::time::Instant::now() + DEBUG_JOB_WAIT;
    let job_id = loop {
        if let Ok(Some(run)) = state.store.get_run(session.run_id).await {
            let step_index = session.current_step.unwrap_or(run.current_step);
            if let Ok(Some(step)) = state.store.get_step_run(run.id, step_index).await {
                if let Some(job_id) = step.job_id {
                    break Some(job_id);
                }
            }
        }
        if tokio::time::Instant::now() > deadline {
            break None;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    match job_id {
        Some(job_id) => stream_job(state, job_id, parse_last_event_id(&headers)).await,
        None => {
            let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(4);
            let _ = tx
                .send(Ok(SseEvent::default()
                    .event("error")
                    .data("no step job available for this session")))
                .await;
            Sse::new(ReceiverStream::new(rx)).into_response()
        }
    }
}

async fn stream_job(state: SharedState, job_id: i64, start_after: usize) -> Response {
    let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(64);

    // Subscribe before the initial read so no append can slip between.
    let sub = state.store.bus().subscribe(&[Topic::JobChanged]);

    let job = match state.store.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            let _ = tx
                .send(Ok(SseEvent::default()
                    .event("error")
                    .data(format!("job {} not found", job_id))))
                .await;
            return Sse::new(ReceiverStream::new(rx)).into_response();
        }
        Err(e) => {
            let _ = tx
                .send(Ok(SseEvent::default().event("error").data(e.to_string())))
                .await;
            return Sse::new(ReceiverStream::new(rx)).into_response();
        }
    };

    tokio::spawn(pump_job_stream(state, job, sub, tx, start_after));
    Sse::new(ReceiverStream::new(rx)).into_response()
}

/// Producer: replay, then follow the bus until the job completes.
async fn pump_job_stream(
    state: SharedState,
    job: Job,
    mut sub: crate::events::Subscription,
    tx: mpsc::Sender<Result<SseEvent, Infallible>>,
    start_after: usize,
) {
    let job_id = job.id;
    let mut sent_lines = start_after;

    // Replay what the client has not seen, as one batch.
    let lines: Vec<&str> = job.logs.lines().collect();
    if sent_lines < lines.len() {
        let missed = lines[sent_lines..].join("\n");
        let event = SseEvent::default()
            .event("logs_batch")
            .id(lines.len().to_string())
            .data(missed);
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
        sent_lines = lines.len();
    }

    let mut last_status = job.status;
    let status_event = SseEvent::default()
        .event("status")
        .data(last_status.as_str());
    if tx.send(Ok(status_event)).await.is_err() {
        return;
    }
    if job.status.is_terminal() {
        let _ = tx
            .send(Ok(SseEvent::default()
                .event("complete")
                .data(job.status.as_str())))
            .await;
        return;
    }

    let mut ping = tokio::time::interval(SSE_PING_INTERVAL);
    ping.tick().await; // arm

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if tx
                    .send(Ok(SseEvent::default().event("ping").data("")))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            event = sub.recv() => {
                let job = match event {
                    Ok(Event::JobChanged { job, .. }) if job.id == job_id => job,
                    Ok(_) => continue,
                    Err(RecvError::Lagged) => {
                        // Fall back to the row to resync.
                        match state.store.get_job(job_id).await {
                            Ok(Some(job)) => job,
                            _ => return,
                        }
                    }
                    Err(RecvError::Closed) => return,
                };

                // New lines since the last send, one `log` event each.
                let lines: Vec<&str> = job.logs.lines().collect();
                for (offset, line) in lines.iter().enumerate().skip(sent_lines) {
                    let event = SseEvent::default()
                        .event("log")
                        .id((offset + 1).to_string())
                        .data(*line);
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                sent_lines = sent_lines.max(lines.len());

                if job.status != last_status {
                    last_status = job.status;
                    if tx
                        .send(Ok(SseEvent::default()
                            .event("status")
                            .data(last_status.as_str())))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                if job.status.is_terminal() {
                    let _ = tx
                        .send(Ok(SseEvent::default()
                            .event("complete")
                            .data(job.status.as_str())))
                        .await;
                    return;
                }
            }
        }
    }
}
