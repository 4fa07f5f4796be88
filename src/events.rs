//! Process-local event bus.
//!
//! Every state change flows through here exactly once, after the store
//! commit. Publish never blocks; each subscriber owns a bounded buffer and
//! a slow subscriber is cut loose (`Lagged`) instead of back-pressuring
//! the publisher. Ordering is preserved per publisher.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::models::{Card, Job, PipelineRun, Runner, StepRun};

/// Per-subscriber buffer. A UI client that falls this far behind is
/// disconnected and expected to reconnect and resync.
const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    CardChanged,
    JobChanged,
    RunnerChanged,
    RunChanged,
    StepChanged,
    PushReceived,
    DebugBreakpoint,
    DebugResume,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    CardChanged {
        card: Card,
    },
    JobChanged {
        job: Job,
        /// Appended log chunk, when the change was a log append.
        #[serde(skip_serializing_if = "Option::is_none")]
        log_delta: Option<String>,
    },
    RunnerChanged {
        runner: Runner,
    },
    RunChanged {
        run: PipelineRun,
    },
    StepChanged {
        step: StepRun,
    },
    PushReceived {
        repo_id: i64,
        ref_name: String,
        old_sha: String,
        new_sha: String,
    },
    DebugBreakpoint {
        session_id: i64,
        run_id: i64,
        step_index: i64,
    },
    DebugResume {
        session_id: i64,
        run_id: i64,
        step_index: i64,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::CardChanged { .. } => Topic::CardChanged,
            Self::JobChanged { .. } => Topic::JobChanged,
            Self::RunnerChanged { .. } => Topic::RunnerChanged,
            Self::RunChanged { .. } => Topic::RunChanged,
            Self::StepChanged { .. } => Topic::StepChanged,
            Self::PushReceived { .. } => Topic::PushReceived,
            Self::DebugBreakpoint { .. } => Topic::DebugBreakpoint,
            Self::DebugResume { .. } => Topic::DebugResume,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Non-blocking publish. Returns silently when nobody is subscribed.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe with a topic filter; empty filter receives everything.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: topics.to_vec(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecvError {
    /// The subscriber fell behind its buffer and was cut loose.
    Lagged,
    Closed,
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    topics: Vec<Topic>,
}

impl Subscription {
    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.topics.is_empty() || self.topics.contains(&event.topic()) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => return Err(RecvError::Lagged),
                Err(broadcast::error::RecvError::Closed) => return Err(RecvError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_event(repo_id: i64) -> Event {
        Event::PushReceived {
            repo_id,
            ref_name: "refs/heads/main".to_string(),
            old_sha: "0".repeat(40),
            new_sha: "1".repeat(40),
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(&[]);
        let mut b = bus.subscribe(&[]);
        bus.publish(push_event(1));
        assert!(matches!(a.recv().await, Ok(Event::PushReceived { .. })));
        assert!(matches!(b.recv().await, Ok(Event::PushReceived { .. })));
    }

    #[tokio::test]
    async fn topic_filter_skips_unmatched() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[Topic::DebugResume]);
        bus.publish(push_event(1));
        bus.publish(Event::DebugResume {
            session_id: 1,
            run_id: 2,
            step_index: 3,
        });
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, Event::DebugResume { step_index: 3, .. }));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(push_event(9));
    }

    #[tokio::test]
    async fn per_publisher_order_is_preserved() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[Topic::PushReceived]);
        for i in 0..10 {
            bus.publish(push_event(i));
        }
        for i in 0..10 {
            match sub.recv().await.unwrap() {
                Event::PushReceived { repo_id, .. } => assert_eq!(repo_id, i),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_cut_loose_not_backpressured() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[]);
        // Overflow the per-subscriber buffer without ever receiving.
        for i in 0..(BUS_CAPACITY as i64 + 16) {
            bus.publish(push_event(i));
        }
        assert_eq!(sub.recv().await.unwrap_err(), RecvError::Lagged);
    }
}
