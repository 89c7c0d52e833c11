use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error};

use crate::error::{FlowError, Result};
use crate::traits::ExecutionStore;
use crate::types::{ExecutionId, Variables};

/// One immutable entry in an execution's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Strictly increasing per execution, starting at 1.
    pub seq: u64,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted {
        flow_id: String,
        variables: Variables,
        steps: Vec<String>,
    },
    StepStarted {
        step_id: String,
        attempt: u32,
    },
    StepRetrying {
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    StepCompleted {
        step_id: String,
        #[serde(default)]
        outputs: Variables,
        /// Successors activated by this step.
        #[serde(default)]
        activated: Vec<String>,
    },
    StepFailed {
        step_id: String,
        reason: String,
        attempts: u32,
    },
    StepSkipped {
        step_id: String,
    },
    /// Variable patch, or a warning about placeholders that could not be
    /// resolved (then `patch` is empty and `unresolved` lists the names).
    VariablesUpdated {
        #[serde(default)]
        step_id: Option<String>,
        #[serde(default)]
        patch: Variables,
        #[serde(default)]
        unresolved: Vec<String>,
    },
    ApprovalRequested {
        step_id: String,
        message: String,
    },
    ApprovalResolved {
        step_id: String,
        approved: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    FeedbackLooped {
        step_id: String,
        target: String,
        iteration: u32,
        /// Steps returned to pending for the next pass.
        reset: Vec<String>,
        #[serde(default)]
        patch: Variables,
    },
    ReentryRejected {
        from: String,
        step_id: String,
    },
    ExecutionCompleted {
        variables: Variables,
    },
    ExecutionFailed {
        reason: String,
        #[serde(default)]
        step_id: Option<String>,
    },
    ExecutionCancelled {
        reason: String,
    },
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionCancelled { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::VariablesUpdated { .. } => "variables_updated",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::FeedbackLooped { .. } => "feedback_looped",
            Self::ReentryRejected { .. } => "reentry_rejected",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
        }
    }
}

struct LogState {
    events: Vec<Event>,
    tx: broadcast::Sender<Event>,
}

impl LogState {
    fn after(&self, from_seq: u64) -> Vec<Event> {
        let start = (from_seq as usize).min(self.events.len());
        self.events[start..].to_vec()
    }

    fn is_terminal(&self) -> bool {
        self.events.last().is_some_and(Event::is_terminal)
    }
}

/// Append-only log of one execution plus its live fan-out channel.
struct ExecutionLog {
    state: Mutex<LogState>,
}

/// Per-execution ordered event logs with live fan-out and replay.
///
/// When a store is attached, every appended event is persisted, finished
/// logs can be evicted, and executions that are not resident (evicted, or
/// from an earlier process) are replayed from the store. Without a store
/// logs stay resident for the life of the process.
pub struct EventBus {
    logs: std::sync::Mutex<HashMap<ExecutionId, Arc<ExecutionLog>>>,
    store: Option<Arc<dyn ExecutionStore>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: std::sync::Mutex::new(HashMap::new()),
            store: None,
            capacity: capacity.max(1),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn log(&self, id: &ExecutionId) -> Option<Arc<ExecutionLog>> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.get(id).cloned()
    }

    fn log_or_create(&self, id: &ExecutionId) -> Arc<ExecutionLog> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.entry(id.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                Arc::new(ExecutionLog {
                    state: Mutex::new(LogState {
                        events: Vec::new(),
                        tx,
                    }),
                })
            })
            .clone()
    }

    /// Whether the execution has a resident log.
    pub fn contains(&self, id: &ExecutionId) -> bool {
        self.log(id).is_some()
    }

    /// Drop the resident log of a finished execution. Only possible with a
    /// store attached; live subscriptions keep reading the log they hold.
    pub async fn evict(&self, id: &ExecutionId) -> bool {
        if self.store.is_none() {
            return false;
        }
        let Some(log) = self.log(id) else {
            return false;
        };
        if !log.state.lock().await.is_terminal() {
            return false;
        }
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.remove(id).is_some()
    }

    /// Append an event, assigning the next sequence number.
    pub async fn append(&self, id: &ExecutionId, kind: EventKind) -> Event {
        let log = self.log_or_create(id);
        let mut state = log.state.lock().await;
        let event = Event {
            seq: state.events.len() as u64 + 1,
            execution_id: id.clone(),
            timestamp: Utc::now(),
            kind,
        };

        if let Some(ref store) = self.store {
            if let Err(e) = store.append_event(&event).await {
                error!(execution_id = %id, seq = event.seq, error = %e, "Failed to persist event");
            }
        }

        debug!(execution_id = %id, seq = event.seq, kind = event.kind.name(), "Event appended");
        state.events.push(event.clone());
        // Ignore error if no receivers
        let _ = state.tx.send(event.clone());
        event
    }

    /// Events with `seq > from_seq`, in order.
    pub async fn events(&self, id: &ExecutionId, from_seq: u64) -> Result<Vec<Event>> {
        if let Some(log) = self.log(id) {
            return Ok(log.state.lock().await.after(from_seq));
        }
        self.load_stored(id, from_seq).await
    }

    /// Sequence number of the last appended event (0 when empty).
    pub async fn last_seq(&self, id: &ExecutionId) -> Option<u64> {
        let log = self.log(id)?;
        let state = log.state.lock().await;
        Some(state.events.len() as u64)
    }

    /// Subscribe to events with `seq > from_seq`.
    ///
    /// The stream yields the already-logged tail first, then live events,
    /// and ends after the terminal event. Taking the snapshot and the
    /// broadcast receiver under the same lock guarantees no gap and no
    /// duplicate between the two.
    pub async fn subscribe(
        &self,
        id: &ExecutionId,
        from_seq: u64,
    ) -> Result<BoxStream<'static, Event>> {
        let Some(log) = self.log(id) else {
            let events = self.load_stored(id, from_seq).await?;
            return Ok(stream::iter(events).boxed());
        };

        let (pending, rx, done) = {
            let state = log.state.lock().await;
            (
                VecDeque::from(state.after(from_seq)),
                state.tx.subscribe(),
                state.is_terminal(),
            )
        };

        let sub = Subscription {
            log,
            rx,
            pending,
            last: from_seq,
            done,
            finished: false,
        };

        Ok(stream::unfold(sub, |mut sub| async move {
            let event = sub.next_event().await?;
            Some((event, sub))
        })
        .boxed())
    }

    async fn load_stored(&self, id: &ExecutionId, from_seq: u64) -> Result<Vec<Event>> {
        let Some(ref store) = self.store else {
            return Err(FlowError::ExecutionNotFound(id.to_string()));
        };
        if store.load_execution(id).await?.is_none() {
            return Err(FlowError::ExecutionNotFound(id.to_string()));
        }
        store.load_events(id, from_seq).await
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

struct Subscription {
    log: Arc<ExecutionLog>,
    rx: broadcast::Receiver<Event>,
    pending: VecDeque<Event>,
    last: u64,
    done: bool,
    finished: bool,
}

impl Subscription {
    async fn next_event(&mut self) -> Option<Event> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                if event.seq <= self.last {
                    continue;
                }
                self.last = event.seq;
                if event.is_terminal() {
                    self.finished = true;
                }
                return Some(event);
            }
            if self.done {
                return None;
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if event.seq > self.last {
                        self.pending.push_back(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Subscriber lagged, catching up from log");
                    self.refill().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.refill().await;
                    self.done = true;
                }
            }
        }
    }

    async fn refill(&mut self) {
        let state = self.log.state.lock().await;
        self.pending = VecDeque::from(state.after(self.last));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> EventKind {
        EventKind::ExecutionStarted {
            flow_id: "f".into(),
            variables: Variables::new(),
            steps: vec!["a".into()],
        }
    }

    fn step(id: &str) -> EventKind {
        EventKind::StepSkipped {
            step_id: id.into(),
        }
    }

    fn done() -> EventKind {
        EventKind::ExecutionCompleted {
            variables: Variables::new(),
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers() {
        let bus = EventBus::new(16);
        let id = ExecutionId::new();
        let e1 = bus.append(&id, started()).await;
        let e2 = bus.append(&id, step("a")).await;
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert_eq!(bus.last_seq(&id).await, Some(2));

        let other = ExecutionId::new();
        assert_eq!(bus.append(&other, started()).await.seq, 1);
    }

    #[tokio::test]
    async fn test_subscribe_from_offset() {
        let bus = EventBus::new(16);
        let id = ExecutionId::new();
        bus.append(&id, started()).await;
        for i in 0..5 {
            bus.append(&id, step(&format!("s{i}"))).await;
        }
        bus.append(&id, done()).await;

        let events: Vec<Event> = bus.subscribe(&id, 5).await.unwrap().collect().await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6, 7]);
    }

    #[tokio::test]
    async fn test_subscribe_live_then_terminal() {
        let bus = Arc::new(EventBus::new(16));
        let id = ExecutionId::new();
        bus.append(&id, started()).await;

        let stream = bus.subscribe(&id, 0).await.unwrap();
        let producer = {
            let bus = bus.clone();
            let id = id.clone();
            tokio::spawn(async move {
                bus.append(&id, step("a")).await;
                bus.append(&id, done()).await;
            })
        };
        let events: Vec<Event> = stream.collect().await;
        producer.await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_catches_up() {
        let bus = EventBus::new(2);
        let id = ExecutionId::new();
        bus.append(&id, started()).await;
        let stream = bus.subscribe(&id, 0).await.unwrap();
        for i in 0..10 {
            bus.append(&id, step(&format!("s{i}"))).await;
        }
        bus.append(&id, done()).await;

        let seqs: Vec<u64> = stream.map(|e| e.seq).collect().await;
        assert_eq!(seqs, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_is_empty() {
        let bus = EventBus::new(16);
        let id = ExecutionId::new();
        bus.append(&id, started()).await;
        bus.append(&id, done()).await;
        let events: Vec<Event> = bus.subscribe(&id, 2).await.unwrap().collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_evict_needs_store() {
        let bus = EventBus::new(16);
        let id = ExecutionId::new();
        bus.append(&id, started()).await;
        bus.append(&id, done()).await;
        assert!(!bus.evict(&id).await);
        assert!(bus.contains(&id));
        assert_eq!(bus.events(&id, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let bus = EventBus::new(16);
        let err = bus.subscribe(&ExecutionId::new(), 0).await.err().unwrap();
        assert!(matches!(err, FlowError::ExecutionNotFound(_)));
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event {
            seq: 3,
            execution_id: ExecutionId::from_string("x"),
            timestamp: Utc::now(),
            kind: EventKind::StepStarted {
                step_id: "a".into(),
                attempt: 1,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_started");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["step_id"], "a");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
