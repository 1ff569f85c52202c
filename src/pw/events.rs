use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::pw::logger::SupervisorLogger;
use crate::pw::program::ProgramState;

/// Generic name carried by every state-transition event; subscribers can
/// match on it or on the state-specific `PROCESS_STATE_<STATE>` name.
pub const PROCESS_STATE: &str = "PROCESS_STATE";

const EVENT_QUEUE_CAPACITY: usize = 1024;
const PUBLISH_DEADLINE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub names: Vec<String>,
    pub label: String,
    pub timestamp: DateTime<Local>,
    pub program: Option<String>,
    pub error: Option<String>,
    pub args: Vec<String>,
}

impl Event {
    pub fn process_state(state: ProgramState, program: &str, error: Option<String>) -> Event {
        Event {
            names: vec![
                PROCESS_STATE.to_string(),
                format!("{PROCESS_STATE}_{state}"),
            ],
            label: program.to_string(),
            timestamp: Local::now(),
            program: Some(program.to_string()),
            error,
            args: Vec::new(),
        }
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.label, self.names.join(","))
    }
}

pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

/// In-process fan-out of lifecycle events. Handlers are fixed at
/// construction and invoked sequentially, in registration order, by a
/// dedicated dispatcher task. Delivery is best-effort: a publisher blocked
/// past the deadline drops the event and bumps the dropped counter.
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
    logger: SupervisorLogger,
}

impl EventBus {
    /// Starts the dispatcher task and returns the bus.
    pub fn start(handlers: Vec<EventHandler>, logger: SupervisorLogger) -> EventBus {
        let (tx, mut rx) = mpsc::channel::<Event>(EVENT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for handler in &handlers {
                    handler(&event);
                }
            }
        });
        EventBus {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            logger,
        }
    }

    /// Publish-side handle handed to program state machines.
    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
            logger: self.logger.clone(),
        }
    }

    /// Events dropped because the queue stayed full past the publish
    /// deadline.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
    logger: SupervisorLogger,
}

impl EventSink {
    pub async fn publish(&self, event: Event) {
        let label = event.label.clone();
        match tokio::time::timeout(PUBLISH_DEADLINE, self.tx.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.logger
                    .warning("events", Some(&label), "event dropped (queue full)");
            }
        }
    }
}
