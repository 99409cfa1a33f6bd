//! In-process event bus.
//!
//! Publication never blocks: each sink owns an unbounded channel, so a slow
//! consumer only grows its own queue. Sinks whose receiver was dropped are
//! pruned on the next publish. Order is preserved per sink, which gives
//! per-`task_id` / per-`batch_id` ordering for every subscriber.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::registry::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskUpdate {
        task_id: String,
        status: TaskStatus,
        progress: u8,
        message: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    BatchProgress {
        batch_id: String,
        total: usize,
        processed: usize,
        /// Fraction processed, in `[0, 1]`.
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_file: Option<String>,
        current_batch: usize,
        total_batches: usize,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Task the event is about, for subscription routing.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskUpdate { task_id, .. } | Self::TaskCompleted { task_id, .. } => Some(task_id),
            Self::BatchProgress { .. } => None,
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match self {
            Self::BatchProgress { batch_id, .. } => Some(batch_id),
            _ => None,
        }
    }

    /// Delivered to every connected client regardless of subscriptions.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::BatchProgress { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskUpdate { .. } => "task_update",
            Self::TaskCompleted { .. } => "task_completed",
            Self::BatchProgress { .. } => "batch_progress",
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Sink {
    id: u64,
    filter: Option<EventFilter>,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
pub struct EventBus {
    sinks: Mutex<Vec<Sink>>,
    next_id: Mutex<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_sink(&self, filter: Option<EventFilter>) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.sinks.lock().push(Sink { id, filter, tx });
        debug!("Event sink {} subscribed", id);
        rx
    }

    /// Receive every event.
    pub fn subscribe(&self) -> EventReceiver {
        self.add_sink(None)
    }

    /// Receive only events accepted by `filter`.
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> EventReceiver {
        self.add_sink(Some(Box::new(filter)))
    }

    /// Receive task events for one task.
    pub fn subscribe_task(&self, task_id: impl Into<String>) -> EventReceiver {
        let task_id = task_id.into();
        self.subscribe_filtered(move |e| e.task_id() == Some(task_id.as_str()))
    }

    /// Fire-and-forget delivery to every interested sink.
    pub fn publish(&self, event: Event) {
        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| {
            let wanted = sink.filter.as_ref().map_or(true, |f| f(&event));
            if !wanted {
                return !sink.tx.is_closed();
            }
            let alive = sink.tx.send(event.clone()).is_ok();
            if !alive {
                debug!("Dropping closed event sink {}", sink.id);
            }
            alive
        });
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(task_id: &str, progress: u8) -> Event {
        Event::TaskUpdate {
            task_id: task_id.into(),
            status: TaskStatus::Processing,
            progress,
            message: String::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(update("t1", 50)).unwrap();
        assert_eq!(json["type"], "task_update");
        assert_eq!(json["status"], "processing");
        assert_eq!(json["progress"], 50);
        assert!(json["timestamp"].as_str().unwrap().contains('T'));

        let done = Event::TaskCompleted {
            task_id: "t1".into(),
            success: false,
            result: None,
            error: Some("boom".into()),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(done).unwrap();
        assert_eq!(json["type"], "task_completed");
        assert!(json.get("result").is_none());
    }

    fn task_progress(event: Event) -> (String, u8) {
        match event {
            Event::TaskUpdate { task_id, progress, .. } => (task_id, progress),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ordered_delivery_and_filtering() {
        let bus = EventBus::new();
        let mut all = bus.subscribe();
        let mut only_t2 = bus.subscribe_task("t2");

        for i in 0..5 {
            bus.publish(update("t1", i));
            bus.publish(update("t2", i));
        }

        for i in 0..5 {
            assert_eq!(task_progress(all.recv().await.unwrap()), ("t1".to_string(), i));
            assert_eq!(task_progress(all.recv().await.unwrap()), ("t2".to_string(), i));
        }
        for i in 0..5 {
            assert_eq!(task_progress(only_t2.recv().await.unwrap()), ("t2".to_string(), i));
        }
        assert!(only_t2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_sink_is_pruned_without_affecting_others() {
        let bus = EventBus::new();
        let dropped = bus.subscribe();
        let mut kept = bus.subscribe();
        drop(dropped);

        bus.publish(update("t1", 1));
        assert_eq!(bus.sink_count(), 1);
        assert!(kept.recv().await.is_some());
    }
}
