//! Bounded in-memory event queue for polling and push front ends.

use super::{ProgressReporter, ReporterCall};
use crate::config::EngineSettings;
use crate::core::ProgressEvent;
use crate::utils::Timestamp;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity of the queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Keeps the most recent progress events in a bounded FIFO.
///
/// When full, the oldest event is dropped. Pollers call
/// [`get_events`](Self::get_events) with the timestamp of the last event they
/// saw; push transports call [`subscribe`](Self::subscribe).
#[derive(Debug)]
pub struct EventQueueReporter {
    events: Mutex<VecDeque<ProgressEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for EventQueueReporter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventQueueReporter {
    /// Creates a queue sized by `settings.event_buffer_size`.
    #[must_use]
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.event_buffer_size)
    }

    /// Creates a queue holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            tx,
        }
    }

    /// Events strictly newer than `since`, oldest first; all events when
    /// `since` is `None`.
    #[must_use]
    pub fn get_events(&self, since: Option<Timestamp>) -> Vec<ProgressEvent> {
        let events = self.events.lock();
        match since {
            Some(since) => events.iter().filter(|e| e.timestamp > since).cloned().collect(),
            None => events.iter().cloned().collect(),
        }
    }

    /// Removes all buffered events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if no events are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Maximum number of buffered events.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events evicted because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A live feed of new events. Slow receivers observe `Lagged` rather
    /// than slowing stages down.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    fn push(&self, call: &ReporterCall) {
        let mut events = self.events.lock();
        // Stamped under the lock and strictly increasing, so a poller asking
        // for events newer than the last one it saw never misses one.
        let mut event = call.to_event();
        if let Some(last) = events.back() {
            if event.timestamp <= last.timestamp {
                event.timestamp = last.timestamp + chrono::Duration::microseconds(1);
            }
        }
        if events.len() >= self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event.clone());
        if self.tx.send(event).is_err() {
            debug!("No progress subscribers");
        }
    }
}

impl ProgressReporter for EventQueueReporter {
    fn start_task(&self, name: &str, total_steps: Option<usize>) {
        self.push(&ReporterCall::StartTask {
            name: name.to_string(),
            total_steps,
        });
    }

    fn update_step(&self, message: &str, step: Option<usize>, progress: Option<f64>) {
        self.push(&ReporterCall::UpdateStep {
            message: message.to_string(),
            step,
            progress,
        });
    }

    fn complete_step(&self, message: &str, duration: Option<Duration>) {
        self.push(&ReporterCall::CompleteStep {
            message: message.to_string(),
            duration,
        });
    }

    fn complete_task(&self, message: &str, duration: Option<Duration>) {
        self.push(&ReporterCall::CompleteTask {
            message: message.to_string(),
            duration,
        });
    }

    fn error(&self, message: &str, detail: Option<&str>) {
        self.push(&ReporterCall::Error {
            message: message.to_string(),
            detail: detail.map(str::to_string),
        });
    }
}
