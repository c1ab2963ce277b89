//! A bounded, in-memory stream of observability events.
//!
//! Agents record each step they take here. The server exposes the stream so an operator can see
//! what the agents have been doing; once the log is full, the oldest events are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// The number of events retained before the oldest are dropped.
const CAPACITY: usize = 256;

/// A summary of how a request was interpreted and routed.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TraceSummary {
    pub intent: String,
    pub system: String,
    pub agent: String,
    pub operation: String,
}

/// A single recorded event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Event {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceSummary>,
    pub at: DateTime<Utc>,
}

/// A cloneable handle on the event stream.
#[derive(Clone, Debug, Default)]
pub struct Observer(Arc<Mutex<VecDeque<Event>>>);

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step with no further detail.
    pub fn step(&self, operation: impl Into<String>) {
        self.push(Event {
            operation: operation.into(),
            detail: None,
            trace: None,
            at: Utc::now(),
        });
    }

    /// Record a step with a human-readable detail.
    pub fn step_detail(&self, operation: impl Into<String>, detail: impl Into<String>) {
        self.push(Event {
            operation: operation.into(),
            detail: Some(detail.into()),
            trace: None,
            at: Utc::now(),
        });
    }

    /// Record a routing trace.
    pub fn trace(&self, trace: TraceSummary) {
        self.push(Event {
            operation: trace.operation.clone(),
            detail: None,
            trace: Some(trace),
            at: Utc::now(),
        });
    }

    /// Remove and return all recorded events, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = self.0.lock().unwrap();
        events.drain(..).collect()
    }

    /// Return a copy of the recorded events without removing them.
    pub fn snapshot(&self) -> Vec<Event> {
        let events = self.0.lock().unwrap();
        events.iter().cloned().collect()
    }

    fn push(&self, event: Event) {
        tracing::debug!(operation = %event.operation, "event");
        let mut events = self.0.lock().unwrap();
        if events.len() == CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let events = Observer::new();
        events.step("first");
        events.step_detail("second", "with detail");

        let drained = events.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].operation, "first");
        assert_eq!(drained[1].detail.as_deref(), Some("with detail"));
        assert!(events.drain().is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let events = Observer::new();
        for i in 0..CAPACITY + 10 {
            events.step(format!("step-{i}"));
        }
        let snapshot = events.snapshot();
        assert_eq!(snapshot.len(), CAPACITY);
        assert_eq!(snapshot[0].operation, "step-10");
    }

    #[test]
    fn test_clones_share_the_stream() {
        let events = Observer::new();
        let writer = events.clone();
        writer.trace(TraceSummary {
            intent: "informational_query".into(),
            system: "Entra ID".into(),
            agent: "doc_assistant".into(),
            operation: "iam_query".into(),
        });
        let snapshot = events.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].trace.as_ref().unwrap().system, "Entra ID");
    }
}
