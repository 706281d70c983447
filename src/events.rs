//! Structured observability events.
//!
//! Every store write, refresh attempt/outcome and job-run summary is reported
//! through an [`EventSink`]. Emission is synchronous and infallible so it can
//! never fail or stall the operation that produced the event.

use crate::error::FailureKind;
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CredentialEvent {
    Stored {
        user_id: String,
        provider: String,
        revision: i64,
    },
    Deleted {
        user_id: String,
        provider: String,
    },
    RefreshAttempted {
        user_id: String,
        provider: String,
    },
    FailureRecorded {
        user_id: String,
        provider: String,
        failure_count: u32,
    },
    /// A failure increment lost the race against a newer successful store.
    FailureSuperseded {
        user_id: String,
        provider: String,
    },
    Refreshed {
        user_id: String,
        provider: String,
    },
    /// A refresh completed after the credential was deleted or re-stored;
    /// its result was discarded.
    RefreshSuperseded {
        user_id: String,
        provider: String,
    },
    RefreshFailed {
        user_id: String,
        provider: String,
        kind: FailureKind,
        reason: String,
    },
    Disconnected {
        user_id: String,
        reason: String,
    },
    JobCompleted {
        job: String,
        summary: serde_json::Value,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CredentialEvent);
}

/// Default sink: one `info!` line per event under the `tokenkeeper::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CredentialEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(target: "tokenkeeper::events", event = %payload),
            Err(e) => tracing::debug!(error = %e, "Failed to serialize credential event"),
        }
    }
}

/// Buffers events in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CredentialEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CredentialEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: CredentialEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = CredentialEvent::Stored {
            user_id: "u1".to_string(),
            provider: "google".to_string(),
            revision: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stored");
        assert_eq!(json["revision"], 2);
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(CredentialEvent::RefreshAttempted {
            user_id: "u1".to_string(),
            provider: "google".to_string(),
        });
        sink.emit(CredentialEvent::Refreshed {
            user_id: "u1".to_string(),
            provider: "google".to_string(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], CredentialEvent::Refreshed { .. }));
    }
}
