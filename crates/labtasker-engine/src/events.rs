//! Event types for state-transition notifications.
//!
//! Events are ephemeral: they are fanned out to in-process subscribers and
//! never persisted. Durable state lives in the store; a consumer that needs
//! ground truth re-reads the store. Each event carries the entity kind, the
//! transition endpoints, and the entity's user metadata at transition time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use labtasker_core::QueueId;

/// The kind of entity an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A task transition.
    Task,
    /// A worker transition.
    Worker,
    /// A queue lifecycle event.
    Queue,
}

impl EntityKind {
    /// Returns a lowercase label for logs and wire payloads.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Worker => "worker",
            Self::Queue => "queue",
        }
    }
}

/// A single event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, assigned per bus.
    pub id: u64,
    /// When the transition was applied.
    pub timestamp: DateTime<Utc>,
    /// The queue the entity belongs to.
    pub queue_id: QueueId,
    /// What happened.
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An entity changed state.
    StateTransition {
        /// The entity kind.
        entity: EntityKind,
        /// The entity's identifier.
        entity_id: String,
        /// The state before the transition; `None` for creation.
        old_status: Option<String>,
        /// The state after the transition.
        new_status: String,
        /// The entity's user metadata at transition time.
        metadata: Value,
    },
    /// The subscriber's buffer overflowed and events were dropped.
    Overflow {
        /// How many events were lost.
        dropped: u64,
    },
}

impl EventPayload {
    /// Builds a state-transition payload.
    #[must_use]
    pub fn transition(
        entity: EntityKind,
        entity_id: impl Into<String>,
        old_status: Option<&str>,
        new_status: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self::StateTransition {
            entity,
            entity_id: entity_id.into(),
            old_status: old_status.map(str::to_string),
            new_status: new_status.into(),
            metadata,
        }
    }
}

/// Subscriber-side predicate over events.
///
/// The queue is always filtered (a subscription is scoped to one queue);
/// entity kinds and new-status values are optional refinements. Overflow
/// sentinels always pass so consumers learn about gaps.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only these entity kinds, when set.
    pub entities: Option<Vec<EntityKind>>,
    /// Only transitions into these states (uppercase labels), when set.
    pub new_statuses: Option<Vec<String>>,
}

impl EventFilter {
    /// A filter that passes every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Evaluates the filter against a payload.
    #[must_use]
    pub fn matches(&self, payload: &EventPayload) -> bool {
        let EventPayload::StateTransition {
            entity, new_status, ..
        } = payload
        else {
            return true;
        };
        if let Some(entities) = &self.entities {
            if !entities.contains(entity) {
                return false;
            }
        }
        if let Some(statuses) = &self.new_statuses {
            if !statuses.iter().any(|s| s.eq_ignore_ascii_case(new_status)) {
                return false;
            }
        }
        true
    }
}
