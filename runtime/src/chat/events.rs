//! Event sink — monotonic per-request event counter and idempotency keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    LlmRequest,
    LlmResponse,
    BudgetDecision,
    InterceptorDecision,
    StateDelta,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub idempotency_key: String,
    pub event_type: EventType,
    pub payload: Value,
}

/// Emits events for one logical request, tagging each with
/// `{idempotencyKey}:{type}:{counter}` where `counter` increments once per
/// emitted event for that request.
pub struct EventSink {
    counter: AtomicU64,
    events: Mutex<Vec<Event>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, request_idempotency_key: &str, event_type: EventType, payload: Value) -> Event {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let type_tag = match event_type {
            EventType::LlmRequest => "LLM_REQUEST",
            EventType::LlmResponse => "LLM_RESPONSE",
            EventType::BudgetDecision => "BUDGET_DECISION",
            EventType::InterceptorDecision => "INTERCEPTOR_DECISION",
            EventType::StateDelta => "STATE_DELTA",
            EventType::Error => "ERROR",
        };
        let event = Event {
            idempotency_key: format!("{request_idempotency_key}:{type_tag}:{n}"),
            event_type,
            payload,
        };
        self.events.lock().unwrap().push(event.clone());
        event
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counter_is_monotonic_and_per_sink() {
        let sink = EventSink::new();
        let e1 = sink.emit("req-1", EventType::LlmRequest, json!({}));
        let e2 = sink.emit("req-1", EventType::LlmResponse, json!({}));
        assert_eq!(e1.idempotency_key, "req-1:LLM_REQUEST:0");
        assert_eq!(e2.idempotency_key, "req-1:LLM_RESPONSE:1");
    }

    #[test]
    fn events_accumulate() {
        let sink = EventSink::new();
        sink.emit("req-1", EventType::BudgetDecision, json!({"decision": "accept"}));
        sink.emit("req-1", EventType::StateDelta, json!({}));
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn different_idempotency_key_bases_do_not_collide_in_counter() {
        let sink = EventSink::new();
        let e1 = sink.emit("req-1", EventType::LlmRequest, json!({}));
        let e2 = sink.emit("req-2", EventType::LlmRequest, json!({}));
        assert_ne!(e1.idempotency_key, e2.idempotency_key);
    }
}
