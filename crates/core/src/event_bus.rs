//! Unified event bus — trait for emitting popup analytics events from any
//! module.
//!
//! Modules accept an `Arc<dyn EventSink>` to emit display, interaction,
//! lead, and consent events toward the host's analytics pipeline.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Analytics event kinds emitted by the popup engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    PopupDisplayed,
    PopupClicked,
    PopupDismissed,
    PopupConverted,
    PopupClosed,
    LeadCaptured,
    ConsentGranted,
    ConsentDeclined,
    EvaluationDeferred,
}

/// A single analytics event.
#[derive(Debug, Clone)]
pub struct PopupEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub visitor_id: String,
    pub campaign_id: Option<Uuid>,
    pub variation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting analytics events. Implementations route events to
/// the host's analytics pipeline or CRM integration.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PopupEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: PopupEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<PopupEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<PopupEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: PopupEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating `PopupEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    visitor_id: impl Into<String>,
    campaign_id: Option<Uuid>,
    variation_id: Option<Uuid>,
) -> PopupEvent {
    PopupEvent {
        event_id: Uuid::new_v4(),
        event_type,
        visitor_id: visitor_id.into(),
        campaign_id,
        variation_id,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let campaign = Uuid::new_v4();
        sink.emit(make_event(
            EventType::PopupDisplayed,
            "vis_1",
            Some(campaign),
            None,
        ));
        sink.emit(make_event(EventType::PopupClosed, "vis_1", Some(campaign), None));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::PopupDisplayed), 1);
        assert_eq!(sink.count_type(EventType::PopupClosed), 1);

        let events = sink.events();
        assert_eq!(events[0].visitor_id, "vis_1");
        assert_eq!(events[1].campaign_id, Some(campaign));
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(EventType::ConsentGranted, "vis_1", None, None));
    }
}
