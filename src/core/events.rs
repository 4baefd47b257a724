//! In-process event bus for dispatch events.
//!
//! Built on `tokio::broadcast` so the control API's SSE stream and any other
//! subscriber receive the same events. Publishing never blocks; slow
//! subscribers lag and miss events instead of stalling the dispatcher.

use serde::Serialize;
use tokio::sync::broadcast;

/// Structured event payloads, tagged by type on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    MessageReceived {
        channel: String,
        sender: String,
        message_id: String,
    },
    MessageEnqueued {
        message_id: String,
        agent: Option<String>,
    },
    AgentRouted {
        message_id: String,
        agent_id: String,
        team_id: Option<String>,
    },
    ChainStepStart {
        agent_id: String,
        conversation_id: Option<String>,
    },
    ChainStepDone {
        agent_id: String,
        conversation_id: Option<String>,
        response_length: usize,
        response_text: String,
    },
    ChainHandoff {
        from_agent: String,
        to_agent: String,
        conversation_id: String,
    },
    TeamChainStart {
        team_id: String,
        conversation_id: String,
    },
    TeamChainEnd {
        team_id: String,
        conversation_id: String,
        total: u32,
    },
    PipelineStep {
        team_id: String,
        agent_id: String,
        step: usize,
        total: usize,
    },
    PipelineLoop {
        team_id: String,
        agent_id: String,
        #[serde(rename = "loop")]
        loop_count: u32,
        max_loops: u32,
    },
    PipelineComplete {
        team_id: String,
        conversation_id: String,
    },
    ResponseReady {
        message_id: String,
        agent_id: Option<String>,
        response_length: usize,
    },
    ProcessorStart {},
}

/// An event as delivered to subscribers: `{type, timestamp, ...payload}`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Broadcast-based event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity. Subscribers falling
    /// behind by more than `capacity` events receive a lag error on recv.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish fire-and-forget. With no subscribers the event is dropped.
    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
        };
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EventKind::ProcessorStart {});

        let event = rx.recv().await.unwrap();
        assert!(event.timestamp > 0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "processor_start");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(EventKind::MessageEnqueued {
            message_id: "m1".to_string(),
            agent: None,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_wire_shape() {
        let bus = EventBus::default();
        let _rx = bus.subscribe();
        let event = Event {
            timestamp: 1,
            kind: EventKind::PipelineLoop {
                team_id: "dev".to_string(),
                agent_id: "coder".to_string(),
                loop_count: 1,
                max_loops: 2,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "pipeline_loop");
        assert_eq!(json["loop"], 1);
        assert_eq!(json["maxLoops"].as_i64(), None);
        assert_eq!(json["max_loops"], 2);
    }
}
