//! In-process notifications about agent lifecycle changes.

use serde::Serialize;
use tokio::sync::broadcast;

pub const TOPIC_AGENT_ENROLLED: &str = "fleet.agent.enrolled";
pub const TOPIC_AGENT_CHECKIN: &str = "fleet.agent.checkin";
pub const TOPIC_AGENT_DISCONNECTED: &str = "fleet.agent.disconnected";
pub const TOPIC_DEVICE_PROFILED: &str = "fleet.device.profiled";

const CHANNEL_CAPACITY: usize = 256;

/// An event published on the bus. Serializes to its payload only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FleetEvent {
    AgentEnrolled {
        agent_id: String,
        hostname: String,
        platform: String,
    },
    AgentCheckIn {
        agent_id: String,
        hostname: String,
        platform: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cpu_percent: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        memory_percent: Option<f64>,
    },
    AgentDisconnected {
        agent_id: String,
    },
    DeviceProfiled {
        agent_id: String,
        cpu_model: String,
        os_name: String,
    },
}

impl FleetEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::AgentEnrolled { .. } => TOPIC_AGENT_ENROLLED,
            Self::AgentCheckIn { .. } => TOPIC_AGENT_CHECKIN,
            Self::AgentDisconnected { .. } => TOPIC_AGENT_DISCONNECTED,
            Self::DeviceProfiled { .. } => TOPIC_DEVICE_PROFILED,
        }
    }
}

/// Broadcast bus for [`FleetEvent`]s.
///
/// Publishing never blocks and never fails; with no subscribers the event is
/// dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: FleetEvent) {
        let topic = event.topic();
        if self.tx.send(event).is_err() {
            tracing::trace!(topic, "No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Log every event at debug level until the bus is dropped.
pub fn spawn_event_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    tracing::debug!(topic = event.topic(), %payload, "Fleet event");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
