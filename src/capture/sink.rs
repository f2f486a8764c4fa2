//! Event fan-out to external subscribers
//!
//! Every subscriber gets its own copy of each event. A subscriber that falls
//! behind loses the oldest events instead of slowing the proxy down.

use super::record::RequestRecord;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Events emitted by the proxy engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyEvent {
    Started { port: u16 },
    Stopped,
    Error { message: String },
    Request { record: RequestRecord },
    Response { record: RequestRecord },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Stopped,
    Error,
    Request,
    Response,
}

impl ProxyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::Started { .. } => EventKind::Started,
            ProxyEvent::Stopped => EventKind::Stopped,
            ProxyEvent::Error { .. } => EventKind::Error,
            ProxyEvent::Request { .. } => EventKind::Request,
            ProxyEvent::Response { .. } => EventKind::Response,
        }
    }
}

/// Broadcast channel shared by the engine and its connection tasks
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ProxyEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!(?kind, "No event subscribers");
        }
    }

    /// Subscribe to every event kind
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            kinds: None,
        }
    }

    /// Subscribe to the listed kinds only
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            kinds: Some(kinds.to_vec()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving end of an [`EventBus`]
pub struct EventSubscription {
    rx: broadcast::Receiver<ProxyEvent>,
    kinds: Option<Vec<EventKind>>,
}

impl EventSubscription {
    /// Next matching event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, event: &ProxyEvent) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&event.kind()))
    }
}
