//! Capture model and sink
//!
//! Records flow from connection handlers through a [`Recorder`], which keeps
//! the bounded [`CaptureStore`] in sync and fans events out on the
//! [`EventBus`]. CONNECT records are published but never stored.

pub(crate) mod exchange;
pub mod record;
pub mod sink;
pub mod store;

pub use record::{
    header_list, CompletedRequest, HeaderList, PendingRequest, Protocol, RequestHead,
    RequestRecord,
};
pub use sink::{EventBus, EventKind, EventSubscription, ProxyEvent};
pub use store::CaptureStore;

use std::sync::Arc;

/// Publishes records to subscribers and the capture store
#[derive(Clone)]
pub struct Recorder {
    bus: EventBus,
    store: Arc<CaptureStore>,
}

impl Recorder {
    pub fn new(bus: EventBus, store: Arc<CaptureStore>) -> Self {
        Self { bus, store }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &CaptureStore {
        &self.store
    }

    /// Publish the request half of a record
    pub async fn request(&self, record: &RequestRecord) {
        if !record.is_connect() {
            self.store.insert_pending(record.clone()).await;
        }
        self.bus.publish(ProxyEvent::Request {
            record: record.clone(),
        });
    }

    /// Publish the completed record
    pub async fn response(&self, completed: CompletedRequest) {
        let record = completed.record().clone();
        if !record.is_connect() {
            self.store.complete(completed).await;
        }
        self.bus.publish(ProxyEvent::Response { record });
    }

    /// Publish a systemic failure
    pub fn error(&self, message: impl Into<String>) {
        self.bus.publish(ProxyEvent::Error {
            message: message.into(),
        });
    }
}
