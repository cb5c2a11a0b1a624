use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use session_bus::{Bus, BusError, BusMessage, Handler, LocalBus, Subscription};
use thiserror::Error;
use tracing::debug;

mod connection_set;

pub use connection_set::{ConnectionDescriptor, ConnectionSet, DualRegionSet, RegionConnection};

/// Event names exchanged with the upstream side of a connection.
pub mod events {
    /// Full agent snapshot pushed by the backend.
    pub const SNAPSHOT_UPDATE: &str = "agent.update";
    pub const LIVENESS_SYN: &str = "liveness.syn";
    pub const LIVENESS_ACK: &str = "liveness.ack";
    /// Region metadata for the connection, `{"region": "..."}`.
    pub const REGION_METADATA: &str = "connection.region";
    pub const CONFIGURE_STANDBY: &str = "failover.configure_standby";
    pub const FAILOVER_PENDING: &str = "failover.pending";
    pub const FAILOVER_INITIATED: &str = "failover.initiated";
    pub const FAILOVER_COMPLETE: &str = "failover.complete";
}

/// Errors raised by upstream transports and connection sets.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transport closed")]
    Closed,
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl From<BusError> for UpstreamError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Closed => UpstreamError::Closed,
        }
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;
pub type UpstreamMessage = BusMessage<Value>;
pub type UpstreamHandler = Handler<Value>;

/// Bidirectional channel to one backend connection. Messages travel as JSON;
/// delivery is FIFO per connection and unordered across connections.
pub trait Upstream: Send + Sync {
    fn id(&self) -> String;
    fn send_upstream(&self, event: &str, payload: Value) -> UpstreamResult<()>;
    fn on_upstream(&self, event: &str, handler: UpstreamHandler) -> Subscription;
    fn on_all_upstream(&self, handler: UpstreamHandler) -> Subscription;
    /// Forwards a bare signal upstream without interpreting it locally.
    fn relay_upstream(&self, event: &str) -> UpstreamResult<()> {
        self.send_upstream(event, Value::Null)
    }
}

/// A message written to the upstream side of a [`LocalUpstream`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub event: String,
    pub payload: Value,
}

/// In-memory upstream for tests and offline tooling. Inbound traffic is
/// injected with [`LocalUpstream::deliver`]; outbound traffic is recorded.
pub struct LocalUpstream {
    id: String,
    inbound: LocalBus<Value>,
    outbox: Mutex<Vec<SentMessage>>,
    failing: AtomicBool,
}

impl LocalUpstream {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            inbound: LocalBus::new(),
            outbox: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    /// Simulates the backend pushing `event` down this connection.
    pub fn deliver(&self, event: &str, payload: Value) -> UpstreamResult<usize> {
        Ok(self.inbound.publish(event, payload)?)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.outbox.lock().clone()
    }

    pub fn sent_events(&self, event: &str) -> Vec<SentMessage> {
        self.outbox
            .lock()
            .iter()
            .filter(|msg| msg.event == event)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.outbox.lock().clear();
    }

    /// While set, every send fails with [`UpstreamError::Transport`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inbound.subscriber_count(event)
    }

    pub fn close(&self) {
        self.inbound.close();
    }
}

impl Upstream for LocalUpstream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn send_upstream(&self, event: &str, payload: Value) -> UpstreamResult<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(UpstreamError::Transport(format!(
                "{} rejected {event}",
                self.id
            )));
        }
        debug!(target = "upstream.local", upstream = %self.id, event, "send");
        self.outbox.lock().push(SentMessage {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    fn on_upstream(&self, event: &str, handler: UpstreamHandler) -> Subscription {
        self.inbound.subscribe(event, handler)
    }

    fn on_all_upstream(&self, handler: UpstreamHandler) -> Subscription {
        self.inbound.subscribe_all(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use session_bus::handler;

    #[test]
    fn local_upstream_round_trip() {
        let upstream = LocalUpstream::new("primary");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        upstream.on_upstream(
            events::LIVENESS_ACK,
            handler(move |msg: &UpstreamMessage, _sub: &Subscription| {
                log.lock().push(msg.payload.clone());
            }),
        );
        let delivered = upstream
            .deliver(events::LIVENESS_ACK, json!({"seq": 1}))
            .expect("deliver ok");
        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock(), vec![json!({"seq": 1})]);
    }

    #[test]
    fn on_all_upstream_sees_every_event() {
        let upstream = LocalUpstream::new("primary");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        upstream.on_all_upstream(handler(move |msg: &UpstreamMessage, _sub: &Subscription| {
            log.lock().push(msg.topic.clone());
        }));
        upstream.deliver(events::SNAPSHOT_UPDATE, Value::Null).unwrap();
        upstream.deliver(events::FAILOVER_PENDING, Value::Null).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![events::SNAPSHOT_UPDATE.to_string(), events::FAILOVER_PENDING.to_string()]
        );
    }

    #[test]
    fn relay_forwards_bare_signal() {
        let upstream = LocalUpstream::new("secondary");
        upstream.relay_upstream(events::FAILOVER_COMPLETE).unwrap();
        assert_eq!(
            upstream.sent(),
            vec![SentMessage {
                event: events::FAILOVER_COMPLETE.to_string(),
                payload: Value::Null,
            }]
        );
    }

    #[test]
    fn failing_upstream_rejects_sends() {
        let upstream = LocalUpstream::new("primary");
        upstream.set_failing(true);
        let err = upstream
            .send_upstream(events::CONFIGURE_STANDBY, Value::Null)
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
        assert!(upstream.sent().is_empty());
    }

    #[test]
    fn closed_upstream_rejects_delivery() {
        let upstream = LocalUpstream::new("primary");
        upstream.close();
        assert!(matches!(
            upstream.deliver(events::SNAPSHOT_UPDATE, Value::Null),
            Err(UpstreamError::Closed)
        ));
    }
}
