use std::sync::Arc;

use session_bus::Subscription;
use tracing::{info, warn};
use upstream_transport::Upstream;

use crate::config::SyncConfig;
use crate::engine::SnapshotEngine;
use crate::events::{Dispatcher, EventBus};
use crate::graph::GraphSet;
use crate::heartbeat::Heartbeat;
use crate::registry::SessionRegistry;

/// Reacts to the active connection missing its liveness deadline.
pub trait RecoveryHandler: Send + Sync {
    fn on_liveness_timeout(&self, connection: &str);
}

/// Recovery for hosts without a UI: log and keep probing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecovery;

impl RecoveryHandler for LogRecovery {
    fn on_liveness_timeout(&self, connection: &str) {
        warn!(connection, "upstream unresponsive; waiting for next liveness SYN");
    }
}

/// Single-region wiring: one upstream, one engine, one heartbeat, timeouts
/// routed straight to recovery.
pub struct AgentSession {
    registry: Arc<SessionRegistry>,
    heartbeat: Heartbeat,
    binding: Subscription,
    timeout_listener: Subscription,
}

impl AgentSession {
    /// Must be called from within a tokio runtime.
    pub fn start(
        connection: &str,
        upstream: Arc<dyn Upstream>,
        bus: EventBus,
        config: &SyncConfig,
        recovery: Arc<dyn RecoveryHandler>,
    ) -> Self {
        let registry = SessionRegistry::new();
        let graphs = Arc::new(GraphSet::from_config(&config.graphs));
        let engine = Arc::new(SnapshotEngine::new(connection, bus.clone(), graphs));
        let binding = engine.bind(upstream.as_ref());
        registry.replace_engine(engine);
        registry.set_upstream(connection, Arc::clone(&upstream));

        let own = connection.to_string();
        let timeout_listener = Dispatcher::new(bus.clone()).on_liveness_timeout(move |timed_out| {
            if timed_out == own {
                recovery.on_liveness_timeout(timed_out);
            }
        });

        let heartbeat = Heartbeat::new(connection, upstream, bus, config.heartbeat);
        heartbeat.start();
        info!(connection, "agent session started");

        Self {
            registry,
            heartbeat,
            binding,
            timeout_listener,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn shutdown(&self) {
        self.heartbeat.stop();
        self.binding.cancel();
        self.timeout_listener.cancel();
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use upstream_transport::{LocalUpstream, events};

    struct Recorder(Mutex<Vec<String>>);

    impl RecoveryHandler for Recorder {
        fn on_liveness_timeout(&self, connection: &str) {
            self.0.lock().push(connection.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn session_ingests_and_recovers_on_timeout() {
        let upstream = LocalUpstream::new("primary");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let config = SyncConfig {
            heartbeat: HeartbeatConfig {
                syn_timeout_ms: 10,
                ack_timeout_ms: 20,
            },
            ..SyncConfig::default()
        };
        let session = AgentSession::start(
            "primary",
            upstream.clone(),
            EventBus::new(),
            &config,
            recorder.clone(),
        );

        upstream
            .deliver(events::SNAPSHOT_UPDATE, json!({"state": {"type": "routable"}}))
            .unwrap();
        let engine = session.registry().engine().unwrap();
        assert_eq!(engine.snapshot().unwrap().state.kind, "routable");

        tokio::time::advance(Duration::from_millis(20)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*recorder.0.lock(), vec!["primary".to_string()]);

        session.shutdown();
        assert!(!session.heartbeat().is_deferred());
    }
}
