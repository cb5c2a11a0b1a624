//! Explicit context for the singletons defined in terms of "the current
//! upstream". Only the failover sequencer (or a single-region session)
//! writes here; everyone else reads at the moment of use.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;
use upstream_transport::{RegionConnection, Upstream};

use crate::engine::SnapshotEngine;
use crate::error::SyncError;

/// Outbound command path to the backend through one connection.
pub trait CommandClient: Send + Sync {
    fn connection(&self) -> &str;
    fn send(&self, command: &str, payload: Value) -> anyhow::Result<()>;
}

/// Builds a command client bound to a connection.
pub trait CommandClientFactory: Send + Sync {
    fn build(&self, connection: &RegionConnection) -> anyhow::Result<Arc<dyn CommandClient>>;
}

/// Shows or hides the UI surface belonging to a region connection.
pub trait SurfaceController: Send + Sync {
    fn set_visible(&self, connection: &str, visible: bool) -> anyhow::Result<()>;
}

/// Sends commands upstream on the connection it was built for.
pub struct UpstreamCommandClient {
    connection: String,
    upstream: Arc<dyn Upstream>,
}

impl UpstreamCommandClient {
    pub fn new(connection: impl Into<String>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            connection: connection.into(),
            upstream,
        }
    }
}

impl CommandClient for UpstreamCommandClient {
    fn connection(&self) -> &str {
        &self.connection
    }

    fn send(&self, command: &str, payload: Value) -> anyhow::Result<()> {
        self.upstream
            .send_upstream(command, payload)
            .with_context(|| format!("command {command} via {}", self.connection))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UpstreamClientFactory;

impl CommandClientFactory for UpstreamClientFactory {
    fn build(&self, connection: &RegionConnection) -> anyhow::Result<Arc<dyn CommandClient>> {
        Ok(Arc::new(UpstreamCommandClient::new(
            connection.name(),
            Arc::clone(&connection.upstream),
        )))
    }
}

/// Surface controller for headless hosts; records nothing but the log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessSurfaces;

impl SurfaceController for HeadlessSurfaces {
    fn set_visible(&self, connection: &str, visible: bool) -> anyhow::Result<()> {
        info!(connection, visible, "surface visibility");
        Ok(())
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    active_connection: RwLock<Option<String>>,
    upstream: RwLock<Option<Arc<dyn Upstream>>>,
    engine: RwLock<Option<Arc<SnapshotEngine>>>,
    client: RwLock<Option<Arc<dyn CommandClient>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active_connection(&self) -> Option<String> {
        self.active_connection.read().clone()
    }

    pub fn upstream(&self) -> Result<Arc<dyn Upstream>, SyncError> {
        self.upstream.read().clone().ok_or(SyncError::NotReady)
    }

    pub fn engine(&self) -> Result<Arc<SnapshotEngine>, SyncError> {
        self.engine.read().clone().ok_or(SyncError::NotReady)
    }

    pub fn client(&self) -> Result<Arc<dyn CommandClient>, SyncError> {
        self.client.read().clone().ok_or(SyncError::NotReady)
    }

    pub(crate) fn set_upstream(&self, connection: &str, upstream: Arc<dyn Upstream>) {
        *self.active_connection.write() = Some(connection.to_string());
        *self.upstream.write() = Some(upstream);
    }

    /// Returns the engine being replaced.
    pub(crate) fn replace_engine(&self, engine: Arc<SnapshotEngine>) -> Option<Arc<SnapshotEngine>> {
        self.engine.write().replace(engine)
    }

    pub(crate) fn set_client(&self, client: Arc<dyn CommandClient>) {
        *self.client.write() = Some(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use upstream_transport::{ConnectionDescriptor, LocalUpstream};

    #[test]
    fn empty_registry_is_not_ready() {
        let registry = SessionRegistry::new();
        assert!(registry.active_connection().is_none());
        assert_eq!(registry.engine().err(), Some(SyncError::NotReady));
        assert!(registry.upstream().is_err());
        assert!(registry.client().is_err());
    }

    #[test]
    fn upstream_client_sends_on_its_connection() {
        let upstream = LocalUpstream::new("primary");
        let connection = RegionConnection::new(
            ConnectionDescriptor {
                name: "primary".into(),
                region: None,
                port_stream_id: "p1".into(),
            },
            upstream.clone(),
        );
        let client = UpstreamClientFactory.build(&connection).unwrap();
        assert_eq!(client.connection(), "primary");
        client.send("agent.set_state", json!({"state": "Available"})).unwrap();
        assert_eq!(upstream.sent_events("agent.set_state").len(), 1);

        upstream.set_failing(true);
        let err = client.send("agent.set_state", Value::Null).unwrap_err();
        assert!(format!("{err:#}").contains("via primary"));
    }
}
