use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Upstream, UpstreamError, UpstreamResult};

/// Identity of one region connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub name: String,
    /// `None` until the backend reports which region the connection serves.
    pub region: Option<String>,
    pub port_stream_id: String,
}

#[derive(Clone)]
pub struct RegionConnection {
    pub descriptor: ConnectionDescriptor,
    pub upstream: Arc<dyn Upstream>,
}

impl RegionConnection {
    pub fn new(descriptor: ConnectionDescriptor, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            descriptor,
            upstream,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn region(&self) -> Option<&str> {
        self.descriptor.region.as_deref()
    }
}

impl fmt::Debug for RegionConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionConnection")
            .field("descriptor", &self.descriptor)
            .field("upstream", &self.upstream.id())
            .finish()
    }
}

/// The parallel upstream connections of a dual-region deployment. Exactly
/// one connection is active once a designation has been made.
pub trait ConnectionSet: Send + Sync {
    fn active_connection(&self) -> Option<RegionConnection>;
    fn inactive_connection(&self) -> Option<RegionConnection>;
    fn all_connections(&self) -> Vec<RegionConnection>;
    fn connection_by_name(&self, name: &str) -> Option<RegionConnection>;
    fn connection_by_region(&self, region: &str) -> Option<RegionConnection>;
    fn set_active_connection(&self, name: &str) -> UpstreamResult<()>;
    fn set_region(&self, name: &str, region: &str) -> UpstreamResult<()>;
}

/// Primary/secondary pair. No connection is active until one is designated.
pub struct DualRegionSet {
    connections: RwLock<Vec<RegionConnection>>,
    active: RwLock<Option<String>>,
}

impl DualRegionSet {
    pub fn new(primary: RegionConnection, secondary: RegionConnection) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(vec![primary, secondary]),
            active: RwLock::new(None),
        })
    }

    pub fn active_name(&self) -> Option<String> {
        self.active.read().clone()
    }
}

impl ConnectionSet for DualRegionSet {
    fn active_connection(&self) -> Option<RegionConnection> {
        let active = self.active.read().clone()?;
        self.connection_by_name(&active)
    }

    fn inactive_connection(&self) -> Option<RegionConnection> {
        let active = self.active.read().clone()?;
        self.connections
            .read()
            .iter()
            .find(|conn| conn.name() != active)
            .cloned()
    }

    fn all_connections(&self) -> Vec<RegionConnection> {
        self.connections.read().clone()
    }

    fn connection_by_name(&self, name: &str) -> Option<RegionConnection> {
        self.connections
            .read()
            .iter()
            .find(|conn| conn.name() == name)
            .cloned()
    }

    fn connection_by_region(&self, region: &str) -> Option<RegionConnection> {
        self.connections
            .read()
            .iter()
            .find(|conn| conn.region() == Some(region))
            .cloned()
    }

    fn set_active_connection(&self, name: &str) -> UpstreamResult<()> {
        if self.connection_by_name(name).is_none() {
            return Err(UpstreamError::UnknownConnection(name.to_string()));
        }
        *self.active.write() = Some(name.to_string());
        Ok(())
    }

    fn set_region(&self, name: &str, region: &str) -> UpstreamResult<()> {
        let mut guard = self.connections.write();
        let conn = guard
            .iter_mut()
            .find(|conn| conn.name() == name)
            .ok_or_else(|| UpstreamError::UnknownConnection(name.to_string()))?;
        if conn.region() != Some(region) {
            info!(connection = %name, region, "region metadata recorded");
            conn.descriptor.region = Some(region.to_string());
        }
        Ok(())
    }
}
