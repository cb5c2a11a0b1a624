use thiserror::Error;

/// Read errors surfaced synchronously by the snapshot engine and registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("no snapshot has been received yet")]
    NotReady,
    #[error("{kind} {id} is not present in the current snapshot")]
    NotFound { kind: EntityKind, id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Contact,
    Connection,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Contact => f.write_str("contact"),
            EntityKind::Connection => f.write_str("connection"),
        }
    }
}

/// Sub-steps of an active region (re)initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReinitStep {
    SnapshotEngine,
    CommandClient,
    SurfaceVisibility,
    StandbyConfiguration,
}

impl ReinitStep {
    pub const ALL: [ReinitStep; 4] = [
        ReinitStep::SnapshotEngine,
        ReinitStep::CommandClient,
        ReinitStep::SurfaceVisibility,
        ReinitStep::StandbyConfiguration,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ReinitStep::SnapshotEngine => "snapshot_engine",
            ReinitStep::CommandClient => "command_client",
            ReinitStep::SurfaceVisibility => "surface_visibility",
            ReinitStep::StandbyConfiguration => "standby_configuration",
        }
    }
}

impl std::fmt::Display for ReinitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failover errors. Neither variant is ever returned from a public switch
/// entry point; both are logged and counted.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("no connection matches {0}")]
    InvalidTarget(String),
    #[error("reinitialisation step {step} failed: {reason}")]
    SubsystemReinit { step: ReinitStep, reason: String },
}
