pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod failover;
pub mod graph;
pub mod heartbeat;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod replay;
pub mod session;
pub mod telemetry;

pub use config::SyncConfig;
pub use engine::SnapshotEngine;
pub use error::{FailoverError, SyncError};
pub use events::{AgentEvent, ContactEvent, Dispatcher, EventBus, SyncEvent};
pub use failover::{FailoverSequencer, ReinitReport, SequencerDeps};
pub use heartbeat::Heartbeat;
pub use session::{AgentSession, RecoveryHandler};
