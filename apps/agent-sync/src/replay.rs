//! Offline driver: feeds a JSON-lines capture through a dual-region
//! sequencer backed by in-memory upstreams and logs every emitted event.
//!
//! A line is either a bare agent snapshot, delivered as a snapshot update on
//! the active connection, or an envelope
//! `{"connection": "secondary", "event": "failover.initiated", "payload": {...}}`
//! delivered verbatim on the named connection (the active one when omitted).

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, anyhow};
use serde::Deserialize;
use serde_json::Value;
use session_bus::{Bus, BusMessage, Subscription, handler};
use tracing::{debug, info};
use upstream_transport::{
    ConnectionDescriptor, DualRegionSet, LocalUpstream, RegionConnection, Upstream, events,
};

use crate::config::SyncConfig;
use crate::events::{EventBus, SyncEvent};
use crate::failover::{FailoverSequencer, ReinitReport, SequencerDeps};
use crate::graph::GraphSet;
use crate::metrics::FailoverMetrics;
use crate::registry::{HeadlessSurfaces, SessionRegistry, UpstreamClientFactory};
use crate::session::LogRecovery;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ReplayLine {
    Envelope {
        #[serde(default)]
        connection: Option<String>,
        event: String,
        #[serde(default)]
        payload: Value,
    },
    Snapshot(Value),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub lines: usize,
    pub events: usize,
    pub active: Option<String>,
    pub contacts: Vec<String>,
}

pub struct ReplayHarness {
    upstreams: Vec<Arc<LocalUpstream>>,
    connections: Arc<DualRegionSet>,
    sequencer: FailoverSequencer,
    emitted: Arc<AtomicUsize>,
    _log: Subscription,
}

impl ReplayHarness {
    pub fn new(config: &SyncConfig, metrics: FailoverMetrics) -> (Self, ReinitReport) {
        let regions = &config.regions;
        let primary = LocalUpstream::new(regions.primary_name.clone());
        let secondary = LocalUpstream::new(regions.secondary_name.clone());
        let connections = DualRegionSet::new(
            RegionConnection::new(
                ConnectionDescriptor {
                    name: regions.primary_name.clone(),
                    region: regions.primary_region.clone(),
                    port_stream_id: format!("replay-{}", regions.primary_name),
                },
                primary.clone(),
            ),
            RegionConnection::new(
                ConnectionDescriptor {
                    name: regions.secondary_name.clone(),
                    region: regions.secondary_region.clone(),
                    port_stream_id: format!("replay-{}", regions.secondary_name),
                },
                secondary.clone(),
            ),
        );

        let bus = EventBus::new();
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&emitted);
        let log = bus.subscribe_all(handler(
            move |msg: &BusMessage<SyncEvent>, _sub: &Subscription| {
                counter.fetch_add(1, Ordering::Relaxed);
                match &msg.payload {
                    SyncEvent::StateChange { old, new } => {
                        info!(topic = %msg.topic, from = %old.kind, to = %new.kind, "event")
                    }
                    SyncEvent::Failover(notice) => {
                        info!(topic = %msg.topic, episode = %notice.episode, region = ?notice.region, "event")
                    }
                    other => info!(topic = %msg.topic, contact = ?other.contact_id(), "event"),
                }
            },
        ));

        let sequencer = FailoverSequencer::new(SequencerDeps {
            connections: connections.clone(),
            registry: SessionRegistry::new(),
            bus,
            graphs: Arc::new(GraphSet::from_config(&config.graphs)),
            clients: Arc::new(UpstreamClientFactory),
            surfaces: Arc::new(HeadlessSurfaces),
            recovery: Arc::new(LogRecovery),
            metrics,
        })
        .with_pending_window(config.failover.pending_window());
        let report = sequencer.initialize_active_region(regions.initial_region.as_deref());
        sequencer.listen();

        let harness = Self {
            upstreams: vec![primary, secondary],
            connections,
            sequencer,
            emitted,
            _log: log,
        };
        (harness, report)
    }

    pub fn sequencer(&self) -> &FailoverSequencer {
        &self.sequencer
    }

    pub fn events_emitted(&self) -> usize {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn apply(&self, line: ReplayLine) -> anyhow::Result<()> {
        let (connection, event, payload) = match line {
            ReplayLine::Envelope {
                connection,
                event,
                payload,
            } => (connection, event, payload),
            ReplayLine::Snapshot(payload) => (None, events::SNAPSHOT_UPDATE.to_string(), payload),
        };
        let name = match connection {
            Some(name) => name,
            None => self
                .connections
                .active_name()
                .ok_or_else(|| anyhow!("no active connection"))?,
        };
        let upstream = self
            .upstreams
            .iter()
            .find(|upstream| upstream.id() == name)
            .ok_or_else(|| anyhow!("unknown connection {name}"))?;
        let handled = upstream
            .deliver(&event, payload)
            .with_context(|| format!("deliver {event} on {name}"))?;
        debug!(connection = %name, event = %event, handled, "replayed");
        Ok(())
    }

    pub fn summary(&self, lines: usize) -> ReplaySummary {
        let contacts = self
            .sequencer
            .registry()
            .engine()
            .map(|engine| engine.contact_ids())
            .unwrap_or_default();
        ReplaySummary {
            lines,
            events: self.events_emitted(),
            active: self.connections.active_name(),
            contacts,
        }
    }
}

/// Applies every non-empty line of `reader` in order.
pub fn replay<R: BufRead>(reader: R, harness: &ReplayHarness) -> anyhow::Result<ReplaySummary> {
    let mut lines = 0;
    for (idx, raw) in reader.lines().enumerate() {
        let raw = raw.with_context(|| format!("read line {}", idx + 1))?;
        if raw.trim().is_empty() {
            continue;
        }
        let line: ReplayLine =
            serde_json::from_str(&raw).with_context(|| format!("parse line {}", idx + 1))?;
        harness
            .apply(line)
            .with_context(|| format!("apply line {}", idx + 1))?;
        lines += 1;
    }
    Ok(harness.summary(lines))
}
