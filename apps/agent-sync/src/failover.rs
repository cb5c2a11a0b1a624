//! Active/standby coordination of the two region connections.
//!
//! The sequencer is the only writer of the active designation and of the
//! [`SessionRegistry`]. Failover signals arrive at least once and in any
//! order across the two connections, so every entry point is idempotent:
//! a repeated PENDING or INITIATED inside an episode is dropped, a switch to
//! the already active connection is a no-op, and COMPLETE is announced once,
//! only after the newly active connection has produced a snapshot.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use session_bus::{Bus, Subscription, handler};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use upstream_transport::{ConnectionSet, RegionConnection, UpstreamMessage, events};
use uuid::Uuid;

use crate::config::{DEFAULT_PENDING_WINDOW_MS, HeartbeatConfig};
use crate::engine::SnapshotEngine;
use crate::error::{FailoverError, ReinitStep};
use crate::events::{Dispatcher, EventBus, FailoverNotice, FailoverPhase, SyncEvent};
use crate::graph::GraphSet;
use crate::heartbeat::Heartbeat;
use crate::metrics::{FailoverMetrics, INITIATED_TO_COMPLETE, PENDING_TO_INITIATED};
use crate::registry::{CommandClientFactory, SessionRegistry, SurfaceController};
use crate::session::RecoveryHandler;

/// Collaborators the sequencer re-points on every cutover.
pub struct SequencerDeps {
    pub connections: Arc<dyn ConnectionSet>,
    pub registry: Arc<SessionRegistry>,
    pub bus: EventBus,
    pub graphs: Arc<GraphSet>,
    pub clients: Arc<dyn CommandClientFactory>,
    pub surfaces: Arc<dyn SurfaceController>,
    pub recovery: Arc<dyn RecoveryHandler>,
    pub metrics: FailoverMetrics,
}

/// Outcome of an active region (re)initialisation. Failed steps were logged
/// and counted; the remaining steps still ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReinitReport {
    pub active: Option<String>,
    pub failed: Vec<ReinitStep>,
}

impl ReinitReport {
    pub fn is_clean(&self) -> bool {
        self.active.is_some() && self.failed.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FailoverSignalPayload {
    next_active_region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegionMetadata {
    region: String,
}

/// Bounded interval between the first PENDING (or INITIATED) and COMPLETE.
/// A PENDING-only episode lapses after the pending window.
#[derive(Debug)]
struct FailoverEpisode {
    id: Uuid,
    pending_sent: bool,
    pending_at: Option<Instant>,
    initiated_at: Option<Instant>,
    previous_region: Option<String>,
    target_region: Option<String>,
    completion: Option<Subscription>,
    expiry: Option<JoinHandle<()>>,
}

impl FailoverEpisode {
    fn new(previous_region: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pending_sent: false,
            pending_at: None,
            initiated_at: None,
            previous_region,
            target_region: None,
            completion: None,
            expiry: None,
        }
    }

    fn is_lapsed(&self, now: Instant, window: Duration) -> bool {
        self.initiated_at.is_none()
            && self
                .pending_at
                .is_some_and(|at| now.duration_since(at) >= window)
    }

    fn disarm(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
        if let Some(listener) = self.completion.take() {
            listener.cancel();
        }
    }
}

struct SequencerState {
    episode: Option<FailoverEpisode>,
    pending_window: Duration,
    engine_binding: Option<Subscription>,
    signal_listeners: Vec<Subscription>,
    heartbeats: Vec<Heartbeat>,
    timeout_listener: Option<Subscription>,
}

impl Default for SequencerState {
    fn default() -> Self {
        Self {
            episode: None,
            pending_window: Duration::from_millis(DEFAULT_PENDING_WINDOW_MS),
            engine_binding: None,
            signal_listeners: Vec::new(),
            heartbeats: Vec::new(),
            timeout_listener: None,
        }
    }
}

pub struct FailoverSequencer {
    inner: Arc<SequencerInner>,
}

struct SequencerInner {
    deps: SequencerDeps,
    state: Mutex<SequencerState>,
}

impl FailoverSequencer {
    pub fn new(deps: SequencerDeps) -> Self {
        Self {
            inner: Arc::new(SequencerInner {
                deps,
                state: Mutex::new(SequencerState::default()),
            }),
        }
    }

    /// How long a PENDING without INITIATED holds its episode open.
    pub fn with_pending_window(self, window: Duration) -> Self {
        self.inner.state.lock().pending_window = window;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.deps.registry
    }

    pub fn metrics(&self) -> &FailoverMetrics {
        &self.inner.deps.metrics
    }

    /// Designates the active connection (by region or name when given) and
    /// re-points every dependent singleton at it.
    pub fn initialize_active_region(&self, region: Option<&str>) -> ReinitReport {
        self.inner.initialize_active_region(region)
    }

    /// Returns `true` only when the active connection actually changed.
    pub fn switch_active_region(&self, target: &str) -> bool {
        self.inner.switch_active_region(target)
    }

    /// Subscribes to failover signals and region metadata on every connection.
    pub fn listen(&self) {
        SequencerInner::listen(&self.inner);
    }

    /// Runs one heartbeat per connection. Must be called within a tokio runtime.
    pub fn start_liveness(&self, config: HeartbeatConfig) {
        SequencerInner::start_liveness(&self.inner, config);
    }

    /// Phase of the outstanding episode, if any.
    pub fn episode_phase(&self) -> Option<FailoverPhase> {
        self.inner.state.lock().episode.as_ref().map(|ep| {
            if ep.initiated_at.is_some() {
                FailoverPhase::Initiated
            } else {
                FailoverPhase::Pending
            }
        })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for FailoverSequencer {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl SequencerInner {
    fn connections(&self) -> &dyn ConnectionSet {
        self.deps.connections.as_ref()
    }

    fn active_region(&self) -> Option<String> {
        self.connections()
            .active_connection()
            .map(|conn| region_label(&conn))
    }

    fn initialize_active_region(&self, region: Option<&str>) -> ReinitReport {
        let connections = self.connections();
        if let Some(region) = region {
            let requested = connections
                .connection_by_region(region)
                .or_else(|| connections.connection_by_name(region));
            match requested {
                Some(conn) => {
                    if let Err(err) = connections.set_active_connection(conn.name()) {
                        warn!(region, error = %err, "failed to designate requested region");
                    }
                }
                None => {
                    let err = FailoverError::InvalidTarget(region.to_string());
                    warn!(error = %err, "keeping current active designation");
                }
            }
        }
        if connections.active_connection().is_none() {
            if let Some(first) = connections.all_connections().first() {
                if let Err(err) = connections.set_active_connection(first.name()) {
                    warn!(connection = %first.name(), error = %err, "failed to designate default");
                }
            }
        }

        let Some(active) = connections.active_connection() else {
            error!("no connection available to activate");
            return ReinitReport {
                active: None,
                failed: Vec::new(),
            };
        };
        let mut report = ReinitReport {
            active: Some(active.name().to_string()),
            failed: Vec::new(),
        };

        self.run_step(&mut report, ReinitStep::SnapshotEngine, || {
            self.rebind_engine(&active);
            Ok(())
        });
        self.run_step(&mut report, ReinitStep::CommandClient, || {
            let client = self.deps.clients.build(&active)?;
            self.deps.registry.set_client(client);
            Ok(())
        });
        self.run_step(&mut report, ReinitStep::SurfaceVisibility, || {
            self.apply_visibility(&active)
        });
        self.run_step(&mut report, ReinitStep::StandbyConfiguration, || {
            let Some(standby) = connections.inactive_connection() else {
                return Ok(());
            };
            standby.upstream.send_upstream(
                events::CONFIGURE_STANDBY,
                json!({
                    "activeConnection": active.name(),
                    "activeRegion": active.region(),
                }),
            )?;
            Ok(())
        });

        info!(
            active = %active.name(),
            region = ?active.region(),
            failed = report.failed.len(),
            "active region initialised"
        );
        report
    }

    fn run_step<F>(&self, report: &mut ReinitReport, step: ReinitStep, f: F)
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        if let Err(err) = f() {
            let err = FailoverError::SubsystemReinit {
                step,
                reason: format!("{err:#}"),
            };
            error!(step = %step, error = %err, "reinitialisation step failed; continuing");
            self.deps.metrics.record_reinit_failure(step);
            report.failed.push(step);
        }
    }

    fn rebind_engine(&self, active: &RegionConnection) {
        if let Some(binding) = self.state.lock().engine_binding.take() {
            binding.cancel();
        }
        let inherited = self
            .deps
            .registry
            .engine()
            .map(|engine| engine.contacts())
            .unwrap_or_default();
        let engine = Arc::new(
            SnapshotEngine::new(
                active.name(),
                self.deps.bus.clone(),
                Arc::clone(&self.deps.graphs),
            )
            .inherit_contacts(inherited),
        );
        let binding = engine.bind(active.upstream.as_ref());
        self.deps.registry.replace_engine(engine);
        self.deps
            .registry
            .set_upstream(active.name(), Arc::clone(&active.upstream));
        let stale = self.state.lock().engine_binding.replace(binding);
        if let Some(stale) = stale {
            stale.cancel();
        }
    }

    /// Hides every other surface before showing the active one.
    fn apply_visibility(&self, active: &RegionConnection) -> anyhow::Result<()> {
        let mut first_error = None;
        let others = self
            .connections()
            .all_connections()
            .into_iter()
            .filter(|conn| conn.name() != active.name());
        for conn in others {
            if let Err(err) = self.deps.surfaces.set_visible(conn.name(), false) {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.deps.surfaces.set_visible(active.name(), true) {
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn switch_active_region(&self, target: &str) -> bool {
        let connections = self.connections();
        if connections.connection_by_name(target).is_none() {
            let err = FailoverError::InvalidTarget(target.to_string());
            warn!(error = %err, "switch ignored");
            self.deps.metrics.record_signal("switch", "invalid_target");
            return false;
        }
        let previous = connections.active_connection();
        if previous.as_ref().map(|conn| conn.name()) == Some(target) {
            debug!(target, "switch ignored; already active");
            self.deps.metrics.record_signal("switch", "already_active");
            return false;
        }
        if let Err(err) = connections.set_active_connection(target) {
            warn!(target, error = %err, "switch ignored");
            self.deps.metrics.record_signal("switch", "invalid_target");
            return false;
        }
        info!(
            from = previous.as_ref().map(|conn| conn.name()).unwrap_or("none"),
            to = target,
            "switching active region"
        );
        self.initialize_active_region(None);
        self.deps.metrics.record_signal("switch", "switched");
        true
    }

    fn listen(this: &Arc<Self>) {
        let mut listeners = Vec::new();
        for conn in this.connections().all_connections() {
            let source = conn.name().to_string();
            let weak = Arc::downgrade(this);
            listeners.push(conn.upstream.on_upstream(
                events::FAILOVER_PENDING,
                signal_handler(weak, source.clone(), SequencerInner::on_pending),
            ));
            let weak = Arc::downgrade(this);
            listeners.push(conn.upstream.on_upstream(
                events::FAILOVER_INITIATED,
                signal_handler(weak, source.clone(), SequencerInner::on_initiated),
            ));
            let weak = Arc::downgrade(this);
            listeners.push(conn.upstream.on_upstream(
                events::REGION_METADATA,
                handler(move |msg: &UpstreamMessage, sub: &Subscription| {
                    let Some(inner) = weak.upgrade() else {
                        sub.cancel();
                        return;
                    };
                    match serde_json::from_value::<RegionMetadata>(msg.payload.clone()) {
                        Ok(meta) => {
                            if let Err(err) = inner.connections().set_region(&source, &meta.region) {
                                warn!(connection = %source, error = %err, "region metadata rejected");
                            }
                        }
                        Err(err) => {
                            warn!(connection = %source, error = %err, "undecodable region metadata")
                        }
                    }
                }),
            ));
        }
        let stale = std::mem::replace(&mut this.state.lock().signal_listeners, listeners);
        for listener in stale {
            listener.cancel();
        }
    }

    fn on_pending(this: &Arc<Self>, source: &str, payload: FailoverSignalPayload) {
        let now = Instant::now();
        let settled = this.targets_active(payload.next_active_region.as_deref());
        let mut episode = FailoverEpisode::new(this.active_region());
        let notice = {
            let mut state = this.state.lock();
            let window = state.pending_window;
            if let Some(current) = state.episode.as_ref() {
                if !current.is_lapsed(now, window) {
                    info!(
                        episode = %current.id,
                        source,
                        pending_sent = current.pending_sent,
                        "duplicate failover pending dropped"
                    );
                    drop(state);
                    this.deps.metrics.record_signal("pending", "duplicate");
                    return;
                }
            }
            if let Some(mut lapsed) = state.episode.take() {
                lapsed.disarm();
                info!(episode = %lapsed.id, "failover pending lapsed; starting a new episode");
            }
            if settled {
                drop(state);
                info!(source, target = ?payload.next_active_region, "failover pending for the active region dropped");
                this.deps.metrics.record_signal("pending", "stale");
                return;
            }
            episode.pending_sent = true;
            episode.pending_at = Some(now);
            episode.target_region = payload.next_active_region;
            episode.expiry = Self::arm_pending_window(this, episode.id, window);
            let notice = FailoverNotice {
                phase: FailoverPhase::Pending,
                episode: episode.id,
                region: episode.target_region.clone(),
                previous_region: episode.previous_region.clone(),
            };
            state.episode = Some(episode);
            notice
        };
        this.deps.metrics.record_signal("pending", "accepted");
        info!(episode = %notice.episode, source, target = ?notice.region, "failover pending");
        this.publish(notice);
    }

    /// Lapses the episode if INITIATED has not arrived within `window`.
    /// Without a runtime the lapse is detected on the next signal instead.
    fn arm_pending_window(
        this: &Arc<Self>,
        episode_id: Uuid,
        window: Duration,
    ) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak = Arc::downgrade(this);
        let delay = tokio::time::sleep(window);
        Some(runtime.spawn(async move {
            delay.await;
            if let Some(inner) = weak.upgrade() {
                inner.lapse_pending(episode_id);
            }
        }))
    }

    fn lapse_pending(&self, episode_id: Uuid) {
        let lapsed = {
            let mut state = self.state.lock();
            let pending_only = state
                .episode
                .as_ref()
                .is_some_and(|ep| ep.id == episode_id && ep.initiated_at.is_none());
            if pending_only { state.episode.take() } else { None }
        };
        let Some(mut lapsed) = lapsed else {
            return;
        };
        // this task owns the handle being cleared
        lapsed.expiry.take();
        lapsed.disarm();
        warn!(episode = %episode_id, "failover pending lapsed without initiation");
        self.deps.metrics.record_signal("pending", "lapsed");
    }

    fn on_initiated(this: &Arc<Self>, source: &str, payload: FailoverSignalPayload) {
        let now = Instant::now();
        let previous_region = this.active_region();
        let (notice, pending_latency) = {
            let mut state = this.state.lock();
            let window = state.pending_window;
            if state.episode.as_ref().is_some_and(|ep| ep.is_lapsed(now, window)) {
                if let Some(mut lapsed) = state.episode.take() {
                    lapsed.disarm();
                    info!(episode = %lapsed.id, "failover pending lapsed before initiation");
                }
            }
            if state.episode.is_none() {
                // with nothing outstanding, an INITIATED naming the active
                // connection is a late copy of a settled episode
                let target = this.resolve_target(payload.next_active_region.as_deref());
                let active = this.connections().active_connection();
                if target.is_some()
                    && target.as_ref().map(|c| c.name()) == active.as_ref().map(|c| c.name())
                {
                    drop(state);
                    info!(source, target = ?payload.next_active_region, "failover initiated for the active region dropped");
                    this.deps.metrics.record_signal("initiated", "duplicate");
                    return;
                }
            }
            let episode = state
                .episode
                .get_or_insert_with(|| FailoverEpisode::new(previous_region));
            if episode.initiated_at.is_some() {
                info!(episode = %episode.id, source, "duplicate failover initiated dropped");
                drop(state);
                this.deps.metrics.record_signal("initiated", "duplicate");
                return;
            }
            if let Some(expiry) = episode.expiry.take() {
                expiry.abort();
            }
            episode.initiated_at = Some(now);
            if payload.next_active_region.is_some() {
                episode.target_region = payload.next_active_region;
            }
            let pending_latency = episode.pending_at.map(|at| now.duration_since(at));
            let notice = FailoverNotice {
                phase: FailoverPhase::Initiated,
                episode: episode.id,
                region: episode.target_region.clone(),
                previous_region: episode.previous_region.clone(),
            };
            (notice, pending_latency)
        };
        this.deps.metrics.record_signal("initiated", "accepted");
        if let Some(latency) = pending_latency {
            this.deps.metrics.observe_latency(PENDING_TO_INITIATED, latency);
        }
        info!(episode = %notice.episode, source, target = ?notice.region, "failover initiated");
        let episode_id = notice.episode;
        let target_region = notice.region.clone();
        this.publish(notice);

        let Some(target) = this.resolve_target(target_region.as_deref()) else {
            let err = FailoverError::InvalidTarget(target_region.unwrap_or_else(|| "<none>".into()));
            warn!(episode = %episode_id, error = %err, "abandoning failover episode");
            this.deps.metrics.record_signal("initiated", "invalid_target");
            this.abandon_episode(episode_id);
            return;
        };
        let switched = this.switch_active_region(target.name());
        debug!(episode = %episode_id, target = %target.name(), switched, "cutover done");
        Self::await_first_update(this, episode_id, &target);
    }

    /// True when `region` names the connection that is already active.
    fn targets_active(&self, region: Option<&str>) -> bool {
        let connections = self.connections();
        let Some(target) = region.and_then(|r| connections.connection_by_region(r)) else {
            return false;
        };
        connections
            .active_connection()
            .is_some_and(|active| active.name() == target.name())
    }

    /// Region lookup, falling back to a connection whose region metadata has
    /// not arrived yet.
    fn resolve_target(&self, region: Option<&str>) -> Option<RegionConnection> {
        let connections = self.connections();
        if let Some(conn) = region.and_then(|r| connections.connection_by_region(r)) {
            return Some(conn);
        }
        let active = connections.active_connection().map(|c| c.name().to_string());
        let unpopulated: Vec<RegionConnection> = connections
            .all_connections()
            .into_iter()
            .filter(|conn| conn.region().is_none())
            .collect();
        let fallback = unpopulated
            .iter()
            .find(|conn| Some(conn.name()) != active.as_deref())
            .or_else(|| unpopulated.first())
            .cloned();
        if let Some(conn) = &fallback {
            warn!(
                requested = ?region,
                connection = %conn.name(),
                "region unresolved; using connection without region metadata"
            );
        }
        fallback
    }

    fn await_first_update(this: &Arc<Self>, episode_id: Uuid, target: &RegionConnection) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let listener = target.upstream.on_upstream(
            events::SNAPSHOT_UPDATE,
            handler(move |_msg: &UpstreamMessage, sub: &Subscription| {
                sub.cancel();
                if let Some(inner) = weak.upgrade() {
                    inner.complete_episode(episode_id);
                }
            }),
        );
        let stale = {
            let mut state = this.state.lock();
            match state.episode.as_mut() {
                Some(episode) if episode.id == episode_id => episode.completion.replace(listener),
                // episode completed or abandoned while switching
                _ => Some(listener),
            }
        };
        if let Some(stale) = stale {
            stale.cancel();
        }
    }

    fn complete_episode(&self, episode_id: Uuid) {
        let episode = {
            let mut state = self.state.lock();
            if state.episode.as_ref().is_some_and(|ep| ep.id == episode_id) {
                state.episode.take()
            } else {
                None
            }
        };
        let Some(mut episode) = episode else {
            return;
        };
        episode.disarm();
        if let Some(initiated_at) = episode.initiated_at {
            self.deps
                .metrics
                .observe_latency(INITIATED_TO_COMPLETE, initiated_at.elapsed());
        }
        self.deps.metrics.record_signal("complete", "accepted");
        let notice = FailoverNotice {
            phase: FailoverPhase::Complete,
            episode: episode.id,
            region: self.active_region(),
            previous_region: episode.previous_region.take(),
        };
        info!(episode = %notice.episode, region = ?notice.region, "failover complete");
        self.publish(notice);
        for conn in self.connections().all_connections() {
            if let Err(err) = conn.upstream.relay_upstream(events::FAILOVER_COMPLETE) {
                warn!(connection = %conn.name(), error = %err, "failed to relay failover complete");
            }
        }
    }

    fn abandon_episode(&self, episode_id: Uuid) {
        let mut state = self.state.lock();
        if state.episode.as_ref().map(|ep| ep.id) == Some(episode_id) {
            if let Some(mut episode) = state.episode.take() {
                episode.disarm();
            }
        }
    }

    fn start_liveness(this: &Arc<Self>, config: HeartbeatConfig) {
        let weak = Arc::downgrade(this);
        let listener = Dispatcher::new(this.deps.bus.clone()).on_liveness_timeout(move |connection| {
            if let Some(inner) = weak.upgrade() {
                inner.on_liveness_timeout(connection);
            }
        });
        let heartbeats: Vec<Heartbeat> = this
            .connections()
            .all_connections()
            .into_iter()
            .map(|conn| {
                Heartbeat::new(
                    conn.name(),
                    Arc::clone(&conn.upstream),
                    this.deps.bus.clone(),
                    config,
                )
            })
            .collect();
        for heartbeat in &heartbeats {
            heartbeat.start();
        }
        let (stale_heartbeats, stale_listener) = {
            let mut state = this.state.lock();
            (
                std::mem::replace(&mut state.heartbeats, heartbeats),
                state.timeout_listener.replace(listener),
            )
        };
        drop(stale_heartbeats);
        if let Some(listener) = stale_listener {
            listener.cancel();
        }
    }

    fn on_liveness_timeout(&self, connection: &str) {
        let active = self.connections().active_connection();
        if active.as_ref().map(|conn| conn.name()) == Some(connection) {
            self.deps.metrics.record_liveness_timeout("active");
            self.deps.recovery.on_liveness_timeout(connection);
        } else {
            self.deps.metrics.record_liveness_timeout("inactive");
            info!(connection, "standby connection missed liveness deadline");
        }
    }

    fn publish(&self, notice: FailoverNotice) {
        let topic = notice.phase.topic();
        if let Err(err) = self.deps.bus.publish(topic, SyncEvent::Failover(notice)) {
            debug!(topic, error = %err, "failover notice not delivered");
        }
    }

    fn shutdown(&self) {
        let (binding, listeners, heartbeats, timeout, episode) = {
            let mut state = self.state.lock();
            (
                state.engine_binding.take(),
                std::mem::take(&mut state.signal_listeners),
                std::mem::take(&mut state.heartbeats),
                state.timeout_listener.take(),
                state.episode.take(),
            )
        };
        if let Some(mut episode) = episode {
            episode.disarm();
        }
        for heartbeat in &heartbeats {
            heartbeat.stop();
        }
        for sub in binding.into_iter().chain(listeners).chain(timeout) {
            sub.cancel();
        }
    }
}

fn region_label(conn: &RegionConnection) -> String {
    conn.region().unwrap_or(conn.name()).to_string()
}

fn signal_handler(
    inner: Weak<SequencerInner>,
    source: String,
    on_signal: fn(&Arc<SequencerInner>, &str, FailoverSignalPayload),
) -> session_bus::Handler<serde_json::Value> {
    handler(move |msg: &UpstreamMessage, sub: &Subscription| {
        let Some(inner) = inner.upgrade() else {
            sub.cancel();
            return;
        };
        let payload = match serde_json::from_value::<FailoverSignalPayload>(msg.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(connection = %source, signal = %msg.topic, error = %err, "undecodable failover signal");
                FailoverSignalPayload::default()
            }
        };
        on_signal(&inner, &source, payload);
    })
}
