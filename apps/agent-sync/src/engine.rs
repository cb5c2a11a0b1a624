use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use session_bus::{Bus, BusError, Subscription, handler};
use tracing::{debug, warn};
use upstream_transport::{Upstream, UpstreamMessage, events};

use crate::error::{EntityKind, SyncError};
use crate::events::{AgentEvent, ContactEvent, EventBus, SyncEvent};
use crate::graph::GraphSet;
use crate::model::{AgentSnapshot, ConnectionSnapshot, ContactSnapshot, INIT_STATE};

/// Turns a stream of full snapshots into agent and contact life-cycle events.
///
/// Every [`SnapshotEngine::ingest`] re-derives its events from the previous
/// and the new snapshot only, so a fresh engine per connection never carries
/// state across regions.
pub struct SnapshotEngine {
    label: String,
    bus: EventBus,
    graphs: Arc<GraphSet>,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    current: Option<Arc<AgentSnapshot>>,
    /// Contacts known to a retired engine, reconciled on the first ingest.
    inherited: Vec<ContactSnapshot>,
}

impl SnapshotEngine {
    pub fn new(label: impl Into<String>, bus: EventBus, graphs: Arc<GraphSet>) -> Self {
        Self {
            label: label.into(),
            bus,
            graphs,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Contacts a previous engine knew about. Those missing from this engine's
    /// first snapshot are destroyed and their scoped channels dropped.
    pub fn inherit_contacts(self, contacts: Vec<ContactSnapshot>) -> Self {
        self.state.lock().inherited = contacts;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().current.is_some()
    }

    pub fn snapshot(&self) -> Result<Arc<AgentSnapshot>, SyncError> {
        self.state.lock().current.clone().ok_or(SyncError::NotReady)
    }

    pub fn contact(&self, contact_id: &str) -> Result<ContactSnapshot, SyncError> {
        let snapshot = self.snapshot()?;
        snapshot
            .contact(contact_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound {
                kind: EntityKind::Contact,
                id: contact_id.to_string(),
            })
    }

    pub fn connection(&self, connection_id: &str) -> Result<ConnectionSnapshot, SyncError> {
        let snapshot = self.snapshot()?;
        snapshot
            .connection(connection_id)
            .map(|(_, conn)| conn.clone())
            .ok_or_else(|| SyncError::NotFound {
                kind: EntityKind::Connection,
                id: connection_id.to_string(),
            })
    }

    /// Contacts in the current snapshot; empty before the first ingest.
    pub fn contacts(&self) -> Vec<ContactSnapshot> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|snapshot| snapshot.contacts.clone())
            .unwrap_or_default()
    }

    pub fn contact_ids(&self) -> Vec<String> {
        self.contacts().into_iter().map(|c| c.contact_id).collect()
    }

    /// Feeds snapshot updates from `upstream` into this engine until the
    /// returned subscription is cancelled or the engine is dropped.
    pub fn bind(self: &Arc<Self>, upstream: &dyn Upstream) -> Subscription {
        let engine: Weak<SnapshotEngine> = Arc::downgrade(self);
        upstream.on_upstream(
            events::SNAPSHOT_UPDATE,
            handler(move |msg: &UpstreamMessage, sub: &Subscription| {
                let Some(engine) = engine.upgrade() else {
                    sub.cancel();
                    return;
                };
                match serde_json::from_value::<AgentSnapshot>(msg.payload.clone()) {
                    Ok(snapshot) => engine.ingest(snapshot),
                    Err(err) => warn!(
                        engine = %engine.label,
                        error = %err,
                        "dropping undecodable snapshot"
                    ),
                }
            }),
        )
    }

    pub fn ingest(&self, snapshot: AgentSnapshot) {
        self.ingest_shared(Arc::new(snapshot));
    }

    /// Sole mutator. The lock is released before any event fires, so handlers
    /// may read the engine.
    pub fn ingest_shared(&self, new: Arc<AgentSnapshot>) {
        let (old, inherited) = {
            let mut state = self.state.lock();
            let old = state.current.replace(Arc::clone(&new));
            let inherited = if old.is_none() {
                std::mem::take(&mut state.inherited)
            } else {
                Vec::new()
            };
            (old, inherited)
        };

        if old.is_none() {
            self.fire(AgentEvent::Init.topic(), SyncEvent::Agent(Arc::clone(&new)));
        }
        self.fire(AgentEvent::Refresh.topic(), SyncEvent::Agent(Arc::clone(&new)));

        if let Some(old) = old.as_deref() {
            self.diff_agent_state(old, &new);
        }

        let empty = Vec::new();
        let old_contacts = old.as_deref().map(|o| &o.contacts).unwrap_or(&empty);
        self.diff_contacts(old_contacts, &new.contacts);

        if !inherited.is_empty() {
            let present: HashSet<&str> =
                new.contacts.iter().map(|c| c.contact_id.as_str()).collect();
            for contact in inherited
                .iter()
                .filter(|c| !present.contains(c.contact_id.as_str()))
            {
                debug!(
                    engine = %self.label,
                    contact_id = %contact.contact_id,
                    "inherited contact absent after cutover"
                );
                self.destroy_contact(contact);
            }
        }
    }

    fn diff_agent_state(&self, old: &AgentSnapshot, new: &Arc<AgentSnapshot>) {
        if old.state == new.state {
            return;
        }
        self.fire(
            AgentEvent::StateChange.topic(),
            SyncEvent::StateChange {
                old: old.state.clone(),
                new: new.state.clone(),
            },
        );
        // each graph only sees a transition of its own key
        let mut resolved = Vec::new();
        if old.state.kind != new.state.kind {
            resolved.extend(self.graphs.routing.resolve(&old.state.kind, &new.state.kind));
        }
        if old.state.name != new.state.name {
            resolved.extend(self.graphs.named_state.resolve(&old.state.name, &new.state.name));
        }
        for event in resolved {
            self.fire(event.topic(), SyncEvent::Agent(Arc::clone(new)));
        }
    }

    fn diff_contacts(&self, old: &[ContactSnapshot], new: &[ContactSnapshot]) {
        let old_by_id = index_contacts(old);
        let new_by_id = index_contacts(new);

        for contact in new.iter().filter(|c| !old_by_id.contains_key(c.contact_id.as_str())) {
            self.fire(ContactEvent::Init.topic(), SyncEvent::Contact(contact.clone()));
            self.fire_contact_transition(contact, INIT_STATE);
        }

        for contact in old.iter().filter(|c| !new_by_id.contains_key(c.contact_id.as_str())) {
            self.destroy_contact(contact);
        }

        for contact in new.iter() {
            let Some(previous) = old_by_id.get(contact.contact_id.as_str()) else {
                continue;
            };
            self.fire_contact_transition(contact, previous.state_kind());
        }
    }

    /// Fires each resolved event broadcast and scoped, then REFRESH.
    fn fire_contact_transition(&self, contact: &ContactSnapshot, from: &str) {
        let to = contact.state_kind();
        if from != to {
            let resolved = self.graphs.contact.resolve(&from.to_string(), &to.to_string());
            for event in resolved {
                self.fire_contact(event, contact);
            }
        }
        self.fire_contact(ContactEvent::Refresh, contact);
    }

    fn fire_contact(&self, event: ContactEvent, contact: &ContactSnapshot) {
        let payload = SyncEvent::Contact(contact.clone());
        self.fire(event.topic(), payload.clone());
        self.fire(&event.scoped_topic(&contact.contact_id), payload);
    }

    fn destroy_contact(&self, contact: &ContactSnapshot) {
        self.fire_contact(ContactEvent::Destroyed, contact);
        self.bus.unsubscribe_scope(&contact.contact_id);
    }

    fn fire(&self, topic: &str, payload: SyncEvent) {
        match self.bus.publish(topic, payload) {
            Ok(_) => {}
            Err(BusError::Closed) => {
                debug!(engine = %self.label, topic, "event bus closed; dropping event")
            }
            Err(err) => warn!(engine = %self.label, topic, error = %err, "failed to publish"),
        }
    }
}

fn index_contacts(contacts: &[ContactSnapshot]) -> HashMap<&str, &ContactSnapshot> {
    let mut index = HashMap::with_capacity(contacts.len());
    for contact in contacts {
        index.entry(contact.contact_id.as_str()).or_insert(contact);
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Dispatcher;
    use crate::model::AgentState;
    use serde_json::json;
    use session_bus::BusMessage;
    use upstream_transport::LocalUpstream;

    fn engine() -> (Arc<SnapshotEngine>, EventBus, Arc<Mutex<Vec<String>>>) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        bus.subscribe_all(handler(move |msg: &BusMessage<SyncEvent>, _sub: &Subscription| {
            log.lock().push(msg.topic.clone());
        }));
        let engine = Arc::new(SnapshotEngine::new(
            "primary",
            bus.clone(),
            Arc::new(GraphSet::default()),
        ));
        (engine, bus, seen)
    }

    fn snapshot(kind: &str, contacts: Vec<ContactSnapshot>) -> AgentSnapshot {
        AgentSnapshot {
            state: AgentState::new(kind, kind),
            local_timestamp: 0,
            skew: 0,
            contacts,
        }
    }

    fn drain(seen: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        std::mem::take(&mut *seen.lock())
    }

    #[test]
    fn reads_before_first_snapshot_are_not_ready() {
        let (engine, _bus, _seen) = engine();
        assert!(!engine.is_ready());
        assert_eq!(engine.snapshot().unwrap_err(), SyncError::NotReady);
        assert_eq!(engine.contact("c1").unwrap_err(), SyncError::NotReady);
        assert_eq!(engine.connection("x").unwrap_err(), SyncError::NotReady);
        assert!(engine.contact_ids().is_empty());
    }

    #[test]
    fn unknown_entities_are_not_found() {
        let (engine, _bus, _seen) = engine();
        engine.ingest(snapshot("routable", vec![ContactSnapshot::new("c1", "connected")]));
        assert!(engine.contact("c1").is_ok());
        assert_eq!(
            engine.contact("c2").unwrap_err(),
            SyncError::NotFound {
                kind: EntityKind::Contact,
                id: "c2".into()
            }
        );
        assert!(matches!(
            engine.connection("conn-9").unwrap_err(),
            SyncError::NotFound {
                kind: EntityKind::Connection,
                ..
            }
        ));
    }

    #[test]
    fn name_only_change_does_not_replay_routing_events() {
        let (engine, _bus, seen) = engine();
        let with_state = |name: &str, kind: &str| AgentSnapshot {
            state: AgentState::new(name, kind),
            ..snapshot(kind, Vec::new())
        };
        engine.ingest(with_state("Break", "not_routable"));
        drain(&seen);

        engine.ingest(with_state("Lunch", "not_routable"));
        assert_eq!(drain(&seen), vec!["agent.refresh", "agent.state_change"]);

        engine.ingest(with_state("AfterCallWork", "routable"));
        assert_eq!(
            drain(&seen),
            vec!["agent.refresh", "agent.state_change", "agent.routable", "agent.acw"]
        );
    }

    #[test]
    fn first_snapshot_initialises_agent_and_contacts() {
        let (engine, _bus, seen) = engine();
        engine.ingest(snapshot("routable", vec![ContactSnapshot::new("c1", "incoming")]));
        assert_eq!(
            drain(&seen),
            vec![
                "agent.init",
                "agent.refresh",
                "contact.init",
                "contact.incoming",
                "contact.incoming::c1",
                "contact.refresh",
                "contact.refresh::c1",
            ]
        );
    }

    #[test]
    fn offline_to_routable_fires_state_change_then_routable() {
        let (engine, _bus, seen) = engine();
        engine.ingest(snapshot("offline", vec![]));
        drain(&seen);
        engine.ingest(snapshot("routable", vec![]));
        assert_eq!(
            drain(&seen),
            vec!["agent.refresh", "agent.state_change", "agent.routable"]
        );
    }

    #[test]
    fn state_change_carries_old_and_new() {
        let (engine, bus, _seen) = engine();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&changes);
        Dispatcher::new(bus).on_agent(AgentEvent::StateChange, move |event, _sub| {
            if let SyncEvent::StateChange { old, new } = event {
                log.lock().push((old.kind.clone(), new.kind.clone()));
            }
        });
        engine.ingest(snapshot("offline", vec![]));
        engine.ingest(snapshot("routable", vec![]));
        assert_eq!(
            *changes.lock(),
            vec![("offline".to_string(), "routable".to_string())]
        );
    }

    #[test]
    fn identical_snapshot_only_refreshes() {
        let (engine, _bus, seen) = engine();
        let value = snapshot(
            "routable",
            vec![
                ContactSnapshot::new("c1", "connected"),
                ContactSnapshot::new("c2", "incoming"),
            ],
        );
        engine.ingest(value.clone());
        drain(&seen);
        engine.ingest(value);
        let topics = drain(&seen);
        assert!(!topics.is_empty());
        assert!(
            topics.iter().all(|t| t.starts_with("agent.refresh") || t.starts_with("contact.refresh")),
            "unexpected events: {topics:?}"
        );
    }

    #[test]
    fn connecting_to_connected_fires_broadcast_and_scoped() {
        let (engine, bus, seen) = engine();
        let scoped_hits = Arc::new(Mutex::new(0usize));
        let hits = Arc::clone(&scoped_hits);
        Dispatcher::new(bus).on_contact_scoped(ContactEvent::Connected, "c1", move |event, _sub| {
            assert_eq!(event.contact_id(), Some("c1"));
            *hits.lock() += 1;
        });
        engine.ingest(snapshot("routable", vec![ContactSnapshot::new("c1", "connecting")]));
        drain(&seen);
        engine.ingest(snapshot("routable", vec![ContactSnapshot::new("c1", "connected")]));
        assert_eq!(
            drain(&seen),
            vec![
                "agent.refresh",
                "contact.connected",
                "contact.connected::c1",
                "contact.refresh",
                "contact.refresh::c1",
            ]
        );
        assert_eq!(*scoped_hits.lock(), 1);
    }

    #[test]
    fn removed_contact_is_destroyed_and_scoped_channels_released() {
        let (engine, bus, seen) = engine();
        let dispatcher = Dispatcher::new(bus.clone());
        let scoped_hits = Arc::new(Mutex::new(Vec::new()));
        for event in [ContactEvent::Refresh, ContactEvent::Ended, ContactEvent::Destroyed] {
            let hits = Arc::clone(&scoped_hits);
            dispatcher.on_contact_scoped(event, "c1", move |_e, _sub| hits.lock().push(event));
        }
        engine.ingest(snapshot("routable", vec![ContactSnapshot::new("c1", "connected")]));
        drain(&seen);
        scoped_hits.lock().clear();

        engine.ingest(snapshot("routable", vec![]));
        assert_eq!(
            drain(&seen),
            vec!["agent.refresh", "contact.destroyed", "contact.destroyed::c1"]
        );
        assert_eq!(*scoped_hits.lock(), vec![ContactEvent::Destroyed]);

        for event in ContactEvent::ALL {
            assert_eq!(bus.publish(&event.scoped_topic("c1"), SyncEvent::Contact(
                ContactSnapshot::new("c1", "ended"),
            )).unwrap(), 1, "only the wildcard recorder should remain");
        }
        assert_eq!(*scoped_hits.lock(), vec![ContactEvent::Destroyed]);
        assert!(bus.topics().iter().all(|t| !t.ends_with("::c1")));
    }

    #[test]
    fn added_removed_and_common_contacts_in_one_update() {
        let (engine, _bus, seen) = engine();
        engine.ingest(snapshot(
            "routable",
            vec![
                ContactSnapshot::new("keep", "connected"),
                ContactSnapshot::new("gone", "ended"),
            ],
        ));
        drain(&seen);
        engine.ingest(snapshot(
            "routable",
            vec![
                ContactSnapshot::new("keep", "ended"),
                ContactSnapshot::new("new", "connecting"),
            ],
        ));
        assert_eq!(
            drain(&seen),
            vec![
                "agent.refresh",
                "contact.init",
                "contact.connecting",
                "contact.connecting::new",
                "contact.refresh",
                "contact.refresh::new",
                "contact.destroyed",
                "contact.destroyed::gone",
                "contact.acw",
                "contact.acw::keep",
                "contact.ended",
                "contact.ended::keep",
                "contact.refresh",
                "contact.refresh::keep",
            ]
        );
    }

    #[test]
    fn named_state_change_without_routing_change() {
        let (engine, _bus, seen) = engine();
        let mut first = snapshot("routable", vec![]);
        first.state = AgentState::new("Available", "routable");
        let mut second = first.clone();
        second.state = AgentState::new("AfterCallWork", "not_routable");
        engine.ingest(first);
        drain(&seen);
        engine.ingest(second);
        assert_eq!(
            drain(&seen),
            vec![
                "agent.refresh",
                "agent.state_change",
                "agent.not_routable",
                "agent.acw"
            ]
        );
    }

    #[test]
    fn inherited_contacts_missing_after_cutover_are_destroyed() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        bus.subscribe_all(handler(move |msg: &BusMessage<SyncEvent>, _sub: &Subscription| {
            log.lock().push(msg.topic.clone());
        }));
        let scoped = Dispatcher::new(bus.clone()).on_contact_scoped(
            ContactEvent::Refresh,
            "stale",
            |_e, _sub| {},
        );
        let engine = SnapshotEngine::new("secondary", bus.clone(), Arc::new(GraphSet::default()))
            .inherit_contacts(vec![
                ContactSnapshot::new("stale", "connected"),
                ContactSnapshot::new("kept", "connected"),
            ]);
        engine.ingest(snapshot("routable", vec![ContactSnapshot::new("kept", "connected")]));
        let topics = drain(&seen);
        assert!(topics.contains(&"contact.destroyed::stale".to_string()));
        assert!(!topics.iter().any(|t| t == "contact.destroyed::kept"));
        assert!(!scoped.is_active());

        engine.ingest(snapshot("routable", vec![]));
        let topics = drain(&seen);
        assert_eq!(
            topics.iter().filter(|t| t.starts_with("contact.destroyed::")).count(),
            1
        );
    }

    #[test]
    fn bound_engine_ingests_upstream_updates() {
        let (engine, _bus, seen) = engine();
        let upstream = LocalUpstream::new("primary");
        let binding = engine.bind(upstream.as_ref());
        upstream
            .deliver(events::SNAPSHOT_UPDATE, json!({"state": {"name": "x", "type": "offline"}}))
            .unwrap();
        upstream
            .deliver(events::SNAPSHOT_UPDATE, json!({"state": "garbage"}))
            .unwrap();
        assert_eq!(drain(&seen), vec!["agent.init", "agent.refresh"]);
        assert_eq!(engine.snapshot().unwrap().state.kind, "offline");

        binding.cancel();
        upstream
            .deliver(events::SNAPSHOT_UPDATE, json!({"state": {"type": "routable"}}))
            .unwrap();
        assert!(drain(&seen).is_empty());
    }
}
