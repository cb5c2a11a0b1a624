use std::fmt;
use std::sync::Arc;

use session_bus::{Bus, BusMessage, LocalBus, Subscription, handler, scoped_topic};
use uuid::Uuid;

use crate::model::{AgentSnapshot, AgentState, ContactSnapshot};

/// Topic raised when a connection misses its liveness deadline.
pub const LIVENESS_TIMEOUT: &str = "liveness.timeout";

pub type EventBus = LocalBus<SyncEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEvent {
    Init,
    Refresh,
    StateChange,
    Routable,
    NotRoutable,
    Offline,
    Error,
    Acw,
}

impl AgentEvent {
    pub const ALL: [AgentEvent; 8] = [
        AgentEvent::Init,
        AgentEvent::Refresh,
        AgentEvent::StateChange,
        AgentEvent::Routable,
        AgentEvent::NotRoutable,
        AgentEvent::Offline,
        AgentEvent::Error,
        AgentEvent::Acw,
    ];

    pub const fn topic(self) -> &'static str {
        match self {
            AgentEvent::Init => "agent.init",
            AgentEvent::Refresh => "agent.refresh",
            AgentEvent::StateChange => "agent.state_change",
            AgentEvent::Routable => "agent.routable",
            AgentEvent::NotRoutable => "agent.not_routable",
            AgentEvent::Offline => "agent.offline",
            AgentEvent::Error => "agent.error",
            AgentEvent::Acw => "agent.acw",
        }
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContactEvent {
    Init,
    Incoming,
    Pending,
    Connecting,
    Connected,
    Missed,
    Acw,
    Ended,
    Error,
    Destroyed,
    Refresh,
}

impl ContactEvent {
    pub const ALL: [ContactEvent; 11] = [
        ContactEvent::Init,
        ContactEvent::Incoming,
        ContactEvent::Pending,
        ContactEvent::Connecting,
        ContactEvent::Connected,
        ContactEvent::Missed,
        ContactEvent::Acw,
        ContactEvent::Ended,
        ContactEvent::Error,
        ContactEvent::Destroyed,
        ContactEvent::Refresh,
    ];

    pub const fn topic(self) -> &'static str {
        match self {
            ContactEvent::Init => "contact.init",
            ContactEvent::Incoming => "contact.incoming",
            ContactEvent::Pending => "contact.pending",
            ContactEvent::Connecting => "contact.connecting",
            ContactEvent::Connected => "contact.connected",
            ContactEvent::Missed => "contact.missed",
            ContactEvent::Acw => "contact.acw",
            ContactEvent::Ended => "contact.ended",
            ContactEvent::Error => "contact.error",
            ContactEvent::Destroyed => "contact.destroyed",
            ContactEvent::Refresh => "contact.refresh",
        }
    }

    /// Channel carrying this event for one contact only.
    pub fn scoped_topic(self, contact_id: &str) -> String {
        scoped_topic(self.topic(), contact_id)
    }
}

impl fmt::Display for ContactEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailoverPhase {
    Pending,
    Initiated,
    Complete,
}

impl FailoverPhase {
    pub const fn topic(self) -> &'static str {
        match self {
            FailoverPhase::Pending => "failover.pending",
            FailoverPhase::Initiated => "failover.initiated",
            FailoverPhase::Complete => "failover.complete",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            FailoverPhase::Pending => "pending",
            FailoverPhase::Initiated => "initiated",
            FailoverPhase::Complete => "complete",
        }
    }
}

/// Failover lifecycle notification published for local consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverNotice {
    pub phase: FailoverPhase,
    pub episode: Uuid,
    /// Region that is (or is about to become) active.
    pub region: Option<String>,
    /// Region that was active when the episode started.
    pub previous_region: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Agent(Arc<AgentSnapshot>),
    StateChange { old: AgentState, new: AgentState },
    Contact(ContactSnapshot),
    LivenessTimeout { connection: String },
    Failover(FailoverNotice),
}

impl SyncEvent {
    pub fn contact_id(&self) -> Option<&str> {
        match self {
            SyncEvent::Contact(contact) => Some(&contact.contact_id),
            _ => None,
        }
    }
}

/// Typed subscription surface over the event bus.
#[derive(Clone)]
pub struct Dispatcher {
    bus: EventBus,
}

impl Dispatcher {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn on<F>(&self, topic: &str, f: F) -> Subscription
    where
        F: Fn(&SyncEvent, &Subscription) + Send + Sync + 'static,
    {
        self.bus.subscribe(
            topic,
            handler(move |msg: &BusMessage<SyncEvent>, sub: &Subscription| f(&msg.payload, sub)),
        )
    }

    pub fn on_agent<F>(&self, event: AgentEvent, f: F) -> Subscription
    where
        F: Fn(&SyncEvent, &Subscription) + Send + Sync + 'static,
    {
        self.on(event.topic(), f)
    }

    pub fn on_contact<F>(&self, event: ContactEvent, f: F) -> Subscription
    where
        F: Fn(&SyncEvent, &Subscription) + Send + Sync + 'static,
    {
        self.on(event.topic(), f)
    }

    /// Lives only as long as the diff engine knows `contact_id`.
    pub fn on_contact_scoped<F>(&self, event: ContactEvent, contact_id: &str, f: F) -> Subscription
    where
        F: Fn(&SyncEvent, &Subscription) + Send + Sync + 'static,
    {
        self.on(&event.scoped_topic(contact_id), f)
    }

    pub fn on_liveness_timeout<F>(&self, f: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on(LIVENESS_TIMEOUT, move |event, _sub| {
            if let SyncEvent::LivenessTimeout { connection } = event {
                f(connection);
            }
        })
    }

    pub fn on_failover<F>(&self, phase: FailoverPhase, f: F) -> Subscription
    where
        F: Fn(&FailoverNotice, &Subscription) + Send + Sync + 'static,
    {
        self.on(phase.topic(), move |event, sub| {
            if let SyncEvent::Failover(notice) = event {
                f(notice, sub);
            }
        })
    }
}
