//! Declarative `(from, to)` state transition to event matching.

use std::fmt;

use crate::config::GraphConfig;
use crate::events::{AgentEvent, ContactEvent};

/// One side of a transition association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern<S> {
    Any,
    One(S),
    Set(Vec<S>),
}

impl<S: PartialEq> Pattern<S> {
    pub fn one(state: impl Into<S>) -> Self {
        Pattern::One(state.into())
    }

    pub fn set<I, T>(states: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<S>,
    {
        Pattern::Set(states.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, state: &S) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::One(expected) => expected == state,
            Pattern::Set(members) => members.contains(state),
        }
    }
}

impl<S: fmt::Display> fmt::Display for Pattern<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::One(state) => write!(f, "{state}"),
            Pattern::Set(members) => {
                f.write_str("{")?;
                for (idx, state) in members.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{state}")?;
                }
                f.write_str("}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association<S, E> {
    pub from: Pattern<S>,
    pub to: Pattern<S>,
    pub event: E,
}

/// Ordered list of associations. Resolution is pure: it returns every
/// matching association's event in registration order, duplicates included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionGraph<S, E> {
    associations: Vec<Association<S, E>>,
}

impl<S, E> Default for TransitionGraph<S, E> {
    fn default() -> Self {
        Self {
            associations: Vec::new(),
        }
    }
}

impl<S: PartialEq, E: Clone> TransitionGraph<S, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associate(mut self, from: Pattern<S>, to: Pattern<S>, event: E) -> Self {
        self.associations.push(Association { from, to, event });
        self
    }

    pub fn resolve(&self, from: &S, to: &S) -> Vec<E> {
        self.associations
            .iter()
            .filter(|assoc| assoc.from.matches(from) && assoc.to.matches(to))
            .map(|assoc| assoc.event.clone())
            .collect()
    }

    pub fn associations(&self) -> &[Association<S, E>] {
        &self.associations
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }
}

pub type AgentGraph = TransitionGraph<String, AgentEvent>;
pub type ContactGraph = TransitionGraph<String, ContactEvent>;

/// The three graphs the snapshot engine drives.
#[derive(Debug, Clone)]
pub struct GraphSet {
    /// Keyed on the agent routing state type.
    pub routing: AgentGraph,
    /// Keyed on the agent state name.
    pub named_state: AgentGraph,
    /// Keyed on the contact state type.
    pub contact: ContactGraph,
}

impl Default for GraphSet {
    fn default() -> Self {
        Self::from_config(&GraphConfig::default())
    }
}

impl GraphSet {
    pub fn from_config(config: &GraphConfig) -> Self {
        let routing = AgentGraph::new()
            .associate(Pattern::Any, Pattern::one("routable"), AgentEvent::Routable)
            .associate(Pattern::Any, Pattern::one("not_routable"), AgentEvent::NotRoutable)
            .associate(Pattern::Any, Pattern::one("offline"), AgentEvent::Offline);

        // agent error states raise the agent ERROR event only; contact errors
        // come from the contact graph
        let named_state = AgentGraph::new()
            .associate(
                Pattern::Any,
                Pattern::set(config.agent_error_states.iter().cloned()),
                AgentEvent::Error,
            )
            .associate(Pattern::Any, Pattern::one(config.acw_state.clone()), AgentEvent::Acw);

        let contact = ContactGraph::new()
            .associate(Pattern::Any, Pattern::one("incoming"), ContactEvent::Incoming)
            .associate(Pattern::Any, Pattern::one("pending"), ContactEvent::Pending)
            .associate(Pattern::Any, Pattern::one("connecting"), ContactEvent::Connecting)
            .associate(Pattern::Any, Pattern::one("connected"), ContactEvent::Connected)
            .associate(
                Pattern::set(["incoming", "connecting"]),
                Pattern::one("error"),
                ContactEvent::Missed,
            )
            .associate(Pattern::Any, Pattern::one("ended"), ContactEvent::Acw)
            .associate(Pattern::one("connected"), Pattern::one("ended"), ContactEvent::Ended)
            .associate(Pattern::Any, Pattern::one("error"), ContactEvent::Error);

        Self {
            routing,
            named_state,
            contact,
        }
    }
}
