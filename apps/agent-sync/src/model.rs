use serde::{Deserialize, Serialize};

/// Reserved pseudo-state a contact transitions out of when first seen.
pub const INIT_STATE: &str = "init";

/// Point-in-time copy of agent and contact state pushed by the backend.
/// Never mutated after it is received; each update replaces the stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub state: AgentState,
    #[serde(default)]
    pub local_timestamp: i64,
    #[serde(default)]
    pub skew: i64,
    #[serde(default)]
    pub contacts: Vec<ContactSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub name: String,
    /// Routing state type, e.g. `routable`, `not_routable`, `offline`.
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSnapshot {
    pub contact_id: String,
    pub state: ContactState,
    #[serde(default)]
    pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactState {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub connection_id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub state: Option<ContactState>,
}

impl AgentSnapshot {
    pub fn contact(&self, contact_id: &str) -> Option<&ContactSnapshot> {
        self.contacts.iter().find(|c| c.contact_id == contact_id)
    }

    pub fn connection(&self, connection_id: &str) -> Option<(&ContactSnapshot, &ConnectionSnapshot)> {
        self.contacts.iter().find_map(|contact| {
            contact
                .connections
                .iter()
                .find(|conn| conn.connection_id == connection_id)
                .map(|conn| (contact, conn))
        })
    }
}

impl AgentState {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

impl ContactSnapshot {
    pub fn new(contact_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            state: ContactState { kind: kind.into() },
            connections: Vec::new(),
        }
    }

    pub fn state_kind(&self) -> &str {
        &self.state.kind
    }
}
