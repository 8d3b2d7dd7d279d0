//! Instance records and API wire shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::PortPair;

/// Lifecycle state of an instance.
///
/// Transitions run `Creating -> Running -> Stopped`, with `Error` reachable
/// from `Creating` or `Running`. `Stopped` and `Error` are terminal: deletion
/// removes the record, no further transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Ports reserved, container creation in flight.
    Creating,
    /// Container up and reachable.
    Running,
    /// Container exited or disappeared.
    Stopped,
    /// Creation failed or the runtime reported an unrecoverable condition.
    Error,
}

impl InstanceState {
    /// Terminal states exit the registry only through deletion.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Error)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Creating => write!(f, "creating"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Error => write!(f, "error"),
        }
    }
}

/// Instance-specific parameters supplied at creation.
///
/// Travels client-to-server inside [`CreateInstanceRequest`] only; API
/// responses use [`InstanceDetails`], which never carries the credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Access credential for the remote-desktop session, passed to the
    /// container as an environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rdp_password: Option<String>,
}

/// One managed application session, backed by one container and a reserved
/// port pair. Internal record; API responses use [`InstanceDetails`].
#[derive(Debug, Clone)]
pub struct Instance {
    /// Opaque unique identifier, immutable after creation.
    pub id: String,
    /// Lifecycle state; written only by the registry.
    pub state: InstanceState,
    /// Diagnostic text, populated when `state` is `Error`.
    pub status_message: Option<String>,
    /// Container-runtime handle; set at most once, after creation succeeds.
    pub container_ref: Option<String>,
    /// Reserved host port pair.
    pub ports: PortPair,
    /// Modification identifiers requested at creation.
    pub mods: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Drives cleanup eligibility.
    pub last_state_change_at: DateTime<Utc>,
    pub config: InstanceConfig,
    /// Monotonic insertion number: `list()` returns creation order.
    pub(crate) seq: u64,
    /// Set when a delete arrived while the create was still in flight; the
    /// create path tears the instance down once the runtime call settles.
    pub(crate) teardown_requested: bool,
    /// Whether this record still owns its port pair. Cleared before the pair
    /// is returned to the allocator so a racing delete never releases the
    /// same ports a second time.
    pub(crate) holds_ports: bool,
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Request body for instance creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    /// Base64-encoded application payload, mounted into the container.
    pub payload: String,
    /// Modification identifiers to enable.
    #[serde(default)]
    pub mods: Vec<String>,
    /// Optional instance configuration.
    #[serde(default)]
    pub config: InstanceConfig,
}

/// Instance representation returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDetails {
    pub id: String,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    pub rdp_port: u16,
    pub console_port: u16,
    /// Convenience connection string for remote-desktop clients.
    pub rdp_url: String,
    pub mods: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_state_change_at: DateTime<Utc>,
}

impl From<Instance> for InstanceDetails {
    fn from(instance: Instance) -> Self {
        Self {
            rdp_url: format!("rdp://localhost:{}", instance.ports.rdp),
            id: instance.id,
            state: instance.state,
            status_message: instance.status_message,
            container_ref: instance.container_ref,
            rdp_port: instance.ports.rdp,
            console_port: instance.ports.console,
            mods: instance.mods,
            created_at: instance.created_at,
            last_state_change_at: instance.last_state_change_at,
        }
    }
}

/// Response body for the logs endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub instance_id: String,
    pub logs: String,
}

/// Response body for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub runtime_reachable: bool,
    pub instances: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!InstanceState::Creating.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
        assert!(InstanceState::Stopped.is_terminal());
        assert!(InstanceState::Error.is_terminal());
    }

    #[test]
    fn create_request_carries_the_credential() {
        let req = CreateInstanceRequest {
            payload: "aGVsbG8=".to_string(),
            mods: Vec::new(),
            config: InstanceConfig {
                rdp_password: Some("secret".to_string()),
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("secret"));
    }

    #[test]
    fn details_never_expose_the_credential() {
        let instance = Instance {
            id: "abc".to_string(),
            state: InstanceState::Running,
            status_message: None,
            container_ref: Some("ref".to_string()),
            ports: PortPair {
                rdp: 3390,
                console: 8081,
            },
            mods: Vec::new(),
            created_at: Utc::now(),
            last_state_change_at: Utc::now(),
            config: InstanceConfig {
                rdp_password: Some("secret".to_string()),
            },
            seq: 0,
            teardown_requested: false,
            holds_ports: true,
        };
        let json = serde_json::to_string(&InstanceDetails::from(instance)).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("rdp://localhost:3390"));
    }

    #[test]
    fn create_request_defaults() {
        let req: CreateInstanceRequest =
            serde_json::from_str(r#"{"payload": "aGVsbG8="}"#).unwrap();
        assert!(req.mods.is_empty());
        assert!(req.config.rdp_password.is_none());
    }
}
