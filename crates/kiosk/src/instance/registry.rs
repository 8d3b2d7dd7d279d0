//! Authoritative in-process store of instance records.
//!
//! The registry is the only component that writes `state`, `container_ref`,
//! `status_message`, or `last_state_change_at`; everything else reads records
//! through it and requests transitions via its methods. That keeps the state
//! machine invariants in one place:
//!
//! - `Creating -> Running -> Stopped`, `Error` from `Creating`/`Running` only
//! - `container_ref` is set at most once
//! - no instance re-enters `Creating`
//! - deletion is the only exit from the registry

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::ports::PortPair;

use super::models::{Instance, InstanceConfig, InstanceState};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("invalid transition {from} -> {to} for instance {id}")]
    InvalidTransition {
        id: String,
        from: InstanceState,
        to: InstanceState,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

struct Inner {
    instances: HashMap<String, Instance>,
    next_seq: u64,
}

/// Lock-guarded instance store.
///
/// The lock brackets only bookkeeping; container runtime calls never run
/// under it.
pub struct InstanceRegistry {
    inner: RwLock<Inner>,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                instances: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.instances.len()
    }

    /// Insert a fresh record in `Creating`, owning `ports`.
    pub async fn insert_creating(
        &self,
        id: String,
        ports: PortPair,
        mods: Vec<String>,
        config: InstanceConfig,
    ) -> Instance {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let instance = Instance {
            id: id.clone(),
            state: InstanceState::Creating,
            status_message: None,
            container_ref: None,
            ports,
            mods,
            created_at: now,
            last_state_change_at: now,
            config,
            seq: inner.next_seq,
            teardown_requested: false,
            holds_ports: true,
        };
        inner.next_seq += 1;
        inner.instances.insert(id, instance.clone());
        instance
    }

    pub async fn get(&self, id: &str) -> Option<Instance> {
        self.inner.read().await.instances.get(id).cloned()
    }

    /// All records in creation order.
    pub async fn list(&self) -> Vec<Instance> {
        let inner = self.inner.read().await;
        let mut instances: Vec<Instance> = inner.instances.values().cloned().collect();
        instances.sort_by_key(|instance| instance.seq);
        instances
    }

    /// `Creating -> Running`, recording the container reference.
    ///
    /// Returns the updated record, including the teardown mark a concurrent
    /// delete may have set while the create was in flight.
    pub async fn mark_running(&self, id: &str, container_ref: String) -> RegistryResult<Instance> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if instance.state != InstanceState::Creating || instance.container_ref.is_some() {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: instance.state,
                to: InstanceState::Running,
            });
        }

        instance.container_ref = Some(container_ref);
        instance.state = InstanceState::Running;
        instance.last_state_change_at = Utc::now();
        Ok(instance.clone())
    }

    /// `Creating/Running -> Error`, recording the diagnostic message.
    pub async fn mark_error(&self, id: &str, message: &str) -> RegistryResult<Instance> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if instance.state.is_terminal() {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: instance.state,
                to: InstanceState::Error,
            });
        }

        instance.state = InstanceState::Error;
        instance.status_message = Some(message.to_string());
        instance.last_state_change_at = Utc::now();
        Ok(instance.clone())
    }

    /// `Running -> Stopped`, from reconciliation observing an exited or
    /// missing container. Already-terminal records are returned unchanged so
    /// racing reconciliations stay idempotent.
    pub async fn mark_stopped(&self, id: &str) -> RegistryResult<Instance> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        match instance.state {
            InstanceState::Running => {
                instance.state = InstanceState::Stopped;
                instance.last_state_change_at = Utc::now();
                Ok(instance.clone())
            }
            InstanceState::Stopped | InstanceState::Error => Ok(instance.clone()),
            InstanceState::Creating => Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: instance.state,
                to: InstanceState::Stopped,
            }),
        }
    }

    /// Ask a `Creating` instance to tear itself down once its create settles.
    ///
    /// Returns `true` when the mark was set (record still in `Creating`),
    /// `false` when the record has already settled and the caller should
    /// delete it directly.
    pub async fn request_teardown(&self, id: &str) -> RegistryResult<bool> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if instance.state == InstanceState::Creating {
            instance.teardown_requested = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Atomically take the port hold off a record, returning the pair when
    /// this call was the one that cleared it. The caller releases the pair to
    /// the allocator afterwards; the hold flag guarantees exactly one
    /// release per pair even when deletes race the create path.
    pub async fn clear_port_hold(&self, id: &str) -> Option<PortPair> {
        let mut inner = self.inner.write().await;
        let instance = inner.instances.get_mut(id)?;
        if !instance.holds_ports {
            return None;
        }
        instance.holds_ports = false;
        Some(instance.ports)
    }

    /// Remove a record. Returns it so the caller can release held resources.
    pub async fn remove(&self, id: &str) -> Option<Instance> {
        self.inner.write().await.instances.remove(id)
    }

    /// Test helper: age a record so cleanup eligibility can be asserted
    /// without waiting.
    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: &str, when: DateTime<Utc>) {
        if let Some(instance) = self.inner.write().await.instances.get_mut(id) {
            instance.last_state_change_at = when;
        }
    }
}
