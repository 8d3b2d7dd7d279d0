//! In-memory control plane for tests.
//!
//! Satisfies the same [`ContainerRuntime`] capability as the Docker
//! implementation, with knobs for failure injection, externally flipping a
//! container's state, and gating `create` so tests can stage races against
//! an in-flight creation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use super::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeResult, RuntimeState};

#[derive(Debug, Clone)]
struct FakeContainer {
    state: RuntimeState,
    logs: Bytes,
}

/// Test double for the container runtime.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicU64,
    create_failure: Mutex<Option<RuntimeError>>,
    offline: Mutex<bool>,
    create_gate: Option<Arc<Semaphore>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime whose `create` blocks until the returned semaphore receives
    /// a permit, letting tests hold an instance in `Creating` deliberately.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let runtime = Self {
            create_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (runtime, gate)
    }

    /// Make the next `create` call fail with `err`.
    pub fn fail_next_create(&self, err: RuntimeError) {
        *self.create_failure.lock().unwrap() = Some(err);
    }

    /// Make `ping` report the daemon as unreachable.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    /// Flip a container's observed state, e.g. to simulate an external exit.
    pub fn set_state(&self, container_ref: &str, state: RuntimeState) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(container_ref) {
            container.state = state;
        }
    }

    /// Seed log output for a container.
    pub fn push_logs(&self, container_ref: &str, logs: impl Into<Bytes>) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(container_ref) {
            container.logs = logs.into();
        }
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn contains(&self, container_ref: &str) -> bool {
        self.containers.lock().unwrap().contains_key(container_ref)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        if let Some(gate) = &self.create_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| RuntimeError::Unavailable("gate closed".into()))?;
            permit.forget();
        }

        if let Some(err) = self.create_failure.lock().unwrap().take() {
            return Err(err);
        }

        let id = format!("fake-{}-{}", spec.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                state: RuntimeState::Running,
                logs: Bytes::new(),
            },
        );
        Ok(id)
    }

    async fn inspect(&self, container_ref: &str) -> RuntimeResult<RuntimeState> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(container_ref)
            .map(|c| c.state)
            .unwrap_or(RuntimeState::Missing))
    }

    async fn logs(&self, container_ref: &str) -> RuntimeResult<Bytes> {
        self.containers
            .lock()
            .unwrap()
            .get(container_ref)
            .map(|c| c.logs.clone())
            .ok_or_else(|| RuntimeError::NotFound(container_ref.to_string()))
    }

    async fn remove(&self, container_ref: &str) -> RuntimeResult<()> {
        // Idempotent: removing an absent container succeeds.
        self.containers.lock().unwrap().remove(container_ref);
        Ok(())
    }

    async fn ping(&self) -> RuntimeResult<()> {
        if *self.offline.lock().unwrap() {
            return Err(RuntimeError::Unavailable("fake runtime offline".into()));
        }
        Ok(())
    }
}
