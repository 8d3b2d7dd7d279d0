//! Instance orchestrator: composes the port allocator, the registry, and the
//! container control plane into the operations the API layer exposes.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::payload;
use crate::ports::{ExhaustedRange, PortAllocator};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeState};

use super::models::{CreateInstanceRequest, HealthResponse, Instance, InstanceState};
use super::registry::{InstanceRegistry, RegistryError};

/// Environment variable carrying the remote-desktop access credential.
const ENV_RDP_PASSWORD: &str = "KIOSK_RDP_PASSWORD";
/// Environment variable carrying the comma-separated mods list.
const ENV_MODS: &str = "KIOSK_MODS";

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("maximum number of instances reached ({0})")]
    CapacityExceeded(usize),

    #[error(transparent)]
    PortsExhausted(#[from] ExhaustedRange),

    #[error("invalid create request: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type InstanceResult<T> = Result<T, InstanceError>;

impl From<RegistryError> for InstanceError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => InstanceError::NotFound(id),
            other => InstanceError::Internal(other.to_string()),
        }
    }
}

/// Orchestrator configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Container image every instance runs.
    pub image: String,
    /// Prefix for container names (`<prefix><instance id>`).
    pub container_prefix: String,
    /// Hard cap on concurrently tracked instances.
    pub max_instances: usize,
    /// Directory for staged payload files.
    pub data_dir: PathBuf,
}

/// The orchestrator facade.
///
/// Registry and allocator locks bracket bookkeeping only; container runtime
/// calls always run outside them.
pub struct InstanceService {
    registry: InstanceRegistry,
    allocator: PortAllocator,
    runtime: Arc<dyn ContainerRuntime>,
    config: ServiceConfig,
    /// Serializes the capacity check + port reservation + record insert of
    /// concurrent creates so `max_instances` is never overshot.
    create_gate: Mutex<()>,
}

impl InstanceService {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        allocator: PortAllocator,
        config: ServiceConfig,
    ) -> Self {
        Self {
            registry: InstanceRegistry::new(),
            allocator,
            runtime,
            config,
            create_gate: Mutex::new(()),
        }
    }

    /// Create an instance: reserve ports, insert a `Creating` record, drive
    /// the container runtime, settle into `Running` or `Error`.
    ///
    /// A capacity or allocation failure returns an error without touching the
    /// control plane and without leaving a registry record. A control-plane
    /// failure settles the record into `Error` with its ports released and
    /// returns that record, so callers observe the failed instance instead of
    /// a bare error.
    pub async fn create(&self, request: CreateInstanceRequest) -> InstanceResult<Instance> {
        for mod_id in &request.mods {
            if !is_valid_mod_id(mod_id) {
                return Err(InstanceError::InvalidConfig(format!(
                    "invalid mod identifier: {mod_id:?}"
                )));
            }
        }
        let payload_bytes = payload::decode(&request.payload)
            .map_err(|e| InstanceError::InvalidConfig(e.to_string()))?;

        let id = Uuid::new_v4().to_string();

        // Admission: capacity check, port reservation and record insert are
        // serialized so concurrent creates cannot overshoot max_instances or
        // race each other for the same pair.
        let instance = {
            let _admission = self.create_gate.lock().await;
            let current = self.registry.count().await;
            if current >= self.config.max_instances {
                return Err(InstanceError::CapacityExceeded(self.config.max_instances));
            }
            let ports = self.allocator.allocate_pair()?;
            self.registry
                .insert_creating(id.clone(), ports, request.mods.clone(), request.config.clone())
                .await
        };

        info!(
            instance = %id,
            rdp_port = instance.ports.rdp,
            console_port = instance.ports.console,
            "creating instance"
        );

        let payload_path = match payload::write(&self.config.data_dir, &id, &payload_bytes) {
            Ok(path) => path,
            Err(err) => {
                warn!(instance = %id, error = %err, "failed to stage payload");
                return self.fail_create(&id, &format!("staging payload: {err}")).await;
            }
        };

        let mut spec = ContainerSpec::new(
            format!("{}{}", self.config.container_prefix, id),
            self.config.image.clone(),
        )
        .ports(instance.ports.rdp, instance.ports.console)
        .payload(payload_path);

        if let Some(password) = &instance.config.rdp_password {
            spec = spec.env(ENV_RDP_PASSWORD, password);
        }
        if !instance.mods.is_empty() {
            spec = spec.env(ENV_MODS, instance.mods.join(","));
        }

        match self.runtime.create(&spec).await {
            Ok(container_ref) => {
                match self.registry.mark_running(&id, container_ref.clone()).await {
                    Ok(settled) => {
                        info!(instance = %id, container = %container_ref, "instance running");
                        if settled.teardown_requested {
                            info!(instance = %id, "delete arrived during create, tearing down");
                            self.teardown(&settled).await;
                        }
                        Ok(settled)
                    }
                    Err(err) => {
                        // The record vanished or refused the transition; the
                        // container must not be left orphaned.
                        warn!(instance = %id, error = %err, "could not record running container");
                        if let Err(rm_err) = self.runtime.remove(&container_ref).await {
                            warn!(container = %container_ref, error = %rm_err, "orphan container removal failed");
                        }
                        if let Some(pair) = self.registry.clear_port_hold(&id).await {
                            self.allocator.release_pair(pair);
                        }
                        self.registry.remove(&id).await;
                        payload::remove(&self.config.data_dir, &id);
                        Err(err.into())
                    }
                }
            }
            Err(err) => {
                warn!(instance = %id, error = %err, "container creation failed");
                self.fail_create(&id, &err.to_string()).await
            }
        }
    }

    /// Settle a failed create into `Error`: ports are released first so they
    /// are never held by an instance that cannot reach `Running`.
    async fn fail_create(&self, id: &str, message: &str) -> InstanceResult<Instance> {
        if let Some(pair) = self.registry.clear_port_hold(id).await {
            self.allocator.release_pair(pair);
        }
        payload::remove(&self.config.data_dir, id);

        let settled = self.registry.mark_error(id, message).await?;
        if settled.teardown_requested {
            info!(instance = %id, "delete arrived during failed create, dropping record");
            self.registry.remove(id).await;
        }
        Ok(settled)
    }

    /// Full teardown of a settled instance that was marked for deletion while
    /// its create was in flight.
    async fn teardown(&self, instance: &Instance) {
        if let Some(container_ref) = &instance.container_ref {
            if let Err(err) = self.runtime.remove(container_ref).await {
                warn!(container = %container_ref, error = %err, "container removal during teardown failed");
            }
        }
        if let Some(pair) = self.registry.clear_port_hold(&instance.id).await {
            self.allocator.release_pair(pair);
        }
        self.registry.remove(&instance.id).await;
        payload::remove(&self.config.data_dir, &instance.id);
    }

    /// Fetch one instance, reconciled against the runtime's view.
    pub async fn get(&self, id: &str) -> InstanceResult<Instance> {
        let instance = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;
        Ok(self.reconcile(instance).await)
    }

    /// All instances in creation order, each reconciled.
    pub async fn list(&self) -> Vec<Instance> {
        let mut reconciled = Vec::new();
        for instance in self.registry.list().await {
            reconciled.push(self.reconcile(instance).await);
        }
        reconciled
    }

    /// Read-path reconciliation: detect `Running -> Stopped` drift with a
    /// single inspect. On inspection failure the cached view is returned;
    /// staleness is bounded by the next read or the cleanup scan.
    async fn reconcile(&self, instance: Instance) -> Instance {
        if instance.state != InstanceState::Running {
            return instance;
        }
        let Some(container_ref) = instance.container_ref.clone() else {
            return instance;
        };

        match self.runtime.inspect(&container_ref).await {
            Ok(RuntimeState::Running) => instance,
            Ok(RuntimeState::Exited) | Ok(RuntimeState::Missing) => {
                debug!(instance = %instance.id, "container no longer running, reconciling to stopped");
                match self.registry.mark_stopped(&instance.id).await {
                    Ok(updated) => updated,
                    // Lost a race with a delete; whatever view remains wins.
                    Err(_) => self.registry.get(&instance.id).await.unwrap_or(instance),
                }
            }
            Err(err) => {
                warn!(instance = %instance.id, error = %err, "inspect failed, returning cached state");
                instance
            }
        }
    }

    /// Current log output for an instance's container.
    ///
    /// An instance whose container does not exist (yet, or anymore) yields an
    /// empty stream rather than an error.
    pub async fn logs(&self, id: &str) -> InstanceResult<Bytes> {
        let instance = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;

        let Some(container_ref) = instance.container_ref else {
            return Ok(Bytes::new());
        };

        match self.runtime.logs(&container_ref).await {
            Ok(logs) => Ok(logs),
            Err(RuntimeError::NotFound(_)) => Ok(Bytes::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete an instance: remove its container, release its ports, drop the
    /// record. Unknown (and already-deleted) ids report `NotFound`.
    ///
    /// An instance still in `Creating` is marked for teardown instead; the
    /// in-flight create performs the removal once the runtime call settles.
    pub async fn delete(&self, id: &str) -> InstanceResult<()> {
        if self.registry.request_teardown(id).await? {
            info!(instance = %id, "instance still creating, marked for teardown");
            return Ok(());
        }

        let instance = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;

        // Runtime call first, outside any lock. remove() is idempotent, so a
        // container another path already removed is not an error; any other
        // failure keeps the record so the delete can be retried.
        if let Some(container_ref) = &instance.container_ref {
            self.runtime.remove(container_ref).await?;
        }

        let removed = self
            .registry
            .remove(id)
            .await
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;
        if removed.holds_ports {
            self.allocator.release_pair(removed.ports);
        }
        payload::remove(&self.config.data_dir, id);

        info!(instance = %id, "instance deleted");
        Ok(())
    }

    /// Orchestrator liveness plus runtime reachability.
    pub async fn health(&self) -> HealthResponse {
        let runtime_reachable = self.runtime.ping().await.is_ok();
        HealthResponse {
            status: "ok".to_string(),
            runtime_reachable,
            instances: self.registry.count().await,
        }
    }

    /// Delete terminal instances whose last state change is older than
    /// `max_age`. Running instances are never touched regardless of age. A
    /// failure for one instance is logged and does not stop the scan; a
    /// racing client delete surfacing as `NotFound` is benign.
    ///
    /// The scan reads the reconciled view, so an instance whose container
    /// exited externally and was never read by a client still drifts to
    /// `Stopped` here and becomes eligible one staleness period later. The
    /// scheduler is the polling path; no client read is required for an
    /// abandoned instance to be reclaimed.
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let candidates: Vec<Instance> = self
            .list()
            .await
            .into_iter()
            .filter(|i| i.state.is_terminal() && i.last_state_change_at < cutoff)
            .collect();

        let mut deleted = 0;
        for instance in candidates {
            match self.delete(&instance.id).await {
                Ok(()) => {
                    info!(instance = %instance.id, state = %instance.state, "cleaned up stale instance");
                    deleted += 1;
                }
                Err(InstanceError::NotFound(_)) => {}
                Err(err) => {
                    warn!(instance = %instance.id, error = %err, "cleanup failed, continuing");
                }
            }
        }
        deleted
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }
}

/// Mod identifiers travel into container environment variables; restrict them
/// to a safe character set.
fn is_valid_mod_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;
    use base64::Engine;

    fn encoded_payload() -> String {
        base64::engine::general_purpose::STANDARD.encode(b"application bits")
    }

    fn request() -> CreateInstanceRequest {
        CreateInstanceRequest {
            payload: encoded_payload(),
            mods: Vec::new(),
            config: Default::default(),
        }
    }

    struct Harness {
        service: Arc<InstanceService>,
        runtime: Arc<FakeRuntime>,
        _data_dir: tempfile::TempDir,
    }

    fn harness(max_instances: usize) -> Harness {
        harness_with_runtime(max_instances, FakeRuntime::new())
    }

    fn harness_with_runtime(max_instances: usize, runtime: FakeRuntime) -> Harness {
        let runtime = Arc::new(runtime);
        let data_dir = tempfile::tempdir().unwrap();
        let service = Arc::new(InstanceService::new(
            runtime.clone(),
            PortAllocator::new(3390, 3394, 8081, 8085),
            ServiceConfig {
                image: "kiosk-app:latest".to_string(),
                container_prefix: "kiosk-".to_string(),
                max_instances,
                data_dir: data_dir.path().to_path_buf(),
            },
        ));
        Harness {
            service,
            runtime,
            _data_dir: data_dir,
        }
    }

    #[tokio::test]
    async fn create_reaches_running() {
        let h = harness(4);
        let instance = h.service.create(request()).await.unwrap();

        assert_eq!(instance.state, InstanceState::Running);
        assert!(instance.container_ref.is_some());
        assert_eq!(instance.ports.rdp, 3390);
        assert_eq!(instance.ports.console, 8081);
        assert_eq!(h.runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn failed_create_settles_into_error_and_releases_ports() {
        let h = harness(4);
        h.runtime
            .fail_next_create(RuntimeError::Unavailable("daemon down".into()));

        let failed = h.service.create(request()).await.unwrap();
        assert_eq!(failed.state, InstanceState::Error);
        assert!(failed.status_message.as_deref().unwrap().contains("daemon down"));
        assert_eq!(h.runtime.container_count(), 0);

        // The failed instance is observable, and its ports are reusable.
        assert_eq!(h.service.get(&failed.id).await.unwrap().state, InstanceState::Error);
        let next = h.service.create(request()).await.unwrap();
        assert_eq!(next.ports, failed.ports);
    }

    #[tokio::test]
    async fn capacity_is_enforced_before_any_allocation() {
        let h = harness(2);
        h.service.create(request()).await.unwrap();
        h.service.create(request()).await.unwrap();

        let err = h.service.create(request()).await.unwrap_err();
        assert!(matches!(err, InstanceError::CapacityExceeded(2)));
        assert_eq!(h.service.list().await.len(), 2);
        assert_eq!(h.runtime.container_count(), 2);
    }

    #[tokio::test]
    async fn port_exhaustion_leaves_no_record() {
        let runtime = Arc::new(FakeRuntime::new());
        let data_dir = tempfile::tempdir().unwrap();
        let service = InstanceService::new(
            runtime,
            PortAllocator::new(3390, 3390, 8081, 8081),
            ServiceConfig {
                image: "kiosk-app:latest".to_string(),
                container_prefix: "kiosk-".to_string(),
                max_instances: 10,
                data_dir: data_dir.path().to_path_buf(),
            },
        );

        service.create(request()).await.unwrap();
        let err = service.create(request()).await.unwrap_err();
        assert!(matches!(err, InstanceError::PortsExhausted(_)));
        assert_eq!(service.list().await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_upfront() {
        let h = harness(4);
        let err = h
            .service
            .create(CreateInstanceRequest {
                payload: "!!!not base64!!!".to_string(),
                mods: Vec::new(),
                config: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidConfig(_)));
        assert!(h.service.list().await.is_empty());
        assert_eq!(h.runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn invalid_mod_identifier_is_rejected() {
        let h = harness(4);
        let err = h
            .service
            .create(CreateInstanceRequest {
                payload: encoded_payload(),
                mods: vec!["ok-mod".to_string(), "bad mod;rm".to_string()],
                config: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn delete_removes_container_and_frees_ports() {
        let h = harness(4);
        let instance = h.service.create(request()).await.unwrap();
        let container_ref = instance.container_ref.clone().unwrap();

        h.service.delete(&instance.id).await.unwrap();
        assert!(!h.runtime.contains(&container_ref));
        assert!(matches!(
            h.service.get(&instance.id).await,
            Err(InstanceError::NotFound(_))
        ));

        // Freed pair comes back on the next allocation.
        let next = h.service.create(request()).await.unwrap();
        assert_eq!(next.ports, instance.ports);
    }

    #[tokio::test]
    async fn delete_unknown_id_is_not_found() {
        let h = harness(4);
        assert!(matches!(
            h.service.delete("does-not-exist").await,
            Err(InstanceError::NotFound(_))
        ));

        let instance = h.service.create(request()).await.unwrap();
        h.service.delete(&instance.id).await.unwrap();
        assert!(matches!(
            h.service.delete(&instance.id).await,
            Err(InstanceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_reconciles_externally_exited_containers() {
        let h = harness(4);
        let instance = h.service.create(request()).await.unwrap();
        h.runtime
            .set_state(instance.container_ref.as_deref().unwrap(), RuntimeState::Exited);

        // list() alone must surface the drift, no explicit get required.
        let listed = h.service.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn list_is_in_creation_order() {
        let h = harness(4);
        let a = h.service.create(request()).await.unwrap();
        let b = h.service.create(request()).await.unwrap();
        let c = h.service.create(request()).await.unwrap();

        let ids: Vec<String> = h.service.list().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn logs_are_empty_not_an_error_for_silent_containers() {
        let h = harness(4);
        let instance = h.service.create(request()).await.unwrap();

        assert!(h.service.logs(&instance.id).await.unwrap().is_empty());

        h.runtime
            .push_logs(instance.container_ref.as_deref().unwrap(), &b"boot ok\n"[..]);
        assert_eq!(h.service.logs(&instance.id).await.unwrap(), &b"boot ok\n"[..]);

        assert!(matches!(
            h.service.logs("unknown").await,
            Err(InstanceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_reclaims_only_stale_terminal_instances() {
        let h = harness(4);
        let stopped = h.service.create(request()).await.unwrap();
        let running = h.service.create(request()).await.unwrap();

        h.runtime
            .set_state(stopped.container_ref.as_deref().unwrap(), RuntimeState::Exited);
        // Reconcile the exit into the registry.
        assert_eq!(
            h.service.get(&stopped.id).await.unwrap().state,
            InstanceState::Stopped
        );

        // Age both records beyond the threshold.
        let old = Utc::now() - Duration::hours(48);
        h.service.registry().backdate(&stopped.id, old).await;
        h.service.registry().backdate(&running.id, old).await;

        let deleted = h.service.cleanup_stale(Duration::hours(24)).await;
        assert_eq!(deleted, 1);
        assert!(matches!(
            h.service.get(&stopped.id).await,
            Err(InstanceError::NotFound(_))
        ));
        assert_eq!(
            h.service.get(&running.id).await.unwrap().state,
            InstanceState::Running
        );
    }

    #[tokio::test]
    async fn cleanup_reclaims_exited_instances_no_client_ever_read() {
        let h = harness(4);
        let instance = h.service.create(request()).await.unwrap();

        // The container dies behind the orchestrator's back; no get or list
        // happens in between, so the registry still says Running.
        h.runtime
            .set_state(instance.container_ref.as_deref().unwrap(), RuntimeState::Exited);
        h.service
            .registry()
            .backdate(&instance.id, Utc::now() - Duration::hours(48))
            .await;

        // The first scan observes the exit itself: the record drifts to
        // Stopped with a fresh timestamp, so it is not yet stale.
        assert_eq!(h.service.cleanup_stale(Duration::hours(24)).await, 0);
        assert_eq!(
            h.service.registry().get(&instance.id).await.unwrap().state,
            InstanceState::Stopped
        );

        // Once the stop itself has aged out, the next scan reclaims it.
        h.service
            .registry()
            .backdate(&instance.id, Utc::now() - Duration::hours(48))
            .await;
        assert_eq!(h.service.cleanup_stale(Duration::hours(24)).await, 1);
        assert!(matches!(
            h.service.get(&instance.id).await,
            Err(InstanceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fresh_terminal_instances_survive_cleanup() {
        let h = harness(4);
        let instance = h.service.create(request()).await.unwrap();
        h.runtime
            .set_state(instance.container_ref.as_deref().unwrap(), RuntimeState::Exited);
        h.service.get(&instance.id).await.unwrap();

        assert_eq!(h.service.cleanup_stale(Duration::hours(24)).await, 0);
        assert!(h.service.get(&instance.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_during_create_tears_down_on_settle() {
        let (runtime, gate) = FakeRuntime::gated();
        let h = harness_with_runtime(4, runtime);

        let service = h.service.clone();
        let create_task =
            tokio::spawn(async move { service.create(request()).await });

        // Wait for the record to appear in Creating.
        let id = loop {
            if let Some(instance) = h.service.list().await.into_iter().next() {
                assert_eq!(instance.state, InstanceState::Creating);
                break instance.id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        // Delete while the create is parked inside the runtime call.
        h.service.delete(&id).await.unwrap();

        // Let the create settle; it must observe the mark and tear down.
        gate.add_permits(1);
        let settled = create_task.await.unwrap().unwrap();
        assert_eq!(settled.state, InstanceState::Running);

        assert!(matches!(
            h.service.get(&id).await,
            Err(InstanceError::NotFound(_))
        ));
        assert_eq!(h.runtime.container_count(), 0);

        // Ports went back to the pool.
        gate.add_permits(1);
        let next = h.service.create(request()).await.unwrap();
        assert_eq!(next.ports, settled.ports);
    }

    #[tokio::test]
    async fn health_reports_runtime_reachability() {
        let h = harness(4);
        h.service.create(request()).await.unwrap();

        let healthy = h.service.health().await;
        assert!(healthy.runtime_reachable);
        assert_eq!(healthy.instances, 1);

        h.runtime.set_offline(true);
        assert!(!h.service.health().await.runtime_reachable);
    }
}
