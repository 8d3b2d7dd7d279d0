//! Container control-plane boundary.
//!
//! The orchestrator drives containers exclusively through the
//! [`ContainerRuntime`] trait: create, inspect, fetch logs, remove, plus a
//! liveness probe for the health endpoint. Implementations map their own
//! failures onto the small [`RuntimeError`] set and never retry; retry policy
//! belongs to the caller.

mod docker;
mod fake;

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Typed control-plane failures.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The runtime daemon cannot be reached.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// The referenced container does not exist.
    #[error("container not found: {0}")]
    NotFound(String),

    /// The runtime refused the operation because of a conflicting resource
    /// (e.g. a name or port already in use).
    #[error("container conflict: {0}")]
    Conflict(String),

    /// Anything else the runtime reported.
    #[error("container runtime error: {0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// The runtime's own view of a container, used to reconcile registry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Exited,
    Missing,
}

/// Everything needed to launch one instance container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name (prefix + instance id).
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Host port bound to the container's remote-desktop port.
    pub rdp_port: u16,
    /// Host port bound to the container's console port.
    pub console_port: u16,
    /// Environment variables (access credential, mods list).
    pub env: HashMap<String, String>,
    /// Decoded application payload on the host, mounted read-only into the
    /// container at [`ContainerSpec::PAYLOAD_MOUNT_POINT`].
    pub payload_path: Option<PathBuf>,
}

impl ContainerSpec {
    /// Where the payload file appears inside the container.
    pub const PAYLOAD_MOUNT_POINT: &'static str = "/opt/kiosk/payload.bin";

    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            rdp_port: 0,
            console_port: 0,
            env: HashMap::new(),
            payload_path: None,
        }
    }

    /// Bind the instance's host port pair.
    pub fn ports(mut self, rdp_port: u16, console_port: u16) -> Self {
        self.rdp_port = rdp_port;
        self.console_port = console_port;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Mount the decoded payload file.
    pub fn payload(mut self, host_path: PathBuf) -> Self {
        self.payload_path = Some(host_path);
        self
    }
}

/// Capability boundary over the container runtime.
///
/// Implementations are pure passthrough with typed error mapping and keep no
/// instance state of their own.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning an opaque reference to it.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Report the runtime's current view of a container.
    ///
    /// A missing container is a valid observation (`RuntimeState::Missing`),
    /// not an error: reconciliation needs to distinguish "gone" from "could
    /// not ask".
    async fn inspect(&self, container_ref: &str) -> RuntimeResult<RuntimeState>;

    /// Fetch current log output, truncated to the implementation's configured
    /// ceiling.
    async fn logs(&self, container_ref: &str) -> RuntimeResult<Bytes>;

    /// Stop and delete a container. Removing an already-absent container is
    /// not an error.
    async fn remove(&self, container_ref: &str) -> RuntimeResult<()>;

    /// Cheap reachability probe for the health endpoint.
    async fn ping(&self) -> RuntimeResult<()>;
}
