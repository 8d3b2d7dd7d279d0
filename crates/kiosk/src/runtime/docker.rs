//! Docker-backed implementation of the control-plane boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::service::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, warn};

use super::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeResult, RuntimeState};

/// Port the remote-desktop server listens on inside the container.
const RDP_CONTAINER_PORT: &str = "3389/tcp";
/// Port the console service listens on inside the container.
const CONSOLE_CONTAINER_PORT: &str = "8080/tcp";

/// Docker control plane, speaking to the local daemon.
pub struct DockerRuntime {
    docker: Docker,
    log_tail_lines: u32,
    max_log_bytes: usize,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn connect(log_tail_lines: u32, max_log_bytes: usize) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker,
            log_tail_lines,
            max_log_bytes,
        })
    }
}

/// Map bollard failures onto the typed error set.
fn map_err(err: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error;

    match err {
        Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        Error::IOError { .. } | Error::HyperResponseError { .. } => {
            RuntimeError::Unavailable(err.to_string())
        }
        other => RuntimeError::Other(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(RDP_CONTAINER_PORT.to_string(), HashMap::new());
        exposed_ports.insert(CONSOLE_CONTAINER_PORT.to_string(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            RDP_CONTAINER_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.rdp_port.to_string()),
            }]),
        );
        port_bindings.insert(
            CONSOLE_CONTAINER_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.console_port.to_string()),
            }]),
        );

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let binds = spec.payload_path.as_ref().map(|path| {
            vec![format!(
                "{}:{}:ro",
                path.display(),
                ContainerSpec::PAYLOAD_MOUNT_POINT
            )]
        });

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds,
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(options, config)
            .await
            .map_err(map_err)?;

        debug!(container = %created.id, name = %spec.name, "created container");

        if let Err(err) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // A container that never started is useless to the instance;
            // remove it so the name and ports are not left occupied.
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            if let Err(rm_err) = self.docker.remove_container(&created.id, Some(options)).await {
                warn!(container = %created.id, error = %rm_err, "failed to remove unstartable container");
            }
            return Err(map_err(err));
        }

        Ok(created.id)
    }

    async fn inspect(&self, container_ref: &str) -> RuntimeResult<RuntimeState> {
        let response = match self
            .docker
            .inspect_container(container_ref, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return match map_err(err) {
                    RuntimeError::NotFound(_) => Ok(RuntimeState::Missing),
                    other => Err(other),
                };
            }
        };

        let running = response
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);

        if running {
            Ok(RuntimeState::Running)
        } else {
            Ok(RuntimeState::Exited)
        }
    }

    async fn logs(&self, container_ref: &str) -> RuntimeResult<Bytes> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: self.log_tail_lines.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_ref, Some(options));
        let mut output = BytesMut::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err)?;
            let message = match chunk {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => message,
                _ => continue,
            };

            // Bounded collection: stop reading once the ceiling is reached
            // rather than buffering an arbitrarily chatty container.
            let remaining = self.max_log_bytes.saturating_sub(output.len());
            if remaining == 0 {
                break;
            }
            let take = remaining.min(message.len());
            output.extend_from_slice(&message[..take]);
        }

        Ok(output.freeze())
    }

    async fn remove(&self, container_ref: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(container_ref, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone counts as removed.
            Err(err) => match map_err(err) {
                RuntimeError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.docker.ping().await.map_err(map_err)?;
        Ok(())
    }
}
