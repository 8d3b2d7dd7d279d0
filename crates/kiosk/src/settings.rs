//! Daemon configuration.
//!
//! Settings are layered: compiled defaults, then an optional TOML file, then
//! `KIOSK_`-prefixed environment variables (`KIOSK_INSTANCES__MAX_INSTANCES`
//! overrides `[instances] max_instances`). Validation runs once at startup so
//! a broken range or an empty image name fails fast instead of surfacing as a
//! runtime error on the first create.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Address the HTTP API binds to.
    pub listen_addr: SocketAddr,
    pub docker: DockerSettings,
    pub ports: PortSettings,
    pub instances: InstanceSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerSettings {
    /// Image every instance container runs.
    pub image: String,
    /// Container name prefix; the instance id is appended.
    pub container_prefix: String,
}

/// Inclusive host port ranges for the two per-instance bindings.
#[derive(Debug, Clone, Deserialize)]
pub struct PortSettings {
    pub rdp_start: u16,
    pub rdp_end: u16,
    pub console_start: u16,
    pub console_end: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSettings {
    /// Hard cap on concurrently tracked instances.
    pub max_instances: usize,
    /// Terminal instances older than this are reclaimed by the cleanup scan.
    pub auto_cleanup_hours: u64,
    /// Seconds between cleanup scans.
    pub cleanup_interval_secs: u64,
    /// Directory where decoded payloads are staged.
    pub data_dir: PathBuf,
    /// `docker logs --tail` value for the logs endpoint.
    pub log_tail_lines: u32,
    /// Byte ceiling on a single logs response.
    pub max_log_bytes: usize,
}

impl Settings {
    /// Load settings from defaults, an optional config file, and environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("listen_addr", "127.0.0.1:7707")?
            .set_default("docker.image", "kiosk-app:latest")?
            .set_default("docker.container_prefix", "kiosk-")?
            .set_default("ports.rdp_start", 3390)?
            .set_default("ports.rdp_end", 3419)?
            .set_default("ports.console_start", 8081)?
            .set_default("ports.console_end", 8110)?
            .set_default("instances.max_instances", 10)?
            .set_default("instances.auto_cleanup_hours", 24)?
            .set_default("instances.cleanup_interval_secs", 300)?
            .set_default("instances.data_dir", default_data_dir())?
            .set_default("instances.log_tail_lines", 500)?
            .set_default("instances.max_log_bytes", 1024 * 1024)?;

        if let Some(path) = config_path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix("KIOSK").separator("__"))
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.docker.image.trim().is_empty() {
            bail!("docker.image must not be empty");
        }
        if self.ports.rdp_start > self.ports.rdp_end {
            bail!(
                "ports.rdp_start ({}) must not exceed ports.rdp_end ({})",
                self.ports.rdp_start,
                self.ports.rdp_end
            );
        }
        if self.ports.console_start > self.ports.console_end {
            bail!(
                "ports.console_start ({}) must not exceed ports.console_end ({})",
                self.ports.console_start,
                self.ports.console_end
            );
        }
        if ranges_overlap(
            self.ports.rdp_start,
            self.ports.rdp_end,
            self.ports.console_start,
            self.ports.console_end,
        ) {
            bail!("the rdp and console port ranges must not overlap");
        }
        if self.instances.max_instances == 0 {
            bail!("instances.max_instances must be at least 1");
        }
        Ok(())
    }
}

fn ranges_overlap(a_start: u16, a_end: u16, b_start: u16, b_end: u16) -> bool {
    a_start <= b_end && b_start <= a_end
}

fn default_data_dir() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("kiosk")
        .join("payloads")
        .display()
        .to_string()
}
