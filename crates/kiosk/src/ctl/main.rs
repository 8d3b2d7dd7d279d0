//! kioskctl - Control CLI for the kiosk orchestrator.
//!
//! Talks to a running kioskd over its HTTP API: create instances from a
//! payload file, inspect and list them, fetch container logs, delete them.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use base64::Engine;
use clap::{Parser, Subcommand};
use reqwest::StatusCode;

use kiosk::api::ErrorResponse;
use kiosk::instance::{
    CreateInstanceRequest, HealthResponse, InstanceConfig, InstanceDetails, LogsResponse,
};

const DEFAULT_SERVER_URL: &str = "http://localhost:7707";

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let client = KioskClient::new(&cli.server);

    match cli.command {
        Command::Status => handle_status(&client, cli.json).await,
        Command::Create {
            payload,
            mods,
            rdp_password,
        } => handle_create(&client, payload, mods, rdp_password, cli.json).await,
        Command::List => handle_list(&client, cli.json).await,
        Command::Get { id } => handle_get(&client, &id, cli.json).await,
        Command::Logs { id } => handle_logs(&client, &id, cli.json).await,
        Command::Delete { id } => handle_delete(&client, &id, cli.json).await,
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "kioskctl",
    author,
    version,
    about = "Control CLI for the kiosk orchestrator - create, inspect, and delete instances."
)]
struct Cli {
    /// Orchestrator server URL
    #[arg(long, short = 's', default_value = DEFAULT_SERVER_URL, env = "KIOSK_SERVER_URL")]
    server: String,

    /// Output machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check orchestrator and container runtime health
    Status,

    /// Create a new instance from a payload file
    Create {
        /// Path to the application payload file
        payload: PathBuf,
        /// Modification identifier to enable (repeatable)
        #[arg(long = "mod", value_name = "ID")]
        mods: Vec<String>,
        /// Remote-desktop access credential for the instance
        #[arg(long, value_name = "PASSWORD")]
        rdp_password: Option<String>,
    },

    /// List all instances
    List,

    /// Get instance details
    Get {
        /// Instance ID
        id: String,
    },

    /// Fetch an instance's container logs
    Logs {
        /// Instance ID
        id: String,
    },

    /// Delete an instance and its container
    Delete {
        /// Instance ID
        id: String,
    },
}

/// HTTP client for the orchestrator API.
struct KioskClient {
    base_url: String,
    client: reqwest::Client,
}

impl KioskClient {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .get(&url)
            .send()
            .await
            .context("sending request to server")
    }

    async fn post_json<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .context("sending request to server")
    }

    async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .delete(&url)
            .send()
            .await
            .context("sending request to server")
    }
}

impl KioskClient {
    /// Resolve a possibly-abbreviated instance id against the server's
    /// current instance list, so `kioskctl get ba4f` works the way
    /// `docker`-style tools do. An exact id always wins; otherwise a unique
    /// prefix resolves to the full id, and no match or an ambiguous prefix
    /// is an error naming the candidates.
    async fn resolve_id(&self, id: &str) -> Result<String> {
        let response = self.get("/api/instances").await?;
        if !response.status().is_success() {
            bail!(api_error(response).await);
        }
        let instances: Vec<InstanceDetails> = response
            .json()
            .await
            .context("parsing instance list")?;
        let ids: Vec<String> = instances.into_iter().map(|i| i.id).collect();
        match_id_prefix(&ids, id)
    }
}

fn match_id_prefix(ids: &[String], wanted: &str) -> Result<String> {
    if ids.iter().any(|id| id == wanted) {
        return Ok(wanted.to_string());
    }
    let matches: Vec<&String> = ids.iter().filter(|id| id.starts_with(wanted)).collect();
    match matches.as_slice() {
        [id] => Ok((*id).clone()),
        [] => bail!("no instance matches id '{wanted}'"),
        many => bail!(
            "id '{wanted}' is ambiguous, matches: {}",
            many.iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Turn a non-success response into a readable error, preferring the server's
/// structured body over the bare status line.
async fn api_error(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => anyhow::anyhow!("{} ({})", body.error, body.code),
        Err(_) => anyhow::anyhow!("server returned {status}"),
    }
}

async fn handle_status(client: &KioskClient, json: bool) -> Result<()> {
    let response = client.get("/health").await?;
    if !response.status().is_success() {
        bail!(api_error(response).await);
    }

    let body = response.text().await?;
    if json {
        println!("{body}");
        return Ok(());
    }

    let health: HealthResponse = serde_json::from_str(&body)?;
    println!("Server is running at {}", client.base_url);
    println!(
        "  Container runtime: {}",
        if health.runtime_reachable {
            "reachable"
        } else {
            "UNREACHABLE"
        }
    );
    println!("  Instances: {}", health.instances);
    Ok(())
}

async fn handle_create(
    client: &KioskClient,
    payload_path: PathBuf,
    mods: Vec<String>,
    rdp_password: Option<String>,
    json: bool,
) -> Result<()> {
    let payload = std::fs::read(&payload_path)
        .with_context(|| format!("reading payload file {}", payload_path.display()))?;

    let request = CreateInstanceRequest {
        payload: base64::engine::general_purpose::STANDARD.encode(payload),
        mods,
        config: InstanceConfig { rdp_password },
    };

    let response = client.post_json("/api/instances", &request).await?;
    if response.status() != StatusCode::CREATED {
        bail!(api_error(response).await);
    }

    let body = response.text().await?;
    if json {
        println!("{body}");
        return Ok(());
    }

    let instance: InstanceDetails = serde_json::from_str(&body)?;
    print_instance(&instance);
    Ok(())
}

async fn handle_list(client: &KioskClient, json: bool) -> Result<()> {
    let response = client.get("/api/instances").await?;
    if !response.status().is_success() {
        bail!(api_error(response).await);
    }

    let body = response.text().await?;
    if json {
        println!("{body}");
        return Ok(());
    }

    let instances: Vec<InstanceDetails> = serde_json::from_str(&body)?;
    if instances.is_empty() {
        println!("No instances.");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<8} {:<10} CREATED",
        "ID", "STATE", "RDP", "CONSOLE"
    );
    for instance in instances {
        println!(
            "{:<38} {:<10} {:<8} {:<10} {}",
            instance.id,
            instance.state,
            instance.rdp_port,
            instance.console_port,
            instance.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn handle_get(client: &KioskClient, id: &str, json: bool) -> Result<()> {
    let id = client.resolve_id(id).await?;
    let response = client.get(&format!("/api/instances/{id}")).await?;
    if !response.status().is_success() {
        bail!(api_error(response).await);
    }

    let body = response.text().await?;
    if json {
        println!("{body}");
        return Ok(());
    }

    let instance: InstanceDetails = serde_json::from_str(&body)?;
    print_instance(&instance);
    Ok(())
}

async fn handle_logs(client: &KioskClient, id: &str, json: bool) -> Result<()> {
    let id = client.resolve_id(id).await?;
    let response = client.get(&format!("/api/instances/{id}/logs")).await?;
    if !response.status().is_success() {
        bail!(api_error(response).await);
    }

    let body = response.text().await?;
    if json {
        println!("{body}");
        return Ok(());
    }

    let logs: LogsResponse = serde_json::from_str(&body)?;
    print!("{}", logs.logs);
    Ok(())
}

async fn handle_delete(client: &KioskClient, id: &str, json: bool) -> Result<()> {
    let id = client.resolve_id(id).await?;
    let response = client.delete(&format!("/api/instances/{id}")).await?;
    if !response.status().is_success() {
        bail!(api_error(response).await);
    }

    if json {
        println!(r#"{{"status": "deleted", "id": "{id}"}}"#);
    } else {
        println!("Instance {id} deleted");
    }
    Ok(())
}

fn print_instance(instance: &InstanceDetails) {
    println!("Instance: {}", instance.id);
    println!("  State: {}", instance.state);
    if let Some(message) = &instance.status_message {
        println!("  Message: {message}");
    }
    if let Some(container_ref) = &instance.container_ref {
        println!("  Container: {container_ref}");
    }
    println!("  RDP: {} ({})", instance.rdp_port, instance.rdp_url);
    println!("  Console: {}", instance.console_port);
    if !instance.mods.is_empty() {
        println!("  Mods: {}", instance.mods.join(", "));
    }
    println!("  Created: {}", instance.created_at.format("%Y-%m-%d %H:%M:%S"));
}
