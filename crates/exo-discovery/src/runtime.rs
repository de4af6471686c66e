//! Container runtime: list running backends, launch a new one.

use std::{collections::HashMap, process::Stdio};

use async_trait::async_trait;
use exo_core::{
    Address,
    address::{DEFAULT_FALLBACK_PORT, DEFAULT_PRIMARY_PORT},
};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::{
    candidate::Candidate,
    command::{CommandError, RuntimeCommand},
};

/// Label marking a container as an exo backend.
pub const DEFAULT_LABEL: &str = "exo.backend=true";

/// Container runtime error.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Exited {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("Unexpected runtime output: {0}")]
    Parse(String),
}

/// Lists and launches backend containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running backend containers, mapped to candidates.
    async fn list(&self) -> Result<Vec<Candidate>, RuntimeError>;

    /// Launch a new backend. `Ok(None)` when launching is not configured.
    async fn launch(&self) -> Result<Option<Candidate>, RuntimeError>;
}

/// How to start a backend container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplate {
    pub image: String,
    pub name: Option<String>,
    /// Extra `run` arguments placed before the image.
    pub args: Vec<String>,
}

/// Settings for [`DockerCli`].
#[derive(Debug, Clone)]
pub struct DockerCliConfig {
    /// Base command, split with shell-word rules.
    pub command: String,
    /// `key=value` label filter.
    pub label: String,
    /// Host the published ports are reached on.
    pub host: String,
    /// Ports the backend listens on inside the container.
    pub primary_port: u16,
    pub fallback_port: u16,
    pub launch: Option<LaunchTemplate>,
}

impl Default for DockerCliConfig {
    fn default() -> Self {
        Self {
            command: "docker".to_string(),
            label: DEFAULT_LABEL.to_string(),
            host: "localhost".to_string(),
            primary_port: DEFAULT_PRIMARY_PORT,
            fallback_port: DEFAULT_FALLBACK_PORT,
            launch: None,
        }
    }
}

/// [`ContainerRuntime`] backed by the `docker` CLI (or anything
/// command-compatible, such as `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    config: DockerCliConfig,
    command: RuntimeCommand,
}

impl DockerCli {
    #[must_use]
    pub fn new(config: DockerCliConfig) -> Self {
        let command = RuntimeCommand::new(config.command.clone());
        Self { config, command }
    }

    fn ps_args(&self) -> Vec<String> {
        vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("label={}", self.config.label),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ]
    }

    fn run_args(&self, template: &LaunchTemplate) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        args.extend(["--label".to_string(), self.config.label.clone()]);
        // Let the runtime pick free host ports.
        for port in [self.config.primary_port, self.config.fallback_port] {
            args.extend(["-p".to_string(), port.to_string()]);
        }
        if let Some(ref name) = template.name {
            args.extend(["--name".to_string(), name.clone()]);
        }
        args.extend(template.args.iter().cloned());
        args.push(template.image.clone());
        args
    }

    async fn output(&self, args: Vec<String>) -> Result<String, RuntimeError> {
        let invocation = self.command.invocation(args)?;
        let program = invocation.program.clone();
        let (executable, args) = invocation.locate().await?;
        tracing::debug!(%program, ?args, "Running container runtime");

        let output = Command::new(executable)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RuntimeError::Exited {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|e| RuntimeError::Parse(e.to_string()))
    }

    /// Map `docker ps --format '{{json .}}'` output to candidates.
    ///
    /// Containers that do not publish both backend ports are skipped.
    pub(crate) fn parse_ps(&self, stdout: &str) -> Result<Vec<Candidate>, RuntimeError> {
        let mut candidates = Vec::new();
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let entry: PsEntry =
                serde_json::from_str(line).map_err(|e| RuntimeError::Parse(e.to_string()))?;
            let published = parse_ports(&entry.ports);
            let (Some(&primary), Some(&fallback)) = (
                published.get(&self.config.primary_port),
                published.get(&self.config.fallback_port),
            ) else {
                tracing::warn!(
                    candidate = %entry.id,
                    ports = %entry.ports,
                    "Skipping container without both backend ports published"
                );
                continue;
            };
            candidates.push(Candidate {
                display_name: entry
                    .names
                    .split(',')
                    .map(str::trim)
                    .find(|name| !name.is_empty())
                    .unwrap_or(&entry.id)
                    .to_string(),
                id: entry.id,
                address: Address::new(self.config.host.clone(), primary, fallback),
            });
        }
        Ok(candidates)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(DockerCliConfig::default())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list(&self) -> Result<Vec<Candidate>, RuntimeError> {
        let stdout = self.output(self.ps_args()).await?;
        self.parse_ps(&stdout)
    }

    async fn launch(&self) -> Result<Option<Candidate>, RuntimeError> {
        let Some(template) = self.config.launch.clone() else {
            return Ok(None);
        };
        tracing::info!(image = %template.image, "Launching backend container");
        let stdout = self.output(self.run_args(&template)).await?;
        let launched = stdout.trim().to_string();
        if launched.is_empty() {
            return Err(RuntimeError::Parse("run printed no container id".to_string()));
        }

        // `ps` prints short ids, `run` the full one.
        self.list()
            .await?
            .into_iter()
            .find(|c| launched.starts_with(&c.id))
            .map(Some)
            .ok_or_else(|| {
                RuntimeError::Parse(format!("launched container {launched} is not listed"))
            })
    }
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

/// Parse a `Ports` column into container port to host port.
///
/// `0.0.0.0:49153->8080/tcp, :::49153->8080/tcp, 8765/tcp`
fn parse_ports(ports: &str) -> HashMap<u16, u16> {
    let mut published = HashMap::new();
    for mapping in ports.split(',').map(str::trim) {
        let Some((host_side, container_side)) = mapping.split_once("->") else {
            continue;
        };
        let host_port = host_side
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok());
        let container_port = container_side
            .split('/')
            .next()
            .and_then(|port| port.parse::<u16>().ok());
        if let (Some(host), Some(container)) = (host_port, container_port) {
            published.entry(container).or_insert(host);
        }
    }
    published
}
