use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ResourceLimits, SecurityOptions};
use crate::error::Result;
use crate::types::{CommandIo, CommandOutput};

pub struct CloneRequest<'a> {
    pub url: &'a str,
    pub reference: Option<&'a str>,
    pub dest: &'a Path,
    pub timeout: Duration,
}

/// Fetches a shallow copy of a remote repository.
#[async_trait]
pub trait RepoCloner: Send + Sync {
    async fn clone_repo(&self, request: &CloneRequest<'_>) -> Result<CommandOutput>;
}

pub struct ImageBuild<'a> {
    pub tag: &'a str,
    pub dockerfile: &'a Path,
    pub context: &'a Path,
    pub timeout: Duration,
}

pub struct ContainerSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub limits: &'a ResourceLimits,
    pub security: &'a SecurityOptions,
    pub env_file: Option<&'a Path>,
    pub timeout: Duration,
}

/// Single-image builds and per-container operations.
///
/// Query methods return the raw text the engine prints; parsing lives with
/// the caller so it can be tested without an engine.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_image(&self, build: &ImageBuild<'_>, io: &CommandIo<'_>) -> Result<CommandOutput>;
    async fn run_container(&self, spec: &ContainerSpec<'_>, io: &CommandIo<'_>) -> Result<CommandOutput>;
    /// Published port table of one container (`80/tcp -> 0.0.0.0:32768` lines).
    async fn port_table(&self, container: &str) -> Result<String>;
    /// Container name without the leading `/`.
    async fn container_name(&self, container: &str) -> Result<String>;
    async fn update_limits(&self, container: &str, limits: &ResourceLimits) -> Result<CommandOutput>;
    /// One JSON line of point-in-time usage.
    async fn stats(&self, container: &str) -> Result<String>;
    /// Force-remove a container and its anonymous volumes. Never fails.
    async fn remove_container(&self, container: &str);
}

pub struct StackFile<'a> {
    pub project: &'a str,
    pub file: &'a Path,
    pub project_dir: &'a Path,
    pub env_file: Option<&'a Path>,
}

/// Multi-service stacks addressed by project name.
#[async_trait]
pub trait StackRunner: Send + Sync {
    async fn pull(&self, stack: &StackFile<'_>, timeout: Duration, io: &CommandIo<'_>) -> Result<CommandOutput>;
    async fn up(&self, stack: &StackFile<'_>, timeout: Duration, io: &CommandIo<'_>) -> Result<CommandOutput>;
    /// `state|health` per service, one per line.
    async fn service_states(&self, project: &str) -> Result<String>;
    /// `name|ports` per service as reported by the stack tool.
    async fn service_ports(&self, project: &str) -> Result<String>;
    /// `name|ports` per container carrying the project label.
    async fn labeled_ports(&self, project: &str) -> Result<String>;
    async fn container_ids(&self, project: &str) -> Result<Vec<String>>;
    /// Stop and remove the project's containers, networks and volumes. Never fails.
    async fn down(&self, project: &str);
}

/// Host firewall holes for published ports.
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn open(&self, port: u16, owner: &str) -> Result<()>;
    /// Remove a hole opened by `open`. Never fails.
    async fn close(&self, port: u16, owner: &str);
}
