use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    CommandIo, CommandOutput, ContainerSpec, ImageBuild, ImageBuilder, ResourceLimits, Result,
    StackFile, StackRunner,
};

use crate::command::{Privilege, QUERY_TIMEOUT, RunOptions, exec_ignore_errors, exec_within, run};

/// Label the stack tool stamps on every container of a project.
const PROJECT_LABEL: &str = "com.docker.compose.project";

const PULL_ENV: [(&str, &str); 1] = [("COMPOSE_HTTP_TIMEOUT", "300")];
const UP_ENV: [(&str, &str); 1] = [("COMPOSE_HTTP_TIMEOUT", "600")];

/// Stopping a stack waits on every container's grace period.
const DOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// Container engine and stack tool driven through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn query(&self, args: &[&str]) -> Result<String> {
        exec_within(&self.binary, args, Privilege::User, QUERY_TIMEOUT).await
    }
}

/// Arguments for `docker run`: detached, all exposed ports published on
/// ephemeral host ports, no restart.
pub fn run_args(spec: &ContainerSpec<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["run", "-d", "-P", "--name", spec.name]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(spec.limits.resource_flags());
    args.extend(spec.security.flags(spec.limits.pids));
    args.push("--restart=no".to_string());
    if let Some(network) = spec.limits.network_mode.as_deref().filter(|n| !n.is_empty()) {
        args.push(format!("--network={network}"));
    }
    if let Some(env_file) = spec.env_file {
        args.push(format!("--env-file={}", env_file.display()));
    }
    args.push(spec.image.to_string());
    args
}

fn stack_args<'a>(stack: &'a StackFile<'_>, file: &'a str, env_file: Option<&'a str>) -> Vec<&'a str> {
    let mut args = vec!["compose", "-p", stack.project, "-f", file];
    if let Some(env_file) = env_file {
        args.extend(["--env-file", env_file]);
    }
    args
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build_image(&self, build: &ImageBuild<'_>, io: &CommandIo<'_>) -> Result<CommandOutput> {
        let dockerfile = build.dockerfile.to_string_lossy();
        let context = build.context.to_string_lossy();
        let args = ["build", "--no-cache", "-t", build.tag, "-f", &*dockerfile, &*context];
        let options = RunOptions::new(build.timeout).io(*io);
        Ok(run(&self.binary, &args, &options).await?)
    }

    async fn run_container(&self, spec: &ContainerSpec<'_>, io: &CommandIo<'_>) -> Result<CommandOutput> {
        let args = run_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let options = RunOptions::new(spec.timeout).io(*io);
        Ok(run(&self.binary, &args, &options).await?)
    }

    async fn port_table(&self, container: &str) -> Result<String> {
        self.query(&["port", container]).await
    }

    async fn container_name(&self, container: &str) -> Result<String> {
        let name = self
            .query(&["inspect", "--format", "{{.Name}}", container])
            .await?;
        Ok(name.trim_start_matches('/').to_string())
    }

    async fn update_limits(&self, container: &str, limits: &ResourceLimits) -> Result<CommandOutput> {
        let flags = limits.resource_flags();
        if flags.is_empty() {
            return Ok(CommandOutput::default());
        }
        let mut args = vec!["update"];
        args.extend(flags.iter().map(String::as_str));
        args.push(container);
        Ok(run(&self.binary, &args, &RunOptions::new(QUERY_TIMEOUT)).await?)
    }

    async fn stats(&self, container: &str) -> Result<String> {
        self.query(&["stats", "--no-stream", "--format", "{{json .}}", container])
            .await
    }

    async fn remove_container(&self, container: &str) {
        exec_ignore_errors(
            &self.binary,
            &["rm", "-fv", container],
            Privilege::User,
            QUERY_TIMEOUT,
        )
        .await;
    }
}

#[async_trait]
impl StackRunner for DockerCli {
    async fn pull(&self, stack: &StackFile<'_>, timeout: Duration, io: &CommandIo<'_>) -> Result<CommandOutput> {
        let file = stack.file.to_string_lossy();
        let env_file = stack.env_file.map(|p| p.to_string_lossy());
        let mut args = stack_args(stack, &file, env_file.as_deref());
        args.extend(["pull", "--quiet"]);
        let options = RunOptions::new(timeout)
            .current_dir(stack.project_dir)
            .envs(&PULL_ENV)
            .io(*io);
        Ok(run(&self.binary, &args, &options).await?)
    }

    async fn up(&self, stack: &StackFile<'_>, timeout: Duration, io: &CommandIo<'_>) -> Result<CommandOutput> {
        let file = stack.file.to_string_lossy();
        let env_file = stack.env_file.map(|p| p.to_string_lossy());
        let mut args = stack_args(stack, &file, env_file.as_deref());
        args.extend(["up", "-d", "--build", "--remove-orphans"]);
        let options = RunOptions::new(timeout)
            .current_dir(stack.project_dir)
            .envs(&UP_ENV)
            .io(*io);
        Ok(run(&self.binary, &args, &options).await?)
    }

    async fn service_states(&self, project: &str) -> Result<String> {
        self.query(&["compose", "-p", project, "ps", "--format", "{{.State}}|{{.Health}}"])
            .await
    }

    async fn service_ports(&self, project: &str) -> Result<String> {
        self.query(&["compose", "-p", project, "ps", "--format", "{{.Name}}|{{.Ports}}"])
            .await
    }

    async fn labeled_ports(&self, project: &str) -> Result<String> {
        let filter = format!("label={PROJECT_LABEL}={project}");
        self.query(&["ps", "--filter", &filter, "--format", "{{.Names}}|{{.Ports}}"])
            .await
    }

    async fn container_ids(&self, project: &str) -> Result<Vec<String>> {
        let out = self.query(&["compose", "-p", project, "ps", "-q"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn down(&self, project: &str) {
        exec_ignore_errors(
            &self.binary,
            &["compose", "-p", project, "down", "-v", "--remove-orphans"],
            Privilege::User,
            DOWN_TIMEOUT,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use sandbox::SecurityOptions;

    use super::*;

    #[test]
    fn run_args_carry_limits_security_and_env() {
        let limits = ResourceLimits::default();
        let security = SecurityOptions::default();
        let spec = ContainerSpec {
            name: "a1b2c3",
            image: "a1b2c3:latest",
            limits: &limits,
            security: &security,
            env_file: Some(Path::new("/b/a1b2c3/src/.env")),
            timeout: Duration::from_secs(60),
        };
        let args = run_args(&spec);
        assert_eq!(&args[..5], ["run", "-d", "-P", "--name", "a1b2c3"]);
        assert!(args.contains(&"--memory=1g".to_string()));
        assert!(args.contains(&"--memory-swap=1g".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"--restart=no".to_string()));
        assert!(args.contains(&"--env-file=/b/a1b2c3/src/.env".to_string()));
        assert_eq!(args.last().unwrap(), "a1b2c3:latest");
    }

    #[test]
    fn run_args_with_network_mode() {
        let limits = ResourceLimits {
            network_mode: Some("sandbox-net".into()),
            ..ResourceLimits::default()
        };
        let security = SecurityOptions::default();
        let spec = ContainerSpec {
            name: "x",
            image: "x:latest",
            limits: &limits,
            security: &security,
            env_file: None,
            timeout: Duration::from_secs(60),
        };
        let args = run_args(&spec);
        assert!(args.contains(&"--network=sandbox-net".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--env-file")));
    }

    #[test]
    fn stack_args_include_env_file_when_given() {
        let stack = StackFile {
            project: "p1",
            file: Path::new("/w/.sandbox-compose.yml"),
            project_dir: Path::new("/w"),
            env_file: None,
        };
        let args = stack_args(&stack, "/w/.sandbox-compose.yml", Some("/w/.env"));
        assert_eq!(
            args,
            ["compose", "-p", "p1", "-f", "/w/.sandbox-compose.yml", "--env-file", "/w/.env"]
        );
    }
}
