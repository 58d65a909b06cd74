//! Build, start, expose and tear down the containers of one sandbox.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sandbox::{
    ArtifactKind, BuildArtifact, BuildOutcome, CommandIo, ContainerSpec, Firewall, ImageBuild,
    ImageBuilder, PortMapping, ResourceLimits, RunMode, SandboxError, SecurityOptions, StackFile,
    StackRunner,
};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::compose;
use crate::log::SandboxLog;
use crate::ports::{PortAllocator, PortRange, collect_ports, compose_strategies, parse_port_table};
use crate::stats::{ContainerStats, parse_stats};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// What to do when stack services are not ready by the readiness deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessPolicy {
    /// Log a warning and carry on with port discovery.
    #[default]
    Proceed,
    /// Tear the stack down and fail the build.
    Fail,
}

#[derive(Debug, Clone)]
pub struct RuntimeTimeouts {
    pub build: Duration,
    pub compose_pull: Duration,
    pub compose_up: Duration,
    pub run: Duration,
    pub readiness: Duration,
    /// Delay between readiness polls.
    pub poll_interval: Duration,
    /// Pause after start before port discovery.
    pub settle: Duration,
}

impl Default for RuntimeTimeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(600),
            compose_pull: Duration::from_secs(300),
            compose_up: Duration::from_secs(600),
            run: Duration::from_secs(60),
            readiness: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            settle: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeSettings {
    pub limits: ResourceLimits,
    pub security: SecurityOptions,
    pub port_range: PortRange,
    pub timeouts: RuntimeTimeouts,
    pub readiness: ReadinessPolicy,
}

/// Per-build inputs shared by every step.
pub struct SandboxContext<'a> {
    /// Sandbox id; also the container name, image name and stack project.
    pub id: &'a str,
    /// Env file in the cloned tree. May not exist.
    pub env_file: &'a Path,
    pub log: &'a SandboxLog,
    pub heartbeat: Option<&'a (dyn Fn() + Send + Sync)>,
}

impl SandboxContext<'_> {
    fn io(&self) -> CommandIo<'_> {
        CommandIo::new(self.log.path(), self.heartbeat)
    }

    fn beat(&self) {
        if let Some(heartbeat) = self.heartbeat {
            heartbeat();
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct ContainerRuntime {
    images: Arc<dyn ImageBuilder>,
    stacks: Arc<dyn StackRunner>,
    firewall: Arc<dyn Firewall>,
    allocator: PortAllocator,
    settings: RuntimeSettings,
}

impl ContainerRuntime {
    pub fn new(
        images: Arc<dyn ImageBuilder>,
        stacks: Arc<dyn StackRunner>,
        firewall: Arc<dyn Firewall>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            images,
            stacks,
            firewall,
            allocator: PortAllocator::new(settings.port_range),
            settings,
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Build and start `artifact`, pin resource limits and open the firewall
    /// for every published host port.
    ///
    /// Containers that were started are removed again when a later step fails.
    pub async fn build_and_run(
        &self,
        ctx: &SandboxContext<'_>,
        artifact: &BuildArtifact,
    ) -> sandbox::Result<BuildOutcome> {
        let mode = RunMode::from(artifact.kind);
        ctx.log.line(format!("Starting build ({})", artifact.kind)).await;

        let (ports, container_ids) = match artifact.kind {
            ArtifactKind::Compose => self.start_stack(ctx, artifact).await?,
            ArtifactKind::Dockerfile => self.start_image(ctx, artifact).await?,
        };

        if container_ids.is_empty() {
            ctx.log.line("ERROR: No containers started").await;
            self.stop_containers(ctx.id, mode).await;
            return Err(SandboxError::RuntimeFailure("No containers started".into()));
        }
        ctx.log
            .line(format!("Started {} container(s)", container_ids.len()))
            .await;

        self.apply_limits(ctx, &container_ids).await;

        if let Err(e) = self.open_ports(ctx.id, &ports).await {
            warn!(sandbox_id = ctx.id, error = %e, "firewall open failed, rolling back");
            ctx.log.line("ERROR: Failed to expose published ports").await;
            self.stop_containers(ctx.id, mode).await;
            return Err(SandboxError::RuntimeFailure(
                "Failed to expose published ports".into(),
            ));
        }
        for port in &ports {
            ctx.log
                .line(format!(
                    "Port {} -> {}:{}",
                    port.host_port, port.service, port.container_port
                ))
                .await;
        }

        info!(sandbox_id = ctx.id, ?mode, ports = ports.len(), "sandbox running");
        Ok(BuildOutcome {
            mode,
            ports,
            container_ids,
        })
    }

    /// Remove containers and close firewall holes. Never fails.
    pub async fn teardown(&self, sandbox_id: &str, mode: RunMode, ports: &[PortMapping]) {
        self.stop_containers(sandbox_id, mode).await;
        self.close_ports(sandbox_id, ports).await;
    }

    pub async fn stop_containers(&self, sandbox_id: &str, mode: RunMode) {
        debug!(sandbox_id, ?mode, "stopping containers");
        match mode {
            RunMode::Compose => self.stacks.down(sandbox_id).await,
            RunMode::Single => self.images.remove_container(sandbox_id).await,
        }
    }

    pub async fn close_ports(&self, owner: &str, ports: &[PortMapping]) {
        for port in unique_host_ports(ports) {
            self.firewall.close(port, owner).await;
        }
    }

    /// Usage of each container; containers that do not answer are skipped.
    pub async fn stats(&self, container_ids: &[String]) -> Vec<ContainerStats> {
        let mut stats = Vec::new();
        for id in container_ids {
            match self.images.stats(id).await {
                Ok(text) => stats.extend(text.lines().filter_map(parse_stats)),
                Err(e) => debug!(container = %id, error = %e, "stats unavailable"),
            }
        }
        stats
    }

    // -- single image --

    async fn start_image(
        &self,
        ctx: &SandboxContext<'_>,
        artifact: &BuildArtifact,
    ) -> sandbox::Result<(Vec<PortMapping>, Vec<String>)> {
        let timeouts = &self.settings.timeouts;
        let tag = format!("{}:latest", ctx.id.to_ascii_lowercase());

        ctx.log.line("Building image...").await;
        let build = ImageBuild {
            tag: &tag,
            dockerfile: &artifact.path,
            context: artifact.context_dir(),
            timeout: timeouts.build,
        };
        let out = self.images.build_image(&build, &ctx.io()).await?;
        if out.timed_out {
            ctx.log.line("ERROR: Image build timed out").await;
            return Err(SandboxError::Timeout {
                command: "image build".into(),
                seconds: timeouts.build.as_secs(),
            });
        }
        if !out.success() {
            ctx.log
                .line(format!("ERROR: Image build failed with exit code {}", out.exit_code))
                .await;
            return Err(SandboxError::BuildFailure(
                "Docker build failed. Check logs for details.".into(),
            ));
        }

        ctx.log.line("Starting container...").await;
        ctx.beat();
        let env_file = ctx.env_file.is_file().then_some(ctx.env_file);
        let spec = ContainerSpec {
            name: ctx.id,
            image: &tag,
            limits: &self.settings.limits,
            security: &self.settings.security,
            env_file,
            timeout: timeouts.run,
        };
        let out = self.images.run_container(&spec, &ctx.io()).await?;
        if !out.success() {
            ctx.log
                .line(format!("ERROR: Container start failed with exit code {}", out.exit_code))
                .await;
            self.images.remove_container(ctx.id).await;
            return Err(SandboxError::RuntimeFailure(
                "Failed to start container. Check logs for details.".into(),
            ));
        }

        tokio::time::sleep(timeouts.settle).await;
        let ports = match self.images.port_table(ctx.id).await {
            Ok(table) => parse_port_table(ctx.id, &table),
            Err(e) => {
                warn!(sandbox_id = ctx.id, error = %e, "port table unavailable");
                Vec::new()
            }
        };
        Ok((ports, vec![ctx.id.to_string()]))
    }

    // -- stack --

    async fn start_stack(
        &self,
        ctx: &SandboxContext<'_>,
        artifact: &BuildArtifact,
    ) -> sandbox::Result<(Vec<PortMapping>, Vec<String>)> {
        let timeouts = &self.settings.timeouts;

        ctx.log.line("Preparing compose file...").await;
        let prepared =
            compose::prepare(&artifact.path, ctx.env_file, &self.allocator, &self.settings.limits)
                .await?;
        for moved in prepared.reassigned() {
            ctx.log
                .line(format!(
                    "Port {} of {} unavailable, using {} ({})",
                    moved.requested,
                    moved.service,
                    moved.host_port,
                    moved.env_key()
                ))
                .await;
        }

        let env_file = ctx.env_file.is_file().then_some(ctx.env_file);
        let stack = StackFile {
            project: ctx.id,
            file: &prepared.file,
            project_dir: artifact.context_dir(),
            env_file,
        };

        ctx.log.line("Pulling images...").await;
        let pull = self.stacks.pull(&stack, timeouts.compose_pull, &ctx.io()).await?;
        if pull.timed_out {
            ctx.log.line("Warning: image pull timed out, building anyway").await;
        } else if !pull.success() {
            ctx.log
                .line(format!("Warning: image pull exited with {}", pull.exit_code))
                .await;
        }

        ctx.log.line("Building and starting services...").await;
        let up = self.stacks.up(&stack, timeouts.compose_up, &ctx.io()).await?;
        if up.timed_out {
            ctx.log.line("ERROR: Stack start timed out").await;
            self.stacks.down(ctx.id).await;
            return Err(SandboxError::Timeout {
                command: "stack start".into(),
                seconds: timeouts.compose_up.as_secs(),
            });
        }
        if !up.success() {
            ctx.log
                .line(format!("ERROR: Stack start failed with exit code {}", up.exit_code))
                .await;
            self.stacks.down(ctx.id).await;
            return Err(SandboxError::BuildFailure(
                "Compose stack failed to start. Check logs for details.".into(),
            ));
        }

        if !self.wait_for_services(ctx).await {
            match self.settings.readiness {
                ReadinessPolicy::Proceed => {
                    ctx.log
                        .line("Warning: services not ready in time, continuing")
                        .await;
                }
                ReadinessPolicy::Fail => {
                    ctx.log.line("ERROR: services not ready in time").await;
                    self.stacks.down(ctx.id).await;
                    return Err(SandboxError::RuntimeFailure(
                        "Services did not become ready in time".into(),
                    ));
                }
            }
        }

        tokio::time::sleep(timeouts.settle).await;
        let strategies = compose_strategies(&self.stacks, &self.images);
        let ports = match collect_ports(&strategies, ctx.id).await {
            Some((ports, strategy)) => {
                ctx.log
                    .line(format!("Found {} published port(s) via {strategy}", ports.len()))
                    .await;
                ports
            }
            None => {
                ctx.log.line("No published ports found").await;
                Vec::new()
            }
        };

        let container_ids = match self.stacks.container_ids(ctx.id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(sandbox_id = ctx.id, error = %e, "container listing failed");
                Vec::new()
            }
        };
        Ok((ports, container_ids))
    }

    /// Poll service states until every service is running and not unhealthy.
    async fn wait_for_services(&self, ctx: &SandboxContext<'_>) -> bool {
        let timeouts = &self.settings.timeouts;
        let deadline = Instant::now() + timeouts.readiness;
        ctx.log.line("Waiting for services...").await;
        loop {
            if let Ok(states) = self.stacks.service_states(ctx.id).await
                && services_ready(&states)
            {
                ctx.log.line("All services running").await;
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            ctx.beat();
            tokio::time::sleep(timeouts.poll_interval).await;
        }
    }

    async fn apply_limits(&self, ctx: &SandboxContext<'_>, container_ids: &[String]) {
        for id in container_ids {
            match self.images.update_limits(id, &self.settings.limits).await {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    ctx.log
                        .line(format!("Warning: could not apply limits to {id} (exit {})", out.exit_code))
                        .await;
                }
                Err(e) => warn!(container = %id, error = %e, "limit update failed"),
            }
        }
    }

    /// Open every unique host port; on failure the ports opened so far are closed.
    async fn open_ports(&self, owner: &str, ports: &[PortMapping]) -> sandbox::Result<()> {
        let mut opened = Vec::new();
        for port in unique_host_ports(ports) {
            if let Err(e) = self.firewall.open(port, owner).await {
                for done in opened {
                    self.firewall.close(done, owner).await;
                }
                return Err(e);
            }
            opened.push(port);
        }
        Ok(())
    }
}

fn unique_host_ports(ports: &[PortMapping]) -> BTreeSet<u16> {
    ports.iter().map(|p| p.host_port).collect()
}

/// Every `state|health` line reports running, and no service is unhealthy.
/// An empty listing is not ready.
pub fn services_ready(states: &str) -> bool {
    let mut any = false;
    for line in states.lines().map(str::trim).filter(|l| !l.is_empty()) {
        any = true;
        let (state, health) = line.split_once('|').unwrap_or((line, ""));
        if !state.trim().eq_ignore_ascii_case("running")
            || health.trim().eq_ignore_ascii_case("unhealthy")
        {
            return false;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::{FakeEngine, FakeFirewall, failed_output, timed_out_output};

    struct Harness {
        dir: tempfile::TempDir,
        env: std::path::PathBuf,
        engine: Arc<FakeEngine>,
        firewall: Arc<FakeFirewall>,
        runtime: ContainerRuntime,
        log: SandboxLog,
    }

    fn harness(readiness: ReadinessPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let firewall = Arc::new(FakeFirewall::default());
        let settings = RuntimeSettings {
            port_range: PortRange { min: 43000, max: 43999 },
            timeouts: RuntimeTimeouts {
                readiness: Duration::ZERO,
                poll_interval: Duration::ZERO,
                settle: Duration::ZERO,
                ..RuntimeTimeouts::default()
            },
            readiness,
            ..RuntimeSettings::default()
        };
        let runtime = ContainerRuntime::new(engine.clone(), engine.clone(), firewall.clone(), settings);
        let log = SandboxLog::new(dir.path().join("exec.log"));
        Harness {
            env: dir.path().join(".env"),
            dir,
            engine,
            firewall,
            runtime,
            log,
        }
    }

    impl Harness {
        fn ctx(&self) -> SandboxContext<'_> {
            SandboxContext {
                id: "sbx0000000000001",
                env_file: &self.env,
                log: &self.log,
                heartbeat: None,
            }
        }

        fn write(&self, name: &str, content: &str) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn log_text(&self) -> String {
            std::fs::read_to_string(self.log.path()).unwrap_or_default()
        }
    }

    #[test]
    fn readiness_requires_running_and_not_unhealthy() {
        assert!(services_ready("running|healthy\nrunning|\n"));
        assert!(services_ready("running|starting"));
        assert!(!services_ready("running|unhealthy"));
        assert!(!services_ready("running|healthy\nexited|"));
        assert!(!services_ready(""));
    }

    #[tokio::test]
    async fn dockerfile_build_publishes_and_opens_ports() {
        let h = harness(ReadinessPolicy::Proceed);
        let dockerfile = h.write("Dockerfile", "FROM alpine:3.20\nEXPOSE 80\n");
        let outcome = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::dockerfile(dockerfile))
            .await
            .unwrap();

        assert_eq!(outcome.mode, RunMode::Single);
        assert_eq!(outcome.ports, vec![PortMapping::new("sbx0000000000001", 32801, 80)]);
        assert_eq!(outcome.container_ids, vec!["sbx0000000000001"]);
        assert_eq!(h.firewall.open_ports(), vec![32801]);
        assert_eq!(h.engine.count("update"), 1);
        assert!(h.log_text().contains("Port 32801 -> sbx0000000000001:80"));
    }

    #[tokio::test]
    async fn failed_image_build_is_a_build_failure() {
        let h = harness(ReadinessPolicy::Proceed);
        *h.engine.build_result.lock().unwrap() = failed_output(1, "step 3 failed");
        let dockerfile = h.write("Dockerfile", "FROM alpine\n");
        let err = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::dockerfile(dockerfile))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BuildFailure(_)));
        assert_eq!(h.engine.count("run"), 0);
        assert!(h.firewall.opened().is_empty());
    }

    #[tokio::test]
    async fn build_timeout_surfaces_as_timeout() {
        let h = harness(ReadinessPolicy::Proceed);
        *h.engine.build_result.lock().unwrap() = timed_out_output();
        let dockerfile = h.write("Dockerfile", "FROM alpine\n");
        let err = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::dockerfile(dockerfile))
            .await
            .unwrap_err();
        assert!(err.is_build_failure());
        assert!(matches!(err, SandboxError::Timeout { seconds: 600, .. }));
    }

    #[tokio::test]
    async fn container_start_failure_removes_container() {
        let h = harness(ReadinessPolicy::Proceed);
        *h.engine.run_result.lock().unwrap() = failed_output(125, "port is already allocated");
        let dockerfile = h.write("Dockerfile", "FROM alpine\n");
        let err = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::dockerfile(dockerfile))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::RuntimeFailure(_)));
        assert!(!err.user_message().contains("allocated"));
        assert_eq!(h.engine.count("rm"), 1);
    }

    #[tokio::test]
    async fn compose_port_outside_range_is_moved_and_exposed() {
        let h = harness(ReadinessPolicy::Proceed);
        let descriptor = h.write(
            "docker-compose.yml",
            "services:\n  db:\n    image: postgres:16\n    ports:\n      - \"5432:5432\"\n",
        );
        let outcome = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::compose(descriptor))
            .await
            .unwrap();

        assert_eq!(outcome.mode, RunMode::Compose);
        assert_eq!(outcome.ports.len(), 1);
        let port = &outcome.ports[0];
        assert_ne!(port.host_port, 5432);
        assert!((43000..=43999).contains(&port.host_port));
        assert_eq!(port.container_port, 5432);
        assert_eq!(h.firewall.open_ports(), vec![port.host_port]);
        assert_eq!(outcome.container_ids, vec!["sbx0000000000001-db-id"]);

        let env = std::fs::read_to_string(&h.env).unwrap();
        assert_eq!(env, format!("DB_PORT={}\n", port.host_port));
        assert_eq!(h.engine.count("pull"), 1);
        assert_eq!(h.engine.count("up"), 1);
    }

    #[tokio::test]
    async fn compose_falls_back_to_labeled_listing() {
        let h = harness(ReadinessPolicy::Proceed);
        *h.engine.service_ports.lock().unwrap() = Some("web|".into());
        *h.engine.labeled_ports.lock().unwrap() = "web-1|0.0.0.0:43100->80/tcp".into();
        let descriptor = h.write("compose.yml", "services:\n  web:\n    image: nginx\n    ports: [\"80\"]\n");
        let outcome = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::compose(descriptor))
            .await
            .unwrap();
        assert_eq!(outcome.ports, vec![PortMapping::new("web-1", 43100, 80)]);
        assert!(h.log_text().contains("via labeled container listing"));
    }

    #[tokio::test]
    async fn compose_without_containers_fails() {
        let h = harness(ReadinessPolicy::Proceed);
        *h.engine.container_ids.lock().unwrap() = Some(Vec::new());
        let descriptor = h.write("compose.yml", "services:\n  web:\n    image: nginx\n");
        let err = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::compose(descriptor))
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "No containers started");
        assert_eq!(h.engine.count("down"), 1);
    }

    #[tokio::test]
    async fn unready_stack_proceeds_by_default() {
        let h = harness(ReadinessPolicy::Proceed);
        *h.engine.states.lock().unwrap() = "restarting|\n".into();
        let descriptor = h.write("compose.yml", "services:\n  web:\n    image: nginx\n");
        h.runtime
            .build_and_run(&h.ctx(), &BuildArtifact::compose(descriptor))
            .await
            .unwrap();
        assert!(h.log_text().contains("services not ready in time, continuing"));
    }

    #[tokio::test]
    async fn unready_stack_fails_under_strict_policy() {
        let h = harness(ReadinessPolicy::Fail);
        *h.engine.states.lock().unwrap() = "running|unhealthy\n".into();
        let descriptor = h.write("compose.yml", "services:\n  web:\n    image: nginx\n");
        let err = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::compose(descriptor))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::RuntimeFailure(_)));
        assert_eq!(h.engine.count("down"), 1);
    }

    #[tokio::test]
    async fn firewall_failure_rolls_back() {
        let h = harness(ReadinessPolicy::Proceed);
        *h.engine.port_table.lock().unwrap() = "80/tcp -> 0.0.0.0:32801\n443/tcp -> 0.0.0.0:32802\n".into();
        *h.firewall.fail_on.lock().unwrap() = Some(32802);
        let dockerfile = h.write("Dockerfile", "FROM alpine\n");
        let err = h
            .runtime
            .build_and_run(&h.ctx(), &BuildArtifact::dockerfile(dockerfile))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::RuntimeFailure(_)));
        assert!(h.firewall.open_ports().is_empty());
        assert_eq!(h.engine.count("rm"), 1);
    }

    #[tokio::test]
    async fn heartbeat_reaches_backend() {
        let h = harness(ReadinessPolicy::Proceed);
        let beats = AtomicUsize::new(0);
        let beat = || {
            beats.fetch_add(1, Ordering::SeqCst);
        };
        let ctx = SandboxContext {
            heartbeat: Some(&beat),
            ..h.ctx()
        };
        let dockerfile = h.write("Dockerfile", "FROM alpine\n");
        h.runtime
            .build_and_run(&ctx, &BuildArtifact::dockerfile(dockerfile))
            .await
            .unwrap();
        assert!(beats.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn teardown_stops_by_mode_and_closes_ports() {
        let h = harness(ReadinessPolicy::Proceed);
        let ports = vec![PortMapping::new("web", 43001, 80), PortMapping::new("web", 43001, 80)];
        h.runtime.teardown("abc", RunMode::Compose, &ports).await;
        h.runtime.teardown("def", RunMode::Single, &[]).await;
        assert_eq!(h.engine.calls(), vec!["down abc", "rm def"]);
        assert_eq!(h.firewall.closed(), vec![(43001, "abc".to_string())]);
    }

    #[tokio::test]
    async fn stats_are_parsed() {
        let h = harness(ReadinessPolicy::Proceed);
        let stats = h.runtime.stats(&["web".to_string()]).await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].pids, 3);
    }
}
