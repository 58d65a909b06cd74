//! In-memory stand-ins for the engine, firewall and cloner.
//!
//! Every fake records the calls it receives so tests can assert on side
//! effects without a container engine, iptables or network access.

use std::collections::BTreeMap;
use std::os::unix::fs::symlink;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sandbox::{
    CloneRequest, CommandIo, CommandOutput, ContainerSpec, Firewall, ImageBuild, ImageBuilder,
    RepoCloner, ResourceLimits, Result, SandboxError, StackFile, StackRunner,
};
use serde_yaml_ng::Value;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ok_output(output: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        output: output.to_string(),
        timed_out: false,
    }
}

pub fn failed_output(exit_code: i32, output: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        output: output.to_string(),
        timed_out: false,
    }
}

pub fn timed_out_output() -> CommandOutput {
    CommandOutput {
        exit_code: crate::process::EXIT_CODE_TIMEOUT,
        output: "[TIMEOUT]".to_string(),
        timed_out: true,
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine fake serving both single-image and stack operations.
///
/// `up` reads the descriptor it is given and publishes every short-syntax
/// `host:container` entry, so port rewrites are observable end to end.
pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    pub build_result: Mutex<CommandOutput>,
    pub run_result: Mutex<CommandOutput>,
    pub pull_result: Mutex<CommandOutput>,
    pub up_result: Mutex<CommandOutput>,
    pub update_result: Mutex<CommandOutput>,
    pub port_table: Mutex<String>,
    pub states: Mutex<String>,
    /// Overrides the ports derived from the descriptor when set.
    pub service_ports: Mutex<Option<String>>,
    pub labeled_ports: Mutex<String>,
    /// Overrides the container ids derived from the descriptor when set.
    pub container_ids: Mutex<Option<Vec<String>>>,
    pub stats_line: Mutex<String>,
    published: Mutex<BTreeMap<String, String>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            build_result: Mutex::new(ok_output("built")),
            run_result: Mutex::new(ok_output("0123456789ab")),
            pull_result: Mutex::new(ok_output("")),
            up_result: Mutex::new(ok_output("")),
            update_result: Mutex::new(ok_output("")),
            port_table: Mutex::new("80/tcp -> 0.0.0.0:32801\n80/tcp -> [::]:32801\n".into()),
            states: Mutex::new("running|healthy\n".into()),
            service_ports: Mutex::new(None),
            labeled_ports: Mutex::new(String::new()),
            container_ids: Mutex::new(None),
            stats_line: Mutex::new(
                r#"{"Name":"web","CPUPerc":"0.50%","MemUsage":"1MiB / 1GiB","PIDs":"3"}"#.into(),
            ),
            published: Mutex::new(BTreeMap::new()),
        }
    }
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls whose first word is `op`.
    pub fn count(&self, op: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .count()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn publish_from(&self, file: &std::path::Path) {
        let Ok(text) = std::fs::read_to_string(file) else {
            return;
        };
        let Ok(doc) = serde_yaml_ng::from_str::<Value>(&text) else {
            return;
        };
        let Some(services) = doc.get("services").and_then(Value::as_mapping) else {
            return;
        };
        let mut published = lock(&self.published);
        for (name, service) in services {
            let name = name.as_str().unwrap_or_default().to_string();
            let ports = service
                .get("ports")
                .and_then(Value::as_sequence)
                .map(|seq| {
                    seq.iter()
                        .filter_map(Value::as_str)
                        .filter_map(|spec| spec.rsplit_once(':'))
                        .map(|(host, container)| {
                            let host = host.rsplit(':').next().unwrap_or(host);
                            format!("0.0.0.0:{host}->{container}/tcp")
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            published.insert(name, ports);
        }
    }
}

#[async_trait]
impl ImageBuilder for FakeEngine {
    async fn build_image(&self, build: &ImageBuild<'_>, io: &CommandIo<'_>) -> Result<CommandOutput> {
        self.record(format!("build {}", build.tag));
        io.beat();
        Ok(lock(&self.build_result).clone())
    }

    async fn run_container(&self, spec: &ContainerSpec<'_>, _io: &CommandIo<'_>) -> Result<CommandOutput> {
        self.record(format!("run {} {}", spec.name, spec.image));
        Ok(lock(&self.run_result).clone())
    }

    async fn port_table(&self, container: &str) -> Result<String> {
        self.record(format!("port {container}"));
        Ok(lock(&self.port_table).clone())
    }

    async fn container_name(&self, container: &str) -> Result<String> {
        Ok(format!("{container}-name"))
    }

    async fn update_limits(&self, container: &str, _limits: &ResourceLimits) -> Result<CommandOutput> {
        self.record(format!("update {container}"));
        Ok(lock(&self.update_result).clone())
    }

    async fn stats(&self, container: &str) -> Result<String> {
        self.record(format!("stats {container}"));
        Ok(lock(&self.stats_line).clone())
    }

    async fn remove_container(&self, container: &str) {
        self.record(format!("rm {container}"));
    }
}

#[async_trait]
impl StackRunner for FakeEngine {
    async fn pull(&self, stack: &StackFile<'_>, _timeout: std::time::Duration, _io: &CommandIo<'_>) -> Result<CommandOutput> {
        self.record(format!("pull {}", stack.project));
        Ok(lock(&self.pull_result).clone())
    }

    async fn up(&self, stack: &StackFile<'_>, _timeout: std::time::Duration, io: &CommandIo<'_>) -> Result<CommandOutput> {
        self.record(format!("up {} {}", stack.project, stack.file.display()));
        io.beat();
        let result = lock(&self.up_result).clone();
        if result.success() {
            self.publish_from(stack.file);
        }
        Ok(result)
    }

    async fn service_states(&self, project: &str) -> Result<String> {
        self.record(format!("states {project}"));
        Ok(lock(&self.states).clone())
    }

    async fn service_ports(&self, project: &str) -> Result<String> {
        self.record(format!("ps-ports {project}"));
        if let Some(text) = lock(&self.service_ports).clone() {
            return Ok(text);
        }
        Ok(lock(&self.published)
            .iter()
            .map(|(name, ports)| format!("{project}-{name}-1|{ports}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn labeled_ports(&self, project: &str) -> Result<String> {
        self.record(format!("labeled-ports {project}"));
        Ok(lock(&self.labeled_ports).clone())
    }

    async fn container_ids(&self, project: &str) -> Result<Vec<String>> {
        if let Some(ids) = lock(&self.container_ids).clone() {
            return Ok(ids);
        }
        Ok(lock(&self.published)
            .keys()
            .map(|name| format!("{project}-{name}-id"))
            .collect())
    }

    async fn down(&self, project: &str) {
        self.record(format!("down {project}"));
    }
}

// ---------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeFirewall {
    opened: Mutex<Vec<(u16, String)>>,
    closed: Mutex<Vec<(u16, String)>>,
    /// `open` fails for this port.
    pub fail_on: Mutex<Option<u16>>,
}

impl FakeFirewall {
    pub fn opened(&self) -> Vec<(u16, String)> {
        lock(&self.opened).clone()
    }

    pub fn closed(&self) -> Vec<(u16, String)> {
        lock(&self.closed).clone()
    }

    /// Ports opened and not yet closed.
    pub fn open_ports(&self) -> Vec<u16> {
        let mut open: Vec<u16> = lock(&self.opened).iter().map(|(p, _)| *p).collect();
        for (port, _) in lock(&self.closed).iter() {
            if let Some(pos) = open.iter().position(|p| p == port) {
                open.remove(pos);
            }
        }
        open
    }
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn open(&self, port: u16, owner: &str) -> Result<()> {
        if *lock(&self.fail_on) == Some(port) {
            return Err(SandboxError::Internal(format!("iptables refused port {port}")));
        }
        lock(&self.opened).push((port, owner.to_string()));
        Ok(())
    }

    async fn close(&self, port: u16, owner: &str) {
        lock(&self.closed).push((port, owner.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Cloner
// ---------------------------------------------------------------------------

/// Materializes a fixed tree at the clone destination.
#[derive(Default)]
pub struct FakeCloner {
    pub files: Vec<(String, Vec<u8>)>,
    pub symlinks: Vec<(String, String)>,
    pub result: Option<CommandOutput>,
    calls: AtomicUsize,
}

impl FakeCloner {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoCloner for FakeCloner {
    async fn clone_repo(&self, request: &CloneRequest<'_>) -> Result<CommandOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = &self.result
            && !result.success()
        {
            return Ok(result.clone());
        }
        std::fs::create_dir_all(request.dest.join(".git"))?;
        for (path, content) in &self.files {
            let target = request.dest.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        for (link, target) in &self.symlinks {
            symlink(target, request.dest.join(link))?;
        }
        Ok(ok_output("Cloning into 'src'...\n"))
    }
}
