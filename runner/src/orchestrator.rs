//! Sandbox lifecycle: admit, clone, build, expose, and tear down.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use sandbox::{BuildOutcome, Firewall, PortMapping, SandboxError};
use sandbox_host::{
    ContainerRuntime, ContainerStats, DockerCli, GitCloner, IptablesFirewall, NoFirewall,
    SandboxContext, SandboxLog,
};
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::env::{prepare_env_file, validate_env};
use crate::error::{RunnerError, RunnerResult};
use crate::logtail::{self, Tail};
use crate::meta::RunMeta;
use crate::paths::{self, BuildPaths};
use crate::ratelimit::RateLimiter;
use crate::repo::{RepoPolicy, RepositoryAcquirer, sanitize_ref, validate_repo_url};
use crate::schedule::{TeardownEntry, TeardownScheduler};
use crate::session::SessionQuota;
use crate::store::FileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Created,
    Cloning,
    Locating,
    Building,
    Running,
    Stopped,
    Expired,
    Failed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Cloning => "cloning",
            Self::Locating => "locating",
            Self::Building => "building",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Expired => "expired",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Receives state transitions of one build, e.g. to relay them to a client.
pub trait ProgressSink: Send + Sync {
    fn stage(&self, status: SandboxStatus, message: &str);

    /// Called periodically while a long command runs.
    fn heartbeat(&self) {}
}

#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub repo_url: String,
    pub reference: Option<String>,
    /// Raw `.env` content that replaces any repository template.
    pub env: Option<String>,
    pub session_id: String,
    pub client_ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub sandbox_id: String,
    pub ports: Vec<PortMapping>,
    pub container_ids: Vec<String>,
    /// Seconds until automatic teardown.
    pub ttl: u64,
}

/// In-flight view of one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub id: String,
    pub session_id: String,
    pub work_dir: PathBuf,
    pub reference: Option<String>,
    pub created: i64,
    pub ttl: u64,
    pub status: SandboxStatus,
}

impl SandboxRecord {
    fn advance(&mut self, status: SandboxStatus, message: &str, progress: Option<&dyn ProgressSink>) {
        debug!(sandbox_id = %self.id, from = %self.status, to = %status, "sandbox status");
        self.status = status;
        if let Some(progress) = progress {
            progress.stage(status, message);
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub teardowns_fired: usize,
    pub sandboxes_removed: usize,
    pub flags_pruned: usize,
    pub rate_files_removed: usize,
}

/// Everything the orchestrator drives, wired by the caller.
pub struct OrchestratorParts {
    pub paths: BuildPaths,
    pub acquirer: RepositoryAcquirer,
    pub runtime: ContainerRuntime,
    pub limiter: RateLimiter,
    pub quota: SessionQuota,
    pub scheduler: TeardownScheduler,
    pub container_ttl: Duration,
}

struct Inner {
    parts: OrchestratorParts,
    timers: Mutex<HashMap<String, AbortHandle>>,
}

#[derive(Clone)]
pub struct SandboxOrchestrator {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Run filesystem-locking work off the async runtime.
async fn blocking<T, F>(f: F) -> RunnerResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RunnerError::Internal(format!("blocking task: {e}")))
}

impl SandboxOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                parts,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Production wiring: git, the docker CLI, iptables and file-backed counters.
    pub fn from_config(config: &RunnerConfig) -> RunnerResult<Self> {
        let paths = BuildPaths::new(&config.build_root);
        std::fs::create_dir_all(paths.root())?;

        let docker = Arc::new(DockerCli::default());
        let firewall: Arc<dyn Firewall> = if config.firewall.enabled {
            Arc::new(IptablesFirewall::new(
                config.firewall.chain.clone(),
                config.firewall.privilege(),
            ))
        } else {
            Arc::new(NoFirewall)
        };
        let runtime = ContainerRuntime::new(
            docker.clone(),
            docker,
            firewall,
            config.runtime_settings(),
        );
        let acquirer = RepositoryAcquirer::new(Arc::new(GitCloner), RepoPolicy::from_config(config)?);
        let store = FileStore::new(config.rate_limit_dir())?;
        let limiter = RateLimiter::new(Arc::new(store), config.rate_limit.clone());
        let quota = SessionQuota::new(
            paths.sessions(),
            config.max_per_session,
            config.container_ttl() * 2,
        );
        let scheduler = TeardownScheduler::new(paths.schedule());

        Ok(Self::new(OrchestratorParts {
            paths,
            acquirer,
            runtime,
            limiter,
            quota,
            scheduler,
            container_ttl: config.container_ttl(),
        }))
    }

    fn parts(&self) -> &OrchestratorParts {
        &self.inner.parts
    }

    pub fn paths(&self) -> &BuildPaths {
        &self.parts().paths
    }

    // -- create --

    /// Validate, admit and provision a sandbox for `request.repo_url`.
    ///
    /// On failure the session slot is released and the sandbox directory is
    /// left for the sweep so its log stays readable.
    pub async fn create_and_run(
        &self,
        request: &BuildRequest,
        progress: Option<&dyn ProgressSink>,
    ) -> RunnerResult<BuildResult> {
        let (reference, session_id) = self.validate(request)?;

        let limiter = self.parts().limiter.clone();
        let (ip, session) = (request.client_ip.clone(), session_id.clone());
        let violations = blocking(move || limiter.check_build_limits(&ip, &session)).await?;
        if let Some(first) = violations.into_iter().next() {
            info!(client_ip = %request.client_ip, reason = %first, "build refused");
            return Err(SandboxError::QuotaExceeded(first).into());
        }

        let sandbox_id = paths::new_sandbox_id();
        let quota = self.parts().quota.clone();
        let (session, id) = (session_id.clone(), sandbox_id.clone());
        blocking(move || quota.reserve(&session, &id)).await??;

        let limiter = self.parts().limiter.clone();
        let ip = request.client_ip.clone();
        let _slot = blocking(move || {
            limiter.record_build(&ip);
            limiter.acquire_slot()
        })
        .await?;

        let mut record = SandboxRecord {
            id: sandbox_id.clone(),
            session_id,
            work_dir: self.paths().work_dir(&sandbox_id),
            reference,
            created: unix_now(),
            ttl: self.parts().container_ttl.as_secs(),
            status: SandboxStatus::Created,
        };
        info!(sandbox_id = %record.id, url = %request.repo_url, "sandbox created");

        let log = SandboxLog::new(self.paths().log(&sandbox_id));
        match self.provision(&mut record, request, &log, progress).await {
            Ok(result) => {
                log.raw("=== Build completed successfully ===\n").await;
                record.advance(SandboxStatus::Running, "Sandbox running", progress);
                Ok(result)
            }
            Err(e) => {
                error!(sandbox_id = %record.id, error = %e, "sandbox failed");
                log.raw(&format!("=== ERROR: {} ===\n", e.user_message())).await;
                record.advance(SandboxStatus::Failed, &e.user_message(), progress);
                self.parts().quota.release(&record.session_id, &record.id);
                Err(e)
            }
        }
    }

    fn validate(&self, request: &BuildRequest) -> RunnerResult<(Option<String>, String)> {
        let errors = validate_repo_url(&request.repo_url, self.parts().acquirer.policy());
        if let Some(first) = errors.into_iter().next() {
            return Err(SandboxError::InvalidInput(first).into());
        }
        let reference = sanitize_ref(request.reference.as_deref())?;
        if let Some(env) = request.env.as_deref().filter(|e| !e.trim().is_empty()) {
            validate_env(env)?;
        }
        let session_id = paths::validate_session_id(&request.session_id)?;
        Ok((reference, session_id))
    }

    async fn provision(
        &self,
        record: &mut SandboxRecord,
        request: &BuildRequest,
        log: &SandboxLog,
        progress: Option<&dyn ProgressSink>,
    ) -> RunnerResult<BuildResult> {
        let parts = self.parts();
        let id = record.id.clone();
        tokio::fs::create_dir_all(parts.paths.sandbox_dir(&id)).await?;
        let started = chrono::Local::now()
            .format(sandbox_host::LOG_TIME_FORMAT)
            .to_string();
        log.raw(&format!("=== Build started at {started} ===\n")).await;

        record.advance(SandboxStatus::Cloning, "Cloning repository", progress);
        parts
            .acquirer
            .clone(&request.repo_url, record.reference.as_deref(), &record.work_dir, log)
            .await?;
        prepare_env_file(&record.work_dir, request.env.as_deref()).await?;

        record.advance(SandboxStatus::Locating, "Locating build file", progress);
        let artifact = parts.acquirer.locate(&record.work_dir).await?.ok_or_else(|| {
            SandboxError::RuntimeFailure(
                "No Dockerfile or docker-compose.yml found in repository".into(),
            )
        })?;
        log.raw(&format!("Found {}: {}\n", artifact.kind, artifact.path.display()))
            .await;

        record.advance(SandboxStatus::Building, "Building", progress);
        let beat = progress.map(|p| move || p.heartbeat());
        let heartbeat = beat.as_ref().map(|f| f as &(dyn Fn() + Send + Sync));
        let env_file = parts.paths.env_file(&id);
        let ctx = SandboxContext {
            id: &id,
            env_file: &env_file,
            log,
            heartbeat,
        };
        let outcome = parts.runtime.build_and_run(&ctx, &artifact).await?;

        self.commit(record, outcome).await
    }

    /// Schedule teardown and persist metadata for a running sandbox.
    async fn commit(&self, record: &SandboxRecord, outcome: BuildOutcome) -> RunnerResult<BuildResult> {
        let parts = self.parts();
        let entry = TeardownEntry {
            sandbox_id: record.id.clone(),
            due: record.created.saturating_add(i64::try_from(record.ttl).unwrap_or(i64::MAX)),
            mode: outcome.mode,
            ports: outcome.ports.clone(),
            session_id: Some(record.session_id.clone()),
        };
        if let Err(e) = parts.scheduler.schedule(&entry).await {
            error!(sandbox_id = %record.id, error = %e, "cannot schedule teardown, tearing down now");
            parts
                .runtime
                .teardown(&record.id, outcome.mode, &outcome.ports)
                .await;
            return Err(e);
        }

        let meta = RunMeta {
            mode: outcome.mode,
            ports: outcome.ports.clone(),
            container_ids: outcome.container_ids.clone(),
            created: record.created,
            ttl: record.ttl,
            session_id: Some(record.session_id.clone()),
        };
        if let Err(e) = meta.save(&parts.paths.meta(&record.id)).await {
            warn!(sandbox_id = %record.id, error = %e, "failed to persist meta.json");
        }

        self.arm_timer(&record.id, parts.container_ttl);
        info!(
            sandbox_id = %record.id,
            ports = ?outcome.ports.iter().map(|p| p.host_port).collect::<Vec<_>>(),
            containers = outcome.container_ids.len(),
            "sandbox started"
        );
        Ok(BuildResult {
            sandbox_id: record.id.clone(),
            ports: outcome.ports,
            container_ids: outcome.container_ids,
            ttl: record.ttl,
        })
    }

    // -- teardown --

    fn arm_timer(&self, sandbox_id: &str, delay: Duration) {
        let this = self.clone();
        let id = sandbox_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(&id).await;
        });
        if let Some(previous) = lock(&self.inner.timers).insert(sandbox_id.to_string(), handle.abort_handle()) {
            previous.abort();
        }
    }

    fn disarm_timer(&self, sandbox_id: &str) {
        if let Some(handle) = lock(&self.inner.timers).remove(sandbox_id) {
            handle.abort();
        }
    }

    /// Run the scheduled teardown for `sandbox_id` if nobody else has, then
    /// delete its directory.
    pub async fn fire(&self, sandbox_id: &str) -> bool {
        lock(&self.inner.timers).remove(sandbox_id);
        let parts = self.parts();
        let Some(entry) = parts.scheduler.claim(sandbox_id).await else {
            return false;
        };
        parts
            .runtime
            .teardown(&entry.sandbox_id, entry.mode, &entry.ports)
            .await;
        parts.quota.release_any(&entry.sandbox_id);
        self.remove_sandbox_dir(&entry.sandbox_id).await;
        info!(sandbox_id = %entry.sandbox_id, status = %SandboxStatus::Expired, "sandbox expired");
        true
    }

    /// `true` when the directory is gone afterwards.
    async fn remove_sandbox_dir(&self, sandbox_id: &str) -> bool {
        match tokio::fs::remove_dir_all(self.paths().sandbox_dir(sandbox_id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(sandbox_id, error = %e, "failed to remove sandbox dir");
                false
            }
        }
    }

    /// Fire every teardown whose deadline has passed.
    pub async fn fire_due(&self) -> usize {
        let mut fired = 0;
        for id in self.parts().scheduler.due(unix_now()).await {
            if self.fire(&id).await {
                fired += 1;
            }
        }
        fired
    }

    /// Drop the pending teardown of `sandbox_id`; the sandbox keeps running
    /// until stopped or swept.
    pub async fn cancel_teardown(&self, sandbox_id: &str) -> bool {
        self.disarm_timer(sandbox_id);
        self.parts().scheduler.cancel(sandbox_id).await
    }

    /// Stop a sandbox now. Safe to call repeatedly and concurrently with the
    /// TTL teardown; firewall holes are closed by whichever runs first.
    ///
    /// Returns `false` for ids that never existed.
    pub async fn stop(&self, sandbox_id: &str) -> RunnerResult<bool> {
        let id = paths::validate_sandbox_id(sandbox_id)?;
        let parts = self.parts();
        self.disarm_timer(&id);

        if let Some(entry) = parts.scheduler.claim(&id).await {
            parts
                .runtime
                .teardown(&entry.sandbox_id, entry.mode, &entry.ports)
                .await;
        } else if let Some(meta) = RunMeta::load(&parts.paths.meta(&id)).await {
            parts.runtime.stop_containers(&id, meta.mode).await;
        } else if !tokio::fs::try_exists(parts.paths.sandbox_dir(&id)).await? {
            return Ok(false);
        }

        let quota = parts.quota.clone();
        let flag_id = id.clone();
        blocking(move || quota.release_any(&flag_id)).await?;
        SandboxLog::new(parts.paths.log(&id))
            .line(format!("Sandbox {}", SandboxStatus::Stopped))
            .await;
        info!(sandbox_id = %id, "sandbox stopped");
        Ok(true)
    }

    /// Remove sandbox directories older than `ttl_minutes`, tearing down
    /// whatever they still run, and prune flags and rate-limit files.
    pub async fn sweep_expired(&self, ttl_minutes: u64) -> RunnerResult<SweepReport> {
        let parts = self.parts();
        let mut report = SweepReport {
            teardowns_fired: self.fire_due().await,
            ..SweepReport::default()
        };

        let max_age = Duration::from_secs(ttl_minutes.saturating_mul(60));
        let now = SystemTime::now();
        let mut entries = match tokio::fs::read_dir(parts.paths.root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if paths::is_reserved(&name) || !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let old = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);
            if !old {
                continue;
            }

            self.disarm_timer(&name);
            if let Some(pending) = parts.scheduler.claim(&name).await {
                parts
                    .runtime
                    .teardown(&pending.sandbox_id, pending.mode, &pending.ports)
                    .await;
            } else if let Some(meta) = RunMeta::load(&entry.path().join("meta.json")).await {
                parts.runtime.stop_containers(&name, meta.mode).await;
            }
            if self.remove_sandbox_dir(&name).await {
                info!(sandbox_id = %name, "removed expired sandbox");
                report.sandboxes_removed += 1;
            }
            parts.quota.release_any(&name);
        }

        let quota = parts.quota.clone();
        let limiter = parts.limiter.clone();
        let (flags, rate_files) = blocking(move || {
            (quota.prune_older_than(max_age), limiter.cleanup())
        })
        .await?;
        report.flags_pruned = flags;
        report.rate_files_removed = rate_files;
        Ok(report)
    }

    // -- observation --

    /// Next slice of the execution log of `sandbox_id`.
    pub async fn tail(&self, sandbox_id: &str, offset: u64) -> RunnerResult<Tail> {
        let id = paths::validate_sandbox_id(sandbox_id)?;
        let path = self.paths().log(&id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(SandboxError::NotFound("Log".into()).into());
        }
        Ok(logtail::read_from(&path, offset).await?)
    }

    /// Usage of every container recorded for `sandbox_id`.
    pub async fn stats(&self, sandbox_id: &str) -> RunnerResult<Vec<ContainerStats>> {
        let id = paths::validate_sandbox_id(sandbox_id)?;
        let meta = RunMeta::load(&self.paths().meta(&id))
            .await
            .ok_or_else(|| SandboxError::NotFound("Sandbox".into()))?;
        Ok(self.parts().runtime.stats(&meta.container_ids).await)
    }

    /// Usage of a single container by name or id.
    pub async fn container_stats(&self, container: &str) -> RunnerResult<Vec<ContainerStats>> {
        let name = paths::validate_sandbox_id(container)?;
        Ok(self.parts().runtime.stats(&[name]).await)
    }
}
