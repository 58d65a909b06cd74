use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use sandbox::{ResourceLimits, SecurityOptions};
use sandbox_host::{
    DEFAULT_CHAIN, Privilege, PortRange, ReadinessPolicy, RuntimeSettings, RuntimeTimeouts,
};
use serde::Deserialize;

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_TTL_MINUTES: u64 = 1440;
pub(crate) const DEFAULT_CONTAINER_TTL_SECONDS: u64 = 3600;
pub(crate) const DEFAULT_MAX_PER_SESSION: usize = 3;
pub(crate) const DEFAULT_BUILDS_PER_MINUTE: usize = 3;
pub(crate) const DEFAULT_BUILDS_PER_HOUR: usize = 10;
pub(crate) const DEFAULT_MAX_CONCURRENT_BUILDS: u64 = 5;
pub(crate) const DEFAULT_MAX_REPO_SIZE_MB: u64 = 500;
pub(crate) const DEFAULT_GIT_TIMEOUT_SECONDS: u64 = 120;

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Sandboxes, session flags, schedule and rate-limit state live here.
    pub build_root: PathBuf,
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,
    /// Lifetime of a running sandbox before its teardown fires.
    #[serde(default = "default_container_ttl_seconds")]
    pub container_ttl_seconds: u64,
    #[serde(default = "default_max_per_session")]
    pub max_per_session: usize,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub security: SecurityOptions,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub port_range: PortRange,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub readiness_policy: ReadinessPolicy,
}

fn default_ttl_minutes() -> u64 {
    DEFAULT_TTL_MINUTES
}

fn default_container_ttl_seconds() -> u64 {
    DEFAULT_CONTAINER_TTL_SECONDS
}

fn default_max_per_session() -> usize {
    DEFAULT_MAX_PER_SESSION
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub chain: String,
    /// Prefix iptables with `sudo`.
    pub sudo: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chain: DEFAULT_CHAIN.to_string(),
            sudo: true,
        }
    }
}

impl FirewallConfig {
    pub fn privilege(&self) -> Privilege {
        if self.sudo {
            Privilege::Sudo
        } else {
            Privilege::User
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Defaults to `<build_root>/.ratelimit`.
    pub storage_path: Option<PathBuf>,
    pub builds_per_ip_per_minute: usize,
    pub builds_per_ip_per_hour: usize,
    pub max_concurrent_builds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            builds_per_ip_per_minute: DEFAULT_BUILDS_PER_MINUTE,
            builds_per_ip_per_hour: DEFAULT_BUILDS_PER_HOUR,
            max_concurrent_builds: DEFAULT_MAX_CONCURRENT_BUILDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Empty means any host.
    pub allowed_hosts: Vec<String>,
    /// Regexes matched against the whole URL.
    pub blocked_url_patterns: Vec<String>,
    /// Regexes matched against Dockerfile contents.
    pub blocked_dockerfile_patterns: Vec<String>,
    pub max_repo_size_mb: u64,
    pub git_timeout_seconds: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: ["github.com", "gitlab.com", "bitbucket.org"]
                .into_iter()
                .map(String::from)
                .collect(),
            blocked_url_patterns: vec![r"[;&|`$]".to_string()],
            blocked_dockerfile_patterns: vec![
                r"(?i)--privileged".to_string(),
                r"(?i)/var/run/docker\.sock".to_string(),
                r"(?i)--net(work)?[= ]host".to_string(),
                r"(?i)--cap-add".to_string(),
            ],
            max_repo_size_mb: DEFAULT_MAX_REPO_SIZE_MB,
            git_timeout_seconds: DEFAULT_GIT_TIMEOUT_SECONDS,
        }
    }
}

impl RepositoryConfig {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_seconds)
    }

    pub fn max_repo_size_bytes(&self) -> u64 {
        self.max_repo_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Per-step deadlines, in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub build: u64,
    pub compose_pull: u64,
    pub compose_up: u64,
    pub run: u64,
    pub readiness: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let d = RuntimeTimeouts::default();
        Self {
            build: d.build.as_secs(),
            compose_pull: d.compose_pull.as_secs(),
            compose_up: d.compose_up.as_secs(),
            run: d.run.as_secs(),
            readiness: d.readiness.as_secs(),
        }
    }
}

impl From<&TimeoutConfig> for RuntimeTimeouts {
    fn from(t: &TimeoutConfig) -> Self {
        Self {
            build: Duration::from_secs(t.build),
            compose_pull: Duration::from_secs(t.compose_pull),
            compose_up: Duration::from_secs(t.compose_up),
            run: Duration::from_secs(t.run),
            readiness: Duration::from_secs(t.readiness),
            ..RuntimeTimeouts::default()
        }
    }
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

fn compile_patterns(label: &str, patterns: &[String]) -> RunnerResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| RunnerError::Config(format!("{label} pattern {p:?}: {e}")))
        })
        .collect()
}

impl RunnerConfig {
    /// Defaults everywhere except the build root.
    pub fn with_root(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            ttl_minutes: DEFAULT_TTL_MINUTES,
            container_ttl_seconds: DEFAULT_CONTAINER_TTL_SECONDS,
            max_per_session: DEFAULT_MAX_PER_SESSION,
            limits: ResourceLimits::default(),
            security: SecurityOptions::default(),
            firewall: FirewallConfig::default(),
            port_range: PortRange::default(),
            rate_limit: RateLimitConfig::default(),
            repository: RepositoryConfig::default(),
            timeouts: TimeoutConfig::default(),
            readiness_policy: ReadinessPolicy::default(),
        }
    }

    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.build_root);
        if let Some(storage) = &mut self.rate_limit.storage_path {
            resolve(storage);
        }
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if self.port_range.min == 0 || self.port_range.min > self.port_range.max {
            return Err(RunnerError::Config(format!(
                "invalid port_range {}-{}",
                self.port_range.min, self.port_range.max
            )));
        }
        if self.max_per_session == 0 {
            return Err(RunnerError::Config("max_per_session must be at least 1".into()));
        }
        if self.container_ttl_seconds == 0 {
            return Err(RunnerError::Config("container_ttl_seconds must be positive".into()));
        }
        self.url_patterns()?;
        self.dockerfile_patterns()?;
        Ok(())
    }

    pub fn url_patterns(&self) -> RunnerResult<Vec<Regex>> {
        compile_patterns("blocked_url", &self.repository.blocked_url_patterns)
    }

    pub fn dockerfile_patterns(&self) -> RunnerResult<Vec<Regex>> {
        compile_patterns(
            "blocked_dockerfile",
            &self.repository.blocked_dockerfile_patterns,
        )
    }

    pub fn rate_limit_dir(&self) -> PathBuf {
        self.rate_limit
            .storage_path
            .clone()
            .unwrap_or_else(|| self.build_root.join(crate::paths::RATE_LIMIT_DIR))
    }

    pub fn container_ttl(&self) -> Duration {
        Duration::from_secs(self.container_ttl_seconds)
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            limits: self.limits.clone(),
            security: self.security.clone(),
            port_range: self.port_range,
            timeouts: RuntimeTimeouts::from(&self.timeouts),
            readiness: self.readiness_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
build_root: builds
ttl_minutes: 60
container_ttl_seconds: 900
max_per_session: 2
limits:
  memory: 512m
  cpus: "0.5"
  pids: 128
  network_mode: sandbox-net
security:
  read_only_root: true
  add_capabilities: [NET_BIND_SERVICE]
firewall:
  chain: INPUT
  sudo: false
port_range:
  min: 40000
  max: 40100
rate_limit:
  storage_path: /var/lib/sandbox/rl
  builds_per_ip_per_minute: 1
  builds_per_ip_per_hour: 4
  max_concurrent_builds: 2
repository:
  allowed_hosts: [github.com]
  blocked_dockerfile_patterns: ["(?i)curl .*\\| *sh"]
  max_repo_size_mb: 50
timeouts:
  build: 300
  readiness: 30
readiness_policy: fail
"#;
        let config_path = dir.path().join("runner.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.build_root, dir.path().join("builds"));
        assert_eq!(config.ttl_minutes, 60);
        assert_eq!(config.container_ttl(), Duration::from_secs(900));
        assert_eq!(config.max_per_session, 2);
        assert_eq!(config.limits.memory.as_deref(), Some("512m"));
        assert_eq!(config.limits.pids, Some(128));
        assert!(config.security.read_only_root);
        assert!(config.security.no_new_privileges);
        assert_eq!(config.firewall.chain, "INPUT");
        assert_eq!(config.firewall.privilege(), Privilege::User);
        assert_eq!(config.port_range, PortRange { min: 40000, max: 40100 });
        assert_eq!(config.rate_limit_dir(), PathBuf::from("/var/lib/sandbox/rl"));
        assert_eq!(config.rate_limit.max_concurrent_builds, 2);
        assert_eq!(config.repository.max_repo_size_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.repository.git_timeout_seconds, DEFAULT_GIT_TIMEOUT_SECONDS);

        let settings = config.runtime_settings();
        assert_eq!(settings.timeouts.build, Duration::from_secs(300));
        assert_eq!(settings.timeouts.readiness, Duration::from_secs(30));
        assert_eq!(settings.timeouts.compose_up, Duration::from_secs(600));
        assert_eq!(settings.readiness, ReadinessPolicy::Fail);
    }

    #[tokio::test]
    async fn load_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("runner.yaml");
        tokio::fs::write(&config_path, "build_root: /srv/builds\n")
            .await
            .unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.ttl_minutes, DEFAULT_TTL_MINUTES);
        assert_eq!(config.max_per_session, DEFAULT_MAX_PER_SESSION);
        assert!(config.firewall.enabled);
        assert_eq!(config.firewall.chain, DEFAULT_CHAIN);
        assert_eq!(config.firewall.privilege(), Privilege::Sudo);
        assert_eq!(config.port_range, PortRange::default());
        assert_eq!(
            config.rate_limit_dir(),
            PathBuf::from("/srv/builds/.ratelimit")
        );
        assert_eq!(config.readiness_policy, ReadinessPolicy::Proceed);
    }

    #[tokio::test]
    async fn load_fails_without_build_root() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("runner.yaml");
        tokio::fs::write(&config_path, "ttl_minutes: 5\n").await.unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("build_root"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_bad_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("runner.yaml");
        let yaml = "build_root: /srv/builds\nrepository:\n  blocked_url_patterns: [\"(unclosed\"]\n";
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("blocked_url"), "got: {err}");
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let mut config = RunnerConfig::with_root("/srv/builds");
        config.port_range = PortRange { min: 50000, max: 40000 };
        assert!(config.validate().is_err());
    }
}
