//! Fetch an untrusted repository, screen it, and find what to build.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use sandbox::{ArtifactKind, BuildArtifact, CloneRequest, RepoCloner, SandboxError};
use sandbox_host::SandboxLog;
use tracing::{info, warn};
use url::Url;
use walkdir::WalkDir;

use crate::config::RunnerConfig;
use crate::error::RunnerResult;

pub const COMPOSE_NAMES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// Directory levels below the root searched when the root has no descriptor.
const SEARCH_DEPTH: usize = 3;
const CLONE_SNIPPET_CHARS: usize = 500;
const REF_BLOCKED: [&str; 9] = ["--", ";", "&", "|", "$", "`", ">", "<", ".."];
const SENSITIVE_MOUNTS: [&str; 4] = ["/var/run/docker.sock", "/etc", "/root", "/home"];

#[allow(clippy::unwrap_used)]
static REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._/-]+$").unwrap());

#[allow(clippy::unwrap_used)]
static SCRIPT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(exe|bat|sh|ps1|cmd)$").unwrap());

#[allow(clippy::unwrap_used)]
static PRIVILEGED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)privileged\s*:\s*true").unwrap());

#[allow(clippy::unwrap_used)]
static HOST_NETWORK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)network_mode\s*:\s*["']?host["']?"#).unwrap());

#[allow(clippy::unwrap_used)]
static LOOSE_BASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*FROM\s+.*(:latest|scratch)\s*$").unwrap());

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

/// Rules applied to every repository before and after it is fetched.
#[derive(Debug, Clone)]
pub struct RepoPolicy {
    pub allowed_hosts: Vec<String>,
    pub blocked_url_patterns: Vec<Regex>,
    pub blocked_dockerfile_patterns: Vec<Regex>,
    pub max_size_bytes: u64,
    pub git_timeout: Duration,
}

impl RepoPolicy {
    pub fn from_config(config: &RunnerConfig) -> RunnerResult<Self> {
        Ok(Self {
            allowed_hosts: config.repository.allowed_hosts.clone(),
            blocked_url_patterns: config.url_patterns()?,
            blocked_dockerfile_patterns: config.dockerfile_patterns()?,
            max_size_bytes: config.repository.max_repo_size_bytes(),
            git_timeout: config.repository.git_timeout(),
        })
    }
}

/// Every rule `url` breaks. Empty means acceptable.
pub fn validate_repo_url(url: &str, policy: &RepoPolicy) -> Vec<String> {
    let parsed = match Url::parse(url) {
        Ok(parsed) if parsed.has_host() => parsed,
        _ => return vec!["Invalid URL format".to_string()],
    };

    let mut errors = Vec::new();
    if parsed.scheme() != "https" {
        errors.push("Only HTTPS URLs are allowed".to_string());
    }
    if !policy.allowed_hosts.is_empty() {
        let host = parsed.host_str().unwrap_or_default();
        if !policy.allowed_hosts.iter().any(|h| h == host) {
            errors.push(format!(
                "Repository host not allowed. Allowed: {}",
                policy.allowed_hosts.join(", ")
            ));
        }
    }
    if policy.blocked_url_patterns.iter().any(|re| re.is_match(url)) {
        errors.push("URL contains blocked characters".to_string());
    }
    if SCRIPT_PATH_RE.is_match(parsed.path()) {
        errors.push("Direct script URLs not allowed".to_string());
    }
    errors
}

/// Trimmed ref, `None` for blank input.
pub fn sanitize_ref(reference: Option<&str>) -> Result<Option<String>, SandboxError> {
    let Some(reference) = reference.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    if !REF_RE.is_match(reference) {
        return Err(SandboxError::InvalidInput("Invalid git ref format".into()));
    }
    if REF_BLOCKED.iter().any(|p| reference.contains(p)) {
        return Err(SandboxError::InvalidInput("Invalid characters in git ref".into()));
    }
    Ok(Some(reference.to_string()))
}

fn truncate_output(output: &str) -> String {
    let output = output.trim();
    if output.chars().count() > CLONE_SNIPPET_CHARS {
        let cut: String = output.chars().take(CLONE_SNIPPET_CHARS).collect();
        format!("{cut}...")
    } else {
        output.to_string()
    }
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

pub struct RepositoryAcquirer {
    cloner: Arc<dyn RepoCloner>,
    policy: RepoPolicy,
}

enum TreeVerdict {
    Ok,
    TooLarge,
    DangerousSymlink(PathBuf),
}

impl RepositoryAcquirer {
    pub fn new(cloner: Arc<dyn RepoCloner>, policy: RepoPolicy) -> Self {
        Self { cloner, policy }
    }

    pub fn policy(&self) -> &RepoPolicy {
        &self.policy
    }

    /// Shallow-clone `url` into `dest`, strip its history and reject trees
    /// that are too large or link outside themselves.
    ///
    /// `dest` must not exist yet. A rejected tree is deleted before returning.
    pub async fn clone(
        &self,
        url: &str,
        reference: Option<&str>,
        dest: &Path,
        log: &SandboxLog,
    ) -> sandbox::Result<()> {
        if tokio::fs::try_exists(dest).await? {
            return Err(SandboxError::Internal(format!(
                "work directory already exists: {}",
                dest.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(url, reference, dest = %dest.display(), "cloning repository");

        let request = CloneRequest {
            url,
            reference,
            dest,
            timeout: self.policy.git_timeout,
        };
        let output = self.cloner.clone_repo(&request).await?;
        log.raw(&output.output).await;
        if !output.success() || !tokio::fs::try_exists(dest).await.unwrap_or(false) {
            warn!(url, exit_code = output.exit_code, "clone failed");
            return Err(SandboxError::CloneFailure(format!(
                "Clone failed: {}",
                truncate_output(&output.output)
            )));
        }

        let git_dir = dest.join(".git");
        if tokio::fs::try_exists(&git_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&git_dir).await?;
        }

        let root = dest.to_path_buf();
        let max = self.policy.max_size_bytes;
        let verdict = tokio::task::spawn_blocking(move || inspect_tree(&root, max))
            .await
            .map_err(|e| SandboxError::Internal(format!("tree inspection: {e}")))?;
        match verdict {
            TreeVerdict::Ok => {
                info!(dest = %dest.display(), "clone successful");
                Ok(())
            }
            TreeVerdict::TooLarge => {
                purge(dest).await;
                Err(SandboxError::CloneFailure(format!(
                    "Repository too large (max {} MB)",
                    max / (1024 * 1024)
                )))
            }
            TreeVerdict::DangerousSymlink(link) => {
                warn!(link = %link.display(), "dangerous symlink in repository");
                purge(dest).await;
                Err(SandboxError::CloneFailure(
                    "Repository contains dangerous symlinks".into(),
                ))
            }
        }
    }

    /// Find the descriptor to build, screening it on the way.
    ///
    /// Root compose files win over a root Dockerfile; deeper files are only
    /// considered when the root has neither.
    pub async fn locate(&self, work_dir: &Path) -> sandbox::Result<Option<BuildArtifact>> {
        let root = work_dir.to_path_buf();
        let found = tokio::task::spawn_blocking(move || find_descriptor(&root))
            .await
            .map_err(|e| SandboxError::Internal(format!("descriptor search: {e}")))?;
        let Some(artifact) = found else {
            return Ok(None);
        };

        let content = tokio::fs::read_to_string(&artifact.path).await?;
        match artifact.kind {
            ArtifactKind::Compose => validate_compose(&content)?,
            ArtifactKind::Dockerfile => {
                validate_dockerfile(&content, &self.policy.blocked_dockerfile_patterns)?;
            }
        }
        Ok(Some(artifact))
    }
}

async fn purge(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %e, "failed to purge rejected repository");
    }
}

/// Total regular-file size and symlink targets, without following links.
fn inspect_tree(root: &Path, max_bytes: u64) -> TreeVerdict {
    let mut total: u64 = 0;
    let mut dangerous = None;
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            if dangerous.is_none()
                && let Ok(target) = std::fs::read_link(entry.path())
                && (target.is_absolute() || target.to_string_lossy().contains(".."))
            {
                dangerous = Some(entry.path().to_path_buf());
            }
        } else if file_type.is_file() {
            total = total.saturating_add(entry.metadata().map(|m| m.len()).unwrap_or(0));
        }
    }
    if total > max_bytes {
        TreeVerdict::TooLarge
    } else if let Some(link) = dangerous {
        TreeVerdict::DangerousSymlink(link)
    } else {
        TreeVerdict::Ok
    }
}

fn find_descriptor(root: &Path) -> Option<BuildArtifact> {
    for name in COMPOSE_NAMES {
        let path = root.join(name);
        if path.is_file() {
            return Some(BuildArtifact::compose(path));
        }
    }
    let dockerfile = root.join(DOCKERFILE_NAME);
    if dockerfile.is_file() {
        return Some(BuildArtifact::dockerfile(dockerfile));
    }

    if let Some(path) = search(root, &COMPOSE_NAMES) {
        return Some(BuildArtifact::compose(path));
    }
    search(root, &[DOCKERFILE_NAME]).map(BuildArtifact::dockerfile)
}

/// Shallowest match, then by name priority, then by path.
fn search(root: &Path, names: &[&str]) -> Option<PathBuf> {
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(SEARCH_DEPTH + 1)
        .follow_links(false)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rank = names.iter().position(|n| e.file_name() == *n)?;
            Some((e.depth(), rank, e.into_path()))
        })
        .min()
        .map(|(_, _, path)| path)
}

fn validate_compose(content: &str) -> sandbox::Result<()> {
    if PRIVILEGED_RE.is_match(content) {
        return Err(SandboxError::BuildFailure(
            "Compose file requests privileged mode (not allowed)".into(),
        ));
    }
    if HOST_NETWORK_RE.is_match(content) {
        return Err(SandboxError::BuildFailure(
            "Compose file requests host network (not allowed)".into(),
        ));
    }
    for mount in SENSITIVE_MOUNTS {
        if content.contains(mount) {
            warn!(mount, "compose file mounts sensitive path");
        }
    }
    Ok(())
}

fn validate_dockerfile(content: &str, blocked: &[Regex]) -> sandbox::Result<()> {
    if blocked.iter().any(|re| re.is_match(content)) {
        return Err(SandboxError::BuildFailure(
            "Dockerfile contains blocked instructions".into(),
        ));
    }
    if LOOSE_BASE_RE.is_match(content) {
        warn!("Dockerfile uses :latest or scratch base image");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use sandbox_host::testing::{FakeCloner, failed_output};

    use super::*;

    fn policy() -> RepoPolicy {
        RepoPolicy::from_config(&RunnerConfig::with_root("/unused")).unwrap()
    }

    fn acquirer(cloner: FakeCloner) -> RepositoryAcquirer {
        RepositoryAcquirer::new(Arc::new(cloner), policy())
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn url_rules() {
        let p = policy();
        assert!(validate_repo_url("https://github.com/acme/app", &p).is_empty());
        assert_eq!(validate_repo_url("not a url", &p), vec!["Invalid URL format"]);
        assert_eq!(
            validate_repo_url("http://github.com/acme/app", &p),
            vec!["Only HTTPS URLs are allowed"]
        );
        let errors = validate_repo_url("https://evil.example/run.sh", &p);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("Repository host not allowed. Allowed: github.com"));
        assert_eq!(errors[1], "Direct script URLs not allowed");
        assert_eq!(
            validate_repo_url("https://github.com/acme/app;rm", &p),
            vec!["URL contains blocked characters"]
        );
    }

    #[test]
    fn any_host_when_allow_list_is_empty() {
        let mut p = policy();
        p.allowed_hosts.clear();
        assert!(validate_repo_url("https://git.internal/acme/app", &p).is_empty());
    }

    #[test]
    fn ref_sanitizer() {
        assert_eq!(sanitize_ref(None).unwrap(), None);
        assert_eq!(sanitize_ref(Some("  ")).unwrap(), None);
        assert_eq!(sanitize_ref(Some(" main ")).unwrap().as_deref(), Some("main"));
        assert_eq!(
            sanitize_ref(Some("release/v1.2_rc-3")).unwrap().as_deref(),
            Some("release/v1.2_rc-3")
        );
        for bad in ["main;rm -rf /", "a b", "$(id)", "a|b"] {
            let err = sanitize_ref(Some(bad)).unwrap_err();
            assert_eq!(err.user_message(), "Invalid git ref format", "{bad}");
        }
        for bad in ["--upload-pack", "a..b", "feature--x"] {
            let err = sanitize_ref(Some(bad)).unwrap_err();
            assert_eq!(err.user_message(), "Invalid characters in git ref", "{bad}");
        }
    }

    #[test]
    fn truncation_marks_cut_output() {
        assert_eq!(truncate_output("  fatal: nope \n"), "fatal: nope");
        let long = "x".repeat(600);
        let cut = truncate_output(&long);
        assert_eq!(cut.len(), 503);
        assert!(cut.ends_with("..."));
    }

    #[tokio::test]
    async fn clone_strips_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc").join("src");
        let log = SandboxLog::new(dir.path().join("exec.log"));
        let acq = acquirer(FakeCloner::with_files(&[("Dockerfile", "FROM alpine:3.20\n")]));

        acq.clone("https://github.com/acme/app", None, &dest, &log)
            .await
            .unwrap();
        assert!(dest.join("Dockerfile").exists());
        assert!(!dest.join(".git").exists());
    }

    #[tokio::test]
    async fn clone_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let log = SandboxLog::new(dir.path().join("exec.log"));
        let cloner = Arc::new(FakeCloner::default());
        let acq = RepositoryAcquirer::new(cloner.clone(), policy());

        let err = acq
            .clone("https://github.com/acme/app", None, dir.path(), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Internal(_)));
        assert_eq!(cloner.calls(), 0);
    }

    #[tokio::test]
    async fn clone_failure_carries_snippet() {
        let dir = tempfile::tempdir().unwrap();
        let log = SandboxLog::new(dir.path().join("exec.log"));
        let mut cloner = FakeCloner::default();
        cloner.result = Some(failed_output(128, "fatal: repository not found\n"));
        let acq = acquirer(cloner);

        let err = acq
            .clone("https://github.com/acme/gone", None, &dir.path().join("src"), &log)
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "Clone failed: fatal: repository not found");
        let logged = std::fs::read_to_string(dir.path().join("exec.log")).unwrap();
        assert!(logged.contains("repository not found"));
    }

    #[tokio::test]
    async fn oversized_repository_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");
        let log = SandboxLog::new(dir.path().join("exec.log"));
        let big = "x".repeat(2048);
        let mut p = policy();
        p.max_size_bytes = 1024;
        let acq = RepositoryAcquirer::new(
            Arc::new(FakeCloner::with_files(&[("blob.bin", &big)])),
            p,
        );

        let err = acq
            .clone("https://github.com/acme/app", None, &dest, &log)
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "Repository too large (max 0 MB)");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn escaping_symlinks_are_purged() {
        for target in ["/etc/passwd", "../../secret"] {
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("src");
            let log = SandboxLog::new(dir.path().join("exec.log"));
            let mut cloner = FakeCloner::with_files(&[("Dockerfile", "FROM alpine\n")]);
            cloner.symlinks = vec![("link".into(), target.into())];
            let acq = acquirer(cloner);

            let err = acq
                .clone("https://github.com/acme/app", None, &dest, &log)
                .await
                .unwrap_err();
            assert_eq!(err.user_message(), "Repository contains dangerous symlinks");
            assert!(!dest.exists());
        }
    }

    #[tokio::test]
    async fn relative_symlinks_inside_tree_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");
        let log = SandboxLog::new(dir.path().join("exec.log"));
        let mut cloner = FakeCloner::with_files(&[("docs/README", "hi")]);
        cloner.symlinks = vec![("current".into(), "docs".into())];
        let acq = acquirer(cloner);
        acq.clone("https://github.com/acme/app", None, &dest, &log)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn root_compose_beats_root_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Dockerfile", "FROM alpine:3.20\n");
        write(dir.path(), "compose.yaml", "services: {}\n");
        write(dir.path(), "docker-compose.yml", "services: {}\n");

        let found = acquirer(FakeCloner::default())
            .locate(dir.path())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.kind, ArtifactKind::Compose);
        assert_eq!(found.path, dir.path().join("docker-compose.yml"));
    }

    #[tokio::test]
    async fn nested_search_prefers_shallowest_and_respects_depth() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/b/c/compose.yml", "services: {}\n");
        write(dir.path(), "a/b/c/d/docker-compose.yml", "services: {}\n");
        write(dir.path(), "svc/Dockerfile", "FROM alpine:3.20\n");

        let acq = acquirer(FakeCloner::default());
        let found = acq.locate(dir.path()).await.unwrap().unwrap();
        assert_eq!(found.kind, ArtifactKind::Compose);
        assert_eq!(found.path, dir.path().join("a/b/c/compose.yml"));

        std::fs::remove_dir_all(dir.path().join("a/b/c")).unwrap();
        let found = acq.locate(dir.path()).await.unwrap().unwrap();
        assert_eq!(found, BuildArtifact::dockerfile(dir.path().join("svc/Dockerfile")));
    }

    #[tokio::test]
    async fn nothing_to_build() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/b/c/d/Dockerfile", "FROM alpine\n");
        write(dir.path(), "README.md", "# app\n");
        assert!(
            acquirer(FakeCloner::default())
                .locate(dir.path())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn compose_screening() {
        let dir = tempfile::tempdir().unwrap();
        let acq = acquirer(FakeCloner::default());

        write(dir.path(), "compose.yml", "services:\n  a:\n    privileged: true\n");
        let err = acq.locate(dir.path()).await.unwrap_err();
        assert_eq!(err.user_message(), "Compose file requests privileged mode (not allowed)");

        write(dir.path(), "compose.yml", "services:\n  a:\n    network_mode: \"host\"\n");
        let err = acq.locate(dir.path()).await.unwrap_err();
        assert_eq!(err.user_message(), "Compose file requests host network (not allowed)");

        write(
            dir.path(),
            "compose.yml",
            "services:\n  a:\n    volumes: [\"/etc:/host-etc:ro\"]\n",
        );
        assert!(acq.locate(dir.path()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blocked_dockerfile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "Dockerfile",
            "FROM alpine:3.20\nVOLUME /var/run/docker.sock\n",
        );
        let err = acquirer(FakeCloner::default())
            .locate(dir.path())
            .await
            .unwrap_err();
        assert!(err.is_build_failure());
        assert_eq!(err.user_message(), "Dockerfile contains blocked instructions");
    }

    #[tokio::test]
    async fn host_network_and_capabilities_are_blocked() {
        for line in [
            "RUN --network=host apk add curl",
            "RUN --net host wget example.com",
            "# docker run --cap-add SYS_ADMIN",
            "RUN --privileged true",
        ] {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "Dockerfile", &format!("FROM alpine:3.20\n{line}\n"));
            let err = acquirer(FakeCloner::default())
                .locate(dir.path())
                .await
                .unwrap_err();
            assert!(err.is_build_failure(), "{line}");
        }

        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "Dockerfile",
            "FROM alpine:3.20\nRUN --network=none true\nENV NETWORK=hosted\n",
        );
        assert!(acquirer(FakeCloner::default())
            .locate(dir.path())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn symlinked_descriptors_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "real/Dockerfile", "FROM alpine\n");
        symlink("real", dir.path().join("link")).unwrap();
        let found = acquirer(FakeCloner::default())
            .locate(dir.path())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.path, dir.path().join("real/Dockerfile"));
    }
}
