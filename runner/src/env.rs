use std::path::Path;

use sandbox::SandboxError;
use tracing::debug;

pub const MAX_ENV_BYTES: usize = 64 * 1024;
const DANGEROUS_TOKENS: [&str; 7] = ["$(", "`", "${", "&&", "||", ";", "|"];
const TEMPLATES: [&str; 4] = [".env.example", ".env-example", ".env.sample", ".env.dist"];

/// Reject caller-supplied env content that could smuggle shell syntax.
pub fn validate_env(content: &str) -> Result<(), SandboxError> {
    if DANGEROUS_TOKENS.iter().any(|t| content.contains(t)) {
        return Err(SandboxError::InvalidInput(
            "Environment content contains potentially dangerous characters".into(),
        ));
    }
    if content.len() > MAX_ENV_BYTES {
        return Err(SandboxError::InvalidInput(
            "Environment content too large (max 64KB)".into(),
        ));
    }
    Ok(())
}

/// Write the sandbox `.env` into `work_dir`.
///
/// Non-blank `override_content` wins. Otherwise an existing `.env` is kept, or
/// the first template present is copied.
pub async fn prepare_env_file(work_dir: &Path, override_content: Option<&str>) -> sandbox::Result<()> {
    let env_path = work_dir.join(".env");
    if let Some(content) = override_content.filter(|c| !c.trim().is_empty()) {
        validate_env(content)?;
        tokio::fs::write(&env_path, content).await?;
        return Ok(());
    }
    if tokio::fs::try_exists(&env_path).await? {
        return Ok(());
    }
    for template in TEMPLATES {
        let src = work_dir.join(template);
        if tokio::fs::metadata(&src).await.is_ok_and(|m| m.is_file()) {
            debug!(template, "seeding .env from template");
            tokio::fs::copy(&src, &env_path).await?;
            return Ok(());
        }
    }
    Ok(())
}
