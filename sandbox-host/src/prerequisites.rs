use sandbox::SandboxError;

use crate::command::{Privilege, exec};

/// Verify the host tools the engine shells out to are installed.
///
/// Collects all failures and returns them in a single `Internal` error.
pub async fn check_prerequisites(docker: &str, firewall: Option<Privilege>) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    let mut commands = vec!["git", docker];
    if firewall.is_some() {
        commands.push("iptables");
    }
    check_required_commands(&commands, &mut errors);

    if exec(docker, &["compose", "version"], Privilege::User)
        .await
        .is_err()
    {
        errors.push(format!("`{docker} compose` plugin not available"));
    }
    if firewall == Some(Privilege::Sudo) {
        check_sudo(&mut errors).await;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::Internal(errors.join("; ")))
    }
}

fn check_required_commands(commands: &[&str], errors: &mut Vec<String>) {
    for cmd in commands {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_sudo(errors: &mut Vec<String>) {
    if exec("sudo", &["-n", "true"], Privilege::User)
        .await
        .is_err()
    {
        errors.push(
            "sudo access required for firewall rules; \
             configure sudoers or disable firewall management"
                .to_string(),
        );
    }
}
