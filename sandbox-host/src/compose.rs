//! Rewriting of compose descriptors before a stack is started.
//!
//! Two passes over the parsed document. Host ports that are taken, outside the
//! allowed range, or claimed twice are reassigned, and every numeric host port
//! is mirrored into the stack's env file as `<SERVICE>_PORT`. Then every
//! service is stripped of privilege escalation and given resource ceilings it
//! does not already declare. The result is written next to the original so
//! relative build contexts keep resolving.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sandbox::{ResourceLimits, SandboxError};
use serde_yaml_ng::{Mapping, Value};
use tracing::debug;

use crate::ports::PortAllocator;

/// File name of the rewritten descriptor, created beside the original.
pub const PATCHED_FILE_NAME: &str = ".sandbox-compose.yml";

/// Service keys removed from every service.
const STRIPPED_KEYS: [&str; 3] = ["network_mode", "privileged", "cap_add"];

/// Numeric host port of one service, after reassignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    pub service: String,
    pub requested: u16,
    pub host_port: u16,
}

impl PortAssignment {
    pub fn moved(&self) -> bool {
        self.requested != self.host_port
    }

    /// Env variable the stack can use to learn its new port (`WEB_APP_PORT`).
    pub fn env_key(&self) -> String {
        let service: String = self
            .service
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{service}_PORT")
    }
}

#[derive(Debug)]
pub struct PreparedStack {
    pub file: PathBuf,
    /// Every numeric host port, kept or moved.
    pub assignments: Vec<PortAssignment>,
}

impl PreparedStack {
    pub fn reassigned(&self) -> impl Iterator<Item = &PortAssignment> {
        self.assignments.iter().filter(|a| a.moved())
    }
}

/// Parse, rewrite and persist `descriptor`.
pub async fn prepare(
    descriptor: &Path,
    env_file: &Path,
    allocator: &PortAllocator,
    limits: &ResourceLimits,
) -> sandbox::Result<PreparedStack> {
    let text = tokio::fs::read_to_string(descriptor).await?;
    let mut doc: Value = serde_yaml_ng::from_str(&text)
        .map_err(|e| SandboxError::BuildFailure(format!("Invalid compose file: {e}")))?;

    let assignments = reassign_host_ports(&mut doc, allocator)?;
    if !assignments.is_empty() {
        upsert_env_ports(env_file, &assignments).await?;
    }
    harden(&mut doc, limits);

    let rendered = serde_yaml_ng::to_string(&doc)
        .map_err(|e| SandboxError::Internal(format!("render compose file: {e}")))?;
    let file = descriptor.with_file_name(PATCHED_FILE_NAME);
    tokio::fs::write(&file, rendered).await?;
    debug!(file = %file.display(), ports = assignments.len(), "compose descriptor prepared");

    Ok(PreparedStack { file, assignments })
}

// ---------------------------------------------------------------------------
// Port pass
// ---------------------------------------------------------------------------

/// Move host ports that cannot be used as written and report every numeric
/// host port, moved or not.
///
/// Container-only entries, ranges and interpolated values are left alone.
pub fn reassign_host_ports(
    doc: &mut Value,
    allocator: &PortAllocator,
) -> std::io::Result<Vec<PortAssignment>> {
    let mut assignments = Vec::new();
    let mut claimed = HashSet::new();
    let Some(services) = doc.get_mut("services").and_then(Value::as_mapping_mut) else {
        return Ok(assignments);
    };

    for (name, service) in services.iter_mut() {
        let service_name = name.as_str().unwrap_or_default().to_string();
        let Some(ports) = service.get_mut("ports").and_then(Value::as_sequence_mut) else {
            continue;
        };
        for entry in ports.iter_mut() {
            let Some(requested) = published_port(entry) else {
                continue;
            };
            let host_port = if claimed.insert(requested) && allocator.is_free(requested) {
                requested
            } else {
                let port = next_free(allocator, &mut claimed)?;
                set_published_port(entry, port);
                port
            };
            assignments.push(PortAssignment {
                service: service_name.clone(),
                requested,
                host_port,
            });
        }
    }
    Ok(assignments)
}

fn next_free(allocator: &PortAllocator, claimed: &mut HashSet<u16>) -> std::io::Result<u16> {
    loop {
        let port = allocator.free_port()?;
        if claimed.insert(port) {
            return Ok(port);
        }
    }
}

/// Numeric host port of a short (`"8080:80"`, `"127.0.0.1:8080:80"`) or long
/// (`published: 8080`) port entry.
fn published_port(entry: &Value) -> Option<u16> {
    match entry {
        Value::String(spec) => {
            let (_, host, _) = split_short(spec)?;
            host.parse().ok()
        }
        Value::Mapping(map) => match map.get("published")? {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        },
        _ => None,
    }
}

fn set_published_port(entry: &mut Value, port: u16) {
    match entry {
        Value::String(spec) => {
            if let Some((ip, _, container)) = split_short(spec) {
                *spec = match ip {
                    Some(ip) => format!("{ip}:{port}:{container}"),
                    None => format!("{port}:{container}"),
                };
            }
        }
        Value::Mapping(map) => {
            map.insert(Value::from("published"), Value::from(port));
        }
        _ => {}
    }
}

fn split_short(spec: &str) -> Option<(Option<&str>, &str, &str)> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [host, container] => Some((None, *host, *container)),
        [ip, host, container] => Some((Some(*ip), *host, *container)),
        _ => None,
    }
}

/// Set `KEY=port` for each assignment, replacing existing definitions.
pub async fn upsert_env_ports(env_file: &Path, assignments: &[PortAssignment]) -> std::io::Result<()> {
    let existing = match tokio::fs::read_to_string(env_file).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    let mut lines: Vec<String> = existing.lines().map(String::from).collect();
    for assignment in assignments {
        let key = assignment.env_key();
        let entry = format!("{key}={}", assignment.host_port);
        let prefix = format!("{key}=");
        match lines.iter_mut().find(|l| l.trim_start().starts_with(&prefix)) {
            Some(line) => *line = entry,
            None => lines.push(entry),
        }
    }
    let mut content = lines.join("\n");
    content.push('\n');
    tokio::fs::write(env_file, content).await
}

// ---------------------------------------------------------------------------
// Security pass
// ---------------------------------------------------------------------------

/// Strip privilege escalation from every service and fill in resource
/// ceilings the descriptor leaves unset.
pub fn harden(doc: &mut Value, limits: &ResourceLimits) {
    let Some(services) = doc.get_mut("services").and_then(Value::as_mapping_mut) else {
        return;
    };
    for (_, service) in services.iter_mut() {
        let Some(service) = service.as_mapping_mut() else {
            continue;
        };
        for key in STRIPPED_KEYS {
            service.remove(key);
        }
        if let Some(pids) = limits.pids {
            service.insert(Value::from("pids_limit"), Value::from(pids));
        }

        let mut deploy = take_mapping(service, "deploy");
        let mut resources = take_mapping(&mut deploy, "resources");
        let mut ceilings = take_mapping(&mut resources, "limits");
        for (key, default) in [
            ("memory", limits.service_memory.as_str()),
            ("cpus", limits.service_cpus.as_str()),
        ] {
            if !ceilings.contains_key(key) {
                ceilings.insert(Value::from(key), Value::from(default));
            }
        }
        resources.insert(Value::from("limits"), Value::Mapping(ceilings));
        deploy.insert(Value::from("resources"), Value::Mapping(resources));
        service.insert(Value::from("deploy"), Value::Mapping(deploy));
    }
}

/// Remove and return the mapping under `key`; anything else is replaced by an empty one.
fn take_mapping(parent: &mut Mapping, key: &str) -> Mapping {
    match parent.remove(key) {
        Some(Value::Mapping(map)) => map,
        _ => Mapping::new(),
    }
}
