use serde::{Deserialize, Serialize};

pub const DEFAULT_MEMORY: &str = "1g";
pub const DEFAULT_CPUS: &str = "1";
pub const DEFAULT_PIDS: u32 = 512;
/// Per-service ceilings injected into compose descriptors.
pub const DEFAULT_SERVICE_MEMORY: &str = "512m";
pub const DEFAULT_SERVICE_CPUS: &str = "0.5";
/// Size of the scratch tmpfs mounted when the root filesystem is read-only.
pub const READ_ONLY_TMPFS: &str = "/tmp:rw,noexec,nosuid,size=100m";

/// Resource ceilings applied to every container of a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory ceiling in docker notation (`512m`, `1g`). Swap is pinned to the same value.
    pub memory: Option<String>,
    /// Fractional CPU count (`0.5`, `2`).
    pub cpus: Option<String>,
    pub pids: Option<u32>,
    pub network_mode: Option<String>,
    pub service_memory: String,
    pub service_cpus: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: Some(DEFAULT_MEMORY.to_string()),
            cpus: Some(DEFAULT_CPUS.to_string()),
            pids: Some(DEFAULT_PIDS),
            network_mode: None,
            service_memory: DEFAULT_SERVICE_MEMORY.to_string(),
            service_cpus: DEFAULT_SERVICE_CPUS.to_string(),
        }
    }
}

impl ResourceLimits {
    /// `docker run` / `docker update` flags for memory and CPU.
    pub fn resource_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(memory) = self.memory.as_deref().filter(|m| !m.is_empty()) {
            flags.push(format!("--memory={memory}"));
            flags.push(format!("--memory-swap={memory}"));
        }
        if let Some(cpus) = self.cpus.as_deref().filter(|c| !c.is_empty()) {
            flags.push(format!("--cpus={cpus}"));
        }
        flags
    }
}

/// Privilege restrictions applied to single-image containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOptions {
    pub no_new_privileges: bool,
    pub read_only_root: bool,
    pub drop_capabilities: Vec<String>,
    pub add_capabilities: Vec<String>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            no_new_privileges: true,
            read_only_root: false,
            drop_capabilities: vec!["ALL".to_string()],
            add_capabilities: ["CHOWN", "SETUID", "SETGID", "NET_BIND_SERVICE"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl SecurityOptions {
    /// `docker run` flags for these options plus the process-count ceiling.
    pub fn flags(&self, pids: Option<u32>) -> Vec<String> {
        let mut flags = Vec::new();
        if self.no_new_privileges {
            flags.push("--security-opt=no-new-privileges:true".to_string());
        }
        if self.read_only_root {
            flags.push("--read-only".to_string());
            flags.push("--tmpfs".to_string());
            flags.push(READ_ONLY_TMPFS.to_string());
        }
        flags.extend(self.drop_capabilities.iter().map(|c| format!("--cap-drop={c}")));
        flags.extend(self.add_capabilities.iter().map(|c| format!("--cap-add={c}")));
        if let Some(pids) = pids {
            flags.push(format!("--pids-limit={pids}"));
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_is_pinned_to_memory() {
        let flags = ResourceLimits::default().resource_flags();
        assert_eq!(flags, vec!["--memory=1g", "--memory-swap=1g", "--cpus=1"]);
    }

    #[test]
    fn empty_limits_produce_no_flags() {
        let limits = ResourceLimits {
            memory: None,
            cpus: Some(String::new()),
            ..ResourceLimits::default()
        };
        assert!(limits.resource_flags().is_empty());
    }

    #[test]
    fn default_security_drops_all_and_readds_allow_list() {
        let flags = SecurityOptions::default().flags(Some(64));
        assert_eq!(flags.first().map(String::as_str), Some("--security-opt=no-new-privileges:true"));
        assert!(flags.contains(&"--cap-drop=ALL".to_string()));
        assert!(flags.contains(&"--cap-add=NET_BIND_SERVICE".to_string()));
        assert!(flags.contains(&"--pids-limit=64".to_string()));
        assert!(!flags.contains(&"--read-only".to_string()));
    }

    #[test]
    fn read_only_root_mounts_scratch_tmpfs() {
        let security = SecurityOptions {
            read_only_root: true,
            ..SecurityOptions::default()
        };
        let flags = security.flags(None);
        let pos = flags.iter().position(|f| f == "--tmpfs").unwrap();
        assert_eq!(flags[pos + 1], READ_ONLY_TMPFS);
        assert!(flags.contains(&"--read-only".to_string()));
    }

    #[test]
    fn deserializes_partial_yaml_style_json() {
        let limits: ResourceLimits = serde_json::from_str(r#"{"memory": "256m"}"#).unwrap();
        assert_eq!(limits.memory.as_deref(), Some("256m"));
        assert_eq!(limits.cpus.as_deref(), Some(DEFAULT_CPUS));
    }
}
