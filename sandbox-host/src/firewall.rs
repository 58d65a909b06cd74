use async_trait::async_trait;
use sandbox::{Firewall, Result};
use tracing::{debug, trace};

use crate::command::{Privilege, QUERY_TIMEOUT, exec_ignore_errors, exec_within};

pub const DEFAULT_CHAIN: &str = "DOCKER-USER";

/// Comment prefix on every rule this process inserts.
const RULE_COMMENT_PREFIX: &str = "sandbox-";

/// ACCEPT rules for published ports in an iptables chain.
///
/// Rules carry a comment naming the owning sandbox, and removal deletes the
/// exact same rule spec.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    chain: String,
    privilege: Privilege,
}

impl IptablesFirewall {
    pub fn new(chain: impl Into<String>, privilege: Privilege) -> Self {
        Self {
            chain: chain.into(),
            privilege,
        }
    }

    /// Rule spec after the `-I`/`-D` chain argument.
    fn rule(port: u16, owner: &str) -> Vec<String> {
        [
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            format!("{RULE_COMMENT_PREFIX}{owner}"),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
        .into()
    }

    fn args(&self, op: &str, port: u16, owner: &str) -> Vec<String> {
        let mut args = vec![op.to_string(), self.chain.clone()];
        args.extend(Self::rule(port, owner));
        args
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn open(&self, port: u16, owner: &str) -> Result<()> {
        let args = self.args("-I", port, owner);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        exec_within("iptables", &args, self.privilege, QUERY_TIMEOUT).await?;
        debug!(port, owner, chain = %self.chain, "firewall port opened");
        Ok(())
    }

    async fn close(&self, port: u16, owner: &str) {
        let args = self.args("-D", port, owner);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        exec_ignore_errors("iptables", &args, self.privilege, QUERY_TIMEOUT).await;
        debug!(port, owner, chain = %self.chain, "firewall port closed");
    }
}

/// Used when firewall management is disabled; ports stay reachable only if
/// the host policy already allows them.
#[derive(Debug, Default, Clone)]
pub struct NoFirewall;

#[async_trait]
impl Firewall for NoFirewall {
    async fn open(&self, port: u16, owner: &str) -> Result<()> {
        trace!(port, owner, "firewall disabled, open skipped");
        Ok(())
    }

    async fn close(&self, port: u16, owner: &str) {
        trace!(port, owner, "firewall disabled, close skipped");
    }
}
