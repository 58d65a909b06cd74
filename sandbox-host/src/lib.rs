pub mod command;
pub mod compose;
mod docker;
mod firewall;
mod git;
mod log;
pub mod ports;
mod prerequisites;
mod process;
mod runtime;
mod stats;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use command::{CommandError, Privilege};
pub use docker::DockerCli;
pub use firewall::{DEFAULT_CHAIN, IptablesFirewall, NoFirewall};
pub use git::GitCloner;
pub use log::{LOG_TIME_FORMAT, SandboxLog};
pub use ports::{PortAllocator, PortRange};
pub use prerequisites::check_prerequisites;
pub use process::EXIT_CODE_TIMEOUT;
pub use runtime::{
    ContainerRuntime, ReadinessPolicy, RuntimeSettings, RuntimeTimeouts, SandboxContext,
    services_ready,
};
pub use stats::{ContainerStats, parse_size, parse_stats};
