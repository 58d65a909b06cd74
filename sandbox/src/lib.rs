mod backend;
mod config;
mod error;
mod types;

pub use backend::{
    CloneRequest, ContainerSpec, Firewall, ImageBuild, ImageBuilder, RepoCloner, StackFile,
    StackRunner,
};
pub use config::{
    DEFAULT_CPUS, DEFAULT_MEMORY, DEFAULT_PIDS, DEFAULT_SERVICE_CPUS, DEFAULT_SERVICE_MEMORY,
    READ_ONLY_TMPFS, ResourceLimits, SecurityOptions,
};
pub use error::{GENERIC_FAILURE_MESSAGE, Result, SandboxError};
pub use types::{
    ArtifactKind, BuildArtifact, BuildOutcome, CommandIo, CommandOutput, PortMapping, RunMode,
};
