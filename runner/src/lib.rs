//! Sandbox lifecycle engine: admission control, repository acquisition,
//! build orchestration and scheduled teardown on top of `sandbox-host`.

pub mod config;
pub mod env;
pub mod error;
pub mod lock;
pub mod logtail;
pub mod meta;
pub mod orchestrator;
pub mod paths;
pub mod ratelimit;
pub mod repo;
pub mod schedule;
pub mod session;
pub mod store;

pub use error::{RunnerError, RunnerResult};
pub use orchestrator::{
    BuildRequest, BuildResult, ProgressSink, SandboxOrchestrator, SandboxStatus, SweepReport,
};
