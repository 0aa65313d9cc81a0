//! clusterfn: Run Python functions on SSH hosts and HPC schedulers.

// Serde helper module.
mod serde;
// Command line arguments.
pub mod config;
// How to parse and represent execution targets.
pub mod target;
// Shell channels to targets.
pub mod session;
// Error handling.
pub mod error;
// Unified filesystem accessor.
pub mod fs;
// Dependency analysis of Python functions.
pub mod analyzer;
// Packaging a function and its dependencies.
pub mod package;
// Synchronization primitives.
pub mod sync;
// Remote interpreter environments.
pub mod environment;
// Job specs, states and artifacts.
pub mod job;
// Rendering the remote bootstrap.
pub mod bootstrap;
// Scheduler adapters.
pub mod scheduler;
// Submitting, polling and reconciling jobs.
pub mod orchestrator;
// The decorator-style entry point.
pub mod cluster;

pub use analyzer::{analyze, DependencyGraph, FunctionRef};
pub use cluster::{cluster, ClusterFunction, ClusterFunctionBuilder};
pub use environment::{EnvironmentBuilder, RemoteEnvironmentHandle};
pub use error::{ClusterError, FsError};
pub use fs::FileSystem;
pub use job::{JobId, JobResult, JobSpec, JobState, JobStatus};
pub use orchestrator::{LoopPartitioning, Orchestrator};
pub use package::{CallArguments, Package, PackageManifest};
pub use scheduler::{Scheduler, SchedulerAdapter};
pub use session::{Channel, CommandOutput, LocalChannel};
pub use sync::Cancellation;
pub use target::{ExecutionTarget, ResourceRequest, TargetKind, TargetOptions};
