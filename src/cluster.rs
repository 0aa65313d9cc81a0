//! The decorator-style entry point.
//!
//! ```no_run
//! # async fn demo() -> clusterfn::error::Result<()> {
//! use std::sync::Arc;
//! use clusterfn::{cluster, CallArguments, ExecutionTarget, FunctionRef};
//!
//! let target = Arc::new(ExecutionTarget::local("/tmp/clusterfn"));
//! let square_all = cluster(FunctionRef::new("jobs.py", "square_all"), target)
//!     .cores(4)
//!     .parallel_loop(3)
//!     .build()?;
//! let squares: Vec<i64> = square_all
//!     .call(CallArguments::new().arg(vec![1, 2, 3, 4, 5, 6]))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::analyzer::{self, DependencyGraph, FunctionRef};
use crate::environment::EnvironmentBuilder;
use crate::error::{ClusterError, Result};
use crate::orchestrator::{LoopPartitioning, Orchestrator};
use crate::package::{self, CallArguments};
use crate::scheduler::{Scheduler, SchedulerAdapter};
use crate::session::{self, Channel};
use crate::sync::Cancellation;
use crate::target::{ExecutionTarget, ResourceRequest};

/// Starts wrapping `function` for execution on `target`.
pub fn cluster(function: FunctionRef, target: Arc<ExecutionTarget>) -> ClusterFunctionBuilder {
    ClusterFunctionBuilder {
        function,
        target,
        resources: ResourceRequest::default(),
        parallel_loop: None,
        cancellation: Cancellation::new(),
    }
}

pub struct ClusterFunctionBuilder {
    function: FunctionRef,
    target: Arc<ExecutionTarget>,
    resources: ResourceRequest,
    parallel_loop: Option<usize>,
    cancellation: Cancellation,
}

impl ClusterFunctionBuilder {
    pub fn cores(mut self, cores: u32) -> Self {
        self.resources.cores = Some(cores);
        self
    }

    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.resources.memory = Some(memory.into());
        self
    }

    pub fn time(mut self, time: impl Into<String>) -> Self {
        self.resources.time = Some(time.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.resources.queue = Some(queue.into());
        self
    }

    /// Overrides every resource field that `resources` sets.
    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = self.resources.merged(&resources);
        self
    }

    /// Spreads the function's top-level loop over `partitions` jobs.
    pub fn parallel_loop(mut self, partitions: usize) -> Self {
        self.parallel_loop = Some(partitions);
        self
    }

    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn build(self) -> Result<ClusterFunction> {
        if self.parallel_loop == Some(0) {
            return Err(ClusterError::Config(
                "parallel_loop needs at least one partition".to_string(),
            ));
        }
        let resources = self.target.resources.merged(&self.resources);
        resources.memory_mib()?;
        resources.time_seconds()?;
        Ok(ClusterFunction {
            function: self.function,
            target: self.target,
            resources,
            parallel_loop: self.parallel_loop,
            cancellation: self.cancellation,
        })
    }
}

/// A function bound to a target.
pub struct ClusterFunction {
    function: FunctionRef,
    target: Arc<ExecutionTarget>,
    resources: ResourceRequest,
    parallel_loop: Option<usize>,
    cancellation: Cancellation,
}

impl ClusterFunction {
    pub fn function(&self) -> &FunctionRef {
        &self.function
    }

    pub fn target(&self) -> &Arc<ExecutionTarget> {
        &self.target
    }

    /// Runs the function remotely and decodes its return value.
    pub async fn call<T: DeserializeOwned>(&self, arguments: CallArguments) -> Result<T> {
        let value = self.call_value(arguments).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_value(&self, arguments: CallArguments) -> Result<Value> {
        let prepared = self.prepare(arguments).await?;
        let channel = session::connect(&self.target).await?;
        let scheduler: Arc<dyn SchedulerAdapter> =
            Arc::new(Scheduler::for_target(self.target.clone(), channel.clone()));
        let result = self.execute(prepared, channel.clone(), scheduler).await;
        if let Err(e) = channel.close().await {
            warn!(target = %self.target.name, error = %e, "Failed to close channel");
        }
        result
    }

    /// Like `call_value`, over an already established channel and adapter.
    pub async fn call_with(
        &self,
        arguments: CallArguments,
        channel: Arc<dyn Channel>,
        scheduler: Arc<dyn SchedulerAdapter>,
    ) -> Result<Value> {
        let prepared = self.prepare(arguments).await?;
        self.execute(prepared, channel, scheduler).await
    }

    /// Everything that can fail before touching the target. Analysis and
    /// packaging read and compress local files, so they run off the
    /// async workers.
    async fn prepare(&self, arguments: CallArguments) -> Result<Prepared> {
        let function = self.function.clone();
        let target = self.target.clone();
        let parallel_loop = self.parallel_loop;
        tokio::task::spawn_blocking(move || prepare(&function, &target, parallel_loop, arguments))
            .await
            .map_err(|e| ClusterError::Orchestration(format!("failed to prepare the call: {}", e)))?
    }

    async fn execute(
        &self,
        prepared: Prepared,
        channel: Arc<dyn Channel>,
        scheduler: Arc<dyn SchedulerAdapter>,
    ) -> Result<Value> {
        let Prepared {
            package,
            partitioning,
        } = prepared;
        let builder = EnvironmentBuilder::new(self.target.clone(), channel.clone());
        let env = builder.build(&package).await?;
        let orchestrator = Orchestrator::new(self.target.clone(), channel, scheduler)?
            .with_cancellation(self.cancellation.clone());
        let result = match &partitioning {
            Some(partitioning) => {
                orchestrator
                    .run_partitioned(&env, &package.manifest, &self.resources, partitioning)
                    .await
            }
            None => orchestrator.run(&env, &package.manifest, &self.resources).await,
        };
        if let Err(e) = builder.teardown(&env).await {
            warn!(env = %env.env_dir.display(), error = %e, "Failed to remove environment");
        }
        if result.is_ok() {
            info!(function = %package.manifest.function, target = %self.target.name, "Call succeeded");
        }
        result
    }
}

struct Prepared {
    package: package::Package,
    partitioning: Option<LoopPartitioning>,
}

fn prepare(
    function: &FunctionRef,
    target: &ExecutionTarget,
    parallel_loop: Option<usize>,
    arguments: CallArguments,
) -> Result<Prepared> {
    let graph = analyzer::analyze(function)?;
    let partitioning = match parallel_loop {
        Some(partitions) => Some(partitioning(&graph, &arguments, partitions)?),
        None => None,
    };
    let package = package::build(&graph, target, arguments)?;
    Ok(Prepared {
        package,
        partitioning,
    })
}

fn partitioning(
    graph: &DependencyGraph,
    arguments: &CallArguments,
    partitions: usize,
) -> Result<LoopPartitioning> {
    let (found, parameter) = graph.partitionable_loop().ok_or_else(|| {
        ClusterError::Config(format!(
            "function '{}' has no top-level for loop over one of its parameters",
            graph.entry.name
        ))
    })?;
    let slot = arguments
        .slot(&graph.entry.parameters, &parameter.name)
        .ok_or_else(|| {
            ClusterError::Config(format!(
                "the loop on line {} iterates over '{}', which this call does not pass",
                found.line, parameter.name
            ))
        })?;
    if !matches!(arguments.get(&slot), Some(Value::Array(_))) {
        return Err(ClusterError::Config(format!(
            "argument '{}' must be a list to be partitioned",
            parameter.name
        )));
    }
    Ok(LoopPartitioning {
        parameter: parameter.name.clone(),
        slot,
        partitions,
    })
}
