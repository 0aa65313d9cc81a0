use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use clusterfn::analyzer::{self, FunctionRef};
use clusterfn::cluster;
use clusterfn::config::{Command, Config, RunArgs};
use clusterfn::error::{ClusterError, Result};
use clusterfn::fs::FileSystem;
use clusterfn::package;
use clusterfn::sync::Cancellation;
use clusterfn::target::{load_targets, select_target, ExecutionTarget};

fn target(cli: &Config) -> Result<ExecutionTarget> {
    if !cli.targets_file.exists() && cli.target.is_none() {
        debug!(file = %cli.targets_file.display(), "No targets file, running locally");
        return Ok(ExecutionTarget::local(std::env::temp_dir().join("clusterfn")));
    }
    select_target(load_targets(&cli.targets_file)?, cli.target.as_deref())
}

async fn run(mut target: ExecutionTarget, args: &RunArgs) -> Result<()> {
    if args.keep_remote {
        target.options.keep_remote = true;
    }
    let cancellation = Cancellation::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} Interrupted, cancelling jobs", "[clusterfn]".yellow().bold());
            on_interrupt.cancel();
        }
    });

    let mut builder = cluster(args.function.parse::<FunctionRef>()?, Arc::new(target))
        .resources(args.resources())
        .cancellation(cancellation);
    if let Some(partitions) = args.parallel_loop {
        builder = builder.parallel_loop(partitions);
    }
    let function = builder.build()?;
    eprintln!(
        "{} Running {} on {}",
        "[clusterfn]".bold(),
        function.function().to_string().cyan(),
        function.target().name.cyan()
    );
    let value = function.call_value(args.call.parse()?).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn analyze(spec: &str) -> Result<()> {
    let graph = analyzer::analyze(&spec.parse::<FunctionRef>()?)?;
    let yaml = serde_yaml::to_string(&graph)
        .map_err(|e| ClusterError::Orchestration(format!("failed to print graph: {}", e)))?;
    print!("{}", yaml);
    Ok(())
}

fn package(
    target: &ExecutionTarget,
    spec: &str,
    out: &Path,
    arguments: package::CallArguments,
) -> Result<()> {
    let graph = analyzer::analyze(&spec.parse::<FunctionRef>()?)?;
    let package = package::build(&graph, target, arguments)?;
    let path = package.write_to(out)?;
    eprintln!(
        "{} Wrote {} ({} bytes)",
        "[clusterfn]".bold(),
        path.display().to_string().green(),
        package.archive.len()
    );
    println!("{}", package.content_id());
    Ok(())
}

async fn execute(cli: &Config) -> Result<()> {
    let target = target(cli)?;
    match &cli.command {
        Command::Run(args) => run(target, args).await,
        Command::Analyze { function } => analyze(function),
        Command::Package { function, out, call } => package(&target, function, out, call.parse()?),
        Command::Ls { path } => {
            let fs = FileSystem::connect(Arc::new(target)).await?;
            for name in fs.list(path).await? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Find { pattern, path } => {
            let fs = FileSystem::connect(Arc::new(target)).await?;
            for found in fs.find(pattern, path).await? {
                println!("{}", found);
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clusterfn=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Config::parse();
    match execute(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_remote_failure() {
                eprintln!("{} The function raised remotely: {}", "[clusterfn]".red().bold(), e);
            } else {
                eprintln!("{} {}", "[clusterfn]".red().bold(), e);
            }
            if matches!(e, ClusterError::Cancelled) {
                warn!("Call cancelled");
            }
            ExitCode::FAILURE
        }
    }
}
