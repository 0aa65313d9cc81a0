//! Command line arguments.
//!
//! Targets themselves live in the targets file (see `target.rs`); the flags
//! here only pick one and override its resources for a single call.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::error::Result;
use crate::package::CallArguments;
use crate::target::ResourceRequest;

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    /// Targets file to use. Defaults to `targets.yaml`
    #[arg(long, global = true, default_value = "targets.yaml")]
    pub targets_file: PathBuf,

    /// Name of the target to use. Defaults to the first one in the file
    #[arg(long, short, global = true)]
    pub target: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a function on the target and print its JSON result
    Run(RunArgs),
    /// Print the dependency graph of a function
    Analyze {
        /// Function as FILE:NAME
        function: String,
    },
    /// Build a function's package and write the archive locally
    Package {
        /// Function as FILE:NAME
        function: String,

        /// Directory to write the archive to
        #[arg(long, default_value = ".")]
        out: PathBuf,

        #[command(flatten)]
        call: CallArgs,
    },
    /// List a directory on the target
    Ls {
        #[arg(default_value = ".")]
        path: String,
    },
    /// Find files on the target by name pattern
    Find {
        pattern: String,

        #[arg(default_value = ".")]
        path: String,
    },
}

#[derive(Args)]
pub struct CallArgs {
    /// Positional arguments as a JSON array
    #[arg(long)]
    pub args: Option<String>,

    /// Keyword arguments as a JSON object
    #[arg(long)]
    pub kwargs: Option<String>,
}

impl CallArgs {
    pub fn parse(&self) -> Result<CallArguments> {
        CallArguments::from_json(self.args.as_deref(), self.kwargs.as_deref())
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Function as FILE:NAME
    pub function: String,

    #[command(flatten)]
    pub call: CallArgs,

    /// Cores per job
    #[arg(long)]
    pub cores: Option<u32>,

    /// Memory per job, e.g. `512M` or `4G`
    #[arg(long)]
    pub memory: Option<String>,

    /// Wall time per job as `MM`, `HH:MM:SS` or `D-HH:MM:SS`
    #[arg(long)]
    pub time: Option<String>,

    /// Scheduler queue or partition
    #[arg(long)]
    pub queue: Option<String>,

    /// Split the function's top-level loop over this many jobs
    #[arg(long, short = 'p')]
    pub parallel_loop: Option<usize>,

    /// Leave job and environment directories on the target
    #[arg(long)]
    pub keep_remote: bool,
}

impl RunArgs {
    pub fn resources(&self) -> ResourceRequest {
        ResourceRequest {
            cores: self.cores,
            memory: self.memory.clone(),
            time: self.time.clone(),
            queue: self.queue.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags() {
        let config = Config::parse_from([
            "clusterfn",
            "--target",
            "gpu",
            "run",
            "jobs.py:square_all",
            "--args",
            "[[1, 2, 3]]",
            "--cores",
            "4",
            "-p",
            "3",
        ]);
        assert_eq!(config.target.as_deref(), Some("gpu"));
        assert_eq!(config.targets_file, PathBuf::from("targets.yaml"));
        let Command::Run(run) = config.command else {
            panic!("expected run");
        };
        assert_eq!(run.parallel_loop, Some(3));
        assert_eq!(run.resources().cores, Some(4));
        assert!(run.call.parse().is_ok());
    }

    #[test]
    fn test_ls_defaults_to_work_dir() {
        let config = Config::parse_from(["clusterfn", "ls"]);
        assert!(matches!(config.command, Command::Ls { path } if path == "."));
    }
}
