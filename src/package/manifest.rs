use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::analyzer::{Parameter, ParameterKind, Requirement};
use crate::error::{ClusterError, Result};
use crate::fs::FsFunction;

pub const FORMAT_VERSION: u32 = 1;

/// JSON-encoded arguments of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Where a parameter's value sits in a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentSlot {
    Positional(usize),
    Keyword(String),
}

impl CallArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Parses `[1, 2]` / `{"k": 3}` style JSON from the command line.
    pub fn from_json(args: Option<&str>, kwargs: Option<&str>) -> Result<Self> {
        let args = match args {
            Some(text) => match serde_json::from_str(text)? {
                Value::Array(values) => values,
                other => vec![other],
            },
            None => vec![],
        };
        let kwargs = match kwargs {
            Some(text) => match serde_json::from_str(text)? {
                Value::Object(map) => map,
                _ => {
                    return Err(ClusterError::Config(
                        "Keyword arguments must be a JSON object".to_string(),
                    ))
                }
            },
            None => Map::new(),
        };
        Ok(Self { args, kwargs })
    }

    /// Finds the value bound to `name`.
    pub fn slot(&self, parameters: &[Parameter], name: &str) -> Option<ArgumentSlot> {
        if self.kwargs.contains_key(name) {
            return Some(ArgumentSlot::Keyword(name.to_string()));
        }
        let position = parameters
            .iter()
            .take_while(|p| p.kind == ParameterKind::Positional)
            .position(|p| p.name == name)?;
        (position < self.args.len()).then_some(ArgumentSlot::Positional(position))
    }

    pub fn get(&self, slot: &ArgumentSlot) -> Option<&Value> {
        match slot {
            ArgumentSlot::Positional(i) => self.args.get(*i),
            ArgumentSlot::Keyword(k) => self.kwargs.get(k),
        }
    }

    /// A copy with the value at `slot` replaced.
    pub fn replaced(&self, slot: &ArgumentSlot, value: Value) -> Self {
        let mut out = self.clone();
        match slot {
            ArgumentSlot::Positional(i) => out.args[*i] = value,
            ArgumentSlot::Keyword(k) => {
                out.kwargs.insert(k.clone(), value);
            }
        }
        out
    }
}

/// One slice of a partitioned loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub index: usize,
    pub count: usize,
    pub parameter: String,
}

/// Describes a package. One copy is the archive's `manifest.json`; each
/// job directory gets its own copy carrying that job's arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub format_version: u32,
    pub content_id: String,
    pub function: String,
    pub entry_module: String,
    pub is_async: bool,
    pub members: Vec<String>,
    pub requirements: Vec<Requirement>,
    pub fs_bindings: Vec<FsFunction>,
    pub arguments: CallArguments,
    pub partition: Option<Partition>,
    /// Directory the in-job accessor resolves relative paths against.
    /// Only job copies carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_root: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl PackageManifest {
    /// The manifest for one job: same package, different arguments.
    pub fn for_job(&self, arguments: CallArguments, partition: Option<Partition>) -> Self {
        Self {
            arguments,
            partition,
            ..self.clone()
        }
    }

    /// The same manifest with accessor calls rooted at `dir`.
    pub fn rooted_at(&self, dir: &Path) -> Self {
        Self {
            fs_root: Some(dir.to_path_buf()),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
