//! Static dependency analysis of a Python function.
//!
//! Starting from one top-level function, the analyzer follows every free
//! name to the module binding that satisfies it: helper functions, classes
//! and constants are pulled in transitively, imports are classified as
//! standard library, third party, local module or the filesystem accessor,
//! and local modules are bundled along with whatever they import in turn.
//! Sources are parsed with tree-sitter.

mod module;
mod python;
mod scope;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};
use crate::fs::{FsFunction, PYTHON_MODULE_NAME};

pub use python::Requirement;
pub use scope::{Loop, Parameter, ParameterKind};

use module::{Import, Module, Statement, StatementKind};
use python::Pins;
use scope::Scope;

/// The function to ship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionRef {
    /// A top-level function in a source file.
    Source { file: PathBuf, name: String },
    /// A function that only exists in an interactive session.
    Interactive { name: String },
}

impl FunctionRef {
    pub fn new(file: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        FunctionRef::Source {
            file: file.into(),
            name: name.into(),
        }
    }

    pub fn interactive(name: impl Into<String>) -> Self {
        FunctionRef::Interactive { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            FunctionRef::Source { name, .. } | FunctionRef::Interactive { name } => name,
        }
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FunctionRef::Source { file, name } => write!(f, "{}:{}", file.display(), name),
            FunctionRef::Interactive { name } => write!(f, "<interactive>:{}", name),
        }
    }
}

/// `path/to/file.py:function`
impl FromStr for FunctionRef {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((file, name)) if !file.is_empty() && !name.is_empty() => {
                Ok(FunctionRef::new(file, name))
            }
            _ => Err(ClusterError::Config(format!(
                "Function reference '{}' is not of the form FILE:FUNCTION",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFunction {
    pub name: String,
    /// Verbatim source, decorators included.
    pub source: String,
    pub file: PathBuf,
    pub line: usize,
    pub parameters: Vec<Parameter>,
    pub decorators: Vec<String>,
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportKind {
    Stdlib,
    ThirdParty { requirement: Requirement },
    Local { path: PathBuf },
    Accessor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub module: String,
    pub bound: Vec<String>,
    /// The statement as it should appear in the shipped entry module.
    pub statement: String,
    pub kind: ImportKind,
    pub line: usize,
    /// Inside a function body rather than at module level.
    pub nested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallableKind {
    Function,
    Class,
    Assignment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCallable {
    pub name: String,
    pub kind: CallableKind,
    pub source: String,
    pub line: usize,
    #[serde(skip)]
    position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalModule {
    pub path: PathBuf,
    /// Path relative to the entry function's directory.
    pub relative: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub literal: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsCallSite {
    pub function: FsFunction,
    pub arguments: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub entry: EntryFunction,
    pub source_dir: PathBuf,
    pub imports: Vec<ImportRecord>,
    pub callables: Vec<LocalCallable>,
    pub modules: Vec<LocalModule>,
    pub requirements: Vec<Requirement>,
    pub files: Vec<FileReference>,
    pub fs_calls: Vec<FsCallSite>,
    pub loops: Vec<Loop>,
    pub unresolved: Vec<String>,
    #[serde(skip)]
    entry_position: usize,
}

impl DependencyGraph {
    /// Accessor functions to inject into the entry namespace.
    pub fn fs_bindings(&self) -> BTreeSet<FsFunction> {
        self.fs_calls.iter().map(|c| c.function).collect()
    }

    /// The entry function's top-level loop over one of its parameters,
    /// together with that parameter.
    pub fn partitionable_loop(&self) -> Option<(&Loop, &Parameter)> {
        self.loops.iter().find_map(|l| {
            self.entry
                .parameters
                .iter()
                .filter(|p| matches!(p.kind, ParameterKind::Positional | ParameterKind::KeywordOnly))
                .find(|p| l.iterable.trim() == p.name)
                .map(|p| (l, p))
        })
    }

    /// Source of the shipped `entry.py`: imports, then helpers and the entry
    /// function in their original order.
    pub fn entry_module_source(&self) -> String {
        let mut out = String::new();
        let mut emitted = HashSet::new();
        for import in self.imports.iter().filter(|i| !i.nested) {
            if emitted.insert(import.statement.as_str()) {
                out.push_str(&import.statement);
                out.push('\n');
            }
        }
        let mut blocks: Vec<(usize, &str)> = self
            .callables
            .iter()
            .map(|c| (c.position, c.source.as_str()))
            .collect();
        blocks.push((self.entry_position, self.entry.source.as_str()));
        blocks.sort_by_key(|(position, _)| *position);
        for (_, source) in blocks {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(source);
            out.push('\n');
        }
        out
    }
}

/// Analyzes `function` and everything it needs.
pub fn analyze(function: &FunctionRef) -> Result<DependencyGraph> {
    let (file, name) = match function {
        FunctionRef::Interactive { name } => {
            return Err(ClusterError::SourceUnavailable {
                function: name.clone(),
                reason: "it was defined interactively and has no source file".to_string(),
            })
        }
        FunctionRef::Source { file, name } => (file, name),
    };
    let unavailable = |reason: String| ClusterError::SourceUnavailable {
        function: name.clone(),
        reason,
    };
    let file = file
        .canonicalize()
        .map_err(|e| unavailable(format!("cannot open {}: {}", file.display(), e)))?;
    let source = std::fs::read_to_string(&file)
        .map_err(|e| unavailable(format!("cannot read {}: {}", file.display(), e)))?;
    let module = Module::parse(&file, source)
        .map_err(|e| unavailable(format!("cannot parse {}: {}", file.display(), e)))?;
    let statement = module
        .function(name)
        .ok_or_else(|| unavailable(format!("no top-level function in {}", file.display())))?;

    let source_dir = module.directory().to_path_buf();
    let mut analyzer = Analyzer {
        root: source_dir.clone(),
        pins: Pins::load(&source_dir),
        visited: HashSet::new(),
        visited_modules: HashSet::new(),
        imports: vec![],
        callables: vec![],
        modules: vec![],
        requirements: BTreeMap::new(),
        files: vec![],
        fs_calls: vec![],
        unresolved: BTreeSet::new(),
    };
    analyzer.visited.insert((file.clone(), name.clone()));

    let node = module
        .node(statement)
        .ok_or_else(|| unavailable(format!("no top-level function in {}", file.display())))?;
    let scope = Scope::scan(&module.source, node);
    let loops = scope.loops.clone();
    let decorator_names = scope.decorator_names.clone();
    analyzer.follow(&module, &scope, name)?;

    if let Some(missing) = decorator_names
        .iter()
        .find(|n| analyzer.unresolved.contains(n.as_str()))
    {
        return Err(ClusterError::UnresolvedDependency {
            function: name.clone(),
            name: missing.clone(),
        });
    }

    let entry = EntryFunction {
        name: name.clone(),
        source: module.text(statement).to_string(),
        file: file.clone(),
        line: statement.line,
        parameters: scope.parameters.clone(),
        decorators: statement.decorators.clone(),
        is_async: matches!(statement.kind, StatementKind::Def { is_async: true, .. }),
    };

    let mut callables = analyzer.callables;
    callables.sort_by_key(|c| c.position);
    let mut imports = analyzer.imports;
    imports.sort_by_key(|i| (i.nested, i.line));
    let graph = DependencyGraph {
        entry,
        source_dir,
        imports,
        callables,
        modules: analyzer.modules,
        requirements: analyzer.requirements.into_values().collect(),
        files: analyzer.files,
        fs_calls: analyzer.fs_calls,
        loops,
        unresolved: analyzer.unresolved.into_iter().collect(),
        entry_position: statement.start,
    };
    debug!(
        function = %function,
        callables = graph.callables.len(),
        modules = graph.modules.len(),
        requirements = graph.requirements.len(),
        "Analyzed function"
    );
    Ok(graph)
}

struct Analyzer {
    root: PathBuf,
    pins: Pins,
    visited: HashSet<(PathBuf, String)>,
    visited_modules: HashSet<PathBuf>,
    imports: Vec<ImportRecord>,
    callables: Vec<LocalCallable>,
    modules: Vec<LocalModule>,
    requirements: BTreeMap<String, Requirement>,
    files: Vec<FileReference>,
    fs_calls: Vec<FsCallSite>,
    unresolved: BTreeSet<String>,
}

impl Analyzer {
    /// Records what one statement of the entry module needs.
    fn follow(&mut self, module: &Module, scope: &Scope, owner: &str) -> Result<()> {
        for (import, text, line) in &scope.imports {
            self.import(module, import, text, *line, true, owner)?;
        }
        for call in &scope.calls {
            if call.shadowed || !self.is_accessor(module, &call.name) {
                continue;
            }
            if let Some(function) = FsFunction::from_python_name(&call.name) {
                self.fs_calls.push(FsCallSite {
                    function,
                    arguments: call.arguments.clone(),
                    line: call.line,
                });
            }
        }
        for literal in &scope.literals {
            if !self.files.iter().any(|f| f.literal == literal.value) {
                self.files.push(FileReference {
                    literal: literal.value.clone(),
                    line: literal.line,
                });
            }
        }
        for (name, line) in scope.free_names() {
            self.resolve(module, name, line, owner)?;
        }
        Ok(())
    }

    /// Whether a free `name` means the accessor function of that name: it
    /// is imported from the accessor module, or nothing else defines it.
    /// A bare builtin such as `list` stays the builtin.
    fn is_accessor(&self, module: &Module, name: &str) -> bool {
        match module.binding(name).map(|s| &s.kind) {
            None => !python::is_builtin(name),
            Some(StatementKind::Import(import)) => import.root() == PYTHON_MODULE_NAME,
            Some(_) => false,
        }
    }

    fn resolve(&mut self, module: &Module, name: &str, line: usize, owner: &str) -> Result<()> {
        let statement = match module.binding(name) {
            Some(statement) => statement,
            None if python::is_builtin(name) => return Ok(()),
            None if FsFunction::from_python_name(name).is_some() => return Ok(()),
            None => {
                if self.unresolved.insert(name.to_string()) {
                    warn!(
                        name,
                        line,
                        function = owner,
                        "Name is not defined in the module; the remote call will fail if it is used"
                    );
                }
                return Ok(());
            }
        };
        match &statement.kind {
            StatementKind::Import(import) => {
                let text = module.text(statement).to_string();
                self.import(module, import, &text, statement.line, false, owner)
            }
            StatementKind::Def { is_class, .. } => {
                let kind = if *is_class {
                    CallableKind::Class
                } else {
                    CallableKind::Function
                };
                self.callable(module, statement, name, kind)
            }
            StatementKind::Assign { .. } => {
                self.callable(module, statement, name, CallableKind::Assignment)
            }
            StatementKind::Other => Ok(()),
        }
    }

    fn callable(
        &mut self,
        module: &Module,
        statement: &Statement,
        name: &str,
        kind: CallableKind,
    ) -> Result<()> {
        if !self.visited.insert((module.path.clone(), name.to_string())) {
            return Ok(());
        }
        // One statement may bind several names (`a = b = 1`).
        if !self.callables.iter().any(|c| c.position == statement.start) {
            self.callables.push(LocalCallable {
                name: name.to_string(),
                kind,
                source: module.text(statement).to_string(),
                line: statement.line,
                position: statement.start,
            });
        }
        match module.node(statement) {
            Some(node) => {
                let scope = Scope::scan(&module.source, node);
                self.follow(module, &scope, name)
            }
            None => Ok(()),
        }
    }

    fn import(
        &mut self,
        module: &Module,
        import: &Import,
        text: &str,
        line: usize,
        nested: bool,
        owner: &str,
    ) -> Result<()> {
        let kind = self.classify(module.directory(), import);
        let statement = if import.level == 0 {
            text.to_string()
        } else {
            rewrite_relative(import, module.directory(), &self.root).ok_or_else(|| {
                ClusterError::UnresolvedDependency {
                    function: owner.to_string(),
                    name: import.written_module(),
                }
            })?
        };
        if self
            .imports
            .iter()
            .any(|i| i.statement == statement && i.nested == nested)
        {
            return Ok(());
        }
        match &kind {
            ImportKind::ThirdParty { requirement } => {
                self.requirements
                    .entry(requirement.package.clone())
                    .or_insert_with(|| requirement.clone());
            }
            ImportKind::Local { .. } => self.bundle(module.directory(), import),
            ImportKind::Stdlib | ImportKind::Accessor => {}
        }
        self.imports.push(ImportRecord {
            module: if import.from {
                import.module.clone()
            } else {
                import.names.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", ")
            },
            bound: import.bound_names().map(str::to_string).collect(),
            statement,
            kind,
            line,
            nested,
        });
        Ok(())
    }

    fn classify(&self, dir: &Path, import: &Import) -> ImportKind {
        if let Some(path) = self.local_files(dir, import).into_iter().next() {
            return ImportKind::Local { path };
        }
        if import.level > 0 {
            // Relative import of something we cannot find; keep it local.
            return ImportKind::Local {
                path: dir.to_path_buf(),
            };
        }
        let root = import.root();
        if root == PYTHON_MODULE_NAME {
            ImportKind::Accessor
        } else if python::is_stdlib(root) {
            ImportKind::Stdlib
        } else {
            ImportKind::ThirdParty {
                requirement: self.pins.requirement(root),
            }
        }
    }

    /// Source files an import would load from the project, if any.
    fn local_files(&self, dir: &Path, import: &Import) -> Vec<PathBuf> {
        let base = if import.level > 0 {
            let mut base = dir.to_path_buf();
            for _ in 1..import.level {
                base.pop();
            }
            base
        } else {
            self.root.clone()
        };
        let mut files = vec![];
        for dotted in import.candidate_modules() {
            let mut path = base.clone();
            let parts: Vec<&str> = dotted.split('.').filter(|p| !p.is_empty()).collect();
            for (i, part) in parts.iter().enumerate() {
                path.push(part);
                let init = path.join("__init__.py");
                if i + 1 < parts.len() && init.is_file() && !files.contains(&init) {
                    files.push(init);
                }
            }
            for candidate in [path.with_extension("py"), path.join("__init__.py")] {
                if candidate.is_file() && !files.contains(&candidate) {
                    files.insert(0, candidate);
                }
            }
        }
        files
    }

    fn bundle(&mut self, dir: &Path, import: &Import) {
        for path in self.local_files(dir, import) {
            if !self.visited_modules.insert(path.clone()) {
                continue;
            }
            let relative = match path.strip_prefix(&self.root) {
                Ok(relative) if !escapes(relative) => relative.to_path_buf(),
                _ => {
                    warn!(path = %path.display(), "Local module is outside the source directory; not bundled");
                    continue;
                }
            };
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read local module");
                    continue;
                }
            };
            debug!(path = %relative.display(), "Bundling local module");
            self.modules.push(LocalModule {
                path: path.clone(),
                relative,
            });
            let parsed = match Module::parse(&path, source) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot scan local module imports");
                    continue;
                }
            };
            for nested_import in parsed.all_imports() {
                match self.classify(parsed.directory(), &nested_import) {
                    ImportKind::Local { .. } => self.bundle(parsed.directory(), &nested_import),
                    ImportKind::ThirdParty { requirement } => {
                        self.requirements
                            .entry(requirement.package.clone())
                            .or_insert(requirement);
                    }
                    ImportKind::Stdlib | ImportKind::Accessor => {}
                }
            }
        }
    }
}

fn escapes(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
}

/// Rewrites a relative import as an absolute one, since the shipped entry
/// module is not part of a package: `from .x import y` becomes
/// `from x import y`, and deeper levels gain the package path below the
/// source directory. `None` if the import reaches above it.
fn rewrite_relative(import: &Import, dir: &Path, root: &Path) -> Option<String> {
    let mut base = dir.to_path_buf();
    for _ in 1..import.level {
        if !base.pop() {
            return None;
        }
    }
    let package = base.strip_prefix(root).ok()?;
    if escapes(package) {
        return None;
    }
    let mut parts: Vec<String> = package
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if !import.module.is_empty() {
        parts.push(import.module.clone());
    }
    let module = parts.join(".");
    let names: Vec<String> = import
        .names
        .iter()
        .map(|n| {
            if n.bound == n.name {
                n.name.clone()
            } else {
                format!("{} as {}", n.name, n.bound)
            }
        })
        .collect();
    if module.is_empty() {
        Some(format!("import {}", names.join(", ")))
    } else if import.star {
        Some(format!("from {} import *", module))
    } else {
        Some(format!("from {} import {}", module, names.join(", ")))
    }
}
