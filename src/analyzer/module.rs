//! Outline of a module's top-level statements.

use std::ops::Range;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tree_sitter::{Node, Parser, Tree};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("tree-sitter language init failed: {0}")]
    Language(#[from] tree_sitter::LanguageError),
    #[error("tree-sitter parse failed")]
    Parse,
    #[error("syntax error at line {0}")]
    Syntax(usize),
}

/// Source text of `node`.
pub fn text<'s>(node: Node, source: &'s str) -> &'s str {
    &source[node.byte_range()]
}

/// 1-based line `node` starts on.
pub fn line(node: Node) -> usize {
    node.start_position().row + 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedName {
    /// Dotted name as written after `import` or after `from … import`.
    pub name: String,
    /// Name the statement binds in the importing namespace.
    pub bound: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Module after `from`, or empty for `import a.b` forms where each name
    /// is itself a module.
    pub module: String,
    /// Leading dots of a relative import.
    pub level: usize,
    pub names: Vec<ImportedName>,
    pub star: bool,
    pub from: bool,
}

impl Import {
    /// Reads an `import`, `from … import` or `from __future__ import` node.
    pub fn from_node(node: Node, source: &str) -> Option<Import> {
        let from = match node.kind() {
            "import_statement" => false,
            "import_from_statement" | "future_import_statement" => true,
            _ => return None,
        };
        let (module, level) = match node.child_by_field_name("module_name") {
            Some(name) if name.kind() == "relative_import" => relative(name, source),
            Some(name) => (dotted(name, source), 0),
            None if from => ("__future__".to_string(), 0),
            None => (String::new(), 0),
        };
        let mut cursor = node.walk();
        let names = node
            .children_by_field_name("name", &mut cursor)
            .filter_map(|name| imported_name(name, source, from))
            .collect();
        let mut cursor = node.walk();
        let star = node
            .named_children(&mut cursor)
            .any(|child| child.kind() == "wildcard_import");
        Some(Import {
            module,
            level,
            names,
            star,
            from,
        })
    }

    pub fn bound_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| n.bound.as_str())
    }

    /// Dotted modules this statement may load, most specific first.
    pub fn candidate_modules(&self) -> Vec<String> {
        if !self.from {
            return self.names.iter().map(|n| n.name.clone()).collect();
        }
        let mut modules: Vec<String> = self
            .names
            .iter()
            .map(|n| {
                if self.module.is_empty() {
                    n.name.clone()
                } else {
                    format!("{}.{}", self.module, n.name)
                }
            })
            .collect();
        if !self.module.is_empty() {
            modules.push(self.module.clone());
        }
        modules
    }

    /// Top-level package for absolute imports.
    pub fn root(&self) -> &str {
        let dotted = if self.from {
            self.module.as_str()
        } else {
            self.names.first().map_or("", |n| n.name.as_str())
        };
        dotted.split('.').next().unwrap_or("")
    }

    /// The module as written, leading dots included.
    pub fn written_module(&self) -> String {
        format!("{}{}", ".".repeat(self.level), self.module)
    }
}

/// `a . b` → `a.b`
fn dotted(node: Node, source: &str) -> String {
    text(node, source)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\\')
        .collect()
}

fn relative(node: Node, source: &str) -> (String, usize) {
    let mut level = 0;
    let mut module = String::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "import_prefix" => level = text(child, source).matches('.').count(),
            "dotted_name" => module = dotted(child, source),
            _ => {}
        }
    }
    (module, level)
}

fn imported_name(node: Node, source: &str, from: bool) -> Option<ImportedName> {
    let (name, alias) = match node.kind() {
        "aliased_import" => (
            dotted(node.child_by_field_name("name")?, source),
            Some(text(node.child_by_field_name("alias")?, source).to_string()),
        ),
        "dotted_name" | "identifier" => (dotted(node, source), None),
        _ => return None,
    };
    let bound = match alias {
        Some(alias) => alias,
        // `import a.b` binds `a`
        None if !from => name.split('.').next().unwrap_or_default().to_string(),
        None => name.clone(),
    };
    Some(ImportedName { name, bound })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Def {
        name: String,
        is_async: bool,
        is_class: bool,
    },
    Import(Import),
    Assign {
        names: Vec<String>,
    },
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    /// Position among the module node's named children.
    pub index: usize,
    /// Decorator lines as written.
    pub decorators: Vec<String>,
    pub start: usize,
    pub end: usize,
    pub line: usize,
}

impl Statement {
    pub fn binds(&self, name: &str) -> bool {
        match &self.kind {
            StatementKind::Def { name: def, .. } => def == name,
            StatementKind::Import(import) => import.bound_names().any(|b| b == name),
            StatementKind::Assign { names } => names.iter().any(|n| n == name),
            StatementKind::Other => false,
        }
    }

    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// A parsed Python source file.
pub struct Module {
    pub path: PathBuf,
    pub source: String,
    tree: Tree,
    pub statements: Vec<Statement>,
}

impl Module {
    pub fn parse(path: impl Into<PathBuf>, source: String) -> Result<Self, ParseError> {
        let mut parser = Parser::new();
        parser.set_language(&tree_sitter_python::LANGUAGE.into())?;
        let tree = parser.parse(&source, None).ok_or(ParseError::Parse)?;
        let root = tree.root_node();
        if root.has_error() {
            return Err(ParseError::Syntax(first_error(root).map_or(1, line)));
        }
        let statements = outline(root, &source);
        Ok(Self {
            path: path.into(),
            source,
            tree,
            statements,
        })
    }

    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn text(&self, statement: &Statement) -> &str {
        &self.source[statement.span()]
    }

    /// Syntax node of a top-level statement, decorators included.
    pub fn node(&self, statement: &Statement) -> Option<Node<'_>> {
        self.tree.root_node().named_child(statement.index)
    }

    /// The top-level `def` or `async def` named `name`.
    pub fn function(&self, name: &str) -> Option<&Statement> {
        self.statements.iter().find(|s| {
            matches!(&s.kind, StatementKind::Def { name: n, is_class: false, .. } if n == name)
        })
    }

    /// The last top-level statement binding `name`, which is the binding in
    /// effect once the module has run.
    pub fn binding(&self, name: &str) -> Option<&Statement> {
        self.statements.iter().rev().find(|s| s.binds(name))
    }

    /// Every import in the file, top-level or nested.
    pub fn all_imports(&self) -> Vec<Import> {
        let mut imports = vec![];
        let mut stack = vec![self.tree.root_node()];
        while let Some(node) = stack.pop() {
            if let Some(import) = Import::from_node(node, &self.source) {
                imports.push(import);
                continue;
            }
            let mut cursor = node.walk();
            let mut children: Vec<Node> = node.named_children(&mut cursor).collect();
            children.reverse();
            stack.extend(children);
        }
        imports
    }
}

fn first_error(root: Node) -> Option<Node> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return Some(node);
        }
        if node.has_error() {
            let mut cursor = node.walk();
            let mut children: Vec<Node> = node.children(&mut cursor).collect();
            children.reverse();
            stack.extend(children);
        }
    }
    None
}

fn outline(root: Node, source: &str) -> Vec<Statement> {
    let mut statements = vec![];
    let mut cursor = root.walk();
    for (index, node) in root.named_children(&mut cursor).enumerate() {
        if node.kind() == "comment" {
            continue;
        }
        let (definition, decorators) = match node.kind() {
            "decorated_definition" => {
                let mut cursor = node.walk();
                let decorators = node
                    .named_children(&mut cursor)
                    .filter(|child| child.kind() == "decorator")
                    .map(|decorator| text(decorator, source).to_string())
                    .collect();
                match node.child_by_field_name("definition") {
                    Some(definition) => (definition, decorators),
                    None => continue,
                }
            }
            _ => (node, vec![]),
        };
        statements.push(Statement {
            kind: classify(definition, source),
            index,
            decorators,
            start: node.start_byte(),
            end: node.end_byte(),
            line: line(node),
        });
    }
    statements
}

fn classify(node: Node, source: &str) -> StatementKind {
    match node.kind() {
        "function_definition" | "class_definition" => match node.child_by_field_name("name") {
            Some(name) => StatementKind::Def {
                name: text(name, source).to_string(),
                is_async: node.child(0).map_or(false, |first| first.kind() == "async"),
                is_class: node.kind() == "class_definition",
            },
            None => StatementKind::Other,
        },
        "import_statement" | "import_from_statement" | "future_import_statement" => {
            match Import::from_node(node, source) {
                Some(import) => StatementKind::Import(import),
                None => StatementKind::Other,
            }
        }
        "expression_statement" => {
            let names = node
                .named_child(0)
                .filter(|child| child.kind() == "assignment")
                .map(|assignment| assignment_targets(assignment, source))
                .unwrap_or_default();
            if names.is_empty() {
                StatementKind::Other
            } else {
                StatementKind::Assign { names }
            }
        }
        _ => StatementKind::Other,
    }
}

/// Names bound by a plain, chained or annotated assignment.
fn assignment_targets(assignment: Node, source: &str) -> Vec<String> {
    let mut names = vec![];
    let mut current = Some(assignment);
    while let Some(node) = current.filter(|n| n.kind() == "assignment") {
        if let Some(left) = node.child_by_field_name("left") {
            target_names(left, source, &mut names);
        }
        current = node.child_by_field_name("right");
    }
    names
}

/// Plain names in an assignment target, skipping attributes and subscripts.
fn target_names(node: Node, source: &str, names: &mut Vec<String>) {
    match node.kind() {
        "identifier" => names.push(text(node, source).to_string()),
        "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
        | "parenthesized_expression" | "list_splat_pattern" | "list_splat" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                target_names(child, source, names);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"import os, numpy as np
from .helpers import (scale,
    offset as shift)
from pkg.sub import *

LIMIT: int = 10
a = b = 3

@decorator
@other.thing(1)
def helper(x):
    return x + 1

class Model(Base):
    pass

async def fetch():
    return 1

if __name__ == "__main__":
    helper(1)
"#;

    fn module() -> Module {
        Module::parse("/src/job.py", SOURCE.to_string()).unwrap()
    }

    #[test]
    fn test_outline() {
        let module = module();
        let kinds: Vec<&StatementKind> = module.statements.iter().map(|s| &s.kind).collect();
        assert_eq!(kinds.len(), 9);
        assert!(matches!(kinds[8], StatementKind::Other));
        let helper = module.function("helper").unwrap();
        assert_eq!(helper.decorators, vec!["@decorator", "@other.thing(1)"]);
        assert_eq!(helper.line, 9);
        assert!(module.text(helper).starts_with("@decorator"));
        assert!(module.text(helper).ends_with("return x + 1"));
        assert_eq!(module.node(helper).unwrap().kind(), "decorated_definition");
        assert!(module.function("Model").is_none());
        assert!(matches!(
            &module.binding("Model").unwrap().kind,
            StatementKind::Def { is_class: true, .. }
        ));
        assert!(matches!(
            &module.function("fetch").unwrap().kind,
            StatementKind::Def { is_async: true, .. }
        ));
        assert!(module.binding("LIMIT").is_some());
        assert!(module.binding("a").is_some());
        assert!(module.binding("b").is_some());
    }

    #[test]
    fn test_imports() {
        let module = module();
        let np = module.binding("np").unwrap();
        match &np.kind {
            StatementKind::Import(import) => {
                assert_eq!(import.root(), "os");
                assert_eq!(import.names[1].name, "numpy");
                assert!(!import.from);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &module.binding("shift").unwrap().kind {
            StatementKind::Import(import) => {
                assert_eq!(import.level, 1);
                assert_eq!(import.module, "helpers");
                assert_eq!(import.names[1].name, "offset");
                assert_eq!(import.written_module(), ".helpers");
                assert_eq!(
                    import.candidate_modules(),
                    vec!["helpers.scale", "helpers.offset", "helpers"]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        let star = module.all_imports().into_iter().find(|i| i.star).unwrap();
        assert_eq!(star.module, "pkg.sub");
    }

    #[test]
    fn test_assignment_targets() {
        let module = Module::parse(
            "/src/t.py",
            "x, self.y, z[0] = values\ntotal: float\nprint(x == 1)\n".to_string(),
        )
        .unwrap();
        assert!(module.binding("x").is_some());
        assert!(module.binding("y").is_none());
        assert!(module.binding("z").is_none());
        assert!(module.binding("total").is_some());
        assert!(matches!(module.statements[2].kind, StatementKind::Other));
    }

    #[test]
    fn test_syntax_errors_are_reported() {
        match Module::parse("/src/bad.py", "def f(:\n    return 1\n".to_string()) {
            Err(ParseError::Syntax(line)) => assert_eq!(line, 1),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("parsed invalid source"),
        }
    }
}
