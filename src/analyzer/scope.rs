//! Name binding and reference analysis of one top-level statement.
//!
//! Every function, lambda, class body and comprehension gets its own frame.
//! A name bound anywhere in a frame is local to that whole frame, and a
//! reference is free when no enclosing function frame binds it. Class
//! bodies are only visible to code directly inside them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tree_sitter::Node;

use crate::analyzer::module::{line, text, Import};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Positional,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    pub has_default: bool,
}

/// A call whose callee is a bare name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub name: String,
    /// Source text between the parentheses.
    pub arguments: String,
    pub line: usize,
    /// The callee resolves to a binding inside the statement itself.
    pub shadowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub value: String,
    pub line: usize,
}

/// A `for` statement directly in a function body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub target: String,
    pub iterable: String,
    pub line: usize,
}

#[derive(Debug, Default)]
pub struct Scope {
    /// Parameters of the statement's own `def`.
    pub parameters: Vec<Parameter>,
    pub decorator_names: Vec<String>,
    pub calls: Vec<Call>,
    pub literals: Vec<Literal>,
    pub loops: Vec<Loop>,
    /// Imports inside the statement, with their text and line.
    pub imports: Vec<(Import, String, usize)>,
    free: Vec<(String, usize)>,
}

impl Scope {
    /// Scans a top-level statement node.
    pub fn scan(source: &str, node: Node) -> Scope {
        let mut walker = Walker {
            source,
            frames: vec![Frame::new(FrameKind::Module, None)],
            references: vec![],
            scope: Scope::default(),
            in_decorator: false,
        };
        let definition = match node.kind() {
            "decorated_definition" => {
                let mut cursor = node.walk();
                for decorator in node.named_children(&mut cursor) {
                    if decorator.kind() == "decorator" {
                        walker.in_decorator = true;
                        walker.children(decorator, 0);
                        walker.in_decorator = false;
                    }
                }
                node.child_by_field_name("definition")
            }
            _ => Some(node),
        };
        if let Some(definition) = definition {
            if definition.kind() == "function_definition" {
                walker.scope.parameters = walker.function(definition, 0);
                if let Some(body) = definition.child_by_field_name("body") {
                    walker.scope.loops = top_level_loops(body, source);
                }
            } else {
                walker.visit(definition, 0);
            }
        }
        walker.finish()
    }

    /// Referenced names not bound by the statement, in first-use order.
    pub fn free_names(&self) -> Vec<(&str, usize)> {
        self.free
            .iter()
            .map(|(name, line)| (name.as_str(), *line))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Module,
    Function,
    Class,
    Comprehension,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    parent: Option<usize>,
    bound: HashSet<String>,
    globals: HashSet<String>,
    nonlocals: HashSet<String>,
}

impl Frame {
    fn new(kind: FrameKind, parent: Option<usize>) -> Self {
        Self {
            kind,
            parent,
            bound: HashSet::new(),
            globals: HashSet::new(),
            nonlocals: HashSet::new(),
        }
    }
}

struct Reference {
    name: String,
    line: usize,
    frame: usize,
    call: Option<usize>,
    decorator: bool,
}

struct Walker<'s> {
    source: &'s str,
    frames: Vec<Frame>,
    references: Vec<Reference>,
    scope: Scope,
    in_decorator: bool,
}

impl<'s> Walker<'s> {
    fn push_frame(&mut self, kind: FrameKind, parent: usize) -> usize {
        self.frames.push(Frame::new(kind, Some(parent)));
        self.frames.len() - 1
    }

    fn bind(&mut self, node: Node, frame: usize) {
        let name = text(node, self.source).to_string();
        self.frames[frame].bound.insert(name);
    }

    fn reference(&mut self, node: Node, frame: usize, call: Option<usize>) {
        self.references.push(Reference {
            name: text(node, self.source).to_string(),
            line: line(node),
            frame,
            call,
            decorator: self.in_decorator,
        });
    }

    fn children(&mut self, node: Node, frame: usize) {
        let mut cursor = node.walk();
        let children: Vec<Node> = node.named_children(&mut cursor).collect();
        for child in children {
            self.visit(child, frame);
        }
    }

    fn field(&mut self, node: Node, field: &str, frame: usize) {
        if let Some(child) = node.child_by_field_name(field) {
            self.visit(child, frame);
        }
    }

    fn visit(&mut self, node: Node, frame: usize) {
        match node.kind() {
            "identifier" => self.reference(node, frame, None),
            "comment" | "keyword_separator" | "positional_separator" => {}
            "attribute" => self.field(node, "object", frame),
            "keyword_argument" => self.field(node, "value", frame),
            "call" => self.call(node, frame),
            "string" => self.string(node, frame),
            "decorated_definition" => {
                let mut cursor = node.walk();
                let children: Vec<Node> = node.named_children(&mut cursor).collect();
                for child in children {
                    match child.kind() {
                        "decorator" => self.children(child, frame),
                        _ => self.visit(child, frame),
                    }
                }
            }
            "function_definition" => {
                self.function(node, frame);
            }
            "lambda" => {
                let inner = self.push_frame(FrameKind::Function, frame);
                if let Some(parameters) = node.child_by_field_name("parameters") {
                    self.parameters(parameters, frame, inner);
                }
                self.field(node, "body", inner);
            }
            "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.bind(name, frame);
                }
                self.field(node, "superclasses", frame);
                let inner = self.push_frame(FrameKind::Class, frame);
                self.field(node, "body", inner);
            }
            "list_comprehension"
            | "set_comprehension"
            | "dictionary_comprehension"
            | "generator_expression" => self.comprehension(node, frame),
            "assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.target(left, frame);
                }
                self.field(node, "type", frame);
                self.field(node, "right", frame);
            }
            "augmented_assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    if left.kind() == "identifier" {
                        self.bind(left, frame);
                    }
                    self.visit(left, frame);
                }
                self.field(node, "right", frame);
            }
            "named_expression" => {
                // `:=` binds in the enclosing function, even from a comprehension.
                let mut owner = frame;
                while self.frames[owner].kind == FrameKind::Comprehension {
                    owner = self.frames[owner].parent.unwrap_or(0);
                }
                if let Some(name) = node.child_by_field_name("name") {
                    self.bind(name, owner);
                }
                self.field(node, "value", frame);
            }
            "for_statement" | "for_in_clause" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.target(left, frame);
                }
                let mut cursor = node.walk();
                let rest: Vec<Node> = node
                    .named_children(&mut cursor)
                    .filter(|child| Some(*child) != node.child_by_field_name("left"))
                    .collect();
                for child in rest {
                    self.visit(child, frame);
                }
            }
            "as_pattern" => {
                if let Some(value) = node.named_child(0) {
                    self.visit(value, frame);
                }
                if let Some(alias) = node.child_by_field_name("alias") {
                    self.target(alias, frame);
                }
            }
            "except_clause" | "except_group_clause" => self.except(node, frame),
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                if let Some(import) = Import::from_node(node, self.source) {
                    for name in import.bound_names() {
                        self.frames[frame].bound.insert(name.to_string());
                    }
                    self.scope.imports.push((
                        import,
                        text(node, self.source).to_string(),
                        line(node),
                    ));
                }
            }
            "global_statement" | "nonlocal_statement" => {
                let mut cursor = node.walk();
                let names: Vec<String> = node
                    .named_children(&mut cursor)
                    .filter(|child| child.kind() == "identifier")
                    .map(|child| text(child, self.source).to_string())
                    .collect();
                let declared = if node.kind() == "global_statement" {
                    &mut self.frames[frame].globals
                } else {
                    &mut self.frames[frame].nonlocals
                };
                declared.extend(names);
            }
            "case_clause" => {
                let mut cursor = node.walk();
                let children: Vec<Node> = node.named_children(&mut cursor).collect();
                for child in children {
                    match child.kind() {
                        "case_pattern" => self.pattern(child, frame),
                        _ => self.visit(child, frame),
                    }
                }
            }
            _ => self.children(node, frame),
        }
    }

    /// Visits a `def`, returning its parameters.
    fn function(&mut self, node: Node, frame: usize) -> Vec<Parameter> {
        if let Some(name) = node.child_by_field_name("name") {
            self.bind(name, frame);
        }
        self.field(node, "return_type", frame);
        let inner = self.push_frame(FrameKind::Function, frame);
        let parameters = match node.child_by_field_name("parameters") {
            Some(parameters) => self.parameters(parameters, frame, inner),
            None => vec![],
        };
        self.field(node, "body", inner);
        parameters
    }

    /// Binds parameter names in `inner`; defaults and annotations are
    /// evaluated in `outer`.
    fn parameters(&mut self, node: Node, outer: usize, inner: usize) -> Vec<Parameter> {
        let mut parameters = vec![];
        let mut keyword_only = false;
        let mut cursor = node.walk();
        let children: Vec<Node> = node.named_children(&mut cursor).collect();
        for child in children {
            let (name, kind, has_default) = match child.kind() {
                "identifier" => (Some(child), None, false),
                "default_parameter" | "typed_default_parameter" => {
                    self.field(child, "type", outer);
                    self.field(child, "value", outer);
                    (child.child_by_field_name("name"), None, true)
                }
                "typed_parameter" => {
                    self.field(child, "type", outer);
                    match child.named_child(0) {
                        Some(inner_node) => match splat(inner_node) {
                            Some(kind) => (inner_node.named_child(0), Some(kind), false),
                            None => (Some(inner_node), None, false),
                        },
                        None => (None, None, false),
                    }
                }
                "list_splat_pattern" | "dictionary_splat_pattern" => {
                    (child.named_child(0), splat(child), false)
                }
                "keyword_separator" => {
                    keyword_only = true;
                    continue;
                }
                _ => continue,
            };
            let Some(name) = name.filter(|n| n.kind() == "identifier") else {
                continue;
            };
            let kind = match kind {
                Some(kind) => {
                    if kind == ParameterKind::VarPositional {
                        keyword_only = true;
                    }
                    kind
                }
                None if keyword_only => ParameterKind::KeywordOnly,
                None => ParameterKind::Positional,
            };
            self.bind(name, inner);
            parameters.push(Parameter {
                name: text(name, self.source).to_string(),
                kind,
                has_default,
            });
        }
        parameters
    }

    /// The first iterable runs in the enclosing frame; everything else in
    /// the comprehension's own.
    fn comprehension(&mut self, node: Node, frame: usize) {
        let inner = self.push_frame(FrameKind::Comprehension, frame);
        let mut cursor = node.walk();
        let children: Vec<Node> = node.named_children(&mut cursor).collect();
        let mut first = true;
        for child in &children {
            if child.kind() != "for_in_clause" {
                continue;
            }
            if let Some(left) = child.child_by_field_name("left") {
                self.target(left, inner);
            }
            let mut cursor = child.walk();
            let iterables: Vec<Node> = child.children_by_field_name("right", &mut cursor).collect();
            for iterable in iterables {
                self.visit(iterable, if first { frame } else { inner });
            }
            first = false;
        }
        for child in children {
            if child.kind() != "for_in_clause" {
                self.visit(child, inner);
            }
        }
    }

    /// Binds the plain names of an assignment or loop target and visits the
    /// rest as expressions.
    fn target(&mut self, node: Node, frame: usize) {
        match node.kind() {
            "identifier" => self.bind(node, frame),
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "parenthesized_expression" | "list_splat_pattern" | "list_splat"
            | "as_pattern_target" => {
                let mut cursor = node.walk();
                let children: Vec<Node> = node.named_children(&mut cursor).collect();
                for child in children {
                    self.target(child, frame);
                }
            }
            _ => self.visit(node, frame),
        }
    }

    fn except(&mut self, node: Node, frame: usize) {
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        let mut after_as = false;
        for child in children {
            if child.kind() == "as" {
                after_as = true;
                continue;
            }
            if !child.is_named() {
                continue;
            }
            if after_as {
                self.target(child, frame);
                after_as = false;
            } else {
                self.visit(child, frame);
            }
        }
    }

    /// `case` patterns: bare names capture, dotted names and class
    /// patterns refer to existing values.
    fn pattern(&mut self, node: Node, frame: usize) {
        match node.kind() {
            "identifier" => self.bind(node, frame),
            "dotted_name" => {
                let mut cursor = node.walk();
                let parts: Vec<Node> = node.named_children(&mut cursor).collect();
                match parts.as_slice() {
                    [single] => self.bind(*single, frame),
                    [head, ..] => self.reference(*head, frame, None),
                    [] => {}
                }
            }
            "class_pattern" => {
                let mut cursor = node.walk();
                let children: Vec<Node> = node.named_children(&mut cursor).collect();
                for (i, child) in children.into_iter().enumerate() {
                    if i == 0 && child.kind() == "dotted_name" {
                        if let Some(head) = child.named_child(0) {
                            self.reference(head, frame, None);
                        }
                    } else {
                        self.pattern(child, frame);
                    }
                }
            }
            "keyword_pattern" => {
                let mut cursor = node.walk();
                let children: Vec<Node> = node.named_children(&mut cursor).skip(1).collect();
                for child in children {
                    self.pattern(child, frame);
                }
            }
            "as_pattern" => {
                if let Some(value) = node.named_child(0) {
                    self.pattern(value, frame);
                }
                if let Some(alias) = node.child_by_field_name("alias") {
                    self.target(alias, frame);
                }
            }
            "string" | "concatenated_string" | "integer" | "float" | "true" | "false"
            | "none" => {}
            _ => {
                let mut cursor = node.walk();
                let children: Vec<Node> = node.named_children(&mut cursor).collect();
                for child in children {
                    self.pattern(child, frame);
                }
            }
        }
    }

    fn call(&mut self, node: Node, frame: usize) {
        let function = node.child_by_field_name("function");
        let arguments = node.child_by_field_name("arguments");
        match function {
            Some(callee) if callee.kind() == "identifier" => {
                let inside = arguments
                    .map(|args| {
                        let range = args.byte_range();
                        let start = (range.start + 1).min(range.end);
                        let end = range.end.saturating_sub(1).max(start);
                        self.source[start..end].trim().to_string()
                    })
                    .unwrap_or_default();
                self.scope.calls.push(Call {
                    name: text(callee, self.source).to_string(),
                    arguments: inside,
                    line: line(callee),
                    shadowed: false,
                });
                let index = self.scope.calls.len() - 1;
                self.reference(callee, frame, Some(index));
            }
            Some(callee) => self.visit(callee, frame),
            None => {}
        }
        if let Some(arguments) = arguments {
            self.visit(arguments, frame);
        }
    }

    fn string(&mut self, node: Node, frame: usize) {
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        let prefix = children
            .iter()
            .find(|c| c.kind() == "string_start")
            .map(|c| text(*c, self.source).to_ascii_lowercase())
            .unwrap_or_default();
        if prefix.contains('f') {
            // Only the interpolations matter.
            for child in children {
                if child.kind() == "interpolation" {
                    self.children(child, frame);
                }
            }
            return;
        }
        if prefix.contains('b') || !self.standalone(node) {
            return;
        }
        let start = children.iter().find(|c| c.kind() == "string_start");
        let end = children.iter().find(|c| c.kind() == "string_end");
        let (Some(start), Some(end)) = (start, end) else {
            return;
        };
        let value = &self.source[start.end_byte()..end.start_byte().max(start.end_byte())];
        if !value.contains('\\') && looks_like_path(value) {
            self.scope.literals.push(Literal {
                value: value.to_string(),
                line: line(node),
            });
        }
    }

    /// Not a docstring and not part of a larger string expression.
    fn standalone(&self, node: Node) -> bool {
        let Some(parent) = node.parent() else {
            return true;
        };
        match parent.kind() {
            "concatenated_string" => false,
            "expression_statement" => parent.named_child_count() > 1,
            "attribute" => parent.child_by_field_name("object") != Some(node),
            "binary_operator" => !matches!(
                parent
                    .child_by_field_name("operator")
                    .map(|op| text(op, self.source)),
                Some("+") | Some("%")
            ),
            _ => true,
        }
    }

    fn is_free(&self, name: &str, from: usize) -> bool {
        let mut current = Some(from);
        while let Some(index) = current {
            let frame = &self.frames[index];
            match frame.kind {
                FrameKind::Module => return true,
                FrameKind::Class if index != from => {}
                _ => {
                    if frame.globals.contains(name) {
                        return true;
                    }
                    if frame.nonlocals.contains(name) || frame.bound.contains(name) {
                        return false;
                    }
                }
            }
            current = frame.parent;
        }
        true
    }

    fn finish(mut self) -> Scope {
        let mut seen = HashSet::new();
        let references = std::mem::take(&mut self.references);
        for reference in references {
            let free = self.is_free(&reference.name, reference.frame);
            if let Some(call) = reference.call {
                self.scope.calls[call].shadowed = !free;
            }
            if !free {
                continue;
            }
            if reference.decorator {
                self.scope.decorator_names.push(reference.name.clone());
            }
            if seen.insert(reference.name.clone()) {
                self.scope.free.push((reference.name, reference.line));
            }
        }
        self.scope
    }
}

fn splat(node: Node) -> Option<ParameterKind> {
    match node.kind() {
        "list_splat_pattern" => Some(ParameterKind::VarPositional),
        "dictionary_splat_pattern" => Some(ParameterKind::VarKeyword),
        _ => None,
    }
}

fn top_level_loops(body: Node, source: &str) -> Vec<Loop> {
    let mut cursor = body.walk();
    body.named_children(&mut cursor)
        .filter(|statement| statement.kind() == "for_statement")
        .filter_map(|statement| {
            Some(Loop {
                target: text(statement.child_by_field_name("left")?, source).to_string(),
                iterable: text(statement.child_by_field_name("right")?, source).to_string(),
                line: line(statement),
            })
        })
        .collect()
}

/// Whether a string literal plausibly names a file or directory.
pub fn looks_like_path(value: &str) -> bool {
    if value.is_empty()
        || value.len() > 1024
        || matches!(value, "." | ".." | "/" | "./")
        || value.contains("://")
        || value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "{}%<>|*?[]$\"'`".contains(c))
    {
        return false;
    }
    if value.contains('/') {
        return true;
    }
    match value.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 8
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && ext.chars().any(|c| c.is_ascii_alphabetic())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::module::Module;

    fn scan(src: &str) -> Scope {
        let module = Module::parse("/src/job.py", src.to_string()).unwrap();
        let statement = module.statements.last().unwrap();
        Scope::scan(&module.source, module.node(statement).unwrap())
    }

    fn free(scope: &Scope) -> Vec<&str> {
        scope.free_names().into_iter().map(|(n, _)| n).collect()
    }

    #[test]
    fn test_free_names() {
        let scope = scan(
            "def target(x, *rest, scale=FACTOR, **kw):\n    import math\n    y = helper(x) + math.pi\n    total: float = 0\n    for i, v in enumerate(rest):\n        total += v * i\n    squares = [k * k for k in range(y)]\n    with open(PATH) as fh:\n        data = fh.read()\n    f = lambda a, b=OFFSET: a + b\n    return obj.attr, config(key=value)\n",
        );
        assert_eq!(
            free(&scope),
            vec![
                "FACTOR", "helper", "float", "enumerate", "range", "open", "PATH", "OFFSET",
                "obj", "config", "value"
            ]
        );
        let names: Vec<&str> = scope.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["x", "rest", "scale", "kw"]);
        assert_eq!(scope.parameters[1].kind, ParameterKind::VarPositional);
        assert_eq!(scope.parameters[2].kind, ParameterKind::KeywordOnly);
        assert!(scope.parameters[2].has_default);
        assert_eq!(scope.parameters[3].kind, ParameterKind::VarKeyword);
        assert_eq!(scope.imports.len(), 1);
    }

    #[test]
    fn test_inner_bindings_do_not_hide_outer_references() {
        let scope = scan(
            "def f(xs):\n    g = [h(x) for h, x in xs]\n    k = lambda helper: helper\n    def inner(total):\n        return total\n    return h(1) + helper(2) + total\n",
        );
        assert_eq!(free(&scope), vec!["h", "helper", "total"]);
        let calls: Vec<(&str, bool)> = scope
            .calls
            .iter()
            .map(|c| (c.name.as_str(), c.shadowed))
            .collect();
        assert_eq!(
            calls,
            vec![("h", true), ("h", false), ("helper", false)]
        );
    }

    #[test]
    fn test_enclosing_functions_and_classes() {
        let scope = scan(
            "def outer(n):\n    limit = n\n    class Box:\n        size = limit\n        def grow(self):\n            return size + limit\n    def count():\n        nonlocal n\n        global TOTAL\n        TOTAL += n\n        return [y for y in range(limit) if (last := y)]\n    return Box, count, last\n",
        );
        assert_eq!(free(&scope), vec!["size", "TOTAL", "range", "last"]);
    }

    #[test]
    fn test_calls_and_shadowing() {
        let scope = scan(
            "def job(path):\n    files = find(\"*.csv\", path)\n    def stat(p):\n        return 0\n    return stat(files[0])\n",
        );
        let find = scope.calls.iter().find(|c| c.name == "find").unwrap();
        assert_eq!(find.arguments, "\"*.csv\", path");
        assert!(!find.shadowed);
        let stat = scope.calls.iter().find(|c| c.name == "stat").unwrap();
        assert!(stat.shadowed);
    }

    #[test]
    fn test_literals() {
        let scope = scan(
            "def job(name):\n    \"\"\"Reads data/input.csv.\"\"\"\n    a = open(\"data/input.csv\")\n    b = f\"data/{name}.csv\"\n    c = \"data/\" + name\n    d = \"utf-8\"\n    e = \"config.yaml\"\n    return a, b, c, d, e\n",
        );
        let values: Vec<&str> = scope.literals.iter().map(|l| l.value.as_str()).collect();
        assert_eq!(values, vec!["data/input.csv", "config.yaml"]);
        assert_eq!(free(&scope), vec!["open"]);
    }

    #[test]
    fn test_loops_and_decorators() {
        let scope = scan(
            "@retry(times=LIMIT)\ndef job(items, n):\n    out = []\n    for item in items:\n        for j in range(n):\n            out.append(item)\n    return out\n",
        );
        assert_eq!(scope.decorator_names, vec!["retry", "LIMIT"]);
        assert_eq!(
            scope.loops,
            vec![Loop {
                target: "item".to_string(),
                iterable: "items".to_string(),
                line: 4,
            }]
        );
    }

    #[test]
    fn test_looks_like_path() {
        assert!(looks_like_path("data/"));
        assert!(looks_like_path("weights.pt"));
        assert!(looks_like_path("/abs/file"));
        assert!(!looks_like_path("hello world.txt"));
        assert!(!looks_like_path("utf-8"));
        assert!(!looks_like_path("*.csv"));
        assert!(!looks_like_path("https://example.com/x"));
        assert!(!looks_like_path("3.14"));
    }
}
