//! Name resolution, type inference and per-module checks.
//!
//! A [`Checker`] borrows the global [`Environment`] and checks one module
//! at a time. Its output for a module depends only on that module's
//! extraction and the environment, which is what lets rechecks replace a
//! module's diagnostics and call edges without touching the rest.

use std::collections::{HashMap, HashSet, VecDeque};

use super::environment::{Entry, Environment, ParamSignature, Symbol, SymbolKind};
use super::types::{Diagnostic, DiagnosticCode, Type};
use crate::graph::EdgeKind;
use crate::parser::{CallSite, ClassDef, Expr, FunctionDef, ModuleExtraction, Position};

/// Alias and inference chains longer than this resolve to `Unknown`.
const MAX_DEPTH: usize = 16;

/// Builtins that denote a concrete type.
fn builtin_type(name: &str) -> Option<Type> {
    match name {
        "int" => Some(Type::Int),
        "float" => Some(Type::Float),
        "str" => Some(Type::Str),
        "bool" => Some(Type::Bool),
        "bytes" => Some(Type::Bytes),
        "object" => Some(Type::Object),
        "None" => Some(Type::NoneType),
        _ => None,
    }
}

const TYPE_NAMES: &[&str] = &["int", "float", "str", "bool", "bytes", "object", "None"];

/// Other names that are always defined. They type as `Unknown`.
const BUILTIN_NAMES: &[&str] = &[
    "Any", "Callable", "ClassVar", "Dict", "Final", "FrozenSet", "Generator", "Iterable",
    "Iterator", "List", "Literal", "Mapping", "Optional", "Sequence", "Set", "Tuple", "Type",
    "Union", "BaseException", "Exception", "KeyError", "RuntimeError", "TypeError",
    "ValueError", "NotImplemented", "Ellipsis", "abs", "bytearray", "classmethod", "complex",
    "dict", "enumerate", "filter", "frozenset", "getattr", "hasattr", "hash", "id", "isinstance",
    "iter", "len", "list", "map", "max", "min", "next", "open", "print", "property", "range",
    "repr", "set", "setattr", "sorted", "staticmethod", "sum", "super", "tuple", "type", "zip",
];

fn builtin_name(name: &str) -> Option<&'static str> {
    TYPE_NAMES
        .iter()
        .chain(BUILTIN_NAMES)
        .find(|b| **b == name)
        .copied()
}

/// Split `a, b[c, d], e` on top-level occurrences of `separator`.
fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(text[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Outcome of resolving a dotted name in some module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved<'a> {
    Symbol(&'a Symbol),
    Module(&'a str),
    Builtin(&'static str),
    /// Defined somewhere the analyzer cannot see.
    External,
    Undefined,
}

enum CallTarget<'a> {
    Class(&'a Symbol),
    /// `bound` is true when the receiver supplies the first parameter.
    Function { symbol: &'a Symbol, bound: bool },
    Builtin(&'static str),
    Unknown,
}

type Scope = HashMap<String, Type>;

/// Diagnostics and outgoing call-graph edges for one module.
#[derive(Debug, Default)]
pub struct ModuleReport {
    pub diagnostics: Vec<Diagnostic>,
    pub edges: Vec<(String, String, EdgeKind)>,
}

pub struct Checker<'a> {
    env: &'a Environment,
}

impl<'a> Checker<'a> {
    pub fn new(env: &'a Environment) -> Self {
        Self { env }
    }

    pub fn resolve(&self, module: &str, dotted: &str) -> Resolved<'a> {
        let mut parts = dotted.split('.');
        let head = parts.next().unwrap_or_default();
        let mut current = match self.env.member(module, head) {
            Some(symbol) => self.follow(symbol, 0),
            None => match builtin_name(head) {
                Some(builtin) => Resolved::Builtin(builtin),
                None => Resolved::Undefined,
            },
        };
        for segment in parts {
            current = self.attribute(current, segment);
        }
        current
    }

    fn follow(&self, symbol: &'a Symbol, depth: usize) -> Resolved<'a> {
        let SymbolKind::Alias { target } = &symbol.kind else {
            return Resolved::Symbol(symbol);
        };
        if depth >= MAX_DEPTH {
            return Resolved::External;
        }
        match self.env.lookup(target) {
            Some(Entry::Symbol(next)) => self.follow(next, depth + 1),
            Some(Entry::Module(module)) => Resolved::Module(module),
            // Either a third-party import or one already reported as undefined.
            None => Resolved::External,
        }
    }

    fn attribute(&self, base: Resolved<'a>, name: &str) -> Resolved<'a> {
        match base {
            Resolved::Module(module) => match self.env.lookup(&format!("{module}.{name}")) {
                Some(Entry::Symbol(symbol)) => self.follow(symbol, 0),
                Some(Entry::Module(sub)) => Resolved::Module(sub),
                None => Resolved::Undefined,
            },
            Resolved::Symbol(class @ Symbol { kind: SymbolKind::Class { .. }, .. }) => self
                .env
                .member(&class.module, &format!("{}.{}", class.local, name))
                .map(Resolved::Symbol)
                .unwrap_or(Resolved::External),
            Resolved::Undefined => Resolved::Undefined,
            _ => Resolved::External,
        }
    }

    /// Classes in method resolution order, starting with `class` itself.
    /// The flag is set when some base could not be resolved to a project
    /// class.
    fn ancestors(&self, class: &'a Symbol) -> (Vec<&'a Symbol>, bool) {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut open_ended = false;
        let mut queue = VecDeque::from([class]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.name.as_str()) {
                continue;
            }
            order.push(current);
            let SymbolKind::Class { bases, .. } = &current.kind else {
                continue;
            };
            for base in bases {
                match self.resolve(&current.module, base) {
                    Resolved::Symbol(parent @ Symbol { kind: SymbolKind::Class { .. }, .. }) => {
                        queue.push_back(parent)
                    }
                    Resolved::Builtin("object") => {}
                    _ => open_ended = true,
                }
            }
        }
        (order, open_ended)
    }

    fn class_member(&self, class: &'a Symbol, name: &str) -> Option<&'a Symbol> {
        self.ancestors(class).0.into_iter().find_map(|ancestor| {
            self.env
                .member(&ancestor.module, &format!("{}.{}", ancestor.local, name))
        })
    }

    fn class_symbol(&self, qualified: &str) -> Option<&'a Symbol> {
        match self.env.lookup(qualified)? {
            Entry::Symbol(symbol @ Symbol { kind: SymbolKind::Class { .. }, .. }) => Some(symbol),
            _ => None,
        }
    }

    /// Type denoted by an annotation, or `None` if it names nothing.
    pub fn annotation(&self, module: &str, text: &str) -> Option<Type> {
        let text = text.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        let alternatives = split_top_level(text, '|');
        if alternatives.len() > 1 {
            for part in alternatives {
                self.annotation(module, part)?;
            }
            return Some(Type::Unknown);
        }
        if text.starts_with('[') && text.ends_with(']') {
            for part in split_top_level(&text[1..text.len() - 1], ',') {
                self.annotation(module, part)?;
            }
            return Some(Type::Unknown);
        }
        if let Some(open) = text.find('[') {
            let head = &text[..open];
            self.annotation(module, head)?;
            let literal = matches!(self.resolve(module, head), Resolved::Builtin("Literal"));
            if !literal && text.ends_with(']') {
                for part in split_top_level(&text[open + 1..text.len() - 1], ',') {
                    if part != "..." {
                        self.annotation(module, part)?;
                    }
                }
            }
            return Some(Type::Unknown);
        }
        match self.resolve(module, text) {
            Resolved::Symbol(Symbol {
                kind: SymbolKind::Class { .. },
                name,
                ..
            }) => Some(Type::Instance(name.clone())),
            Resolved::Builtin(name) => Some(builtin_type(name).unwrap_or(Type::Unknown)),
            Resolved::Undefined => None,
            _ => Some(Type::Unknown),
        }
    }

    /// Type of a symbol when used as a value.
    pub fn symbol_type(&self, symbol: &'a Symbol) -> Type {
        self.value_type(Resolved::Symbol(symbol), 0)
    }

    fn value_type(&self, resolved: Resolved<'a>, depth: usize) -> Type {
        match resolved {
            Resolved::Symbol(symbol) => match &symbol.kind {
                SymbolKind::Class { .. } => Type::ClassObject(symbol.name.clone()),
                SymbolKind::Function { .. } => Type::Callable(symbol.name.clone()),
                SymbolKind::Variable { .. } => self.variable_type(symbol, depth + 1),
                SymbolKind::Alias { .. } => self.value_type(self.follow(symbol, 0), depth + 1),
            },
            Resolved::Module(module) => Type::Module(module.to_string()),
            Resolved::Builtin("None") => Type::NoneType,
            _ => Type::Unknown,
        }
    }

    fn variable_type(&self, symbol: &'a Symbol, depth: usize) -> Type {
        if depth >= MAX_DEPTH {
            return Type::Unknown;
        }
        match &symbol.kind {
            SymbolKind::Variable {
                annotation: Some(annotation),
                ..
            } => self
                .annotation(&symbol.module, annotation)
                .unwrap_or(Type::Unknown),
            SymbolKind::Variable { value, .. } => {
                self.expr_type(&symbol.module, value, &Scope::new(), depth)
            }
            _ => Type::Unknown,
        }
    }

    fn expr_type(&self, module: &str, expr: &Expr, scope: &Scope, depth: usize) -> Type {
        match expr {
            Expr::Int => Type::Int,
            Expr::Float => Type::Float,
            Expr::Str => Type::Str,
            Expr::Bytes => Type::Bytes,
            Expr::Bool => Type::Bool,
            Expr::NoneLiteral => Type::NoneType,
            Expr::Other => Type::Unknown,
            Expr::Name(name) => match name.split_once('.') {
                None if scope.contains_key(name) => scope[name].clone(),
                Some((head, _)) if scope.contains_key(head) => Type::Unknown,
                _ => self.value_type(self.resolve(module, name), depth),
            },
            Expr::Call(callee) => match self.call_target(module, callee, scope, depth) {
                CallTarget::Class(class) => Type::Instance(class.name.clone()),
                CallTarget::Function { symbol, .. } => match &symbol.kind {
                    SymbolKind::Function {
                        returns: Some(returns),
                        ..
                    } => self
                        .annotation(&symbol.module, returns)
                        .unwrap_or(Type::Unknown),
                    _ => Type::Unknown,
                },
                CallTarget::Builtin(name) => match builtin_type(name) {
                    Some(Type::NoneType) | None => Type::Unknown,
                    Some(ty) => ty,
                },
                CallTarget::Unknown => Type::Unknown,
            },
        }
    }

    fn call_target(&self, module: &str, callee: &str, scope: &Scope, depth: usize) -> CallTarget<'a> {
        if let Some((receiver, method)) = callee.split_once('.') {
            if !method.contains('.') {
                let receiver_type = match scope.get(receiver) {
                    Some(ty) => Some(ty.clone()),
                    None => match self.resolve(module, receiver) {
                        Resolved::Symbol(symbol @ Symbol { kind: SymbolKind::Variable { .. }, .. }) => {
                            Some(self.variable_type(symbol, depth + 1))
                        }
                        _ => None,
                    },
                };
                match receiver_type {
                    Some(Type::Instance(class)) => {
                        return self
                            .class_symbol(&class)
                            .and_then(|c| self.class_member(c, method))
                            .filter(|m| matches!(m.kind, SymbolKind::Function { .. }))
                            .map(|symbol| CallTarget::Function {
                                symbol,
                                bound: true,
                            })
                            .unwrap_or(CallTarget::Unknown);
                    }
                    Some(_) => return CallTarget::Unknown,
                    None => {}
                }
            }
        } else if scope.contains_key(callee) {
            return CallTarget::Unknown;
        }

        match self.resolve(module, callee) {
            Resolved::Symbol(symbol) => match &symbol.kind {
                SymbolKind::Class { .. } => CallTarget::Class(symbol),
                SymbolKind::Function { .. } => CallTarget::Function {
                    symbol,
                    bound: false,
                },
                _ => CallTarget::Unknown,
            },
            Resolved::Builtin(name) => CallTarget::Builtin(name),
            _ => CallTarget::Unknown,
        }
    }

    pub fn is_compatible(&self, actual: &Type, expected: &Type) -> bool {
        match (actual, expected) {
            (Type::Unknown, _) | (_, Type::Unknown) | (_, Type::Object) => true,
            (a, e) if a == e => true,
            (Type::Bool, Type::Int) | (Type::Bool, Type::Float) | (Type::Int, Type::Float) => true,
            (Type::Instance(a), Type::Instance(e)) => match self.class_symbol(a) {
                Some(class) => {
                    let (ancestors, open_ended) = self.ancestors(class);
                    open_ended || ancestors.iter().any(|c| &c.name == e)
                }
                None => true,
            },
            _ => false,
        }
    }

    /// Check one module against the environment.
    pub fn check_module(&self, extraction: &ModuleExtraction, strict: bool) -> ModuleReport {
        let mut cx = ModuleContext {
            checker: self,
            extraction,
            strict,
            report: ModuleReport::default(),
        };
        cx.run();

        let mut report = cx.report;
        report.diagnostics.sort();
        report.diagnostics.dedup();
        report.edges.sort();
        report.edges.dedup();
        report
    }
}

struct ModuleContext<'c, 'a> {
    checker: &'c Checker<'a>,
    extraction: &'c ModuleExtraction,
    strict: bool,
    report: ModuleReport,
}

impl<'c, 'a> ModuleContext<'c, 'a> {
    fn module(&self) -> &'c str {
        &self.extraction.module
    }

    fn run(&mut self) {
        let extraction = self.extraction;
        for position in &extraction.syntax_errors {
            self.emit(*position, DiagnosticCode::ParseError, "Parsing failure.".to_string());
        }

        for import in &extraction.imports {
            if !self.checker.env.has_module(&import.module) {
                continue;
            }
            for name in &import.names {
                let target = format!("{}.{}", import.module, name.name);
                if self.checker.env.lookup(&target).is_none() {
                    self.emit(
                        name.position,
                        DiagnosticCode::UndefinedImport,
                        format!("Could not find name `{}` in `{}`.", name.name, import.module),
                    );
                }
            }
        }

        for binding in &extraction.bindings {
            let Some(annotation) = &binding.annotation else {
                continue;
            };
            let Some(expected) = self.annotation(&annotation.text, annotation.position) else {
                continue;
            };
            let actual = self
                .checker
                .expr_type(self.module(), &binding.value, &Scope::new(), 0);
            if !self.checker.is_compatible(&actual, &expected) {
                self.emit(
                    binding.position,
                    DiagnosticCode::IncompatibleVariableType,
                    format!(
                        "`{}.{}` is declared to have type `{expected}` but is used as type `{actual}`.",
                        self.module(),
                        binding.name
                    ),
                );
            }
        }

        let module = self.module().to_string();
        for function in &extraction.functions {
            self.check_function(function, &format!("{module}.{}", function.name), None);
        }

        for class in &extraction.classes {
            self.check_class(class);
        }

        let scope = Scope::new();
        for call in &extraction.calls {
            self.check_call(&module, call, &scope);
        }
    }

    fn check_class(&mut self, class: &ClassDef) {
        let module = self.module();
        let qualified = format!("{module}.{}", class.name);
        for base in &class.bases {
            match self.checker.resolve(module, base) {
                Resolved::Undefined => self.emit(
                    class.position,
                    DiagnosticCode::UndefinedType,
                    format!("Base class `{base}` of `{qualified}` is not defined."),
                ),
                Resolved::Symbol(parent @ Symbol { kind: SymbolKind::Class { .. }, .. }) => {
                    self.edge(&qualified, &parent.name, EdgeKind::Inherits)
                }
                _ => {}
            }
        }

        let owner = self.checker.env.member(module, &class.name);
        let ancestors = owner
            .map(|c| self.checker.ancestors(c).0)
            .unwrap_or_default();
        for method in &class.methods {
            let method_name = format!("{qualified}.{}", method.name);
            self.check_function(method, &method_name, owner);

            let overridden = ancestors.iter().skip(1).find_map(|ancestor| {
                self.checker
                    .env
                    .member(&ancestor.module, &format!("{}.{}", ancestor.local, method.name))
            });
            if let Some(overridden) = overridden {
                self.edge(&method_name, &overridden.name, EdgeKind::Overrides);
            }
        }
    }

    fn check_function(&mut self, function: &FunctionDef, qualified: &str, owner: Option<&'a Symbol>) {
        let mut scope = Scope::new();
        for (i, param) in function.params.iter().enumerate() {
            let ty = match &param.annotation {
                Some(annotation) => self
                    .annotation(&annotation.text, annotation.position)
                    .unwrap_or(Type::Unknown),
                None if i == 0 && owner.is_some() && !param.variadic => {
                    let class = owner.map(|c| c.name.clone()).unwrap_or_default();
                    if param.name == "cls" {
                        Type::ClassObject(class)
                    } else {
                        Type::Instance(class)
                    }
                }
                None => {
                    if self.strict && !param.variadic {
                        self.emit(
                            param.position,
                            DiagnosticCode::MissingAnnotation,
                            format!("Parameter `{}` of `{qualified}` has no type specified.", param.name),
                        );
                    }
                    Type::Unknown
                }
            };
            let ty = if param.variadic { Type::Unknown } else { ty };
            scope.insert(param.name.clone(), ty);
        }

        let declared = match &function.returns {
            Some(annotation) => self
                .annotation(&annotation.text, annotation.position)
                .unwrap_or(Type::Unknown),
            None => {
                if self.strict && function.name != "__init__" {
                    self.emit(
                        function.position,
                        DiagnosticCode::MissingAnnotation,
                        format!("Return type of `{qualified}` is not specified."),
                    );
                }
                Type::Unknown
            }
        };

        if !declared.is_unknown() {
            for returned in &function.return_values {
                let actual = match &returned.value {
                    Some(value) => self.checker.expr_type(self.module(), value, &scope, 0),
                    None => Type::NoneType,
                };
                if !self.checker.is_compatible(&actual, &declared) {
                    self.emit(
                        returned.position,
                        DiagnosticCode::IncompatibleReturnType,
                        format!(
                            "Returned type `{actual}` is not compatible with `{declared}` declared by `{qualified}`."
                        ),
                    );
                }
            }
        }

        for call in &function.calls {
            self.check_call(qualified, call, &scope);
        }
    }

    fn check_call(&mut self, caller: &str, call: &CallSite, scope: &Scope) {
        let module = self.module();
        let (callee, params, skip): (&Symbol, &[ParamSignature], usize) =
            match self.checker.call_target(module, &call.callee, scope, 0) {
                CallTarget::Class(class) => {
                    self.edge(caller, &class.name, EdgeKind::Calls);
                    let Some(init) = self.checker.class_member(class, "__init__") else {
                        return;
                    };
                    let SymbolKind::Function { params, .. } = &init.kind else {
                        return;
                    };
                    (init, params.as_slice(), 1)
                }
                CallTarget::Function { symbol, bound } => {
                    self.edge(caller, &symbol.name, EdgeKind::Calls);
                    let SymbolKind::Function { params, .. } = &symbol.kind else {
                        return;
                    };
                    (symbol, params.as_slice(), usize::from(bound))
                }
                CallTarget::Builtin(_) | CallTarget::Unknown => return,
            };

        let positional = params.iter().skip(skip).take_while(|p| !p.variadic);
        for (i, (argument, param)) in call.arguments.iter().zip(positional).enumerate() {
            let Some(annotation) = &param.annotation else {
                continue;
            };
            let expected = match self.checker.annotation(&callee.module, annotation) {
                Some(ty) if !ty.is_unknown() => ty,
                _ => continue,
            };
            let actual = self.checker.expr_type(module, argument, scope, 0);
            if !self.checker.is_compatible(&actual, &expected) {
                self.emit(
                    call.position,
                    DiagnosticCode::IncompatibleParameterType,
                    format!(
                        "In call `{}`, for {} positional argument, expected `{expected}` but got `{actual}`.",
                        callee.name,
                        ordinal(i + 1)
                    ),
                );
            }
        }
    }

    /// Resolve an annotation written in this module, reporting it if it
    /// names nothing.
    fn annotation(&mut self, text: &str, position: Position) -> Option<Type> {
        let resolved = self.checker.annotation(self.module(), text);
        if resolved.is_none() {
            self.emit(
                position,
                DiagnosticCode::UndefinedType,
                format!("Annotation `{text}` is not defined as a type."),
            );
        }
        resolved
    }

    fn emit(&mut self, position: Position, code: DiagnosticCode, message: String) {
        self.report.diagnostics.push(Diagnostic {
            path: self.extraction.path.clone(),
            line: position.line,
            column: position.column,
            code,
            message,
        });
    }

    fn edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        self.report
            .edges
            .push((from.to_string(), to.to_string(), kind));
    }
}

fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}
