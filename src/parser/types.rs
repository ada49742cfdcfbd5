//! Per-file extraction results.
//!
//! A [`ModuleExtraction`] is everything the checker needs to know about one
//! source file, so the source table can be persisted and rechecked without
//! re-reading files that did not change. These types go through bincode in
//! saved state: no `skip_serializing_if`, no untagged enums.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 1-based line and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleExtraction {
    pub path: PathBuf,
    /// Dotted module name (`pkg.mod`).
    pub module: String,
    /// blake3 of the file contents.
    pub content_hash: String,
    pub classes: Vec<ClassDef>,
    pub functions: Vec<FunctionDef>,
    /// Module-level assignments.
    pub bindings: Vec<Binding>,
    pub imports: Vec<ImportFrom>,
    pub module_imports: Vec<Import>,
    /// Calls made at module level.
    pub calls: Vec<CallSite>,
    /// Locations of tree-sitter ERROR / MISSING nodes.
    pub syntax_errors: Vec<Position>,
}

impl ModuleExtraction {
    /// Modules whose contents can influence how this module checks.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = Vec::new();
        for import in &self.imports {
            deps.push(import.module.clone());
            for name in &import.names {
                deps.push(format!("{}.{}", import.module, name.name));
            }
        }
        for import in &self.module_imports {
            deps.push(import.module.clone());
            deps.push(import.target().to_string());
        }
        deps.sort();
        deps.dedup();
        deps
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    /// Base expressions as written (`Base`, `mod.Base`).
    pub bases: Vec<String>,
    pub methods: Vec<FunctionDef>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: Option<Annotation>,
    pub return_values: Vec<ReturnValue>,
    pub calls: Vec<CallSite>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub annotation: Option<Annotation>,
    /// `*args` / `**kwargs`.
    pub variadic: bool,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub text: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnValue {
    /// `None` for a bare `return`.
    pub value: Option<Expr>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Dotted callee as written (`foo`, `self.helper`, `C.build`).
    pub callee: String,
    pub arguments: Vec<Expr>,
    /// Number of keyword arguments; positional checks stop being exact when
    /// these are present.
    pub keyword_arguments: usize,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub value: Expr,
    pub annotation: Option<Annotation>,
    pub position: Position,
}

/// `from module import a, b as c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFrom {
    pub module: String,
    pub names: Vec<ImportedName>,
    pub position: Position,
}

/// `import a.b` or `import a.b as c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    pub alias: Option<String>,
    pub position: Position,
}

impl Import {
    /// Name bound in the importing module: the alias, or the first
    /// segment of the dotted path.
    pub fn local_name(&self) -> &str {
        self.alias.as_deref().unwrap_or_else(|| self.head())
    }

    /// Module the local name refers to.
    pub fn target(&self) -> &str {
        match self.alias {
            Some(_) => &self.module,
            None => self.head(),
        }
    }

    fn head(&self) -> &str {
        self.module.split('.').next().unwrap_or(&self.module)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedName {
    pub name: String,
    pub alias: Option<String>,
    pub position: Position,
}

impl ImportedName {
    /// Name this import binds in the importing module.
    pub fn local_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// The slice of Python expressions the checker reasons about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    /// `callee(...)`, callee dotted as written.
    Call(String),
    /// A (possibly dotted) name.
    Name(String),
    Int,
    Float,
    Str,
    Bytes,
    Bool,
    NoneLiteral,
    Other,
}
