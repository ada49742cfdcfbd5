//! Global symbol table.
//!
//! Symbols are grouped per module, so a module's contribution can be
//! replaced as a unit during rechecks. Qualified names are resolved by
//! trying the longest module prefix first; a member of a package wins over
//! a submodule of the same name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::parser::{Expr, FunctionDef, ModuleExtraction, Position};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    modules: BTreeMap<String, ModuleSymbols>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSymbols {
    pub path: PathBuf,
    /// Keyed by name relative to the module (`C`, `C.method`, `x`).
    pub members: BTreeMap<String, Symbol>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Fully qualified name.
    pub name: String,
    /// Name relative to `module`.
    pub local: String,
    pub module: String,
    pub kind: SymbolKind,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Class {
        bases: Vec<String>,
        methods: Vec<String>,
    },
    Function {
        params: Vec<ParamSignature>,
        returns: Option<String>,
        is_method: bool,
    },
    Variable {
        value: Expr,
        annotation: Option<String>,
    },
    /// Name bound by `import module` or `from module import name`;
    /// `target` is qualified.
    Alias { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSignature {
    pub name: String,
    pub annotation: Option<String>,
    pub variadic: bool,
}

/// Result of looking up a qualified name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<'a> {
    Module(&'a str),
    Symbol(&'a Symbol),
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything `extraction.module` contributes.
    pub fn insert_module(&mut self, extraction: &ModuleExtraction) {
        let module = extraction.module.as_str();
        let mut members = BTreeMap::new();
        let mut add = |local: String, kind: SymbolKind, position: Position| {
            members.insert(
                local.clone(),
                Symbol {
                    name: format!("{module}.{local}"),
                    local,
                    module: module.to_string(),
                    kind,
                    position,
                },
            );
        };

        for import in &extraction.imports {
            for name in &import.names {
                add(
                    name.local_name().to_string(),
                    SymbolKind::Alias {
                        target: format!("{}.{}", import.module, name.name),
                    },
                    name.position,
                );
            }
        }
        for import in &extraction.module_imports {
            add(
                import.local_name().to_string(),
                SymbolKind::Alias {
                    target: import.target().to_string(),
                },
                import.position,
            );
        }
        for binding in &extraction.bindings {
            add(
                binding.name.clone(),
                SymbolKind::Variable {
                    value: binding.value.clone(),
                    annotation: binding.annotation.as_ref().map(|a| a.text.clone()),
                },
                binding.position,
            );
        }
        for function in &extraction.functions {
            add(function.name.clone(), function_kind(function, false), function.position);
        }
        for class in &extraction.classes {
            add(
                class.name.clone(),
                SymbolKind::Class {
                    bases: class.bases.clone(),
                    methods: class.methods.iter().map(|m| m.name.clone()).collect(),
                },
                class.position,
            );
            for method in &class.methods {
                add(
                    format!("{}.{}", class.name, method.name),
                    function_kind(method, true),
                    method.position,
                );
            }
        }

        self.modules.insert(
            extraction.module.clone(),
            ModuleSymbols {
                path: extraction.path.clone(),
                members,
            },
        );
    }

    pub fn remove_module(&mut self, module: &str) {
        self.modules.remove(module);
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    pub fn module_path(&self, module: &str) -> Option<&Path> {
        self.modules.get(module).map(|m| m.path.as_path())
    }

    pub fn member(&self, module: &str, local: &str) -> Option<&Symbol> {
        self.modules.get(module)?.members.get(local)
    }

    /// Look up a fully qualified name.
    pub fn lookup(&self, qualified: &str) -> Option<Entry<'_>> {
        for (i, _) in qualified.rmatch_indices('.') {
            let (module, rest) = (&qualified[..i], &qualified[i + 1..]);
            if let Some(symbol) = self.member(module, rest) {
                return Some(Entry::Symbol(symbol));
            }
        }
        self.modules
            .get_key_value(qualified)
            .map(|(name, _)| Entry::Module(name.as_str()))
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.modules.values().map(|m| m.members.len()).sum()
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

fn function_kind(function: &FunctionDef, is_method: bool) -> SymbolKind {
    SymbolKind::Function {
        params: function
            .params
            .iter()
            .map(|p| ParamSignature {
                name: p.name.clone(),
                annotation: p.annotation.as_ref().map(|a| a.text.clone()),
                variadic: p.variadic,
            })
            .collect(),
        returns: function.returns.as_ref().map(|a| a.text.clone()),
        is_method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::extract_module;

    fn env_of(files: &[(&str, &str)]) -> Environment {
        let mut env = Environment::new();
        for (module, source) in files {
            let path = PathBuf::from(format!("/p/{}.py", module.replace('.', "/")));
            env.insert_module(&extract_module(&path, module, source).unwrap());
        }
        env
    }

    #[test]
    fn test_members_are_qualified() {
        let env = env_of(&[(
            "a",
            "class C:\n    def m(self) -> int:\n        return 1\n\ndef f(x: int) -> C:\n    return C()\n\nx = C()\n",
        )]);
        let Some(Entry::Symbol(method)) = env.lookup("a.C.m") else {
            panic!("a.C.m missing");
        };
        assert_eq!(method.module, "a");
        assert_eq!(method.local, "C.m");
        assert!(matches!(method.kind, SymbolKind::Function { is_method: true, .. }));
        assert!(matches!(
            env.lookup("a.x"),
            Some(Entry::Symbol(Symbol { kind: SymbolKind::Variable { .. }, .. }))
        ));
        assert_eq!(env.lookup("a"), Some(Entry::Module("a")));
        assert_eq!(env.lookup("a.missing"), None);
    }

    #[test]
    fn test_imports_become_aliases() {
        let env = env_of(&[("b", "from a import C as K\n")]);
        let Some(Entry::Symbol(alias)) = env.lookup("b.K") else {
            panic!("b.K missing");
        };
        assert_eq!(
            alias.kind,
            SymbolKind::Alias {
                target: "a.C".to_string()
            }
        );
    }

    #[test]
    fn test_module_imports_become_aliases() {
        let env = env_of(&[("b", "import a.c\nimport a.c as ac\n")]);
        let Some(Entry::Symbol(head)) = env.lookup("b.a") else {
            panic!("b.a missing");
        };
        assert_eq!(head.kind, SymbolKind::Alias { target: "a".into() });
        let Some(Entry::Symbol(aliased)) = env.lookup("b.ac") else {
            panic!("b.ac missing");
        };
        assert_eq!(aliased.kind, SymbolKind::Alias { target: "a.c".into() });
    }

    #[test]
    fn test_package_member_shadows_submodule() {
        let env = env_of(&[("pkg", "b = 1\n"), ("pkg.b", "y = 2\n")]);
        assert!(matches!(env.lookup("pkg.b"), Some(Entry::Symbol(_))));
        assert!(matches!(env.lookup("pkg.b.y"), Some(Entry::Symbol(_))));
    }

    #[test]
    fn test_remove_module_is_independent_of_others() {
        let mut env = env_of(&[("pkg", "b = 1\n"), ("pkg.b", "y = 2\n")]);
        env.remove_module("pkg");
        assert_eq!(env.lookup("pkg.b"), Some(Entry::Module("pkg.b")));
        assert_eq!(env.module_count(), 1);
    }
}
