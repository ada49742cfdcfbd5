//! Python extraction from tree-sitter ASTs.
//!
//! Walks one module and records:
//! - class and function definitions with their annotations
//! - module-level bindings, `import ...` and `from ... import ...` statements
//! - return values and call sites (for checking and call graphs)
//! - syntax errors reported by tree-sitter

use std::path::Path;
use tree_sitter::{Node, Parser};

use super::types::*;
use crate::error::{CheckdError, Result};

/// Syntax errors beyond this many are not recorded.
const MAX_SYNTAX_ERRORS: usize = 16;

/// Parse `source` and extract everything the checker needs.
///
/// Returns an error only if the parser cannot be initialized or
/// tree-sitter returns no tree; malformed Python still extracts, with
/// [`ModuleExtraction::syntax_errors`] populated.
pub fn extract_module(path: &Path, module: &str, source: &str) -> Result<ModuleExtraction> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| CheckdError::ParserInit(path.to_path_buf(), e.to_string()))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| CheckdError::TreeSitterParseFailed(path.to_path_buf()))?;
    let root = tree.root_node();
    let src = source.as_bytes();

    let mut extraction = ModuleExtraction {
        path: path.to_path_buf(),
        module: module.to_string(),
        content_hash: blake3::hash(src).to_hex().to_string(),
        classes: Vec::new(),
        functions: Vec::new(),
        bindings: Vec::new(),
        imports: Vec::new(),
        module_imports: Vec::new(),
        calls: Vec::new(),
        syntax_errors: Vec::new(),
    };

    let mut cursor = root.walk();
    for statement in root.named_children(&mut cursor) {
        extract_statement(&statement, src, &mut extraction);
    }

    if root.has_error() {
        collect_syntax_errors(&root, &mut extraction.syntax_errors);
    }

    Ok(extraction)
}

fn extract_statement(node: &Node, src: &[u8], out: &mut ModuleExtraction) {
    match node.kind() {
        "class_definition" => {
            if let Some(class) = extract_class(node, src) {
                out.classes.push(class);
            }
        }
        "function_definition" => {
            if let Some(function) = extract_function(node, src) {
                out.functions.push(function);
            }
        }
        "decorated_definition" => {
            if let Some(definition) = node.child_by_field_name("definition") {
                extract_statement(&definition, src, out);
            }
        }
        "import_statement" => extract_import(node, src, &mut out.module_imports),
        "import_from_statement" => {
            if let Some(import) = extract_import_from(node, src) {
                out.imports.push(import);
            }
        }
        "expression_statement" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "assignment" {
                    if let Some(binding) = extract_binding(&child, src) {
                        out.bindings.push(binding);
                    }
                }
            }
            collect_body(node, src, &mut out.calls, &mut Vec::new());
        }
        _ => collect_body(node, src, &mut out.calls, &mut Vec::new()),
    }
}

fn extract_class(node: &Node, src: &[u8]) -> Option<ClassDef> {
    let name = field_text(node, "name", src)?;

    let mut bases = Vec::new();
    if let Some(superclasses) = node.child_by_field_name("superclasses") {
        let mut cursor = superclasses.walk();
        for base in superclasses.named_children(&mut cursor) {
            if let Some(dotted) = dotted_name(&base, src) {
                bases.push(dotted);
            }
        }
    }

    let mut methods = Vec::new();
    if let Some(body) = node.child_by_field_name("body") {
        let mut cursor = body.walk();
        for member in body.named_children(&mut cursor) {
            let definition = match member.kind() {
                "decorated_definition" => member.child_by_field_name("definition"),
                _ => Some(member),
            };
            if let Some(def) = definition.filter(|d| d.kind() == "function_definition") {
                if let Some(method) = extract_function(&def, src) {
                    methods.push(method);
                }
            }
        }
    }

    Some(ClassDef {
        name,
        bases,
        methods,
        position: position(node),
    })
}

fn extract_function(node: &Node, src: &[u8]) -> Option<FunctionDef> {
    let name = field_text(node, "name", src)?;

    let params = node
        .child_by_field_name("parameters")
        .map(|p| extract_params(&p, src))
        .unwrap_or_default();

    let returns = node.child_by_field_name("return_type").map(|t| Annotation {
        text: text(&t, src).trim().to_string(),
        position: position(&t),
    });

    let mut calls = Vec::new();
    let mut return_values = Vec::new();
    if let Some(body) = node.child_by_field_name("body") {
        collect_body(&body, src, &mut calls, &mut return_values);
    }

    Some(FunctionDef {
        name,
        params,
        returns,
        return_values,
        calls,
        position: position(node),
    })
}

fn extract_params(node: &Node, src: &[u8]) -> Vec<Param> {
    let mut params = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        let annotation = child.child_by_field_name("type").map(|t| Annotation {
            text: text(&t, src).trim().to_string(),
            position: position(&t),
        });
        let param = match child.kind() {
            "identifier" => Some((text(&child, src).to_string(), false)),
            "default_parameter" | "typed_default_parameter" => {
                field_text(&child, "name", src).map(|n| (n, false))
            }
            "typed_parameter" => first_named_child(&child).and_then(|inner| match inner.kind() {
                "identifier" => Some((text(&inner, src).to_string(), false)),
                "list_splat_pattern" | "dictionary_splat_pattern" => {
                    first_named_child(&inner).map(|n| (text(&n, src).to_string(), true))
                }
                _ => None,
            }),
            "list_splat_pattern" | "dictionary_splat_pattern" => {
                first_named_child(&child).map(|n| (text(&n, src).to_string(), true))
            }
            _ => None,
        };
        if let Some((name, variadic)) = param {
            params.push(Param {
                name,
                annotation,
                variadic,
                position: position(&child),
            });
        }
    }
    params
}

fn extract_binding(node: &Node, src: &[u8]) -> Option<Binding> {
    let left = node.child_by_field_name("left")?;
    if left.kind() != "identifier" {
        return None;
    }
    let value = node
        .child_by_field_name("right")
        .map(|r| expression(&r, src))
        .unwrap_or(Expr::Other);
    let annotation = node.child_by_field_name("type").map(|t| Annotation {
        text: text(&t, src).trim().to_string(),
        position: position(&t),
    });
    Some(Binding {
        name: text(&left, src).to_string(),
        value,
        annotation,
        position: position(node),
    })
}

fn extract_import_from(node: &Node, src: &[u8]) -> Option<ImportFrom> {
    let module_node = node.child_by_field_name("module_name")?;
    // Relative imports are resolved by the interpreter at runtime; skip them.
    if module_node.kind() != "dotted_name" {
        return None;
    }
    let module = text(&module_node, src).to_string();

    let mut names = Vec::new();
    let mut cursor = node.walk();
    for name_node in node.children_by_field_name("name", &mut cursor) {
        let imported = match name_node.kind() {
            "aliased_import" => field_text(&name_node, "name", src).map(|name| ImportedName {
                name,
                alias: field_text(&name_node, "alias", src),
                position: position(&name_node),
            }),
            _ => Some(ImportedName {
                name: text(&name_node, src).to_string(),
                alias: None,
                position: position(&name_node),
            }),
        };
        names.extend(imported);
    }

    Some(ImportFrom {
        module,
        names,
        position: position(node),
    })
}

fn extract_import(node: &Node, src: &[u8], out: &mut Vec<Import>) {
    let mut cursor = node.walk();
    for name_node in node.children_by_field_name("name", &mut cursor) {
        let import = match name_node.kind() {
            "aliased_import" => field_text(&name_node, "name", src).map(|module| Import {
                module,
                alias: field_text(&name_node, "alias", src),
                position: position(&name_node),
            }),
            "dotted_name" => Some(Import {
                module: text(&name_node, src).to_string(),
                alias: None,
                position: position(&name_node),
            }),
            _ => None,
        };
        out.extend(import);
    }
}

/// Collect calls and return statements under `node`, without descending
/// into nested definitions.
fn collect_body(
    node: &Node,
    src: &[u8],
    calls: &mut Vec<CallSite>,
    returns: &mut Vec<ReturnValue>,
) {
    match node.kind() {
        "function_definition" | "class_definition" | "lambda" | "decorated_definition" => return,
        "call" => {
            if let Some(call) = extract_call(node, src) {
                calls.push(call);
            }
        }
        "return_statement" => returns.push(ReturnValue {
            value: first_named_child(node).map(|e| expression(&e, src)),
            position: position(node),
        }),
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_body(&child, src, calls, returns);
    }
}

fn extract_call(node: &Node, src: &[u8]) -> Option<CallSite> {
    let callee = dotted_name(&node.child_by_field_name("function")?, src)?;

    let mut arguments = Vec::new();
    let mut keyword_arguments = 0;
    if let Some(args) = node.child_by_field_name("arguments") {
        if args.kind() == "argument_list" {
            let mut cursor = args.walk();
            for arg in args.named_children(&mut cursor) {
                match arg.kind() {
                    "keyword_argument" | "dictionary_splat" => keyword_arguments += 1,
                    // A splat hides the argument count.
                    "list_splat" => return None,
                    _ => arguments.push(expression(&arg, src)),
                }
            }
        }
    }

    Some(CallSite {
        callee,
        arguments,
        keyword_arguments,
        position: position(node),
    })
}

fn expression(node: &Node, src: &[u8]) -> Expr {
    match node.kind() {
        "call" => node
            .child_by_field_name("function")
            .and_then(|f| dotted_name(&f, src))
            .map(Expr::Call)
            .unwrap_or(Expr::Other),
        "identifier" | "attribute" => dotted_name(node, src).map(Expr::Name).unwrap_or(Expr::Other),
        "integer" => Expr::Int,
        "float" => Expr::Float,
        "string" | "concatenated_string" => {
            let prefix: String = text(node, src)
                .chars()
                .take_while(|c| c.is_ascii_alphabetic())
                .collect();
            if prefix.to_ascii_lowercase().contains('b') {
                Expr::Bytes
            } else {
                Expr::Str
            }
        }
        "true" | "false" => Expr::Bool,
        "none" => Expr::NoneLiteral,
        "parenthesized_expression" => first_named_child(node)
            .map(|inner| expression(&inner, src))
            .unwrap_or(Expr::Other),
        _ => Expr::Other,
    }
}

/// `a`, `a.b.c`; `None` for anything that is not a plain dotted path.
fn dotted_name(node: &Node, src: &[u8]) -> Option<String> {
    match node.kind() {
        "identifier" => Some(text(node, src).to_string()),
        "attribute" => {
            let object = dotted_name(&node.child_by_field_name("object")?, src)?;
            let attribute = field_text(node, "attribute", src)?;
            Some(format!("{object}.{attribute}"))
        }
        _ => None,
    }
}

fn collect_syntax_errors(node: &Node, errors: &mut Vec<Position>) {
    if errors.len() >= MAX_SYNTAX_ERRORS {
        return;
    }
    if node.is_error() || node.is_missing() {
        errors.push(position(node));
        return;
    }
    if !node.has_error() {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_syntax_errors(&child, errors);
    }
}

fn first_named_child<'t>(node: &Node<'t>) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let first = node.named_children(&mut cursor).next();
    first
}

fn position(node: &Node) -> Position {
    let point = node.start_position();
    Position {
        line: point.row + 1,
        column: point.column + 1,
    }
}

fn field_text(node: &Node, field: &str, src: &[u8]) -> Option<String> {
    node.child_by_field_name(field)
        .and_then(|n| n.utf8_text(src).ok())
        .map(|s| s.to_string())
}

fn text<'a>(node: &Node, src: &'a [u8]) -> &'a str {
    node.utf8_text(src).unwrap_or("")
}
