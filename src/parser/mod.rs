//! Python source parsing.
//!
//! Turns one source file into a [`ModuleExtraction`]: the definitions,
//! annotations, imports and call sites the checker works from.

pub mod extractor;
pub mod types;

pub use extractor::extract_module;
pub use types::{
    Annotation, Binding, CallSite, ClassDef, Expr, FunctionDef, ImportFrom, ImportedName,
    ModuleExtraction, Param, Position, ReturnValue,
};
