//! Diagnostics and types reported by the analyzer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    ParseError,
    MissingAnnotation,
    IncompatibleParameterType,
    IncompatibleReturnType,
    IncompatibleVariableType,
    UndefinedType,
    UndefinedImport,
    AnalyzerInternalError,
}

impl DiagnosticCode {
    /// Stable numeric code shown to users.
    pub fn number(self) -> u16 {
        match self {
            DiagnosticCode::AnalyzerInternalError => 0,
            DiagnosticCode::MissingAnnotation => 2,
            DiagnosticCode::IncompatibleParameterType => 6,
            DiagnosticCode::IncompatibleReturnType => 7,
            DiagnosticCode::IncompatibleVariableType => 9,
            DiagnosticCode::UndefinedType => 11,
            DiagnosticCode::UndefinedImport => 21,
            DiagnosticCode::ParseError => 404,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            DiagnosticCode::ParseError => "Parsing failure",
            DiagnosticCode::MissingAnnotation => "Missing annotation",
            DiagnosticCode::IncompatibleParameterType => "Incompatible parameter type",
            DiagnosticCode::IncompatibleReturnType => "Incompatible return type",
            DiagnosticCode::IncompatibleVariableType => "Incompatible variable type",
            DiagnosticCode::UndefinedType => "Undefined or invalid type",
            DiagnosticCode::UndefinedImport => "Undefined import",
            DiagnosticCode::AnalyzerInternalError => "Analyzer internal error",
        }
    }
}

/// One finding, anchored to a file position (1-based).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub line: usize,
    pub column: usize,
    pub code: DiagnosticCode,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} {} [{}]: {}",
            self.path.display(),
            self.line,
            self.column,
            self.code.title(),
            self.code.number(),
            self.message
        )
    }
}

/// Static type of an expression, as far as the analyzer can tell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Float,
    Str,
    Bytes,
    Bool,
    NoneType,
    Object,
    /// Instance of a project class, by qualified name.
    Instance(String),
    /// The class object itself.
    ClassObject(String),
    Callable(String),
    Module(String),
    Unknown,
}

impl Type {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Type::Unknown)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "str"),
            Type::Bytes => write!(f, "bytes"),
            Type::Bool => write!(f, "bool"),
            Type::NoneType => write!(f, "None"),
            Type::Object => write!(f, "object"),
            Type::Instance(name) => write!(f, "{name}"),
            Type::ClassObject(name) => write!(f, "type[{name}]"),
            Type::Callable(name) => write!(f, "callable[{name}]"),
            Type::Module(name) => write!(f, "module[{name}]"),
            Type::Unknown => write!(f, "unknown"),
        }
    }
}

/// Answer to a type query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub expression: String,
    /// Rendered type (`pkg.mod.C`, `int`, `type[pkg.mod.C]`, ...).
    pub type_name: String,
    pub path: Option<PathBuf>,
    pub line: Option<usize>,
}

/// What a recheck touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecheckSummary {
    /// Files parsed again.
    pub reparsed: usize,
    /// Files dropped because they are gone or no longer analyzed.
    pub removed: usize,
    /// Files whose analysis failed.
    pub failed: usize,
    /// Modules whose diagnostics were recomputed.
    pub rechecked_modules: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic {
            path: PathBuf::from("a.py"),
            line: 7,
            column: 5,
            code: DiagnosticCode::IncompatibleReturnType,
            message: "Expected `a.C` but got `a.D`.".to_string(),
        };
        assert_eq!(
            d.to_string(),
            "a.py:7:5 Incompatible return type [7]: Expected `a.C` but got `a.D`."
        );
    }

    #[test]
    fn test_code_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&DiagnosticCode::UndefinedImport).unwrap(),
            "\"undefined_import\""
        );
    }

    #[test]
    fn test_type_display() {
        assert_eq!(Type::Instance("a.C".into()).to_string(), "a.C");
        assert_eq!(Type::ClassObject("a.C".into()).to_string(), "type[a.C]");
        assert_eq!(Type::NoneType.to_string(), "None");
    }
}
